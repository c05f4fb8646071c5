#[cfg(target_arch = "wasm32")]
fn main() {}

#[cfg(not(target_arch = "wasm32"))]
use std::time::Duration;

#[cfg(not(target_arch = "wasm32"))]
use criterion::{black_box, criterion_group, criterion_main, Criterion, Throughput};
#[cfg(not(target_arch = "wasm32"))]
use std::convert::TryInto;
#[cfg(not(target_arch = "wasm32"))]
use vie_mmu::{AccessType, MemoryBus, PagingSource, PagingStateSnapshot, VirtualMmu};

// Paging bits (subset; repeated here so benches don't rely on crate privates).
#[cfg(not(target_arch = "wasm32"))]
const PTE_FLAGS: u64 = 0b111;
#[cfg(not(target_arch = "wasm32"))]
const CR0_PG: u64 = 1 << 31;
#[cfg(not(target_arch = "wasm32"))]
const CR4_PAE: u64 = 1 << 5;
#[cfg(not(target_arch = "wasm32"))]
const EFER_LMA: u64 = 1 << 10;

#[cfg(not(target_arch = "wasm32"))]
fn criterion_config() -> Criterion {
    match std::env::var("VIE_BENCH_PROFILE").as_deref() {
        Ok("ci") => Criterion::default()
            .warm_up_time(Duration::from_millis(200))
            .measurement_time(Duration::from_secs(1))
            .sample_size(10)
            .noise_threshold(0.05),
        _ => Criterion::default()
            .warm_up_time(Duration::from_secs(1))
            .measurement_time(Duration::from_secs(2))
            .sample_size(30)
            .noise_threshold(0.03),
    }
}

#[cfg(not(target_arch = "wasm32"))]
struct BenchVcpu {
    data: Vec<u8>,
    state: PagingStateSnapshot,
}

#[cfg(not(target_arch = "wasm32"))]
impl BenchVcpu {
    /// Long mode with linear pages 0..512 mapped 1:1 through one page table.
    fn long_mode() -> Self {
        let mut vcpu = Self {
            data: vec![0; 0x10_000],
            state: PagingStateSnapshot {
                cr0: CR0_PG,
                cr3: 0x1000,
                cr4: CR4_PAE,
                efer: EFER_LMA,
                ..PagingStateSnapshot::default()
            },
        };
        vcpu.write_u64(0x1000, 0x2000 | PTE_FLAGS);
        vcpu.write_u64(0x2000, 0x3000 | PTE_FLAGS);
        vcpu.write_u64(0x3000, 0x4000 | PTE_FLAGS);
        for page in 0..512u64 {
            vcpu.write_u64(0x4000 + page * 8, (page << 12) | PTE_FLAGS);
        }
        vcpu
    }
}

#[cfg(not(target_arch = "wasm32"))]
impl MemoryBus for BenchVcpu {
    #[inline]
    fn read_u8(&mut self, paddr: u64) -> u8 {
        self.data[paddr as usize]
    }

    #[inline]
    fn read_u16(&mut self, paddr: u64) -> u16 {
        let off = paddr as usize;
        u16::from_le_bytes(self.data[off..off + 2].try_into().unwrap())
    }

    #[inline]
    fn read_u32(&mut self, paddr: u64) -> u32 {
        let off = paddr as usize;
        u32::from_le_bytes(self.data[off..off + 4].try_into().unwrap())
    }

    #[inline]
    fn read_u64(&mut self, paddr: u64) -> u64 {
        let off = paddr as usize;
        u64::from_le_bytes(self.data[off..off + 8].try_into().unwrap())
    }

    #[inline]
    fn write_u8(&mut self, paddr: u64, value: u8) {
        self.data[paddr as usize] = value;
    }

    #[inline]
    fn write_u16(&mut self, paddr: u64, value: u16) {
        let off = paddr as usize;
        self.data[off..off + 2].copy_from_slice(&value.to_le_bytes());
    }

    #[inline]
    fn write_u32(&mut self, paddr: u64, value: u32) {
        let off = paddr as usize;
        self.data[off..off + 4].copy_from_slice(&value.to_le_bytes());
    }

    #[inline]
    fn write_u64(&mut self, paddr: u64, value: u64) {
        let off = paddr as usize;
        self.data[off..off + 8].copy_from_slice(&value.to_le_bytes());
    }
}

#[cfg(not(target_arch = "wasm32"))]
impl PagingSource for BenchVcpu {
    fn paging_state(&self) -> PagingStateSnapshot {
        self.state
    }
}

#[cfg(not(target_arch = "wasm32"))]
fn bench_translate_hit(c: &mut Criterion) {
    let mut vcpu = BenchVcpu::long_mode();
    let mut mmu = VirtualMmu::new();
    mmu.translate_linear(&mut vcpu, 0x5000, false, 0, AccessType::Read, None);

    let mut group = c.benchmark_group("tlb");
    group.throughput(Throughput::Elements(1));
    group.bench_function("hit_long4_4k", |b| {
        b.iter(|| {
            black_box(mmu.translate_linear(
                &mut vcpu,
                black_box(0x5123),
                false,
                0,
                AccessType::Read,
                None,
            ))
        })
    });
    group.finish();
}

#[cfg(not(target_arch = "wasm32"))]
fn bench_translate_walk(c: &mut Criterion) {
    let mut vcpu = BenchVcpu::long_mode();
    let mut mmu = VirtualMmu::new();
    let mut page = 0u64;

    let mut group = c.benchmark_group("tlb");
    group.throughput(Throughput::Elements(1));
    // Striding over more pages than the cache holds keeps every lookup a miss.
    group.bench_function("miss_long4_4k", |b| {
        b.iter(|| {
            page = (page + 1) % 512;
            black_box(mmu.translate_linear(
                &mut vcpu,
                black_box(page << 12),
                false,
                0,
                AccessType::Read,
                None,
            ))
        })
    });
    group.finish();
}

#[cfg(not(target_arch = "wasm32"))]
criterion_group! {
    name = benches;
    config = criterion_config();
    targets = bench_translate_hit, bench_translate_walk
}
#[cfg(not(target_arch = "wasm32"))]
criterion_main!(benches);
