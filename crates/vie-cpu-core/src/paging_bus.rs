//! Guarded guest memory access.
//!
//! Every access is translated page by page before any byte moves, so a fault
//! on the second page of a crossing access leaves guest memory and the
//! caller's buffer untouched.

use vie_mmu::{AccessType, MemoryBus, TranslationResult, VirtualMmu};
use vie_x86::{AddressSize, CpuMode, SegmentReg};

use crate::error::{AccessError, Fault};
use crate::vcpu::VCpu;

pub const PAGE_SIZE: u64 = 4096;

/// Largest single access (an XMM-sized operand).
pub const MAX_ACCESS_SIZE: usize = 16;

#[inline]
fn is_supported_size(len: usize) -> bool {
    matches!(len, 1 | 2 | 4 | 8 | 16)
}

/// A physical chunk of a translated access.
#[derive(Debug, Clone, Copy, Default)]
struct Chunk {
    paddr: u64,
    len: usize,
}

/// A vCPU and its MMU, borrowed for the duration of one instruction.
pub struct PagingBus<'a, V: VCpu> {
    cpu: &'a mut V,
    mmu: &'a mut VirtualMmu,
}

impl<'a, V: VCpu> PagingBus<'a, V> {
    pub fn new(cpu: &'a mut V, mmu: &'a mut VirtualMmu) -> Self {
        Self { cpu, mmu }
    }

    #[inline]
    pub fn cpu(&self) -> &V {
        &*self.cpu
    }

    #[inline]
    pub fn cpu_mut(&mut self) -> &mut V {
        &mut *self.cpu
    }

    #[inline]
    pub fn mmu_mut(&mut self) -> &mut VirtualMmu {
        &mut *self.mmu
    }

    /// Access `buffer.len()` bytes at `linear`.
    ///
    /// For writes `buffer` is the source; for reads and execute fetches it is
    /// filled in. On error neither guest memory nor `buffer` has changed.
    pub fn access(
        &mut self,
        linear: u64,
        buffer: &mut [u8],
        cpl: u8,
        implicit_supervisor: bool,
        cr3_override: Option<u64>,
        access: AccessType,
    ) -> Result<(), AccessError> {
        let len = buffer.len();
        if !is_supported_size(len) {
            return Err(AccessError::UnsupportedSize(len));
        }
        if linear.checked_add(len as u64 - 1).is_none() {
            return Err(AccessError::AddressOverflow { linear, len });
        }

        let mut chunks = [Chunk::default(); 2];
        let mut count = 0;
        let mut addr = linear;
        let mut remaining = len;
        while remaining != 0 {
            let page_off = (addr & (PAGE_SIZE - 1)) as usize;
            let chunk_len = remaining.min(PAGE_SIZE as usize - page_off);
            let paddr = self.translate(addr, cpl, implicit_supervisor, cr3_override, access)?;
            chunks[count] = Chunk {
                paddr,
                len: chunk_len,
            };
            count += 1;
            addr += chunk_len as u64;
            remaining -= chunk_len;
        }

        let mut off = 0usize;
        for chunk in &chunks[..count] {
            let part = &mut buffer[off..off + chunk.len];
            if access.is_write() {
                self.cpu.write_bytes(chunk.paddr, part);
            } else {
                self.cpu.read_bytes(chunk.paddr, part);
            }
            off += chunk.len;
        }
        Ok(())
    }

    fn translate(
        &mut self,
        linear: u64,
        cpl: u8,
        implicit_supervisor: bool,
        cr3_override: Option<u64>,
        access: AccessType,
    ) -> Result<u64, AccessError> {
        match self.mmu.translate_linear(
            &mut *self.cpu,
            linear,
            implicit_supervisor,
            cpl,
            access,
            cr3_override,
        ) {
            TranslationResult::Physical(paddr) => Ok(paddr),
            TranslationResult::Fault { vector, error_code } => {
                let fault = if vector == vie_mmu::PF_VECTOR {
                    Fault::page_fault(linear, error_code)
                } else {
                    Fault::new(vector, Some(error_code))
                };
                Err(AccessError::Translation { linear, fault })
            }
        }
    }

    /// Linear address of `seg:offset`.
    ///
    /// In 64-bit mode only FS and GS contribute a base. Outside 64-bit mode the
    /// result wraps at 4 GiB.
    pub fn linear_address(&self, seg: SegmentReg, offset: u64, address_size: AddressSize) -> u64 {
        let offset = offset & address_size.mask();
        let mode = self.cpu.mode();
        let base = match (mode, seg) {
            (CpuMode::Bit64, SegmentReg::Fs | SegmentReg::Gs) => self.cpu.segment(seg).base,
            (CpuMode::Bit64, _) => 0,
            _ => self.cpu.segment(seg).base,
        };
        let linear = base.wrapping_add(offset);
        match mode {
            CpuMode::Bit64 => linear,
            _ => linear & 0xffff_ffff,
        }
    }

    /// Read `buffer.len()` bytes at `seg:offset` at the vCPU's current CPL.
    pub fn read_logical(
        &mut self,
        seg: SegmentReg,
        offset: u64,
        address_size: AddressSize,
        buffer: &mut [u8],
    ) -> Result<(), AccessError> {
        let linear = self.linear_address(seg, offset, address_size);
        let cpl = self.cpu.cpl();
        self.access(linear, buffer, cpl, false, None, AccessType::Read)
    }

    pub fn write_logical(
        &mut self,
        seg: SegmentReg,
        offset: u64,
        address_size: AddressSize,
        buffer: &[u8],
    ) -> Result<(), AccessError> {
        let linear = self.linear_address(seg, offset, address_size);
        let cpl = self.cpu.cpl();
        let mut bytes = [0u8; MAX_ACCESS_SIZE];
        let len = buffer.len();
        if len > MAX_ACCESS_SIZE {
            return Err(AccessError::UnsupportedSize(len));
        }
        bytes[..len].copy_from_slice(buffer);
        self.access(linear, &mut bytes[..len], cpl, false, None, AccessType::Write)
    }

    /// Fetch one instruction byte at `cs:ip`.
    pub fn fetch_byte(&mut self, ip: u64, cr3_override: Option<u64>) -> Result<u8, Fault> {
        let mode = self.cpu.mode();
        let linear = self.linear_address(SegmentReg::Cs, ip, mode.default_address_size());
        let cpl = self.cpu.cpl();
        let mut byte = [0u8; 1];
        match self.access(linear, &mut byte, cpl, false, cr3_override, AccessType::Execute) {
            Ok(()) => Ok(byte[0]),
            Err(AccessError::Translation { fault, .. }) => Err(fault),
            Err(_) => Err(Fault::gp0()),
        }
    }
}
