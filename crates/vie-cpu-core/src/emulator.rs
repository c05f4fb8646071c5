use vie_mmu::VirtualMmu;
use vie_x86::{DecodeError, Decoder, Instruction, Mnemonic, RepPrefix};

use crate::config::EmulatorConfig;
use crate::error::{ConfigError, ExecError, Fault};
use crate::interp::{self, string, Flow};
use crate::paging_bus::PagingBus;
use crate::vcpu::{RFlags, VCpu};

/// What the caller should do with a fault the emulator ran into.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FaultDisposition {
    /// Inject the exception and resume the guest.
    Deliverable,
    /// The exception cannot be injected now; the vCPU cannot make progress and
    /// the caller must escalate rather than retry.
    Stuck,
}

/// Result of one [`Emulator::emulate`] call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EmulationStatus {
    /// The instruction (or one REP iteration) completed.
    Ok,
    /// Guest state is unchanged apart from what the fault itself implies.
    Fault {
        fault: Fault,
        disposition: FaultDisposition,
    },
    /// Not emulated; guest state is untouched.
    Unimplemented(Mnemonic),
}

/// Emulates guest instructions against one vCPU.
pub struct Emulator<V: VCpu> {
    cpu: V,
    mmu: VirtualMmu,
    decoder: Decoder,
}

impl<V: VCpu> Emulator<V> {
    pub fn new(cpu: V, config: EmulatorConfig) -> Result<Self, ConfigError> {
        config.validate()?;
        Ok(Self {
            cpu,
            mmu: VirtualMmu::with_max_phys_bits(config.max_phys_bits),
            decoder: Decoder::new(config.vendor),
        })
    }

    #[inline]
    pub fn cpu(&self) -> &V {
        &self.cpu
    }

    #[inline]
    pub fn cpu_mut(&mut self) -> &mut V {
        &mut self.cpu
    }

    #[inline]
    pub fn mmu(&self) -> &VirtualMmu {
        &self.mmu
    }

    #[inline]
    pub fn mmu_mut(&mut self) -> &mut VirtualMmu {
        &mut self.mmu
    }

    pub fn into_inner(self) -> V {
        self.cpu
    }

    /// Whether [`Emulator::emulate`] fully handles `mnemonic`.
    pub fn is_fully_implemented(mnemonic: Mnemonic) -> bool {
        interp::is_implemented(mnemonic)
    }

    /// Decode the instruction at `cs:ip`, optionally walking the page tables
    /// rooted at `cr3_override` instead of the live CR3.
    ///
    /// Starts from an empty TLB, as does [`Emulator::emulate`].
    pub fn decode(
        &mut self,
        ip: u64,
        cr3_override: Option<u64>,
        replace_first_byte: Option<u8>,
    ) -> Result<Instruction, DecodeError<Fault>> {
        // Cached translations live for one instruction at most: the guest can
        // rewrite its page tables and run INVLPG natively between exits.
        self.mmu.flush();

        let mode = self.cpu.mode();
        let ip_mask = mode.ip_mask();
        let mut bus = PagingBus::new(&mut self.cpu, &mut self.mmu);
        self.decoder.decode(
            |offset| bus.fetch_byte(ip.wrapping_add(offset as u64) & ip_mask, cr3_override),
            ip,
            mode,
            replace_first_byte,
        )
    }

    /// Emulate the instruction at `ip`.
    ///
    /// REP-prefixed string instructions perform a single iteration per call
    /// and leave IP on the instruction until the count runs out, so the caller
    /// can re-enter the guest between iterations.
    pub fn emulate(&mut self, ip: u64, replace_byte: Option<u8>) -> EmulationStatus {
        let mut inst = match self.decode(ip, None, replace_byte) {
            Ok(inst) => inst,
            Err(err) => {
                tracing::debug!(ip, offset = err.offset, fault = ?err.fault, "instruction fetch faulted");
                return self.fault_status(err.fault);
            }
        };
        tracing::trace!(ip, mnemonic = ?inst.mnemonic, len = inst.length, "emulate");

        if !Self::is_fully_implemented(inst.mnemonic) {
            tracing::debug!(ip, %inst, "unimplemented instruction");
            return EmulationStatus::Unimplemented(inst.mnemonic);
        }

        let mode = self.cpu.mode();
        let next_ip = inst.next_ip(mode.ip_mask());
        let repeat = inst.rep != RepPrefix::None;
        let count = string::read_count(&self.cpu, inst.address_size);
        if repeat && count == 0 {
            self.cpu.set_rip(next_ip);
            return EmulationStatus::Ok;
        }

        let mut bus = PagingBus::new(&mut self.cpu, &mut self.mmu);
        let flow = match interp::exec(&mut inst, &mut bus) {
            Ok(flow) => flow,
            Err(ExecError::Fault(fault)) => return self.fault_status(fault),
            Err(ExecError::Unsupported(what)) => {
                tracing::debug!(ip, %inst, what, "unsupported instruction form");
                return EmulationStatus::Unimplemented(inst.mnemonic);
            }
        };

        match flow {
            Flow::Jump(target) => self.cpu.set_rip(target),
            Flow::Next if !repeat => self.cpu.set_rip(next_ip),
            Flow::Next => {
                let remaining = count.wrapping_sub(1);
                string::write_count(&mut self.cpu, inst.address_size, remaining);

                let zf = RFlags::from_bits_retain(self.cpu.rflags()).contains(RFlags::ZF);
                let terminated = match inst.rep {
                    RepPrefix::RepEquals => !zf,
                    RepPrefix::RepNotEquals => zf,
                    RepPrefix::Rep | RepPrefix::None => false,
                };
                if terminated {
                    self.cpu.set_rip(next_ip);
                }
            }
        }
        EmulationStatus::Ok
    }

    fn fault_status(&self, fault: Fault) -> EmulationStatus {
        let disposition = if self.cpu.can_inject_exception() {
            FaultDisposition::Deliverable
        } else {
            tracing::warn!(?fault, "fault cannot be delivered, vCPU is stuck");
            FaultDisposition::Stuck
        };
        EmulationStatus::Fault { fault, disposition }
    }
}
