use iced_x86::Code;

/// Instruction mnemonics the hypervisor cares about.
///
/// Anything the decoding engine knows but this table does not collapses to
/// [`Mnemonic::Unknown`]; byte streams that are not instructions at all decode
/// as [`Mnemonic::Invalid`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum Mnemonic {
    Invalid,
    Unknown,

    // Data movement.
    Mov,
    Movzx,
    Movsx,
    Movsxd,
    Lea,
    Xchg,
    Push,
    Pop,
    Pushf,
    Popf,
    Cbw,
    Cwd,
    Leave,
    Cmpxchg,
    Xadd,

    // Arithmetic and logic.
    Add,
    Adc,
    Sub,
    Sbb,
    And,
    Or,
    Xor,
    Cmp,
    Test,
    Inc,
    Dec,
    Neg,
    Not,
    Mul,
    Imul,
    Div,
    Idiv,
    Shl,
    Shr,
    Sar,
    Rol,
    Ror,
    Bt,
    Bts,
    Btr,
    Btc,

    // String instructions.
    Movsb,
    Movsw,
    Movsd,
    Movsq,
    Stosb,
    Stosw,
    Stosd,
    Stosq,
    Lodsb,
    Lodsw,
    Lodsd,
    Lodsq,
    Cmpsb,
    Cmpsw,
    Cmpsd,
    Cmpsq,
    Scasb,
    Scasw,
    Scasd,
    Scasq,
    Insb,
    Insw,
    Insd,
    Outsb,
    Outsw,
    Outsd,

    // Flags.
    Clc,
    Stc,
    Cmc,
    Cld,
    Std,
    Cli,
    Sti,

    // Control flow.
    Nop,
    Jmp,
    Call,
    Ret,
    Retf,
    Iret,
    Int,
    Int3,
    Into,

    // System.
    Hlt,
    In,
    Out,
    Cpuid,
    Rdmsr,
    Wrmsr,
    Rdtsc,
    Rdtscp,
    Rdpmc,
    Invlpg,
    Invd,
    Wbinvd,
    Lgdt,
    Lidt,
    Lldt,
    Ltr,
    Sgdt,
    Sidt,
    Sldt,
    Str,
    Smsw,
    Lmsw,
    Clts,
    Xsetbv,
    Vmcall,
    Vmmcall,
}

impl Mnemonic {
    /// Maps the engine's mnemonic to ours.
    ///
    /// `code` disambiguates mnemonics the engine shares between string
    /// instructions and SSE (`movsd`/`cmpsd`).
    pub fn from_iced(mnemonic: iced_x86::Mnemonic, code: Code) -> Self {
        use iced_x86::Mnemonic as M;

        match mnemonic {
            M::INVALID => Mnemonic::Invalid,

            M::Mov => Mnemonic::Mov,
            M::Movzx => Mnemonic::Movzx,
            M::Movsx => Mnemonic::Movsx,
            M::Movsxd => Mnemonic::Movsxd,
            M::Lea => Mnemonic::Lea,
            M::Xchg => Mnemonic::Xchg,
            M::Push => Mnemonic::Push,
            M::Pop => Mnemonic::Pop,
            M::Pushf | M::Pushfd | M::Pushfq => Mnemonic::Pushf,
            M::Popf | M::Popfd | M::Popfq => Mnemonic::Popf,
            M::Cbw | M::Cwde | M::Cdqe => Mnemonic::Cbw,
            M::Cwd | M::Cdq | M::Cqo => Mnemonic::Cwd,
            M::Leave => Mnemonic::Leave,
            M::Cmpxchg => Mnemonic::Cmpxchg,
            M::Xadd => Mnemonic::Xadd,

            M::Add => Mnemonic::Add,
            M::Adc => Mnemonic::Adc,
            M::Sub => Mnemonic::Sub,
            M::Sbb => Mnemonic::Sbb,
            M::And => Mnemonic::And,
            M::Or => Mnemonic::Or,
            M::Xor => Mnemonic::Xor,
            M::Cmp => Mnemonic::Cmp,
            M::Test => Mnemonic::Test,
            M::Inc => Mnemonic::Inc,
            M::Dec => Mnemonic::Dec,
            M::Neg => Mnemonic::Neg,
            M::Not => Mnemonic::Not,
            M::Mul => Mnemonic::Mul,
            M::Imul => Mnemonic::Imul,
            M::Div => Mnemonic::Div,
            M::Idiv => Mnemonic::Idiv,
            M::Shl | M::Sal => Mnemonic::Shl,
            M::Shr => Mnemonic::Shr,
            M::Sar => Mnemonic::Sar,
            M::Rol => Mnemonic::Rol,
            M::Ror => Mnemonic::Ror,
            M::Bt => Mnemonic::Bt,
            M::Bts => Mnemonic::Bts,
            M::Btr => Mnemonic::Btr,
            M::Btc => Mnemonic::Btc,

            M::Movsb => Mnemonic::Movsb,
            M::Movsw => Mnemonic::Movsw,
            M::Movsd if code == Code::Movsd_m32_m32 => Mnemonic::Movsd,
            M::Movsq => Mnemonic::Movsq,
            M::Stosb => Mnemonic::Stosb,
            M::Stosw => Mnemonic::Stosw,
            M::Stosd => Mnemonic::Stosd,
            M::Stosq => Mnemonic::Stosq,
            M::Lodsb => Mnemonic::Lodsb,
            M::Lodsw => Mnemonic::Lodsw,
            M::Lodsd => Mnemonic::Lodsd,
            M::Lodsq => Mnemonic::Lodsq,
            M::Cmpsb => Mnemonic::Cmpsb,
            M::Cmpsw => Mnemonic::Cmpsw,
            M::Cmpsd if code == Code::Cmpsd_m32_m32 => Mnemonic::Cmpsd,
            M::Cmpsq => Mnemonic::Cmpsq,
            M::Scasb => Mnemonic::Scasb,
            M::Scasw => Mnemonic::Scasw,
            M::Scasd => Mnemonic::Scasd,
            M::Scasq => Mnemonic::Scasq,
            M::Insb => Mnemonic::Insb,
            M::Insw => Mnemonic::Insw,
            M::Insd => Mnemonic::Insd,
            M::Outsb => Mnemonic::Outsb,
            M::Outsw => Mnemonic::Outsw,
            M::Outsd => Mnemonic::Outsd,

            M::Clc => Mnemonic::Clc,
            M::Stc => Mnemonic::Stc,
            M::Cmc => Mnemonic::Cmc,
            M::Cld => Mnemonic::Cld,
            M::Std => Mnemonic::Std,
            M::Cli => Mnemonic::Cli,
            M::Sti => Mnemonic::Sti,

            M::Nop => Mnemonic::Nop,
            M::Jmp => Mnemonic::Jmp,
            M::Call => Mnemonic::Call,
            M::Ret => Mnemonic::Ret,
            M::Retf => Mnemonic::Retf,
            M::Iret | M::Iretd | M::Iretq => Mnemonic::Iret,
            M::Int => Mnemonic::Int,
            M::Int3 => Mnemonic::Int3,
            M::Into => Mnemonic::Into,

            M::Hlt => Mnemonic::Hlt,
            M::In => Mnemonic::In,
            M::Out => Mnemonic::Out,
            M::Cpuid => Mnemonic::Cpuid,
            M::Rdmsr => Mnemonic::Rdmsr,
            M::Wrmsr => Mnemonic::Wrmsr,
            M::Rdtsc => Mnemonic::Rdtsc,
            M::Rdtscp => Mnemonic::Rdtscp,
            M::Rdpmc => Mnemonic::Rdpmc,
            M::Invlpg => Mnemonic::Invlpg,
            M::Invd => Mnemonic::Invd,
            M::Wbinvd => Mnemonic::Wbinvd,
            M::Lgdt => Mnemonic::Lgdt,
            M::Lidt => Mnemonic::Lidt,
            M::Lldt => Mnemonic::Lldt,
            M::Ltr => Mnemonic::Ltr,
            M::Sgdt => Mnemonic::Sgdt,
            M::Sidt => Mnemonic::Sidt,
            M::Sldt => Mnemonic::Sldt,
            M::Str => Mnemonic::Str,
            M::Smsw => Mnemonic::Smsw,
            M::Lmsw => Mnemonic::Lmsw,
            M::Clts => Mnemonic::Clts,
            M::Xsetbv => Mnemonic::Xsetbv,
            M::Vmcall => Mnemonic::Vmcall,
            M::Vmmcall => Mnemonic::Vmmcall,

            _ => Mnemonic::Unknown,
        }
    }

    /// Whether operands can be materialized for this mnemonic.
    #[inline]
    pub fn is_known(self) -> bool {
        !matches!(self, Mnemonic::Invalid | Mnemonic::Unknown)
    }

    /// String instructions: the ones a REP prefix applies to.
    pub fn is_string(self) -> bool {
        self.is_compare_string()
            || matches!(
                self,
                Mnemonic::Movsb
                    | Mnemonic::Movsw
                    | Mnemonic::Movsd
                    | Mnemonic::Movsq
                    | Mnemonic::Stosb
                    | Mnemonic::Stosw
                    | Mnemonic::Stosd
                    | Mnemonic::Stosq
                    | Mnemonic::Lodsb
                    | Mnemonic::Lodsw
                    | Mnemonic::Lodsd
                    | Mnemonic::Lodsq
                    | Mnemonic::Insb
                    | Mnemonic::Insw
                    | Mnemonic::Insd
                    | Mnemonic::Outsb
                    | Mnemonic::Outsw
                    | Mnemonic::Outsd
            )
    }

    /// CMPS/SCAS: string instructions whose REP forms also test ZF.
    pub fn is_compare_string(self) -> bool {
        matches!(
            self,
            Mnemonic::Cmpsb
                | Mnemonic::Cmpsw
                | Mnemonic::Cmpsd
                | Mnemonic::Cmpsq
                | Mnemonic::Scasb
                | Mnemonic::Scasw
                | Mnemonic::Scasd
                | Mnemonic::Scasq
        )
    }
}
