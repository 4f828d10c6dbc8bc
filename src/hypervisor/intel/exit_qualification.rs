//! Decoders of VM-exit information fields.

use bit_field::BitField;

/// Basic VM-exit reasons this runtime knows about.
///
/// See: Table C-1. Basic Exit Reasons
#[derive(Clone, Copy, Debug, PartialEq, Eq, num_derive::FromPrimitive, derive_more::Display)]
#[repr(u16)]
pub(crate) enum ExitReason {
    ExceptionOrNmi = 0,
    ExternalInterrupt = 1,
    TripleFault = 2,
    InitSignal = 3,
    StartupIpi = 4,
    InterruptWindow = 7,
    Cpuid = 10,
    Hlt = 12,
    Rdtsc = 16,
    Vmcall = 18,
    ControlRegisterAccess = 28,
    IoInstruction = 30,
    Rdmsr = 31,
    Wrmsr = 32,
    EntryFailureGuestState = 33,
    EptViolation = 48,
    EptMisconfiguration = 49,
    Rdtscp = 51,
    PreemptionTimer = 52,
    Xsetbv = 55,
}

impl ExitReason {
    /// Extracts the basic exit reason from the raw exit reason field.
    pub(crate) fn basic(raw: u64) -> u16 {
        raw.get_bits(0..16) as u16
    }
}

bitfield::bitfield! {
    /// Table 28-3. Exit Qualification for Control-Register Accesses
    #[derive(Clone, Copy)]
    pub struct CrAccessQualification(u64);
    impl Debug;
    u8;
    pub cr_number, _: 3, 0;
    pub access_type_raw, _: 5, 4;
    pub lmsw_memory_operand, _: 6;
    pub gpr_index, _: 11, 8;
    pub u16, lmsw_source_data, _: 31, 16;
}

/// The access type of a control-register access.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(u8)]
pub(crate) enum CrAccessType {
    MovToCr = 0,
    MovFromCr = 1,
    Clts = 2,
    Lmsw = 3,
}

impl CrAccessQualification {
    pub(crate) fn access_type(&self) -> CrAccessType {
        match self.access_type_raw() {
            0 => CrAccessType::MovToCr,
            1 => CrAccessType::MovFromCr,
            2 => CrAccessType::Clts,
            _ => CrAccessType::Lmsw,
        }
    }
}

bitfield::bitfield! {
    /// Table 28-7. Exit Qualification for EPT Violations
    #[derive(Clone, Copy)]
    pub struct EptViolationQualification(u64);
    impl Debug;
    pub read, _: 0;
    pub write, _: 1;
    pub fetch, _: 2;
    pub readable, _: 3;
    pub writable, _: 4;
    pub executable, _: 5;
    pub linear_address_valid, _: 7;
    /// Set when the access was to the translated page rather than to a
    /// paging-structure entry. Valid only when `linear_address_valid`.
    pub translated_access, _: 8;
}

impl EptViolationQualification {
    /// Returns the 9 low flag bits (access and permission bits plus the two
    /// linear-address flags).
    pub(crate) fn flags(&self) -> u16 {
        self.0.get_bits(0..9) as u16
    }
}

impl core::fmt::Display for EptViolationQualification {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        let access = match (self.read(), self.write(), self.fetch()) {
            (_, _, true) => "fetch",
            (_, true, _) => "write",
            (true, _, _) => "read",
            _ => "none",
        };
        let permissions = [
            if self.readable() { 'r' } else { '-' },
            if self.writable() { 'w' } else { '-' },
            if self.executable() { 'x' } else { '-' },
        ];
        write!(
            f,
            "{access} access, permissions {}, ",
            permissions.iter().collect::<String>()
        )?;
        if !self.linear_address_valid() {
            write!(f, "no linear address")
        } else if self.translated_access() {
            write!(f, "to the translated page")
        } else {
            write!(f, "to a paging-structure entry")
        }
    }
}

bitfield::bitfield! {
    /// Table 25-19. Format of the VM-Exit Interruption-Information Field
    #[derive(Clone, Copy)]
    pub struct InterruptionInfo(u32);
    impl Debug;
    u8;
    pub vector, _: 7, 0;
    pub interruption_type, _: 10, 8;
    pub error_code_valid, _: 11;
    pub valid, _: 31;
}
