use crate::hypervisor::{error::HostError, host::VirtualCpu};

/// Registers of a vCPU accessible through the host framework, numbered in the
/// order of `hv_x86_reg_t`.
#[allow(missing_docs)]
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, num_derive::FromPrimitive)]
#[repr(u32)]
pub enum GuestRegister {
    Rip,
    Rflags,
    Rax,
    Rcx,
    Rdx,
    Rbx,
    Rsi,
    Rdi,
    Rsp,
    Rbp,
    R8,
    R9,
    R10,
    R11,
    R12,
    R13,
    R14,
    R15,
    Cs,
    Ss,
    Ds,
    Es,
    Fs,
    Gs,
    IdtBase,
    IdtLimit,
    GdtBase,
    GdtLimit,
    Ldtr,
    LdtBase,
    LdtLimit,
    LdtAr,
    Tr,
    TssBase,
    TssLimit,
    TssAr,
    Cr0,
    Cr1,
    Cr2,
    Cr3,
    Cr4,
    Dr0,
    Dr1,
    Dr2,
    Dr3,
    Dr4,
    Dr5,
    Dr6,
    Dr7,
    Tpr,
    Xcr0,
}

/// General purpose registers in the order used by the register-operand fields
/// of exit qualifications.
///
/// See: Table 28-3. Exit Qualification for Control-Register Accesses
const GPR_BY_INDEX: [GuestRegister; 16] = [
    GuestRegister::Rax,
    GuestRegister::Rcx,
    GuestRegister::Rdx,
    GuestRegister::Rbx,
    GuestRegister::Rsp,
    GuestRegister::Rbp,
    GuestRegister::Rsi,
    GuestRegister::Rdi,
    GuestRegister::R8,
    GuestRegister::R9,
    GuestRegister::R10,
    GuestRegister::R11,
    GuestRegister::R12,
    GuestRegister::R13,
    GuestRegister::R14,
    GuestRegister::R15,
];

impl GuestRegister {
    /// Returns the general purpose register encoded as `index` (0-15) in an
    /// exit qualification.
    pub fn from_gpr_index(index: u8) -> Option<Self> {
        GPR_BY_INDEX.get(usize::from(index)).copied()
    }
}

/// A snapshot of the general purpose registers of a vCPU.
#[allow(missing_docs)]
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct Registers {
    pub rax: u64,
    pub rbx: u64,
    pub rcx: u64,
    pub rdx: u64,
    pub rdi: u64,
    pub rsi: u64,
    pub rbp: u64,
    pub r8: u64,
    pub r9: u64,
    pub r10: u64,
    pub r11: u64,
    pub r12: u64,
    pub r13: u64,
    pub r14: u64,
    pub r15: u64,
    pub rflags: u64,
    pub rsp: u64,
    pub rip: u64,
}

impl Registers {
    /// Reads the current register values of `vcpu`.
    pub fn capture<V: VirtualCpu>(vcpu: &V) -> Result<Self, HostError> {
        Ok(Self {
            rax: vcpu.read_register(GuestRegister::Rax)?,
            rbx: vcpu.read_register(GuestRegister::Rbx)?,
            rcx: vcpu.read_register(GuestRegister::Rcx)?,
            rdx: vcpu.read_register(GuestRegister::Rdx)?,
            rdi: vcpu.read_register(GuestRegister::Rdi)?,
            rsi: vcpu.read_register(GuestRegister::Rsi)?,
            rbp: vcpu.read_register(GuestRegister::Rbp)?,
            r8: vcpu.read_register(GuestRegister::R8)?,
            r9: vcpu.read_register(GuestRegister::R9)?,
            r10: vcpu.read_register(GuestRegister::R10)?,
            r11: vcpu.read_register(GuestRegister::R11)?,
            r12: vcpu.read_register(GuestRegister::R12)?,
            r13: vcpu.read_register(GuestRegister::R13)?,
            r14: vcpu.read_register(GuestRegister::R14)?,
            r15: vcpu.read_register(GuestRegister::R15)?,
            rflags: vcpu.read_register(GuestRegister::Rflags)?,
            rsp: vcpu.read_register(GuestRegister::Rsp)?,
            rip: vcpu.read_register(GuestRegister::Rip)?,
        })
    }
}

#[cfg(test)]
mod tests {
    use num_traits::FromPrimitive;

    use super::*;

    #[test]
    fn host_numbering() {
        assert_eq!(GuestRegister::Rip as u32, 0);
        assert_eq!(GuestRegister::Rax as u32, 2);
        assert_eq!(GuestRegister::Cs as u32, 18);
        assert_eq!(GuestRegister::Cr0 as u32, 36);
        assert_eq!(GuestRegister::Xcr0 as u32, 50);
        assert_eq!(GuestRegister::from_u32(40), Some(GuestRegister::Cr4));
        assert_eq!(GuestRegister::from_u32(51), None);
    }

    #[test]
    fn gpr_index() {
        assert_eq!(GuestRegister::from_gpr_index(0), Some(GuestRegister::Rax));
        assert_eq!(GuestRegister::from_gpr_index(3), Some(GuestRegister::Rbx));
        assert_eq!(GuestRegister::from_gpr_index(4), Some(GuestRegister::Rsp));
        assert_eq!(GuestRegister::from_gpr_index(6), Some(GuestRegister::Rsi));
        assert_eq!(GuestRegister::from_gpr_index(15), Some(GuestRegister::R15));
        assert_eq!(GuestRegister::from_gpr_index(16), None);
    }
}
