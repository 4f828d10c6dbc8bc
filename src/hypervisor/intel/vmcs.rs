use x86::vmx::vmcs;

use crate::hypervisor::{host::VirtualCpu, registers::GuestRegister};

/// Reads a VMCS field of `vcpu`.
///
/// A failure means the host framework and this runtime disagree about the
/// vCPU, which cannot be recovered from.
pub(crate) fn vmread<V: VirtualCpu + ?Sized>(vcpu: &V, encoding: u32) -> u64 {
    vcpu.read_vmcs(encoding)
        .unwrap_or_else(|err| panic!("Could not read {encoding:#x?}: {err}"))
}

/// Reads a VMCS field of `vcpu`. Returns zero on error.
pub(crate) fn vmread_relaxed<V: VirtualCpu + ?Sized>(vcpu: &V, encoding: u32) -> u64 {
    vcpu.read_vmcs(encoding).unwrap_or(0)
}

/// Writes a VMCS field of `vcpu`.
pub(crate) fn vmwrite<V: VirtualCpu + ?Sized, T: Into<u64>>(vcpu: &V, encoding: u32, value: T) {
    let value: u64 = value.into();
    vcpu.write_vmcs(encoding, value)
        .unwrap_or_else(|err| panic!("Could not write {value:#x?} to {encoding:#x?}: {err}"));
}

/// Reads a register of `vcpu`.
pub(crate) fn read_register<V: VirtualCpu + ?Sized>(vcpu: &V, register: GuestRegister) -> u64 {
    vcpu.read_register(register)
        .unwrap_or_else(|err| panic!("Could not read {register:?}: {err}"))
}

/// Writes a register of `vcpu`.
pub(crate) fn write_register<V: VirtualCpu + ?Sized>(vcpu: &V, register: GuestRegister, value: u64) {
    vcpu.write_register(register, value)
        .unwrap_or_else(|err| panic!("Could not write {value:#x?} to {register:?}: {err}"));
}

/// Formats the VMCS of a vCPU with `{:#x?}`.
pub(crate) struct Vmcs<'a, V: VirtualCpu>(pub(crate) &'a V);

impl<V: VirtualCpu> core::fmt::Debug for Vmcs<'_, V> {
    #[rustfmt::skip]
    #[allow(clippy::too_many_lines)]
    fn fmt(&self, format: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        // Dump the VMCS fields the host framework exposes. Note that this is not exhaustive.
        let vcpu = self.0;
        format.debug_struct("Vmcs")
        .field("vCPU                                           ", &vcpu.id())

        // 16-Bit Guest-State Fields
        .field("Guest ES Selector                              ", &vmread_relaxed(vcpu, vmcs::guest::ES_SELECTOR))
        .field("Guest CS Selector                              ", &vmread_relaxed(vcpu, vmcs::guest::CS_SELECTOR))
        .field("Guest SS Selector                              ", &vmread_relaxed(vcpu, vmcs::guest::SS_SELECTOR))
        .field("Guest DS Selector                              ", &vmread_relaxed(vcpu, vmcs::guest::DS_SELECTOR))
        .field("Guest FS Selector                              ", &vmread_relaxed(vcpu, vmcs::guest::FS_SELECTOR))
        .field("Guest GS Selector                              ", &vmread_relaxed(vcpu, vmcs::guest::GS_SELECTOR))
        .field("Guest LDTR Selector                            ", &vmread_relaxed(vcpu, vmcs::guest::LDTR_SELECTOR))
        .field("Guest TR Selector                              ", &vmread_relaxed(vcpu, vmcs::guest::TR_SELECTOR))

        // 64-Bit Guest-State Fields
        .field("VMCS link pointer                              ", &vmread_relaxed(vcpu, vmcs::guest::LINK_PTR_FULL))
        .field("Guest IA32_EFER                                ", &vmread_relaxed(vcpu, vmcs::guest::IA32_EFER_FULL))

        // 32-Bit Guest-State Fields
        .field("Guest ES Limit                                 ", &vmread_relaxed(vcpu, vmcs::guest::ES_LIMIT))
        .field("Guest CS Limit                                 ", &vmread_relaxed(vcpu, vmcs::guest::CS_LIMIT))
        .field("Guest SS Limit                                 ", &vmread_relaxed(vcpu, vmcs::guest::SS_LIMIT))
        .field("Guest DS Limit                                 ", &vmread_relaxed(vcpu, vmcs::guest::DS_LIMIT))
        .field("Guest FS Limit                                 ", &vmread_relaxed(vcpu, vmcs::guest::FS_LIMIT))
        .field("Guest GS Limit                                 ", &vmread_relaxed(vcpu, vmcs::guest::GS_LIMIT))
        .field("Guest LDTR Limit                               ", &vmread_relaxed(vcpu, vmcs::guest::LDTR_LIMIT))
        .field("Guest TR Limit                                 ", &vmread_relaxed(vcpu, vmcs::guest::TR_LIMIT))
        .field("Guest GDTR limit                               ", &vmread_relaxed(vcpu, vmcs::guest::GDTR_LIMIT))
        .field("Guest IDTR limit                               ", &vmread_relaxed(vcpu, vmcs::guest::IDTR_LIMIT))
        .field("Guest ES access rights                         ", &vmread_relaxed(vcpu, vmcs::guest::ES_ACCESS_RIGHTS))
        .field("Guest CS access rights                         ", &vmread_relaxed(vcpu, vmcs::guest::CS_ACCESS_RIGHTS))
        .field("Guest SS access rights                         ", &vmread_relaxed(vcpu, vmcs::guest::SS_ACCESS_RIGHTS))
        .field("Guest DS access rights                         ", &vmread_relaxed(vcpu, vmcs::guest::DS_ACCESS_RIGHTS))
        .field("Guest FS access rights                         ", &vmread_relaxed(vcpu, vmcs::guest::FS_ACCESS_RIGHTS))
        .field("Guest GS access rights                         ", &vmread_relaxed(vcpu, vmcs::guest::GS_ACCESS_RIGHTS))
        .field("Guest LDTR access rights                       ", &vmread_relaxed(vcpu, vmcs::guest::LDTR_ACCESS_RIGHTS))
        .field("Guest TR access rights                         ", &vmread_relaxed(vcpu, vmcs::guest::TR_ACCESS_RIGHTS))
        .field("Guest interruptibility state                   ", &vmread_relaxed(vcpu, vmcs::guest::INTERRUPTIBILITY_STATE))
        .field("Guest activity state                           ", &vmread_relaxed(vcpu, vmcs::guest::ACTIVITY_STATE))
        .field("Guest IA32_SYSENTER_CS                         ", &vmread_relaxed(vcpu, vmcs::guest::IA32_SYSENTER_CS))

        // Natural-Width Guest-State Fields
        .field("Guest CR0                                      ", &vmread_relaxed(vcpu, vmcs::guest::CR0))
        .field("Guest CR3                                      ", &vmread_relaxed(vcpu, vmcs::guest::CR3))
        .field("Guest CR4                                      ", &vmread_relaxed(vcpu, vmcs::guest::CR4))
        .field("Guest ES Base                                  ", &vmread_relaxed(vcpu, vmcs::guest::ES_BASE))
        .field("Guest CS Base                                  ", &vmread_relaxed(vcpu, vmcs::guest::CS_BASE))
        .field("Guest SS Base                                  ", &vmread_relaxed(vcpu, vmcs::guest::SS_BASE))
        .field("Guest DS Base                                  ", &vmread_relaxed(vcpu, vmcs::guest::DS_BASE))
        .field("Guest FS Base                                  ", &vmread_relaxed(vcpu, vmcs::guest::FS_BASE))
        .field("Guest GS Base                                  ", &vmread_relaxed(vcpu, vmcs::guest::GS_BASE))
        .field("Guest LDTR base                                ", &vmread_relaxed(vcpu, vmcs::guest::LDTR_BASE))
        .field("Guest TR base                                  ", &vmread_relaxed(vcpu, vmcs::guest::TR_BASE))
        .field("Guest GDTR base                                ", &vmread_relaxed(vcpu, vmcs::guest::GDTR_BASE))
        .field("Guest IDTR base                                ", &vmread_relaxed(vcpu, vmcs::guest::IDTR_BASE))
        .field("Guest DR7                                      ", &vmread_relaxed(vcpu, vmcs::guest::DR7))
        .field("Guest RSP                                      ", &vmread_relaxed(vcpu, vmcs::guest::RSP))
        .field("Guest RIP                                      ", &vmread_relaxed(vcpu, vmcs::guest::RIP))
        .field("Guest RFLAGS                                   ", &vmread_relaxed(vcpu, vmcs::guest::RFLAGS))
        .field("Guest IA32_SYSENTER_ESP                        ", &vmread_relaxed(vcpu, vmcs::guest::IA32_SYSENTER_ESP))
        .field("Guest IA32_SYSENTER_EIP                        ", &vmread_relaxed(vcpu, vmcs::guest::IA32_SYSENTER_EIP))

        // 32-Bit Control Fields
        .field("Pin-based VM-execution controls                ", &vmread_relaxed(vcpu, vmcs::control::PINBASED_EXEC_CONTROLS))
        .field("Primary processor-based VM-execution controls  ", &vmread_relaxed(vcpu, vmcs::control::PRIMARY_PROCBASED_EXEC_CONTROLS))
        .field("Exception bitmap                               ", &vmread_relaxed(vcpu, vmcs::control::EXCEPTION_BITMAP))
        .field("VM-entry controls                              ", &vmread_relaxed(vcpu, vmcs::control::VMENTRY_CONTROLS))
        .field("VM-entry interruption-information field        ", &vmread_relaxed(vcpu, vmcs::control::VMENTRY_INTERRUPTION_INFO_FIELD))
        .field("Secondary processor-based VM-execution controls", &vmread_relaxed(vcpu, vmcs::control::SECONDARY_PROCBASED_EXEC_CONTROLS))

        // Natural-Width Control Fields
        .field("CR0 guest/host mask                            ", &vmread_relaxed(vcpu, vmcs::control::CR0_GUEST_HOST_MASK))
        .field("CR4 guest/host mask                            ", &vmread_relaxed(vcpu, vmcs::control::CR4_GUEST_HOST_MASK))
        .field("CR0 read shadow                                ", &vmread_relaxed(vcpu, vmcs::control::CR0_READ_SHADOW))
        .field("CR4 read shadow                                ", &vmread_relaxed(vcpu, vmcs::control::CR4_READ_SHADOW))

        // 64-Bit Read-Only Data Fields
        .field("Guest-physical address                         ", &vmread_relaxed(vcpu, vmcs::ro::GUEST_PHYSICAL_ADDR_FULL))

        // 32-Bit Read-Only Data Fields
        .field("VM-instruction error                           ", &vmread_relaxed(vcpu, vmcs::ro::VM_INSTRUCTION_ERROR))
        .field("Exit reason                                    ", &vmread_relaxed(vcpu, vmcs::ro::EXIT_REASON))
        .field("VM-exit interruption information               ", &vmread_relaxed(vcpu, vmcs::ro::VMEXIT_INTERRUPTION_INFO))
        .field("VM-exit interruption error code                ", &vmread_relaxed(vcpu, vmcs::ro::VMEXIT_INTERRUPTION_ERR_CODE))
        .field("IDT-vectoring information field                ", &vmread_relaxed(vcpu, vmcs::ro::IDT_VECTORING_INFO))
        .field("VM-exit instruction length                     ", &vmread_relaxed(vcpu, vmcs::ro::VMEXIT_INSTRUCTION_LEN))

        // Natural-Width Read-Only Data Fields
        .field("Exit qualification                             ", &vmread_relaxed(vcpu, vmcs::ro::EXIT_QUALIFICATION))
        .field("Guest-linear address                           ", &vmread_relaxed(vcpu, vmcs::ro::GUEST_LINEAR_ADDR))
        .finish_non_exhaustive()
    }
}
