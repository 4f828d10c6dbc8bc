use x86::{
    controlregs::{Cr0, Cr4},
    msr,
    vmx::vmcs::{
        self,
        control::{EntryControls, PrimaryControls, SecondaryControls},
    },
};

use crate::hypervisor::{
    host::{HostVirtualization, VirtualCpu, VmxCapability},
    segment::DescriptorSet,
};

use super::{capability::negotiate_with, vmcs::vmwrite};

/// `IA32_EFER.LME`
pub(crate) const EFER_LME: u64 = 1 << 8;
/// `IA32_EFER.LMA`
pub(crate) const EFER_LMA: u64 = 1 << 10;

/// The initial operating mode of a guest.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum GuestMode {
    /// Real-address mode without paging. The guest may switch to protected
    /// and long mode itself through the emulated CR0, CR4 and EFER writes.
    Real,
    /// 64-bit mode with paging enabled, using the PML4 at `cr3`.
    Long {
        /// The guest-physical address of the PML4.
        cr3: u64,
    },
}

/// MSRs the guest accesses without VM-exits in 64-bit mode. These back
/// `SYSCALL`, `SYSENTER`, FS/GS bases and time stamps.
const NATIVE_MSRS: [u32; 12] = [
    msr::IA32_LSTAR,
    msr::IA32_CSTAR,
    msr::IA32_STAR,
    msr::IA32_FMASK,
    msr::IA32_KERNEL_GSBASE,
    msr::IA32_GS_BASE,
    msr::IA32_FS_BASE,
    msr::IA32_SYSENTER_CS,
    msr::IA32_SYSENTER_ESP,
    msr::IA32_SYSENTER_EIP,
    msr::IA32_TIME_STAMP_COUNTER,
    msr::IA32_TSC_AUX,
];

/// CR0 bits owned by the host in 64-bit mode: PE, ET, NE, NW, CD and PG.
const LONG_MODE_CR0_MASK: u64 = 0xe000_0031;
/// CR0 bits owned by the host in real mode: NW and CD.
const REAL_MODE_CR0_MASK: u64 = 0x6000_0000;

/// Programs the VMCS of `vcpu` so that the guest starts in `mode`.
///
/// Control fields are negotiated against the capability words of `host`;
/// HLT, CR8 loads and CR8 stores always cause VM-exits, and exceptions set in
/// `exception_bitmap` are intercepted. Any host failure on the way is fatal.
pub fn configure<H: HostVirtualization>(
    host: &H,
    vcpu: &H::Vcpu,
    mode: GuestMode,
    exception_bitmap: u32,
) {
    initialize_control(host, vcpu, mode, exception_bitmap);
    match mode {
        GuestMode::Real => initialize_real_mode(vcpu),
        GuestMode::Long { cr3 } => initialize_long_mode(vcpu, cr3),
    }
    log::debug!("Configured vCPU {} for {mode:x?}", vcpu.id());
}

fn initialize_control<H: HostVirtualization>(
    host: &H,
    vcpu: &H::Vcpu,
    mode: GuestMode,
    exception_bitmap: u32,
) {
    let entry = match mode {
        GuestMode::Real => 0,
        GuestMode::Long { .. } => u64::from(EntryControls::IA32E_MODE_GUEST.bits()),
    };

    vmwrite(
        vcpu,
        vmcs::control::PINBASED_EXEC_CONTROLS,
        negotiate_with(host, VmxCapability::PinBased, 0),
    );
    vmwrite(
        vcpu,
        vmcs::control::PRIMARY_PROCBASED_EXEC_CONTROLS,
        negotiate_with(
            host,
            VmxCapability::ProcessorBased,
            u64::from(
                (PrimaryControls::HLT_EXITING
                    | PrimaryControls::CR8_LOAD_EXITING
                    | PrimaryControls::CR8_STORE_EXITING)
                    .bits(),
            ),
        ),
    );
    vmwrite(
        vcpu,
        vmcs::control::SECONDARY_PROCBASED_EXEC_CONTROLS,
        negotiate_with(
            host,
            VmxCapability::ProcessorBased2,
            u64::from(SecondaryControls::ENABLE_RDTSCP.bits()),
        ),
    );
    vmwrite(
        vcpu,
        vmcs::control::VMENTRY_CONTROLS,
        negotiate_with(host, VmxCapability::VmEntry, entry),
    );
    vmwrite(vcpu, vmcs::control::EXCEPTION_BITMAP, exception_bitmap);
}

fn initialize_real_mode<V: VirtualCpu>(vcpu: &V) {
    DescriptorSet::REAL.load(vcpu);

    let cr0 = Cr0::CR0_NUMERIC_ERROR.bits() as u64;
    vmwrite(vcpu, vmcs::guest::CR0, cr0);
    vmwrite(vcpu, vmcs::control::CR0_GUEST_HOST_MASK, REAL_MODE_CR0_MASK);
    vmwrite(vcpu, vmcs::control::CR0_READ_SHADOW, 0u64);

    vmwrite(vcpu, vmcs::guest::CR3, 0u64);

    let vmxe = Cr4::CR4_ENABLE_VMX.bits() as u64;
    vmwrite(vcpu, vmcs::guest::CR4, vmxe);
    vmwrite(vcpu, vmcs::control::CR4_GUEST_HOST_MASK, vmxe);
    vmwrite(vcpu, vmcs::control::CR4_READ_SHADOW, 0u64);

    vmwrite(vcpu, vmcs::guest::IA32_EFER_FULL, 0u64);
}

fn initialize_long_mode<V: VirtualCpu>(vcpu: &V, cr3: u64) {
    for msr in NATIVE_MSRS {
        vcpu.enable_native_msr(msr, true)
            .unwrap_or_else(|err| panic!("Could not pass through MSR {msr:#x?}: {err}"));
    }

    DescriptorSet::LONG.load(vcpu);

    let cr0 = (Cr0::CR0_PROTECTED_MODE
        | Cr0::CR0_EXTENSION_TYPE
        | Cr0::CR0_NUMERIC_ERROR
        | Cr0::CR0_ENABLE_PAGING)
        .bits() as u64;
    vmwrite(vcpu, vmcs::guest::CR0, cr0);
    vmwrite(vcpu, vmcs::control::CR0_GUEST_HOST_MASK, LONG_MODE_CR0_MASK);
    vmwrite(vcpu, vmcs::control::CR0_READ_SHADOW, cr0);

    vmwrite(vcpu, vmcs::guest::CR3, cr3);

    // Compiled host code uses SSE and may use AVX.
    let vmxe = Cr4::CR4_ENABLE_VMX.bits() as u64;
    let cr4 = vmxe
        | (Cr4::CR4_ENABLE_PAE | Cr4::CR4_ENABLE_SSE | Cr4::CR4_ENABLE_OS_XSAVE).bits() as u64;
    vmwrite(vcpu, vmcs::guest::CR4, cr4);
    vmwrite(vcpu, vmcs::control::CR4_GUEST_HOST_MASK, vmxe);
    vmwrite(vcpu, vmcs::control::CR4_READ_SHADOW, cr4 & !vmxe);

    vmwrite(vcpu, vmcs::guest::IA32_EFER_FULL, EFER_LME | EFER_LMA);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hypervisor::{
        fake::{FakeHost, CAPABILITIES},
        intel::{capability::negotiate, vmcs::vmread},
    };

    #[test]
    fn long_mode() {
        let host = FakeHost::new();
        let vcpu = host.create_vcpu().unwrap();
        configure(&host, &vcpu, GuestMode::Long { cr3: 0x20_0000 }, 1 << 14);

        let entry = vmread(&vcpu, vmcs::control::VMENTRY_CONTROLS);
        assert_ne!(entry & u64::from(EntryControls::IA32E_MODE_GUEST.bits()), 0);
        let primary = vmread(&vcpu, vmcs::control::PRIMARY_PROCBASED_EXEC_CONTROLS);
        assert_ne!(primary & u64::from(PrimaryControls::HLT_EXITING.bits()), 0);
        assert_eq!(
            primary,
            negotiate(
                CAPABILITIES[VmxCapability::ProcessorBased as usize],
                u64::from(
                    (PrimaryControls::HLT_EXITING
                        | PrimaryControls::CR8_LOAD_EXITING
                        | PrimaryControls::CR8_STORE_EXITING)
                        .bits()
                )
            )
        );

        assert_eq!(vmread(&vcpu, vmcs::guest::CR0), 0x8000_0031);
        assert_eq!(vmread(&vcpu, vmcs::guest::CR3), 0x20_0000);
        let cr4 = vmread(&vcpu, vmcs::guest::CR4);
        assert_eq!(cr4, 0x4_2220);
        assert_ne!(cr4 & Cr4::CR4_ENABLE_SSE.bits() as u64, 0);
        assert_ne!(cr4 & Cr4::CR4_ENABLE_OS_XSAVE.bits() as u64, 0);
        assert_eq!(vmread(&vcpu, vmcs::control::CR4_READ_SHADOW), 0x4_0220);
        assert_eq!(vmread(&vcpu, vmcs::guest::IA32_EFER_FULL), 0x500);
        assert_eq!(vmread(&vcpu, vmcs::control::EXCEPTION_BITMAP), 1 << 14);
        assert!(vcpu.native_msrs().contains(&msr::IA32_LSTAR));
        assert_eq!(vcpu.native_msrs().len(), NATIVE_MSRS.len());
    }

    #[test]
    fn real_mode() {
        let host = FakeHost::new();
        let vcpu = host.create_vcpu().unwrap();
        configure(&host, &vcpu, GuestMode::Real, 0xffff_ffff);

        let entry = vmread(&vcpu, vmcs::control::VMENTRY_CONTROLS);
        assert_eq!(entry & u64::from(EntryControls::IA32E_MODE_GUEST.bits()), 0);
        assert_eq!(vmread(&vcpu, vmcs::guest::CR0), 0x20);
        assert_eq!(vmread(&vcpu, vmcs::guest::CR4), 0x2000);
        assert_eq!(vmread(&vcpu, vmcs::control::CR4_GUEST_HOST_MASK), 0x2000);
        assert_eq!(vmread(&vcpu, vmcs::control::CR4_READ_SHADOW), 0);
        assert_eq!(vmread(&vcpu, vmcs::guest::IA32_EFER_FULL), 0);
        assert!(vcpu.native_msrs().is_empty());
    }
}
