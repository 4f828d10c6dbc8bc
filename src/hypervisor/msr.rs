//! Emulation of the MSRs that are neither passed through nor unknown.

use x86::{msr::IA32_EFER, vmx::vmcs};

use super::{
    error::TerminateReason,
    host::VirtualCpu,
    intel::vmcs::{vmread, vmwrite},
};

/// `IA32_BIOS_SIGN_ID`, the microcode update signature.
pub(crate) const IA32_BIOS_SIGN_ID: u32 = 0x8b;

/// `IA32_MISC_ENABLE`
pub(crate) const IA32_MISC_ENABLE: u32 = 0x1a0;

/// The fixed value of `IA32_MISC_ENABLE`: fast strings enabled (bit 0),
/// branch trace (bit 11) and PEBS (bit 12) unavailable, and Enhanced
/// SpeedStep (bit 16) and MONITOR FSM (bit 18) disabled.
const MISC_ENABLE_VALUE: u64 = 1 | ((1 << 12) | (1 << 11)) & !((1 << 18) | (1 << 16));

struct MsrHandler {
    msr: u32,
    read: fn(&dyn VirtualCpu) -> u64,
    write: fn(&dyn VirtualCpu, u64) -> Result<(), TerminateReason>,
}

const MSR_HANDLERS: [MsrHandler; 3] = [
    MsrHandler {
        msr: IA32_EFER,
        read: |vcpu| vmread(vcpu, vmcs::guest::IA32_EFER_FULL),
        write: |vcpu, value| {
            vmwrite(vcpu, vmcs::guest::IA32_EFER_FULL, value);
            Ok(())
        },
    },
    MsrHandler {
        msr: IA32_BIOS_SIGN_ID,
        read: |_| 0,
        write: |_, value| {
            log::warn!("Ignored write of {value:#x?} to IA32_BIOS_SIGN_ID");
            Ok(())
        },
    },
    MsrHandler {
        msr: IA32_MISC_ENABLE,
        read: |_| MISC_ENABLE_VALUE,
        write: |_, value| {
            if value == MISC_ENABLE_VALUE {
                Ok(())
            } else {
                Err(TerminateReason::MsrValueRejected {
                    msr: IA32_MISC_ENABLE,
                    value,
                })
            }
        },
    },
];

fn find(msr: u32) -> Option<&'static MsrHandler> {
    MSR_HANDLERS.iter().find(|handler| handler.msr == msr)
}

/// Emulates `RDMSR` of `msr`.
pub(crate) fn read(vcpu: &dyn VirtualCpu, msr: u32) -> Result<u64, TerminateReason> {
    let handler = find(msr).ok_or(TerminateReason::UnknownMsr { msr, write: false })?;
    Ok((handler.read)(vcpu))
}

/// Emulates `WRMSR` of `value` to `msr`.
pub(crate) fn write(vcpu: &dyn VirtualCpu, msr: u32, value: u64) -> Result<(), TerminateReason> {
    let handler = find(msr).ok_or(TerminateReason::UnknownMsr { msr, write: true })?;
    (handler.write)(vcpu, value)
}
