//! Error types shared by the hypervisor core.
//!
//! Three kinds of failures exist. A host framework call that does not succeed
//! is reported as [`HostError`]. Where the caller can still react (VM or vCPU
//! creation, spawning a thread) it is wrapped into [`Error`]; everywhere else
//! it is fatal and the process panics. A guest doing something this runtime
//! does not emulate is a [`TerminateReason`] and only ends the vthread that did
//! it.

use std::io;

use thiserror::Error;

/// A non-success return code of the host virtualization framework.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum HostError {
    /// `HV_ERROR`
    #[error("the operation was unsuccessful")]
    Error,

    /// `HV_BUSY`
    #[error("the operation was unsuccessful because the resource is busy")]
    Busy,

    /// `HV_BAD_ARGUMENT`
    #[error("the operation was unsuccessful because an argument was invalid")]
    BadArgument,

    /// `HV_NO_RESOURCES`
    #[error("the operation was unsuccessful because of insufficient resources")]
    NoResources,

    /// `HV_NO_DEVICE`
    #[error("the operation was unsuccessful because no VM or vCPU was available")]
    NoDevice,

    /// `HV_UNSUPPORTED`
    #[error("the operation is not supported")]
    Unsupported,

    /// Any other code, including `kern_return_t` values from Mach calls.
    #[error("the operation failed with code {0:#x}")]
    Unknown(u32),
}

impl HostError {
    const HV_ERROR: u32 = 0xfae9_4001;
    const HV_BUSY: u32 = 0xfae9_4002;
    const HV_BAD_ARGUMENT: u32 = 0xfae9_4003;
    const HV_NO_RESOURCES: u32 = 0xfae9_4005;
    const HV_NO_DEVICE: u32 = 0xfae9_4006;
    const HV_UNSUPPORTED: u32 = 0xfae9_400f;

    /// Converts a raw return code into `Ok(())` for success (zero) or the
    /// matching error.
    pub fn check(code: u32) -> Result<(), Self> {
        match code {
            0 => Ok(()),
            Self::HV_ERROR => Err(Self::Error),
            Self::HV_BUSY => Err(Self::Busy),
            Self::HV_BAD_ARGUMENT => Err(Self::BadArgument),
            Self::HV_NO_RESOURCES => Err(Self::NoResources),
            Self::HV_NO_DEVICE => Err(Self::NoDevice),
            Self::HV_UNSUPPORTED => Err(Self::Unsupported),
            other => Err(Self::Unknown(other)),
        }
    }

    /// Returns the raw return code this error was made from.
    pub fn code(self) -> u32 {
        match self {
            Self::Error => Self::HV_ERROR,
            Self::Busy => Self::HV_BUSY,
            Self::BadArgument => Self::HV_BAD_ARGUMENT,
            Self::NoResources => Self::HV_NO_RESOURCES,
            Self::NoDevice => Self::HV_NO_DEVICE,
            Self::Unsupported => Self::HV_UNSUPPORTED,
            Self::Unknown(code) => code,
        }
    }
}

/// Why the run loop of a vthread stopped without the guest reaching `HLT`.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TerminateReason {
    /// The guest read or wrote an MSR that is neither passed through nor
    /// emulated.
    #[error("{} of unknown MSR {msr:#x}", access_kind(.write))]
    UnknownMsr { msr: u32, write: bool },

    /// The guest wrote a value an emulated MSR does not accept.
    #[error("MSR {msr:#x} does not accept {value:#x}")]
    MsrValueRejected { msr: u32, value: u64 },

    /// The guest accessed CR8.
    #[error("CR8 access is not supported")]
    Cr8Access,

    /// The guest accessed CR0 or CR4 in a way other than `MOV to CR`.
    #[error("CR{cr} access type {access} is not supported")]
    UnsupportedCrAccess { cr: u8, access: u8 },

    /// The guest accessed a control register that is not intercepted on purpose.
    #[error("access to CR{0} is not supported")]
    UnsupportedControlRegister(u8),

    /// The exit reason has no handler.
    #[error("unhandled VM-exit reason {reason}")]
    UnhandledExit { reason: u32 },

    /// An exception or NMI intercepted through the exception bitmap.
    #[error("guest exception #{vector} (error code {error_code:#x?})")]
    GuestException { vector: u8, error_code: Option<u32> },

    /// The guest triple faulted.
    #[error("guest triple fault")]
    TripleFault,

    /// EPT violations keep occurring at the same guest-physical address.
    #[error("{count} consecutive EPT violations at {gpa:#x}")]
    RepeatedEptViolation { gpa: u64, count: u32 },

    /// The vthread was interrupted through its [`crate::InterruptHandle`].
    #[error("cancelled")]
    Cancelled,

    /// The configured maximum number of VM-exits was handled.
    #[error("exit limit of {0} reached")]
    ExitLimitReached(u64),
}

/// Errors reported to callers of this crate.
#[derive(Debug, Error)]
pub enum Error {
    /// A host framework call failed.
    #[error("{operation} failed")]
    Host {
        operation: &'static str,
        #[source]
        source: HostError,
    },

    /// A virtual machine already exists in this process.
    #[error("only one virtual machine can exist per process")]
    VmAlreadyExists,

    /// A [`crate::VmConfig`] value is out of range.
    #[error("invalid configuration: {0}")]
    InvalidConfig(&'static str),

    /// The guest page-table pool has no free page left.
    #[error("guest page-table pool is exhausted")]
    TablePoolExhausted,

    /// A mapping request overlaps with an existing guest-physical mapping.
    #[error("{gpa:#x}+{size:#x} overlaps an existing mapping")]
    RegionOverlap { gpa: u64, size: u64 },

    /// The host thread for a vthread could not be spawned.
    #[error("could not spawn the vthread")]
    ThreadSpawn(#[from] io::Error),

    /// The host thread for a vthread panicked.
    #[error("the vthread panicked")]
    ThreadPanicked,

    /// The vthread was terminated before it halted.
    #[error("the vthread was terminated: {0}")]
    Terminated(TerminateReason),
}

fn access_kind(write: &bool) -> &'static str {
    if *write { "write" } else { "read" }
}

impl Error {
    pub(crate) fn host(operation: &'static str) -> impl FnOnce(HostError) -> Self {
        move |source| Self::Host { operation, source }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn host_error_codes() {
        assert_eq!(HostError::check(0), Ok(()));
        assert_eq!(HostError::check(0xfae9_4001), Err(HostError::Error));
        assert_eq!(HostError::check(0xfae9_400f), Err(HostError::Unsupported));
        assert_eq!(HostError::check(5), Err(HostError::Unknown(5)));
        assert_eq!(HostError::NoDevice.code(), 0xfae9_4006);
        assert_eq!(HostError::Unknown(0x10).code(), 0x10);
    }

    #[test]
    fn messages() {
        let reason = TerminateReason::UnknownMsr { msr: 0x1b, write: true };
        assert_eq!(reason.to_string(), "write of unknown MSR 0x1b");

        let err = Error::Terminated(TerminateReason::Cr8Access);
        assert_eq!(
            err.to_string(),
            "the vthread was terminated: CR8 access is not supported"
        );
    }
}
