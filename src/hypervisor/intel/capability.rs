use crate::hypervisor::host::{HostVirtualization, VmxCapability};

/// Returns a value for a VMX control field that satisfies `capability`, with
/// as many of `desired` bits set as permitted.
///
/// The low 32 bits of a capability word are the bits that must be 1 (allowed
/// 0-settings are cleared), and the high 32 bits are the bits that may be 1.
/// The below summarizes the interpretation:
///
/// ```text
///        Lower bits (must be 1) Higher bits (may be 1) Meaning
/// Bit X  0                      1                      The bit X is flexible
/// Bit X  0                      0                      The bit X is fixed to 0
/// Bit X  1                      1                      The bit X is fixed to 1
/// ```
///
/// See: A.3.1 Pin-Based VM-Execution Controls
pub fn negotiate(capability: u64, desired: u64) -> u64 {
    (desired | (capability & 0xffff_ffff)) & (capability >> 32)
}

/// Reads `capability` from the host and negotiates `desired` against it.
///
/// Capability words are read once per vCPU configuration. A failure to read
/// one means the host cannot run VMX guests at all and is fatal.
pub(crate) fn negotiate_with<H: HostVirtualization>(
    host: &H,
    capability: VmxCapability,
    desired: u64,
) -> u64 {
    let word = host
        .read_capability(capability)
        .unwrap_or_else(|err| panic!("Could not read the {capability} capability: {err}"));
    let effective = negotiate(word, desired);
    if effective & desired != desired {
        log::debug!(
            "{capability}: requested {desired:#x?} but only {:#x?} is permitted",
            effective & desired
        );
    }
    effective
}
