//! VMX specific pieces: control-word negotiation, the initial guest state and
//! decoding of VM-exit information.

pub(crate) mod capability;
pub(crate) mod exit_qualification;
pub(crate) mod guest;
pub(crate) mod vmcs;
