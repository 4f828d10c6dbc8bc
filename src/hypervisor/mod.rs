//! This module implements the platform agnostic hypervisor core, and the
//! Hypervisor.framework backend it runs on.

pub mod diagnostics;
pub mod error;
#[cfg(test)]
mod fake;
pub mod host;
mod intel;
mod msr;
mod paging_structures;
pub mod registers;
mod segment;
mod support;
pub mod vm;
mod vmexit;
pub mod vthread;

pub use intel::{
    capability::negotiate,
    guest::{GuestMode, configure},
};

cfg_if::cfg_if! {
    if #[cfg(all(target_os = "macos", target_arch = "x86_64"))] {
        pub mod hvf;

        /// The host virtualization capability of this platform.
        pub type DefaultHost = hvf::HypervisorFramework;
    }
}
