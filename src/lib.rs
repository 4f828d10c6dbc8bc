//! Runs functions of the current process as guests ("vthreads") on Intel VT-x
//! through macOS Hypervisor.framework.
//!
//! A [`VirtualMachine`] maps the memory of this process into the guest, so
//! that a guest sees the same code and data at the same linear addresses as
//! the host. Each vthread is a host thread owning one vCPU, which runs a
//! function until it returns (and executes `HLT`) or does something that is
//! not emulated.
//!
//! ```no_run
//! # #[cfg(all(target_os = "macos", target_arch = "x86_64"))]
//! # fn main() -> Result<(), vthread::Error> {
//! use std::sync::Arc;
//! use vthread::{Builder, HypervisorFramework, VirtualMachine, VmConfig};
//!
//! extern "C" fn guest(value: u64) {
//!     let _ = value * 2;
//! }
//!
//! let vm = Arc::new(VirtualMachine::new(HypervisorFramework, VmConfig::default())?);
//! let exit = Builder::new(&vm).spawn(guest, 21)?.join()?;
//! println!("Halted after {} VM-exits", exit.exits);
//! # Ok(())
//! # }
//! # #[cfg(not(all(target_os = "macos", target_arch = "x86_64")))]
//! # fn main() {}
//! ```

pub mod hypervisor;

pub use hypervisor::{
    GuestMode, configure,
    diagnostics::{dump_state, hexdump},
    error::{Error, HostError, TerminateReason},
    host::{HostRegion, HostVirtualization, MemoryFlags, VcpuId, VirtualCpu, VmxCapability},
    negotiate,
    registers::{GuestRegister, Registers},
    vm::{AddressSpaceStrategy, VirtualMachine, VmConfig},
    vthread::{Builder, Entry, InterruptHandle, JoinHandle, VthreadExit},
};

#[cfg(all(target_os = "macos", target_arch = "x86_64"))]
pub use hypervisor::hvf::{HvfVcpu, HypervisorFramework};

#[cfg(test)]
#[ctor::ctor]
fn init_test_logger() {
    let _ = env_logger::builder().is_test(true).try_init();
}
