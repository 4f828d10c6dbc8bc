//! The host virtualization capability the core is built on.
//!
//! Everything that talks to the hypervisor of the host OS goes through the two
//! traits in this module, so that the core can run against Hypervisor.framework
//! on macOS and against a scripted implementation in tests.

use core::marker::PhantomData;

use crate::hypervisor::{error::HostError, registers::GuestRegister};

/// An identifier of a vCPU, valid process wide.
pub type VcpuId = u32;

/// Access permissions of a guest-physical mapping.
#[derive(
    Clone, Copy, Debug, Default, PartialEq, Eq, derive_more::BitOr, derive_more::BitAnd,
)]
pub struct MemoryFlags(pub u64);

impl MemoryFlags {
    /// No access.
    pub const NONE: Self = Self(0);
    /// `HV_MEMORY_READ`
    pub const READ: Self = Self(1 << 0);
    /// `HV_MEMORY_WRITE`
    pub const WRITE: Self = Self(1 << 1);
    /// `HV_MEMORY_EXEC`
    pub const EXEC: Self = Self(1 << 2);
    /// Read, write and execute.
    pub const ALL: Self = Self(Self::READ.0 | Self::WRITE.0 | Self::EXEC.0);

    /// Converts a `vm_prot_t` value of the host into flags. The low three
    /// bits of both encodings match.
    pub fn from_protection(protection: i32) -> Self {
        Self(protection as u64 & Self::ALL.0)
    }

    /// Tests whether all bits in `other` are set.
    pub fn contains(self, other: Self) -> bool {
        self.0 & other.0 == other.0
    }

    /// Tests whether no access is permitted.
    pub fn is_empty(self) -> bool {
        self.0 == 0
    }
}

/// A contiguous range of host virtual memory with a single protection.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct HostRegion {
    /// The start address, page aligned.
    pub start: u64,
    /// The size in bytes, page aligned.
    pub size: u64,
    /// The current protection of the range.
    pub protection: MemoryFlags,
}

impl HostRegion {
    /// Returns the end address (exclusive).
    pub fn end(&self) -> u64 {
        self.start + self.size
    }

    /// Tests whether `address..address + len` lies within this region.
    pub fn contains(&self, address: u64, len: u64) -> bool {
        address >= self.start && address.saturating_add(len) <= self.end()
    }
}

/// VMX capability words reported by the host.
#[derive(Clone, Copy, Debug, PartialEq, Eq, derive_more::Display)]
#[repr(u32)]
pub enum VmxCapability {
    /// Pin-based VM-execution controls.
    PinBased = 0,
    /// Primary processor-based VM-execution controls.
    ProcessorBased = 1,
    /// Secondary processor-based VM-execution controls.
    ProcessorBased2 = 2,
    /// VM-entry controls.
    VmEntry = 3,
}

/// A set of host API to manage a VM. Only one VM may exist per process, and
/// every method here operates on that VM.
pub trait HostVirtualization: Send + Sync + 'static {
    /// The vCPU type. It is bound to the thread that created it.
    type Vcpu: VirtualCpu;

    /// Creates the VM of this process.
    fn create_vm(&self) -> Result<(), HostError>;

    /// Destroys the VM of this process.
    fn destroy_vm(&self) -> Result<(), HostError>;

    /// Maps `size` bytes of host memory at `host_va` into the guest-physical
    /// address space at `gpa`.
    fn map(&self, host_va: u64, gpa: u64, size: u64, flags: MemoryFlags)
    -> Result<(), HostError>;

    /// Unmaps `size` bytes of guest-physical memory at `gpa`.
    fn unmap(&self, gpa: u64, size: u64) -> Result<(), HostError>;

    /// Creates an additional guest-physical address space.
    fn create_space(&self) -> Result<u32, HostError> {
        Err(HostError::Unsupported)
    }

    /// Maps host memory into the address space `asid`.
    fn map_in_space(
        &self,
        asid: u32,
        host_va: u64,
        gpa: u64,
        size: u64,
        flags: MemoryFlags,
    ) -> Result<(), HostError> {
        let _ = (asid, host_va, gpa, size, flags);
        Err(HostError::Unsupported)
    }

    /// Enumerates the virtual memory regions of this process in ascending
    /// order of address.
    fn regions(&self) -> Result<Vec<HostRegion>, HostError>;

    /// Reads a VMX capability word.
    fn read_capability(&self, capability: VmxCapability) -> Result<u64, HostError>;

    /// Creates a vCPU bound to the calling thread.
    fn create_vcpu(&self) -> Result<Self::Vcpu, HostError>;

    /// Forces the given vCPUs to exit to the host. May be called from any
    /// thread.
    fn interrupt(&self, vcpus: &[VcpuId]) -> Result<(), HostError>;
}

/// A vCPU. It can only be used on the thread that created it, and is
/// destroyed when dropped.
pub trait VirtualCpu {
    /// Returns the process-wide identifier of this vCPU.
    fn id(&self) -> VcpuId;

    /// Reads a register.
    fn read_register(&self, register: GuestRegister) -> Result<u64, HostError>;

    /// Writes a register.
    fn write_register(&self, register: GuestRegister, value: u64) -> Result<(), HostError>;

    /// Reads a VMCS field.
    fn read_vmcs(&self, field: u32) -> Result<u64, HostError>;

    /// Writes a VMCS field.
    fn write_vmcs(&self, field: u32, value: u64) -> Result<(), HostError>;

    /// Lets the guest access `msr` without causing VM-exits.
    fn enable_native_msr(&self, msr: u32, enable: bool) -> Result<(), HostError>;

    /// Runs the guest until the next VM-exit.
    fn run(&mut self) -> Result<(), HostError>;
}

/// A marker making a type neither `Send` nor `Sync`.
pub(crate) type ThreadBound = PhantomData<*const ()>;
