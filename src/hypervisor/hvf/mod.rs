//! The Hypervisor.framework backend.

mod ffi;

use core::ffi::c_void;

use crate::hypervisor::{
    error::HostError,
    host::{
        HostRegion, HostVirtualization, MemoryFlags, ThreadBound, VcpuId, VirtualCpu,
        VmxCapability,
    },
    registers::GuestRegister,
};

/// The host virtualization capability provided by Hypervisor.framework.
///
/// The process needs the `com.apple.security.hypervisor` entitlement.
#[derive(Debug, Default, Clone, Copy)]
pub struct HypervisorFramework;

impl HostVirtualization for HypervisorFramework {
    type Vcpu = HvfVcpu;

    fn create_vm(&self) -> Result<(), HostError> {
        // SAFETY: FFI call without pointers.
        HostError::check(unsafe { ffi::hv_vm_create(ffi::HV_VM_DEFAULT) })
    }

    fn destroy_vm(&self) -> Result<(), HostError> {
        // SAFETY: FFI call without pointers.
        HostError::check(unsafe { ffi::hv_vm_destroy() })
    }

    fn map(
        &self,
        host_va: u64,
        gpa: u64,
        size: u64,
        flags: MemoryFlags,
    ) -> Result<(), HostError> {
        // SAFETY: The framework validates the range; the caller keeps the host
        // memory alive while it is mapped.
        HostError::check(unsafe {
            ffi::hv_vm_map(host_va as *const c_void, gpa, size as usize, flags.0)
        })
    }

    fn unmap(&self, gpa: u64, size: u64) -> Result<(), HostError> {
        // SAFETY: FFI call without pointers.
        HostError::check(unsafe { ffi::hv_vm_unmap(gpa, size as usize) })
    }

    fn create_space(&self) -> Result<u32, HostError> {
        let mut asid = 0;
        // SAFETY: `asid` is a valid out pointer.
        HostError::check(unsafe { ffi::hv_vm_space_create(&mut asid) })?;
        Ok(asid)
    }

    fn map_in_space(
        &self,
        asid: u32,
        host_va: u64,
        gpa: u64,
        size: u64,
        flags: MemoryFlags,
    ) -> Result<(), HostError> {
        // SAFETY: See `map`.
        HostError::check(unsafe {
            ffi::hv_vm_map_space(asid, host_va as *const c_void, gpa, size as usize, flags.0)
        })
    }

    fn regions(&self) -> Result<Vec<HostRegion>, HostError> {
        let mut regions = Vec::new();
        let mut address = 1u64;
        loop {
            let mut size = 0u64;
            let mut info = ffi::RegionBasicInfo64::default();
            let mut count = ffi::VM_REGION_BASIC_INFO_COUNT_64;
            let mut object = 0;
            // SAFETY: All pointers are valid out pointers and `count` matches
            // the size of `info`.
            let status = unsafe {
                ffi::mach_vm_region(
                    ffi::mach_task_self_,
                    &mut address,
                    &mut size,
                    ffi::VM_REGION_BASIC_INFO_64,
                    &mut info,
                    &mut count,
                    &mut object,
                )
            };
            // KERN_INVALID_ADDRESS past the last region ends the walk.
            if status != 0 {
                break;
            }
            let protection = MemoryFlags::from_protection(info.protection);
            if !protection.is_empty() {
                regions.push(HostRegion {
                    start: address,
                    size,
                    protection,
                });
            }
            address += size;
        }
        log::debug!("Found {} accessible host regions", regions.len());
        Ok(regions)
    }

    fn read_capability(&self, capability: VmxCapability) -> Result<u64, HostError> {
        let mut value = 0;
        // SAFETY: `value` is a valid out pointer.
        HostError::check(unsafe { ffi::hv_vmx_read_capability(capability as u32, &mut value) })?;
        Ok(value)
    }

    fn create_vcpu(&self) -> Result<HvfVcpu, HostError> {
        let mut id = 0;
        // SAFETY: `id` is a valid out pointer.
        HostError::check(unsafe { ffi::hv_vcpu_create(&mut id, ffi::HV_VCPU_DEFAULT) })?;
        Ok(HvfVcpu {
            id,
            _thread: ThreadBound::default(),
        })
    }

    fn interrupt(&self, vcpus: &[VcpuId]) -> Result<(), HostError> {
        // SAFETY: The slice is valid for `len` elements.
        HostError::check(unsafe { ffi::hv_vcpu_interrupt(vcpus.as_ptr(), vcpus.len() as u32) })
    }
}

/// A vCPU of Hypervisor.framework. It is bound to the creating thread.
#[derive(Debug)]
pub struct HvfVcpu {
    id: ffi::hv_vcpuid_t,
    _thread: ThreadBound,
}

impl VirtualCpu for HvfVcpu {
    fn id(&self) -> VcpuId {
        self.id
    }

    fn read_register(&self, register: GuestRegister) -> Result<u64, HostError> {
        let mut value = 0;
        // SAFETY: `value` is a valid out pointer.
        HostError::check(unsafe {
            ffi::hv_vcpu_read_register(self.id, register as u32, &mut value)
        })?;
        Ok(value)
    }

    fn write_register(&self, register: GuestRegister, value: u64) -> Result<(), HostError> {
        // SAFETY: FFI call without pointers.
        HostError::check(unsafe { ffi::hv_vcpu_write_register(self.id, register as u32, value) })
    }

    fn read_vmcs(&self, field: u32) -> Result<u64, HostError> {
        let mut value = 0;
        // SAFETY: `value` is a valid out pointer.
        HostError::check(unsafe { ffi::hv_vmx_vcpu_read_vmcs(self.id, field, &mut value) })?;
        Ok(value)
    }

    fn write_vmcs(&self, field: u32, value: u64) -> Result<(), HostError> {
        // SAFETY: FFI call without pointers.
        HostError::check(unsafe { ffi::hv_vmx_vcpu_write_vmcs(self.id, field, value) })
    }

    fn enable_native_msr(&self, msr: u32, enable: bool) -> Result<(), HostError> {
        // SAFETY: FFI call without pointers.
        HostError::check(unsafe { ffi::hv_vcpu_enable_native_msr(self.id, msr, enable) })
    }

    fn run(&mut self) -> Result<(), HostError> {
        // SAFETY: FFI call without pointers. The vCPU belongs to this thread.
        HostError::check(unsafe { ffi::hv_vcpu_run(self.id) })
    }
}

impl Drop for HvfVcpu {
    fn drop(&mut self) {
        // SAFETY: FFI call without pointers. The vCPU belongs to this thread.
        if let Err(err) = HostError::check(unsafe { ffi::hv_vcpu_destroy(self.id) }) {
            log::error!("Could not destroy vCPU {}: {err}", self.id);
        }
    }
}
