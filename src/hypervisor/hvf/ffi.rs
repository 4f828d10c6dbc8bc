//! Declarations of the Hypervisor.framework and Mach C ABI used by the
//! backend.

#![allow(non_camel_case_types)]

use core::ffi::c_void;

pub(super) type hv_return_t = u32;
pub(super) type hv_vcpuid_t = u32;
pub(super) type hv_memory_flags_t = u64;
pub(super) type kern_return_t = i32;
pub(super) type mach_port_t = u32;

pub(super) const HV_VM_DEFAULT: u64 = 0;
pub(super) const HV_VCPU_DEFAULT: u64 = 0;

pub(super) const VM_REGION_BASIC_INFO_64: i32 = 9;
pub(super) const VM_REGION_BASIC_INFO_COUNT_64: u32 = 9;

/// `vm_region_basic_info_data_64_t`
#[repr(C, packed(4))]
#[derive(Debug, Default, Clone, Copy)]
pub(super) struct RegionBasicInfo64 {
    pub(super) protection: i32,
    pub(super) max_protection: i32,
    pub(super) inheritance: u32,
    pub(super) shared: u32,
    pub(super) reserved: u32,
    pub(super) offset: u64,
    pub(super) behavior: i32,
    pub(super) user_wired_count: u16,
}

#[link(name = "Hypervisor", kind = "framework")]
unsafe extern "C" {
    pub(super) fn hv_vm_create(flags: u64) -> hv_return_t;
    pub(super) fn hv_vm_destroy() -> hv_return_t;
    pub(super) fn hv_vm_map(
        uva: *const c_void,
        gpa: u64,
        size: usize,
        flags: hv_memory_flags_t,
    ) -> hv_return_t;
    pub(super) fn hv_vm_unmap(gpa: u64, size: usize) -> hv_return_t;
    pub(super) fn hv_vm_space_create(asid: *mut u32) -> hv_return_t;
    pub(super) fn hv_vm_map_space(
        asid: u32,
        uva: *const c_void,
        gpa: u64,
        size: usize,
        flags: hv_memory_flags_t,
    ) -> hv_return_t;

    pub(super) fn hv_vcpu_create(vcpu: *mut hv_vcpuid_t, flags: u64) -> hv_return_t;
    pub(super) fn hv_vcpu_destroy(vcpu: hv_vcpuid_t) -> hv_return_t;
    pub(super) fn hv_vcpu_run(vcpu: hv_vcpuid_t) -> hv_return_t;
    pub(super) fn hv_vcpu_interrupt(vcpus: *const hv_vcpuid_t, vcpu_count: u32) -> hv_return_t;
    pub(super) fn hv_vcpu_read_register(
        vcpu: hv_vcpuid_t,
        reg: u32,
        value: *mut u64,
    ) -> hv_return_t;
    pub(super) fn hv_vcpu_write_register(vcpu: hv_vcpuid_t, reg: u32, value: u64)
    -> hv_return_t;
    pub(super) fn hv_vcpu_enable_native_msr(
        vcpu: hv_vcpuid_t,
        msr: u32,
        enable: bool,
    ) -> hv_return_t;

    pub(super) fn hv_vmx_read_capability(field: u32, value: *mut u64) -> hv_return_t;
    pub(super) fn hv_vmx_vcpu_read_vmcs(
        vcpu: hv_vcpuid_t,
        field: u32,
        value: *mut u64,
    ) -> hv_return_t;
    pub(super) fn hv_vmx_vcpu_write_vmcs(vcpu: hv_vcpuid_t, field: u32, value: u64)
    -> hv_return_t;
}

unsafe extern "C" {
    pub(super) static mach_task_self_: mach_port_t;

    pub(super) fn mach_vm_region(
        target_task: mach_port_t,
        address: *mut u64,
        size: *mut u64,
        flavor: i32,
        info: *mut RegionBasicInfo64,
        info_count: *mut u32,
        object_name: *mut mach_port_t,
    ) -> kern_return_t;
}
