//! The run loop of a vthread: runs the vCPU, handles each VM-exit and
//! decides whether to resume the guest.

use core::sync::atomic::{AtomicBool, Ordering};

use num_traits::FromPrimitive;
use x86::{
    controlregs::{Cr0, Cr4},
    cpuid::{CpuIdResult, cpuid},
    vmx::vmcs::{self, control::EntryControls},
};

use super::{
    diagnostics::{dump_state, hexdump},
    error::TerminateReason,
    host::{HostVirtualization, VcpuId, VirtualCpu},
    intel::{
        exit_qualification::{
            CrAccessQualification, CrAccessType, EptViolationQualification, ExitReason,
            InterruptionInfo,
        },
        guest::{EFER_LMA, EFER_LME},
        vmcs::{read_register, vmread, vmread_relaxed, vmwrite, write_register},
    },
    msr,
    registers::GuestRegister,
    vm::VirtualMachine,
};

/// How the run loop continues after a VM-exit was handled.
#[derive(Clone, Debug, PartialEq, Eq)]
pub(crate) enum ExitOutcome {
    /// Continue after the instruction that caused the VM-exit.
    Resume,
    /// Continue at the same instruction.
    Retry,
    /// The guest halted.
    Halt,
    /// Stop the vthread.
    Terminate(TerminateReason),
}

/// Consecutive EPT violations at one guest-physical address.
#[derive(Debug, Default)]
struct EptTracker {
    gpa: Option<u64>,
    count: u32,
}

struct ExitContext<'a, H: HostVirtualization> {
    vm: &'a VirtualMachine<H>,
    vcpu: &'a H::Vcpu,
    qualification: u64,
    cancelled: &'a AtomicBool,
    ept: &'a mut EptTracker,
}

type ExitHandler<H> = fn(&mut ExitContext<'_, H>) -> ExitOutcome;

fn handler_for<H: HostVirtualization>(reason: ExitReason) -> Option<ExitHandler<H>> {
    let handler: ExitHandler<H> = match reason {
        ExitReason::ExceptionOrNmi => handle_exception_or_nmi,
        ExitReason::ExternalInterrupt => handle_external_interrupt,
        ExitReason::TripleFault => |_| ExitOutcome::Terminate(TerminateReason::TripleFault),
        ExitReason::InterruptWindow => |_| ExitOutcome::Retry,
        ExitReason::Cpuid => handle_cpuid,
        ExitReason::Hlt => |_| ExitOutcome::Halt,
        ExitReason::ControlRegisterAccess => handle_cr_access,
        ExitReason::Rdmsr => handle_rdmsr,
        ExitReason::Wrmsr => handle_wrmsr,
        ExitReason::EptViolation => handle_ept_violation,
        _ => return None,
    };
    Some(handler)
}

/// Runs `vcpu` until the guest halts, and returns the number of VM-exits.
///
/// A guest doing something that is not emulated stops the loop with the
/// reason. A failure of the host to run the vCPU is fatal.
pub(crate) fn run<H: HostVirtualization>(
    vm: &VirtualMachine<H>,
    vcpu: &mut H::Vcpu,
    cancelled: &AtomicBool,
    stack_top: u64,
) -> Result<u64, TerminateReason> {
    let mut ept = EptTracker::default();
    let mut exits = 0;
    loop {
        if vm.config().max_exits.is_some_and(|max| exits >= max) {
            return Err(TerminateReason::ExitLimitReached(exits));
        }
        if cancelled.load(Ordering::Acquire) {
            return Err(TerminateReason::Cancelled);
        }

        if let Err(err) = vcpu.run() {
            log_fatal_state(vm, vcpu, stack_top);
            panic!("hv_vcpu_run failed: {err}");
        }
        exits += 1;

        let vcpu_ref: &H::Vcpu = vcpu;
        let basic = ExitReason::basic(vmread(vcpu_ref, vmcs::ro::EXIT_REASON));
        let qualification = vmread(vcpu_ref, vmcs::ro::EXIT_QUALIFICATION);
        log::trace!(
            "VM-exit {basic} ({qualification:#x?}) at {:#x?}",
            vmread(vcpu_ref, vmcs::guest::RIP)
        );

        let reason = ExitReason::from_u16(basic);
        if reason != Some(ExitReason::EptViolation) {
            ept = EptTracker::default();
        }
        let outcome = match reason.and_then(handler_for::<H>) {
            Some(handler) => handler(&mut ExitContext {
                vm,
                vcpu: vcpu_ref,
                qualification,
                cancelled,
                ept: &mut ept,
            }),
            None => ExitOutcome::Terminate(TerminateReason::UnhandledExit {
                reason: u32::from(basic),
            }),
        };

        match outcome {
            ExitOutcome::Resume => advance_rip(vcpu_ref),
            ExitOutcome::Retry => {}
            ExitOutcome::Halt => {
                log::debug!("Halted after {exits} VM-exits");
                return Ok(exits);
            }
            ExitOutcome::Terminate(reason) => {
                log::warn!("Terminating vCPU {}: {reason}", vcpu_ref.id());
                return Err(reason);
            }
        }
    }
}

fn advance_rip<V: VirtualCpu>(vcpu: &V) {
    let rip = vmread(vcpu, vmcs::guest::RIP);
    let length = vmread(vcpu, vmcs::ro::VMEXIT_INSTRUCTION_LEN);
    vmwrite(vcpu, vmcs::guest::RIP, rip + length);
}

fn log_fatal_state<H: HostVirtualization>(vm: &VirtualMachine<H>, vcpu: &H::Vcpu, stack_top: u64) {
    log::error!("{}", dump_state(vcpu));

    let rip = vmread_relaxed(vcpu, vmcs::guest::RIP);
    if let Some(bytes) = vm.host_bytes(rip, 16) {
        log::error!("Instructions at {rip:#x}:\n{}", hexdump(0, bytes));
    }

    let rsp = vmread_relaxed(vcpu, vmcs::guest::RSP);
    if rsp <= stack_top {
        let len = usize::try_from(stack_top + 8 - rsp).map_or(256, |len| len.min(256));
        if let Some(bytes) = vm.host_bytes(rsp, len) {
            log::error!("Stack at {rsp:#x}:\n{}", hexdump(0, bytes));
        }
    }
}

fn handle_exception_or_nmi<H: HostVirtualization>(ctx: &mut ExitContext<'_, H>) -> ExitOutcome {
    const NMI: u8 = 2;

    let info = InterruptionInfo(vmread(ctx.vcpu, vmcs::ro::VMEXIT_INTERRUPTION_INFO) as u32);
    if info.interruption_type() == NMI {
        return ExitOutcome::Retry;
    }
    let error_code = info
        .error_code_valid()
        .then(|| vmread(ctx.vcpu, vmcs::ro::VMEXIT_INTERRUPTION_ERR_CODE) as u32);
    ExitOutcome::Terminate(TerminateReason::GuestException {
        vector: info.vector(),
        error_code,
    })
}

fn handle_external_interrupt<H: HostVirtualization>(ctx: &mut ExitContext<'_, H>) -> ExitOutcome {
    if ctx.cancelled.load(Ordering::Acquire) {
        ExitOutcome::Terminate(TerminateReason::Cancelled)
    } else {
        ExitOutcome::Retry
    }
}

fn handle_ept_violation<H: HostVirtualization>(ctx: &mut ExitContext<'_, H>) -> ExitOutcome {
    let gpa = vmread(ctx.vcpu, vmcs::ro::GUEST_PHYSICAL_ADDR_FULL);
    let qualification = EptViolationQualification(ctx.qualification);
    log::trace!("EPT violation at {gpa:#x?} ({:#05x}): {qualification}", qualification.flags());

    if !ctx.vm.is_mapped(gpa) {
        log::error!("EPT violation outside of guest memory at {gpa:#x?}: {qualification}");
        return ExitOutcome::Terminate(TerminateReason::UnhandledExit {
            reason: ExitReason::EptViolation as u32,
        });
    }

    // The host populates the mapping on demand; the access is retried.
    if ctx.ept.gpa == Some(gpa) {
        ctx.ept.count += 1;
    } else {
        *ctx.ept = EptTracker {
            gpa: Some(gpa),
            count: 1,
        };
    }
    if ctx.ept.count > ctx.vm.config().ept_retry_limit {
        return ExitOutcome::Terminate(TerminateReason::RepeatedEptViolation {
            gpa,
            count: ctx.ept.count,
        });
    }
    ExitOutcome::Retry
}

fn handle_cr_access<H: HostVirtualization>(ctx: &mut ExitContext<'_, H>) -> ExitOutcome {
    let qualification = CrAccessQualification(ctx.qualification);
    let cr = qualification.cr_number();
    match (cr, qualification.access_type()) {
        (8, _) => return ExitOutcome::Terminate(TerminateReason::Cr8Access),
        (0 | 4, CrAccessType::MovToCr) => {}
        (0 | 4, access) => {
            return ExitOutcome::Terminate(TerminateReason::UnsupportedCrAccess {
                cr,
                access: access as u8,
            });
        }
        (other, _) => {
            return ExitOutcome::Terminate(TerminateReason::UnsupportedControlRegister(other));
        }
    }

    let value = gpr_value(ctx.vcpu, qualification.gpr_index());
    log::trace!("MOV CR{cr}, {value:#x?}");
    if cr == 0 {
        write_cr0(ctx.vcpu, value);
    } else {
        write_cr4(ctx.vcpu, value);
    }
    ExitOutcome::Resume
}

/// Reads the general purpose register encoded as `index` in an exit
/// qualification. RSP is only up to date in the VMCS.
fn gpr_value<V: VirtualCpu>(vcpu: &V, index: u8) -> u64 {
    match GuestRegister::from_gpr_index(index) {
        Some(GuestRegister::Rsp) => vmread(vcpu, vmcs::guest::RSP),
        Some(register) => read_register(vcpu, register),
        None => 0,
    }
}

/// Emulates `MOV CR0, value`, entering or leaving IA-32e mode when the guest
/// toggles paging with `IA32_EFER.LME` set.
fn write_cr0<V: VirtualCpu>(vcpu: &V, value: u64) {
    let pe = Cr0::CR0_PROTECTED_MODE.bits() as u64;
    let pg = Cr0::CR0_ENABLE_PAGING.bits() as u64;
    let ne = Cr0::CR0_NUMERIC_ERROR.bits() as u64;
    let ia32e = u64::from(EntryControls::IA32E_MODE_GUEST.bits());

    vmwrite(vcpu, vmcs::control::CR0_READ_SHADOW, value);
    vmwrite(vcpu, vmcs::guest::CR0, value | ne);

    let efer = vmread(vcpu, vmcs::guest::IA32_EFER_FULL);
    let entry = vmread(vcpu, vmcs::control::VMENTRY_CONTROLS);
    if value & (pe | pg) == (pe | pg) && efer & EFER_LME != 0 {
        vmwrite(vcpu, vmcs::guest::IA32_EFER_FULL, efer | EFER_LMA);
        vmwrite(vcpu, vmcs::control::VMENTRY_CONTROLS, entry | ia32e);
    } else if value & pg == 0 && efer & EFER_LMA != 0 {
        vmwrite(vcpu, vmcs::guest::IA32_EFER_FULL, efer & !EFER_LMA);
        vmwrite(vcpu, vmcs::control::VMENTRY_CONTROLS, entry & !ia32e);
    }
}

/// Emulates `MOV CR4, value`. VMXE stays set and invisible to the guest.
fn write_cr4<V: VirtualCpu>(vcpu: &V, value: u64) {
    let vmxe = Cr4::CR4_ENABLE_VMX.bits() as u64;
    vmwrite(vcpu, vmcs::control::CR4_READ_SHADOW, value & !vmxe);
    vmwrite(vcpu, vmcs::guest::CR4, value | vmxe);
}

fn handle_cpuid<H: HostVirtualization>(ctx: &mut ExitContext<'_, H>) -> ExitOutcome {
    let leaf = read_register(ctx.vcpu, GuestRegister::Rax) as u32;
    let sub_leaf = read_register(ctx.vcpu, GuestRegister::Rcx) as u32;
    let regs = adjust_cpuid(leaf, ctx.vcpu.id(), cpuid!(leaf, sub_leaf));
    log::trace!("CPUID {leaf:#x?} {sub_leaf:#x?} => {regs:x?}");

    write_register(ctx.vcpu, GuestRegister::Rax, u64::from(regs.eax));
    write_register(ctx.vcpu, GuestRegister::Rbx, u64::from(regs.ebx));
    write_register(ctx.vcpu, GuestRegister::Rcx, u64::from(regs.ecx));
    write_register(ctx.vcpu, GuestRegister::Rdx, u64::from(regs.edx));
    ExitOutcome::Resume
}

const EMPTY_CPUID: CpuIdResult = CpuIdResult {
    eax: 0,
    ebx: 0,
    ecx: 0,
    edx: 0,
};

/// Edits the host's answer to CPUID `leaf` into what a guest on vCPU `id`
/// should see.
fn adjust_cpuid(leaf: u32, id: VcpuId, mut regs: CpuIdResult) -> CpuIdResult {
    const HYPERVISOR_PRESENT: u32 = 1 << 31;
    const MONITOR: u32 = 1 << 3;
    const VMX: u32 = 1 << 5;
    const PDCM: u32 = 1 << 15;
    const TSC_ADJUST: u32 = 1 << 1;

    match leaf {
        0x1 => {
            regs.ecx |= HYPERVISOR_PRESENT;
            regs.ecx &= !(MONITOR | VMX | PDCM);
            // One logical processor per package, with the vCPU id as the
            // initial APIC ID.
            regs.ebx = (regs.ebx & 0xffff) | (1 << 16) | ((id & 0xff) << 24);
        }
        0x7 => regs.ebx &= !TSC_ADJUST,
        // No architectural performance monitoring, and no hypervisor
        // interface leaves.
        0xa | 0x4000_0000 => regs = EMPTY_CPUID,
        // Hypervisor features: no MONITOR/MWAIT.
        0x4000_0003 | 0x4000_0103 => regs.edx &= !1,
        _ => {}
    }
    regs
}

fn handle_rdmsr<H: HostVirtualization>(ctx: &mut ExitContext<'_, H>) -> ExitOutcome {
    let msr = read_register(ctx.vcpu, GuestRegister::Rcx) as u32;
    log::trace!("RDMSR {msr:#x?}");
    match msr::read(ctx.vcpu, msr) {
        Ok(value) => {
            write_register(ctx.vcpu, GuestRegister::Rax, value & 0xffff_ffff);
            write_register(ctx.vcpu, GuestRegister::Rdx, value >> 32);
            ExitOutcome::Resume
        }
        Err(reason) => ExitOutcome::Terminate(reason),
    }
}

fn handle_wrmsr<H: HostVirtualization>(ctx: &mut ExitContext<'_, H>) -> ExitOutcome {
    let msr = read_register(ctx.vcpu, GuestRegister::Rcx) as u32;
    let value = (read_register(ctx.vcpu, GuestRegister::Rax) & 0xffff_ffff)
        | ((read_register(ctx.vcpu, GuestRegister::Rdx) & 0xffff_ffff) << 32);
    log::trace!("WRMSR {msr:#x?} {value:#x?}");
    match msr::write(ctx.vcpu, msr, value) {
        Ok(()) => ExitOutcome::Resume,
        Err(reason) => ExitOutcome::Terminate(reason),
    }
}
