//! A scripted host used by unit tests.
//!
//! Guests never execute here. Instead, each vCPU plays back a list of
//! [`Step`]s registered for its entry point; a step may inspect and change
//! the vCPU and then reports the VM-exit the guest "caused". A vCPU without
//! a script halts on its first run.

use std::{
    cell::RefCell,
    collections::{HashMap, HashSet, VecDeque},
    sync::{
        Arc, Mutex, MutexGuard, PoisonError,
        atomic::{AtomicBool, AtomicU32, Ordering},
    },
};

use x86::vmx::vmcs;

use super::{
    error::HostError,
    host::{HostRegion, HostVirtualization, MemoryFlags, ThreadBound, VcpuId, VirtualCpu, VmxCapability},
    intel::exit_qualification::ExitReason,
    registers::GuestRegister,
};

/// Capability words of a typical Intel processor, indexed by
/// [`VmxCapability`].
pub(crate) const CAPABILITIES: [u64; 4] = [
    0x0000_007f_0000_0016,
    0xfff9_fffe_0401_e172,
    0x0037_7bff_0000_0000,
    0x0000_ffff_0000_11ff,
];

/// The host region [`FakeHost::new`] reports.
const DEFAULT_REGION: HostRegion = HostRegion {
    start: 0x1000_0000,
    size: 0x20_0000,
    protection: MemoryFlags::ALL,
};

/// A VM-exit reported by a [`Step`].
#[derive(Clone, Copy, Debug, Default)]
pub(crate) struct Exit {
    pub(crate) reason: u16,
    pub(crate) qualification: u64,
    pub(crate) instruction_length: u64,
    pub(crate) gpa: u64,
    pub(crate) interruption_info: u32,
}

impl Exit {
    pub(crate) fn new(reason: ExitReason, instruction_length: u64) -> Self {
        Self {
            reason: reason as u16,
            instruction_length,
            ..Self::default()
        }
    }

    pub(crate) fn hlt() -> Self {
        Self::new(ExitReason::Hlt, 1)
    }

    pub(crate) fn qualification(mut self, qualification: u64) -> Self {
        self.qualification = qualification;
        self
    }

    pub(crate) fn gpa(mut self, gpa: u64) -> Self {
        self.gpa = gpa;
        self
    }

    pub(crate) fn interruption_info(mut self, info: u32) -> Self {
        self.interruption_info = info;
        self
    }
}

/// What a guest does until its next VM-exit.
pub(crate) type Step = Box<dyn FnMut(&FakeVcpu) -> Result<Exit, HostError> + Send>;

/// Returns a step that does nothing but cause `exit`.
pub(crate) fn exit(exit: Exit) -> Step {
    Box::new(move |_| Ok(exit))
}

/// Returns a step that calls the entry point at RIP with RDI on the host, as
/// the guest would, and then halts.
pub(crate) fn call_entry() -> Step {
    Box::new(|vcpu| {
        let rip = vcpu.register(GuestRegister::Rip);
        // SAFETY: Tests only register this step for functions of this type.
        let entry: extern "C" fn(u64) = unsafe { core::mem::transmute(rip as usize) };
        entry(vcpu.register(GuestRegister::Rdi));
        Ok(Exit::hlt())
    })
}

#[derive(Default)]
struct State {
    vm_created: AtomicBool,
    next_vcpu: AtomicU32,
    regions: Mutex<Vec<HostRegion>>,
    maps: Mutex<Vec<(u64, u64, u64, MemoryFlags)>>,
    unmaps: Mutex<Vec<(u64, u64)>>,
    interrupts: Mutex<Vec<VcpuId>>,
    scripts: Mutex<HashMap<u64, Vec<Step>>>,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Serializes tests that create a VM, since only one may exist at a time.
pub(crate) fn exclusive() -> MutexGuard<'static, ()> {
    static VM_TESTS: Mutex<()> = Mutex::new(());
    lock(&VM_TESTS)
}

#[derive(Clone)]
pub(crate) struct FakeHost {
    state: Arc<State>,
}

impl core::fmt::Debug for FakeHost {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("FakeHost").finish_non_exhaustive()
    }
}

impl FakeHost {
    pub(crate) fn new() -> Self {
        Self::with_regions(vec![DEFAULT_REGION])
    }

    pub(crate) fn with_regions(regions: Vec<HostRegion>) -> Self {
        let state = State::default();
        *lock(&state.regions) = regions;
        Self {
            state: Arc::new(state),
        }
    }

    /// Makes the next vCPU that starts running at `rip` play back `steps`.
    pub(crate) fn script(&self, rip: u64, steps: Vec<Step>) {
        let _ = lock(&self.state.scripts).insert(rip, steps);
    }

    pub(crate) fn vm_created(&self) -> bool {
        self.state.vm_created.load(Ordering::SeqCst)
    }

    pub(crate) fn maps(&self) -> Vec<(u64, u64, u64, MemoryFlags)> {
        lock(&self.state.maps).clone()
    }

    pub(crate) fn unmaps(&self) -> Vec<(u64, u64)> {
        lock(&self.state.unmaps).clone()
    }

    pub(crate) fn interrupts(&self) -> Vec<VcpuId> {
        lock(&self.state.interrupts).clone()
    }
}

impl HostVirtualization for FakeHost {
    type Vcpu = FakeVcpu;

    fn create_vm(&self) -> Result<(), HostError> {
        if self.state.vm_created.swap(true, Ordering::SeqCst) {
            return Err(HostError::Busy);
        }
        Ok(())
    }

    fn destroy_vm(&self) -> Result<(), HostError> {
        if !self.state.vm_created.swap(false, Ordering::SeqCst) {
            return Err(HostError::NoDevice);
        }
        Ok(())
    }

    fn map(&self, host_va: u64, gpa: u64, size: u64, flags: MemoryFlags) -> Result<(), HostError> {
        lock(&self.state.maps).push((host_va, gpa, size, flags));
        Ok(())
    }

    fn unmap(&self, gpa: u64, size: u64) -> Result<(), HostError> {
        lock(&self.state.unmaps).push((gpa, size));
        Ok(())
    }

    fn regions(&self) -> Result<Vec<HostRegion>, HostError> {
        Ok(lock(&self.state.regions).clone())
    }

    fn read_capability(&self, capability: VmxCapability) -> Result<u64, HostError> {
        Ok(CAPABILITIES[capability as usize])
    }

    fn create_vcpu(&self) -> Result<FakeVcpu, HostError> {
        let id = self.state.next_vcpu.fetch_add(1, Ordering::SeqCst);
        let mut vcpu = FakeVcpu::standalone();
        vcpu.id = id;
        vcpu.state = Some(Arc::clone(&self.state));
        Ok(vcpu)
    }

    fn interrupt(&self, vcpus: &[VcpuId]) -> Result<(), HostError> {
        lock(&self.state.interrupts).extend_from_slice(vcpus);
        Ok(())
    }
}

/// A vCPU of [`FakeHost`].
pub(crate) struct FakeVcpu {
    id: VcpuId,
    state: Option<Arc<State>>,
    vmcs: RefCell<HashMap<u32, u64>>,
    registers: RefCell<HashMap<GuestRegister, u64>>,
    native_msrs: RefCell<Vec<u32>>,
    rejected: RefCell<HashSet<u32>>,
    script: Option<VecDeque<Step>>,
    _thread: ThreadBound,
}

impl core::fmt::Debug for FakeVcpu {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("FakeVcpu").field("id", &self.id).finish_non_exhaustive()
    }
}

/// Registers that are backed by VMCS fields, as on real hardware.
fn vmcs_alias(register: GuestRegister) -> Option<u32> {
    match register {
        GuestRegister::Rip => Some(vmcs::guest::RIP),
        GuestRegister::Rsp => Some(vmcs::guest::RSP),
        GuestRegister::Rflags => Some(vmcs::guest::RFLAGS),
        GuestRegister::Cr0 => Some(vmcs::guest::CR0),
        GuestRegister::Cr3 => Some(vmcs::guest::CR3),
        GuestRegister::Cr4 => Some(vmcs::guest::CR4),
        _ => None,
    }
}

impl FakeVcpu {
    /// Returns a vCPU that belongs to no host and never runs a script.
    pub(crate) fn standalone() -> Self {
        Self {
            id: 0,
            state: None,
            vmcs: RefCell::default(),
            registers: RefCell::default(),
            native_msrs: RefCell::default(),
            rejected: RefCell::default(),
            script: None,
            _thread: ThreadBound::default(),
        }
    }

    /// Makes every access to `field` fail.
    pub(crate) fn reject_field(&self, field: u32) {
        let _ = self.rejected.borrow_mut().insert(field);
    }

    pub(crate) fn native_msrs(&self) -> Vec<u32> {
        self.native_msrs.borrow().clone()
    }

    pub(crate) fn register(&self, register: GuestRegister) -> u64 {
        self.read_register(register).unwrap_or_default()
    }

    pub(crate) fn set_register(&self, register: GuestRegister, value: u64) {
        let _ = self.write_register(register, value);
    }

    pub(crate) fn field(&self, field: u32) -> u64 {
        self.read_vmcs(field).unwrap_or_default()
    }

    fn next_step(&mut self) -> Option<Step> {
        if self.script.is_none() {
            let rip = self.register(GuestRegister::Rip);
            let steps = self
                .state
                .as_ref()
                .and_then(|state| lock(&state.scripts).remove(&rip))
                .unwrap_or_default();
            self.script = Some(steps.into());
        }
        self.script.as_mut().and_then(VecDeque::pop_front)
    }
}

impl VirtualCpu for FakeVcpu {
    fn id(&self) -> VcpuId {
        self.id
    }

    fn read_register(&self, register: GuestRegister) -> Result<u64, HostError> {
        if let Some(field) = vmcs_alias(register) {
            return self.read_vmcs(field);
        }
        Ok(self.registers.borrow().get(&register).copied().unwrap_or_default())
    }

    fn write_register(&self, register: GuestRegister, value: u64) -> Result<(), HostError> {
        if let Some(field) = vmcs_alias(register) {
            return self.write_vmcs(field, value);
        }
        let _ = self.registers.borrow_mut().insert(register, value);
        Ok(())
    }

    fn read_vmcs(&self, field: u32) -> Result<u64, HostError> {
        if self.rejected.borrow().contains(&field) {
            return Err(HostError::BadArgument);
        }
        Ok(self.vmcs.borrow().get(&field).copied().unwrap_or_default())
    }

    fn write_vmcs(&self, field: u32, value: u64) -> Result<(), HostError> {
        if self.rejected.borrow().contains(&field) {
            return Err(HostError::BadArgument);
        }
        let _ = self.vmcs.borrow_mut().insert(field, value);
        Ok(())
    }

    fn enable_native_msr(&self, msr: u32, enable: bool) -> Result<(), HostError> {
        let mut msrs = self.native_msrs.borrow_mut();
        msrs.retain(|&native| native != msr);
        if enable {
            msrs.push(msr);
        }
        Ok(())
    }

    fn run(&mut self) -> Result<(), HostError> {
        let exit = match self.next_step() {
            Some(mut step) => step(self)?,
            None => Exit::hlt(),
        };
        let fields = [
            (vmcs::ro::EXIT_REASON, u64::from(exit.reason)),
            (vmcs::ro::EXIT_QUALIFICATION, exit.qualification),
            (vmcs::ro::VMEXIT_INSTRUCTION_LEN, exit.instruction_length),
            (vmcs::ro::GUEST_PHYSICAL_ADDR_FULL, exit.gpa),
            (vmcs::ro::VMEXIT_INTERRUPTION_INFO, u64::from(exit.interruption_info)),
        ];
        for (field, value) in fields {
            let _ = self.vmcs.borrow_mut().insert(field, value);
        }
        Ok(())
    }
}
