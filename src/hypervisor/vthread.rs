//! Vthreads: host threads that each run a function as a guest on their own
//! vCPU.
//!
//! A vCPU can only be used by the thread that created it, so the vCPU never
//! leaves the vthread's thread. Other threads reach it through
//! [`InterruptHandle`] only.

use std::{
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
    thread,
};

use x86::bits64::paging::BASE_PAGE_SIZE;

use super::{
    error::Error,
    host::{HostVirtualization, MemoryFlags, VcpuId, VirtualCpu},
    intel::{
        guest::{GuestMode, configure},
        vmcs::write_register,
    },
    registers::{GuestRegister, Registers},
    support::{HostBlock, hlt_stub_address, stack_pages},
    vm::VirtualMachine,
    vmexit,
};

/// The stack size of a vthread unless specified otherwise.
pub const DEFAULT_STACK_SIZE: usize = 10 * BASE_PAGE_SIZE;

/// A function run as a guest. It receives the argument given to
/// [`Builder::spawn`] in RDI; returning from it halts the guest.
pub type Entry = extern "C" fn(u64);

/// How a vthread ended after its guest halted.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct VthreadExit {
    /// The number of VM-exits handled.
    pub exits: u64,
    /// The general purpose registers when the guest halted.
    pub registers: Registers,
}

/// Configures and spawns a vthread, in the manner of
/// [`std::thread::Builder`].
#[derive(Debug)]
pub struct Builder<H: HostVirtualization> {
    vm: Arc<VirtualMachine<H>>,
    name: Option<String>,
    stack_size: usize,
    mode: Option<GuestMode>,
}

impl<H: HostVirtualization> Builder<H> {
    /// Starts configuring a vthread of `vm`.
    pub fn new(vm: &Arc<VirtualMachine<H>>) -> Self {
        Self {
            vm: Arc::clone(vm),
            name: None,
            stack_size: DEFAULT_STACK_SIZE,
            mode: None,
        }
    }

    /// Names the host thread.
    #[must_use]
    pub fn name(mut self, name: String) -> Self {
        self.name = Some(name);
        self
    }

    /// Sets the size of the guest stack. It is rounded down to a multiple of
    /// 8 bytes, then up to whole pages.
    #[must_use]
    pub fn stack_size(mut self, size: usize) -> Self {
        self.stack_size = size;
        self
    }

    /// Sets the initial mode of the guest. Defaults to 64-bit mode with the
    /// page tables of the VM.
    #[must_use]
    pub fn guest_mode(mut self, mode: GuestMode) -> Self {
        self.mode = Some(mode);
        self
    }

    /// Spawns a host thread that runs `entry(arg)` as a guest until it
    /// halts.
    ///
    /// # Errors
    ///
    /// Returns an error if the stack cannot be made visible to the guest or
    /// the host thread cannot be spawned.
    pub fn spawn(self, entry: Entry, arg: u64) -> Result<JoinHandle<H>, Error> {
        let mut stack = HostBlock::new(stack_pages(self.stack_size));
        let top = stack.len() - size_of::<u64>();
        stack.write_u64(top, hlt_stub_address());
        let stack_top = stack.address() + top as u64;

        let flags = MemoryFlags::READ | MemoryFlags::WRITE;
        let gpa = self.vm.share(stack.address(), stack.len() as u64, flags)?;
        log::debug!("Stack {:#x} mapped at {gpa:#x}", stack.address());

        let slot = Arc::new(VcpuSlot::default());
        let vthread = Vthread {
            vm: Arc::clone(&self.vm),
            slot: Arc::clone(&slot),
            mode: self
                .mode
                .unwrap_or(GuestMode::Long { cr3: self.vm.cr3() }),
            entry,
            arg,
            stack,
            stack_top,
        };

        let mut builder = thread::Builder::new();
        if let Some(name) = self.name {
            builder = builder.name(name);
        }
        let thread = builder.spawn(move || vthread.run())?;
        Ok(JoinHandle {
            thread,
            interrupt: InterruptHandle { vm: self.vm, slot },
        })
    }
}

/// The vCPU of a vthread as seen from other threads.
#[derive(Debug, Default)]
struct VcpuSlot {
    /// The vCPU while it exists.
    vcpu: spin::Mutex<Option<VcpuId>>,
    cancelled: AtomicBool,
}

/// Everything the host thread of a vthread owns.
struct Vthread<H: HostVirtualization> {
    vm: Arc<VirtualMachine<H>>,
    slot: Arc<VcpuSlot>,
    mode: GuestMode,
    entry: Entry,
    arg: u64,
    stack: HostBlock,
    /// The address of the return address slot at the top of `stack`.
    stack_top: u64,
}

impl<H: HostVirtualization> Vthread<H> {
    fn run(self) -> Result<VthreadExit, Error> {
        let host = self.vm.host();
        let mut vcpu = host.create_vcpu().map_err(Error::host("hv_vcpu_create"))?;
        configure(host, &vcpu, self.mode, self.vm.config().exception_bitmap);

        let rip = self.entry as usize as u64;
        write_register(&vcpu, GuestRegister::Rip, rip);
        write_register(&vcpu, GuestRegister::Rflags, 0x2);
        write_register(&vcpu, GuestRegister::Rsp, self.stack_top);
        write_register(&vcpu, GuestRegister::Rdi, self.arg);

        *self.slot.vcpu.lock() = Some(vcpu.id());
        log::info!("Running {rip:#x}({:#x}) on vCPU {}", self.arg, vcpu.id());
        let result = vmexit::run(&self.vm, &mut vcpu, &self.slot.cancelled, self.stack_top);
        *self.slot.vcpu.lock() = None;

        match result {
            Ok(exits) => {
                let registers =
                    Registers::capture(&vcpu).map_err(Error::host("hv_vcpu_read_register"))?;
                log::info!("vCPU {} halted", vcpu.id());
                Ok(VthreadExit { exits, registers })
            }
            Err(reason) => Err(Error::Terminated(reason)),
        }
    }
}

impl<H: HostVirtualization> Drop for Vthread<H> {
    fn drop(&mut self) {
        self.vm.unshare(self.stack.address());
    }
}

/// An owned permission to join a vthread, in the manner of
/// [`std::thread::JoinHandle`].
#[derive(Debug)]
pub struct JoinHandle<H: HostVirtualization> {
    thread: thread::JoinHandle<Result<VthreadExit, Error>>,
    interrupt: InterruptHandle<H>,
}

impl<H: HostVirtualization> JoinHandle<H> {
    /// Waits for the vthread to finish. Its vCPU and stack are released by
    /// then.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Terminated`] if the guest did something that is not
    /// emulated, and other errors if the vthread could not run at all.
    pub fn join(self) -> Result<VthreadExit, Error> {
        self.thread.join().map_err(|_| Error::ThreadPanicked)?
    }

    /// Returns a handle to force the vthread out of the guest from another
    /// thread.
    pub fn interrupt_handle(&self) -> InterruptHandle<H> {
        self.interrupt.clone()
    }

    /// Returns the host thread running the vthread.
    pub fn thread(&self) -> &thread::Thread {
        self.thread.thread()
    }

    /// Tests whether the vthread has finished, without blocking.
    pub fn is_finished(&self) -> bool {
        self.thread.is_finished()
    }
}

/// Cancels a vthread from any thread.
#[derive(Debug)]
pub struct InterruptHandle<H: HostVirtualization> {
    vm: Arc<VirtualMachine<H>>,
    slot: Arc<VcpuSlot>,
}

impl<H: HostVirtualization> Clone for InterruptHandle<H> {
    fn clone(&self) -> Self {
        Self {
            vm: Arc::clone(&self.vm),
            slot: Arc::clone(&self.slot),
        }
    }
}

impl<H: HostVirtualization> InterruptHandle<H> {
    /// Forces the vCPU out of the guest and terminates the vthread with
    /// [`crate::TerminateReason::Cancelled`]. Does nothing if the vCPU does
    /// not exist yet or anymore.
    ///
    /// # Errors
    ///
    /// Returns an error if the host refuses to interrupt the vCPU.
    pub fn interrupt(&self) -> Result<(), Error> {
        // Holding the lock keeps the vCPU alive until the request is made.
        let vcpu = self.slot.vcpu.lock();
        let Some(id) = *vcpu else {
            return Ok(());
        };
        self.slot.cancelled.store(true, Ordering::Release);
        self.vm
            .host()
            .interrupt(&[id])
            .map_err(Error::host("hv_vcpu_interrupt"))
    }
}

#[cfg(test)]
mod tests {
    use std::sync::{
        Arc,
        atomic::{AtomicU64, Ordering},
    };

    use x86::{msr::IA32_EFER, vmx::vmcs};

    use super::*;
    use crate::hypervisor::{
        error::TerminateReason,
        fake::{self, Exit, FakeHost, Step, exclusive},
        intel::exit_qualification::ExitReason,
        paging_structures::REMAP_GPA_BASE,
        vm::{AddressSpaceStrategy, VmConfig},
    };

    fn new_vm(strategy: AddressSpaceStrategy) -> Arc<VirtualMachine<FakeHost>> {
        let config = VmConfig::default().strategy(strategy);
        Arc::new(VirtualMachine::new(FakeHost::new(), config).unwrap())
    }

    fn flat_vm() -> Arc<VirtualMachine<FakeHost>> {
        new_vm(AddressSpaceStrategy::FlatIdentity { gigabytes: 4 })
    }

    fn address(entry: Entry) -> u64 {
        entry as usize as u64
    }

    extern "C" fn halt_only(_: u64) {}

    #[test]
    fn halts() {
        let _guard = exclusive();
        let vm = flat_vm();
        let handle = Builder::new(&vm)
            .name("halt".to_owned())
            .spawn(halt_only, 0x1234)
            .unwrap();
        assert_eq!(handle.thread().name(), Some("halt"));

        let exit = handle.join().unwrap();
        assert_eq!(exit.exits, 1);
        assert_eq!(exit.registers.rip, address(halt_only));
        assert_eq!(exit.registers.rdi, 0x1234);
        assert_eq!(exit.registers.rflags, 0x2);
        assert_eq!(exit.registers.rsp % 8, 0);

        // The stack was mapped at its own address and is released.
        let maps = vm.host().maps();
        let stack = maps.last().unwrap();
        assert_eq!(stack.0, stack.1);
        assert_eq!(stack.2, DEFAULT_STACK_SIZE as u64);
        assert!(exit.registers.rsp >= stack.0 && exit.registers.rsp < stack.0 + stack.2);
        assert_eq!(vm.host().unmaps(), [(stack.1, stack.2)]);
    }

    static VALUE_A: AtomicU64 = AtomicU64::new(0);
    static VALUE_B: AtomicU64 = AtomicU64::new(0);

    extern "C" fn store_a(value: u64) {
        VALUE_A.store(value, Ordering::Relaxed);
    }

    extern "C" fn store_b(value: u64) {
        VALUE_B.store(value, Ordering::Relaxed);
    }

    #[test]
    fn mutations_are_visible_after_join() {
        let _guard = exclusive();
        let vm = flat_vm();
        vm.host().script(address(store_a), vec![fake::call_entry()]);
        vm.host().script(address(store_b), vec![fake::call_entry()]);

        let a = Builder::new(&vm).spawn(store_a, 0xaaaa).unwrap();
        let b = Builder::new(&vm).spawn(store_b, 0xbbbb).unwrap();
        assert!(b.join().is_ok());
        assert!(a.join().is_ok());
        assert_eq!(VALUE_A.load(Ordering::Relaxed), 0xaaaa);
        assert_eq!(VALUE_B.load(Ordering::Relaxed), 0xbbbb);
        assert_eq!(vm.host().unmaps().len(), 2);
    }

    extern "C" fn read_efer(_: u64) {}

    #[test]
    fn rdmsr_efer() {
        let _guard = exclusive();
        let vm = flat_vm();
        let steps: Vec<Step> = vec![Box::new(|vcpu| {
            vcpu.set_register(GuestRegister::Rcx, u64::from(IA32_EFER));
            Ok(Exit::new(ExitReason::Rdmsr, 2))
        })];
        vm.host().script(address(read_efer), steps);

        let exit = Builder::new(&vm).spawn(read_efer, 0).unwrap().join().unwrap();
        assert_eq!(exit.exits, 2);
        assert_eq!(exit.registers.rax, 0x500);
        assert_eq!(exit.registers.rdx, 0);
        assert_eq!(exit.registers.rip, address(read_efer) + 2);
    }

    extern "C" fn write_cr4(_: u64) {}

    #[test]
    fn cr4_vmxe_stays_hidden() {
        let _guard = exclusive();
        let vm = flat_vm();
        let shadow = Arc::new(AtomicU64::new(0));
        let observed = Arc::clone(&shadow);
        let steps: Vec<Step> = vec![
            Box::new(|vcpu| {
                vcpu.set_register(GuestRegister::Rax, 0x2020);
                Ok(Exit::new(ExitReason::ControlRegisterAccess, 3).qualification(0x4))
            }),
            Box::new(move |vcpu| {
                observed.store(vcpu.field(vmcs::control::CR4_READ_SHADOW), Ordering::Relaxed);
                Ok(Exit::hlt())
            }),
        ];
        vm.host().script(address(write_cr4), steps);

        assert!(Builder::new(&vm).spawn(write_cr4, 0).unwrap().join().is_ok());
        assert_eq!(shadow.load(Ordering::Relaxed), 0x20);
    }

    extern "C" fn touch_apic_base(_: u64) {}

    #[test]
    fn termination_is_reported() {
        let _guard = exclusive();
        let vm = flat_vm();
        let steps: Vec<Step> = vec![Box::new(|vcpu| {
            vcpu.set_register(GuestRegister::Rcx, 0x1b);
            Ok(Exit::new(ExitReason::Rdmsr, 2))
        })];
        vm.host().script(address(touch_apic_base), steps);

        let result = Builder::new(&vm).spawn(touch_apic_base, 0).unwrap().join();
        assert!(matches!(
            result,
            Err(Error::Terminated(TerminateReason::UnknownMsr {
                msr: 0x1b,
                write: false
            }))
        ));
        assert_eq!(vm.host().unmaps().len(), 1);
    }

    extern "C" fn spin(_: u64) {}

    #[test]
    fn interrupt() {
        let _guard = exclusive();
        let vm = flat_vm();
        let host = vm.host().clone();
        let steps: Vec<Step> = vec![Box::new(move |_| {
            while host.interrupts().is_empty() {
                thread::yield_now();
            }
            Ok(Exit::new(ExitReason::ExternalInterrupt, 0))
        })];
        vm.host().script(address(spin), steps);

        let handle = Builder::new(&vm).spawn(spin, 0).unwrap();
        let interrupt = handle.interrupt_handle();
        while vm.host().interrupts().is_empty() {
            interrupt.interrupt().unwrap();
            thread::yield_now();
        }
        assert!(matches!(
            handle.join(),
            Err(Error::Terminated(TerminateReason::Cancelled))
        ));

        // The vCPU is gone; this is a no-op.
        let count = vm.host().interrupts().len();
        interrupt.interrupt().unwrap();
        assert_eq!(vm.host().interrupts().len(), count);
    }

    #[test]
    fn remapped_stack() {
        let _guard = exclusive();
        let vm = new_vm(AddressSpaceStrategy::HostRegionRemap);
        let exit = Builder::new(&vm)
            .stack_size(3 * BASE_PAGE_SIZE + 8)
            .spawn(halt_only, 0)
            .unwrap()
            .join()
            .unwrap();

        let maps = vm.host().maps();
        let stack = maps.last().unwrap();
        assert!(stack.1 >= REMAP_GPA_BASE);
        assert_eq!(stack.2, 4 * BASE_PAGE_SIZE as u64);
        assert!(exit.registers.rsp >= stack.0 && exit.registers.rsp < stack.0 + stack.2);
        assert_eq!(vm.host().unmaps(), [(stack.1, stack.2)]);
        assert!(!vm.is_mapped(stack.1));
    }

    #[test]
    fn real_mode_guest() {
        let _guard = exclusive();
        let vm = flat_vm();
        let exit = Builder::new(&vm)
            .guest_mode(GuestMode::Real)
            .spawn(halt_only, 7)
            .unwrap()
            .join()
            .unwrap();
        assert_eq!(exit.registers.rdi, 7);
    }
}
