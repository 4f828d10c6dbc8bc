//! The process-wide virtual machine and its guest-physical address space.

use x86::bits64::paging::BASE_PAGE_SIZE;

use super::{
    error::Error,
    host::{HostVirtualization, MemoryFlags},
    paging_structures::{GuestPageTables, REMAP_GPA_BASE, plan_remap},
};

/// Whether a virtual machine exists in this process.
static VM_EXISTS: spin::Mutex<bool> = spin::Mutex::new(false);

/// How guest-linear addresses (equal to host-virtual addresses) are turned
/// into guest-physical addresses.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum AddressSpaceStrategy {
    /// Every host region is mapped at the guest-physical address equal to
    /// its host-virtual address, and the guest page tables map the low
    /// `gigabytes` GB 1:1 with 1GB pages.
    FlatIdentity {
        /// The size of the identity mapped range in GB.
        gigabytes: u64,
    },
    /// Every host region is mapped at a freshly assigned guest-physical range
    /// starting at 1GB, and the guest page tables translate each region with
    /// the largest page size it is aligned to.
    HostRegionRemap,
}

/// Configuration of a [`VirtualMachine`].
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct VmConfig {
    /// The address space layout. Fixed for the lifetime of the VM.
    pub strategy: AddressSpaceStrategy,
    /// The number of VM-exits after which a vthread is terminated, if any.
    pub max_exits: Option<u64>,
    /// The number of consecutive EPT violations at one guest-physical
    /// address that are retried before the vthread is terminated.
    pub ept_retry_limit: u32,
    /// Page-table pages reserved for memory shared after construction, such
    /// as vthread stacks. Only used by [`AddressSpaceStrategy::HostRegionRemap`].
    pub spare_table_pages: usize,
    /// Exceptions that cause VM-exits.
    pub exception_bitmap: u32,
}

impl Default for VmConfig {
    fn default() -> Self {
        Self {
            strategy: AddressSpaceStrategy::FlatIdentity { gigabytes: 1 << 17 },
            max_exits: None,
            ept_retry_limit: 10,
            spare_table_pages: 64,
            exception_bitmap: 1 << 14,
        }
    }
}

impl VmConfig {
    /// Sets [`Self::strategy`].
    #[must_use]
    pub fn strategy(mut self, strategy: AddressSpaceStrategy) -> Self {
        self.strategy = strategy;
        self
    }

    /// Caps the number of VM-exits per vthread.
    #[must_use]
    pub fn max_exits(mut self, max_exits: u64) -> Self {
        self.max_exits = Some(max_exits);
        self
    }

    /// Sets [`Self::ept_retry_limit`].
    #[must_use]
    pub fn ept_retry_limit(mut self, limit: u32) -> Self {
        self.ept_retry_limit = limit;
        self
    }

    /// Sets [`Self::spare_table_pages`].
    #[must_use]
    pub fn spare_table_pages(mut self, pages: usize) -> Self {
        self.spare_table_pages = pages;
        self
    }

    /// Sets [`Self::exception_bitmap`].
    #[must_use]
    pub fn exception_bitmap(mut self, bitmap: u32) -> Self {
        self.exception_bitmap = bitmap;
        self
    }
}

/// A range of host memory mapped into the guest-physical address space.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
struct Mapping {
    host_va: u64,
    gpa: u64,
    size: u64,
    flags: MemoryFlags,
    /// The `host_va` passed to [`VirtualMachine::share`] for mappings made
    /// by it, `None` for those made at construction.
    owner: Option<u64>,
}

#[derive(Debug)]
struct AddressSpace {
    tables: GuestPageTables,
    mappings: Vec<Mapping>,
    /// The next guest-physical address to assign in the remap layout.
    next_gpa: u64,
}

/// The virtual machine of this process.
///
/// At most one instance exists at a time; it is destroyed on drop. Vthreads
/// keep it alive through an `Arc`, so it is never destroyed while one of them
/// runs.
#[derive(Debug)]
pub struct VirtualMachine<H: HostVirtualization> {
    host: H,
    config: VmConfig,
    address_space: spin::Mutex<AddressSpace>,
}

impl<H: HostVirtualization> VirtualMachine<H> {
    /// Creates the VM and builds its address space from the memory regions
    /// of this process.
    ///
    /// # Errors
    ///
    /// Returns [`Error::VmAlreadyExists`] if another instance is alive, and
    /// other errors when the host refuses the VM or the configuration cannot
    /// be satisfied. Failures to map memory are fatal.
    pub fn new(host: H, config: VmConfig) -> Result<Self, Error> {
        let mut exists = VM_EXISTS.lock();
        if *exists {
            return Err(Error::VmAlreadyExists);
        }
        host.create_vm().map_err(Error::host("hv_vm_create"))?;

        let address_space = match build_address_space(&host, &config) {
            Ok(address_space) => address_space,
            Err(err) => {
                if let Err(destroy) = host.destroy_vm() {
                    log::error!("Could not destroy the VM: {destroy}");
                }
                return Err(err);
            }
        };
        *exists = true;

        log::info!(
            "Created the VM with {} mappings ({:?})",
            address_space.mappings.len(),
            config.strategy
        );
        Ok(Self {
            host,
            config,
            address_space: spin::Mutex::new(address_space),
        })
    }

    /// The host virtualization capability the VM runs on.
    pub fn host(&self) -> &H {
        &self.host
    }

    /// The configuration the VM was created with.
    pub fn config(&self) -> &VmConfig {
        &self.config
    }

    /// The guest-physical address of the PML4.
    pub fn cr3(&self) -> u64 {
        self.address_space.lock().tables.cr3()
    }

    /// Makes `size` bytes of host memory at `host_va`, both page aligned,
    /// accessible to guests at the same linear address, and returns the
    /// guest-physical address `host_va` is mapped at.
    ///
    /// Pages already mapped, for example because they belong to a host region
    /// mapped when the VM was created, are reused as they are. Only the rest
    /// is mapped, and only that part is reverted by [`Self::unshare`].
    ///
    /// # Errors
    ///
    /// Returns an error if a page would collide with another guest-physical
    /// mapping or no page-table page is left to describe it. Nothing is
    /// mapped then.
    pub fn share(&self, host_va: u64, size: u64, flags: MemoryFlags) -> Result<u64, Error> {
        let page_mask = BASE_PAGE_SIZE as u64 - 1;
        if (host_va | size) & page_mask != 0 || size == 0 {
            return Err(Error::InvalidConfig("shared memory must be page aligned"));
        }

        let mut address_space = self.address_space.lock();
        let pieces = uncovered(&address_space.mappings, host_va, size);
        let remap = self.config.strategy == AddressSpaceStrategy::HostRegionRemap;

        // Assign guest-physical addresses and check them before touching
        // anything.
        let mut next_gpa = address_space.next_gpa;
        let mut planned = Vec::with_capacity(pieces.len());
        for (piece_va, piece_size) in pieces {
            let gpa = if remap {
                next_gpa += piece_size;
                next_gpa - piece_size
            } else {
                piece_va
            };
            if address_space
                .mappings
                .iter()
                .any(|mapping| overlaps(mapping.gpa, mapping.size, gpa, piece_size))
            {
                return Err(Error::RegionOverlap {
                    gpa,
                    size: piece_size,
                });
            }
            planned.push(Mapping {
                host_va: piece_va,
                gpa,
                size: piece_size,
                flags,
                owner: Some(host_va),
            });
        }

        if remap {
            for (index, mapping) in planned.iter().enumerate() {
                if let Err(err) = address_space.tables.map_4k(mapping.host_va, mapping.gpa, mapping.size) {
                    for installed in &planned[..index] {
                        address_space.tables.unmap_4k(installed.host_va, installed.size);
                    }
                    return Err(err);
                }
            }
            address_space.next_gpa = next_gpa;
        }
        for mapping in planned {
            map_or_die(&self.host, mapping.host_va, mapping.gpa, mapping.size, flags);
            log::debug!("Shared {:#x}+{:#x} at {:#x}", mapping.host_va, mapping.size, mapping.gpa);
            address_space.mappings.push(mapping);
        }

        address_space
            .mappings
            .iter()
            .find(|mapping| (mapping.host_va..mapping.host_va + mapping.size).contains(&host_va))
            .map(|mapping| mapping.gpa + (host_va - mapping.host_va))
            .ok_or(Error::RegionOverlap { gpa: host_va, size })
    }

    /// Reverts [`Self::share`] for the range starting at `host_va`. Pages
    /// that were already mapped before are left untouched.
    pub fn unshare(&self, host_va: u64) {
        let mut address_space = self.address_space.lock();
        while let Some(index) = address_space
            .mappings
            .iter()
            .position(|mapping| mapping.owner == Some(host_va))
        {
            let mapping = address_space.mappings.swap_remove(index);
            if self.config.strategy == AddressSpaceStrategy::HostRegionRemap {
                address_space.tables.unmap_4k(mapping.host_va, mapping.size);
            }
            if let Err(err) = self.host.unmap(mapping.gpa, mapping.size) {
                log::error!("{mapping:#x?}");
                panic!("Could not unmap {:#x}: {err}", mapping.gpa);
            }
            log::debug!("Unshared {:#x}+{:#x}", mapping.host_va, mapping.size);
        }
    }

    /// Tests whether `gpa` is backed by any mapping of this VM.
    pub(crate) fn is_mapped(&self, gpa: u64) -> bool {
        self.address_space
            .lock()
            .mappings
            .iter()
            .any(|mapping| (mapping.gpa..mapping.gpa + mapping.size).contains(&gpa))
    }

    /// Returns the host memory at `address..address + len` if the whole range
    /// lies in one readable mapping.
    pub(crate) fn host_bytes(&self, address: u64, len: usize) -> Option<&[u8]> {
        let readable = self.address_space.lock().mappings.iter().any(|mapping| {
            mapping.flags.contains(MemoryFlags::READ)
                && address >= mapping.host_va
                && address.saturating_add(len as u64) <= mapping.host_va + mapping.size
        });
        // SAFETY: The range is mapped host memory that stays mapped for at
        // least as long as the VM.
        readable.then(|| unsafe { core::slice::from_raw_parts(address as *const u8, len) })
    }
}

impl<H: HostVirtualization> Drop for VirtualMachine<H> {
    fn drop(&mut self) {
        if let Err(err) = self.host.destroy_vm() {
            log::error!("Could not destroy the VM: {err}");
        }
        *VM_EXISTS.lock() = false;
        log::info!("Destroyed the VM");
    }
}

/// Returns the parts of `host_va..host_va + size` that no mapping covers on
/// the host side, in ascending order.
fn uncovered(mappings: &[Mapping], host_va: u64, size: u64) -> Vec<(u64, u64)> {
    let mut pieces = vec![(host_va, host_va + size)];
    for mapping in mappings {
        let (start, end) = (mapping.host_va, mapping.host_va + mapping.size);
        pieces = pieces
            .into_iter()
            .flat_map(|(piece_start, piece_end)| {
                if end <= piece_start || piece_end <= start {
                    return vec![(piece_start, piece_end)];
                }
                [(piece_start, start), (end, piece_end)]
                    .into_iter()
                    .filter(|(low, high)| low < high)
                    .collect()
            })
            .collect();
    }
    pieces.sort_unstable();
    pieces
        .into_iter()
        .map(|(start, end)| (start, end - start))
        .collect()
}

fn overlaps(start1: u64, size1: u64, start2: u64, size2: u64) -> bool {
    start1 < start2.saturating_add(size2) && start2 < start1.saturating_add(size1)
}

/// Maps host memory into the guest or panics. A partially built address
/// space cannot be used.
fn map_or_die<H: HostVirtualization>(host: &H, host_va: u64, gpa: u64, size: u64, flags: MemoryFlags) {
    if let Err(err) = host.map(host_va, gpa, size, flags) {
        log::error!("hv_vm_map({host_va:#x}, {gpa:#x}, {size:#x}, {flags:?}) failed");
        panic!("Could not map host memory into the guest: {err}");
    }
}

fn build_address_space<H: HostVirtualization>(
    host: &H,
    config: &VmConfig,
) -> Result<AddressSpace, Error> {
    let regions = host.regions().map_err(Error::host("mach_vm_region"))?;
    let mut mappings = Vec::new();

    let (tables, next_gpa) = match config.strategy {
        AddressSpaceStrategy::FlatIdentity { gigabytes } => {
            let tables = GuestPageTables::flat(gigabytes)?;
            for region in regions.iter().filter(|region| !region.protection.is_empty()) {
                if overlaps(region.start, region.size, 0, tables.size()) {
                    return Err(Error::RegionOverlap {
                        gpa: region.start,
                        size: region.size,
                    });
                }
                map_or_die(host, region.start, region.start, region.size, region.protection);
                mappings.push(Mapping {
                    host_va: region.start,
                    gpa: region.start,
                    size: region.size,
                    flags: region.protection,
                    owner: None,
                });
            }
            (tables, 0)
        }
        AddressSpaceStrategy::HostRegionRemap => {
            let placements = plan_remap(&regions);
            let tables = GuestPageTables::remap(&placements, config.spare_table_pages)?;
            for placement in &placements {
                map_or_die(host, placement.linear, placement.gpa, placement.size, placement.flags);
                mappings.push(Mapping {
                    host_va: placement.linear,
                    gpa: placement.gpa,
                    size: placement.size,
                    flags: placement.flags,
                    owner: None,
                });
            }
            let next_gpa = placements
                .last()
                .map_or(REMAP_GPA_BASE, |placement| placement.gpa + placement.size);
            (tables, next_gpa)
        }
    };

    let flags = MemoryFlags::READ | MemoryFlags::WRITE;
    map_or_die(host, tables.host_address(), 0, tables.size(), flags);
    mappings.push(Mapping {
        host_va: tables.host_address(),
        gpa: 0,
        size: tables.size(),
        flags,
        owner: None,
    });

    Ok(AddressSpace {
        tables,
        mappings,
        next_gpa,
    })
}
