//! Guest page tables.
//!
//! The tables live in one [`HostBlock`] that is mapped at guest-physical
//! address 0, so the guest-physical page number of a table equals its page
//! index in the block. Guest-linear addresses always equal host-virtual
//! addresses; only the guest-physical side differs between the two layouts:
//!
//! - the flat layout maps linear addresses 1:1 onto guest-physical addresses
//!   with 1GB pages, and
//! - the remap layout maps each host region onto a freshly assigned
//!   guest-physical range, with the largest page size the region allows.

use std::collections::BTreeSet;

use bit_field::BitField;
use x86::bits64::paging::{BASE_PAGE_SHIFT, BASE_PAGE_SIZE, HUGE_PAGE_SIZE, LARGE_PAGE_SIZE};

use super::{
    error::Error,
    host::{HostRegion, MemoryFlags},
    support::HostBlock,
};

/// Guest-physical address where the remap layout starts assigning memory.
/// Everything below is reserved for the page tables.
pub(crate) const REMAP_GPA_BASE: u64 = HUGE_PAGE_SIZE as u64;

const ENTRIES_PER_TABLE: u64 = 512;

/// The largest number of 1GB pages the flat layout can describe.
pub(crate) const MAX_FLAT_GIGABYTES: u64 = ENTRIES_PER_TABLE * ENTRIES_PER_TABLE;

/// Page sizes, from the level of the table holding the leaf entry.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub(crate) enum PageSize {
    Size1G,
    Size2M,
    Size4K,
}

impl PageSize {
    pub(crate) fn bytes(self) -> u64 {
        match self {
            Self::Size1G => HUGE_PAGE_SIZE as u64,
            Self::Size2M => LARGE_PAGE_SIZE as u64,
            Self::Size4K => BASE_PAGE_SIZE as u64,
        }
    }

    /// Returns the largest page size both `start` and `size` are aligned to.
    pub(crate) fn natural(start: u64, size: u64) -> Self {
        [Self::Size1G, Self::Size2M]
            .into_iter()
            .find(|page_size| (start | size) % page_size.bytes() == 0)
            .unwrap_or(Self::Size4K)
    }

    /// The number of table levels walked before reaching the leaf entry.
    fn depth(self) -> usize {
        match self {
            Self::Size1G => 1,
            Self::Size2M => 2,
            Self::Size4K => 3,
        }
    }
}

/// A host region placed into the guest-physical address space.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) struct Placement {
    /// The host-virtual address, which is also the guest-linear address.
    pub(crate) linear: u64,
    pub(crate) gpa: u64,
    pub(crate) size: u64,
    pub(crate) page_size: PageSize,
    pub(crate) flags: MemoryFlags,
}

/// Assigns guest-physical ranges to `regions`, starting at
/// [`REMAP_GPA_BASE`]. Regions naturally aligned to 1GB come first, then 2MB,
/// then the rest, each group in ascending address order. Ranges are assigned
/// back to back, which keeps each of them aligned to its page size.
pub(crate) fn plan_remap(regions: &[HostRegion]) -> Vec<Placement> {
    let mut sorted: Vec<(PageSize, HostRegion)> = regions
        .iter()
        .filter(|region| !region.protection.is_empty() && region.size != 0)
        .map(|region| (PageSize::natural(region.start, region.size), *region))
        .collect();
    sorted.sort_by_key(|(page_size, region)| (*page_size, region.start));

    let mut gpa = REMAP_GPA_BASE;
    sorted
        .into_iter()
        .map(|(page_size, region)| {
            let placement = Placement {
                linear: region.start,
                gpa,
                size: region.size,
                page_size,
                flags: region.protection,
            };
            gpa += region.size;
            placement
        })
        .collect()
}

/// Returns the number of table pages needed to describe `placements`,
/// including the PML4.
fn count_tables(placements: &[Placement]) -> usize {
    // One set per level below the PML4, keyed by the linear address bits
    // that select the table.
    let mut pdpts = BTreeSet::new();
    let mut pds = BTreeSet::new();
    let mut pts = BTreeSet::new();
    for placement in placements {
        let first = placement.linear;
        let last = placement.linear + placement.size - 1;
        pdpts.extend((first >> 39)..=(last >> 39));
        if placement.page_size >= PageSize::Size2M {
            pds.extend((first >> 30)..=(last >> 30));
        }
        if placement.page_size == PageSize::Size4K {
            pts.extend((first >> 21)..=(last >> 21));
        }
    }
    1 + pdpts.len() + pds.len() + pts.len()
}

bitfield::bitfield! {
    /// A PML4E, PDPTE, PDE or PTE.
    ///
    /// See: Table 4-15. Format of a PML4 Entry (PML4E) that References a Page-Directory-Pointer Table
    #[derive(Clone, Copy, Default, PartialEq, Eq)]
    pub struct Entry(u64);
    impl Debug;
    pub present, set_present: 0;
    pub writable, set_writable: 1;
    pub user, set_user: 2;
    pub large, set_large: 7;
    pub pfn, set_pfn: 51, 12;
    pub execute_disable, set_execute_disable: 63;
}

#[derive(Debug, Clone, Copy, derive_deref::Deref, derive_deref::DerefMut)]
#[repr(C, align(4096))]
pub(crate) struct Table {
    entries: [Entry; 512],
}

/// The guest page tables of a VM.
#[derive(Debug)]
pub(crate) struct GuestPageTables {
    memory: HostBlock,
    /// The next unused page of `memory`.
    next_page: usize,
    /// The page index of the PML4.
    pml4: usize,
}

impl GuestPageTables {
    /// Builds the flat layout: `gigabytes` 1GB pages mapping linear address
    /// `n` to guest-physical address `n`.
    ///
    /// PDPTs occupy the first pages of the block, one per 512GB, and the PML4
    /// follows them.
    pub(crate) fn flat(gigabytes: u64) -> Result<Self, Error> {
        if gigabytes == 0 || gigabytes > MAX_FLAT_GIGABYTES {
            return Err(Error::InvalidConfig(
                "the flat layout covers between 1GB and 256TB",
            ));
        }
        let pdpts = gigabytes.div_ceil(ENTRIES_PER_TABLE) as usize;
        let mut tables = Self {
            memory: HostBlock::new(pdpts + 1),
            next_page: pdpts + 1,
            pml4: pdpts,
        };

        for pdpt in 0..pdpts {
            let pml4e = &mut tables.table_mut(pdpts)[pdpt];
            pml4e.set_present(true);
            pml4e.set_writable(true);
            pml4e.set_pfn(pdpt as u64);

            let first = pdpt as u64 * ENTRIES_PER_TABLE;
            let count = (gigabytes - first).min(ENTRIES_PER_TABLE) as usize;
            for (index, pdpte) in tables.table_mut(pdpt)[..count].iter_mut().enumerate() {
                let gpa = (first + index as u64) * HUGE_PAGE_SIZE as u64;
                pdpte.set_present(true);
                pdpte.set_writable(true);
                pdpte.set_large(true);
                pdpte.set_pfn(gpa >> BASE_PAGE_SHIFT);
            }
        }

        log::debug!(
            "Built flat page tables for {gigabytes}GB with {} pages",
            tables.memory.pages()
        );
        Ok(tables)
    }

    /// Builds the remap layout for `placements` with `spare_pages` extra pages
    /// for later [`Self::map_4k`] calls. The PML4 is the first page.
    pub(crate) fn remap(placements: &[Placement], spare_pages: usize) -> Result<Self, Error> {
        let pages = count_tables(placements) + spare_pages;
        if (pages * BASE_PAGE_SIZE) as u64 > REMAP_GPA_BASE {
            return Err(Error::TablePoolExhausted);
        }
        let mut tables = Self {
            memory: HostBlock::new(pages),
            next_page: 1,
            pml4: 0,
        };
        for placement in placements {
            let step = placement.page_size.bytes();
            for offset in (0..placement.size).step_by(step as usize) {
                tables.map_page(
                    placement.linear + offset,
                    placement.gpa + offset,
                    placement.page_size,
                )?;
            }
        }

        log::debug!(
            "Built remapped page tables for {} regions with {} of {pages} pages",
            placements.len(),
            tables.next_page,
        );
        Ok(tables)
    }

    /// The value for CR3.
    pub(crate) fn cr3(&self) -> u64 {
        (self.pml4 * BASE_PAGE_SIZE) as u64
    }

    /// The host-virtual address of the tables, to be mapped at guest-physical
    /// address 0.
    pub(crate) fn host_address(&self) -> u64 {
        self.memory.address()
    }

    /// The size of the table block in bytes.
    pub(crate) fn size(&self) -> u64 {
        self.memory.len() as u64
    }

    /// Installs 4KB entries mapping `linear..linear + size` to `gpa..`. On
    /// failure no entry of the range is left installed.
    pub(crate) fn map_4k(&mut self, linear: u64, gpa: u64, size: u64) -> Result<(), Error> {
        for offset in (0..size).step_by(BASE_PAGE_SIZE) {
            if let Err(err) = self.map_page(linear + offset, gpa + offset, PageSize::Size4K) {
                self.unmap_4k(linear, offset);
                return Err(err);
            }
        }
        Ok(())
    }

    /// Clears 4KB entries installed with [`Self::map_4k`]. Tables are kept.
    pub(crate) fn unmap_4k(&mut self, linear: u64, size: u64) {
        for offset in (0..size).step_by(BASE_PAGE_SIZE) {
            let address = linear + offset;
            if let Some((page, index)) = self.leaf_slot(address, PageSize::Size4K) {
                self.table_mut(page)[index] = Entry::default();
            }
        }
    }

    /// Translates `linear` to a guest-physical address the way the processor
    /// would, or returns `None` if a not-present entry is hit.
    pub(crate) fn walk(&self, linear: u64) -> Option<u64> {
        let indices = table_indices(linear);
        let mut table = self.pml4;
        for (level, index) in indices.into_iter().enumerate() {
            let entry = self.table(table)?[index];
            if !entry.present() {
                return None;
            }
            let frame = entry.pfn() << BASE_PAGE_SHIFT;
            match level {
                1 if entry.large() => return Some(frame + linear.get_bits(0..30)),
                2 if entry.large() => return Some(frame + linear.get_bits(0..21)),
                3 => return Some(frame + linear.get_bits(0..12)),
                _ => table = entry.pfn() as usize,
            }
        }
        None
    }

    fn table(&self, page: usize) -> Option<&Table> {
        (page < self.memory.pages()).then(|| self.memory.page::<Table>(page))
    }

    fn table_mut(&mut self, page: usize) -> &mut Table {
        self.memory.page_mut::<Table>(page)
    }

    fn allocate_table(&mut self) -> Result<usize, Error> {
        if self.next_page >= self.memory.pages() {
            return Err(Error::TablePoolExhausted);
        }
        let page = self.next_page;
        self.next_page += 1;
        Ok(page)
    }

    /// Installs a leaf entry, allocating the intermediate tables on the way.
    fn map_page(&mut self, linear: u64, gpa: u64, page_size: PageSize) -> Result<(), Error> {
        let indices = table_indices(linear);
        let depth = page_size.depth();
        let mut table = self.pml4;
        for &index in &indices[..depth] {
            let entry = self.table_mut(table)[index];
            table = if !entry.present() {
                let next = self.allocate_table()?;
                let entry = &mut self.table_mut(table)[index];
                entry.set_present(true);
                entry.set_writable(true);
                entry.set_pfn(next as u64);
                next
            } else if entry.large() {
                return Err(Error::RegionOverlap {
                    gpa,
                    size: page_size.bytes(),
                });
            } else {
                entry.pfn() as usize
            };
        }

        let leaf = &mut self.table_mut(table)[indices[depth]];
        *leaf = Entry::default();
        leaf.set_present(true);
        leaf.set_writable(true);
        leaf.set_large(page_size != PageSize::Size4K);
        leaf.set_pfn(gpa >> BASE_PAGE_SHIFT);
        Ok(())
    }

    /// Returns the table page and index of the leaf entry for `linear`, if
    /// all tables above it exist.
    fn leaf_slot(&self, linear: u64, page_size: PageSize) -> Option<(usize, usize)> {
        let indices = table_indices(linear);
        let depth = page_size.depth();
        let mut table = self.pml4;
        for &index in &indices[..depth] {
            let entry = self.table(table)?[index];
            if !entry.present() || entry.large() {
                return None;
            }
            table = entry.pfn() as usize;
        }
        Some((table, indices[depth]))
    }
}

/// Splits `linear` into the PML4, PDPT, PD and PT indices.
fn table_indices(linear: u64) -> [usize; 4] {
    [
        linear.get_bits(39..48) as usize,
        linear.get_bits(30..39) as usize,
        linear.get_bits(21..30) as usize,
        linear.get_bits(12..21) as usize,
    ]
}
