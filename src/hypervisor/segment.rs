use x86::vmx::vmcs;

use super::{host::VirtualCpu, intel::vmcs::vmwrite};

/// The guest-state of a segment register as held in the VMCS.
///
/// See: 25.4.1 Guest Register State
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) struct SegmentState {
    pub(crate) selector: u16,
    pub(crate) base: u64,
    pub(crate) limit: u32,
    pub(crate) access_rights: u32,
}

impl SegmentState {
    /// The access rights value of a segment register that is unusable.
    ///
    /// See: Table 25-2. Format of Access Rights
    pub(crate) const UNUSABLE: u32 = 1 << 16;

    const fn new(selector: u16, limit: u32, access_rights: u32) -> Self {
        Self {
            selector,
            base: 0,
            limit,
            access_rights,
        }
    }
}

/// Segment registers in the order the VMCS field encodings below use.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum SegmentRegister {
    Es,
    Cs,
    Ss,
    Ds,
    Fs,
    Gs,
    Ldtr,
    Tr,
}

impl SegmentRegister {
    /// Returns the selector, base, limit and access rights fields.
    fn fields(self) -> [u32; 4] {
        use vmcs::guest::*;
        match self {
            Self::Es => [ES_SELECTOR, ES_BASE, ES_LIMIT, ES_ACCESS_RIGHTS],
            Self::Cs => [CS_SELECTOR, CS_BASE, CS_LIMIT, CS_ACCESS_RIGHTS],
            Self::Ss => [SS_SELECTOR, SS_BASE, SS_LIMIT, SS_ACCESS_RIGHTS],
            Self::Ds => [DS_SELECTOR, DS_BASE, DS_LIMIT, DS_ACCESS_RIGHTS],
            Self::Fs => [FS_SELECTOR, FS_BASE, FS_LIMIT, FS_ACCESS_RIGHTS],
            Self::Gs => [GS_SELECTOR, GS_BASE, GS_LIMIT, GS_ACCESS_RIGHTS],
            Self::Ldtr => [LDTR_SELECTOR, LDTR_BASE, LDTR_LIMIT, LDTR_ACCESS_RIGHTS],
            Self::Tr => [TR_SELECTOR, TR_BASE, TR_LIMIT, TR_ACCESS_RIGHTS],
        }
    }
}

/// The full set of segment registers plus GDTR and IDTR for one guest mode.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) struct DescriptorSet {
    pub(crate) segments: [(SegmentRegister, SegmentState); 8],
    /// Base and limit of the GDT.
    pub(crate) gdtr: (u64, u32),
    /// Base and limit of the IDT.
    pub(crate) idtr: (u64, u32),
}

impl DescriptorSet {
    /// Real-address mode: all selectors and bases zero, 64KB limits.
    pub(crate) const REAL: Self = Self {
        segments: [
            (SegmentRegister::Cs, SegmentState::new(0, 0xffff, 0x9b)),
            (SegmentRegister::Ds, SegmentState::new(0, 0xffff, 0x93)),
            (SegmentRegister::Es, SegmentState::new(0, 0xffff, 0x93)),
            (SegmentRegister::Fs, SegmentState::new(0, 0xffff, 0x93)),
            (SegmentRegister::Gs, SegmentState::new(0, 0xffff, 0x93)),
            (SegmentRegister::Ss, SegmentState::new(0, 0xffff, 0x93)),
            (SegmentRegister::Ldtr, SegmentState::new(0, 0, SegmentState::UNUSABLE)),
            (SegmentRegister::Tr, SegmentState::new(0, 0, 0x83)),
        ],
        gdtr: (0, 0),
        idtr: (0, 0),
    };

    /// 64-bit mode: a flat 64-bit code segment at selector 0x10 and a flat
    /// data segment at 0x18, as if loaded from a GDT at 0xfe0.
    pub(crate) const LONG: Self = Self {
        segments: [
            (SegmentRegister::Cs, SegmentState::new(0x10, 0xffff_ffff, 0xa09b)),
            (SegmentRegister::Ds, SegmentState::new(0x18, 0xffff_ffff, 0xc093)),
            (SegmentRegister::Es, SegmentState::new(0x18, 0xffff_ffff, 0xc093)),
            (SegmentRegister::Fs, SegmentState::new(0, 0xffff, 0x93)),
            (SegmentRegister::Gs, SegmentState::new(0, 0xffff, 0x93)),
            (SegmentRegister::Ss, SegmentState::new(0x18, 0xffff_ffff, 0xc093)),
            (SegmentRegister::Ldtr, SegmentState::new(0, 0xffff, 0x82)),
            (SegmentRegister::Tr, SegmentState::new(0, 0, 0x8b)),
        ],
        gdtr: (0xfe0, 0x17),
        idtr: (0, 0),
    };

    /// Writes every field of this set into the VMCS of `vcpu`.
    pub(crate) fn load<V: VirtualCpu>(&self, vcpu: &V) {
        for (register, state) in &self.segments {
            let [selector, base, limit, access_rights] = register.fields();
            vmwrite(vcpu, selector, state.selector);
            vmwrite(vcpu, base, state.base);
            vmwrite(vcpu, limit, state.limit);
            vmwrite(vcpu, access_rights, state.access_rights);
        }
        vmwrite(vcpu, vmcs::guest::GDTR_BASE, self.gdtr.0);
        vmwrite(vcpu, vmcs::guest::GDTR_LIMIT, self.gdtr.1);
        vmwrite(vcpu, vmcs::guest::IDTR_BASE, self.idtr.0);
        vmwrite(vcpu, vmcs::guest::IDTR_LIMIT, self.idtr.1);
    }
}
