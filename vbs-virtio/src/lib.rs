// Copyright © 2019 Intel Corporation
//
// SPDX-License-Identifier: Apache-2.0 OR BSD-3-Clause

//! Legacy virtio ring engine for backend service devices.
//!
//! A guest hands the backend a single page frame number; the descriptor
//! table, available ring and used ring all live in one contiguous guest
//! physical region derived from it, laid out in the legacy (pre-1.0) virtio
//! format with a 4096-byte boundary between the avail and used parts. The
//! guest side of the ring is untrusted input: every address, length and
//! index read from it is bounds-checked before use.

pub mod defs;
#[cfg(any(test, feature = "test-utils"))]
pub mod testing;

use std::mem::size_of;
use std::num::Wrapping;
use std::sync::atomic::{fence, Ordering};

use bitflags::bitflags;
use log::{debug, error};
use thiserror::Error;
use vm_memory::{
    Address, ByteValued, Bytes, GuestAddress, GuestAddressSpace, GuestMemory, GuestMemoryError,
};

use self::defs::{
    PAGE_SHIFT, VIRTQ_AVAIL_ELEMENT_SIZE, VIRTQ_AVAIL_RING_HEADER_SIZE, VIRTQ_DESCRIPTOR_SIZE,
    VIRTQ_DESC_F_NEXT, VIRTQ_DESC_F_WRITE, VIRTQ_MSI_NO_VECTOR, VIRTQ_USED_ELEMENT_SIZE,
    VIRTQ_USED_RING_HEADER_SIZE, VQ_ALIGN, VQ_MAX_DESCRIPTORS, VRING_AVAIL_F_NO_INTERRUPT,
};

/// Virtqueue related errors.
#[derive(Error, Debug)]
pub enum VirtQueueError {
    #[error("error accessing guest memory")]
    GuestMemory(#[source] GuestMemoryError),

    #[error("virtqueue ring at pfn {0:#x} does not fit in guest memory")]
    RingOutOfBounds(u64),

    #[error("descriptor chain exceeds {0} descriptors")]
    ChainTooLong(u16),

    #[error("descriptor index {0} out of range")]
    InvalidDescriptorIndex(u16),

    #[error("descriptor buffer {addr:#x}+{len:#x} is not backed by guest memory")]
    BadDescriptor { addr: u64, len: u32 },

    #[error("virtqueue is broken and must be reconfigured")]
    Broken,

    #[error("virtqueue is not allocated")]
    NotAllocated,

    #[error("failed to inject guest interrupt")]
    Interrupt(#[source] std::io::Error),
}

pub type Result<T> = std::result::Result<T, VirtQueueError>;

bitflags! {
    /// Queue state flags.
    #[derive(Clone, Copy, Debug, PartialEq, Eq)]
    pub struct VqFlags: u32 {
        /// The ring addresses have been derived and validated.
        const ALLOC = 0x1;
        /// The guest supplied a malformed layout or chain; the queue refuses
        /// all further work until reconfigured.
        const BROKEN = 0x2;
    }
}

/// MSI-X identity used to notify the guest of completed work.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct MsixEntry {
    pub vector: u16,
    pub addr: u64,
    pub data: u32,
}

impl Default for MsixEntry {
    fn default() -> Self {
        MsixEntry {
            vector: VIRTQ_MSI_NO_VECTOR,
            addr: 0,
            data: 0,
        }
    }
}

/// Trait for delivering a queue interrupt to the guest.
pub trait VirtioInterrupt: Send + Sync {
    fn trigger(&self, msix: &MsixEntry) -> std::io::Result<()>;
}

/// A virtio descriptor with C representation.
#[repr(C)]
#[derive(Default, Clone, Copy, Debug)]
pub struct Descriptor {
    addr: u64,
    len: u32,
    flags: u16,
    next: u16,
}

impl Descriptor {
    /// Return the guest physical address of the descriptor buffer.
    pub fn addr(&self) -> GuestAddress {
        GuestAddress(self.addr)
    }

    /// Return the length of the descriptor buffer.
    pub fn len(&self) -> u32 {
        self.len
    }

    /// Check whether the `VIRTQ_DESC_F_NEXT` flag is set.
    pub fn has_next(&self) -> bool {
        self.flags & VIRTQ_DESC_F_NEXT != 0
    }

    /// Return the index of the next descriptor in the chain.
    pub fn next(&self) -> u16 {
        self.next
    }

    /// Checks if the driver designated this as a write only descriptor.
    pub fn is_write_only(&self) -> bool {
        self.flags & VIRTQ_DESC_F_WRITE != 0
    }
}

// SAFETY: Descriptor contains only plain integers.
unsafe impl ByteValued for Descriptor {}

/// Contents of an element from the used ring.
#[repr(C)]
#[derive(Clone, Copy, Default, Debug)]
pub struct VirtqUsedElem {
    id: u32,
    len: u32,
}

impl VirtqUsedElem {
    pub fn new(id: u16, len: u32) -> Self {
        VirtqUsedElem {
            id: u32::from(id),
            len,
        }
    }
}

// SAFETY: VirtqUsedElem contains only plain integers.
unsafe impl ByteValued for VirtqUsedElem {}

/// One scatter/gather segment of a descriptor chain, already range-checked
/// against guest memory.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct SgEntry {
    pub addr: GuestAddress,
    pub len: u32,
    pub write: bool,
}

/// A fully walked descriptor chain.
#[derive(Clone, Debug)]
pub struct DescChain {
    head_index: u16,
    segments: Vec<SgEntry>,
}

impl DescChain {
    /// Index of the chain head in the descriptor table.
    pub fn head_index(&self) -> u16 {
        self.head_index
    }

    /// All segments in chain order.
    pub fn segments(&self) -> &[SgEntry] {
        &self.segments
    }

    /// Only the device-readable segments.
    pub fn readable(&self) -> impl Iterator<Item = &SgEntry> {
        self.segments.iter().filter(|sg| !sg.write)
    }

    /// Only the device-writable segments.
    pub fn writable(&self) -> impl Iterator<Item = &SgEntry> {
        self.segments.iter().filter(|sg| sg.write)
    }
}

/// Placement of a legacy ring derived from its base guest physical address.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct RingLayout {
    pub desc_table: u64,
    pub avail_ring: u64,
    pub used_ring: u64,
    pub size: u64,
}

fn align_up(v: u64, align: u64) -> u64 {
    (v + align - 1) & !(align - 1)
}

/// Total guest memory footprint of a legacy ring with `qsize` descriptors.
pub fn vq_ring_size(qsize: u16) -> u64 {
    let q = u64::from(qsize);
    // Descriptor table plus avail ring (flags, idx, ring[q], used_event),
    // rounded up to the alignment boundary; then the used ring (flags, idx,
    // ring[q], avail_event), rounded up again.
    align_up(
        VIRTQ_DESCRIPTOR_SIZE * q + VIRTQ_AVAIL_ELEMENT_SIZE * (3 + q),
        VQ_ALIGN,
    ) + align_up(3 * 2 + VIRTQ_USED_ELEMENT_SIZE * q, VQ_ALIGN)
}

/// Compute where the three ring parts land for a ring based at `base_gpa`.
pub fn ring_layout(base_gpa: u64, qsize: u16) -> RingLayout {
    let q = u64::from(qsize);
    let desc_table = base_gpa;
    let avail_ring = desc_table + VIRTQ_DESCRIPTOR_SIZE * q;
    let used_ring = align_up(avail_ring + VIRTQ_AVAIL_ELEMENT_SIZE * (3 + q), VQ_ALIGN);
    RingLayout {
        desc_table,
        avail_ring,
        used_ring,
        size: vq_ring_size(qsize),
    }
}

/// One single-producer/single-consumer descriptor ring shared with a guest.
#[derive(Clone, Debug)]
pub struct VirtQueue<M: GuestAddressSpace> {
    mem: M,
    qsize: u16,
    pfn: u64,
    flags: VqFlags,
    last_avail: Wrapping<u16>,
    save_used: Wrapping<u16>,
    desc_table: GuestAddress,
    avail_ring: GuestAddress,
    used_ring: GuestAddress,
    event_idx_enabled: bool,
    notify_on_empty: bool,

    /// MSI-X identity for interrupt delivery.
    pub msix: MsixEntry,
}

impl<M: GuestAddressSpace> VirtQueue<M> {
    /// Construct an unallocated queue over the given guest memory.
    pub fn new(mem: M, qsize: u16) -> Self {
        VirtQueue {
            mem,
            qsize,
            pfn: 0,
            flags: VqFlags::empty(),
            last_avail: Wrapping(0),
            save_used: Wrapping(0),
            desc_table: GuestAddress(0),
            avail_ring: GuestAddress(0),
            used_ring: GuestAddress(0),
            event_idx_enabled: false,
            notify_on_empty: false,
            msix: MsixEntry::default(),
        }
    }

    /// The queue size in descriptors. Must be a power of two; this is the
    /// configuring caller's precondition, as in legacy virtio.
    pub fn size(&self) -> u16 {
        self.qsize
    }

    /// Configure the queue size. Only meaningful before `init`.
    pub fn set_size(&mut self, qsize: u16) {
        self.qsize = qsize;
    }

    /// The guest page frame number the ring was derived from.
    pub fn pfn(&self) -> u64 {
        self.pfn
    }

    pub fn flags(&self) -> VqFlags {
        self.flags
    }

    pub fn is_allocated(&self) -> bool {
        self.flags.contains(VqFlags::ALLOC)
    }

    pub fn is_broken(&self) -> bool {
        self.flags.contains(VqFlags::BROKEN)
    }

    /// Enable event-index interrupt suppression (`VIRTIO_RING_F_EVENT_IDX`).
    pub fn set_event_idx(&mut self, enabled: bool) {
        self.event_idx_enabled = enabled;
    }

    /// Enable interrupt-on-empty (`VIRTIO_F_NOTIFY_ON_EMPTY`).
    pub fn set_notify_on_empty(&mut self, enabled: bool) {
        self.notify_on_empty = enabled;
    }

    pub fn desc_table_addr(&self) -> GuestAddress {
        self.desc_table
    }

    pub fn avail_ring_addr(&self) -> GuestAddress {
        self.avail_ring
    }

    pub fn used_ring_addr(&self) -> GuestAddress {
        self.used_ring
    }

    /// Derive and validate the ring layout from a guest page frame number.
    ///
    /// On failure the queue stays unallocated; this is an initialization
    /// error of the queue being set up, never a host crash.
    pub fn init(&mut self, pfn: u64) -> Result<()> {
        debug_assert!(self.qsize.is_power_of_two());

        let base = pfn << PAGE_SHIFT;
        let layout = ring_layout(base, self.qsize);
        let mem = self.mem.memory();

        let start = GuestAddress(base);
        let end_ok = start
            .checked_add(layout.size - 1)
            .map_or(false, |end| mem.address_in_range(end));
        if !mem.address_in_range(start) || !end_ok {
            error!(
                "virtqueue ring at pfn {:#x} (size {:#x}) out of guest memory bounds",
                pfn, layout.size
            );
            return Err(VirtQueueError::RingOutOfBounds(pfn));
        }

        self.pfn = pfn;
        self.desc_table = GuestAddress(layout.desc_table);
        self.avail_ring = GuestAddress(layout.avail_ring);
        self.used_ring = GuestAddress(layout.used_ring);
        self.last_avail = Wrapping(0);
        self.save_used = Wrapping(0);
        self.flags = VqFlags::ALLOC;

        Ok(())
    }

    /// Reset the queue to the unconfigured state.
    ///
    /// Clears the pfn, the MSI-X vector and the ring cursors. The derived
    /// addresses are left alone; a fresh `init` is required before reuse.
    pub fn reset(&mut self) {
        self.pfn = 0;
        self.msix = MsixEntry::default();
        self.flags = VqFlags::empty();
        self.last_avail = Wrapping(0);
        self.save_used = Wrapping(0);
    }

    fn avail_idx(&self, order: Ordering) -> Result<Wrapping<u16>> {
        let mem = self.mem.memory();
        mem.load::<u16>(self.avail_ring.unchecked_add(2), order)
            .map(Wrapping)
            .map_err(VirtQueueError::GuestMemory)
    }

    fn used_idx(&self, order: Ordering) -> Result<Wrapping<u16>> {
        let mem = self.mem.memory();
        mem.load::<u16>(self.used_ring.unchecked_add(2), order)
            .map(Wrapping)
            .map_err(VirtQueueError::GuestMemory)
    }

    /// Whether the guest has published descriptors not yet consumed.
    ///
    /// Re-reads the avail index on every call; callers must re-check after
    /// each consumed chain rather than cache the answer.
    pub fn has_descs(&self) -> bool {
        if !self.flags.contains(VqFlags::ALLOC) || self.flags.contains(VqFlags::BROKEN) {
            return false;
        }
        match self.avail_idx(Ordering::Acquire) {
            Ok(idx) => idx != self.last_avail,
            Err(_) => false,
        }
    }

    fn mark_broken(&mut self) {
        self.flags.insert(VqFlags::BROKEN);
    }

    /// Walk the next published descriptor chain into a scatter/gather list.
    ///
    /// Returns `Ok(None)` when the guest has published nothing new. A chain
    /// longer than `VQ_MAX_DESCRIPTORS` (including guest-crafted cycles) or
    /// any untranslatable buffer marks the queue broken; no further chains
    /// are walked until the queue is reconfigured.
    pub fn pop_chain(&mut self) -> Result<Option<DescChain>> {
        if self.flags.contains(VqFlags::BROKEN) {
            return Err(VirtQueueError::Broken);
        }
        if !self.flags.contains(VqFlags::ALLOC) {
            return Err(VirtQueueError::NotAllocated);
        }

        if self.avail_idx(Ordering::Acquire)? == self.last_avail {
            return Ok(None);
        }

        let mem = self.mem.memory();
        let slot = u64::from(self.last_avail.0 % self.qsize);
        let head_addr = self
            .avail_ring
            .unchecked_add(VIRTQ_AVAIL_RING_HEADER_SIZE + slot * VIRTQ_AVAIL_ELEMENT_SIZE);
        let head: u16 = mem
            .load(head_addr, Ordering::Acquire)
            .map_err(VirtQueueError::GuestMemory)?;

        let mut segments = Vec::new();
        let mut next = head;
        loop {
            if segments.len() == usize::from(VQ_MAX_DESCRIPTORS) {
                error!(
                    "descriptor chain at head {} exceeds {} descriptors, marking queue broken",
                    head, VQ_MAX_DESCRIPTORS
                );
                self.mark_broken();
                return Err(VirtQueueError::ChainTooLong(VQ_MAX_DESCRIPTORS));
            }
            if next >= self.qsize {
                error!("descriptor index {} out of range, marking queue broken", next);
                self.mark_broken();
                return Err(VirtQueueError::InvalidDescriptorIndex(next));
            }

            let desc_addr = self
                .desc_table
                .unchecked_add(u64::from(next) * size_of::<Descriptor>() as u64);
            let desc: Descriptor = mem.read_obj(desc_addr).map_err(|e| {
                self.flags.insert(VqFlags::BROKEN);
                VirtQueueError::GuestMemory(e)
            })?;

            // Guest-supplied address and length are untrusted; check the
            // whole buffer is backed before handing it to the backend.
            if desc.len() > 0 {
                let backed = desc
                    .addr()
                    .checked_add(u64::from(desc.len()) - 1)
                    .map_or(false, |end| {
                        mem.address_in_range(desc.addr()) && mem.address_in_range(end)
                    });
                if !backed {
                    error!(
                        "descriptor buffer {:#x}+{:#x} not backed by guest memory, marking queue broken",
                        desc.addr().raw_value(),
                        desc.len()
                    );
                    self.mark_broken();
                    return Err(VirtQueueError::BadDescriptor {
                        addr: desc.addr().raw_value(),
                        len: desc.len(),
                    });
                }
            }

            segments.push(SgEntry {
                addr: desc.addr(),
                len: desc.len(),
                write: desc.is_write_only(),
            });

            if desc.has_next() {
                next = desc.next();
            } else {
                break;
            }
        }

        self.last_avail += Wrapping(1);

        Ok(Some(DescChain {
            head_index: head,
            segments,
        }))
    }

    /// Publish a consumed chain into the used ring.
    ///
    /// The element content is written before the used index advances, with
    /// Release ordering, so the guest never observes an advanced index with
    /// stale slot content.
    pub fn add_used(&mut self, head_index: u16, len: u32) -> Result<()> {
        if !self.flags.contains(VqFlags::ALLOC) {
            return Err(VirtQueueError::NotAllocated);
        }
        if head_index >= self.qsize {
            error!(
                "attempted to add out of bounds descriptor to used ring: {}",
                head_index
            );
            return Err(VirtQueueError::InvalidDescriptorIndex(head_index));
        }

        let mem = self.mem.memory();
        let used_idx = self.used_idx(Ordering::Relaxed)?;
        let slot = u64::from(used_idx.0 % self.qsize);
        let elem_addr = self
            .used_ring
            .unchecked_add(VIRTQ_USED_RING_HEADER_SIZE + slot * VIRTQ_USED_ELEMENT_SIZE);

        mem.write_obj(VirtqUsedElem::new(head_index, len), elem_addr)
            .map_err(VirtQueueError::GuestMemory)?;
        mem.store(
            (used_idx + Wrapping(1)).0,
            self.used_ring.unchecked_add(2),
            Ordering::Release,
        )
        .map_err(VirtQueueError::GuestMemory)
    }

    fn used_event(&self, order: Ordering) -> Result<Wrapping<u16>> {
        let mem = self.mem.memory();
        let offset =
            VIRTQ_AVAIL_RING_HEADER_SIZE + VIRTQ_AVAIL_ELEMENT_SIZE * u64::from(self.qsize);
        mem.load::<u16>(self.avail_ring.unchecked_add(offset), order)
            .map(Wrapping)
            .map_err(VirtQueueError::GuestMemory)
    }

    /// Decide whether the guest needs an interrupt for newly used chains and
    /// deliver it.
    ///
    /// With event-index negotiated the used_event window check applies;
    /// otherwise `VRING_AVAIL_F_NO_INTERRUPT` suppresses delivery. Returns
    /// whether an interrupt was injected.
    pub fn finish_chains(
        &mut self,
        used_all_avail: bool,
        intr: &dyn VirtioInterrupt,
    ) -> Result<bool> {
        if !self.flags.contains(VqFlags::ALLOC) {
            return Err(VirtQueueError::NotAllocated);
        }

        let old_idx = self.save_used;
        let new_idx = self.used_idx(Ordering::Acquire)?;
        self.save_used = new_idx;

        // Complete the used ring writes before reading the suppression
        // fields the guest may be updating concurrently.
        fence(Ordering::SeqCst);

        let should = if used_all_avail && self.notify_on_empty {
            true
        } else if self.event_idx_enabled {
            let event = self.used_event(Ordering::Relaxed)?;
            // Wrap-around window check: interrupt only if used_event lies
            // within (old_idx, new_idx].
            (new_idx - event - Wrapping(1)) < (new_idx - old_idx)
        } else {
            let mem = self.mem.memory();
            let avail_flags: u16 = mem
                .load(self.avail_ring, Ordering::Relaxed)
                .map_err(VirtQueueError::GuestMemory)?;
            new_idx != old_idx && avail_flags & VRING_AVAIL_F_NO_INTERRUPT == 0
        };

        if !should {
            return Ok(false);
        }
        if self.msix.vector == VIRTQ_MSI_NO_VECTOR {
            debug!("queue interrupt elided: no MSI-X vector configured");
            return Ok(false);
        }

        intr.trigger(&self.msix)
            .map_err(VirtQueueError::Interrupt)?;
        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::AtomicUsize;
    use std::sync::atomic::Ordering as AtomicOrdering;

    use vm_memory::GuestMemoryAtomic;

    use super::defs::*;
    use super::testing::GuestRing;
    use super::*;

    type GuestMemoryMmap = vm_memory::GuestMemoryMmap<()>;

    const TEST_PFN: u64 = 0x10;

    fn guest_mem() -> GuestMemoryMmap {
        GuestMemoryMmap::from_ranges(&[(GuestAddress(0), 0x100_0000)]).unwrap()
    }

    fn queue_with_ring(
        mem: &GuestMemoryMmap,
        qsize: u16,
    ) -> (VirtQueue<GuestMemoryAtomic<GuestMemoryMmap>>, GuestRing<'_, GuestMemoryMmap>) {
        let ring = GuestRing::new(mem, TEST_PFN, qsize);
        let mut vq = VirtQueue::new(GuestMemoryAtomic::new(mem.clone()), qsize);
        vq.init(TEST_PFN).unwrap();
        (vq, ring)
    }

    struct CountingInterrupt(AtomicUsize);

    impl CountingInterrupt {
        fn new() -> Self {
            CountingInterrupt(AtomicUsize::new(0))
        }

        fn count(&self) -> usize {
            self.0.load(AtomicOrdering::SeqCst)
        }
    }

    impl VirtioInterrupt for CountingInterrupt {
        fn trigger(&self, _msix: &MsixEntry) -> std::io::Result<()> {
            self.0.fetch_add(1, AtomicOrdering::SeqCst);
            Ok(())
        }
    }

    #[test]
    fn ring_size_matches_legacy_formula() {
        for qsize in [4u16, 64, 256, 1024] {
            let q = u64::from(qsize);
            let expected = ((16 * q + (3 + q) * 2 + 4095) & !4095) + ((6 + 8 * q + 4095) & !4095);
            assert_eq!(vq_ring_size(qsize), expected, "qsize {qsize}");
        }
    }

    #[test]
    fn init_places_rings_at_legacy_offsets() {
        let mem = guest_mem();
        let (vq, _ring) = queue_with_ring(&mem, 256);

        let base = TEST_PFN << PAGE_SHIFT;
        assert_eq!(vq.desc_table_addr().raw_value(), base);
        assert_eq!(vq.avail_ring_addr().raw_value(), base + 16 * 256);
        // Used ring starts at the next 4096 boundary after the avail ring.
        let avail_end = base + 16 * 256 + (3 + 256) * 2;
        assert_eq!(
            vq.used_ring_addr().raw_value(),
            (avail_end + 4095) & !4095
        );
        assert_eq!(vq.used_ring_addr().raw_value() % VQ_ALIGN, 0);
        assert!(vq.is_allocated());
    }

    #[test]
    fn init_rejects_unbacked_pfn() {
        let mem = guest_mem();
        let mut vq = VirtQueue::new(GuestMemoryAtomic::new(mem.clone()), 256);
        // Base page just below the end of memory: the ring cannot fit.
        let pfn = (0x100_0000u64 >> PAGE_SHIFT) - 1;
        assert!(matches!(
            vq.init(pfn),
            Err(VirtQueueError::RingOutOfBounds(_))
        ));
        assert!(!vq.is_allocated());
    }

    #[test]
    fn has_descs_is_idempotent() {
        let mem = guest_mem();
        let (vq, ring) = queue_with_ring(&mem, 16);

        assert!(!vq.has_descs());
        assert!(!vq.has_descs());

        ring.write_desc(0, 0x9000, 64, 0, 0);
        ring.publish_avail(0);

        assert!(vq.has_descs());
        assert!(vq.has_descs());
    }

    #[test]
    fn pop_chain_two_segments() {
        let mem = guest_mem();
        let (mut vq, ring) = queue_with_ring(&mem, 256);

        ring.write_desc(0, 0x9000, 64, VIRTQ_DESC_F_NEXT, 1);
        ring.write_desc(1, 0xa000, 128, VIRTQ_DESC_F_WRITE, 0);
        ring.publish_avail(0);

        let chain = vq.pop_chain().unwrap().unwrap();
        assert_eq!(chain.head_index(), 0);
        assert_eq!(chain.segments().len(), 2);
        assert_eq!(
            chain.segments()[0],
            SgEntry {
                addr: GuestAddress(0x9000),
                len: 64,
                write: false
            }
        );
        assert_eq!(
            chain.segments()[1],
            SgEntry {
                addr: GuestAddress(0xa000),
                len: 128,
                write: true
            }
        );
        assert_eq!(chain.readable().count(), 1);
        assert_eq!(chain.writable().count(), 1);

        // The chain was consumed.
        assert!(!vq.has_descs());
        assert!(vq.pop_chain().unwrap().is_none());
    }

    #[test]
    fn cyclic_chain_breaks_queue_after_exact_bound() {
        let mem = guest_mem();
        let (mut vq, ring) = queue_with_ring(&mem, 16);

        // 0 -> 1 -> 2 -> 0 ... repeats forever.
        ring.write_desc(0, 0x9000, 16, VIRTQ_DESC_F_NEXT, 1);
        ring.write_desc(1, 0x9100, 16, VIRTQ_DESC_F_NEXT, 2);
        ring.write_desc(2, 0x9200, 16, VIRTQ_DESC_F_NEXT, 0);
        ring.publish_avail(0);

        match vq.pop_chain() {
            Err(VirtQueueError::ChainTooLong(n)) => assert_eq!(n, VQ_MAX_DESCRIPTORS),
            other => panic!("unexpected result: {other:?}"),
        }
        assert!(vq.is_broken());

        // A broken queue refuses further walks until reconfigured.
        assert!(matches!(vq.pop_chain(), Err(VirtQueueError::Broken)));
        assert!(!vq.has_descs());

        vq.reset();
        vq.init(TEST_PFN).unwrap();
        assert!(!vq.is_broken());
        assert!(vq.has_descs());
    }

    #[test]
    fn max_length_chain_is_accepted() {
        let qsize = 1024u16;
        let mem = guest_mem();
        let (mut vq, ring) = queue_with_ring(&mem, qsize);

        for i in 0..VQ_MAX_DESCRIPTORS {
            let flags = if i + 1 < VQ_MAX_DESCRIPTORS {
                VIRTQ_DESC_F_NEXT
            } else {
                0
            };
            ring.write_desc(i, 0x80_0000 + u64::from(i) * 0x10, 16, flags, i + 1);
        }
        ring.publish_avail(0);

        let chain = vq.pop_chain().unwrap().unwrap();
        assert_eq!(chain.segments().len(), usize::from(VQ_MAX_DESCRIPTORS));
        assert!(!vq.is_broken());
    }

    #[test]
    fn unbacked_descriptor_buffer_breaks_queue() {
        let mem = guest_mem();
        let (mut vq, ring) = queue_with_ring(&mem, 16);

        ring.write_desc(0, 0xffff_f000, 64, 0, 0);
        ring.publish_avail(0);

        assert!(matches!(
            vq.pop_chain(),
            Err(VirtQueueError::BadDescriptor { .. })
        ));
        assert!(vq.is_broken());
    }

    #[test]
    fn add_used_publishes_content_before_index() {
        let mem = guest_mem();
        let (mut vq, ring) = queue_with_ring(&mem, 16);

        assert_eq!(ring.used_idx(), 0);
        vq.add_used(5, 300).unwrap();
        assert_eq!(ring.used_idx(), 1);
        assert_eq!(ring.used_elem(0), (5, 300));

        vq.add_used(7, 44).unwrap();
        assert_eq!(ring.used_idx(), 2);
        assert_eq!(ring.used_elem(1), (7, 44));
    }

    #[test]
    fn add_used_rejects_out_of_range_head() {
        let mem = guest_mem();
        let (mut vq, _ring) = queue_with_ring(&mem, 16);
        assert!(matches!(
            vq.add_used(16, 0),
            Err(VirtQueueError::InvalidDescriptorIndex(16))
        ));
    }

    #[test]
    fn interrupt_follows_no_interrupt_flag() {
        let mem = guest_mem();
        let (mut vq, ring) = queue_with_ring(&mem, 16);
        vq.msix = MsixEntry {
            vector: 0,
            addr: 0xfee0_0000,
            data: 0x41,
        };

        let intr = CountingInterrupt::new();

        vq.add_used(0, 10).unwrap();
        assert!(vq.finish_chains(true, &intr).unwrap());
        assert_eq!(intr.count(), 1);

        // Nothing new in the used ring: no interrupt.
        assert!(!vq.finish_chains(true, &intr).unwrap());
        assert_eq!(intr.count(), 1);

        ring.set_avail_flags(VRING_AVAIL_F_NO_INTERRUPT);
        vq.add_used(1, 10).unwrap();
        assert!(!vq.finish_chains(true, &intr).unwrap());
        assert_eq!(intr.count(), 1);
    }

    #[test]
    fn no_vector_elides_interrupt() {
        let mem = guest_mem();
        let (mut vq, _ring) = queue_with_ring(&mem, 16);
        let intr = CountingInterrupt::new();

        vq.add_used(0, 10).unwrap();
        assert!(!vq.finish_chains(true, &intr).unwrap());
        assert_eq!(intr.count(), 0);
    }

    #[test]
    fn event_idx_window_check() {
        let mem = guest_mem();
        let (mut vq, ring) = queue_with_ring(&mem, 16);
        vq.set_event_idx(true);
        vq.msix = MsixEntry {
            vector: 0,
            addr: 0xfee0_0000,
            data: 0x41,
        };
        let intr = CountingInterrupt::new();

        // used_event = 0: the driver wants an interrupt once used idx
        // passes 0.
        ring.set_used_event(0);
        vq.add_used(0, 10).unwrap();
        assert!(vq.finish_chains(false, &intr).unwrap());
        assert_eq!(intr.count(), 1);

        // used_event far ahead: suppressed.
        ring.set_used_event(10);
        vq.add_used(1, 10).unwrap();
        assert!(!vq.finish_chains(false, &intr).unwrap());
        assert_eq!(intr.count(), 1);
    }

    #[test]
    fn reset_clears_cursors_and_vector() {
        let mem = guest_mem();
        let (mut vq, ring) = queue_with_ring(&mem, 16);
        vq.msix = MsixEntry {
            vector: 3,
            addr: 0xfee0_0000,
            data: 0x41,
        };

        ring.write_desc(0, 0x9000, 64, 0, 0);
        ring.publish_avail(0);
        vq.pop_chain().unwrap().unwrap();

        vq.reset();
        assert_eq!(vq.pfn(), 0);
        assert_eq!(vq.msix.vector, VIRTQ_MSI_NO_VECTOR);
        assert!(!vq.is_allocated());
        // A reset queue reports no work and requires a fresh init.
        assert!(!vq.has_descs());
        assert!(matches!(vq.pop_chain(), Err(VirtQueueError::NotAllocated)));
    }
}
