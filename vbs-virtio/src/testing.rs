// Copyright © 2019 Intel Corporation
//
// SPDX-License-Identifier: Apache-2.0 OR BSD-3-Clause

//! Guest-side ring driver for tests.
//!
//! `GuestRing` plays the part of the guest: it lays a legacy ring out at a
//! page frame number using the same layout rules the device uses, writes
//! descriptors, publishes available entries and inspects the used ring.

use std::cell::Cell;
use std::sync::atomic::Ordering;

use vm_memory::{Bytes, GuestAddress, GuestMemory};

use crate::defs::{
    PAGE_SHIFT, VIRTQ_AVAIL_ELEMENT_SIZE, VIRTQ_AVAIL_RING_HEADER_SIZE, VIRTQ_DESCRIPTOR_SIZE,
    VIRTQ_USED_ELEMENT_SIZE, VIRTQ_USED_RING_HEADER_SIZE,
};
use crate::{ring_layout, Descriptor, RingLayout, VirtqUsedElem};

pub struct GuestRing<'a, M: GuestMemory> {
    mem: &'a M,
    qsize: u16,
    layout: RingLayout,
    avail_count: Cell<u16>,
}

impl<'a, M: GuestMemory> GuestRing<'a, M> {
    /// Lay out and zero a ring at the given page frame number.
    pub fn new(mem: &'a M, pfn: u64, qsize: u16) -> Self {
        let layout = ring_layout(pfn << PAGE_SHIFT, qsize);
        let zero = vec![0u8; layout.size as usize];
        mem.write_slice(&zero, GuestAddress(layout.desc_table))
            .unwrap();
        GuestRing {
            mem,
            qsize,
            layout,
            avail_count: Cell::new(0),
        }
    }

    /// Fill one descriptor table entry.
    pub fn write_desc(&self, index: u16, addr: u64, len: u32, flags: u16, next: u16) {
        let desc = Descriptor {
            addr,
            len,
            flags,
            next,
        };
        let entry = self.layout.desc_table + u64::from(index) * VIRTQ_DESCRIPTOR_SIZE;
        self.mem.write_obj(desc, GuestAddress(entry)).unwrap();
    }

    /// Publish a chain head on the available ring and bump the index.
    pub fn publish_avail(&self, head: u16) {
        let count = self.avail_count.get();
        let slot = u64::from(count % self.qsize);
        let entry = self.layout.avail_ring
            + VIRTQ_AVAIL_RING_HEADER_SIZE
            + slot * VIRTQ_AVAIL_ELEMENT_SIZE;
        self.mem.write_obj(head, GuestAddress(entry)).unwrap();
        self.avail_count.set(count.wrapping_add(1));
        self.mem
            .store(
                self.avail_count.get(),
                GuestAddress(self.layout.avail_ring + 2),
                Ordering::Release,
            )
            .unwrap();
    }

    pub fn set_avail_flags(&self, flags: u16) {
        self.mem
            .store(
                flags,
                GuestAddress(self.layout.avail_ring),
                Ordering::Release,
            )
            .unwrap();
    }

    /// Set the `used_event` suppression field past the avail ring.
    pub fn set_used_event(&self, event: u16) {
        let addr = self.layout.avail_ring
            + VIRTQ_AVAIL_RING_HEADER_SIZE
            + VIRTQ_AVAIL_ELEMENT_SIZE * u64::from(self.qsize);
        self.mem
            .store(event, GuestAddress(addr), Ordering::Release)
            .unwrap();
    }

    pub fn used_idx(&self) -> u16 {
        self.mem
            .load(GuestAddress(self.layout.used_ring + 2), Ordering::Acquire)
            .unwrap()
    }

    /// Read back a used ring element as `(id, len)`.
    pub fn used_elem(&self, slot: u16) -> (u32, u32) {
        let entry = self.layout.used_ring
            + VIRTQ_USED_RING_HEADER_SIZE
            + u64::from(slot % self.qsize) * VIRTQ_USED_ELEMENT_SIZE;
        let elem: VirtqUsedElem = self.mem.read_obj(GuestAddress(entry)).unwrap();
        (elem.id, elem.len)
    }
}
