// Copyright © 2019 Intel Corporation
//
// SPDX-License-Identifier: Apache-2.0 OR BSD-3-Clause

//! Legacy virtio ring constant definitions.

/// Marks a buffer as continuing via the next field.
pub const VIRTQ_DESC_F_NEXT: u16 = 0x1;

/// Marks a buffer as device write-only.
pub const VIRTQ_DESC_F_WRITE: u16 = 0x2;

/// Shows that the buffer contains a list of buffer descriptors.
pub const VIRTQ_DESC_F_INDIRECT: u16 = 0x4;

/// The driver does not want an interrupt when buffers are consumed.
pub const VRING_AVAIL_F_NO_INTERRUPT: u16 = 0x1;

/// The device does not want a notification when buffers are added.
pub const VIRTQ_USED_F_NO_NOTIFY: u16 = 0x1;

/// Vector value used to disable MSI for a queue.
pub const VIRTQ_MSI_NO_VECTOR: u16 = 0xffff;

/// Feature bit: interrupt when the device runs out of available buffers.
pub const VIRTIO_F_NOTIFY_ON_EMPTY: u64 = 24;

/// Feature bit: event-index based interrupt suppression.
pub const VIRTIO_RING_F_EVENT_IDX: u64 = 29;

/// One descriptor table entry: addr (le64) + len (le32) + flags (le16) +
/// next (le16).
pub const VIRTQ_DESCRIPTOR_SIZE: u64 = 16;

/// One element of the available ring (le16).
pub const VIRTQ_AVAIL_ELEMENT_SIZE: u64 = 2;

/// Avail ring header: flags (le16) + idx (le16).
pub const VIRTQ_AVAIL_RING_HEADER_SIZE: u64 = 4;

/// One element of the used ring: id (le32) + len (le32).
pub const VIRTQ_USED_ELEMENT_SIZE: u64 = 8;

/// Used ring header: flags (le16) + idx (le16).
pub const VIRTQ_USED_RING_HEADER_SIZE: u64 = 4;

/// Alignment boundary between the avail and used parts of a legacy ring.
pub const VQ_ALIGN: u64 = 4096;

/// Page shift used to turn a guest PFN into a guest physical address.
pub const PAGE_SHIFT: u64 = 12;

/// Hard bound on the number of descriptors walked per chain, independent of
/// the queue size. A guest-crafted cyclic chain is cut off after exactly
/// this many steps and the queue is marked broken.
pub const VQ_MAX_DESCRIPTORS: u16 = 512;
