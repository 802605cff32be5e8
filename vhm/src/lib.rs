// Copyright © 2019 Intel Corporation
//
// SPDX-License-Identifier: Apache-2.0 OR BSD-3-Clause

//! VM lifecycle and trapped-I/O plumbing for the backend service core.
//!
//! The [`vm::VmManager`] owns the registry of service-managed VMs; each
//! [`vm::Vm`] bundles the guest memory view and its share of the trapped-I/O
//! state. The [`ioreq`] module multiplexes the per-VM request buffer across
//! backend clients, each claiming the address ranges it emulates.

pub mod ioreq;
pub mod vm;

pub use ioreq::{
    AttachOutcome, DeliveryMode, IoreqDispatcher, IoreqError, ReqKind, RequestBuffer, StopToken,
    VhmRequest, MAX_CLIENT, VHM_REQUEST_MAX,
};
pub use vm::{Vm, VmError, VmManager};

pub type GuestMemoryMmap = vm_memory::GuestMemoryMmap<vm_memory::bitmap::AtomicBitmap>;
pub type GuestMemoryAtomic = vm_memory::GuestMemoryAtomic<GuestMemoryMmap>;
