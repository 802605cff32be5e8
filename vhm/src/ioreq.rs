// Copyright © 2019 Intel Corporation
//
// SPDX-License-Identifier: Apache-2.0 OR BSD-3-Clause

//! Multi-client dispatch of trapped guest I/O.
//!
//! The hypervisor parks a vCPU when the guest touches a trapped address and
//! deposits a request in the VM's shared buffer, one slot per vCPU. The
//! dispatcher routes each pending request to the backend client that claimed
//! the address, hands it over by flipping the slot to the in-service state,
//! and releases the vCPU once the client completes the request.
//!
//! Slot handover follows a strict protocol: the producer publishes the
//! payload before setting the valid flag with release ordering; the
//! dispatcher claims with a release store of the in-service state; the
//! owning client alone may complete. A request is never serviced twice.

use std::sync::atomic::{AtomicBool, AtomicI32, AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Condvar, Mutex, Weak};
use std::thread;
use std::time::Duration;

use log::{error, info, warn};
use thiserror::Error;

use vhm_hypercall::{HypercallError, HypercallTransport, VhmHypercalls};

use crate::vm::Vm;

/// Slots in the shared request buffer, one per vCPU.
pub const VHM_REQUEST_MAX: usize = 16;

/// Client table size; id 0 is reserved.
pub const MAX_CLIENT: usize = 64;

const CLIENT_NAME_LEN: usize = 16;

/// Request awaiting service.
pub const REQ_STATE_PENDING: u32 = 0;
/// Request completed by its client.
pub const REQ_STATE_SUCCESS: u32 = 1;
/// Request claimed by a client, service in progress.
pub const REQ_STATE_PROCESSING: u32 = 2;

pub const REQUEST_READ: u32 = 0;
pub const REQUEST_WRITE: u32 = 1;

const PCI_CONF1_ADDR: u64 = 0xcf8;
const PCI_CONF1_DATA: u64 = 0xcfc;
const PCI_CONF1_ENABLE: u32 = 0x8000_0000;

/// Kind of trapped access.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(u32)]
pub enum ReqKind {
    PortIo = 0,
    Mmio = 1,
    PciCfg = 2,
    WriteProtect = 3,
}

impl ReqKind {
    fn from_u32(v: u32) -> Option<Self> {
        match v {
            0 => Some(ReqKind::PortIo),
            1 => Some(ReqKind::Mmio),
            2 => Some(ReqKind::PciCfg),
            3 => Some(ReqKind::WriteProtect),
            _ => None,
        }
    }
}

#[derive(Error, Debug)]
pub enum IoreqError {
    #[error("client table is full")]
    NoFreeSlot,

    #[error("no client with id {0}")]
    UnknownClient(u16),

    #[error("VM {0} has no request buffer")]
    NoRequestBuffer(u64),

    #[error("VM {0} already has a fallback client")]
    FallbackExists(u64),

    #[error("invalid I/O range {start:#x}..={end:#x}")]
    InvalidRange { start: u64, end: u64 },

    #[error("I/O range {start:#x}..={end:#x} overlaps an existing claim")]
    RangeOverlap { start: u64, end: u64 },

    #[error("PCI config space is claimed per-BDF, not per-range")]
    PciCfgRange,

    #[error("vCPU index {0} out of range")]
    InvalidVcpu(u64),

    #[error("request on vCPU {vcpu} is not in service by client {client}")]
    StaleCompletion { client: u16, vcpu: u64 },

    #[error("VM {0} is gone")]
    VmGone(u64),

    #[error("failed to spawn client worker")]
    WorkerSpawn(#[source] std::io::Error),

    #[error("hypercall failed")]
    Hypercall(#[from] HypercallError),
}

pub type Result<T> = std::result::Result<T, IoreqError>;

/// One slot of the shared request buffer.
///
/// The layout is shared with the hypervisor producer, hence the C
/// representation and the atomic fields.
#[repr(C)]
#[derive(Default)]
pub struct VhmRequest {
    kind: AtomicU32,
    direction: AtomicU32,
    addr: AtomicU64,
    size: AtomicU64,
    value: AtomicU64,
    bus: AtomicU32,
    dev: AtomicU32,
    func: AtomicU32,
    reg: AtomicU32,
    valid: AtomicU32,
    processed: AtomicU32,
    client: AtomicI32,
}

impl VhmRequest {
    /// Producer-side publish: payload first, then the pending state, then
    /// the valid flag with release ordering.
    pub fn post(&self, kind: ReqKind, direction: u32, addr: u64, size: u64, value: u64) {
        self.kind.store(kind as u32, Ordering::Relaxed);
        self.direction.store(direction, Ordering::Relaxed);
        self.addr.store(addr, Ordering::Relaxed);
        self.size.store(size, Ordering::Relaxed);
        self.value.store(value, Ordering::Relaxed);
        self.client.store(-1, Ordering::Relaxed);
        self.processed.store(REQ_STATE_PENDING, Ordering::Relaxed);
        self.valid.store(1, Ordering::Release);
    }

    pub fn kind(&self) -> Option<ReqKind> {
        ReqKind::from_u32(self.kind.load(Ordering::Relaxed))
    }

    pub fn direction(&self) -> u32 {
        self.direction.load(Ordering::Relaxed)
    }

    pub fn addr(&self) -> u64 {
        self.addr.load(Ordering::Relaxed)
    }

    pub fn size(&self) -> u64 {
        self.size.load(Ordering::Relaxed)
    }

    pub fn value(&self) -> u64 {
        self.value.load(Ordering::Relaxed)
    }

    pub fn set_value(&self, value: u64) {
        self.value.store(value, Ordering::Relaxed);
    }

    pub fn bdf_reg(&self) -> (u32, u32, u32, u32) {
        (
            self.bus.load(Ordering::Relaxed),
            self.dev.load(Ordering::Relaxed),
            self.func.load(Ordering::Relaxed),
            self.reg.load(Ordering::Relaxed),
        )
    }

    pub fn state(&self) -> u32 {
        self.processed.load(Ordering::Acquire)
    }

    pub fn client(&self) -> i32 {
        self.client.load(Ordering::Relaxed)
    }

    /// Valid and still pending: eligible for dispatch.
    fn is_unserviced(&self) -> bool {
        self.valid.load(Ordering::Acquire) == 1 && self.state() == REQ_STATE_PENDING
    }

    fn claim(&self, client: u16) {
        self.client.store(i32::from(client), Ordering::Relaxed);
        self.processed.store(REQ_STATE_PROCESSING, Ordering::Release);
    }

    fn complete(&self) {
        self.processed.store(REQ_STATE_SUCCESS, Ordering::Release);
    }

    /// Move an in-service request to completed. Fails if the request is not
    /// in service, so a slot can never be completed twice.
    fn try_complete(&self) -> bool {
        self.processed
            .compare_exchange(
                REQ_STATE_PROCESSING,
                REQ_STATE_SUCCESS,
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .is_ok()
    }

    /// Rewrite a latched config-data access into a PCI config request.
    fn set_pci_cfg(&self, bus: u32, dev: u32, func: u32, reg: u32) {
        self.bus.store(bus, Ordering::Relaxed);
        self.dev.store(dev, Ordering::Relaxed);
        self.func.store(func, Ordering::Relaxed);
        self.reg.store(reg, Ordering::Relaxed);
        self.kind.store(ReqKind::PciCfg as u32, Ordering::Relaxed);
    }
}

/// The per-VM buffer shared with the hypervisor, one slot per vCPU.
#[derive(Default)]
pub struct RequestBuffer {
    slots: [VhmRequest; VHM_REQUEST_MAX],
}

impl RequestBuffer {
    pub fn new() -> Self {
        RequestBuffer {
            slots: std::array::from_fn(|_| VhmRequest::default()),
        }
    }

    pub fn slot(&self, vcpu: usize) -> &VhmRequest {
        &self.slots[vcpu]
    }
}

/// Latched 0xcf8 state for legacy PCI config mechanism #1.
#[derive(Default)]
pub(crate) struct PciCfgLatch {
    value: u32,
    enabled: bool,
}

/// Per-VM trapped-I/O bookkeeping, owned by [`Vm`].
pub(crate) struct VmIoreqState {
    pub(crate) req_buf: Mutex<Option<Arc<RequestBuffer>>>,
    clients: Mutex<Vec<u16>>,
    fallback: Mutex<Option<u16>>,
    latch: Mutex<PciCfgLatch>,
}

impl VmIoreqState {
    pub(crate) fn new() -> Self {
        VmIoreqState {
            req_buf: Mutex::new(None),
            clients: Mutex::new(Vec::new()),
            fallback: Mutex::new(None),
            latch: Mutex::new(PciCfgLatch::default()),
        }
    }
}

/// Handler invoked on a client worker thread with the client id and a
/// snapshot of the pending vCPU bitmap. The handler completes each request
/// it services.
pub type IoreqHandler = Arc<dyn Fn(u16, u64) -> anyhow::Result<()> + Send + Sync>;

/// How a client consumes its pending requests.
pub enum DeliveryMode {
    /// A dedicated worker thread invokes the handler.
    Callback(IoreqHandler),
    /// The client's own thread blocks in [`IoreqDispatcher::attach_client`].
    Blocking,
}

/// Cooperative cancellation handle for a blocking attach.
#[derive(Clone, Default)]
pub struct StopToken(Arc<AtomicBool>);

impl StopToken {
    pub fn new() -> Self {
        StopToken(Arc::new(AtomicBool::new(false)))
    }

    pub fn request_stop(&self) {
        self.0.store(true, Ordering::Release);
    }

    pub fn is_stopped(&self) -> bool {
        self.0.load(Ordering::Acquire)
    }
}

/// Result of attaching to a client.
#[derive(Debug, PartialEq, Eq)]
pub enum AttachOutcome {
    /// A worker thread now services the client.
    Worker,
    /// Pending vCPU bitmap for a blocking client.
    Pending(u64),
    /// The client is being torn down; do not attach again.
    Destroying,
    /// The caller's stop token was triggered.
    Stopped,
}

struct IoRange {
    kind: ReqKind,
    start: u64,
    end: u64,
}

struct IoreqClient {
    id: u16,
    name: String,
    vmid: u64,
    vm: Weak<Vm>,
    fallback: bool,
    mode: DeliveryMode,
    destroying: AtomicBool,
    active: AtomicBool,
    pending: AtomicU64,
    ranges: Mutex<Vec<IoRange>>,
    trap_bdf: Mutex<Option<(u32, u32, u32)>>,
    wait_lock: Mutex<()>,
    wait: Condvar,
    thread: Mutex<Option<thread::JoinHandle<()>>>,
}

impl IoreqClient {
    fn notify(&self) {
        let _guard = self.wait_lock.lock().unwrap();
        self.wait.notify_all();
    }
}

/// Routes trapped-I/O requests from per-VM buffers to backend clients.
pub struct IoreqDispatcher {
    transport: Arc<dyn HypercallTransport>,
    clients: Mutex<Vec<Option<Arc<IoreqClient>>>>,
}

impl IoreqDispatcher {
    pub fn new(transport: Arc<dyn HypercallTransport>) -> Self {
        IoreqDispatcher {
            transport,
            clients: Mutex::new((0..MAX_CLIENT).map(|_| None).collect()),
        }
    }

    fn get(&self, id: u16) -> Result<Arc<IoreqClient>> {
        self.clients
            .lock()
            .unwrap()
            .get(usize::from(id))
            .and_then(|slot| slot.clone())
            .ok_or(IoreqError::UnknownClient(id))
    }

    fn insert_client(
        &self,
        vm: &Arc<Vm>,
        mode: DeliveryMode,
        name: &str,
        fallback: bool,
    ) -> Result<u16> {
        if vm.request_buffer().is_none() {
            return Err(IoreqError::NoRequestBuffer(vm.vmid()));
        }

        let mut clients = self.clients.lock().unwrap();
        // Slot 0 stays reserved so a zero client id never looks valid.
        let id = (1..MAX_CLIENT)
            .find(|&i| clients[i].is_none())
            .ok_or(IoreqError::NoFreeSlot)? as u16;

        let client = Arc::new(IoreqClient {
            id,
            name: name.chars().take(CLIENT_NAME_LEN).collect(),
            vmid: vm.vmid(),
            vm: Arc::downgrade(vm),
            fallback,
            mode,
            destroying: AtomicBool::new(false),
            active: AtomicBool::new(false),
            pending: AtomicU64::new(0),
            ranges: Mutex::new(Vec::new()),
            trap_bdf: Mutex::new(None),
            wait_lock: Mutex::new(()),
            wait: Condvar::new(),
            thread: Mutex::new(None),
        });
        clients[usize::from(id)] = Some(client);
        drop(clients);

        vm.ioreq.clients.lock().unwrap().push(id);
        info!("created ioreq client {} ({}) for VM {}", id, name, vm.vmid());
        Ok(id)
    }

    /// Register a backend client for a VM. The VM must already have its
    /// request buffer set.
    pub fn create_client(&self, vm: &Arc<Vm>, mode: DeliveryMode, name: &str) -> Result<u16> {
        self.insert_client(vm, mode, name, false)
    }

    /// Register the VM's single fallback client, which receives every
    /// request no range client claims.
    pub fn create_fallback_client(&self, vm: &Arc<Vm>, name: &str) -> Result<u16> {
        let mut fallback = vm.ioreq.fallback.lock().unwrap();
        if fallback.is_some() {
            return Err(IoreqError::FallbackExists(vm.vmid()));
        }
        let id = self.insert_client(vm, DeliveryMode::Blocking, name, true)?;
        *fallback = Some(id);
        Ok(id)
    }

    /// Start servicing a client.
    ///
    /// Callback clients get a worker thread (spawned once); blocking clients
    /// park the calling thread until work, teardown or a stop request
    /// arrives.
    pub fn attach_client(&self, id: u16, stop: Option<&StopToken>) -> Result<AttachOutcome> {
        let client = self.get(id)?;
        if client.destroying.load(Ordering::Acquire) {
            return Ok(AttachOutcome::Destroying);
        }

        match &client.mode {
            DeliveryMode::Callback(handler) => {
                let mut thread_slot = client.thread.lock().unwrap();
                if thread_slot.is_none() {
                    client.active.store(true, Ordering::Release);
                    let worker = Arc::clone(&client);
                    let handler = Arc::clone(handler);
                    let spawned = thread::Builder::new()
                        .name(format!("ioreq-{}", client.name))
                        .spawn(move || Self::worker_loop(worker, handler));
                    match spawned {
                        Ok(handle) => *thread_slot = Some(handle),
                        Err(e) => {
                            client.active.store(false, Ordering::Release);
                            return Err(IoreqError::WorkerSpawn(e));
                        }
                    }
                }
                Ok(AttachOutcome::Worker)
            }
            DeliveryMode::Blocking => {
                let mut guard = client.wait_lock.lock().unwrap();
                loop {
                    if client.destroying.load(Ordering::Acquire) {
                        return Ok(AttachOutcome::Destroying);
                    }
                    if stop.is_some_and(StopToken::is_stopped) {
                        return Ok(AttachOutcome::Stopped);
                    }
                    let mask = client.pending.load(Ordering::Acquire);
                    if mask != 0 {
                        return Ok(AttachOutcome::Pending(mask));
                    }
                    // Timed wait so a lost wakeup cannot park us forever.
                    let (g, _) = client
                        .wait
                        .wait_timeout(guard, Duration::from_millis(10))
                        .unwrap();
                    guard = g;
                }
            }
        }
    }

    fn worker_loop(client: Arc<IoreqClient>, handler: IoreqHandler) {
        loop {
            if client.destroying.load(Ordering::Acquire) {
                break;
            }
            let mask = client.pending.load(Ordering::Acquire);
            if mask != 0 {
                if let Err(e) = handler(client.id, mask) {
                    error!("ioreq client {} handler failed: {:#}", client.name, e);
                    break;
                }
                continue;
            }
            // notify() holds `wait_lock` around notify_all, so rechecking the
            // mask under the lock cannot miss a wakeup. The timeout only
            // bounds the window around teardown.
            let guard = client.wait_lock.lock().unwrap();
            if client.pending.load(Ordering::Acquire) == 0
                && !client.destroying.load(Ordering::Acquire)
            {
                let _ = client
                    .wait
                    .wait_timeout(guard, Duration::from_millis(10))
                    .unwrap();
            }
        }
        client.active.store(false, Ordering::Release);
    }

    /// Tear a client down: stop its worker, drop its claims, free its slot.
    /// Idempotent; a blocked attach observes `Destroying` and returns.
    pub fn destroy_client(&self, id: u16) -> Result<()> {
        let client = self.get(id)?;
        if client.destroying.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        client.notify();

        let handle = client.thread.lock().unwrap().take();
        if let Some(handle) = handle {
            if handle.thread().id() != thread::current().id() {
                let _ = handle.join();
            }
        }
        while client.active.load(Ordering::Acquire) {
            thread::sleep(Duration::from_millis(10));
        }

        client.ranges.lock().unwrap().clear();
        *client.trap_bdf.lock().unwrap() = None;

        if let Some(vm) = client.vm.upgrade() {
            // Requests still claimed by the dying client would park their
            // vCPUs forever; force-complete them with the open-bus response
            // before the slot goes away.
            if let Some(buf) = vm.request_buffer() {
                for vcpu in 0..VHM_REQUEST_MAX as u64 {
                    let slot = buf.slot(vcpu as usize);
                    if slot.client() == i32::from(id) && slot.state() == REQ_STATE_PROCESSING {
                        warn!(
                            "force-completing request on vCPU {} claimed by dying client {}",
                            vcpu, id
                        );
                        if let Err(e) = self.finish_unclaimed(&vm, slot, vcpu) {
                            warn!("failed to force-complete vCPU {}: {}", vcpu, e);
                        }
                    }
                }
            }
            client.pending.store(0, Ordering::Release);

            vm.ioreq.clients.lock().unwrap().retain(|&c| c != id);
            let mut fallback = vm.ioreq.fallback.lock().unwrap();
            if *fallback == Some(id) {
                *fallback = None;
            }
        }

        self.clients.lock().unwrap()[usize::from(id)] = None;
        info!("destroyed ioreq client {} ({})", id, client.name);
        Ok(())
    }

    /// Claim an address range for a client. Ranges of the same kind may not
    /// overlap across the VM's clients.
    pub fn add_iorange(&self, id: u16, kind: ReqKind, start: u64, end: u64) -> Result<()> {
        if kind == ReqKind::PciCfg {
            return Err(IoreqError::PciCfgRange);
        }
        if end < start {
            return Err(IoreqError::InvalidRange { start, end });
        }

        let client = self.get(id)?;
        {
            let clients = self.clients.lock().unwrap();
            for other in clients.iter().flatten() {
                if other.vmid != client.vmid {
                    continue;
                }
                let ranges = other.ranges.lock().unwrap();
                if ranges
                    .iter()
                    .any(|r| r.kind == kind && start <= r.end && r.start <= end)
                {
                    return Err(IoreqError::RangeOverlap { start, end });
                }
            }
        }
        client.ranges.lock().unwrap().push(IoRange { kind, start, end });
        Ok(())
    }

    /// Release a previously claimed range. Only exact matches are removed.
    pub fn del_iorange(&self, id: u16, kind: ReqKind, start: u64, end: u64) -> Result<()> {
        let client = self.get(id)?;
        client
            .ranges
            .lock()
            .unwrap()
            .retain(|r| !(r.kind == kind && r.start == start && r.end == end));
        Ok(())
    }

    /// Claim one PCI device (bus/device/function) for a client.
    pub fn intercept_bdf(&self, id: u16, bus: u32, dev: u32, func: u32) -> Result<()> {
        let client = self.get(id)?;
        *client.trap_bdf.lock().unwrap() = Some((bus, dev, func));
        Ok(())
    }

    pub fn unintercept_bdf(&self, id: u16) -> Result<()> {
        let client = self.get(id)?;
        *client.trap_bdf.lock().unwrap() = None;
        Ok(())
    }

    /// Complete one request on behalf of its owning client and release the
    /// parked vCPU.
    ///
    /// Only the client a request was claimed for may complete it, and only
    /// while it is in service: a double or misdirected completion fails
    /// without touching the slot or the hypervisor.
    pub fn complete_request(&self, id: u16, vcpu: u64) -> Result<()> {
        if vcpu >= VHM_REQUEST_MAX as u64 {
            return Err(IoreqError::InvalidVcpu(vcpu));
        }
        let client = self.get(id)?;
        let vm = client.vm.upgrade().ok_or(IoreqError::VmGone(client.vmid))?;
        let buf = vm
            .request_buffer()
            .ok_or(IoreqError::NoRequestBuffer(client.vmid))?;

        let slot = buf.slot(vcpu as usize);
        if slot.client() != i32::from(id) || !slot.try_complete() {
            return Err(IoreqError::StaleCompletion { client: id, vcpu });
        }
        client.pending.fetch_and(!(1 << vcpu), Ordering::AcqRel);
        vm.transport().notify_req_finish(vm.vmid(), vcpu)?;
        Ok(())
    }

    /// Route every unserviced request in the VM's buffer to a client.
    ///
    /// Requests nothing claims are completed on the spot: reads observe
    /// all-ones (masked to the access width), writes are discarded.
    pub fn distribute_requests(&self, vm: &Arc<Vm>) -> Result<()> {
        let buf = vm
            .request_buffer()
            .ok_or(IoreqError::NoRequestBuffer(vm.vmid()))?;

        let nslots = (vm.vcpu_num() as usize).min(VHM_REQUEST_MAX);
        for vcpu in 0..nslots as u64 {
            let slot = buf.slot(vcpu as usize);
            if !slot.is_unserviced() {
                continue;
            }

            if self.handle_cf8cfc(vm, slot) {
                slot.complete();
                self.transport.notify_req_finish(vm.vmid(), vcpu)?;
                continue;
            }

            match self.find_client_for(vm, slot) {
                Some(client) => {
                    slot.claim(client.id);
                    client.pending.fetch_or(1 << vcpu, Ordering::AcqRel);
                    client.notify();
                }
                None => {
                    warn!(
                        "no client for VM {} {:?} access at {:#x}, completing as open bus",
                        vm.vmid(),
                        slot.kind(),
                        slot.addr()
                    );
                    self.finish_unclaimed(vm, slot, vcpu)?;
                }
            }
        }
        Ok(())
    }

    /// Emulate PCI config mechanism #1 at ports 0xcf8/0xcfc.
    ///
    /// Accesses to the address port are latched per VM and handled here
    /// entirely (returns true). Data-port accesses with the latch enabled
    /// are rewritten into PCI config requests and routed normally.
    fn handle_cf8cfc(&self, vm: &Arc<Vm>, slot: &VhmRequest) -> bool {
        if slot.kind() != Some(ReqKind::PortIo) {
            return false;
        }
        let addr = slot.addr();
        if addr == PCI_CONF1_ADDR && slot.size() == 4 {
            let mut latch = vm.ioreq.latch.lock().unwrap();
            if slot.direction() == REQUEST_WRITE {
                latch.value = slot.value() as u32;
                latch.enabled = latch.value & PCI_CONF1_ENABLE != 0;
            } else {
                slot.set_value(u64::from(latch.value));
            }
            return true;
        }
        if (PCI_CONF1_DATA..PCI_CONF1_DATA + 4).contains(&addr) {
            let latch = vm.ioreq.latch.lock().unwrap();
            if latch.enabled {
                let offset = latch.value;
                slot.set_pci_cfg(
                    (offset >> 16) & 0xff,
                    (offset >> 11) & 0x1f,
                    (offset >> 8) & 0x7,
                    (offset & 0xfc) + (addr as u32 - PCI_CONF1_DATA as u32),
                );
            }
        }
        false
    }

    fn find_client_for(&self, vm: &Arc<Vm>, slot: &VhmRequest) -> Option<Arc<IoreqClient>> {
        let kind = slot.kind()?;
        let ids: Vec<u16> = vm.ioreq.clients.lock().unwrap().clone();
        let clients = self.clients.lock().unwrap();

        let mut fallback = None;
        for id in ids {
            let Some(client) = clients[usize::from(id)].as_ref() else {
                continue;
            };
            if client.destroying.load(Ordering::Acquire) {
                continue;
            }
            if client.fallback {
                fallback = Some(Arc::clone(client));
                continue;
            }
            let claimed = match kind {
                ReqKind::PciCfg => {
                    let (bus, dev, func, _) = slot.bdf_reg();
                    *client.trap_bdf.lock().unwrap() == Some((bus, dev, func))
                }
                _ => {
                    let addr = slot.addr();
                    let len = slot.size().max(1);
                    // Guest-controlled address and size; avoid wrapping.
                    client.ranges.lock().unwrap().iter().any(|r| {
                        r.kind == kind
                            && addr >= r.start
                            && addr
                                .checked_add(len - 1)
                                .map_or(false, |last| last <= r.end)
                    })
                }
            };
            if claimed {
                return Some(Arc::clone(client));
            }
        }
        fallback
    }

    fn finish_unclaimed(&self, vm: &Arc<Vm>, slot: &VhmRequest, vcpu: u64) -> Result<()> {
        if slot.direction() == REQUEST_READ {
            let size = slot.size();
            let mask = if size >= 8 {
                u64::MAX
            } else {
                (1u64 << (8 * size)) - 1
            };
            slot.set_value(mask);
        }
        slot.complete();
        self.transport.notify_req_finish(vm.vmid(), vcpu)?;
        Ok(())
    }

    /// Destroy every client of a VM. Called from the VM's teardown path.
    pub(crate) fn free_vm_ioreq(&self, vm: &Vm) {
        let ids: Vec<u16> = vm.ioreq.clients.lock().unwrap().clone();
        for id in ids {
            if let Err(e) = self.destroy_client(id) {
                warn!("failed to destroy ioreq client {}: {}", id, e);
            }
        }
        vm.ioreq.clients.lock().unwrap().clear();
        *vm.ioreq.fallback.lock().unwrap() = None;
    }
}
