// Copyright © 2019 Intel Corporation
//
// SPDX-License-Identifier: Apache-2.0 OR BSD-3-Clause

//! Virtio backend device runtime.
//!
//! A [`VbsDevice`] is the per-device bridge between a control surface and
//! the ring engine: the control plane pushes a [`VbsRequest::SetDev`] naming
//! the VM and the queue count, then a [`VbsRequest::SetVq`] with the guest
//! ring placements. Once configured, guest kicks are funneled in (directly
//! or through a trapped-I/O client registered with
//! [`register_kick_client`]), descriptor chains flow to the
//! [`VirtioBackend`] and completions go back through the used ring with MSI
//! notification.

use std::sync::Arc;

use anyhow::Context;
use log::{debug, error, warn};
use thiserror::Error;

use vbs_virtio::defs::{VIRTIO_F_NOTIFY_ON_EMPTY, VIRTIO_RING_F_EVENT_IDX};
use vbs_virtio::{DescChain, MsixEntry, VirtQueue, VirtQueueError, VirtioInterrupt};
use vhm::ioreq::{IoreqHandler, REQUEST_WRITE};
use vhm::{
    DeliveryMode, GuestMemoryAtomic, IoreqDispatcher, IoreqError, ReqKind, Vm, VmError, VmManager,
    VHM_REQUEST_MAX,
};

/// Device names are capped at this many characters.
pub const VBS_NAME_LEN: usize = 32;

#[derive(Error, Debug)]
pub enum VbsError {
    #[error("request not addressed to this device")]
    Unhandled,

    #[error("queue count mismatch: got {got}, device has {have}")]
    NotTheSameDevice { got: u16, have: u16 },

    #[error("no VM with id {0}")]
    VmNotFound(u64),

    #[error("device has not been configured")]
    NotConfigured,

    #[error("failed to initialize queue {index}")]
    VqInit {
        index: u16,
        #[source]
        source: VirtQueueError,
    },

    #[error("queue error")]
    Queue(#[from] VirtQueueError),

    #[error("VM error")]
    Vm(#[from] VmError),

    #[error("trapped-I/O error")]
    Ioreq(#[from] IoreqError),
}

pub type Result<T> = std::result::Result<T, VbsError>;

/// Device identity and trap window, pushed by the control plane.
#[derive(Clone, Debug)]
pub struct DeviceInfo {
    pub name: String,
    pub vmid: u64,
    pub nvq: u16,
    pub negotiated_features: u64,
    pub io_range_start: u64,
    pub io_range_len: u64,
    pub io_range_kind: ReqKind,
}

/// Guest-supplied placement of one virtqueue.
#[derive(Clone, Copy, Debug)]
pub struct VqConfig {
    pub qsize: u16,
    pub pfn: u64,
    pub msix: MsixEntry,
}

/// Placement of every queue of a device, pushed after [`DeviceInfo`].
#[derive(Clone, Debug)]
pub struct VqsInfo {
    pub nvq: u16,
    pub vqs: Vec<VqConfig>,
}

/// Control-plane request routed across the registered devices.
#[derive(Clone, Debug)]
pub enum VbsRequest {
    SetDev(DeviceInfo),
    SetVq(VqsInfo),
    Reset,
}

/// A device that can take part in control-plane request dispatch.
pub trait VbsRequestHandler {
    fn handle_request(&mut self, req: &VbsRequest) -> Result<()>;
}

/// Offer a request to each handler in turn until one takes it.
///
/// `Unhandled` means "not mine, keep going"; any other result, success or
/// failure, ends the chain.
pub fn dispatch_request(handlers: &mut [&mut dyn VbsRequestHandler], req: &VbsRequest) -> Result<()> {
    for handler in handlers.iter_mut() {
        match handler.handle_request(req) {
            Err(VbsError::Unhandled) => continue,
            other => return other,
        }
    }
    Err(VbsError::Unhandled)
}

/// Consumes descriptor chains on behalf of a device.
pub trait VirtioBackend: Send {
    /// Process one chain, returning the number of bytes written to the
    /// chain's device-writable segments.
    fn process_chain(&mut self, queue_index: u16, chain: &DescChain) -> u32;
}

/// Delivers queue interrupts as MSIs through the hypervisor.
pub struct MsiInterrupt {
    vm: Arc<Vm>,
}

impl MsiInterrupt {
    pub fn new(vm: Arc<Vm>) -> Self {
        MsiInterrupt { vm }
    }
}

impl VirtioInterrupt for MsiInterrupt {
    fn trigger(&self, msix: &MsixEntry) -> std::io::Result<()> {
        self.vm
            .inject_msi(msix.addr, u64::from(msix.data))
            .map_err(std::io::Error::other)
    }
}

/// One virtio device served from the backend side.
pub struct VbsDevice {
    mgr: Arc<VmManager>,
    name: String,
    vm: Option<Arc<Vm>>,
    features: u64,
    io_range: Option<(ReqKind, u64, u64)>,
    vqs: Vec<VirtQueue<GuestMemoryAtomic>>,
}

impl VbsDevice {
    /// A device answering to `name` in control-plane dispatch.
    pub fn new(mgr: Arc<VmManager>, name: &str) -> Self {
        VbsDevice {
            mgr,
            name: name.chars().take(VBS_NAME_LEN).collect(),
            vm: None,
            features: 0,
            io_range: None,
            vqs: Vec::new(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn vm(&self) -> Option<&Arc<Vm>> {
        self.vm.as_ref()
    }

    /// The trap window registered by `SetDev`, as (kind, start, end).
    pub fn io_range(&self) -> Option<(ReqKind, u64, u64)> {
        self.io_range
    }

    /// Bind the device to its VM and allocate the (still unconfigured)
    /// queues.
    pub fn set_dev_info(&mut self, info: &DeviceInfo) -> Result<()> {
        let vm = self
            .mgr
            .find_get(info.vmid)
            .ok_or(VbsError::VmNotFound(info.vmid))?;
        let mem = vm.guest_memory()?;

        self.vqs = (0..info.nvq)
            .map(|_| VirtQueue::new(mem.clone(), 0))
            .collect();
        self.features = info.negotiated_features;
        self.io_range = (info.io_range_len > 0).then(|| {
            (
                info.io_range_kind,
                info.io_range_start,
                info.io_range_start + info.io_range_len - 1,
            )
        });
        debug!(
            "device {} bound to VM {} with {} queue(s)",
            self.name, info.vmid, info.nvq
        );
        self.vm = Some(vm);
        Ok(())
    }

    /// Configure and initialize every queue from guest-supplied placements.
    ///
    /// A queue-count mismatch rejects the whole request before any queue is
    /// touched.
    pub fn set_vq_info(&mut self, info: &VqsInfo) -> Result<()> {
        if self.vm.is_none() {
            return Err(VbsError::NotConfigured);
        }
        let have = self.vqs.len() as u16;
        if info.nvq != have || info.vqs.len() != usize::from(have) {
            return Err(VbsError::NotTheSameDevice {
                got: info.nvq,
                have,
            });
        }

        let event_idx = self.features & (1 << VIRTIO_RING_F_EVENT_IDX) != 0;
        let notify_on_empty = self.features & (1 << VIRTIO_F_NOTIFY_ON_EMPTY) != 0;
        for (index, (vq, cfg)) in self.vqs.iter_mut().zip(info.vqs.iter()).enumerate() {
            vq.set_size(cfg.qsize);
            vq.msix = cfg.msix;
            vq.set_event_idx(event_idx);
            vq.set_notify_on_empty(notify_on_empty);
            vq.init(cfg.pfn).map_err(|source| VbsError::VqInit {
                index: index as u16,
                source,
            })?;
        }
        Ok(())
    }

    /// Return every queue to the unconfigured state. Idempotent.
    pub fn reset_queues(&mut self) {
        for vq in &mut self.vqs {
            vq.reset();
        }
    }

    /// Drain one queue: walk every published chain through the backend,
    /// publish the used elements and raise the interrupt if the guest wants
    /// one. Returns whether an interrupt was injected.
    pub fn kick_queue(
        &mut self,
        index: u16,
        backend: &mut dyn VirtioBackend,
        intr: &dyn VirtioInterrupt,
    ) -> Result<bool> {
        let vq = self
            .vqs
            .get_mut(usize::from(index))
            .ok_or(VbsError::NotConfigured)?;
        if !vq.is_allocated() {
            // Kicks can race device reset; nothing to do.
            return Ok(false);
        }

        while let Some(chain) = vq.pop_chain()? {
            let written = backend.process_chain(index, &chain);
            vq.add_used(chain.head_index(), written)?;
        }
        Ok(vq.finish_chains(true, intr)?)
    }

    /// Drain every queue of the device.
    pub fn kick(
        &mut self,
        backend: &mut dyn VirtioBackend,
        intr: &dyn VirtioInterrupt,
    ) -> Result<()> {
        for index in 0..self.vqs.len() as u16 {
            self.kick_queue(index, backend, intr)?;
        }
        Ok(())
    }
}

impl VbsRequestHandler for VbsDevice {
    fn handle_request(&mut self, req: &VbsRequest) -> Result<()> {
        match req {
            VbsRequest::SetDev(info) => {
                if info.name != self.name {
                    return Err(VbsError::Unhandled);
                }
                self.set_dev_info(info)
            }
            VbsRequest::SetVq(info) => {
                if self.vm.is_none() {
                    return Err(VbsError::Unhandled);
                }
                self.set_vq_info(info)
            }
            VbsRequest::Reset => {
                if self.vm.is_none() {
                    return Err(VbsError::Unhandled);
                }
                self.reset_queues();
                Ok(())
            }
        }
    }
}

/// Invoked with the queue index the guest kicked.
pub type KickFn = Arc<dyn Fn(u16) -> anyhow::Result<()> + Send + Sync>;

/// Register a trapped-I/O client that turns guest queue-notify writes into
/// kicks.
///
/// The client claims `[start, end]` of the given kind for the VM, services
/// it on a worker thread and completes every request it receives; writes
/// carry the kicked queue index in the request value, reads are completed
/// without effect. Returns the client id, for teardown via
/// [`IoreqDispatcher::destroy_client`].
pub fn register_kick_client(
    dispatcher: &Arc<IoreqDispatcher>,
    vm: &Arc<Vm>,
    name: &str,
    kind: ReqKind,
    start: u64,
    end: u64,
    kick: KickFn,
) -> Result<u16> {
    let weak_dispatcher = Arc::downgrade(dispatcher);
    let weak_vm = Arc::downgrade(vm);
    let handler: IoreqHandler = Arc::new(move |client_id, mask| {
        let (Some(dispatcher), Some(vm)) = (weak_dispatcher.upgrade(), weak_vm.upgrade()) else {
            // VM teardown in progress; the worker exits on its own.
            return Ok(());
        };
        let buf = vm.request_buffer().context("request buffer gone")?;
        for vcpu in 0..VHM_REQUEST_MAX as u64 {
            if mask & (1 << vcpu) == 0 {
                continue;
            }
            let slot = buf.slot(vcpu as usize);
            if slot.direction() == REQUEST_WRITE {
                if let Err(e) = kick(slot.value() as u16) {
                    error!("kick for queue {} failed: {:#}", slot.value(), e);
                }
            } else {
                warn!("read from queue-notify window at {:#x}", slot.addr());
            }
            dispatcher.complete_request(client_id, vcpu)?;
        }
        Ok(())
    });

    let id = dispatcher.create_client(vm, DeliveryMode::Callback(handler), name)?;
    dispatcher.add_iorange(id, kind, start, end)?;
    dispatcher.attach_client(id, None)?;
    Ok(id)
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;
    use std::thread;
    use std::time::Duration;

    use vbs_virtio::defs::VRING_AVAIL_F_NO_INTERRUPT;
    use vbs_virtio::testing::GuestRing;
    use vhm_hypercall::mock::MockTransport;
    use vhm_hypercall::HypercallId;

    use super::*;

    const TEST_PFN: u64 = 0x40;

    struct EchoBackend {
        seen: Vec<(u16, usize)>,
    }

    impl EchoBackend {
        fn new() -> Self {
            EchoBackend { seen: Vec::new() }
        }
    }

    impl VirtioBackend for EchoBackend {
        fn process_chain(&mut self, queue_index: u16, chain: &DescChain) -> u32 {
            self.seen.push((queue_index, chain.segments().len()));
            chain.writable().map(|sg| sg.len).sum()
        }
    }

    fn setup(
        vcpus: u32,
    ) -> (
        Arc<MockTransport>,
        Arc<VmManager>,
        Arc<Vm>,
        vhm::GuestMemoryMmap,
    ) {
        let t = Arc::new(MockTransport::new());
        let mgr = Arc::new(VmManager::new(Arc::<MockTransport>::clone(&t)));
        let vm = mgr.create_vm(vcpus).unwrap();
        vm.set_ioreq_buffer().unwrap();
        let mem = vhm::GuestMemoryMmap::from_ranges(&[(
            vm_memory::GuestAddress(0),
            0x100_0000,
        )])
        .unwrap();
        vm.set_guest_memory(mem.clone());
        (t, mgr, vm, mem)
    }

    fn blk_info(vmid: u64, nvq: u16) -> DeviceInfo {
        DeviceInfo {
            name: "blk".into(),
            vmid,
            nvq,
            negotiated_features: 0,
            io_range_start: 0xc000,
            io_range_len: 0x10,
            io_range_kind: ReqKind::PortIo,
        }
    }

    fn one_queue(qsize: u16) -> VqsInfo {
        VqsInfo {
            nvq: 1,
            vqs: vec![VqConfig {
                qsize,
                pfn: TEST_PFN,
                msix: MsixEntry {
                    vector: 0,
                    addr: 0xfee0_0000,
                    data: 0x41,
                },
            }],
        }
    }

    #[test]
    fn configured_device_services_a_chain() {
        let (t, mgr, vm, mem) = setup(1);
        let ring = GuestRing::new(&mem, TEST_PFN, 256);

        let mut dev = VbsDevice::new(Arc::clone(&mgr), "blk");
        dev.handle_request(&VbsRequest::SetDev(blk_info(vm.vmid(), 1)))
            .unwrap();
        dev.handle_request(&VbsRequest::SetVq(one_queue(256)))
            .unwrap();

        ring.write_desc(0, 0x9000, 64, 0x1, 1);
        ring.write_desc(1, 0xa000, 128, 0x2, 0);
        ring.publish_avail(0);

        let mut backend = EchoBackend::new();
        let intr = MsiInterrupt::new(Arc::clone(&vm));
        assert!(dev.kick_queue(0, &mut backend, &intr).unwrap());

        assert_eq!(backend.seen, vec![(0, 2)]);
        assert_eq!(ring.used_idx(), 1);
        assert_eq!(ring.used_elem(0), (0, 128));
        assert_eq!(t.count(HypercallId::InjectMsi), 1);

        // With interrupts suppressed the guest is not notified, but the
        // used ring still advances.
        ring.set_avail_flags(VRING_AVAIL_F_NO_INTERRUPT);
        ring.write_desc(2, 0x9000, 32, 0, 0);
        ring.publish_avail(2);
        assert!(!dev.kick_queue(0, &mut backend, &intr).unwrap());
        assert_eq!(ring.used_idx(), 2);
        assert_eq!(t.count(HypercallId::InjectMsi), 1);
    }

    #[test]
    fn queue_count_mismatch_rejects_without_touching_queues() {
        let (_t, mgr, vm, _mem) = setup(1);
        let mut dev = VbsDevice::new(Arc::clone(&mgr), "blk");
        dev.set_dev_info(&blk_info(vm.vmid(), 2)).unwrap();

        let mut info = one_queue(256);
        info.nvq = 3;
        info.vqs = vec![info.vqs[0]; 3];
        match dev.set_vq_info(&info) {
            Err(VbsError::NotTheSameDevice { got: 3, have: 2 }) => {}
            other => panic!("unexpected result: {other:?}"),
        }
        assert!(dev.vqs.iter().all(|vq| !vq.is_allocated()));
    }

    #[test]
    fn set_vq_requires_set_dev_first() {
        let (_t, mgr, _vm, _mem) = setup(1);
        let mut dev = VbsDevice::new(mgr, "blk");
        assert!(matches!(
            dev.set_vq_info(&one_queue(256)),
            Err(VbsError::NotConfigured)
        ));
    }

    #[test]
    fn set_dev_rejects_unknown_vm() {
        let (_t, mgr, _vm, _mem) = setup(1);
        let mut dev = VbsDevice::new(mgr, "blk");
        assert!(matches!(
            dev.set_dev_info(&blk_info(0xbeef, 1)),
            Err(VbsError::VmNotFound(0xbeef))
        ));
    }

    #[test]
    fn dispatch_walks_the_handler_chain() {
        let (_t, mgr, vm, _mem) = setup(1);
        let mut blk = VbsDevice::new(Arc::clone(&mgr), "blk");
        let mut net = VbsDevice::new(Arc::clone(&mgr), "net");

        let mut info = blk_info(vm.vmid(), 1);
        info.name = "net".into();
        dispatch_request(
            &mut [&mut blk as &mut dyn VbsRequestHandler, &mut net],
            &VbsRequest::SetDev(info),
        )
        .unwrap();
        assert!(net.vm().is_some());
        assert!(blk.vm().is_none());

        let mut info = blk_info(vm.vmid(), 1);
        info.name = "console".into();
        assert!(matches!(
            dispatch_request(
                &mut [&mut blk as &mut dyn VbsRequestHandler, &mut net],
                &VbsRequest::SetDev(info)
            ),
            Err(VbsError::Unhandled)
        ));
    }

    #[test]
    fn reset_makes_kicks_benign() {
        let (t, mgr, vm, mem) = setup(1);
        let ring = GuestRing::new(&mem, TEST_PFN, 16);

        let mut dev = VbsDevice::new(Arc::clone(&mgr), "blk");
        dev.set_dev_info(&blk_info(vm.vmid(), 1)).unwrap();
        dev.set_vq_info(&one_queue(16)).unwrap();

        dev.handle_request(&VbsRequest::Reset).unwrap();
        dev.handle_request(&VbsRequest::Reset).unwrap();

        ring.write_desc(0, 0x9000, 64, 0, 0);
        ring.publish_avail(0);

        let mut backend = EchoBackend::new();
        let intr = MsiInterrupt::new(Arc::clone(&vm));
        assert!(!dev.kick_queue(0, &mut backend, &intr).unwrap());
        assert!(backend.seen.is_empty());
        assert_eq!(t.count(HypercallId::InjectMsi), 0);

        // Reconfiguring brings the queue back.
        dev.set_vq_info(&one_queue(16)).unwrap();
        assert!(dev.kick_queue(0, &mut backend, &intr).unwrap());
        assert_eq!(backend.seen.len(), 1);
    }

    #[test]
    fn guest_kick_flows_through_the_trap_window() {
        let (t, mgr, vm, mem) = setup(1);
        let ring = GuestRing::new(&mem, TEST_PFN, 16);

        let mut dev = VbsDevice::new(Arc::clone(&mgr), "blk");
        dev.set_dev_info(&blk_info(vm.vmid(), 1)).unwrap();
        dev.set_vq_info(&one_queue(16)).unwrap();
        let (kind, start, end) = dev.io_range().unwrap();

        let dev = Arc::new(Mutex::new(dev));
        let backend = Arc::new(Mutex::new(EchoBackend::new()));
        let intr = Arc::new(MsiInterrupt::new(Arc::clone(&vm)));

        let kick_dev = Arc::clone(&dev);
        let kick_backend = Arc::clone(&backend);
        let kick_intr = Arc::clone(&intr);
        let kick: KickFn = Arc::new(move |queue| {
            kick_dev.lock().unwrap().kick_queue(
                queue,
                &mut *kick_backend.lock().unwrap(),
                &*kick_intr,
            )?;
            Ok(())
        });
        let client =
            register_kick_client(mgr.ioreq(), &vm, "blk-kick", kind, start, end, kick).unwrap();

        ring.write_desc(0, 0x9000, 64, 0x2, 0);
        ring.publish_avail(0);

        let buf = vm.request_buffer().unwrap();
        buf.slot(0).post(ReqKind::PortIo, 1, start, 2, 0);
        mgr.ioreq().distribute_requests(&vm).unwrap();

        let mut waited = 0;
        while ring.used_idx() != 1 && waited < 2000 {
            thread::sleep(Duration::from_millis(1));
            waited += 1;
        }
        assert_eq!(ring.used_idx(), 1);
        assert_eq!(ring.used_elem(0), (0, 64));
        assert_eq!(t.count(HypercallId::InjectMsi), 1);
        assert_eq!(t.count(HypercallId::NotifyRequestFinish), 1);

        mgr.ioreq().destroy_client(client).unwrap();
    }
}
