// Copyright © 2019 Intel Corporation
//
// SPDX-License-Identifier: Apache-2.0 OR BSD-3-Clause

//! Service-managed VM registry.
//!
//! VMs are reference counted: the registry holds one reference, every
//! backend holding a `Arc<Vm>` another. Hypervisor-side teardown runs
//! exactly once, when the last reference is dropped.

use std::sync::{Arc, Mutex, RwLock, Weak};

use log::{error, info};
use thiserror::Error;
use vm_memory::{Address, Bytes, GuestAddress, GuestAddressSpace, GuestMemory};

use vhm_hypercall::{HypercallError, HypercallTransport, VhmHypercalls};

use crate::ioreq::{IoreqDispatcher, RequestBuffer, VmIoreqState};
use crate::{GuestMemoryAtomic, GuestMemoryMmap};

#[derive(Error, Debug)]
pub enum VmError {
    #[error("failed to create VM")]
    Create(#[source] HypercallError),

    #[error("no VM with id {0}")]
    NotFound(u64),

    #[error("VM {0} has no guest memory configured")]
    NoGuestMemory(u64),

    #[error("VM {0} already has a request buffer")]
    BufferAlreadySet(u64),

    #[error("guest memory access failed")]
    GuestMemory(#[source] vm_memory::GuestMemoryError),

    #[error("hypercall failed")]
    Hypercall(#[from] HypercallError),
}

pub type Result<T> = std::result::Result<T, VmError>;

/// Registry of VMs whose devices this service backs.
pub struct VmManager {
    transport: Arc<dyn HypercallTransport>,
    dispatcher: Arc<IoreqDispatcher>,
    vms: Mutex<Vec<Arc<Vm>>>,
}

impl VmManager {
    pub fn new(transport: Arc<dyn HypercallTransport>) -> Self {
        let dispatcher = Arc::new(IoreqDispatcher::new(Arc::clone(&transport)));
        VmManager {
            transport,
            dispatcher,
            vms: Mutex::new(Vec::new()),
        }
    }

    /// The trapped-I/O dispatcher shared by all VMs in the registry.
    pub fn ioreq(&self) -> &Arc<IoreqDispatcher> {
        &self.dispatcher
    }

    /// Ask the hypervisor for a new VM and register it.
    pub fn create_vm(&self, vcpu_num: u32) -> Result<Arc<Vm>> {
        let vmid = self.transport.create_vm(vcpu_num).map_err(VmError::Create)?;
        let vm = Arc::new(Vm {
            vmid,
            vcpu_num,
            transport: Arc::clone(&self.transport),
            dispatcher: Arc::downgrade(&self.dispatcher),
            mem: RwLock::new(None),
            ioreq: VmIoreqState::new(),
        });
        self.vms.lock().unwrap().push(Arc::clone(&vm));
        info!("created VM {} with {} vCPUs", vmid, vcpu_num);
        Ok(vm)
    }

    /// Look a VM up by id, taking a reference.
    pub fn find_get(&self, vmid: u64) -> Option<Arc<Vm>> {
        self.vms
            .lock()
            .unwrap()
            .iter()
            .find(|vm| vm.vmid == vmid)
            .cloned()
    }

    /// Drop the registry's reference to a VM.
    ///
    /// Hypervisor teardown is deferred until every outstanding reference is
    /// gone.
    pub fn destroy_vm(&self, vmid: u64) -> Result<()> {
        let mut vms = self.vms.lock().unwrap();
        let idx = vms
            .iter()
            .position(|vm| vm.vmid == vmid)
            .ok_or(VmError::NotFound(vmid))?;
        vms.remove(idx);
        Ok(())
    }
}

/// One service-managed VM.
pub struct Vm {
    vmid: u64,
    vcpu_num: u32,
    transport: Arc<dyn HypercallTransport>,
    dispatcher: Weak<IoreqDispatcher>,
    mem: RwLock<Option<GuestMemoryAtomic>>,
    pub(crate) ioreq: VmIoreqState,
}

impl Vm {
    pub fn vmid(&self) -> u64 {
        self.vmid
    }

    pub fn vcpu_num(&self) -> u32 {
        self.vcpu_num
    }

    pub(crate) fn transport(&self) -> &Arc<dyn HypercallTransport> {
        &self.transport
    }

    /// Install the guest memory view used to translate guest addresses.
    pub fn set_guest_memory(&self, mem: GuestMemoryMmap) {
        *self.mem.write().unwrap() = Some(GuestMemoryAtomic::new(mem));
    }

    /// The guest memory view, if one has been installed.
    pub fn guest_memory(&self) -> Result<GuestMemoryAtomic> {
        self.mem
            .read()
            .unwrap()
            .clone()
            .ok_or(VmError::NoGuestMemory(self.vmid))
    }

    /// Highest guest page frame number covered by the installed mapping.
    pub fn max_gfn(&self) -> Result<u64> {
        let mem = self.guest_memory()?;
        let guard = mem.memory();
        Ok(guard.last_addr().raw_value() >> 12)
    }

    /// Copy out of guest memory at `gpa`. The whole span must be backed;
    /// partial copies are errors.
    pub fn read_from_guest(&self, gpa: u64, buf: &mut [u8]) -> Result<()> {
        let mem = self.guest_memory()?;
        mem.memory()
            .read_slice(buf, GuestAddress(gpa))
            .map_err(VmError::GuestMemory)
    }

    /// Copy into guest memory at `gpa`. The whole span must be backed.
    pub fn write_to_guest(&self, gpa: u64, buf: &[u8]) -> Result<()> {
        let mem = self.guest_memory()?;
        mem.memory()
            .write_slice(buf, GuestAddress(gpa))
            .map_err(VmError::GuestMemory)
    }

    /// Translate a guest physical address through the hypervisor.
    pub fn gpa_to_hpa(&self, gpa: u64) -> Result<u64> {
        Ok(self.transport.gpa_to_hpa(self.vmid, gpa)?)
    }

    /// Inject an MSI into the guest.
    pub fn inject_msi(&self, msi_addr: u64, msi_data: u64) -> Result<()> {
        Ok(self.transport.inject_msi(self.vmid, msi_addr, msi_data)?)
    }

    pub fn pause(&self) -> Result<()> {
        Ok(self.transport.pause_vm(self.vmid)?)
    }

    pub fn resume(&self) -> Result<()> {
        Ok(self.transport.resume_vm(self.vmid)?)
    }

    pub fn state(&self) -> Result<u64> {
        Ok(self.transport.query_vm_state(self.vmid)?)
    }

    /// Allocate the shared request buffer and register it with the
    /// hypervisor. May be done once per VM.
    pub fn set_ioreq_buffer(&self) -> Result<Arc<RequestBuffer>> {
        let mut slot = self.ioreq.req_buf.lock().unwrap();
        if slot.is_some() {
            return Err(VmError::BufferAlreadySet(self.vmid));
        }
        let buf = Arc::new(RequestBuffer::new());
        self.transport
            .set_ioreq_buffer(self.vmid, Arc::as_ptr(&buf) as u64)?;
        *slot = Some(Arc::clone(&buf));
        Ok(buf)
    }

    /// The shared request buffer, if registered.
    pub fn request_buffer(&self) -> Option<Arc<RequestBuffer>> {
        self.ioreq.req_buf.lock().unwrap().clone()
    }
}

impl Drop for Vm {
    fn drop(&mut self) {
        // Release the guest memory mapping, then tear the trapped-I/O clients
        // down. The request buffer lives outside the mapping, so draining the
        // clients does not need it.
        self.mem.write().unwrap().take();
        if let Some(dispatcher) = self.dispatcher.upgrade() {
            dispatcher.free_vm_ioreq(self);
        }
        match self.transport.destroy_vm(self.vmid) {
            Ok(()) => info!("destroyed VM {}", self.vmid),
            Err(e) => error!("failed to destroy VM {}: {}", self.vmid, e),
        }
    }
}

#[cfg(test)]
mod tests {
    use vhm_hypercall::mock::MockTransport;
    use vhm_hypercall::HypercallId;

    use super::*;

    fn manager() -> (Arc<MockTransport>, VmManager) {
        let t = Arc::new(MockTransport::new());
        let mgr = VmManager::new(Arc::<MockTransport>::clone(&t));
        (t, mgr)
    }

    #[test]
    fn create_and_find() {
        let (_t, mgr) = manager();
        let vm = mgr.create_vm(2).unwrap();
        assert_eq!(vm.vcpu_num(), 2);

        let found = mgr.find_get(vm.vmid()).unwrap();
        assert_eq!(found.vmid(), vm.vmid());
        assert!(mgr.find_get(vm.vmid() + 100).is_none());
    }

    #[test]
    fn create_failure_is_reported() {
        let (t, mgr) = manager();
        t.script(HypercallId::CreateVm, -12);
        assert!(matches!(mgr.create_vm(1), Err(VmError::Create(_))));
        assert!(mgr.vms.lock().unwrap().is_empty());
    }

    #[test]
    fn teardown_runs_once_when_last_reference_drops() {
        let (t, mgr) = manager();
        let vm = mgr.create_vm(1).unwrap();
        let vmid = vm.vmid();
        let extra = Arc::clone(&vm);

        mgr.destroy_vm(vmid).unwrap();
        assert_eq!(t.count(HypercallId::DestroyVm), 0);

        drop(vm);
        assert_eq!(t.count(HypercallId::DestroyVm), 0);

        drop(extra);
        assert_eq!(t.count(HypercallId::DestroyVm), 1);
    }

    #[test]
    fn destroy_unknown_vm_fails() {
        let (_t, mgr) = manager();
        assert!(matches!(mgr.destroy_vm(42), Err(VmError::NotFound(42))));
    }

    #[test]
    fn guest_memory_requires_configuration() {
        let (_t, mgr) = manager();
        let vm = mgr.create_vm(1).unwrap();
        assert!(matches!(
            vm.guest_memory(),
            Err(VmError::NoGuestMemory(_))
        ));

        let mem = crate::GuestMemoryMmap::from_ranges(&[(
            vm_memory::GuestAddress(0),
            0x10_0000,
        )])
        .unwrap();
        vm.set_guest_memory(mem);
        assert!(vm.guest_memory().is_ok());
        assert_eq!(vm.max_gfn().unwrap(), (0x10_0000 >> 12) - 1);
    }

    #[test]
    fn guest_copies_are_bounds_checked() {
        let (_t, mgr) = manager();
        let vm = mgr.create_vm(1).unwrap();
        let mem = crate::GuestMemoryMmap::from_ranges(&[(
            vm_memory::GuestAddress(0),
            0x1000,
        )])
        .unwrap();
        vm.set_guest_memory(mem);

        vm.write_to_guest(0x100, &[1, 2, 3, 4]).unwrap();
        let mut back = [0u8; 4];
        vm.read_from_guest(0x100, &mut back).unwrap();
        assert_eq!(back, [1, 2, 3, 4]);

        // A span crossing the end of memory is refused outright.
        assert!(matches!(
            vm.write_to_guest(0xffe, &[0; 4]),
            Err(VmError::GuestMemory(_))
        ));
    }

    #[test]
    fn pause_and_resume_reach_the_hypervisor() {
        let (t, mgr) = manager();
        let vm = mgr.create_vm(1).unwrap();
        vm.pause().unwrap();
        vm.resume().unwrap();
        assert_eq!(t.count(HypercallId::PauseVm), 1);
        assert_eq!(t.count(HypercallId::ResumeVm), 1);
    }

    #[test]
    fn request_buffer_is_set_once() {
        let (t, mgr) = manager();
        let vm = mgr.create_vm(1).unwrap();
        assert!(vm.request_buffer().is_none());

        let buf = vm.set_ioreq_buffer().unwrap();
        assert_eq!(t.count(HypercallId::SetIoreqBuffer), 1);
        assert!(Arc::ptr_eq(&buf, &vm.request_buffer().unwrap()));

        assert!(matches!(
            vm.set_ioreq_buffer(),
            Err(VmError::BufferAlreadySet(_))
        ));
        assert_eq!(t.count(HypercallId::SetIoreqBuffer), 1);
    }
}
