// Copyright © 2019 Intel Corporation
//
// SPDX-License-Identifier: Apache-2.0 OR BSD-3-Clause

//! Hypercall transport for the VHM/VBS service core.
//!
//! This crate provides the host-side client view of the hypervisor ABI: a
//! fixed catalog of privileged calls, each taking up to four word-sized
//! parameters and returning a signed word. The transport itself is a trait so
//! the rest of the stack stays hypervisor-agnostic; `MockTransport` (behind
//! the `test-utils` feature) records calls for tests.

#[cfg(any(test, feature = "test-utils"))]
pub mod mock;

use thiserror::Error;

/// Sentinel the hypervisor uses for "no such VM".
pub const INVALID_VMID: u64 = 0xffff;

/// Sentinel `Gpa2Hpa` returns for an untranslatable address.
pub const INVALID_HPA: u64 = u64::MAX;

/// Fixed numeric opcodes of the hypercall catalog.
///
/// The numbering follows the `0x80 << 24` service id convention, with VM
/// lifecycle, interrupt, ioreq, memory and passthrough groups at 0x10, 0x20,
/// 0x30, 0x40 and 0x50 offsets respectively.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[repr(u64)]
pub enum HypercallId {
    CreateVm = 0x8000_0010,
    DestroyVm = 0x8000_0011,
    ResumeVm = 0x8000_0012,
    PauseVm = 0x8000_0013,
    QueryVmState = 0x8000_0014,
    InjectMsi = 0x8000_0023,
    SetIoreqBuffer = 0x8000_0030,
    NotifyRequestFinish = 0x8000_0031,
    SetMemoryMap = 0x8000_0040,
    Gpa2Hpa = 0x8000_0041,
    AssignPtdev = 0x8000_0050,
    DeassignPtdev = 0x8000_0051,
}

#[derive(Error, Debug)]
pub enum HypercallError {
    #[error("hypercall {0:?} failed with status {1}")]
    Failed(HypercallId, i64),

    #[error("hypervisor returned an invalid VM id")]
    InvalidVmId,

    #[error("guest physical address cannot be translated")]
    InvalidAddress,
}

pub type Result<T> = std::result::Result<T, HypercallError>;

///
/// Trait to represent the raw hypercall entry point.
///
/// Calls are synchronous and block the calling thread only for the
/// hypervisor's dispatch latency. A negative return is a failure; the
/// transport never retries on its own.
///
pub trait HypercallTransport: Send + Sync {
    /// Issue one privileged call with up to four word-sized arguments.
    fn hypercall(&self, id: HypercallId, args: [u64; 4]) -> i64;
}

/// Typed wrappers over the raw transport.
///
/// Implemented for every `HypercallTransport`; negative raw results map to
/// [`HypercallError::Failed`] and sentinel results to their dedicated
/// variants.
pub trait VhmHypercalls {
    /// Create a VM with the given number of vCPUs, returning its id.
    fn create_vm(&self, vcpu_num: u32) -> Result<u64>;
    /// Destroy a VM.
    fn destroy_vm(&self, vmid: u64) -> Result<()>;
    /// Pause a VM.
    fn pause_vm(&self, vmid: u64) -> Result<()>;
    /// Resume a paused VM.
    fn resume_vm(&self, vmid: u64) -> Result<()>;
    /// Query the VM state word.
    fn query_vm_state(&self, vmid: u64) -> Result<u64>;
    /// Register the shared ioreq buffer for a VM.
    fn set_ioreq_buffer(&self, vmid: u64, buffer_hpa: u64) -> Result<()>;
    /// Tell the hypervisor the named vCPU's trapped I/O has completed.
    fn notify_req_finish(&self, vmid: u64, vcpu: u64) -> Result<()>;
    /// Inject an MSI into the guest.
    fn inject_msi(&self, vmid: u64, msi_addr: u64, msi_data: u64) -> Result<()>;
    /// Translate a guest physical address to a host physical address.
    fn gpa_to_hpa(&self, vmid: u64, gpa: u64) -> Result<u64>;
}

fn status(id: HypercallId, ret: i64) -> Result<i64> {
    if ret < 0 {
        Err(HypercallError::Failed(id, ret))
    } else {
        Ok(ret)
    }
}

impl<T: HypercallTransport + ?Sized> VhmHypercalls for T {
    fn create_vm(&self, vcpu_num: u32) -> Result<u64> {
        let id = HypercallId::CreateVm;
        let vmid = status(id, self.hypercall(id, [u64::from(vcpu_num), 0, 0, 0]))? as u64;
        if vmid == INVALID_VMID {
            return Err(HypercallError::InvalidVmId);
        }
        Ok(vmid)
    }

    fn destroy_vm(&self, vmid: u64) -> Result<()> {
        let id = HypercallId::DestroyVm;
        status(id, self.hypercall(id, [vmid, 0, 0, 0])).map(|_| ())
    }

    fn pause_vm(&self, vmid: u64) -> Result<()> {
        let id = HypercallId::PauseVm;
        status(id, self.hypercall(id, [vmid, 0, 0, 0])).map(|_| ())
    }

    fn resume_vm(&self, vmid: u64) -> Result<()> {
        let id = HypercallId::ResumeVm;
        status(id, self.hypercall(id, [vmid, 0, 0, 0])).map(|_| ())
    }

    fn query_vm_state(&self, vmid: u64) -> Result<u64> {
        let id = HypercallId::QueryVmState;
        status(id, self.hypercall(id, [vmid, 0, 0, 0])).map(|v| v as u64)
    }

    fn set_ioreq_buffer(&self, vmid: u64, buffer_hpa: u64) -> Result<()> {
        let id = HypercallId::SetIoreqBuffer;
        status(id, self.hypercall(id, [vmid, buffer_hpa, 0, 0])).map(|_| ())
    }

    fn notify_req_finish(&self, vmid: u64, vcpu: u64) -> Result<()> {
        let id = HypercallId::NotifyRequestFinish;
        status(id, self.hypercall(id, [vmid, vcpu, 0, 0])).map(|_| ())
    }

    fn inject_msi(&self, vmid: u64, msi_addr: u64, msi_data: u64) -> Result<()> {
        let id = HypercallId::InjectMsi;
        status(id, self.hypercall(id, [vmid, msi_addr, msi_data, 0])).map(|_| ())
    }

    fn gpa_to_hpa(&self, vmid: u64, gpa: u64) -> Result<u64> {
        let id = HypercallId::Gpa2Hpa;
        let ret = self.hypercall(id, [vmid, gpa, 0, 0]);
        if ret == -1 {
            return Err(HypercallError::InvalidAddress);
        }
        let hpa = status(id, ret)? as u64;
        if hpa == INVALID_HPA {
            return Err(HypercallError::InvalidAddress);
        }
        Ok(hpa)
    }
}

#[cfg(test)]
mod tests {
    use super::mock::MockTransport;
    use super::*;

    #[test]
    fn create_vm_returns_vmid() {
        let t = MockTransport::new();
        let vmid = t.create_vm(4).unwrap();
        assert_ne!(vmid, INVALID_VMID);
        assert_eq!(t.count(HypercallId::CreateVm), 1);
    }

    #[test]
    fn create_vm_rejects_invalid_sentinel() {
        let t = MockTransport::new();
        t.script(HypercallId::CreateVm, INVALID_VMID as i64);
        assert!(matches!(t.create_vm(1), Err(HypercallError::InvalidVmId)));
    }

    #[test]
    fn negative_status_is_propagated() {
        let t = MockTransport::new();
        t.script(HypercallId::PauseVm, -22);
        match t.pause_vm(3) {
            Err(HypercallError::Failed(HypercallId::PauseVm, -22)) => {}
            other => panic!("unexpected result: {other:?}"),
        }
        // Failures are never retried by the transport.
        assert_eq!(t.count(HypercallId::PauseVm), 1);
    }

    #[test]
    fn gpa_to_hpa_identity_and_sentinel() {
        let t = MockTransport::new();
        assert_eq!(t.gpa_to_hpa(1, 0x4000).unwrap(), 0x4000);

        t.script(HypercallId::Gpa2Hpa, -1);
        assert!(matches!(
            t.gpa_to_hpa(1, 0xdead_0000),
            Err(HypercallError::InvalidAddress)
        ));
    }

    #[test]
    fn arguments_are_recorded() {
        let t = MockTransport::new();
        t.notify_req_finish(7, 2).unwrap();
        let calls = t.calls();
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0].0, HypercallId::NotifyRequestFinish);
        assert_eq!(calls[0].1[0], 7);
        assert_eq!(calls[0].1[1], 2);
    }
}
