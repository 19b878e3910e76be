//! Virtual CPUs
//!
//! A vCPU is a thread that runs guest code. When the guest leaves guest mode
//! the core traps with [`Trap::VmExit`](crate::cpu::Trap::VmExit) and the exit
//! is passed to the vCPU's own [`VmExitHandler`]. The handler either resumes
//! the guest directly or signals the vCPU's supervisor, which inspects the
//! state and later calls [`Kernel::resume_vcpu`].

use alloc::boxed::Box;

use keel_hal::{CpuId, Hal};
use keel_kernel_core::{DomainId, JobId};
use serde::{Deserialize, Serialize};

use crate::audit::AuditKind;
use crate::error::KernelError;
use crate::thread::{Event, RegisterState, ThreadState};
use crate::Kernel;

/// Architectural cause of a VM exit.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum VmExitReason {
    Io { port: u16, write: bool },
    Mmio { addr: u64, write: bool },
    Cpuid,
    Halt,
    ExternalInterrupt,
    Other(u32),
}

/// One exit from guest mode.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct VmExit {
    pub reason: VmExitReason,
    /// Guest instruction pointer at the exit
    pub ip: u64,
}

/// What to do after an exit was handled.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum VmExitAction {
    /// Re-enter the guest
    Resume,
    /// Pause the vCPU and notify its supervisor
    Signal,
}

/// Per-vCPU exit handler.
pub trait VmExitHandler: Send {
    /// Handle `exit`, possibly editing the guest registers.
    fn handle(&mut self, vcpu: JobId, exit: &VmExit, regs: &mut RegisterState) -> VmExitAction;
}

/// vCPU extension of a thread.
pub struct Vcpu {
    /// Cleared when the supervisor is killed
    pub supervisor: Option<JobId>,
    handler: Box<dyn VmExitHandler>,
    pub last_exit: Option<VmExit>,
    pub exits: u64,
}

impl<H: Hal> Kernel<H> {
    /// Create a vCPU thread supervised by `supervisor`.
    #[allow(clippy::too_many_arguments)]
    pub fn create_vcpu(
        &mut self,
        domain: DomainId,
        name: &str,
        priority: u32,
        quota: u64,
        cpu: CpuId,
        supervisor: JobId,
        handler: Box<dyn VmExitHandler>,
    ) -> Result<JobId, KernelError> {
        self.thread(supervisor)?;
        let job = self.create_thread(domain, name, priority, quota, cpu)?;
        self.thread_mut(job)?.vcpu = Some(Vcpu {
            supervisor: Some(supervisor),
            handler,
            last_exit: None,
            exits: 0,
        });
        Ok(job)
    }

    /// Let a signalled vCPU re-enter its guest.
    pub fn resume_vcpu(&mut self, vcpu: JobId) -> Result<(), KernelError> {
        let thread = self.thread(vcpu)?;
        if !thread.is_vcpu() || thread.state != ThreadState::AwaitsResume {
            return Err(KernelError::InvalidState);
        }
        self.activate(vcpu)
    }

    /// Most recent exit of `vcpu`.
    pub fn last_vm_exit(&self, vcpu: JobId) -> Result<Option<VmExit>, KernelError> {
        self.thread(vcpu)?
            .vcpu
            .as_ref()
            .map(|v| v.last_exit)
            .ok_or(KernelError::InvalidState)
    }

    pub(crate) fn handle_vm_exit(&mut self, job: JobId, exit: VmExit) -> Result<(), KernelError> {
        let thread = self.thread_mut(job)?;
        let vcpu = match thread.vcpu.as_mut() {
            Some(vcpu) => vcpu,
            None => {
                log::error!("vm exit from non-vcpu {:?}", job);
                return Err(KernelError::InvalidState);
            }
        };
        vcpu.exits += 1;
        let action = vcpu.handler.handle(job, &exit, &mut thread.regs);
        vcpu.last_exit = Some(exit);
        let supervisor = vcpu.supervisor;

        let resumed = action == VmExitAction::Resume;
        if !resumed {
            self.deactivate(job, ThreadState::AwaitsResume)?;
            match supervisor.filter(|s| self.threads.contains_key(s)) {
                Some(supervisor) => self.notify(supervisor, Event::VmExit { vcpu: job })?,
                None => log::warn!("{:?} signalled without a supervisor", job),
            }
        }
        log::trace!("{:?} vm exit {:?}: {:?}", job, exit.reason, action);
        self.record(AuditKind::VmExit { vcpu: job, resumed });
        Ok(())
    }
}
