//! Threads: the schedulable jobs of the kernel

use alloc::collections::VecDeque;
use alloc::string::String;

use keel_hal::{CpuId, Irq};
use keel_kernel_core::{CapId, DomainId, IpcNode, JobId, Priority};
use serde::{Deserialize, Serialize};

use crate::vm::Vcpu;

/// Execution state of a thread.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum ThreadState {
    /// Created, never started
    AwaitsStart,
    /// Ready to run or running
    Active,
    /// Blocked in a call or waiting for a request
    AwaitsIpc,
    /// Paused, or a vCPU whose exit is being handled by its supervisor
    AwaitsResume,
    /// Waiting for an interrupt or fault notification
    AwaitsEvent,
    /// Stopped by an exception
    Stopped,
}

/// Why a core left the job it was running.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum ExitReason {
    None,
    /// Timeslice ran out
    Timer,
    /// Job gave up the rest of its slice
    Yield,
    /// Job blocked in a kernel operation
    Blocked,
    /// Device interrupt or inter-processor interrupt
    Interrupt,
    Exception,
    VmExit,
}

/// Notification queued for an event-waiting thread.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum Event {
    /// A registered device interrupt fired and is masked until acknowledged
    Irq(Irq),
    /// A thread handled by this one faulted and was stopped
    Exception { thread: JobId, ip: u64 },
    /// A supervised vCPU exited and awaits resumption
    VmExit { vcpu: JobId },
}

/// Saved user-visible register state.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RegisterState {
    pub ip: u64,
    pub sp: u64,
    pub gpr: [u64; 16],
}

/// A kernel thread.
pub struct Thread {
    pub id: JobId,
    pub name: String,
    pub domain: DomainId,
    /// Object name other domains use to call this thread
    pub cap_id: CapId,
    pub cpu: CpuId,
    pub priority: Priority,
    /// Guaranteed execution time per period (microseconds)
    pub quota: u64,
    pub state: ThreadState,
    pub regs: RegisterState,
    pub ipc: IpcNode,
    /// Thread-specific exception handler; falls back to the domain's
    pub exception_handler: Option<JobId>,
    pub exit_reason: ExitReason,
    pub events: VecDeque<Event>,
    pub vcpu: Option<Vcpu>,
}

impl Thread {
    pub(crate) fn new(
        id: JobId,
        name: String,
        domain: DomainId,
        cap_id: CapId,
        cpu: CpuId,
        priority: Priority,
        quota: u64,
    ) -> Self {
        Self {
            id,
            name,
            domain,
            cap_id,
            cpu,
            priority,
            quota,
            state: ThreadState::AwaitsStart,
            regs: RegisterState::default(),
            ipc: IpcNode::new(),
            exception_handler: None,
            exit_reason: ExitReason::None,
            events: VecDeque::new(),
            vcpu: None,
        }
    }

    pub fn is_active(&self) -> bool {
        self.state == ThreadState::Active
    }

    pub fn is_vcpu(&self) -> bool {
        self.vcpu.is_some()
    }
}
