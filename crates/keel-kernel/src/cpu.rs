//! Per-core scheduling and trap handling
//!
//! Every kernel entry on a core ends in [`Kernel::schedule`]: the exit reason
//! is recorded on the job that was running, the core's scheduler consumes the
//! elapsed time, the one-shot timer is armed with the head's quota and the
//! head is returned as the job to run next.

use keel_hal::{CpuId, Hal};
use keel_kernel_core::{JobId, Scheduler};

use crate::audit::AuditKind;
use crate::error::KernelError;
use crate::thread::{Event, ExitReason, ThreadState};
use crate::vm::VmExit;
use crate::Kernel;

/// A processor core.
pub struct Cpu {
    pub id: CpuId,
    pub scheduler: Scheduler,
    current: JobId,
    /// An IPI was sent and not yet taken
    pub(crate) ipi_pending: bool,
    schedules: u64,
}

impl Cpu {
    pub(crate) fn new(id: CpuId, idle: JobId, period: u64, fill: u64) -> Self {
        Self {
            id,
            scheduler: Scheduler::new(idle, period, fill),
            current: idle,
            ipi_pending: false,
            schedules: 0,
        }
    }

    /// Job picked by the last scheduling decision.
    pub fn current(&self) -> JobId {
        self.current
    }

    pub fn idle(&self) -> JobId {
        self.scheduler.idle()
    }

    /// Number of scheduling decisions taken so far.
    pub fn schedules(&self) -> u64 {
        self.schedules
    }
}

/// Reason the current job entered the kernel.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Trap {
    /// The interrupt controller has pending requests
    Interrupt,
    /// The job gives up the rest of its slice
    Yield,
    /// The job faulted at `ip`
    Exception { ip: u64 },
    /// The running vCPU left guest mode
    VmExit(VmExit),
}

impl Trap {
    /// Exit reason recorded for a trap of this kind.
    pub fn exit_reason(&self) -> ExitReason {
        match self {
            Trap::Interrupt => ExitReason::Interrupt,
            Trap::Yield => ExitReason::Yield,
            Trap::Exception { .. } => ExitReason::Exception,
            Trap::VmExit(_) => ExitReason::VmExit,
        }
    }
}

impl<H: Hal> Kernel<H> {
    /// Pick the next job for `cpu`.
    pub fn schedule(&mut self, cpu: CpuId, reason: ExitReason) -> Result<JobId, KernelError> {
        self.on_cpu(cpu, |k| {
            let prev = k.cpu(cpu)?.current;
            if let Some(thread) = k.threads.get_mut(&prev) {
                thread.exit_reason = reason;
            }

            let now = k.hal().time(cpu);
            let c = k.cpu_mut(cpu)?;
            c.scheduler.update(now);
            let next = c.scheduler.head();
            let quota = c.scheduler.head_quota();
            c.current = next;
            c.ipi_pending = false;
            c.schedules += 1;

            k.hal().schedule_timeout(cpu, quota);
            if next != prev {
                log::trace!("cpu{}: {:?} -> {:?} for {} us", cpu.0, prev, next, quota);
                k.record(AuditKind::Scheduled {
                    cpu: cpu.0,
                    job: next,
                    quota,
                });
            }
            Ok(next)
        })
    }

    /// Handle a kernel entry of the job running on `cpu` and reschedule.
    ///
    /// The core is always rescheduled, even if handling the trap failed; the
    /// failure is logged.
    pub fn handle_trap(&mut self, cpu: CpuId, trap: Trap) -> Result<JobId, KernelError> {
        self.on_cpu(cpu, |k| {
            let current = k.cpu(cpu)?.current;
            let fallback = trap.exit_reason();
            let handled = match trap {
                Trap::Interrupt => k.handle_interrupts(cpu),
                Trap::Yield => k.cpu_mut(cpu).map(|c| {
                    c.scheduler.yield_now();
                    ExitReason::Yield
                }),
                Trap::Exception { ip } => k
                    .handle_exception(current, ip)
                    .map(|()| ExitReason::Exception),
                Trap::VmExit(exit) => k
                    .handle_vm_exit(current, exit)
                    .map(|()| ExitReason::VmExit),
            };
            let reason = handled.unwrap_or_else(|e| {
                log::error!("cpu{}: trap of {:?} failed: {}", cpu.0, current, e);
                fallback
            });
            k.schedule(cpu, reason)
        })
    }

    /// Drain the interrupt controller of `cpu`.
    ///
    /// Timer and IPI vectors only force the reschedule that follows; the
    /// virtualization maintenance vector is consumed here; everything else
    /// is handed to its user-level handler.
    pub(crate) fn handle_interrupts(&mut self, cpu: CpuId) -> Result<ExitReason, KernelError> {
        let mut reason = ExitReason::Interrupt;
        while let Some(irq) = self.hal().take_request(cpu) {
            let result = if irq == self.config().timer_irq {
                reason = ExitReason::Timer;
                Ok(())
            } else if irq == self.config().ipi_irq {
                self.cpu_mut(cpu)?.ipi_pending = false;
                Ok(())
            } else if irq == self.config().vm_maintenance_irq {
                log::trace!("cpu{}: vm maintenance", cpu.0);
                Ok(())
            } else {
                self.forward_irq(irq)
            };
            self.hal().finish_request(cpu, irq);
            if let Err(e) = result {
                log::error!("cpu{}: irq {} dropped: {}", cpu.0, irq, e);
            }
        }
        Ok(reason)
    }

    /// Stop a faulting thread and notify its exception handler.
    pub(crate) fn handle_exception(&mut self, job: JobId, ip: u64) -> Result<(), KernelError> {
        if self.is_idle(job) {
            log::error!("exception in idle job {:?} at {:#x}", job, ip);
            return Ok(());
        }
        let thread = self.thread_mut(job)?;
        thread.regs.ip = ip;
        let (domain, own) = (thread.domain, thread.exception_handler);
        self.deactivate(job, ThreadState::Stopped)?;

        let handler = own
            .or(self.domain(domain)?.exception_handler)
            .filter(|h| self.threads.contains_key(h));
        log::warn!("{:?} faulted at {:#x}, handler {:?}", job, ip, handler);
        self.record(AuditKind::Exception { job, ip, handler });
        if let Some(handler) = handler {
            self.notify(handler, Event::Exception { thread: job, ip })?;
        }
        Ok(())
    }
}
