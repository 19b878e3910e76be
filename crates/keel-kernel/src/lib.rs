//! Keel Kernel
//!
//! The runtime half of the Keel microkernel. It wires the pure state machines
//! of `keel-kernel-core` to the platform:
//!
//! - one [`Cpu`] per core, each with its own scheduler, timer and interrupt
//!   hand-off ([`Kernel::schedule`], [`Kernel::handle_trap`])
//! - protection domains with a capability space and a kernel capability table
//! - threads and the synchronous IPC transport ([`Kernel::call`],
//!   [`Kernel::reply_wait`])
//! - the thread-management service (create, start, pause, affinity, ...)
//! - user-level interrupt handlers and vCPUs
//!
//! All state lives in a single [`Kernel`] value; there are no singletons. A
//! kernel entry on any core is an `&mut Kernel` method call.

#![no_std]
extern crate alloc;

pub mod audit;
pub mod config;
pub mod cpu;
pub mod domain;
pub mod error;
pub mod ipc;
pub mod irq;
pub mod service;
pub mod thread;
pub mod vm;

use alloc::collections::BTreeMap;
use alloc::format;
use alloc::vec::Vec;

pub use keel_hal::{CpuId, Hal, HalError, Irq};
pub use keel_kernel_core::{
    Badge, CapError, CapId, CapIndex, Delivery, DomainId, IpcError, JobId, Kcap, MsgBuf,
    Priority, MAX_CAPS_PER_MESSAGE, MAX_MESSAGE_SIZE,
};

pub use audit::{AuditEvent, AuditKind, AuditLog};
pub use config::{ConfigError, KernelConfig};
pub use cpu::{Cpu, Trap};
pub use domain::{Domain, KcapTable, KernelObject};
pub use error::KernelError;
pub use ipc::Received;
pub use thread::{Event, ExitReason, RegisterState, Thread, ThreadState};
pub use vm::{VmExit, VmExitAction, VmExitHandler, VmExitReason};

/// The kernel: cores, domains, threads and the objects they name.
pub struct Kernel<H: Hal> {
    hal: H,
    config: KernelConfig,
    pub(crate) cpus: Vec<Cpu>,
    pub(crate) threads: BTreeMap<JobId, Thread>,
    pub(crate) domains: BTreeMap<DomainId, Domain>,
    /// Live kernel objects by name
    pub(crate) objects: BTreeMap<CapId, KernelObject>,
    pub(crate) irq_handlers: BTreeMap<Irq, JobId>,
    pub(crate) audit: AuditLog,
    /// Core whose kernel entry is being handled
    pub(crate) executing: Option<CpuId>,
    next_job: u64,
    next_domain: u64,
    next_cap: u64,
}

impl<H: Hal> Kernel<H> {
    /// Bring up one scheduler per configured core.
    ///
    /// Job ids `0..cpus` are the per-core idle jobs.
    pub fn new(hal: H, config: KernelConfig) -> Result<Self, KernelError> {
        config.validate()?;
        if config.cpus > hal.cpu_count() {
            return Err(HalError::InvalidCpu(config.cpus - 1).into());
        }

        let cpus = (0..config.cpus)
            .map(|i| {
                Cpu::new(
                    CpuId(i),
                    JobId(i as u64),
                    config.super_period_us,
                    config.fill_us,
                )
            })
            .collect();

        hal.debug_write(&format!(
            "keel: {} cpu(s), period {} us, fill {} us",
            config.cpus, config.super_period_us, config.fill_us
        ));
        log::info!(
            "kernel up: {} cpu(s), {} cap slots per domain",
            config.cpus,
            config.cap_slots
        );

        Ok(Self {
            hal,
            next_job: config.cpus as u64,
            config,
            cpus,
            threads: BTreeMap::new(),
            domains: BTreeMap::new(),
            objects: BTreeMap::new(),
            irq_handlers: BTreeMap::new(),
            audit: AuditLog::new(),
            executing: None,
            next_domain: 1,
            next_cap: 1,
        })
    }

    pub fn hal(&self) -> &H {
        &self.hal
    }

    pub fn config(&self) -> &KernelConfig {
        &self.config
    }

    pub fn audit(&self) -> &AuditLog {
        &self.audit
    }

    pub fn cpu(&self, cpu: CpuId) -> Result<&Cpu, KernelError> {
        self.cpus.get(cpu.0).ok_or(KernelError::CpuNotFound(cpu.0))
    }

    pub fn cpu_count(&self) -> usize {
        self.cpus.len()
    }

    pub fn thread(&self, job: JobId) -> Result<&Thread, KernelError> {
        self.threads.get(&job).ok_or(KernelError::ThreadNotFound(job))
    }

    pub fn domain(&self, id: DomainId) -> Result<&Domain, KernelError> {
        self.domains.get(&id).ok_or(KernelError::DomainNotFound(id))
    }

    pub fn threads(&self) -> impl Iterator<Item = &Thread> {
        self.threads.values()
    }

    /// Whether `job` is one of the per-core idle jobs.
    pub fn is_idle(&self, job: JobId) -> bool {
        job.0 < self.cpus.len() as u64
    }

    /// Object a capability name refers to, if it is alive.
    pub fn object(&self, id: CapId) -> Option<KernelObject> {
        self.objects.get(&id).copied()
    }

    // ========================================================================
    // Internal helpers
    // ========================================================================

    pub(crate) fn thread_mut(&mut self, job: JobId) -> Result<&mut Thread, KernelError> {
        self.threads
            .get_mut(&job)
            .ok_or(KernelError::ThreadNotFound(job))
    }

    pub(crate) fn domain_mut(&mut self, id: DomainId) -> Result<&mut Domain, KernelError> {
        self.domains
            .get_mut(&id)
            .ok_or(KernelError::DomainNotFound(id))
    }

    pub(crate) fn cpu_mut(&mut self, cpu: CpuId) -> Result<&mut Cpu, KernelError> {
        self.cpus
            .get_mut(cpu.0)
            .ok_or(KernelError::CpuNotFound(cpu.0))
    }

    pub(crate) fn alloc_job(&mut self) -> JobId {
        let job = JobId(self.next_job);
        self.next_job += 1;
        job
    }

    pub(crate) fn alloc_domain(&mut self) -> DomainId {
        let id = DomainId(self.next_domain);
        self.next_domain += 1;
        id
    }

    /// Register a new live object under a fresh name.
    pub(crate) fn alloc_object(&mut self, object: KernelObject) -> CapId {
        let id = CapId(self.next_cap);
        self.next_cap += 1;
        self.objects.insert(id, object);
        id
    }

    /// Current time on the core handling this kernel entry.
    pub(crate) fn now(&self) -> u64 {
        self.hal.time(self.executing.unwrap_or(CpuId(0)))
    }

    pub(crate) fn record(&mut self, kind: AuditKind) {
        let timestamp = self.now();
        self.audit.record(timestamp, kind);
    }

    /// Run `f` as a kernel entry on `cpu`.
    ///
    /// IPIs are not sent to the core handling the entry; it reschedules on
    /// its way out.
    pub(crate) fn on_cpu<R>(
        &mut self,
        cpu: CpuId,
        f: impl FnOnce(&mut Self) -> Result<R, KernelError>,
    ) -> Result<R, KernelError> {
        let outer = self.executing.replace(cpu);
        let result = f(self);
        self.executing = outer;
        result
    }

    /// Run `f` as a kernel entry of `job` on its core.
    pub(crate) fn entered<R>(
        &mut self,
        job: JobId,
        f: impl FnOnce(&mut Self) -> Result<R, KernelError>,
    ) -> Result<R, KernelError> {
        let cpu = self.thread(job)?.cpu;
        self.on_cpu(cpu, f)
    }

    /// Make a thread runnable on its core.
    pub(crate) fn activate(&mut self, job: JobId) -> Result<(), KernelError> {
        let thread = self.thread_mut(job)?;
        if thread.state == ThreadState::Active {
            return Ok(());
        }
        thread.state = ThreadState::Active;
        let cpu = thread.cpu;
        self.cpu_mut(cpu)?.scheduler.ready(job);
        self.kick(cpu);
        Ok(())
    }

    /// Withdraw a thread from its core and park it in `state`.
    pub(crate) fn deactivate(&mut self, job: JobId, state: ThreadState) -> Result<(), KernelError> {
        let thread = self.thread_mut(job)?;
        let was_active = thread.state == ThreadState::Active;
        thread.state = state;
        let cpu = thread.cpu;
        if was_active {
            self.cpu_mut(cpu)?.scheduler.unready(job);
            self.kick(cpu);
        }
        Ok(())
    }

    /// Interrupt a remote core whose scheduling decision became stale.
    pub(crate) fn kick(&mut self, cpu: CpuId) {
        let executing = self.executing;
        if let Some(c) = self.cpus.get_mut(cpu.0) {
            if c.scheduler.need_to_schedule() && executing != Some(cpu) && !c.ipi_pending {
                c.ipi_pending = true;
                self.hal.send_ipi(cpu);
            }
        }
    }

    /// Queue `event` for `handler`, waking it if it waits for events.
    pub(crate) fn notify(&mut self, handler: JobId, event: Event) -> Result<(), KernelError> {
        let thread = self.thread_mut(handler)?;
        thread.events.push_back(event);
        if thread.state == ThreadState::AwaitsEvent {
            self.activate(handler)?;
        }
        Ok(())
    }
}
