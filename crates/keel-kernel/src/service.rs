//! Thread-management service
//!
//! Domain and thread lifecycle, scheduling parameters, register state,
//! exception handlers, affinity and capability delegation. Requested
//! priorities and quotas are clamped rather than rejected.

use alloc::string::String;

use keel_hal::{CpuId, Hal};
use keel_kernel_core::{
    CapError, CapId, CapIndex, CapabilitySpace, DomainId, IpcError, JobId, Kcap, Priority,
    ServerState,
};

use crate::audit::AuditKind;
use crate::domain::{Domain, DomainView, KcapTable, KernelObject};
use crate::error::KernelError;
use crate::thread::{RegisterState, Thread, ThreadState};
use crate::Kernel;

/// Static selector of a domain's capability to itself.
pub const DOMAIN_SELF_KCAP: Kcap = Kcap(0);

fn clamp_quota(requested: u64, headroom: u64, period: u64) -> u64 {
    let quota = requested.min(headroom).min(period);
    if quota != requested {
        log::warn!("quota {} clamped to {}", requested, quota);
    }
    quota
}

fn clamp_priority(requested: u32) -> Priority {
    let prio = Priority::clamped(requested);
    if prio.level() as u32 != requested {
        log::warn!("priority {} clamped to {}", requested, prio.level());
    }
    prio
}

impl<H: Hal> Kernel<H> {
    // ========================================================================
    // Domains
    // ========================================================================

    /// Create a protection domain whose threads may claim `quota_ceiling`
    /// microseconds per period in total.
    pub fn create_domain(&mut self, name: &str, quota_ceiling: u64) -> Result<DomainId, KernelError> {
        let id = self.alloc_domain();
        let cap_id = self.alloc_object(KernelObject::Domain(id));

        let space = CapabilitySpace::new(self.config().cap_slots, self.config().static_cap_slots);
        let mut table = KcapTable::new(self.config().metadata_slots);
        let inserted = space.insert_kcap(
            cap_id,
            DOMAIN_SELF_KCAP,
            &mut DomainView {
                table: &mut table,
                objects: &self.objects,
            },
        );
        if let Err(e) = inserted {
            self.objects.remove(&cap_id);
            return Err(e.into());
        }
        table.install(DOMAIN_SELF_KCAP, cap_id);

        let quota_ceiling = quota_ceiling.min(self.config().super_period_us);
        let metadata_budget = self.config().metadata_budget;
        self.domains.insert(
            id,
            Domain {
                id,
                name: String::from(name),
                cap_id,
                space,
                table,
                quota_ceiling,
                quota_assigned: 0,
                metadata_budget,
                threads: Default::default(),
                exception_handler: None,
            },
        );
        log::debug!("domain {:?} '{}' created", id, name);
        self.record(AuditKind::DomainCreated { domain: id, quota_ceiling });
        Ok(id)
    }

    /// Grow a domain's kernel metadata from its budget.
    ///
    /// Returns the number of slots added.
    pub fn upgrade_metadata(&mut self, domain: DomainId) -> Result<usize, KernelError> {
        let step = self.config().metadata_upgrade;
        let d = self.domain_mut(domain)?;
        let slots = step.min(d.metadata_budget);
        if slots == 0 {
            return Err(IpcError::OutOfMetadata.into());
        }
        d.metadata_budget -= slots;
        d.table.upgrade(slots);
        log::info!("domain {:?} metadata upgraded by {}", domain, slots);
        self.record(AuditKind::MetadataUpgraded { domain, slots });
        Ok(slots)
    }

    /// Hand the capability `id` held by `from` to `to`.
    pub fn delegate(&mut self, from: DomainId, id: CapId, to: DomainId) -> Result<CapIndex, KernelError> {
        let object = self
            .domain(from)?
            .resolve(id, &self.objects)
            .ok_or(CapError::NotFound)?;
        let index = self.install_received(to, object, false)?;
        self.record(AuditKind::CapDelegated { from, to, id: object });
        Ok(index)
    }

    /// Place `object` into `to`'s capability space via a receive window.
    ///
    /// A new entry needs a free metadata slot unless it was `reserved` by
    /// the receiving call.
    pub(crate) fn install_received(
        &mut self,
        to: DomainId,
        object: CapId,
        reserved: bool,
    ) -> Result<CapIndex, KernelError> {
        let objects = &self.objects;
        let d = self
            .domains
            .get_mut(&to)
            .ok_or(KernelError::DomainNotFound(to))?;
        if !reserved && d.space.find(object).is_none() && d.table.available() == 0 {
            return Err(IpcError::OutOfMetadata.into());
        }
        let window = d.table.place_window(object);
        let result = {
            let mut view = DomainView {
                table: &mut d.table,
                objects,
            };
            d.space.insert_map(object, window, &mut view)
        };
        d.table.remove(window);
        Ok(result?)
    }

    // ========================================================================
    // Thread lifecycle
    // ========================================================================

    /// Create a thread in `domain`, bound to `cpu`, awaiting start.
    pub fn create_thread(
        &mut self,
        domain: DomainId,
        name: &str,
        priority: u32,
        quota: u64,
        cpu: CpuId,
    ) -> Result<JobId, KernelError> {
        self.cpu(cpu)?;
        let period = self.config().super_period_us;
        let prio = clamp_priority(priority);
        let quota = clamp_quota(quota, self.domain(domain)?.quota_headroom(), period);

        let job = self.alloc_job();
        let cap_id = self.alloc_object(KernelObject::Thread(job));
        let d = self.domain_mut(domain)?;
        let index = match d.space.insert(cap_id) {
            Ok(index) => index,
            Err(e) => {
                self.objects.remove(&cap_id);
                return Err(e.into());
            }
        };
        d.table.install(index.kcap, cap_id);
        d.quota_assigned += quota;
        d.threads.insert(job);

        self.cpu_mut(cpu)?.scheduler.insert(job, prio, quota);
        self.threads.insert(
            job,
            Thread::new(job, String::from(name), domain, cap_id, cpu, prio, quota),
        );
        log::debug!("thread {:?} '{}' in {:?} on cpu{}", job, name, domain, cpu.0);
        self.record(AuditKind::ThreadCreated {
            job,
            domain,
            priority: prio,
            quota,
        });
        Ok(job)
    }

    /// Destroy a thread. Every IPC partner blocked on it fails with
    /// `Cancelled`.
    pub fn kill_thread(&mut self, job: JobId) -> Result<(), KernelError> {
        let thread = self.thread(job)?;
        let (domain, cap_id, cpu, quota) = (thread.domain, thread.cap_id, thread.cpu, thread.quota);

        // Own pending call
        self.cancel_client(job)?;
        // Callers queued at or served by this thread
        let t = self.thread_mut(job)?;
        let mut victims = t.ipc.drain_queue();
        victims.extend(t.ipc.drop_caller());
        for caller in victims {
            self.cancel_and_wake(caller)?;
        }

        self.release_irqs(job);
        self.cpu_mut(cpu)?.scheduler.remove(job);
        self.kick(cpu);

        let d = self.domain_mut(domain)?;
        d.quota_assigned = d.quota_assigned.saturating_sub(quota);
        d.threads.remove(&job);
        if d.exception_handler == Some(job) {
            d.exception_handler = None;
        }
        if let Some(index) = d.space.remove(cap_id) {
            d.table.remove(index.kcap);
        }
        self.objects.remove(&cap_id);
        self.threads.remove(&job);
        for other in self.threads.values_mut() {
            if other.exception_handler == Some(job) {
                other.exception_handler = None;
            }
            if let Some(vcpu) = other.vcpu.as_mut().filter(|v| v.supervisor == Some(job)) {
                vcpu.supervisor = None;
            }
        }

        log::debug!("thread {:?} killed", job);
        self.record(AuditKind::ThreadKilled { job });
        Ok(())
    }

    /// Start a created thread at `ip` with stack `sp`.
    pub fn start(&mut self, job: JobId, ip: u64, sp: u64) -> Result<(), KernelError> {
        let thread = self.thread_mut(job)?;
        if thread.state != ThreadState::AwaitsStart {
            return Err(KernelError::InvalidState);
        }
        thread.regs.ip = ip;
        thread.regs.sp = sp;
        self.activate(job)
    }

    pub fn pause(&mut self, job: JobId) -> Result<(), KernelError> {
        match self.thread(job)?.state {
            ThreadState::Active | ThreadState::AwaitsResume => {
                self.deactivate(job, ThreadState::AwaitsResume)
            }
            _ => Err(KernelError::InvalidState),
        }
    }

    /// Resume a paused thread, or cancel what it is blocked in.
    ///
    /// Returns whether the thread was woken.
    pub fn resume(&mut self, job: JobId) -> Result<bool, KernelError> {
        match self.thread(job)?.state {
            ThreadState::AwaitsResume => {
                self.activate(job)?;
                Ok(true)
            }
            ThreadState::AwaitsIpc | ThreadState::AwaitsEvent => self.cancel_blocking(job),
            _ => Ok(false),
        }
    }

    /// Abort a blocking IPC or event wait; the thread sees `Cancelled`.
    pub fn cancel_blocking(&mut self, job: JobId) -> Result<bool, KernelError> {
        let thread = self.thread(job)?;
        let waiting_event = thread.state == ThreadState::AwaitsEvent;
        let waiting_request =
            thread.ipc.server_state() == ServerState::AwaitingRequest;

        let cancelled = if self.cancel_client(job)? {
            true
        } else if waiting_request {
            self.thread_mut(job)?.ipc.cancel_wait()?;
            true
        } else {
            waiting_event
        };
        if cancelled {
            self.activate(job)?;
            log::debug!("{:?} blocking operation cancelled", job);
            self.record(AuditKind::IpcCancelled { job });
        }
        Ok(cancelled)
    }

    // ========================================================================
    // Thread parameters
    // ========================================================================

    /// Saved registers; not available while the thread is active.
    pub fn register_state(&self, job: JobId) -> Result<RegisterState, KernelError> {
        let thread = self.thread(job)?;
        if thread.is_active() {
            return Err(KernelError::StateAccess);
        }
        Ok(thread.regs)
    }

    pub fn set_register_state(&mut self, job: JobId, regs: RegisterState) -> Result<(), KernelError> {
        let thread = self.thread_mut(job)?;
        if thread.is_active() {
            return Err(KernelError::StateAccess);
        }
        thread.regs = regs;
        Ok(())
    }

    /// Set the exception handler of `thread`, or of the whole domain when
    /// `thread` is `None`. `handler` names a thread capability held by
    /// `domain`; `None` reverts to the default.
    pub fn set_exception_handler(
        &mut self,
        domain: DomainId,
        thread: Option<JobId>,
        handler: Option<CapId>,
    ) -> Result<(), KernelError> {
        let handler = match handler {
            None => None,
            Some(id) => {
                let object = self
                    .domain(domain)?
                    .resolve(id, &self.objects)
                    .ok_or(CapError::NotFound)?;
                match self.objects.get(&object) {
                    Some(KernelObject::Thread(job)) => Some(*job),
                    _ => return Err(IpcError::InvalidCapability.into()),
                }
            }
        };
        match thread {
            Some(job) => {
                let t = self.thread_mut(job)?;
                if t.domain != domain {
                    return Err(KernelError::InvalidState);
                }
                t.exception_handler = handler;
            }
            None => self.domain_mut(domain)?.exception_handler = handler,
        }
        Ok(())
    }

    pub fn priority(&self, job: JobId) -> Result<Priority, KernelError> {
        Ok(self.thread(job)?.priority)
    }

    /// Change priority; returns the effective (clamped) value.
    pub fn set_priority(&mut self, job: JobId, priority: u32) -> Result<Priority, KernelError> {
        let prio = clamp_priority(priority);
        let thread = self.thread_mut(job)?;
        thread.priority = prio;
        let cpu = thread.cpu;
        self.cpu_mut(cpu)?.scheduler.set_priority(job, prio);
        self.kick(cpu);
        Ok(prio)
    }

    pub fn quota(&self, job: JobId) -> Result<u64, KernelError> {
        Ok(self.thread(job)?.quota)
    }

    /// Change quota within the domain's ceiling; returns the effective value.
    pub fn set_quota(&mut self, job: JobId, quota: u64) -> Result<u64, KernelError> {
        let thread = self.thread(job)?;
        let (domain, old, cpu) = (thread.domain, thread.quota, thread.cpu);
        let period = self.config().super_period_us;
        let headroom = self.domain(domain)?.quota_headroom() + old;
        let quota = clamp_quota(quota, headroom, period);

        let d = self.domain_mut(domain)?;
        d.quota_assigned = d.quota_assigned - old + quota;
        self.thread_mut(job)?.quota = quota;
        self.cpu_mut(cpu)?.scheduler.set_quota(job, quota);
        self.kick(cpu);
        Ok(quota)
    }

    pub fn affinity(&self, job: JobId) -> Result<CpuId, KernelError> {
        Ok(self.thread(job)?.cpu)
    }

    /// Move a thread to another core: removed from the old scheduler,
    /// inserted into the new one, readiness preserved.
    pub fn set_affinity(&mut self, job: JobId, cpu: CpuId) -> Result<(), KernelError> {
        self.cpu(cpu)?;
        let thread = self.thread(job)?;
        let (old, prio, quota, active) = (thread.cpu, thread.priority, thread.quota, thread.is_active());
        if old == cpu {
            return Ok(());
        }

        self.cpu_mut(old)?.scheduler.remove(job);
        self.kick(old);
        self.thread_mut(job)?.cpu = cpu;
        let target = self.cpu_mut(cpu)?;
        target.scheduler.insert(job, prio, quota);
        if active {
            target.scheduler.ready(job);
        }
        self.kick(cpu);

        log::debug!("{:?} moved cpu{} -> cpu{}", job, old.0, cpu.0);
        self.record(AuditKind::AffinityChanged {
            job,
            from: old.0,
            to: cpu.0,
        });
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::kernel;

    #[test]
    fn test_domain_holds_self_capability() {
        let mut k = kernel();
        let d = k.create_domain("init", 1000).unwrap();
        let domain = k.domain(d).unwrap();
        let index = domain.space.find(domain.cap_id).unwrap();
        assert_eq!(index.kcap, DOMAIN_SELF_KCAP);
        assert!(domain.space.is_static(index.kcap));
    }

    #[test]
    fn test_thread_capability_in_owner_space() {
        let mut k = kernel();
        let d = k.create_domain("init", 1000).unwrap();
        let t = k.create_thread(d, "main", 1, 100, CpuId(0)).unwrap();
        let cap = k.thread(t).unwrap().cap_id;
        let domain = k.domain(d).unwrap();
        assert_eq!(domain.resolve(cap, &k.objects), Some(cap));
        assert_eq!(k.object(cap), Some(KernelObject::Thread(t)));
    }

    #[test]
    fn test_priority_and_quota_clamped() {
        let mut k = kernel();
        let d = k.create_domain("app", 600).unwrap();
        let a = k.create_thread(d, "a", 99, 500, CpuId(0)).unwrap();
        assert_eq!(k.priority(a).unwrap(), Priority::LOWEST);
        assert_eq!(k.quota(a).unwrap(), 500);

        // Only 100 left under the ceiling
        let b = k.create_thread(d, "b", 0, 500, CpuId(0)).unwrap();
        assert_eq!(k.quota(b).unwrap(), 100);

        // Growing a thread is limited by its siblings
        assert_eq!(k.set_quota(a, 2000).unwrap(), 500);
        assert_eq!(k.set_quota(b, 50).unwrap(), 50);
        assert_eq!(k.set_quota(a, 2000).unwrap(), 550);
        assert_eq!(k.domain(d).unwrap().quota_assigned, 600);
    }

    #[test]
    fn test_state_access_only_when_not_active() {
        let mut k = kernel();
        let d = k.create_domain("app", 600).unwrap();
        let t = k.create_thread(d, "a", 0, 0, CpuId(0)).unwrap();
        let regs = RegisterState {
            ip: 0x40,
            ..RegisterState::default()
        };
        k.set_register_state(t, regs).unwrap();
        k.start(t, 0x100, 0x200).unwrap();
        assert_eq!(k.register_state(t), Err(KernelError::StateAccess));

        k.pause(t).unwrap();
        assert_eq!(k.register_state(t).unwrap().ip, 0x100);
        assert!(k.resume(t).unwrap());
        assert!(!k.resume(t).unwrap());
    }

    #[test]
    fn test_start_twice_rejected() {
        let mut k = kernel();
        let d = k.create_domain("app", 600).unwrap();
        let t = k.create_thread(d, "a", 0, 0, CpuId(0)).unwrap();
        k.start(t, 0, 0).unwrap();
        assert_eq!(k.start(t, 0, 0), Err(KernelError::InvalidState));
    }

    #[test]
    fn test_affinity_preserves_readiness() {
        let mut k = kernel();
        let d = k.create_domain("app", 600).unwrap();
        let t = k.create_thread(d, "a", 0, 200, CpuId(0)).unwrap();
        k.start(t, 0, 0).unwrap();

        k.set_affinity(t, CpuId(1)).unwrap();
        assert_eq!(k.affinity(t).unwrap(), CpuId(1));
        assert!(!k.cpu(CpuId(0)).unwrap().scheduler.contains(t));
        assert!(k.cpu(CpuId(1)).unwrap().scheduler.is_ready(t));
        assert!(k.hal().ipi_count(CpuId(1)) > 0);
        assert_eq!(k.schedule(CpuId(1), crate::ExitReason::None).unwrap(), t);
        assert!(k.set_affinity(t, CpuId(7)).is_err());
    }

    #[test]
    fn test_exception_handler_resolution() {
        let mut k = kernel();
        let d = k.create_domain("app", 600).unwrap();
        let worker = k.create_thread(d, "worker", 0, 0, CpuId(0)).unwrap();
        let pager = k.create_thread(d, "pager", 0, 0, CpuId(0)).unwrap();
        let pager_cap = k.thread(pager).unwrap().cap_id;

        k.set_exception_handler(d, None, Some(pager_cap)).unwrap();
        assert_eq!(k.domain(d).unwrap().exception_handler, Some(pager));

        k.set_exception_handler(d, Some(worker), Some(pager_cap)).unwrap();
        assert_eq!(k.thread(worker).unwrap().exception_handler, Some(pager));

        let domain_cap = k.domain(d).unwrap().cap_id;
        assert_eq!(
            k.set_exception_handler(d, None, Some(domain_cap)),
            Err(KernelError::Ipc(IpcError::InvalidCapability))
        );
        assert_eq!(
            k.set_exception_handler(d, None, Some(CapId(999))),
            Err(KernelError::Capability(CapError::NotFound))
        );
    }

    #[test]
    fn test_metadata_upgrade_draws_from_budget() {
        let mut k = kernel();
        let d = k.create_domain("app", 600).unwrap();
        let limit = k.domain(d).unwrap().table.limit();
        let budget = k.config().metadata_budget;
        let step = k.config().metadata_upgrade;
        assert_eq!(k.upgrade_metadata(d).unwrap(), step);
        assert_eq!(k.domain(d).unwrap().table.limit(), limit + step);
        assert_eq!(k.domain(d).unwrap().metadata_budget, budget - step);
    }

    #[test]
    fn test_delegate_reuses_index() {
        let mut k = kernel();
        let a = k.create_domain("a", 600).unwrap();
        let b = k.create_domain("b", 600).unwrap();
        let t = k.create_thread(a, "srv", 0, 0, CpuId(0)).unwrap();
        let cap = k.thread(t).unwrap().cap_id;

        let first = k.delegate(a, cap, b).unwrap();
        let second = k.delegate(a, cap, b).unwrap();
        assert_eq!(first, second);
        assert_eq!(first.id, cap);
        assert_eq!(k.domain(b).unwrap().space.len(), 2);
        assert_eq!(
            k.delegate(a, CapId(999), b),
            Err(KernelError::Capability(CapError::NotFound))
        );
    }
}
