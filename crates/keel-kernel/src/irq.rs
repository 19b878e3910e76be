//! User-level interrupt handlers and event delivery
//!
//! A device interrupt owned by a thread is masked when it fires and queued as
//! an [`Event::Irq`]. It stays masked until the handler acknowledges it.

use alloc::vec::Vec;

use keel_hal::{Hal, Irq};
use keel_kernel_core::JobId;

use crate::audit::AuditKind;
use crate::error::KernelError;
use crate::thread::{Event, ThreadState};
use crate::Kernel;

impl<H: Hal> Kernel<H> {
    /// Route `irq` to `handler` and unmask it on the handler's core.
    pub fn register_irq(&mut self, handler: JobId, irq: Irq) -> Result<(), KernelError> {
        if self.config().is_cpu_local(irq) {
            return Err(KernelError::IrqUnavailable(irq));
        }
        let cpu = self.thread(handler)?.cpu;
        match self.irq_handlers.get(&irq) {
            Some(owner) if *owner != handler => return Err(KernelError::IrqUnavailable(irq)),
            _ => {}
        }
        self.irq_handlers.insert(irq, handler);
        self.hal().unmask(irq, cpu);
        log::debug!("irq {} -> {:?}", irq, handler);
        Ok(())
    }

    /// Give up ownership of `irq`; it stays masked.
    pub fn unregister_irq(&mut self, handler: JobId, irq: Irq) -> Result<(), KernelError> {
        if self.irq_handlers.get(&irq) != Some(&handler) {
            return Err(KernelError::IrqUnavailable(irq));
        }
        self.irq_handlers.remove(&irq);
        self.hal().mask(irq);
        Ok(())
    }

    /// Re-enable a delivered interrupt.
    pub fn ack_irq(&mut self, handler: JobId, irq: Irq) -> Result<(), KernelError> {
        if self.irq_handlers.get(&irq) != Some(&handler) {
            return Err(KernelError::IrqUnavailable(irq));
        }
        let cpu = self.thread(handler)?.cpu;
        self.hal().unmask(irq, cpu);
        Ok(())
    }

    /// Take the next queued event, or block until one arrives.
    ///
    /// Returns `None` when the thread was blocked. It is woken by the next
    /// event (or by `cancel_blocking`) and calls again to take it.
    pub fn await_event(&mut self, job: JobId) -> Result<Option<Event>, KernelError> {
        self.entered(job, |k| {
            let thread = k.thread_mut(job)?;
            if thread.state != ThreadState::Active {
                return Err(KernelError::InvalidState);
            }
            if let Some(event) = thread.events.pop_front() {
                return Ok(Some(event));
            }
            k.deactivate(job, ThreadState::AwaitsEvent)?;
            Ok(None)
        })
    }

    /// Events queued for `job` and not yet taken.
    pub fn pending_events(&self, job: JobId) -> Result<usize, KernelError> {
        Ok(self.thread(job)?.events.len())
    }

    /// Mask `irq` and hand it to its handler.
    pub(crate) fn forward_irq(&mut self, irq: Irq) -> Result<(), KernelError> {
        self.hal().mask(irq);
        let handler = match self.irq_handlers.get(&irq) {
            Some(handler) => *handler,
            None => {
                log::warn!("spurious irq {}", irq);
                return Ok(());
            }
        };
        self.notify(handler, Event::Irq(irq))?;
        self.record(AuditKind::IrqForwarded { irq, handler });
        Ok(())
    }

    /// Drop every interrupt route owned by `job`.
    pub(crate) fn release_irqs(&mut self, job: JobId) {
        let owned: Vec<Irq> = self
            .irq_handlers
            .iter()
            .filter(|(_, h)| **h == job)
            .map(|(irq, _)| *irq)
            .collect();
        for irq in owned {
            self.irq_handlers.remove(&irq);
            self.hal().mask(irq);
        }
    }
}

#[cfg(test)]
mod tests {
    use keel_hal::CpuId;

    use super::*;
    use crate::cpu::Trap;
    use crate::test_support::kernel;

    #[test]
    fn test_cpu_local_vectors_cannot_be_registered() {
        let mut k = kernel();
        let d = k.create_domain("drv", 1500).unwrap();
        let t = k.create_thread(d, "drv", 0, 0, CpuId(0)).unwrap();
        let timer = k.config().timer_irq;
        assert_eq!(
            k.register_irq(t, timer),
            Err(KernelError::IrqUnavailable(timer))
        );
    }

    #[test]
    fn test_irq_forwarded_masked_until_ack() {
        let mut k = kernel();
        let d = k.create_domain("drv", 1500).unwrap();
        let t = k.create_thread(d, "drv", 0, 0, CpuId(0)).unwrap();
        k.start(t, 0, 0).unwrap();
        k.register_irq(t, 40).unwrap();
        assert_eq!(k.await_event(t).unwrap(), None);
        assert_eq!(k.thread(t).unwrap().state, ThreadState::AwaitsEvent);

        k.hal().raise(CpuId(0), 40).unwrap();
        k.handle_trap(CpuId(0), Trap::Interrupt).unwrap();

        assert!(k.hal().is_masked(40));
        assert_eq!(k.thread(t).unwrap().state, ThreadState::Active);
        assert_eq!(k.await_event(t).unwrap(), Some(Event::Irq(40)));

        k.ack_irq(t, 40).unwrap();
        assert!(!k.hal().is_masked(40));
    }

    #[test]
    fn test_irq_owned_by_one_thread() {
        let mut k = kernel();
        let d = k.create_domain("drv", 1500).unwrap();
        let a = k.create_thread(d, "a", 0, 0, CpuId(0)).unwrap();
        let b = k.create_thread(d, "b", 0, 0, CpuId(0)).unwrap();
        k.register_irq(a, 41).unwrap();
        assert_eq!(k.register_irq(b, 41), Err(KernelError::IrqUnavailable(41)));
        assert_eq!(k.ack_irq(b, 41), Err(KernelError::IrqUnavailable(41)));
    }
}
