//! Simulated platform
//!
//! A deterministic HAL that keeps one virtual clock, one one-shot timer and
//! one pending-interrupt queue per core. Time only moves when the owner calls
//! [`SimHal::advance`], which makes every scheduling decision reproducible.

use alloc::collections::{BTreeSet, VecDeque};
use alloc::string::String;
use alloc::vec::Vec;
use core::sync::atomic::{AtomicU64, Ordering};

use spin::Mutex;

use crate::{CpuId, Hal, HalError, InterruptController, Irq, Timer};

struct SimCpu {
    time: AtomicU64,
    deadline: Mutex<Option<u64>>,
    pending: Mutex<VecDeque<Irq>>,
    ipis: AtomicU64,
}

impl SimCpu {
    fn new() -> Self {
        Self {
            time: AtomicU64::new(0),
            deadline: Mutex::new(None),
            pending: Mutex::new(VecDeque::new()),
            ipis: AtomicU64::new(0),
        }
    }
}

/// Deterministic simulated platform.
pub struct SimHal {
    cpus: Vec<SimCpu>,
    timer_irq: Irq,
    ipi_irq: Irq,
    masked: Mutex<BTreeSet<Irq>>,
    /// Interrupts raised while masked, delivered on unmask
    latched: Mutex<BTreeSet<Irq>>,
    console: Mutex<Vec<String>>,
}

impl SimHal {
    /// Create a platform with `cpus` cores using the given CPU-local vectors.
    pub fn new(cpus: usize, timer_irq: Irq, ipi_irq: Irq) -> Self {
        Self {
            cpus: (0..cpus).map(|_| SimCpu::new()).collect(),
            timer_irq,
            ipi_irq,
            masked: Mutex::new(BTreeSet::new()),
            latched: Mutex::new(BTreeSet::new()),
            console: Mutex::new(Vec::new()),
        }
    }

    fn cpu(&self, cpu: CpuId) -> Result<&SimCpu, HalError> {
        self.cpus.get(cpu.0).ok_or(HalError::InvalidCpu(cpu.0))
    }

    /// Move `cpu`'s clock forward, firing its timer if the deadline passed.
    pub fn advance(&self, cpu: CpuId, delta: u64) -> Result<u64, HalError> {
        let c = self.cpu(cpu)?;
        let now = c.time.fetch_add(delta, Ordering::SeqCst) + delta;
        let expired = {
            let mut deadline = c.deadline.lock();
            match *deadline {
                Some(at) if at <= now => {
                    *deadline = None;
                    true
                }
                _ => false,
            }
        };
        if expired {
            self.raise(cpu, self.timer_irq)?;
        }
        Ok(now)
    }

    /// Time until `cpu`'s timer fires, if armed.
    pub fn remaining(&self, cpu: CpuId) -> Option<u64> {
        let c = self.cpu(cpu).ok()?;
        let now = c.time.load(Ordering::SeqCst);
        let deadline = *c.deadline.lock();
        deadline.map(|at| at.saturating_sub(now))
    }

    /// Advance `cpu`'s clock exactly to its armed deadline.
    ///
    /// Returns the elapsed time, or `None` if no timeout is armed.
    pub fn run_to_timeout(&self, cpu: CpuId) -> Option<u64> {
        let delta = self.remaining(cpu)?;
        self.advance(cpu, delta).ok()?;
        Some(delta)
    }

    /// Make `irq` pending on `cpu` (device side of the controller).
    pub fn raise(&self, cpu: CpuId, irq: Irq) -> Result<(), HalError> {
        let c = self.cpu(cpu)?;
        if self.masked.lock().contains(&irq) {
            self.latched.lock().insert(irq);
            return Ok(());
        }
        c.pending.lock().push_back(irq);
        Ok(())
    }

    /// Whether `irq` is currently masked.
    pub fn is_masked(&self, irq: Irq) -> bool {
        self.masked.lock().contains(&irq)
    }

    /// Number of inter-processor interrupts sent to `cpu`.
    pub fn ipi_count(&self, cpu: CpuId) -> u64 {
        self.cpu(cpu).map(|c| c.ipis.load(Ordering::SeqCst)).unwrap_or(0)
    }

    /// Lines written through `debug_write`.
    pub fn console(&self) -> Vec<String> {
        self.console.lock().clone()
    }
}

impl Timer for SimHal {
    fn time(&self, cpu: CpuId) -> u64 {
        self.cpu(cpu).map(|c| c.time.load(Ordering::SeqCst)).unwrap_or(0)
    }

    fn schedule_timeout(&self, cpu: CpuId, duration: u64) {
        if let Ok(c) = self.cpu(cpu) {
            let now = c.time.load(Ordering::SeqCst);
            *c.deadline.lock() = Some(now + duration);
        }
    }
}

impl InterruptController for SimHal {
    fn take_request(&self, cpu: CpuId) -> Option<Irq> {
        self.cpu(cpu).ok()?.pending.lock().pop_front()
    }

    fn finish_request(&self, _cpu: CpuId, _irq: Irq) {}

    fn mask(&self, irq: Irq) {
        self.masked.lock().insert(irq);
    }

    fn unmask(&self, irq: Irq, cpu: CpuId) {
        self.masked.lock().remove(&irq);
        if self.latched.lock().remove(&irq) {
            let _ = self.raise(cpu, irq);
        }
    }

    fn send_ipi(&self, cpu: CpuId) {
        if let Ok(c) = self.cpu(cpu) {
            c.ipis.fetch_add(1, Ordering::SeqCst);
            c.pending.lock().push_back(self.ipi_irq);
        }
    }
}

impl Hal for SimHal {
    fn cpu_count(&self) -> usize {
        self.cpus.len()
    }

    fn debug_write(&self, msg: &str) {
        self.console.lock().push(String::from(msg));
    }
}
