//! Hardware Abstraction Layer for the Keel kernel
//!
//! The kernel core never touches hardware directly. Everything platform
//! specific that the scheduling and trap paths need is expressed through the
//! traits in this crate:
//!
//! - [`Timer`]: per-core one-shot timer and monotonic clock
//! - [`InterruptController`]: claim/acknowledge pending interrupts, masking,
//!   inter-processor interrupts
//! - [`Hal`]: the umbrella trait the kernel is generic over
//!
//! # Platform Implementations
//!
//! - **Simulated**: [`SimHal`], a deterministic single-address-space model
//!   used for hosted runs and tests
//! - **Bare metal**: provided by board support crates (out of tree)

#![no_std]

extern crate alloc;

pub mod sim;

pub use sim::SimHal;

/// Index of a physical processor core.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct CpuId(pub usize);

/// Interrupt number as seen by the interrupt controller.
pub type Irq = u32;

/// Per-core timer.
///
/// All durations and timestamps are microseconds.
pub trait Timer {
    /// Monotonic time of `cpu`'s timer.
    fn time(&self, cpu: CpuId) -> u64;

    /// Arm `cpu`'s one-shot timer to expire `duration` from now.
    ///
    /// Re-arming replaces any previously programmed deadline.
    fn schedule_timeout(&self, cpu: CpuId, duration: u64);
}

/// Generic interrupt controller.
pub trait InterruptController {
    /// Claim the next pending interrupt on `cpu`, if any.
    fn take_request(&self, cpu: CpuId) -> Option<Irq>;

    /// Acknowledge an interrupt previously returned by `take_request`.
    fn finish_request(&self, cpu: CpuId, irq: Irq);

    /// Stop delivering `irq`.
    fn mask(&self, irq: Irq);

    /// Deliver `irq` to `cpu` again.
    fn unmask(&self, irq: Irq, cpu: CpuId);

    /// Raise an inter-processor interrupt on `cpu`.
    fn send_ipi(&self, cpu: CpuId);
}

/// Hardware Abstraction Layer trait
///
/// Implementations provide platform-specific functionality for:
/// - Time measurement and timeouts ([`Timer`])
/// - Interrupt delivery ([`InterruptController`])
/// - Debug output
pub trait Hal: Timer + InterruptController + Send + Sync + 'static {
    /// Number of cores the platform brought up.
    fn cpu_count(&self) -> usize;

    /// Write a debug message to the platform's console.
    fn debug_write(&self, msg: &str);
}

/// HAL error types
#[derive(Clone, Copy, Debug, PartialEq, Eq, thiserror::Error)]
pub enum HalError {
    /// Operation not supported on this platform
    #[error("operation not supported")]
    NotSupported,
    /// Core index outside the platform's range
    #[error("invalid cpu {0}")]
    InvalidCpu(usize),
    /// Interrupt number not routed by the controller
    #[error("invalid irq {0}")]
    InvalidIrq(Irq),
}
