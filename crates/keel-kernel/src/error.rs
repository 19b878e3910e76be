//! Kernel error types

use keel_hal::{HalError, Irq};
use keel_kernel_core::{CapError, DomainId, IpcError, JobId};

use crate::config::ConfigError;

/// Errors returned by kernel operations.
#[derive(Clone, Debug, PartialEq, Eq, thiserror::Error)]
pub enum KernelError {
    /// No thread with this id
    #[error("thread {0:?} not found")]
    ThreadNotFound(JobId),
    /// No domain with this id
    #[error("domain {0:?} not found")]
    DomainNotFound(DomainId),
    /// Core index outside the configured range
    #[error("cpu {0} not found")]
    CpuNotFound(usize),
    /// Operation not allowed in the thread's current state
    #[error("invalid thread state")]
    InvalidState,
    /// Register state of a running thread is not accessible
    #[error("register state not accessible")]
    StateAccess,
    /// Nothing delivered yet
    #[error("operation would block")]
    WouldBlock,
    /// Interrupt is CPU-local or registered elsewhere
    #[error("irq {0} not available")]
    IrqUnavailable(Irq),
    /// Capability-space failure
    #[error(transparent)]
    Capability(#[from] CapError),
    /// IPC failure, including cancellation
    #[error(transparent)]
    Ipc(#[from] IpcError),
    /// Platform failure
    #[error(transparent)]
    Hal(#[from] HalError),
    /// Rejected configuration
    #[error(transparent)]
    Config(#[from] ConfigError),
}

impl KernelError {
    /// Whether this is the cooperative-cancellation failure.
    pub fn is_cancelled(&self) -> bool {
        matches!(self, KernelError::Ipc(IpcError::Cancelled))
    }
}
