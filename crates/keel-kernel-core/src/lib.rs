//! Keel Kernel Core - Pure State Machines for Formal Verification
//!
//! This crate contains the **pure, HAL-free** parts of the Keel microkernel:
//! the per-core scheduler, the per-domain capability space and the per-thread
//! IPC state machine. The runtime crate `keel-kernel` wires them to cores,
//! timers and interrupts.
//!
//! # Design Principles
//!
//! 1. **No HAL dependency**: timers and interrupt controllers live in `keel-hal`
//! 2. **No singletons**: one `Scheduler` per core and one `CapabilitySpace` per
//!    domain are plain values owned by their core or domain
//! 3. **Deterministic**: same operations in the same order, same decisions
//! 4. **Verifiable**: unit tests, loom models and Kani proofs
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                    keel-kernel-core                         │
//! │                                                             │
//! │   ┌───────────────┐    ┌───────────────┐                   │
//! │   │   Scheduler   │    │ Capability    │                   │
//! │   │ claims, fills │    │ Space         │                   │
//! │   │ idle job      │    │ SpinLock<Map> │                   │
//! │   └───────────────┘    └───────────────┘                   │
//! │                                                             │
//! │   ┌───────────────┐    ┌───────────────┐                   │
//! │   │   IpcNode     │    │  Invariants   │                   │
//! │   │ MsgBuf x2     │    │  Assertions   │                   │
//! │   └───────────────┘    └───────────────┘                   │
//! └─────────────────────────────────────────────────────────────┘
//!                              │
//!                              │ used by
//!                              ▼
//! ┌─────────────────────────────────────────────────────────────┐
//! │                      keel-kernel                            │
//! │   - per-core Cpu (timer, interrupts, schedule())            │
//! │   - domains, threads, IPC transport                         │
//! │   - audit log                                               │
//! └─────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Module Organization
//!
//! - `types` - Identifiers and priorities
//! - `scheduler` - Priority/quota/fill scheduler
//! - `capability` - Capability space, index allocator, validator trait
//! - `ipc` - Message buffers and IPC node state machine
//! - `sync` - Spinlock wrapper
//! - `invariants` - Runtime-checkable invariants

#![no_std]
extern crate alloc;

pub mod capability;
pub mod invariants;
pub mod ipc;
pub mod scheduler;
pub mod sync;
pub mod types;

#[cfg(any(test, feature = "loom"))]
mod loom_tests;

// Re-export all public types for convenient access
pub use capability::{
    CapError, CapIndex, CapIndexAllocator, CapValidator, CapabilitySpace, STATIC_REF_COUNT,
};
pub use invariants::{check_capability_space, check_scheduler, InvariantViolation};
pub use ipc::{
    ClientState, Delivery, IpcError, IpcNode, MsgBuf, ServerState, MAX_CAPS_PER_MESSAGE,
    MAX_MESSAGE_SIZE,
};
pub use scheduler::Scheduler;
pub use sync::SpinLock;
pub use types::{Badge, CapId, DomainId, JobId, Kcap, Priority, PRIORITY_LEVELS};
