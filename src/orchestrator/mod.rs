//! Session orchestration.
//!
//! Covers admission and preemption, the per-attempt generation driver,
//! the node-local driver registry, and completion hooks.

pub mod completion;
pub mod coordinator;
pub mod generation;
pub mod registry;

pub use completion::{CompletionHook, HookRunner, NotifyPreviewHook};
pub use coordinator::{SessionCoordinator, StartOutcome};
pub use generation::{DriverDeps, GenerationDriver, Generations};
pub use registry::DriverRegistry;
