//! Ready-queue scheduling primitives.

pub mod queue;

pub use queue::{ReadyEntry, ReadyQueue};
