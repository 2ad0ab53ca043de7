//! Calc orchestrator: compiles arithmetic expressions into operation graphs
//! and farms the operations out to workers.

pub mod api;
pub mod compiler;
pub mod config;
pub mod delay;
pub mod error;
pub mod events;
pub mod logging;
pub mod orchestrator;
pub mod scheduler;
pub mod store;
pub mod tasks;
pub mod workers;
