//! Workers: directory bookkeeping on the orchestrator side, and the agent
//! that executes assignments.

pub mod agent;
pub mod client;
pub mod directory;
pub mod model;

pub use agent::{WorkerAgent, spawn_pool};
pub use client::{HttpClient, LocalClient, OrchestratorClient};
pub use directory::WorkerDirectory;
pub use model::{
    Assignment, AssignmentRef, HeartbeatAck, Outcome, ReportOutcome, ReportedStatus,
    ResultReport, WorkerStatus, WorkerSummary,
};
