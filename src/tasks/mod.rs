//! Tasks, subtasks and the registry that owns them.

pub mod model;
pub mod registry;

pub use model::{
    Acceptance, Operand, Operator, Subtask, SubtaskId, SubtaskStatus, Task, TaskDetail, TaskId,
    TaskStatus, TaskSummary,
};
pub use registry::{TaskHandle, TaskRegistry};
