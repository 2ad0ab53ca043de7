//! Task and worker change notifications.

pub mod bus;
pub mod model;

pub use bus::{EventBus, Subscription};
pub use model::{Delivery, Event, EventFilter, Frame, TaskPayload, WorkerPayload};
