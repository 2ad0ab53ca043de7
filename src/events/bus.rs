//! Broadcast event bus with per-subscriber cursors.

use std::pin::Pin;
use std::task::{Context, Poll};

use futures::{Stream, StreamExt};
use tokio::sync::broadcast;
use tokio_stream::wrappers::BroadcastStream;
use tokio_stream::wrappers::errors::BroadcastStreamRecvError;
use tracing::warn;

use super::model::{Delivery, Event, EventFilter};

/// Fan-out of task and worker changes.
///
/// Each subscriber has its own bounded buffer. A subscriber that falls
/// behind loses the oldest events and sees a [`Delivery::Gap`] instead.
pub struct EventBus {
    tx: broadcast::Sender<Event>,
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (tx, _rx) = broadcast::channel(capacity.max(1));
        Self { tx }
    }

    /// Publish to current subscribers. Nobody listening is fine.
    pub fn publish(&self, event: Event) {
        let _ = self.tx.send(event);
    }

    /// Events published from now on that match `filter`. No replay.
    pub fn subscribe(&self, filter: EventFilter) -> Subscription {
        let stream = BroadcastStream::new(self.tx.subscribe()).filter_map(move |item| {
            let delivery = match item {
                Ok(event) if filter.matches(&event) => Some(Delivery::Event(event)),
                Ok(_) => None,
                Err(BroadcastStreamRecvError::Lagged(missed)) => {
                    warn!(missed, "Event subscriber lagged behind");
                    Some(Delivery::Gap { missed })
                }
            };
            std::future::ready(delivery)
        });
        Subscription {
            inner: Box::pin(stream),
        }
    }
}

/// Lazy sequence of deliveries for one subscriber.
pub struct Subscription {
    inner: Pin<Box<dyn Stream<Item = Delivery> + Send>>,
}

impl Subscription {
    /// Next delivery; `None` once the bus is gone.
    pub async fn recv(&mut self) -> Option<Delivery> {
        self.inner.next().await
    }
}

impl Stream for Subscription {
    type Item = Delivery;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.inner.as_mut().poll_next(cx)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::model::WorkerPayload;
    use crate::workers::model::WorkerStatus;

    fn worker_event(id: &str) -> Event {
        Event::WorkerChanged(WorkerPayload {
            id: id.to_string(),
            state: WorkerStatus::Idle,
            exp: None,
            task_id: None,
            subtask_id: None,
        })
    }

    #[tokio::test]
    async fn subscribers_only_see_later_events() {
        let bus = EventBus::new(16);
        bus.publish(worker_event("before"));
        let mut sub = bus.subscribe(EventFilter::all());
        bus.publish(worker_event("after"));

        match sub.recv().await {
            Some(Delivery::Event(Event::WorkerChanged(p))) => assert_eq!(p.id, "after"),
            other => panic!("unexpected delivery: {other:?}"),
        }
    }

    #[tokio::test]
    async fn filtered_events_are_skipped() {
        let bus = EventBus::new(16);
        let mut sub = bus.subscribe(EventFilter {
            owner_id: None,
            tasks: true,
            workers: false,
        });
        bus.publish(worker_event("w1"));
        drop(bus);
        assert!(sub.recv().await.is_none());
    }

    #[tokio::test]
    async fn slow_subscriber_gets_gap() {
        let bus = EventBus::new(2);
        let mut sub = bus.subscribe(EventFilter::all());
        for i in 0..5 {
            bus.publish(worker_event(&format!("w{i}")));
        }
        assert_eq!(sub.recv().await, Some(Delivery::Gap { missed: 3 }));
        match sub.recv().await {
            Some(Delivery::Event(Event::WorkerChanged(p))) => assert_eq!(p.id, "w3"),
            other => panic!("unexpected delivery: {other:?}"),
        }
    }
}
