use crate::types::{ConnectionState, InputIndex, OutputIndex, ZoneField, ZoneValue};
use tokio::sync::broadcast;
use tokio::task::JoinHandle;

/// State change delivered to observers
#[derive(Debug, Clone, PartialEq)]
pub enum ChangeEvent {
    /// One attribute of an output changed
    Zone {
        index: OutputIndex,
        field: ZoneField,
        old: ZoneValue,
        new: ZoneValue,
    },

    /// An input's label changed
    SourceLabel {
        index: InputIndex,
        old: String,
        new: String,
    },

    /// A full snapshot replaced the cached inputs and outputs
    Snapshot,

    /// The session link changed state; `Failed` means cached state may be stale
    Connection(ConnectionState),
}

impl ChangeEvent {
    /// Output the event concerns, if any
    pub fn zone(&self) -> Option<OutputIndex> {
        match self {
            ChangeEvent::Zone { index, .. } => Some(*index),
            _ => None,
        }
    }
}

/// Fan-out of change events to any number of observers
///
/// Publishing never blocks. Each observer reads from its own cursor into a
/// bounded ring; an observer that falls more than `capacity` events behind
/// loses the oldest ones.
#[derive(Clone)]
pub struct ChangeBus {
    tx: broadcast::Sender<ChangeEvent>,
}

impl ChangeBus {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        Self { tx }
    }

    /// Deliver an event to every current observer
    pub fn publish(&self, event: ChangeEvent) {
        tracing::debug!("Publishing {:?}", event);
        // No receivers is fine
        let _ = self.tx.send(event);
    }

    /// Register a new observer
    pub fn subscribe(&self) -> Subscription {
        Subscription::new(self.tx.subscribe())
    }

    /// Invoke `callback` for every event until the returned handle is
    /// unsubscribed or dropped
    pub fn register<F>(&self, callback: F) -> NotifierHandle
    where
        F: Fn(&ChangeEvent) + Send + Sync + 'static,
    {
        let mut subscription = self.subscribe();
        let task = tokio::spawn(async move {
            while let Some(event) = subscription.recv().await {
                callback(&event);
            }
        });
        NotifierHandle { task: Some(task) }
    }

    pub fn observer_count(&self) -> usize {
        self.tx.receiver_count()
    }
}

/// Receiver for change events
///
/// Dropping it unsubscribes.
pub struct Subscription {
    rx: broadcast::Receiver<ChangeEvent>,
}

impl Subscription {
    pub(crate) fn new(rx: broadcast::Receiver<ChangeEvent>) -> Self {
        Self { rx }
    }

    /// Receive the next change event
    ///
    /// Returns `None` once the matrix has been dropped.
    pub async fn recv(&mut self) -> Option<ChangeEvent> {
        loop {
            match self.rx.recv().await {
                Ok(event) => return Some(event),
                Err(broadcast::error::RecvError::Lagged(n)) => {
                    tracing::warn!("Observer fell behind, dropped {} oldest change events", n);
                }
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    }

    /// Try to receive a change event without blocking
    ///
    /// Returns `None` if no event is available.
    pub fn try_recv(&mut self) -> Option<ChangeEvent> {
        loop {
            match self.rx.try_recv() {
                Ok(event) => return Some(event),
                Err(broadcast::error::TryRecvError::Lagged(n)) => {
                    tracing::warn!("Observer fell behind, dropped {} oldest change events", n);
                }
                Err(_) => return None,
            }
        }
    }

    /// Stop receiving events
    pub fn unsubscribe(self) {}
}

/// Handle for a callback registered with `register_change_notifier`
pub struct NotifierHandle {
    task: Option<JoinHandle<()>>,
}

impl NotifierHandle {
    /// Stop invoking the callback
    pub fn unsubscribe(mut self) {
        self.abort();
    }

    fn abort(&mut self) {
        if let Some(task) = self.task.take() {
            task.abort();
        }
    }
}

impl Drop for NotifierHandle {
    fn drop(&mut self) {
        self.abort();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use std::time::Duration;

    fn volume_event(index: OutputIndex, old: u8, new: u8) -> ChangeEvent {
        ChangeEvent::Zone {
            index,
            field: ZoneField::Volume,
            old: ZoneValue::Volume(Some(old)),
            new: ZoneValue::Volume(Some(new)),
        }
    }

    #[tokio::test]
    async fn every_observer_sees_every_event() {
        let bus = ChangeBus::new(16);
        let mut a = bus.subscribe();
        let mut b = bus.subscribe();

        bus.publish(volume_event(1, 10, 20));

        assert_eq!(a.recv().await, Some(volume_event(1, 10, 20)));
        assert_eq!(b.recv().await, Some(volume_event(1, 10, 20)));
    }

    #[tokio::test]
    async fn slow_observer_loses_oldest_events_only() {
        let bus = ChangeBus::new(4);
        let mut slow = bus.subscribe();

        for v in 0..10u8 {
            bus.publish(volume_event(1, v, v + 1));
        }

        let mut received = Vec::new();
        while let Some(event) = slow.try_recv() {
            received.push(event);
        }
        assert_eq!(
            received,
            (6..10u8).map(|v| volume_event(1, v, v + 1)).collect::<Vec<_>>()
        );
    }

    #[tokio::test]
    async fn dropped_subscription_stops_counting() {
        let bus = ChangeBus::new(4);
        let sub = bus.subscribe();
        assert_eq!(bus.observer_count(), 1);
        sub.unsubscribe();
        assert_eq!(bus.observer_count(), 0);
    }

    #[tokio::test]
    async fn registered_callback_runs_until_unsubscribed() {
        let bus = ChangeBus::new(8);
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = calls.clone();
        let handle = bus.register(move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
        });

        bus.publish(ChangeEvent::Snapshot);
        tokio::time::timeout(Duration::from_secs(1), async {
            while calls.load(Ordering::SeqCst) == 0 {
                tokio::task::yield_now().await;
            }
        })
        .await
        .unwrap();

        handle.unsubscribe();
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(bus.observer_count(), 0);
        bus.publish(ChangeEvent::Snapshot);
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }
}
