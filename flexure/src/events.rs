//! Equipment lifecycle events
//!
//! Meridian flips, dithers and image saves arrive on a broadcast bus owned by
//! the host application. The compensator subscribes while it is running and
//! drops the subscription when it is turned off or dropped.

use crate::equipment::ImageType;
use log::{debug, warn};
use std::future::Future;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;

/// Capacity of the event bus
pub const EVENT_BUS_CAPACITY: usize = 64;

/// Guiding statistics attached to an image about to be saved
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SavedImageInfo {
    pub image_type: ImageType,
    /// Total guiding RMS in guide pixels
    pub recorded_rms_total: f64,
    /// Guide pixel scale used to convert the RMS to arcseconds
    pub rms_scale: f64,
}

/// Events published by the mount, guider and image writer
#[derive(Debug, Clone, PartialEq)]
pub enum EquipmentEvent {
    MeridianFlipCompleted,
    DitherCompleted,
    BeforeImageSaved(SavedImageInfo),
}

/// Broadcast bus for [`EquipmentEvent`]s
#[derive(Debug, Clone)]
pub struct EventBus {
    tx: broadcast::Sender<EquipmentEvent>,
}

impl EventBus {
    pub fn new() -> Self {
        let (tx, _rx) = broadcast::channel(EVENT_BUS_CAPACITY);
        Self { tx }
    }

    /// Publish an event, returning how many subscribers received it
    pub fn publish(&self, event: EquipmentEvent) -> usize {
        self.tx.send(event).unwrap_or(0)
    }

    pub fn subscribe(&self) -> broadcast::Receiver<EquipmentEvent> {
        self.tx.subscribe()
    }

    pub fn subscriber_count(&self) -> usize {
        self.tx.receiver_count()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

/// A running event listener. Dropping it stops the listener.
#[derive(Debug)]
pub struct EventSubscription {
    handle: JoinHandle<()>,
}

impl EventSubscription {
    /// Spawn a listener feeding every event to `handler`.
    ///
    /// The listener stops when the bus closes or `handler` returns false.
    pub fn spawn<F, Fut>(mut rx: broadcast::Receiver<EquipmentEvent>, mut handler: F) -> Self
    where
        F: FnMut(EquipmentEvent) -> Fut + Send + 'static,
        Fut: Future<Output = bool> + Send + 'static,
    {
        let handle = tokio::spawn(async move {
            debug!("Equipment event listener started");
            loop {
                match rx.recv().await {
                    Ok(event) => {
                        if !handler(event).await {
                            break;
                        }
                    }
                    Err(broadcast::error::RecvError::Lagged(n)) => {
                        warn!("Equipment event listener lagged, {} events skipped", n);
                    }
                    Err(broadcast::error::RecvError::Closed) => {
                        debug!("Equipment event bus closed");
                        break;
                    }
                }
            }
            debug!("Equipment event listener stopped");
        });
        Self { handle }
    }

    pub fn is_finished(&self) -> bool {
        self.handle.is_finished()
    }
}

impl Drop for EventSubscription {
    fn drop(&mut self) {
        self.handle.abort();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use std::time::Duration;

    #[test]
    fn test_publish_without_subscribers() {
        let bus = EventBus::new();
        assert_eq!(bus.publish(EquipmentEvent::DitherCompleted), 0);
        assert_eq!(bus.subscriber_count(), 0);
    }

    #[tokio::test]
    async fn test_subscription_receives_events() {
        let bus = EventBus::new();
        let seen = Arc::new(AtomicUsize::new(0));
        let counter = seen.clone();
        let (done_tx, mut done_rx) = tokio::sync::mpsc::unbounded_channel();

        let _subscription = EventSubscription::spawn(bus.subscribe(), move |event| {
            let counter = counter.clone();
            let done_tx = done_tx.clone();
            async move {
                counter.fetch_add(1, Ordering::SeqCst);
                let _ = done_tx.send(event);
                true
            }
        });

        assert_eq!(bus.publish(EquipmentEvent::MeridianFlipCompleted), 1);
        assert_eq!(bus.publish(EquipmentEvent::DitherCompleted), 1);

        assert_eq!(done_rx.recv().await, Some(EquipmentEvent::MeridianFlipCompleted));
        assert_eq!(done_rx.recv().await, Some(EquipmentEvent::DitherCompleted));
        assert_eq!(seen.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_dropping_subscription_unsubscribes() {
        let bus = EventBus::new();
        let subscription = EventSubscription::spawn(bus.subscribe(), |_| async { true });
        assert_eq!(bus.subscriber_count(), 1);

        drop(subscription);
        // Abort is processed on the next scheduler pass
        for _ in 0..50 {
            if bus.subscriber_count() == 0 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(2)).await;
        }
        assert_eq!(bus.subscriber_count(), 0);
    }

    #[tokio::test]
    async fn test_handler_can_stop_listener() {
        let bus = EventBus::new();
        let subscription = EventSubscription::spawn(bus.subscribe(), |_| async { false });
        bus.publish(EquipmentEvent::DitherCompleted);
        for _ in 0..50 {
            if subscription.is_finished() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(2)).await;
        }
        assert!(subscription.is_finished());
    }
}
