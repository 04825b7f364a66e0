//! Progress fan-out with scoped subscriptions
//!
//! A [`ProgressHub`] delivers [`DownloadProgress`] events to every current
//! listener in emission order. Listeners are removed when their
//! [`Subscription`] is dropped, so a subscriber cannot leak past its scope.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError, Weak};

use crate::types::DownloadProgress;

/// Callback receiving progress events
pub type ProgressListener = Arc<dyn Fn(&DownloadProgress) + Send + Sync>;

#[derive(Default)]
struct HubInner {
    next_id: AtomicU64,
    listeners: Mutex<Vec<(u64, ProgressListener)>>,
}

/// Listener registry shared between an event source and its subscribers
#[derive(Clone, Default)]
pub struct ProgressHub {
    inner: Arc<HubInner>,
}

impl ProgressHub {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a listener until the returned guard is dropped
    pub fn subscribe(&self, listener: ProgressListener) -> Subscription {
        let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
        self.inner
            .listeners
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push((id, listener));
        Subscription {
            id,
            hub: Arc::downgrade(&self.inner),
        }
    }

    /// Deliver `progress` to every current listener.
    ///
    /// Listeners are called outside the registry lock so they may subscribe
    /// or unsubscribe themselves.
    pub fn emit(&self, progress: &DownloadProgress) {
        let listeners: Vec<ProgressListener> = self
            .inner
            .listeners
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .map(|(_, l)| Arc::clone(l))
            .collect();
        for listener in listeners {
            listener(progress);
        }
    }

    pub fn listener_count(&self) -> usize {
        self.inner
            .listeners
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }
}

/// Guard returned by [`ProgressHub::subscribe`]; unsubscribes on drop
#[must_use = "dropping a Subscription immediately unsubscribes the listener"]
pub struct Subscription {
    id: u64,
    hub: Weak<HubInner>,
}

impl Drop for Subscription {
    fn drop(&mut self) {
        if let Some(hub) = self.hub.upgrade() {
            hub.listeners
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .retain(|(id, _)| *id != self.id);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::ProgressStage;

    fn recorder() -> (ProgressListener, Arc<Mutex<Vec<i32>>>) {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        let listener: ProgressListener = Arc::new(move |p: &DownloadProgress| {
            sink.lock().unwrap().push(p.percent);
        });
        (listener, seen)
    }

    #[test]
    fn test_events_delivered_in_order() {
        let hub = ProgressHub::new();
        let (listener, seen) = recorder();
        let _sub = hub.subscribe(listener);

        for pct in [0, 25, 50, 100] {
            hub.emit(&DownloadProgress::new(ProgressStage::Downloading, pct));
        }
        assert_eq!(*seen.lock().unwrap(), vec![0, 25, 50, 100]);
    }

    #[test]
    fn test_drop_unsubscribes() {
        let hub = ProgressHub::new();
        let (listener, seen) = recorder();
        let sub = hub.subscribe(listener);
        assert_eq!(hub.listener_count(), 1);

        drop(sub);
        assert_eq!(hub.listener_count(), 0);

        hub.emit(&DownloadProgress::new(ProgressStage::Downloading, 10));
        assert!(seen.lock().unwrap().is_empty());
    }

    #[test]
    fn test_subscription_outliving_hub() {
        let hub = ProgressHub::new();
        let (listener, _) = recorder();
        let sub = hub.subscribe(listener);
        drop(hub);
        // Must not panic
        drop(sub);
    }
}
