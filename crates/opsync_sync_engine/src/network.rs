//! Connectivity tracking.

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use tokio::sync::watch;

/// Coarse connection quality, as reported by the platform.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct NetworkQuality {
    /// Connection class such as `4g` or `wifi`.
    pub effective_type: Option<String>,
    /// Estimated downlink bandwidth.
    pub downlink_mbps: Option<f64>,
    /// Estimated round-trip time.
    pub rtt_ms: Option<u32>,
    /// The user asked for reduced data usage.
    pub save_data: bool,
}

/// Snapshot of connectivity.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct NetworkState {
    /// Whether the device is online.
    pub online: bool,
    /// Quality metadata.
    pub quality: NetworkQuality,
}

/// A connectivity change.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NetworkEvent {
    /// Went from offline to online.
    Online,
    /// Went from online to offline.
    Offline,
}

type Listener = Arc<dyn Fn(NetworkEvent) + Send + Sync>;

struct MonitorInner {
    state: watch::Sender<NetworkState>,
    listeners: Mutex<Vec<(u64, Listener)>>,
    next_listener: AtomicU64,
}

/// Tracks online/offline state and notifies subscribers of transitions.
///
/// The platform integration calls [`NetworkMonitor::set_online`]; tests
/// drive it the same way. Clones share state.
#[derive(Clone)]
pub struct NetworkMonitor {
    inner: Arc<MonitorInner>,
}

impl NetworkMonitor {
    /// Creates a monitor with the given initial connectivity.
    pub fn new(online: bool) -> Self {
        let (state, _) = watch::channel(NetworkState {
            online,
            quality: NetworkQuality::default(),
        });
        Self {
            inner: Arc::new(MonitorInner {
                state,
                listeners: Mutex::new(Vec::new()),
                next_listener: AtomicU64::new(0),
            }),
        }
    }

    /// Returns true if currently online.
    pub fn is_online(&self) -> bool {
        self.inner.state.borrow().online
    }

    /// Current quality metadata.
    pub fn quality(&self) -> NetworkQuality {
        self.inner.state.borrow().quality.clone()
    }

    /// Current state.
    pub fn state(&self) -> NetworkState {
        self.inner.state.borrow().clone()
    }

    /// Records connectivity. Returns the transition, if the state changed.
    ///
    /// Listeners run synchronously on the calling thread.
    pub fn set_online(&self, online: bool) -> Option<NetworkEvent> {
        let changed = self.inner.state.send_if_modified(|state| {
            if state.online == online {
                return false;
            }
            state.online = online;
            true
        });
        if !changed {
            return None;
        }

        let event = if online {
            NetworkEvent::Online
        } else {
            NetworkEvent::Offline
        };
        tracing::info!(?event, "network transition");

        let listeners: Vec<Listener> = self
            .inner
            .listeners
            .lock()
            .iter()
            .map(|(_, l)| Arc::clone(l))
            .collect();
        for listener in listeners {
            listener(event);
        }
        Some(event)
    }

    /// Records quality metadata. Does not notify transition listeners.
    pub fn set_quality(&self, quality: NetworkQuality) {
        self.inner.state.send_modify(|state| state.quality = quality);
    }

    /// Registers `listener` for online/offline transitions.
    ///
    /// The listener stays registered until the returned [`Subscription`]
    /// is dropped or [`Subscription::unsubscribe`] is called.
    #[must_use = "dropping the subscription unsubscribes immediately"]
    pub fn on_transition<F>(&self, listener: F) -> Subscription
    where
        F: Fn(NetworkEvent) + Send + Sync + 'static,
    {
        let id = self.inner.next_listener.fetch_add(1, Ordering::Relaxed);
        self.inner.listeners.lock().push((id, Arc::new(listener)));
        Subscription {
            monitor: Arc::downgrade(&self.inner),
            id,
        }
    }

    /// Number of registered listeners.
    pub fn listener_count(&self) -> usize {
        self.inner.listeners.lock().len()
    }

    /// A receiver that observes every state change.
    pub fn watch(&self) -> watch::Receiver<NetworkState> {
        self.inner.state.subscribe()
    }
}

impl Default for NetworkMonitor {
    fn default() -> Self {
        Self::new(true)
    }
}

impl std::fmt::Debug for NetworkMonitor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NetworkMonitor")
            .field("state", &*self.inner.state.borrow())
            .field("listeners", &self.listener_count())
            .finish()
    }
}

/// Handle for a transition listener. Unsubscribes on drop.
pub struct Subscription {
    monitor: Weak<MonitorInner>,
    id: u64,
}

impl Subscription {
    /// Removes the listener now.
    pub fn unsubscribe(self) {}
}

impl Drop for Subscription {
    fn drop(&mut self) {
        if let Some(inner) = self.monitor.upgrade() {
            inner.listeners.lock().retain(|(id, _)| *id != self.id);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    #[test]
    fn transitions_notify_listeners() {
        let monitor = NetworkMonitor::new(false);
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        let _sub = monitor.on_transition(move |event| sink.lock().push(event));

        assert_eq!(monitor.set_online(true), Some(NetworkEvent::Online));
        assert_eq!(monitor.set_online(true), None);
        assert_eq!(monitor.set_online(false), Some(NetworkEvent::Offline));

        assert_eq!(*seen.lock(), vec![NetworkEvent::Online, NetworkEvent::Offline]);
    }

    #[test]
    fn dropping_subscription_unsubscribes() {
        let monitor = NetworkMonitor::new(true);
        let count = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&count);
        let sub = monitor.on_transition(move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
        });
        assert_eq!(monitor.listener_count(), 1);

        monitor.set_online(false);
        sub.unsubscribe();
        monitor.set_online(true);

        assert_eq!(count.load(Ordering::SeqCst), 1);
        assert_eq!(monitor.listener_count(), 0);
    }

    #[test]
    fn quality_is_reported() {
        let monitor = NetworkMonitor::default();
        monitor.set_quality(NetworkQuality {
            effective_type: Some("3g".into()),
            downlink_mbps: Some(1.5),
            rtt_ms: Some(300),
            save_data: true,
        });
        assert!(monitor.is_online());
        assert_eq!(monitor.quality().rtt_ms, Some(300));
    }

    #[tokio::test]
    async fn watch_sees_changes() {
        let monitor = NetworkMonitor::new(false);
        let mut rx = monitor.watch();
        monitor.set_online(true);
        rx.changed().await.unwrap();
        assert!(rx.borrow_and_update().online);
    }
}
