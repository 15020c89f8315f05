use std::sync::{Arc, Mutex};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum NetworkStatus {
    Available,
    Unavailable,
}

pub type ConnectivityCallback = Arc<dyn Fn(NetworkStatus) + Send + Sync>;

/// Reports platform reachability changes to the remote store.
pub trait ConnectivityMonitor: Send + Sync + 'static {
    fn add_callback(&self, callback: ConnectivityCallback);

    /// Stops reporting; callbacks are released.
    fn shutdown(&self);
}

/// Monitor for platforms without reachability information.
#[derive(Default)]
pub struct NoopConnectivityMonitor;

impl ConnectivityMonitor for NoopConnectivityMonitor {
    fn add_callback(&self, _callback: ConnectivityCallback) {}

    fn shutdown(&self) {}
}

/// Monitor driven by the embedding application, which reports changes
/// through [`ManualConnectivityMonitor::set_status`].
#[derive(Default)]
pub struct ManualConnectivityMonitor {
    callbacks: Mutex<Vec<ConnectivityCallback>>,
}

impl ManualConnectivityMonitor {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_status(&self, status: NetworkStatus) {
        let callbacks = self
            .callbacks
            .lock()
            .unwrap_or_else(|poison| poison.into_inner())
            .clone();
        for callback in callbacks {
            callback(status);
        }
    }
}

impl ConnectivityMonitor for ManualConnectivityMonitor {
    fn add_callback(&self, callback: ConnectivityCallback) {
        self.callbacks
            .lock()
            .unwrap_or_else(|poison| poison.into_inner())
            .push(callback);
    }

    fn shutdown(&self) {
        self.callbacks
            .lock()
            .unwrap_or_else(|poison| poison.into_inner())
            .clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn manual_monitor_fans_out_until_shutdown() {
        let monitor = ManualConnectivityMonitor::new();
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = calls.clone();
        monitor.add_callback(Arc::new(move |status| {
            assert_eq!(status, NetworkStatus::Available);
            counter.fetch_add(1, Ordering::SeqCst);
        }));
        monitor.set_status(NetworkStatus::Available);
        monitor.shutdown();
        monitor.set_status(NetworkStatus::Available);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }
}
