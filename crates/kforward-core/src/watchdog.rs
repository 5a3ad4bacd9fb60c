use std::sync::Arc;
use std::time::{Duration, Instant};

use dashmap::DashMap;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;

use crate::traits::HeartbeatResponder;

struct Liveness {
    responder: Arc<dyn HeartbeatResponder>,
    callback: Arc<dyn Fn(&str) + Send + Sync>,
    last_heartbeat: Instant,
    hung: bool,
}

/// Detects workers whose supervisor loop has stopped making progress and requests a reconnect.
/// Liveness is pull-based: the Watchdog calls `is_alive()` on each registered worker itself every
/// tick, rather than workers pushing heartbeats.
pub struct Watchdog {
    entries: Arc<DashMap<String, Liveness>>,
    check_interval: Duration,
    hang_threshold: Duration,
    cancel: CancellationToken,
    loop_handle: Mutex<Option<tokio::task::JoinHandle<()>>>,
}

impl Watchdog {
    pub fn new(check_interval: Duration, hang_threshold: Duration) -> Arc<Self> {
        Arc::new(Watchdog {
            entries: Arc::new(DashMap::new()),
            check_interval,
            hang_threshold,
            cancel: CancellationToken::new(),
            loop_handle: Mutex::new(None),
        })
    }

    pub async fn start(self: &Arc<Self>) {
        let this = Arc::clone(self);
        let handle = tokio::spawn(async move { this.run().await });
        *self.loop_handle.lock().await = Some(handle);
    }

    pub async fn stop(&self) {
        self.cancel.cancel();
        if let Some(handle) = self.loop_handle.lock().await.take() {
            let _ = handle.await;
        }
    }

    pub fn register(
        &self,
        forward_id: &str,
        responder: Arc<dyn HeartbeatResponder>,
        callback: Arc<dyn Fn(&str) + Send + Sync>,
    ) {
        self.entries.insert(
            forward_id.to_string(),
            Liveness {
                responder,
                callback,
                last_heartbeat: Instant::now(),
                hung: false,
            },
        );
    }

    pub fn unregister(&self, forward_id: &str) {
        self.entries.remove(forward_id);
    }

    pub fn is_hung(&self, forward_id: &str) -> bool {
        self.entries.get(forward_id).map(|e| e.hung).unwrap_or(false)
    }

    async fn run(&self) {
        let mut ticker = tokio::time::interval(self.check_interval);
        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => break,
                _ = ticker.tick() => self.tick(),
            }
        }
    }

    /// Collects hang-transition callbacks under the map lock, then invokes every callback after
    /// releasing it — a callback that calls back into the Watchdog (e.g. via `TriggerReconnect`
    /// re-registering) must never deadlock against the tick itself.
    fn tick(&self) {
        let now = Instant::now();
        let mut fired = Vec::new();

        for mut entry in self.entries.iter_mut() {
            if entry.responder.is_alive() {
                entry.last_heartbeat = now;
                entry.hung = false;
                continue;
            }
            let elapsed = now.saturating_duration_since(entry.last_heartbeat);
            if elapsed > self.hang_threshold && !entry.hung {
                entry.hung = true;
                fired.push((entry.key().clone(), Arc::clone(&entry.callback)));
            }
        }

        for (forward_id, callback) in fired {
            callback(&forward_id);
        }
    }
}
