use std::collections::HashMap;
use std::io::ErrorKind;
use std::sync::Arc;
use std::time::{Duration, Instant};

use dashmap::DashMap;
use futures::stream::FuturesUnordered;
use futures::StreamExt;
use kforward_commons::ForwardStatus;
use tokio::io::AsyncReadExt;
use tokio::net::TcpStream;
use tokio::sync::Mutex;
use tokio::time;
use tokio_util::sync::CancellationToken;

/// How a probe decides whether a local port is still healthy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProbeMethod {
    TcpDial,
    DataTransfer,
}

#[derive(Debug, Clone)]
pub struct PortHealth {
    pub forward_id: String,
    pub port: u16,
    pub status: ForwardStatus,
    pub registered_at: Instant,
    pub connection_time: Instant,
    pub last_activity: Instant,
    pub last_check: Instant,
}

pub type StatusCallback = Arc<dyn Fn(&str, ForwardStatus) + Send + Sync>;

struct Entry {
    health: PortHealth,
    callback: StatusCallback,
}

const STARTUP_GRACE: Duration = Duration::from_secs(10);

/// One scheduler task probing every registered local port. All registration state lives behind
/// a single lock; callbacks are invoked without holding it, so a callback that re-enters the
/// HealthChecker cannot deadlock against the lock that produced it.
pub struct HealthChecker {
    entries: Arc<DashMap<String, Entry>>,
    method: ProbeMethod,
    interval: Duration,
    timeout: Duration,
    max_connection_age: Duration,
    max_idle_time: Duration,
    cancel: CancellationToken,
    loop_handle: Mutex<Option<tokio::task::JoinHandle<()>>>,
}

impl HealthChecker {
    pub fn new(
        method: ProbeMethod,
        interval: Duration,
        timeout: Duration,
        max_connection_age: Duration,
        max_idle_time: Duration,
    ) -> Arc<Self> {
        Arc::new(HealthChecker {
            entries: Arc::new(DashMap::new()),
            method,
            interval,
            timeout,
            max_connection_age,
            max_idle_time,
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

    pub fn register(self: &Arc<Self>, forward_id: &str, port: u16, callback: StatusCallback) {
        let now = Instant::now();
        self.entries.insert(
            forward_id.to_string(),
            Entry {
                health: PortHealth {
                    forward_id: forward_id.to_string(),
                    port,
                    status: ForwardStatus::Starting,
                    registered_at: now,
                    connection_time: now,
                    last_activity: now,
                    last_check: now,
                },
                callback,
            },
        );
        callback_for(&self.entries, forward_id, ForwardStatus::Starting);
        self.probe_now(forward_id);
    }

    pub fn mark_connected(self: &Arc<Self>, forward_id: &str) {
        let now = Instant::now();
        if let Some(mut entry) = self.entries.get_mut(forward_id) {
            entry.health.connection_time = now;
            entry.health.last_activity = now;
        }
        self.probe_now(forward_id);
    }

    /// Runs one probe immediately on a dedicated task, so `Register`/`MarkConnected` don't leave
    /// the UI stuck on `Starting` until the next scheduled tick.
    fn probe_now(self: &Arc<Self>, forward_id: &str) {
        let this = Arc::clone(self);
        let forward_id = forward_id.to_string();
        tokio::spawn(async move { this.check_one(forward_id).await });
    }

    pub fn mark_reconnecting(&self, forward_id: &str) {
        self.set_status(forward_id, ForwardStatus::Reconnecting);
    }

    pub fn mark_starting(&self, forward_id: &str) {
        self.set_status(forward_id, ForwardStatus::Starting);
    }

    fn set_status(&self, forward_id: &str, status: ForwardStatus) {
        let changed = {
            if let Some(mut entry) = self.entries.get_mut(forward_id) {
                let changed = entry.health.status != status;
                entry.health.status = status.clone();
                changed
            } else {
                false
            }
        };
        if changed {
            callback_for(&self.entries, forward_id, status);
        }
    }

    pub fn unregister(&self, forward_id: &str) {
        self.entries.remove(forward_id);
    }

    pub fn record_activity(&self, forward_id: &str) {
        if let Some(mut entry) = self.entries.get_mut(forward_id) {
            entry.health.last_activity = Instant::now();
        }
    }

    pub fn snapshot(&self, forward_id: &str) -> Option<PortHealth> {
        self.entries.get(forward_id).map(|e| e.health.clone())
    }

    async fn run(&self) {
        let mut ticker = time::interval(self.interval);
        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => break,
                _ = ticker.tick() => self.tick().await,
            }
        }
    }

    async fn tick(&self) {
        let ids: Vec<String> = self.entries.iter().map(|e| e.key().clone()).collect();
        let mut futs = FuturesUnordered::new();
        for id in ids {
            futs.push(self.check_one(id));
        }
        while futs.next().await.is_some() {}
    }

    async fn check_one(&self, forward_id: String) {
        let Some((port, registered_at, age, idle)) = self.entries.get(&forward_id).map(|e| {
            let now = Instant::now();
            (
                e.health.port,
                e.health.registered_at,
                now.saturating_duration_since(e.health.connection_time),
                now.saturating_duration_since(e.health.last_activity),
            )
        }) else {
            return;
        };

        if let Some(mut entry) = self.entries.get_mut(&forward_id) {
            entry.health.last_check = Instant::now();
        }

        if !self.max_connection_age.is_zero()
            && age > self.max_connection_age
            && idle > self.max_idle_time
        {
            self.set_status(&forward_id, ForwardStatus::Stale);
            return;
        }
        if !self.max_idle_time.is_zero() && idle > self.max_idle_time {
            self.set_status(&forward_id, ForwardStatus::Stale);
            return;
        }

        match probe(port, self.method, self.timeout).await {
            Ok(()) => {
                if let Some(mut entry) = self.entries.get_mut(&forward_id) {
                    entry.health.last_activity = Instant::now();
                }
                self.set_status(&forward_id, ForwardStatus::Active);
            }
            Err(message) => {
                if Instant::now().saturating_duration_since(registered_at) < STARTUP_GRACE {
                    self.set_status(&forward_id, ForwardStatus::Starting);
                } else {
                    self.set_status(&forward_id, ForwardStatus::Error { message });
                }
            }
        }
    }
}

fn callback_for(entries: &DashMap<String, Entry>, forward_id: &str, status: ForwardStatus) {
    let cb = entries.get(forward_id).map(|e| Arc::clone(&e.callback));
    if let Some(cb) = cb {
        cb(forward_id, status);
    }
}

async fn probe(port: u16, method: ProbeMethod, timeout: Duration) -> Result<(), String> {
    let addr = format!("127.0.0.1:{port}");
    match method {
        ProbeMethod::TcpDial => {
            time::timeout(timeout, TcpStream::connect(&addr))
                .await
                .map_err(|_| "tcp dial timed out".to_string())?
                .map_err(|e| e.to_string())?;
            Ok(())
        }
        ProbeMethod::DataTransfer => {
            let mut stream = time::timeout(timeout, TcpStream::connect(&addr))
                .await
                .map_err(|_| "tcp dial timed out".to_string())?
                .map_err(|e| e.to_string())?;
            let mut buf = [0u8; 1024];
            match time::timeout(timeout, stream.read(&mut buf)).await {
                Ok(Ok(_)) => Ok(()),
                Ok(Err(e)) if e.kind() == ErrorKind::UnexpectedEof => Ok(()),
                Ok(Err(e)) => Err(e.to_string()),
                Err(_) => Ok(()),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[tokio::test]
    async fn register_triggers_starting_callback() {
        let checker = HealthChecker::new(
            ProbeMethod::TcpDial,
            Duration::from_millis(10),
            Duration::from_millis(50),
            Duration::ZERO,
            Duration::ZERO,
        );
        let calls = Arc::new(AtomicUsize::new(0));
        let calls_clone = Arc::clone(&calls);
        checker.register(
            "dev/default/pod/app:80",
            8080,
            Arc::new(move |_id, status| {
                assert_eq!(status, ForwardStatus::Starting);
                calls_clone.fetch_add(1, Ordering::SeqCst);
            }),
        );
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert!(checker.snapshot("dev/default/pod/app:80").is_some());
    }

    #[test]
    fn registered_at_precedes_connection_and_activity() {
        let now = Instant::now();
        let health = PortHealth {
            forward_id: "x".into(),
            port: 1,
            status: ForwardStatus::Starting,
            registered_at: now,
            connection_time: now,
            last_activity: now,
            last_check: now,
        };
        assert!(health.registered_at <= health.connection_time);
        assert!(health.connection_time <= health.last_activity);
        assert!(health.last_activity <= health.last_check);
    }

    #[tokio::test]
    async fn unregister_removes_entry() {
        let checker = HealthChecker::new(
            ProbeMethod::TcpDial,
            Duration::from_secs(1),
            Duration::from_millis(50),
            Duration::ZERO,
            Duration::ZERO,
        );
        checker.register("a", 1234, Arc::new(|_, _| {}));
        assert!(checker.snapshot("a").is_some());
        checker.unregister("a");
        assert!(checker.snapshot("a").is_none());
    }
}
