use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use futures::FutureExt;
use kforward_commons::{Error, Forward};
use tokio::task::JoinError;
use tokio_util::sync::CancellationToken;

use crate::event_bus::{Event, EventBus, Topic};
use crate::health_checker::HealthChecker;
use crate::http_proxy;
use crate::signal::{Signal, SignalSender};
use crate::traits::{ForwardRequest, HeartbeatResponder, HttpLogInterceptor, PortForwarder};

const READY_TIMEOUT: Duration = Duration::from_secs(30);
const STOP_GRACE: Duration = Duration::from_secs(3);
/// An `http_log`-enabled Forward's Kubernetes tunnel is shifted off its user-visible local port
/// onto this offset, freeing the original port for Worker's own reverse proxy.
const HTTP_LOG_PORT_OFFSET: u16 = 10000;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerState {
    Idle,
    Resolving,
    Connecting,
    Connected,
    Reconnecting,
    Stopped,
}

/// Drives one supervised tunnel through the state machine: resolve, connect, monitor, retry with
/// backoff.
pub struct Worker {
    forward: Forward,
    id: String,
    port_forwarder: Arc<dyn PortForwarder>,
    health_checker: Arc<HealthChecker>,
    http_interceptor: Arc<dyn HttpLogInterceptor>,
    event_bus: Arc<EventBus>,
    #[allow(dead_code)]
    verbose: bool,
    state: Mutex<WorkerState>,
    last_endpoint: Mutex<Option<String>>,
    alive: AtomicBool,
    worker_cancel: CancellationToken,
    conn_cancel: Mutex<Option<CancellationToken>>,
    success_tx: SignalSender<()>,
    reconnect_tx: SignalSender<String>,
    signals: Mutex<Option<(Signal<()>, Signal<String>)>>,
    supervisor_handle: Mutex<Option<tokio::task::JoinHandle<()>>>,
}

impl Worker {
    pub fn new(
        forward: Forward,
        port_forwarder: Arc<dyn PortForwarder>,
        health_checker: Arc<HealthChecker>,
        http_interceptor: Arc<dyn HttpLogInterceptor>,
        event_bus: Arc<EventBus>,
        verbose: bool,
    ) -> Arc<Self> {
        let id = forward.id();
        let success_signal: Signal<()> = Signal::new();
        let success_tx = success_signal.sender();
        let reconnect_signal: Signal<String> = Signal::new();
        let reconnect_tx = reconnect_signal.sender();

        Arc::new(Worker {
            forward,
            id,
            port_forwarder,
            health_checker,
            http_interceptor,
            event_bus,
            verbose,
            state: Mutex::new(WorkerState::Idle),
            last_endpoint: Mutex::new(None),
            alive: AtomicBool::new(true),
            worker_cancel: CancellationToken::new(),
            conn_cancel: Mutex::new(None),
            success_tx,
            reconnect_tx,
            signals: Mutex::new(Some((success_signal, reconnect_signal))),
            supervisor_handle: Mutex::new(None),
        })
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn forward(&self) -> &Forward {
        &self.forward
    }

    pub fn state(&self) -> WorkerState {
        *self.state.lock().unwrap()
    }

    fn set_state(&self, new: WorkerState) {
        *self.state.lock().unwrap() = new;
    }

    fn publish(&self, topic: Topic) {
        self.event_bus.publish(topic, Event::new(self.id.clone()));
    }

    fn publish_error(&self, message: impl Into<String>) {
        self.event_bus.publish(
            Topic::ForwardError,
            Event::new(self.id.clone()).with("message", message.into()),
        );
    }

    pub fn reconnect_sender(&self) -> SignalSender<String> {
        self.reconnect_tx.clone()
    }

    /// Cancels the current connection attempt (if any) and wakes the supervisor loop. Called by
    /// the Watchdog's hang callback and by the HealthChecker's staleness policy.
    pub fn trigger_reconnect(&self, reason: impl Into<String>) {
        if let Some(token) = self.conn_cancel.lock().unwrap().as_ref() {
            token.cancel();
        }
        self.reconnect_tx.trigger(reason.into());
    }

    pub fn start(self: &Arc<Self>) {
        let (success_signal, reconnect_signal) = self
            .signals
            .lock()
            .unwrap()
            .take()
            .expect("Worker::start called more than once");
        let this = Arc::clone(self);
        let handle = tokio::spawn(async move { this.supervise(success_signal, reconnect_signal).await });
        *self.supervisor_handle.lock().unwrap() = Some(handle);
    }

    /// Cancels the worker and waits up to 3s for the supervisor loop to exit. Idempotent.
    pub async fn stop(&self) {
        self.worker_cancel.cancel();
        if let Some(token) = self.conn_cancel.lock().unwrap().take() {
            token.cancel();
        }
        let handle = self.supervisor_handle.lock().unwrap().take();
        if let Some(handle) = handle {
            let _ = tokio::time::timeout(STOP_GRACE, handle).await;
        }
        self.alive.store(false, Ordering::SeqCst);
        self.set_state(WorkerState::Stopped);
    }

    async fn supervise(self: Arc<Self>, mut success_signal: Signal<()>, mut reconnect_signal: Signal<String>) {
        let mut backoff = crate::backoff::Backoff::new();
        let mut first_resolution = true;

        'main: loop {
            if self.worker_cancel.is_cancelled() {
                break;
            }

            if success_signal.try_recv().is_some() {
                backoff.reset();
            }

            self.set_state(WorkerState::Resolving);
            if first_resolution {
                self.health_checker.mark_starting(&self.id);
                self.publish(Topic::ForwardStarting);
            }

            let resolved = tokio::select! {
                _ = self.worker_cancel.cancelled() => break 'main,
                r = self.port_forwarder.get_pod_for_resource(
                    &self.forward.context,
                    &self.forward.namespace,
                    &self.forward.resource,
                ) => r,
            };

            let endpoint = match resolved {
                Ok(endpoint) => endpoint,
                Err(e) => {
                    log::warn!("worker {}: resolve failed: {e}", self.id);
                    self.publish_error(format!("resolve failed: {e}"));
                    if !self.sleep_backoff(&mut backoff, &mut reconnect_signal).await {
                        break 'main;
                    }
                    continue;
                }
            };

            let was_connected = matches!(self.state(), WorkerState::Connected);
            let endpoint_changed = self
                .last_endpoint
                .lock()
                .unwrap()
                .as_deref()
                .map(|prev| prev != endpoint)
                .unwrap_or(false);
            if was_connected && endpoint_changed {
                log::info!("worker {}: endpoint changed, remote restarted", self.id);
                self.set_state(WorkerState::Reconnecting);
                self.health_checker.mark_reconnecting(&self.id);
                self.publish(Topic::ForwardDisconnected);
                self.publish(Topic::ForwardReconnecting);
            }
            *self.last_endpoint.lock().unwrap() = Some(endpoint);
            first_resolution = false;

            self.set_state(WorkerState::Connecting);

            let internal_port = if self.forward.http_log {
                self.forward.local_port.saturating_add(HTTP_LOG_PORT_OFFSET)
            } else {
                self.forward.local_port
            };
            if self.forward.http_log && !http_proxy::port_is_free(internal_port) {
                log::warn!(
                    "worker {}: http-log internal port {} is not free, retrying",
                    self.id,
                    internal_port
                );
                self.set_state(WorkerState::Reconnecting);
                self.health_checker.mark_reconnecting(&self.id);
                self.publish(Topic::ForwardReconnecting);
                if !self.sleep_backoff(&mut backoff, &mut reconnect_signal).await {
                    break 'main;
                }
                continue;
            }

            let conn_token = self.worker_cancel.child_token();
            *self.conn_cancel.lock().unwrap() = Some(conn_token.clone());

            let (ready_tx, ready_rx) = tokio::sync::oneshot::channel();
            let req = ForwardRequest {
                context: self.forward.context.clone(),
                namespace: self.forward.namespace.clone(),
                resource: self.forward.resource.clone(),
                local_port: internal_port,
                remote_port: self.forward.remote_port,
                stop: conn_token.clone(),
                ready: ready_tx,
            };

            let forwarder = Arc::clone(&self.port_forwarder);
            let mut handle = tokio::spawn(async move {
                match AssertUnwindSafe(forwarder.forward(req)).catch_unwind().await {
                    Ok(result) => result,
                    Err(_) => Err(Error::Connect("panic in tunnel task".to_string())),
                }
            });

            let became_ready = tokio::select! {
                _ = self.worker_cancel.cancelled() => {
                    conn_token.cancel();
                    let _ = (&mut handle).await;
                    break 'main;
                }
                _ = ready_rx => true,
                res = &mut handle => {
                    self.log_task_result(res);
                    false
                }
                _ = tokio::time::sleep(READY_TIMEOUT) => {
                    log::warn!("worker {}: ready timeout", self.id);
                    self.publish_error("ready timeout");
                    conn_token.cancel();
                    let _ = (&mut handle).await;
                    false
                }
            };

            if !became_ready {
                self.set_state(WorkerState::Reconnecting);
                self.health_checker.mark_reconnecting(&self.id);
                self.publish(Topic::ForwardReconnecting);
                if !self.sleep_backoff(&mut backoff, &mut reconnect_signal).await {
                    break 'main;
                }
                continue;
            }

            self.set_state(WorkerState::Connected);
            self.health_checker.mark_connected(&self.id);
            self.publish(Topic::ForwardConnected);
            self.success_tx.fire();

            // Started only after the tunnel itself is ready; torn down first below, in the
            // reverse of that startup order.
            let proxy_cancel = conn_token.child_token();
            let proxy_handle = if self.forward.http_log {
                Some(tokio::spawn(http_proxy::run_reverse_proxy(
                    self.id.clone(),
                    self.forward.local_port,
                    internal_port,
                    Arc::clone(&self.http_interceptor),
                    proxy_cancel.clone(),
                )))
            } else {
                None
            };

            let mut handle_done = false;
            tokio::select! {
                _ = self.worker_cancel.cancelled() => {}
                reason = reconnect_signal.recv() => {
                    log::info!("worker {}: reconnect requested: {:?}", self.id, reason);
                }
                res = &mut handle => {
                    self.log_task_result(res);
                    handle_done = true;
                }
            }

            if let Some(ph) = proxy_handle {
                proxy_cancel.cancel();
                if let Ok(Err(e)) = ph.await {
                    log::warn!("worker {}: http-log proxy ended: {e}", self.id);
                }
            }
            conn_token.cancel();
            if !handle_done {
                let _ = (&mut handle).await;
            }

            if self.worker_cancel.is_cancelled() {
                break 'main;
            }

            self.set_state(WorkerState::Reconnecting);
            self.health_checker.mark_reconnecting(&self.id);
            self.publish(Topic::ForwardDisconnected);
            self.publish(Topic::ForwardReconnecting);
            if !self.sleep_backoff(&mut backoff, &mut reconnect_signal).await {
                break 'main;
            }
        }

        self.set_state(WorkerState::Stopped);
        self.alive.store(false, Ordering::SeqCst);
        self.publish(Topic::ForwardStopped);
    }

    /// Sleeps for the next backoff delay, cancellable by worker-wide Stop or by an incoming
    /// reconnect trigger (which should wake resolution immediately rather than wait out the
    /// remainder of the delay). Returns false if the worker was stopped during the sleep.
    async fn sleep_backoff(&self, backoff: &mut crate::backoff::Backoff, reconnect_signal: &mut Signal<String>) -> bool {
        let delay = backoff.next();
        tokio::select! {
            _ = self.worker_cancel.cancelled() => false,
            _ = tokio::time::sleep(delay) => true,
            _ = reconnect_signal.recv() => true,
        }
    }

    fn log_task_result(&self, result: Result<Result<(), Error>, JoinError>) {
        match result {
            Ok(Ok(())) => log::info!("worker {}: tunnel task returned", self.id),
            Ok(Err(e)) => {
                log::warn!("worker {}: tunnel task failed: {e}", self.id);
                self.publish_error(format!("tunnel task failed: {e}"));
            }
            Err(e) => {
                log::warn!("worker {}: tunnel task join error: {e}", self.id);
                self.publish_error(format!("tunnel task join error: {e}"));
            }
        }
    }
}

impl HeartbeatResponder for Worker {
    fn is_alive(&self) -> bool {
        self.alive.load(Ordering::SeqCst) && !self.worker_cancel.is_cancelled()
    }

    fn forward_id(&self) -> &str {
        &self.id
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use kforward_commons::ResourceRef;
    use std::sync::atomic::AtomicU32;
    use std::time::Duration as StdDuration;

    struct FlakyForwarder {
        resolve_failures: AtomicU32,
        endpoint: String,
    }

    #[async_trait]
    impl PortForwarder for FlakyForwarder {
        async fn get_pod_for_resource(
            &self,
            _context: &str,
            _namespace: &str,
            _resource: &ResourceRef,
        ) -> Result<String, Error> {
            if self.resolve_failures.load(Ordering::SeqCst) > 0 {
                self.resolve_failures.fetch_sub(1, Ordering::SeqCst);
                return Err(Error::Resolve("not found yet".to_string()));
            }
            Ok(self.endpoint.clone())
        }

        async fn forward(&self, req: ForwardRequest) -> Result<(), Error> {
            let _ = req.ready.send(());
            req.stop.cancelled().await;
            Ok(())
        }
    }

    fn test_forward() -> Forward {
        Forward {
            context: "dev".into(),
            namespace: "default".into(),
            resource: ResourceRef::Pod { name: "app".into() },
            protocol: kforward_commons::Protocol::Tcp,
            remote_port: 80,
            local_port: 18080,
            alias: None,
            http_log: false,
        }
    }

    #[tokio::test(start_paused = true)]
    async fn reaches_connected_state() {
        let forwarder = Arc::new(FlakyForwarder {
            resolve_failures: AtomicU32::new(0),
            endpoint: "app-1".to_string(),
        });
        let health = HealthChecker::new(
            crate::health_checker::ProbeMethod::TcpDial,
            StdDuration::from_secs(1),
            StdDuration::from_millis(50),
            StdDuration::ZERO,
            StdDuration::ZERO,
        );
        let worker = Worker::new(
            test_forward(),
            forwarder,
            health,
            Arc::new(crate::traits::NoopHttpLogInterceptor),
            Arc::new(EventBus::new()),
            false,
        );
        worker.start();

        tokio::time::advance(StdDuration::from_millis(50)).await;
        tokio::task::yield_now().await;
        tokio::task::yield_now().await;

        assert_eq!(worker.state(), WorkerState::Connected);
        worker.stop().await;
        assert_eq!(worker.state(), WorkerState::Stopped);
    }

    #[tokio::test(start_paused = true)]
    async fn stop_is_idempotent() {
        let forwarder = Arc::new(FlakyForwarder {
            resolve_failures: AtomicU32::new(0),
            endpoint: "app-1".to_string(),
        });
        let health = HealthChecker::new(
            crate::health_checker::ProbeMethod::TcpDial,
            StdDuration::from_secs(1),
            StdDuration::from_millis(50),
            StdDuration::ZERO,
            StdDuration::ZERO,
        );
        let worker = Worker::new(
            test_forward(),
            forwarder,
            health,
            Arc::new(crate::traits::NoopHttpLogInterceptor),
            Arc::new(EventBus::new()),
            false,
        );
        worker.start();
        tokio::task::yield_now().await;

        worker.stop().await;
        worker.stop().await;
        assert_eq!(worker.state(), WorkerState::Stopped);
    }

    /// A forwarder that, instead of idling until cancelled, binds `req.local_port` and echoes
    /// one byte back per connection — standing in for the real Kubernetes tunnel so the reverse
    /// proxy has something live to relay into.
    struct EchoForwarder;

    #[async_trait]
    impl PortForwarder for EchoForwarder {
        async fn get_pod_for_resource(
            &self,
            _context: &str,
            _namespace: &str,
            _resource: &ResourceRef,
        ) -> Result<String, Error> {
            Ok("app-1".to_string())
        }

        async fn forward(&self, req: ForwardRequest) -> Result<(), Error> {
            let listener = tokio::net::TcpListener::bind(("127.0.0.1", req.local_port))
                .await
                .map_err(|e| Error::Connect(e.to_string()))?;
            let _ = req.ready.send(());
            loop {
                tokio::select! {
                    _ = req.stop.cancelled() => return Ok(()),
                    accepted = listener.accept() => {
                        if let Ok((mut stream, _)) = accepted {
                            tokio::spawn(async move {
                                use tokio::io::{AsyncReadExt, AsyncWriteExt};
                                let mut buf = [0u8; 1];
                                if stream.read_exact(&mut buf).await.is_ok() {
                                    let _ = stream.write_all(&buf).await;
                                }
                            });
                        }
                    }
                }
            }
        }
    }

    #[tokio::test]
    async fn http_log_forward_proxies_through_shifted_internal_port() {
        let health = HealthChecker::new(
            crate::health_checker::ProbeMethod::TcpDial,
            StdDuration::from_secs(1),
            StdDuration::from_millis(50),
            StdDuration::ZERO,
            StdDuration::ZERO,
        );
        let mut forward = test_forward();
        forward.http_log = true;
        forward.local_port = 0;
        let user_listener = std::net::TcpListener::bind(("127.0.0.1", 0)).unwrap();
        forward.local_port = user_listener.local_addr().unwrap().port();
        drop(user_listener);

        let worker = Worker::new(
            forward.clone(),
            Arc::new(EchoForwarder),
            health,
            Arc::new(crate::traits::NoopHttpLogInterceptor),
            Arc::new(EventBus::new()),
            false,
        );
        worker.start();

        for _ in 0..200 {
            tokio::time::sleep(StdDuration::from_millis(10)).await;
            if worker.state() == WorkerState::Connected {
                break;
            }
        }
        assert_eq!(worker.state(), WorkerState::Connected);

        use tokio::io::{AsyncReadExt, AsyncWriteExt};
        let mut client = tokio::net::TcpStream::connect(("127.0.0.1", forward.local_port))
            .await
            .unwrap();
        client.write_all(&[7]).await.unwrap();
        let mut buf = [0u8; 1];
        client.read_exact(&mut buf).await.unwrap();
        assert_eq!(buf[0], 7);

        worker.stop().await;
        assert_eq!(worker.state(), WorkerState::Stopped);
    }
}
