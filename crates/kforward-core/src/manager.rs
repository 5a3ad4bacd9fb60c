use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use kforward_commons::{Error, Forward, ForwardStatus, HealthCheckConfig, ReliabilityConfig};

use crate::event_bus::{Event, EventBus, Topic};
use crate::health_checker::HealthChecker;
use crate::port_checker::PortChecker;
use crate::status_updater::StatusUpdater;
use crate::traits::{HeartbeatResponder, HttpLogInterceptor, MdnsPublisher, PortForwarder};
use crate::watchdog::Watchdog;
use crate::worker::Worker;

/// Every health transition publishes `health.stale` when the new status is `Stale`,
/// `health.status_changed` otherwise.
fn health_topic_for(status: &ForwardStatus) -> Topic {
    match status {
        ForwardStatus::Stale => Topic::HealthStale,
        _ => Topic::HealthStatusChanged,
    }
}

/// Owns the Worker set and realises configuration changes against it. The only non-trivial
/// correctness rule lives here: `Reload`'s port-availability admission and the subsequent
/// add/remove pass are atomic — either the whole reload applies or the previous generation is
/// left untouched.
pub struct Manager {
    port_forwarder: Arc<dyn PortForwarder>,
    port_checker: Arc<dyn PortChecker>,
    status_updater: Arc<dyn StatusUpdater>,
    http_log_interceptor: Arc<dyn HttpLogInterceptor>,
    mdns_publisher: Arc<dyn MdnsPublisher>,
    event_bus: Arc<EventBus>,
    health_checker: Arc<HealthChecker>,
    watchdog: Arc<Watchdog>,
    retry_on_stale: Arc<AtomicBool>,
    mdns_enabled: AtomicBool,
    verbose: bool,
    workers: Mutex<HashMap<String, Arc<Worker>>>,
    generation: Mutex<HashMap<String, Forward>>,
    reload_lock: tokio::sync::Mutex<()>,
}

impl Manager {
    pub fn new(
        port_forwarder: Arc<dyn PortForwarder>,
        port_checker: Arc<dyn PortChecker>,
        status_updater: Arc<dyn StatusUpdater>,
        http_log_interceptor: Arc<dyn HttpLogInterceptor>,
        mdns_publisher: Arc<dyn MdnsPublisher>,
        health_check: &HealthCheckConfig,
        reliability: &ReliabilityConfig,
        verbose: bool,
    ) -> Arc<Self> {
        let method = match health_check.method {
            kforward_commons::ProbeMethod::TcpDial => crate::health_checker::ProbeMethod::TcpDial,
            kforward_commons::ProbeMethod::DataTransfer => crate::health_checker::ProbeMethod::DataTransfer,
        };
        let health_checker = HealthChecker::new(
            method,
            health_check.interval(),
            health_check.timeout(),
            health_check.max_connection_age(),
            health_check.max_idle_time(),
        );
        let watchdog = Watchdog::new(
            reliability.watchdog_period(),
            ReliabilityConfig::DEFAULT_HANG_THRESHOLD,
        );

        Arc::new(Manager {
            port_forwarder,
            port_checker,
            status_updater,
            http_log_interceptor,
            mdns_publisher,
            event_bus: Arc::new(EventBus::new()),
            health_checker,
            watchdog,
            retry_on_stale: Arc::new(AtomicBool::new(reliability.retry_on_stale())),
            mdns_enabled: AtomicBool::new(false),
            verbose,
            workers: Mutex::new(HashMap::new()),
            generation: Mutex::new(HashMap::new()),
            reload_lock: tokio::sync::Mutex::new(()),
        })
    }

    pub fn event_bus(&self) -> &Arc<EventBus> {
        &self.event_bus
    }

    /// Admits `cfg` and realises it as a Worker per Forward. Fails with `InvalidConfig` if `cfg`
    /// is absent; an empty forward set is a valid (if uneventful) configuration.
    pub async fn start(&self, cfg: Option<kforward_commons::Config>) -> Result<(), Error> {
        let _guard = self.reload_lock.lock().await;
        let cfg = cfg.ok_or_else(|| Error::InvalidConfig("configuration is required".to_string()))?;
        let forwards = cfg.forwards()?;

        if forwards.is_empty() {
            *self.generation.lock().unwrap() = HashMap::new();
            return Ok(());
        }

        let ports: Vec<(u16, String)> = forwards.iter().map(|f| (f.local_port, f.id())).collect();
        let conflicts = self.port_checker.check_availability(&ports, &HashSet::new()).await;
        if !conflicts.is_empty() {
            return Err(Error::PortConflict(conflicts));
        }

        self.mdns_enabled.store(cfg.mdns.enabled, Ordering::SeqCst);
        self.health_checker.start().await;
        self.watchdog.start().await;

        let mut generation = HashMap::new();
        for forward in forwards {
            generation.insert(forward.id(), forward.clone());
            self.start_worker(forward);
        }
        *self.generation.lock().unwrap() = generation;
        Ok(())
    }

    /// Computes the add/remove/keep sets against the current generation and applies them only
    /// if the whole new forward set is admissible — the reload is atomic.
    pub async fn reload(&self, new_cfg: Option<kforward_commons::Config>) -> Result<(), Error> {
        let _guard = self.reload_lock.lock().await;
        let new_cfg = new_cfg.ok_or_else(|| Error::InvalidConfig("configuration is required".to_string()))?;
        let new_forwards = new_cfg.forwards()?;
        let new_map: HashMap<String, Forward> = new_forwards.into_iter().map(|f| (f.id(), f)).collect();
        let new_ids: HashSet<String> = new_map.keys().cloned().collect();

        let current_map = self.generation.lock().unwrap().clone();
        let current_ids: HashSet<String> = current_map.keys().cloned().collect();

        let mut to_add: Vec<String> = new_ids.difference(&current_ids).cloned().collect();
        let mut to_remove: Vec<String> = current_ids.difference(&new_ids).cloned().collect();
        let mut to_keep: HashSet<String> = new_ids.intersection(&current_ids).cloned().collect();

        // Same id, different Forward content (e.g. local_port edited): implemented as
        // stop(old); start(new), not an in-place update of the kept Worker.
        for id in new_ids.intersection(&current_ids) {
            if current_map.get(id) != new_map.get(id) {
                to_remove.push(id.clone());
                to_add.push(id.clone());
                to_keep.remove(id);
            }
        }

        let kept_ports: HashSet<u16> = to_keep
            .iter()
            .filter_map(|id| new_map.get(id).map(|f| f.local_port))
            .collect();
        let new_ports: Vec<(u16, String)> = to_add
            .iter()
            .filter_map(|id| new_map.get(id).map(|f| (f.local_port, id.clone())))
            .collect();

        let conflicts = self.port_checker.check_availability(&new_ports, &kept_ports).await;
        if !conflicts.is_empty() {
            return Err(Error::PortConflict(conflicts));
        }

        for id in &to_remove {
            self.stop_worker(id).await;
        }
        for id in &to_add {
            if let Some(forward) = new_map.get(id) {
                self.start_worker(forward.clone());
            }
        }

        *self.generation.lock().unwrap() = new_map;
        self.mdns_enabled.store(new_cfg.mdns.enabled, Ordering::SeqCst);
        self.event_bus.publish(Topic::ConfigReloaded, Event::new("*"));
        Ok(())
    }

    /// Stops the HealthChecker and Watchdog scheduler loops, then stops every Worker in
    /// parallel. Idempotent.
    pub async fn stop(&self) {
        self.watchdog.stop().await;
        self.health_checker.stop().await;

        let ids: Vec<String> = self.workers.lock().unwrap().keys().cloned().collect();
        let stops = ids.iter().map(|id| self.stop_worker(id));
        futures::future::join_all(stops).await;
    }

    pub async fn disable_forward(&self, id: &str) -> Result<(), Error> {
        if !self.generation.lock().unwrap().contains_key(id) {
            return Err(Error::NotFound(id.to_string()));
        }
        self.stop_worker(id).await;
        Ok(())
    }

    pub async fn enable_forward(&self, id: &str) -> Result<(), Error> {
        let forward = {
            let generation = self.generation.lock().unwrap();
            generation
                .get(id)
                .cloned()
                .ok_or_else(|| Error::NotFound(id.to_string()))?
        };
        if self.workers.lock().unwrap().contains_key(id) {
            return Err(Error::AlreadyEnabled(id.to_string()));
        }
        let ports = vec![(forward.local_port, id.to_string())];
        let conflicts = self.port_checker.check_availability(&ports, &HashSet::new()).await;
        if !conflicts.is_empty() {
            return Err(Error::PortConflict(conflicts));
        }
        self.start_worker(forward);
        Ok(())
    }

    fn start_worker(&self, forward: Forward) {
        let id = forward.id();
        let worker = Worker::new(
            forward.clone(),
            Arc::clone(&self.port_forwarder),
            Arc::clone(&self.health_checker),
            Arc::clone(&self.http_log_interceptor),
            Arc::clone(&self.event_bus),
            self.verbose,
        );

        self.status_updater.add_forward(&id, &forward);
        if self.mdns_enabled.load(Ordering::SeqCst) {
            self.mdns_publisher
                .publish(&id, forward.local_port, forward.alias.as_deref());
        }

        let status_updater = Arc::clone(&self.status_updater);
        let event_bus = Arc::clone(&self.event_bus);
        let retry_on_stale = Arc::clone(&self.retry_on_stale);
        let worker_weak = Arc::downgrade(&worker);
        self.health_checker.register(
            &id,
            forward.local_port,
            Arc::new(move |fid, status| {
                status_updater.update_status(fid, &status);
                let is_stale = matches!(&status, ForwardStatus::Stale);
                event_bus.publish(health_topic_for(&status), Event::new(fid));
                if is_stale && retry_on_stale.load(Ordering::SeqCst) {
                    if let Some(worker) = worker_weak.upgrade() {
                        worker.trigger_reconnect("stale");
                    }
                }
            }),
        );

        let watchdog_worker: Arc<dyn HeartbeatResponder> = Arc::clone(&worker) as Arc<dyn HeartbeatResponder>;
        let reconnect_worker = Arc::clone(&worker);
        let event_bus2 = Arc::clone(&self.event_bus);
        self.watchdog.register(
            &id,
            watchdog_worker,
            Arc::new(move |fid| {
                event_bus2.publish(Topic::WatchdogWorkerHung, Event::new(fid));
                reconnect_worker.trigger_reconnect("watchdog hung");
            }),
        );

        worker.start();
        self.workers.lock().unwrap().insert(id, worker);
    }

    async fn stop_worker(&self, id: &str) {
        let worker = self.workers.lock().unwrap().remove(id);
        if let Some(worker) = worker {
            worker.stop().await;
        }
        self.health_checker.unregister(id);
        self.watchdog.unregister(id);
        self.status_updater.remove(id);
        if self.mdns_enabled.load(Ordering::SeqCst) {
            self.mdns_publisher.withdraw(id);
        }
    }
}
