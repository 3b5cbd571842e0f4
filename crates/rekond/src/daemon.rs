//! Subsystem wiring.
//!
//! Assembles the bus, the engine, every configured driver and the API
//! router around one state store, and tears them down in order.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use axum::Router;
use rekon_api::{ResourceService, build_router};
use rekon_bus::topology::provision;
use rekon_bus::{Bus, Publisher};
use rekon_core::RekonConfig;
use rekon_driver::{
    BusLogSink, Driver, DriverManager, LogSink, ManagerConfig, TeeSink, TracingSink, builtin,
};
use rekon_engine::{DriverEvents, Engine};
use rekon_state::StateStore;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// A running set of subsystems.
pub struct Daemon {
    store: StateStore,
    bus: Bus,
    router: Router,
    shutdown_tx: watch::Sender<bool>,
    tasks: Vec<(String, JoinHandle<()>)>,
}

impl Daemon {
    /// Provision the bus and start the engine plus one dispatch loop per
    /// driver: the configured built-ins followed by `extra_drivers`.
    pub fn start(
        config: &RekonConfig,
        store: StateStore,
        extra_drivers: Vec<Driver>,
    ) -> anyhow::Result<Self> {
        config.validate()?;

        let bus = Bus::open(store.database())?;
        provision(&bus, config.bus.log_stream_max)?;
        let publisher: Arc<dyn Publisher> = Arc::new(bus.clone());

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let mut tasks = Vec::new();

        let mut drivers = config
            .drivers
            .iter()
            .map(builtin::from_config)
            .collect::<Result<Vec<_>, _>>()?;
        drivers.extend(extra_drivers);

        let mut names = HashSet::new();
        if let Some(dup) = drivers.iter().find(|d| !names.insert(d.name.clone())) {
            anyhow::bail!("driver '{}' registered twice", dup.name);
        }

        let driver_events: DriverEvents = drivers
            .iter()
            .map(|d| (d.name.clone(), d.events.clone()))
            .collect();
        let engine = Engine::new(store.clone(), publisher.clone()).with_driver_events(driver_events);
        tasks.push(("engine".to_string(), engine.start(&bus, shutdown_rx.clone())?));

        let log_sink: Arc<dyn LogSink> = Arc::new(TeeSink::new(vec![
            Arc::new(TracingSink) as Arc<dyn LogSink>,
            Arc::new(BusLogSink::new(publisher.clone())),
        ]));
        let manager_config = ManagerConfig::from(&config.bus);

        for driver in drivers {
            let name = driver.name.clone();
            let handle = DriverManager::new(driver, bus.clone())
                .with_publisher(publisher.clone())
                .with_log_sink(log_sink.clone())
                .with_config(manager_config)
                .start(shutdown_rx.clone())?;
            tasks.push((format!("driver:{name}"), handle));
        }

        let router = build_router(ResourceService::new(store.clone(), publisher));
        info!(tasks = tasks.len(), ack_mode = ?config.bus.ack_mode, "subsystems started");

        Ok(Self {
            store,
            bus,
            router,
            shutdown_tx,
            tasks,
        })
    }

    pub fn router(&self) -> Router {
        self.router.clone()
    }

    pub fn bus(&self) -> &Bus {
        &self.bus
    }

    pub fn store(&self) -> &StateStore {
        &self.store
    }

    /// Signal every task, close the bus and wait for the tasks to finish.
    /// In-flight reconciliations complete; anything still running after
    /// `timeout` is aborted and its message stays unacknowledged in the
    /// journal.
    pub async fn shutdown(self, timeout: Duration) {
        let _ = self.shutdown_tx.send(true);
        self.bus.close();

        let deadline = tokio::time::Instant::now() + timeout;
        for (name, handle) in self.tasks {
            let abort = handle.abort_handle();
            match tokio::time::timeout_at(deadline, handle).await {
                Ok(Ok(())) => debug!(task = %name, "task stopped"),
                Ok(Err(e)) => warn!(task = %name, error = %e, "task ended abnormally"),
                Err(_) => {
                    warn!(task = %name, "task did not stop before the shutdown timeout, aborting");
                    abort.abort();
                }
            }
        }
        info!("subsystems stopped");
    }
}
