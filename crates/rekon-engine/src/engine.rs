//! The engine: correlates pipeline events into persisted runs.
//!
//! Consumes the `pipeline-engine` work queue. `run.started` opens a run
//! for every pipeline bound to the resource type; `driver.result` settles
//! the matching step of each of those runs, opening the run first if the
//! result overtook its `run.started`. Runs that reach a terminal state are
//! announced on `events.runs.<pipeline>`.
//!
//! When the engine knows the event filters of the drivers it runs beside,
//! steps whose driver ignores the resource event are skipped at open, and
//! a change that no step handles opens no run.

use std::collections::BTreeMap;
use std::sync::Arc;

use bytes::Bytes;
use rekon_bus::{Bus, ConsumerConfig, Message, Publisher};
use rekon_core::subject::{PIPELINE_ENGINE_STREAM, run_event_subject};
use rekon_core::{
    PIPELINE_DRIVER_RESULT, PIPELINE_RUN_COMPLETED, PIPELINE_RUN_FAILED, PIPELINE_RUN_STARTED,
    PipelineEvent, PipelineRun, RunStatus, event_filter_accepts, unix_now,
};
use rekon_state::{StateResult, StateStore};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::error::{EngineError, EngineResult};
use crate::progress::{apply_result, complete_if_done, skip_unhandled};

/// Durable name of the engine's work-queue consumer.
pub const ENGINE_CONSUMER: &str = "pipeline-engine";

/// Deliveries of one pipeline event before the engine gives up on it.
pub const ENGINE_MAX_DELIVER: u32 = 10;

/// Event filters of the drivers hosted next to the engine, by driver name.
#[derive(Debug, Clone, Default)]
pub struct DriverEvents(BTreeMap<String, Vec<String>>);

impl DriverEvents {
    /// Will `driver` reconcile `change`? Unknown drivers, and runs whose
    /// change is not known, are assumed to be handled.
    pub fn handles(&self, driver: &str, change: &str) -> bool {
        if change.is_empty() {
            return true;
        }
        self.0
            .get(driver)
            .is_none_or(|filter| event_filter_accepts(filter, change))
    }
}

impl FromIterator<(String, Vec<String>)> for DriverEvents {
    fn from_iter<I: IntoIterator<Item = (String, Vec<String>)>>(iter: I) -> Self {
        Self(iter.into_iter().collect())
    }
}

/// Correlates pipeline events into pipeline runs.
#[derive(Clone)]
pub struct Engine {
    store: StateStore,
    publisher: Arc<dyn Publisher>,
    driver_events: Arc<DriverEvents>,
}

impl Engine {
    pub fn new(store: StateStore, publisher: Arc<dyn Publisher>) -> Self {
        Self {
            store,
            publisher,
            driver_events: Arc::new(DriverEvents::default()),
        }
    }

    pub fn with_driver_events(mut self, events: DriverEvents) -> Self {
        self.driver_events = Arc::new(events);
        self
    }

    /// Apply one event. Returns the runs it changed.
    pub async fn handle(&self, event: PipelineEvent) -> EngineResult<Vec<PipelineRun>> {
        let changed = match event.event.as_str() {
            PIPELINE_RUN_STARTED => {
                let drivers = self.driver_events.clone();
                self.store
                    .call(move |store| open_runs(store, &event, &drivers))
                    .await?
            }
            PIPELINE_DRIVER_RESULT => {
                if event.result.is_none() {
                    return Err(EngineError::Malformed(format!(
                        "driver.result for run {} carries no result",
                        event.run_id
                    )));
                }
                self.store
                    .call(move |store| record_result(store, &event))
                    .await?
            }
            other => {
                debug!(event = %other, "ignoring pipeline event");
                return Ok(Vec::new());
            }
        };

        for run in changed.iter().filter(|r| r.is_terminal()) {
            self.announce(run).await;
        }
        Ok(changed)
    }

    async fn announce(&self, run: &PipelineRun) {
        let tag = match run.status {
            RunStatus::Completed => PIPELINE_RUN_COMPLETED,
            RunStatus::Failed => PIPELINE_RUN_FAILED,
            RunStatus::Running => return,
        };
        let event = PipelineEvent {
            event: tag.to_string(),
            run_id: run.run_id.clone(),
            resource: run.resource_type.clone(),
            name: run.resource_name.clone(),
            change: String::new(),
            result: None,
        };
        let subject = run_event_subject(&run.pipeline);
        let body = match event.to_bytes() {
            Ok(body) => Bytes::from(body),
            Err(e) => {
                error!(run_id = %run.run_id, error = %e, "failed to encode run event");
                return;
            }
        };
        if let Err(e) = self.publisher.publish(&subject, body).await {
            warn!(run_id = %run.run_id, %subject, error = %e, "failed to announce run outcome");
        }
    }

    /// Bind the work-queue consumer and process events on a background
    /// task until `shutdown` flips or the bus closes.
    pub fn start(self, bus: &Bus, mut shutdown: watch::Receiver<bool>) -> EngineResult<JoinHandle<()>> {
        let consumer = bus.create_or_update_consumer(
            PIPELINE_ENGINE_STREAM,
            ConsumerConfig::durable(ENGINE_CONSUMER).with_max_deliver(ENGINE_MAX_DELIVER),
        )?;
        info!("pipeline engine started");

        Ok(tokio::spawn(async move {
            loop {
                if *shutdown.borrow() {
                    break;
                }
                tokio::select! {
                    msg = consumer.next() => match msg {
                        Some(msg) => self.process(msg).await,
                        None => break,
                    },
                    changed = shutdown.changed() => {
                        if changed.is_err() {
                            break;
                        }
                    }
                }
            }
            debug!("pipeline engine stopped");
        }))
    }

    async fn process(&self, msg: Message) {
        let (run_id, settled) = match PipelineEvent::from_bytes(&msg.payload) {
            Ok(event) => {
                let run_id = event.run_id.clone();
                let settled = match self.handle(event).await {
                    Ok(changed) => {
                        debug!(%run_id, changed = changed.len(), "pipeline event applied");
                        msg.ack()
                    }
                    Err(e) if e.is_retryable() && msg.deliveries < ENGINE_MAX_DELIVER => {
                        warn!(%run_id, deliveries = msg.deliveries, error = %e, "pipeline event deferred");
                        msg.nak()
                    }
                    Err(e) => {
                        error!(%run_id, deliveries = msg.deliveries, error = %e, "pipeline event rejected");
                        msg.term()
                    }
                };
                (run_id, settled)
            }
            Err(e) => {
                warn!(subject = %msg.subject, seq = msg.seq, error = %e, "malformed pipeline event, terminating");
                (String::new(), msg.term())
            }
        };
        if let Err(e) = settled {
            warn!(%run_id, seq = msg.seq, error = %e, "failed to settle pipeline event");
        }
    }
}

/// Open a run per bound pipeline. Runs already opened by an early
/// driver result only learn the resource name and skip steps that will
/// never report.
fn open_runs(
    store: &StateStore,
    event: &PipelineEvent,
    drivers: &DriverEvents,
) -> StateResult<Vec<PipelineRun>> {
    let now = unix_now();
    let handles = |driver: &str| drivers.handles(driver, &event.change);
    let mut changed = Vec::new();
    for pipeline in store.pipelines_for_resource(&event.resource)? {
        match store.find_run(&event.run_id, &pipeline.name)? {
            Some(mut run) => {
                let mut dirty = false;
                if run.resource_name.is_empty() && !event.name.is_empty() {
                    run.resource_name = event.name.clone();
                    dirty = true;
                }
                if skip_unhandled(&mut run, &event.change, &handles) > 0 {
                    complete_if_done(&mut run);
                    dirty = true;
                }
                if dirty {
                    run.updated_at = now;
                    store.put_run(&run)?;
                    changed.push(run);
                }
            }
            None => {
                let mut run = PipelineRun::open(&event.run_id, &pipeline, &event.name, now);
                let skipped = skip_unhandled(&mut run, &event.change, &handles);
                if skipped > 0 && skipped == run.steps.len() {
                    debug!(run_id = %run.run_id, pipeline = %run.pipeline, change = %event.change, "no step handles the change, no run opened");
                    continue;
                }
                complete_if_done(&mut run);
                store.put_run(&run)?;
                info!(run_id = %run.run_id, pipeline = %run.pipeline, steps = run.steps.len(), "pipeline run opened");
                changed.push(run);
            }
        }
    }
    Ok(changed)
}

fn record_result(store: &StateStore, event: &PipelineEvent) -> StateResult<Vec<PipelineRun>> {
    let Some(result) = event.result.as_ref() else {
        return Ok(Vec::new());
    };
    let now = unix_now();
    let mut changed = Vec::new();

    for pipeline in store.pipelines_for_resource(&result.resource)? {
        if pipeline.step_for_driver(&result.driver).is_none() {
            continue;
        }
        let mut run = match store.find_run(&result.run_id, &pipeline.name)? {
            Some(run) => run,
            None => {
                debug!(run_id = %result.run_id, pipeline = %pipeline.name, "opening run from driver result");
                PipelineRun::open(&result.run_id, &pipeline, &event.name, now)
            }
        };
        let transition = apply_result(&mut run, &result.driver, result.success, &result.message, now);
        if transition.changed() {
            store.put_run(&run)?;
            changed.push(run);
        }
    }
    Ok(changed)
}
