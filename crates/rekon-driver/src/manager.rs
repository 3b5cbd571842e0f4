//! Driver manager: binds a driver to the bus and runs its dispatch loop.
//!
//! Each driver gets one durable consumer on the `messages` stream, named
//! after the driver and filtered to `resources.<type>` for its resource
//! types. `max_ack_pending = 1` serialises deliveries, so reconcile calls
//! of one driver never overlap. Outcomes go to the engine on
//! `pipelines.driver.result`.

use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use rekon_bus::{Bus, Consumer, ConsumerConfig, Message, Publisher};
use rekon_core::config::{AckMode, BusConfig};
use rekon_core::subject::{DRIVER_RESULT_SUBJECT, MESSAGES_STREAM, resource_type_of};
use rekon_core::{DriverMessage, DriverResultEvent, PipelineEvent};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::driver::{Driver, DriverResult};
use crate::error::DriverError;
use crate::logger::{DriverLogger, LogSink, TracingSink};

/// Delivery settings shared by every driver the daemon hosts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ManagerConfig {
    pub ack_mode: AckMode,
    pub ack_wait: Duration,
    /// Deliveries before a message is given up on; 0 is unbounded.
    pub max_deliver: u32,
}

impl Default for ManagerConfig {
    fn default() -> Self {
        Self::from(&BusConfig::default())
    }
}

impl From<&BusConfig> for ManagerConfig {
    fn from(bus: &BusConfig) -> Self {
        Self {
            ack_mode: bus.ack_mode,
            ack_wait: Duration::from_millis(bus.ack_wait_ms),
            max_deliver: bus.max_deliver,
        }
    }
}

/// Owns one driver's subscription and dispatch loop.
pub struct DriverManager {
    driver: Driver,
    bus: Bus,
    publisher: Arc<dyn Publisher>,
    log_sink: Arc<dyn LogSink>,
    config: ManagerConfig,
}

impl DriverManager {
    /// Results are published on `bus` and log lines go to `tracing` unless
    /// overridden.
    pub fn new(driver: Driver, bus: Bus) -> Self {
        Self {
            driver,
            publisher: Arc::new(bus.clone()),
            bus,
            log_sink: Arc::new(TracingSink),
            config: ManagerConfig::default(),
        }
    }

    pub fn with_publisher(mut self, publisher: Arc<dyn Publisher>) -> Self {
        self.publisher = publisher;
        self
    }

    pub fn with_log_sink(mut self, sink: Arc<dyn LogSink>) -> Self {
        self.log_sink = sink;
        self
    }

    pub fn with_config(mut self, config: ManagerConfig) -> Self {
        self.config = config;
        self
    }

    pub fn driver(&self) -> &Driver {
        &self.driver
    }

    /// Validate the driver and create (or re-bind) its durable consumer.
    pub fn bind(&self) -> Result<Consumer, DriverError> {
        self.driver.validate()?;
        let config = ConsumerConfig::durable(&self.driver.name)
            .with_filters(self.driver.filter_subjects())
            .with_max_ack_pending(1)
            .with_ack_wait(self.config.ack_wait)
            .with_max_deliver(self.config.max_deliver);
        let consumer = self.bus.create_or_update_consumer(MESSAGES_STREAM, config)?;
        info!(
            driver = %self.driver.name,
            resources = ?self.driver.resources,
            events = ?self.driver.events,
            "driver bound"
        );
        Ok(consumer)
    }

    /// Bind, then run the dispatch loop on a background task until
    /// `shutdown` flips or the bus closes. The consumer exists once this
    /// returns, so messages published afterwards reach the driver.
    pub fn start(self, shutdown: watch::Receiver<bool>) -> Result<JoinHandle<()>, DriverError> {
        let consumer = self.bind()?;
        Ok(tokio::spawn(async move {
            self.run(consumer, shutdown).await;
        }))
    }

    async fn run(self, consumer: Consumer, mut shutdown: watch::Receiver<bool>) {
        let name = self.driver.name.clone();
        debug!(driver = %name, "dispatch loop starting");

        loop {
            if *shutdown.borrow() {
                break;
            }
            tokio::select! {
                msg = consumer.next() => match msg {
                    Some(msg) => self.dispatch(msg).await,
                    None => break,
                },
                changed = shutdown.changed() => {
                    if changed.is_err() {
                        break;
                    }
                }
            }
        }

        debug!(driver = %name, "dispatch loop stopped");
    }

    async fn dispatch(&self, msg: Message) {
        let driver = &self.driver.name;

        let Some(resource_type) = resource_type_of(&msg.subject).map(str::to_string) else {
            warn!(%driver, subject = %msg.subject, "message outside resources.*, terminating");
            settle(&msg, Settlement::Term);
            return;
        };

        let envelope = match DriverMessage::from_bytes(&msg.payload) {
            Ok(envelope) => envelope,
            Err(e) => {
                warn!(%driver, subject = %msg.subject, seq = msg.seq, error = %e, "malformed driver message, terminating");
                settle(&msg, Settlement::Term);
                return;
            }
        };

        if !self.driver.accepts(&envelope.event) {
            debug!(%driver, event = %envelope.event, run_id = %envelope.run_id, "event filtered out");
            settle(&msg, Settlement::Ack);
            return;
        }

        if self.config.ack_mode == AckMode::BeforeReconcile {
            settle(&msg, Settlement::Ack);
        }

        debug!(
            %driver,
            resource = %resource_type,
            event = %envelope.event,
            run_id = %envelope.run_id,
            redelivery = msg.is_redelivery(),
            "reconciling"
        );

        // Run reconcile on its own task so a panic is contained.
        let reconciler = self.driver.reconciler.clone();
        let logger = DriverLogger::new(
            self.log_sink.clone(),
            driver,
            &envelope.run_id,
            &envelope.event,
        );
        let payload = envelope.payload.clone();
        let event = envelope.event.clone();
        let run_id = envelope.run_id.clone();
        let outcome = tokio::spawn(async move {
            reconciler.reconcile(&payload, &event, &run_id, &logger).await
        })
        .await;

        let mut settled = self.config.ack_mode == AckMode::BeforeReconcile;
        let result = match outcome {
            Ok(result) => result,
            Err(e) => {
                error!(%driver, run_id = %envelope.run_id, error = %e, "reconcile panicked");
                let last_attempt = self.config.max_deliver > 0
                    && msg.deliveries >= self.config.max_deliver;
                if self.config.ack_mode == AckMode::AfterReconcile && !last_attempt {
                    if self.config.max_deliver > 0 {
                        settle(&msg, Settlement::Nak);
                    } else {
                        // Unbounded retries wait out ack_wait instead of a nak.
                        debug!(%driver, run_id = %envelope.run_id, ack_wait = ?self.config.ack_wait, "leaving message for redelivery");
                    }
                    return;
                }
                if !settled {
                    settle(&msg, Settlement::Term);
                    settled = true;
                }
                DriverResult::failed(format!("reconcile panicked: {e}"))
            }
        };

        if result.success {
            info!(%driver, run_id = %envelope.run_id, message = %result.message, "reconcile succeeded");
        } else {
            warn!(%driver, run_id = %envelope.run_id, message = %result.message, "reconcile failed");
        }

        self.publish_result(&envelope, &resource_type, &result).await;

        if !settled {
            settle(&msg, Settlement::Ack);
        }
    }

    async fn publish_result(&self, envelope: &DriverMessage, resource_type: &str, result: &DriverResult) {
        let event = PipelineEvent::driver_result(DriverResultEvent {
            success: result.success,
            message: result.message.clone(),
            driver: self.driver.name.clone(),
            run_id: envelope.run_id.clone(),
            resource: resource_type.to_string(),
        });
        let body = match event.to_bytes() {
            Ok(body) => body,
            Err(e) => {
                error!(driver = %self.driver.name, run_id = %envelope.run_id, error = %e, "failed to encode driver result");
                return;
            }
        };
        if let Err(e) = self
            .publisher
            .publish(DRIVER_RESULT_SUBJECT, Bytes::from(body))
            .await
        {
            error!(driver = %self.driver.name, run_id = %envelope.run_id, error = %e, "failed to publish driver result");
        }
    }
}

#[derive(Debug, Clone, Copy)]
enum Settlement {
    Ack,
    Nak,
    Term,
}

fn settle(msg: &Message, how: Settlement) {
    let result = match how {
        Settlement::Ack => msg.ack(),
        Settlement::Nak => msg.nak(),
        Settlement::Term => msg.term(),
    };
    if let Err(e) = result {
        warn!(subject = %msg.subject, seq = msg.seq, ?how, error = %e, "failed to settle message");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use std::sync::Mutex;
    use std::sync::atomic::{AtomicU32, Ordering};

    use async_trait::async_trait;
    use rekon_bus::RecordingPublisher;
    use rekon_bus::topology::provision;
    use rekon_core::subject::resource_subject;
    use rekon_core::{EVENT_CREATE, EVENT_UPDATE, PIPELINE_DRIVER_RESULT};
    use tokio::sync::mpsc;
    use tokio::time::{Instant, timeout};

    use crate::driver::Reconciler;
    use crate::logger::MemorySink;

    #[derive(Debug, Clone)]
    struct Call {
        event: String,
        run_id: String,
        payload: String,
        started: Instant,
        finished: Instant,
    }

    /// Records every call and reports it on a channel.
    struct RecordingReconciler {
        calls: Mutex<Vec<Call>>,
        done: mpsc::UnboundedSender<Call>,
        work: Duration,
        succeed: bool,
    }

    impl RecordingReconciler {
        fn new(work: Duration, succeed: bool) -> (Arc<Self>, mpsc::UnboundedReceiver<Call>) {
            let (tx, rx) = mpsc::unbounded_channel();
            let reconciler = Arc::new(Self {
                calls: Mutex::new(Vec::new()),
                done: tx,
                work,
                succeed,
            });
            (reconciler, rx)
        }
    }

    #[async_trait]
    impl Reconciler for RecordingReconciler {
        async fn reconcile(
            &self,
            payload: &str,
            event: &str,
            run_id: &str,
            logger: &DriverLogger,
        ) -> DriverResult {
            let started = Instant::now();
            let _ = logger.log(&[], "reconciling").await;
            tokio::time::sleep(self.work).await;
            let call = Call {
                event: event.to_string(),
                run_id: run_id.to_string(),
                payload: payload.to_string(),
                started,
                finished: Instant::now(),
            };
            self.calls.lock().unwrap().push(call.clone());
            let _ = self.done.send(call);
            if self.succeed {
                DriverResult::ok("done")
            } else {
                DriverResult::failed("boom")
            }
        }
    }

    struct Panicking;

    #[async_trait]
    impl Reconciler for Panicking {
        async fn reconcile(&self, _: &str, _: &str, _: &str, _: &DriverLogger) -> DriverResult {
            panic!("reconciler bug");
        }
    }

    /// Panics on every call, counting them.
    #[derive(Default)]
    struct CountingPanic {
        calls: AtomicU32,
    }

    #[async_trait]
    impl Reconciler for CountingPanic {
        async fn reconcile(&self, _: &str, _: &str, _: &str, _: &DriverLogger) -> DriverResult {
            self.calls.fetch_add(1, Ordering::SeqCst);
            panic!("reconciler bug");
        }
    }

    async fn wait_for_results(publisher: &RecordingPublisher) -> Vec<(String, Bytes)> {
        for _ in 0..40 {
            let published = publisher.published();
            if !published.is_empty() {
                return published;
            }
            tokio::time::sleep(Duration::from_millis(25)).await;
        }
        publisher.published()
    }

    fn bus() -> Bus {
        let bus = Bus::new();
        provision(&bus, 100).unwrap();
        bus
    }

    fn publish(bus: &Bus, resource_type: &str, event: &str, run_id: &str) {
        let msg = DriverMessage::new(event, format!(r#"{{"name":"{run_id}"}}"#), run_id);
        bus.publish(&resource_subject(resource_type), msg.to_bytes().unwrap())
            .unwrap();
    }

    async fn recv(rx: &mut mpsc::UnboundedReceiver<Call>) -> Call {
        timeout(Duration::from_secs(2), rx.recv())
            .await
            .expect("reconcile call")
            .expect("channel open")
    }

    #[tokio::test]
    async fn reconciles_and_publishes_result() {
        let bus = bus();
        let (reconciler, mut rx) = RecordingReconciler::new(Duration::ZERO, true);
        let publisher = RecordingPublisher::new();
        let sink = MemorySink::new();
        let (_tx, shutdown) = watch::channel(false);

        let handle = DriverManager::new(Driver::new("docker", ["pipe"], reconciler), bus.clone())
            .with_publisher(Arc::new(publisher.clone()))
            .with_log_sink(Arc::new(sink.clone()))
            .start(shutdown)
            .unwrap();

        publish(&bus, "pipe", EVENT_CREATE, "run-1");
        let call = recv(&mut rx).await;
        assert_eq!(call.event, "create");
        assert_eq!(call.run_id, "run-1");
        assert_eq!(call.payload, r#"{"name":"run-1"}"#);

        // The result is published before the ack.
        tokio::time::sleep(Duration::from_millis(50)).await;
        let published = publisher.published();
        assert_eq!(published.len(), 1);
        assert_eq!(published[0].0, DRIVER_RESULT_SUBJECT);
        let event = PipelineEvent::from_bytes(&published[0].1).unwrap();
        assert_eq!(event.event, PIPELINE_DRIVER_RESULT);
        let result = event.result.unwrap();
        assert!(result.success);
        assert_eq!(result.driver, "docker");
        assert_eq!(result.resource, "pipe");
        assert_eq!(result.run_id, "run-1");

        assert_eq!(sink.lines()[0].labels["driver"], "docker");
        assert_eq!(bus.consumer_info("messages", "docker").unwrap().num_ack_pending, 0);

        bus.close();
        handle.await.unwrap();
    }

    #[tokio::test]
    async fn wildcard_driver_sees_every_event_create_driver_only_creates() {
        let bus = bus();
        let (all, mut all_rx) = RecordingReconciler::new(Duration::ZERO, true);
        let (creates, mut creates_rx) = RecordingReconciler::new(Duration::ZERO, true);
        let (_tx, shutdown) = watch::channel(false);

        DriverManager::new(Driver::new("audit", ["pipe"], all), bus.clone())
            .with_publisher(Arc::new(RecordingPublisher::new()))
            .start(shutdown.clone())
            .unwrap();
        DriverManager::new(
            Driver::new("creator", ["pipe"], creates).with_events([EVENT_CREATE]),
            bus.clone(),
        )
        .with_publisher(Arc::new(RecordingPublisher::new()))
        .start(shutdown)
        .unwrap();

        publish(&bus, "pipe", EVENT_UPDATE, "run-1");
        publish(&bus, "pipe", EVENT_CREATE, "run-2");

        assert_eq!(recv(&mut all_rx).await.event, "update");
        assert_eq!(recv(&mut all_rx).await.event, "create");

        // The update was acked and dropped, so the create gets through.
        let only = recv(&mut creates_rx).await;
        assert_eq!(only.event, "create");
        assert_eq!(only.run_id, "run-2");
        assert!(
            timeout(Duration::from_millis(50), creates_rx.recv())
                .await
                .is_err()
        );
        bus.close();
    }

    #[tokio::test]
    async fn reconcile_calls_never_overlap() {
        let bus = bus();
        let (reconciler, mut rx) = RecordingReconciler::new(Duration::from_millis(15), true);
        let (_tx, shutdown) = watch::channel(false);

        DriverManager::new(Driver::new("serial", ["pipe"], reconciler), bus.clone())
            .with_publisher(Arc::new(RecordingPublisher::new()))
            .start(shutdown)
            .unwrap();

        let publishers: Vec<_> = (0..5)
            .map(|i| {
                let bus = bus.clone();
                tokio::spawn(async move { publish(&bus, "pipe", EVENT_CREATE, &format!("run-{i}")) })
            })
            .collect();
        for p in publishers {
            p.await.unwrap();
        }

        let mut calls = Vec::new();
        for _ in 0..5 {
            calls.push(recv(&mut rx).await);
        }
        calls.sort_by_key(|c| c.started);
        for pair in calls.windows(2) {
            assert!(
                pair[0].finished <= pair[1].started,
                "reconcile calls overlapped: {pair:?}"
            );
        }
        bus.close();
    }

    #[tokio::test]
    async fn failed_reconcile_is_reported_and_acked() {
        let bus = bus();
        let (reconciler, mut rx) = RecordingReconciler::new(Duration::ZERO, false);
        let publisher = RecordingPublisher::new();
        let (_tx, shutdown) = watch::channel(false);

        DriverManager::new(Driver::new("docker", ["pipe"], reconciler), bus.clone())
            .with_publisher(Arc::new(publisher.clone()))
            .start(shutdown)
            .unwrap();

        publish(&bus, "pipe", EVENT_CREATE, "run-1");
        recv(&mut rx).await;
        tokio::time::sleep(Duration::from_millis(50)).await;

        let event = PipelineEvent::from_bytes(&publisher.published()[0].1).unwrap();
        assert!(!event.result.unwrap().success);
        assert!(
            timeout(Duration::from_millis(50), rx.recv()).await.is_err(),
            "failure must not be redelivered"
        );
        bus.close();
    }

    #[tokio::test]
    async fn malformed_message_is_terminated() {
        let bus = bus();
        let (reconciler, mut rx) = RecordingReconciler::new(Duration::ZERO, true);
        let (_tx, shutdown) = watch::channel(false);

        DriverManager::new(Driver::new("docker", ["pipe"], reconciler), bus.clone())
            .with_publisher(Arc::new(RecordingPublisher::new()))
            .start(shutdown)
            .unwrap();

        bus.publish("resources.pipe", "not json").unwrap();
        publish(&bus, "pipe", EVENT_CREATE, "run-2");

        assert_eq!(recv(&mut rx).await.run_id, "run-2");
        bus.close();
    }

    #[tokio::test]
    async fn panicking_reconciler_is_retried_then_reported() {
        let bus = bus();
        let publisher = RecordingPublisher::new();
        let (_tx, shutdown) = watch::channel(false);

        DriverManager::new(Driver::new("buggy", ["pipe"], Arc::new(Panicking)), bus.clone())
            .with_publisher(Arc::new(publisher.clone()))
            .with_config(ManagerConfig {
                ack_mode: AckMode::AfterReconcile,
                ack_wait: Duration::from_secs(5),
                max_deliver: 2,
            })
            .start(shutdown)
            .unwrap();

        publish(&bus, "pipe", EVENT_CREATE, "run-1");

        let published = wait_for_results(&publisher).await;
        assert_eq!(published.len(), 1);
        let result = PipelineEvent::from_bytes(&published[0].1)
            .unwrap()
            .result
            .unwrap();
        assert!(!result.success);
        assert!(result.message.contains("panicked"));
        assert_eq!(bus.stream_info("messages").unwrap().messages, 0);
        bus.close();
    }

    #[tokio::test]
    async fn unbounded_panics_wait_for_ack_wait_between_attempts() {
        let bus = bus();
        let reconciler = Arc::new(CountingPanic::default());
        let publisher = RecordingPublisher::new();
        let (_tx, shutdown) = watch::channel(false);

        DriverManager::new(Driver::new("buggy", ["pipe"], reconciler.clone()), bus.clone())
            .with_publisher(Arc::new(publisher.clone()))
            .with_config(ManagerConfig {
                ack_mode: AckMode::AfterReconcile,
                ack_wait: Duration::from_millis(100),
                max_deliver: 0,
            })
            .start(shutdown)
            .unwrap();

        publish(&bus, "pipe", EVENT_CREATE, "run-1");
        tokio::time::sleep(Duration::from_millis(250)).await;

        let calls = reconciler.calls.load(Ordering::SeqCst);
        assert!((1..=3).contains(&calls), "reconcile called {calls} times");
        assert!(publisher.published().is_empty());
        assert_eq!(bus.stream_info("messages").unwrap().messages, 1);
        bus.close();
    }

    #[tokio::test]
    async fn before_reconcile_acks_on_receipt_and_never_retries() {
        let bus = bus();
        let (reconciler, mut rx) = RecordingReconciler::new(Duration::from_millis(200), false);
        let publisher = RecordingPublisher::new();
        let (_tx, shutdown) = watch::channel(false);

        DriverManager::new(Driver::new("docker", ["pipe"], reconciler), bus.clone())
            .with_publisher(Arc::new(publisher.clone()))
            .with_config(ManagerConfig {
                ack_mode: AckMode::BeforeReconcile,
                ack_wait: Duration::from_millis(50),
                max_deliver: 0,
            })
            .start(shutdown)
            .unwrap();

        publish(&bus, "pipe", EVENT_CREATE, "run-1");
        tokio::time::sleep(Duration::from_millis(80)).await;

        // Still reconciling, but nothing is awaiting an ack.
        assert!(publisher.published().is_empty());
        let info = bus.consumer_info("messages", "docker").unwrap();
        assert_eq!(info.num_ack_pending, 0);
        assert_eq!(info.num_redelivered, 0);
        assert_eq!(bus.stream_info("messages").unwrap().messages, 0);

        let call = recv(&mut rx).await;
        assert_eq!(call.run_id, "run-1");
        let published = wait_for_results(&publisher).await;
        assert!(!PipelineEvent::from_bytes(&published[0].1).unwrap().result.unwrap().success);
        assert!(
            timeout(Duration::from_millis(300), rx.recv()).await.is_err(),
            "failure must not be redelivered"
        );
        bus.close();
    }

    #[tokio::test]
    async fn before_reconcile_panic_is_reported_once() {
        let bus = bus();
        let reconciler = Arc::new(CountingPanic::default());
        let publisher = RecordingPublisher::new();
        let (_tx, shutdown) = watch::channel(false);

        DriverManager::new(Driver::new("buggy", ["pipe"], reconciler.clone()), bus.clone())
            .with_publisher(Arc::new(publisher.clone()))
            .with_config(ManagerConfig {
                ack_mode: AckMode::BeforeReconcile,
                ack_wait: Duration::from_millis(50),
                max_deliver: 0,
            })
            .start(shutdown)
            .unwrap();

        publish(&bus, "pipe", EVENT_CREATE, "run-1");
        let published = wait_for_results(&publisher).await;
        assert_eq!(published.len(), 1);
        let result = PipelineEvent::from_bytes(&published[0].1)
            .unwrap()
            .result
            .unwrap();
        assert!(result.message.contains("panicked"));

        tokio::time::sleep(Duration::from_millis(200)).await;
        assert_eq!(reconciler.calls.load(Ordering::SeqCst), 1);
        assert_eq!(publisher.published().len(), 1);
        bus.close();
    }

    #[tokio::test]
    async fn shutdown_stops_the_loop() {
        let bus = bus();
        let (reconciler, _rx) = RecordingReconciler::new(Duration::ZERO, true);
        let (tx, shutdown) = watch::channel(false);

        let handle = DriverManager::new(Driver::new("docker", ["pipe"], reconciler), bus.clone())
            .start(shutdown)
            .unwrap();
        tx.send(true).unwrap();
        timeout(Duration::from_secs(1), handle).await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn invalid_driver_is_not_bound() {
        let bus = bus();
        let (reconciler, _rx) = RecordingReconciler::new(Duration::ZERO, true);
        let (_tx, shutdown) = watch::channel(false);

        let err = DriverManager::new(Driver::new("", ["pipe"], reconciler), bus.clone())
            .start(shutdown)
            .unwrap_err();
        assert!(matches!(err, DriverError::Validation(_)));
        assert!(bus.stream_info("messages").unwrap().consumers.is_empty());
    }
}
