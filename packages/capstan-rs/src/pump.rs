//! The message pump: a long-running broker-facing consumer loop.
//!
//! Each pump exclusively owns one channel and processes it strictly
//! sequentially: receive → unwrap → dispatch → ack form a happens-before
//! chain, so per-channel receive order is preserved up to the handler
//! dispatch point. Run many pumps for parallelism; there is no ordering
//! across channels.
//!
//! # Per-iteration state machine
//!
//! - unacceptable-message limit reached → dispose channel, exit
//! - channel failure → sleep `channel_failure_delay`, continue (a `Closed`
//!   failure disposes and exits instead)
//! - `None` message → sleep `empty_channel_delay`, continue
//! - `Unacceptable` → count it, ack, continue
//! - `Quit` → dispose channel, exit
//! - `Command` → unwrap, send; `Event`/`Document` → unwrap, publish
//!
//! Dispatch failures classify as: configuration → reject, dispose, exit;
//! defer → requeue or drop; mapping → count unacceptable, ack; anything
//! else → log, ack. Aggregate errors classify by their inners in the same
//! priority order.
//!
//! # Variants
//!
//! [`Proactor`] runs the pump as a cooperative tokio task and accepts a
//! cancellation token. [`Reactor`] dedicates one OS thread per pump,
//! driving the same loop on a single-threaded runtime; it terminates via
//! the `Quit` sentinel rather than structured cancellation.

use std::any::TypeId;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::channel::Channel;
use crate::error::{CapstanError, ChannelFailureKind};
use crate::message::{Message, MessageType};
use crate::processor::CommandProcessor;
use crate::request::Request;

/// Tuning for one pump.
#[derive(Debug, Clone)]
pub struct PumpConfig {
    /// How long a single channel receive waits.
    pub receive_timeout: Duration,
    /// Sleep after an empty-channel receive.
    pub empty_channel_delay: Duration,
    /// Sleep after a channel failure before retrying.
    pub channel_failure_delay: Duration,
    /// Unacceptable messages tolerated before the pump exits. Zero means
    /// no limit.
    pub unacceptable_limit: usize,
    /// Deliveries after which a deferred message is no longer requeued.
    /// Zero means unlimited requeues.
    pub requeue_limit: u32,
    /// Default redelivery delay when a defer does not carry one.
    pub requeue_delay: Option<Duration>,
    /// Reject (drop or dead-letter) messages that exhaust the requeue
    /// limit.
    pub discard_on_overflow: bool,
}

impl Default for PumpConfig {
    fn default() -> Self {
        Self {
            receive_timeout: Duration::from_millis(500),
            empty_channel_delay: Duration::from_millis(100),
            channel_failure_delay: Duration::from_millis(1000),
            unacceptable_limit: 0,
            requeue_limit: 0,
            requeue_delay: None,
            discard_on_overflow: true,
        }
    }
}

/// Why a pump's run loop ended. Carried in the final log span.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PumpExit {
    /// A `Quit` sentinel arrived.
    Quit,
    /// The cancellation token fired.
    Cancelled,
    /// Too many unacceptable messages.
    UnacceptableLimit,
}

enum Step {
    Continue,
    Exit(PumpExit),
    Fatal(anyhow::Error),
}

/// A single-channel consumer loop dispatching into a [`CommandProcessor`].
pub struct MessagePump {
    processor: Arc<CommandProcessor>,
    channel: Box<dyn Channel>,
    request_type: TypeId,
    request_type_name: &'static str,
    config: PumpConfig,
    unacceptable_count: usize,
}

impl MessagePump {
    /// A pump translating messages into requests of type `R`.
    pub fn new<R: Request>(
        processor: Arc<CommandProcessor>,
        channel: Box<dyn Channel>,
        config: PumpConfig,
    ) -> Self {
        Self {
            processor,
            channel,
            request_type: TypeId::of::<R>(),
            request_type_name: std::any::type_name::<R>(),
            config,
            unacceptable_count: 0,
        }
    }

    /// Drive the loop until quit, cancellation, the unacceptable limit or
    /// a fatal error. The channel is disposed on every exit path.
    pub async fn run(mut self, shutdown: CancellationToken) -> Result<()> {
        info!(
            channel = self.channel.name(),
            request_type = self.request_type_name,
            "message pump starting"
        );

        let outcome = loop {
            if self.config.unacceptable_limit > 0
                && self.unacceptable_count >= self.config.unacceptable_limit
            {
                warn!(
                    channel = self.channel.name(),
                    count = self.unacceptable_count,
                    "unacceptable message limit reached"
                );
                break Ok(PumpExit::UnacceptableLimit);
            }

            let received = tokio::select! {
                _ = shutdown.cancelled() => break Ok(PumpExit::Cancelled),
                received = self.channel.receive(self.config.receive_timeout) => received,
            };

            let message = match received {
                Ok(message) => message,
                Err(e) => match self.classify_receive_failure(e).await {
                    Step::Continue => continue,
                    Step::Exit(exit) => break Ok(exit),
                    Step::Fatal(e) => break Err(e),
                },
            };

            match message.message_type() {
                MessageType::None => {
                    tokio::time::sleep(self.config.empty_channel_delay).await;
                }
                MessageType::Unacceptable => {
                    self.count_unacceptable(&message).await;
                }
                MessageType::Quit => break Ok(PumpExit::Quit),
                MessageType::Command | MessageType::Event | MessageType::Document => {
                    match self.process(message).await {
                        Step::Continue => {}
                        Step::Exit(exit) => break Ok(exit),
                        Step::Fatal(e) => break Err(e),
                    }
                }
            }
        };

        if let Err(e) = self.channel.dispose().await {
            warn!(channel = self.channel.name(), error = %e, "channel dispose failed");
        }

        // Final span: how this pump ended and what it absorbed.
        match &outcome {
            Ok(exit) => info!(
                channel = self.channel.name(),
                reason = ?exit,
                unacceptable = self.unacceptable_count,
                "message pump stopped"
            ),
            Err(e) => error!(
                channel = self.channel.name(),
                error = %e,
                unacceptable = self.unacceptable_count,
                "message pump stopped on fatal error"
            ),
        }

        outcome.map(|_| ())
    }

    async fn classify_receive_failure(&self, error: anyhow::Error) -> Step {
        match error.downcast_ref::<CapstanError>() {
            Some(CapstanError::ChannelFailure {
                kind: ChannelFailureKind::Closed,
                ..
            }) => {
                error!(channel = self.channel.name(), error = %error, "channel closed");
                return Step::Fatal(error);
            }
            Some(CapstanError::ChannelFailure { kind, .. }) => {
                debug!(channel = self.channel.name(), %kind, "channel failure, backing off");
            }
            _ => {
                warn!(channel = self.channel.name(), error = %error, "receive failed, backing off");
            }
        }
        tokio::time::sleep(self.config.channel_failure_delay).await;
        Step::Continue
    }

    async fn count_unacceptable(&mut self, message: &Message) {
        self.unacceptable_count += 1;
        debug!(
            channel = self.channel.name(),
            message_id = message.id(),
            count = self.unacceptable_count,
            "unacceptable message"
        );
        if let Err(e) = self.channel.acknowledge(message).await {
            warn!(message_id = message.id(), error = %e, "acknowledge failed");
        }
    }

    /// Unwrap and dispatch one message, applying the error taxonomy.
    async fn process(&mut self, message: Message) -> Step {
        let dispatched = self.unwrap_and_dispatch(&message).await;

        let error = match dispatched {
            Ok(()) => return self.ack(&message).await,
            Err(e) => e,
        };

        let Some(capstan) = error.downcast_ref::<CapstanError>() else {
            warn!(message_id = message.id(), error = %error, "handler failed, acknowledging");
            return self.ack(&message).await;
        };

        if capstan.any_matches(|e| matches!(e, CapstanError::Configuration { .. })) {
            error!(message_id = message.id(), error = %error, "configuration error, disposing pump");
            if let Err(e) = self.channel.reject(&message).await {
                warn!(message_id = message.id(), error = %e, "reject failed");
            }
            return Step::Fatal(error);
        }

        if let Some(delay) = capstan.find_defer() {
            return self.requeue_or_drop(&message, delay).await;
        }

        if capstan.any_matches(|e| matches!(e, CapstanError::MessageMapping { .. })) {
            self.count_unacceptable(&message).await;
            return Step::Continue;
        }

        warn!(message_id = message.id(), error = %error, "handler failed, acknowledging");
        self.ack(&message).await
    }

    async fn unwrap_and_dispatch(&self, message: &Message) -> Result<()> {
        let request = self.processor.unwrap_message(self.request_type, message)?;
        match message.message_type() {
            MessageType::Command => self.processor.send_dyn(request.as_ref()).await,
            MessageType::Event | MessageType::Document => {
                self.processor.publish_dyn(request.as_ref()).await
            }
            // Filtered out by the run loop.
            other => Err(CapstanError::mapping(format!("cannot dispatch {other:?}")).into()),
        }
    }

    async fn ack(&self, message: &Message) -> Step {
        if let Err(e) = self.channel.acknowledge(message).await {
            warn!(message_id = message.id(), error = %e, "acknowledge failed");
        }
        Step::Continue
    }

    /// Honour a defer: requeue with the requested (or configured) delay,
    /// or reject once the requeue budget is exhausted.
    async fn requeue_or_drop(&self, message: &Message, delay: Option<Duration>) -> Step {
        let exhausted = self.config.requeue_limit > 0
            && message.header.handled_count + 1 >= self.config.requeue_limit;

        if exhausted && self.config.discard_on_overflow {
            warn!(
                message_id = message.id(),
                handled_count = message.header.handled_count,
                "requeue limit reached, rejecting"
            );
            if let Err(e) = self.channel.reject(message).await {
                warn!(message_id = message.id(), error = %e, "reject failed");
            }
            return Step::Continue;
        }

        let delay = delay.or(self.config.requeue_delay);
        match self.channel.requeue(message, delay).await {
            Ok(true) => debug!(
                message_id = message.id(),
                handled_count = message.header.handled_count,
                "message requeued"
            ),
            Ok(false) => warn!(message_id = message.id(), "broker discarded requeue"),
            Err(e) => warn!(message_id = message.id(), error = %e, "requeue failed"),
        }
        Step::Continue
    }
}

impl std::fmt::Debug for MessagePump {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MessagePump")
            .field("channel", &self.channel.name())
            .field("request_type", &self.request_type_name)
            .finish_non_exhaustive()
    }
}

// =============================================================================
// Variants
// =============================================================================

/// Cooperative pump variant: one tokio task per pump.
pub struct Proactor;

impl Proactor {
    /// Spawn the pump as a background task.
    pub fn spawn(pump: MessagePump, shutdown: CancellationToken) -> JoinHandle<Result<()>> {
        tokio::spawn(pump.run(shutdown))
    }
}

/// Blocking pump variant: one OS thread per pump.
///
/// The thread drives the same loop on a current-thread runtime, so channel
/// and handler implementations stay uniform across variants. Termination
/// is via the `Quit` sentinel; there is no structured cancellation.
pub struct Reactor;

impl Reactor {
    /// Spawn the pump on a dedicated thread.
    pub fn spawn(pump: MessagePump) -> std::io::Result<std::thread::JoinHandle<Result<()>>> {
        std::thread::Builder::new()
            .name(format!("pump-{}", pump.channel.name()))
            .spawn(move || {
                let runtime = tokio::runtime::Builder::new_current_thread()
                    .enable_time()
                    .build()?;
                runtime.block_on(pump.run(CancellationToken::new()))
            })
    }
}

// =============================================================================
// Host
// =============================================================================

/// How a subscription's pump is scheduled.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PumpMode {
    /// One OS thread per pump; exits on the `Quit` sentinel.
    Reactor,
    /// One tokio task per pump; exits on `Quit` or cancellation.
    Proactor,
}

/// Runs one pump per subscription and joins them on shutdown.
///
/// Proactor pumps stop when [`shutdown`](Self::shutdown) cancels the shared
/// token. Reactor pumps only honour the `Quit` sentinel, so enqueue one on
/// their channels before shutting the host down.
pub struct PumpHost {
    processor: Arc<CommandProcessor>,
    shutdown: CancellationToken,
    tasks: Vec<JoinHandle<Result<()>>>,
    threads: Vec<std::thread::JoinHandle<Result<()>>>,
}

impl PumpHost {
    /// A host dispatching into the given processor.
    pub fn new(processor: Arc<CommandProcessor>) -> Self {
        Self {
            processor,
            shutdown: CancellationToken::new(),
            tasks: Vec::new(),
            threads: Vec::new(),
        }
    }

    /// Build and start a pump for requests of type `R` over the given
    /// channel.
    pub fn add<R: Request>(
        &mut self,
        channel: Box<dyn Channel>,
        mode: PumpMode,
        config: PumpConfig,
    ) -> Result<()> {
        let pump = MessagePump::new::<R>(self.processor.clone(), channel, config);
        match mode {
            PumpMode::Proactor => self
                .tasks
                .push(Proactor::spawn(pump, self.shutdown.child_token())),
            PumpMode::Reactor => self.threads.push(Reactor::spawn(pump)?),
        }
        Ok(())
    }

    /// The token proactor pumps watch.
    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    /// Number of running pumps.
    pub fn pump_count(&self) -> usize {
        self.tasks.len() + self.threads.len()
    }

    /// Cancel proactor pumps and join every pump.
    pub async fn shutdown(mut self) {
        self.shutdown.cancel();
        for task in self.tasks.drain(..) {
            if let Err(e) = task.await {
                warn!(error = %e, "pump task join failed");
            }
        }
        for thread in self.threads.drain(..) {
            let joined = tokio::task::spawn_blocking(move || thread.join()).await;
            if joined.is_err() || matches!(joined, Ok(Err(_))) {
                warn!("pump thread join failed");
            }
        }
        info!("pump host stopped");
    }
}

impl std::fmt::Debug for PumpHost {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PumpHost")
            .field("pump_count", &(self.tasks.len() + self.threads.len()))
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::handler::{DispatchContext, HandlerRegistration, RequestHandler};
    use crate::message::{MessageBody, MessageHeader};
    use crate::processor::CommandProcessorBuilder;
    use crate::request::{AnyRequest, RequestKind};
    use crate::testing::InMemoryChannel;
    use crate::transform::{MapperRegistration, MessageMapper};
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;

    #[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
    struct TaskAssigned {
        id: String,
    }

    impl Request for TaskAssigned {
        fn id(&self) -> &str {
            &self.id
        }

        fn request_kind(&self) -> RequestKind {
            RequestKind::Event
        }
    }

    struct TaskMapper;

    impl MessageMapper for TaskMapper {
        fn map_to_message(&self, request: &dyn AnyRequest) -> Result<Message> {
            let task = request
                .as_any()
                .downcast_ref::<TaskAssigned>()
                .ok_or_else(|| CapstanError::mapping("not a TaskAssigned"))?;
            Ok(Message::new(
                MessageHeader::new(task.id.clone(), "tasks.assigned", MessageType::Event),
                MessageBody::json(&serde_json::to_value(task)?),
            ))
        }

        fn map_to_request(&self, message: &Message) -> Result<Box<dyn AnyRequest>> {
            let task: TaskAssigned = serde_json::from_value(message.body.to_json()?)
                .map_err(|e| CapstanError::mapping(format!("decode: {e}")))?;
            Ok(Box::new(task))
        }
    }

    #[derive(Clone, Copy)]
    enum HandlerScript {
        Succeed,
        Defer,
        FailPlain,
    }

    struct ScriptedHandler {
        script: HandlerScript,
        seen: Arc<Mutex<Vec<String>>>,
    }

    #[async_trait]
    impl RequestHandler<TaskAssigned> for ScriptedHandler {
        async fn handle(&self, request: &TaskAssigned, _ctx: &DispatchContext) -> Result<()> {
            self.seen.lock().unwrap().push(request.id.clone());
            match self.script {
                HandlerScript::Succeed => Ok(()),
                HandlerScript::Defer => Err(CapstanError::DeferMessage { delay: None }.into()),
                HandlerScript::FailPlain => anyhow::bail!("handler exploded"),
            }
        }
    }

    struct PumpFixture {
        processor: Arc<crate::processor::CommandProcessor>,
        channel: InMemoryChannel,
        seen: Arc<Mutex<Vec<String>>>,
    }

    fn fixture(script: HandlerScript) -> PumpFixture {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let seen_clone = seen.clone();

        let processor = CommandProcessorBuilder::new()
            .with_event::<TaskAssigned>(HandlerRegistration::for_handler::<TaskAssigned, _>(
                "TaskHandler",
                move || ScriptedHandler {
                    script,
                    seen: seen_clone.clone(),
                },
            ))
            .with_mapper::<TaskAssigned>(MapperRegistration::new(Arc::new(TaskMapper)))
            .without_sweeper()
            .build();

        PumpFixture {
            processor,
            channel: InMemoryChannel::new("tasks"),
            seen,
        }
    }

    fn fast_config() -> PumpConfig {
        PumpConfig {
            receive_timeout: Duration::from_millis(5),
            empty_channel_delay: Duration::from_millis(1),
            channel_failure_delay: Duration::from_millis(5),
            ..PumpConfig::default()
        }
    }

    fn task_message(id: &str) -> Message {
        Message::new(
            MessageHeader::new(id, "tasks.assigned", MessageType::Event),
            MessageBody::json(&serde_json::json!({ "id": id })),
        )
    }

    async fn run_pump(fixture: &PumpFixture, config: PumpConfig) -> Result<()> {
        let pump = MessagePump::new::<TaskAssigned>(
            fixture.processor.clone(),
            Box::new(fixture.channel.clone()),
            config,
        );
        pump.run(CancellationToken::new()).await
    }

    #[tokio::test]
    async fn test_pump_dispatches_then_acks_and_quits() {
        let fixture = fixture(HandlerScript::Succeed);
        fixture.channel.push(task_message("t-1"));
        fixture.channel.push(Message::quit());

        run_pump(&fixture, fast_config()).await.unwrap();

        assert_eq!(fixture.seen.lock().unwrap().len(), 1);
        assert_eq!(fixture.channel.acknowledged().len(), 1);
        assert!(fixture.channel.is_disposed());
    }

    #[tokio::test]
    async fn test_pump_preserves_receive_order() {
        let fixture = fixture(HandlerScript::Succeed);
        for i in 0..5 {
            fixture.channel.push(task_message(&format!("t-{i}")));
        }
        fixture.channel.push(Message::quit());

        run_pump(&fixture, fast_config()).await.unwrap();

        assert_eq!(
            fixture.seen.lock().unwrap().as_slice(),
            ["t-0", "t-1", "t-2", "t-3", "t-4"]
        );
    }

    #[tokio::test]
    async fn test_pump_defer_requeues_until_limit_then_rejects() {
        let fixture = fixture(HandlerScript::Defer);
        fixture.channel.push(task_message("t-defer"));

        // The rejection drains the channel; quit after it.
        let channel = fixture.channel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(200)).await;
            channel.enqueue_local(Message::quit()).await.unwrap();
        });

        run_pump(
            &fixture,
            PumpConfig {
                requeue_limit: 3,
                discard_on_overflow: true,
                ..fast_config()
            },
        )
        .await
        .unwrap();

        // Delivered three times (handled_count 0, 1, 2), requeued twice,
        // rejected on the third delivery.
        let deliveries = fixture.channel.delivered_handled_counts();
        assert_eq!(deliveries, [0, 1, 2]);
        assert_eq!(fixture.channel.rejected().len(), 1);
        assert!(fixture.channel.acknowledged().is_empty());
    }

    #[tokio::test]
    async fn test_pump_mapping_failure_counts_unacceptable_and_exits_at_limit() {
        let fixture = fixture(HandlerScript::Succeed);
        for i in 0..3 {
            // Garbage bodies: the mapper cannot decode these.
            fixture.channel.push(Message::new(
                MessageHeader::new(format!("bad-{i}"), "tasks.assigned", MessageType::Event),
                MessageBody {
                    bytes: b"not json".to_vec(),
                    content_type: "application/json".into(),
                },
            ));
        }

        run_pump(
            &fixture,
            PumpConfig {
                unacceptable_limit: 3,
                ..fast_config()
            },
        )
        .await
        .unwrap();

        // All three were acknowledged (poison containment) and the pump
        // exited at the limit.
        assert_eq!(fixture.channel.acknowledged().len(), 3);
        assert!(fixture.channel.is_disposed());
        assert!(fixture.seen.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_pump_configuration_error_rejects_and_exits() {
        // No mapper for this request type: unwrap raises a configuration
        // error.
        let processor = CommandProcessorBuilder::new().without_sweeper().build();
        let channel = InMemoryChannel::new("tasks");
        channel.push(task_message("t-x"));

        let pump = MessagePump::new::<TaskAssigned>(
            processor,
            Box::new(channel.clone()),
            fast_config(),
        );
        let err = pump.run(CancellationToken::new()).await.unwrap_err();

        assert!(matches!(
            err.downcast_ref::<CapstanError>(),
            Some(CapstanError::Configuration { .. })
        ));
        assert_eq!(channel.rejected().len(), 1);
        assert!(channel.is_disposed());
    }

    #[tokio::test]
    async fn test_pump_plain_handler_failure_acks_and_continues() {
        let fixture = fixture(HandlerScript::FailPlain);
        fixture.channel.push(task_message("t-fail"));
        fixture.channel.push(task_message("t-fail-2"));
        fixture.channel.push(Message::quit());

        run_pump(&fixture, fast_config()).await.unwrap();

        assert_eq!(fixture.seen.lock().unwrap().len(), 2);
        assert_eq!(fixture.channel.acknowledged().len(), 2);
    }

    #[tokio::test]
    async fn test_pump_channel_failure_backs_off_and_continues() {
        let fixture = fixture(HandlerScript::Succeed);
        fixture.channel.fail_next_receive(ChannelFailureKind::Broker);
        fixture.channel.fail_next_receive(ChannelFailureKind::CircuitOpen);
        fixture.channel.push(task_message("t-after-failure"));
        fixture.channel.push(Message::quit());

        run_pump(&fixture, fast_config()).await.unwrap();

        assert_eq!(fixture.seen.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_pump_closed_channel_is_fatal() {
        let fixture = fixture(HandlerScript::Succeed);
        fixture.channel.fail_next_receive(ChannelFailureKind::Closed);

        let err = run_pump(&fixture, fast_config()).await.unwrap_err();
        assert!(matches!(
            err.downcast_ref::<CapstanError>(),
            Some(CapstanError::ChannelFailure {
                kind: ChannelFailureKind::Closed,
                ..
            })
        ));
        assert!(fixture.channel.is_disposed());
    }

    #[tokio::test]
    async fn test_pump_cancellation_disposes_channel() {
        let fixture = fixture(HandlerScript::Succeed);
        let shutdown = CancellationToken::new();
        let pump = MessagePump::new::<TaskAssigned>(
            fixture.processor.clone(),
            Box::new(fixture.channel.clone()),
            fast_config(),
        );

        let handle = tokio::spawn(pump.run(shutdown.clone()));
        tokio::time::sleep(Duration::from_millis(20)).await;
        shutdown.cancel();

        handle.await.unwrap().unwrap();
        assert!(fixture.channel.is_disposed());
    }

    #[tokio::test]
    async fn test_pump_host_runs_and_shuts_down_proactor_pumps() {
        let fixture = fixture(HandlerScript::Succeed);
        fixture.channel.push(task_message("t-host"));

        let mut host = PumpHost::new(fixture.processor.clone());
        host.add::<TaskAssigned>(
            Box::new(fixture.channel.clone()),
            PumpMode::Proactor,
            fast_config(),
        )
        .unwrap();
        assert_eq!(host.pump_count(), 1);

        tokio::time::sleep(Duration::from_millis(50)).await;
        host.shutdown().await;

        assert_eq!(fixture.seen.lock().unwrap().as_slice(), ["t-host"]);
        assert!(fixture.channel.is_disposed());
    }

    #[tokio::test]
    async fn test_reactor_variant_exits_on_quit() {
        let fixture = fixture(HandlerScript::Succeed);
        fixture.channel.push(task_message("t-reactor"));
        fixture.channel.push(Message::quit());

        let pump = MessagePump::new::<TaskAssigned>(
            fixture.processor.clone(),
            Box::new(fixture.channel.clone()),
            fast_config(),
        );
        let thread = Reactor::spawn(pump).unwrap();

        let result = tokio::task::spawn_blocking(move || thread.join())
            .await
            .unwrap()
            .unwrap();
        result.unwrap();

        assert_eq!(fixture.seen.lock().unwrap().len(), 1);
    }
}
