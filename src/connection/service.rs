//! Async driver for the connection supervisor.
//!
//! One tokio task owns the [`Supervisor`]. Stream readers, timers and probes
//! are spawned as auxiliary tasks that report back over a single channel,
//! each tagged with the attempt it was started under.

use std::sync::Arc;

use futures_util::StreamExt;
use tokio::sync::{mpsc, watch};
use tokio::task::{JoinHandle, JoinSet};
use tokio::time::{interval_at, sleep, timeout, Instant, MissedTickBehavior};
use tracing::{debug, info, warn};

use super::supervisor::{AttemptId, ConnectionState, Supervisor, SupervisorAction, TransportSignal};
use super::transport::EventTransport;
use crate::config::ConnectionConfig;
use crate::events::EventDispatcher;

/// Requests accepted from the owner of the service.
#[derive(Debug, Clone, PartialEq, Eq)]
enum Command {
    Reconnect,
    SetBaseUrl(String),
    Shutdown,
}

#[derive(Debug)]
enum Input {
    Transport {
        attempt: AttemptId,
        signal: TransportSignal,
    },
    ConnectTimeout {
        attempt: AttemptId,
    },
    RetryDue {
        attempt: AttemptId,
    },
    ProbeResult {
        attempt: AttemptId,
        healthy: bool,
    },
    Command(Command),
}

/// Handle to a running connection service.
pub struct ConnectionService {
    inputs: mpsc::UnboundedSender<Input>,
    status: watch::Receiver<ConnectionState>,
    dispatcher: Arc<EventDispatcher>,
    task: Option<JoinHandle<()>>,
}

impl ConnectionService {
    /// Start supervising the push stream at `base_url`.
    ///
    /// The first connection attempt is made immediately.
    pub fn start(
        config: ConnectionConfig,
        base_url: impl Into<String>,
        transport: Arc<dyn EventTransport>,
        dispatcher: Arc<EventDispatcher>,
    ) -> Self {
        let (inputs, rx) = mpsc::unbounded_channel();
        let (status_tx, status) = watch::channel(ConnectionState::Disconnected);

        let driver = Driver {
            health_interval: config.health_check_interval(),
            probe_timeout: config.probe_timeout(),
            supervisor: Supervisor::new(config),
            base_url: base_url.into(),
            transport,
            dispatcher: Arc::clone(&dispatcher),
            inputs: inputs.clone(),
            status: status_tx,
            stream: None,
            aux: JoinSet::new(),
        };
        let task = tokio::spawn(driver.run(rx));

        Self {
            inputs,
            status,
            dispatcher,
            task: Some(task),
        }
    }

    /// Current connection status.
    pub fn status(&self) -> ConnectionState {
        *self.status.borrow()
    }

    /// Subscribe to status changes.
    pub fn subscribe(&self) -> watch::Receiver<ConnectionState> {
        self.status.clone()
    }

    /// Dispatcher receiving every message body.
    pub fn dispatcher(&self) -> &Arc<EventDispatcher> {
        &self.dispatcher
    }

    /// Reconnect now, with backoff reset.
    pub fn reconnect(&self) {
        self.send(Command::Reconnect);
    }

    /// Point the service at a new agent endpoint; reconnects immediately.
    pub fn set_base_url(&self, base_url: impl Into<String>) {
        self.send(Command::SetBaseUrl(base_url.into()));
    }

    /// Close the stream, cancel timers and wait for the driver to exit.
    pub async fn shutdown(mut self) {
        self.send(Command::Shutdown);
        if let Some(task) = self.task.take() {
            if let Err(e) = task.await {
                warn!(error = %e, "Connection driver ended abnormally");
            }
        }
    }

    fn send(&self, command: Command) {
        if self.inputs.send(Input::Command(command)).is_err() {
            debug!("Connection driver already stopped");
        }
    }
}

impl Drop for ConnectionService {
    fn drop(&mut self) {
        if let Some(task) = self.task.take() {
            task.abort();
        }
    }
}

struct Driver {
    supervisor: Supervisor,
    health_interval: std::time::Duration,
    probe_timeout: std::time::Duration,
    base_url: String,
    transport: Arc<dyn EventTransport>,
    dispatcher: Arc<EventDispatcher>,
    inputs: mpsc::UnboundedSender<Input>,
    status: watch::Sender<ConnectionState>,
    stream: Option<JoinHandle<()>>,
    aux: JoinSet<()>,
}

impl Driver {
    async fn run(mut self, mut rx: mpsc::UnboundedReceiver<Input>) {
        let mut health = interval_at(Instant::now() + self.health_interval, self.health_interval);
        health.set_missed_tick_behavior(MissedTickBehavior::Delay);

        let actions = self.supervisor.connect(Instant::now());
        self.execute(actions);

        loop {
            tokio::select! {
                received = rx.recv() => {
                    let Some(input) = received else { break };
                    if !self.handle(input) {
                        break;
                    }
                }
                _ = health.tick() => {
                    let actions = self.supervisor.on_health_tick(Instant::now());
                    self.execute(actions);
                }
                Some(_) = self.aux.join_next(), if !self.aux.is_empty() => {}
            }
        }

        info!("Connection service stopped");
    }

    /// Returns false once the service should stop.
    fn handle(&mut self, input: Input) -> bool {
        let now = Instant::now();
        let actions = match input {
            Input::Transport { attempt, signal } => {
                self.supervisor.on_transport(attempt, signal, now)
            }
            Input::ConnectTimeout { attempt } => self.supervisor.on_connect_timeout(attempt, now),
            Input::RetryDue { attempt } => self.supervisor.on_retry_due(attempt, now),
            Input::ProbeResult { attempt, healthy } => {
                self.supervisor.on_probe_result(attempt, healthy, now)
            }
            Input::Command(Command::Reconnect) => {
                info!("Manual reconnect requested");
                self.supervisor.reconnect_now(now)
            }
            Input::Command(Command::SetBaseUrl(url)) => {
                if url == self.base_url {
                    Vec::new()
                } else {
                    info!(base_url = %url, "Agent endpoint changed");
                    self.base_url = url;
                    self.supervisor.reconnect_now(now)
                }
            }
            Input::Command(Command::Shutdown) => {
                let actions = self.supervisor.teardown();
                self.execute(actions);
                self.aux.abort_all();
                return false;
            }
        };
        self.execute(actions);
        true
    }

    fn execute(&mut self, actions: Vec<SupervisorAction>) {
        for action in actions {
            match action {
                SupervisorAction::Close => {
                    if let Some(stream) = self.stream.take() {
                        stream.abort();
                    }
                }
                SupervisorAction::Open { attempt } => {
                    let transport = Arc::clone(&self.transport);
                    let base_url = self.base_url.clone();
                    let inputs = self.inputs.clone();
                    self.stream = Some(tokio::spawn(read_stream(
                        transport, base_url, attempt, inputs,
                    )));
                }
                SupervisorAction::ArmConnectTimeout { attempt, after } => {
                    let inputs = self.inputs.clone();
                    self.aux.spawn(async move {
                        sleep(after).await;
                        let _ = inputs.send(Input::ConnectTimeout { attempt });
                    });
                }
                SupervisorAction::ScheduleRetry { attempt, after } => {
                    let inputs = self.inputs.clone();
                    self.aux.spawn(async move {
                        sleep(after).await;
                        let _ = inputs.send(Input::RetryDue { attempt });
                    });
                }
                SupervisorAction::Probe { attempt } => {
                    let transport = Arc::clone(&self.transport);
                    let base_url = self.base_url.clone();
                    let inputs = self.inputs.clone();
                    let limit = self.probe_timeout;
                    self.aux.spawn(async move {
                        let healthy = matches!(
                            timeout(limit, transport.probe(&base_url)).await,
                            Ok(Ok(()))
                        );
                        debug!(attempt = %attempt, healthy, "Liveness probe finished");
                        let _ = inputs.send(Input::ProbeResult { attempt, healthy });
                    });
                }
                SupervisorAction::Dispatch { body } => {
                    self.dispatcher.dispatch(&body);
                }
                SupervisorAction::Publish { state } => {
                    self.status.send_replace(state);
                }
            }
        }
    }
}

impl Drop for Driver {
    fn drop(&mut self) {
        if let Some(stream) = self.stream.take() {
            stream.abort();
        }
    }
}

async fn read_stream(
    transport: Arc<dyn EventTransport>,
    base_url: String,
    attempt: AttemptId,
    inputs: mpsc::UnboundedSender<Input>,
) {
    let emit = |signal| {
        let _ = inputs.send(Input::Transport { attempt, signal });
    };

    let mut stream = match transport.open(&base_url).await {
        Ok(stream) => stream,
        Err(e) => {
            emit(TransportSignal::Failed {
                recovering: false,
                reason: e.to_string(),
            });
            return;
        }
    };
    emit(TransportSignal::Opened);

    let recovering = transport.auto_recovers();
    while let Some(item) = stream.next().await {
        match item {
            Ok(body) => emit(TransportSignal::Message(body)),
            Err(e) => {
                emit(TransportSignal::Failed {
                    recovering,
                    reason: e.to_string(),
                });
                if !recovering {
                    return;
                }
            }
        }
    }
    emit(TransportSignal::Closed);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ThrottleConfig;
    use crate::connection::MessageStream;
    use crate::error::{ConnectionError, ConnectionResult};
    use crate::events::{InvestigationHandlers, LogNotificationSink, ProgressThrottle};
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use std::sync::Mutex;
    use std::time::Duration;

    /// Transport whose streams are fed by the test.
    #[derive(Default)]
    struct ScriptedTransport {
        senders: Mutex<Vec<mpsc::UnboundedSender<ConnectionResult<String>>>>,
        opened_urls: Mutex<Vec<String>>,
        fail_opens: AtomicUsize,
        healthy: AtomicBool,
        probes: AtomicUsize,
    }

    impl ScriptedTransport {
        fn opens(&self) -> usize {
            self.opened_urls.lock().unwrap().len()
        }

        fn latest(&self) -> mpsc::UnboundedSender<ConnectionResult<String>> {
            self.senders.lock().unwrap().last().cloned().unwrap()
        }
    }

    #[async_trait]
    impl EventTransport for ScriptedTransport {
        async fn open(&self, base_url: &str) -> ConnectionResult<MessageStream> {
            self.opened_urls.lock().unwrap().push(base_url.to_string());
            if self.fail_opens.load(Ordering::SeqCst) > 0 {
                self.fail_opens.fetch_sub(1, Ordering::SeqCst);
                return Err(ConnectionError::Stream {
                    message: "refused".to_string(),
                });
            }
            let (tx, rx) = mpsc::unbounded_channel();
            self.senders.lock().unwrap().push(tx);
            Ok(Box::pin(channel_stream(rx)))
        }

        async fn probe(&self, _base_url: &str) -> ConnectionResult<()> {
            self.probes.fetch_add(1, Ordering::SeqCst);
            if self.healthy.load(Ordering::SeqCst) {
                Ok(())
            } else {
                Err(ConnectionError::Timeout { timeout_ms: 3000 })
            }
        }
    }

    fn channel_stream(
        rx: mpsc::UnboundedReceiver<ConnectionResult<String>>,
    ) -> impl futures_util::Stream<Item = ConnectionResult<String>> + Send {
        futures_util::stream::unfold(rx, |mut rx| async move {
            rx.recv().await.map(|item| (item, rx))
        })
    }

    fn dispatcher() -> Arc<EventDispatcher> {
        Arc::new(EventDispatcher::new(
            Arc::new(LogNotificationSink),
            InvestigationHandlers::new(),
            ProgressThrottle::spawn(ThrottleConfig::default()),
        ))
    }

    async fn settle() {
        for _ in 0..10 {
            tokio::task::yield_now().await;
        }
    }

    fn start(transport: &Arc<ScriptedTransport>) -> ConnectionService {
        let transport: Arc<dyn EventTransport> = Arc::clone(transport) as Arc<dyn EventTransport>;
        ConnectionService::start(
            ConnectionConfig::default(),
            "http://agent:8765",
            transport,
            dispatcher(),
        )
    }

    #[tokio::test(start_paused = true)]
    async fn test_connects_on_start() {
        let transport = Arc::new(ScriptedTransport::default());
        let service = start(&transport);
        settle().await;

        assert_eq!(service.status(), ConnectionState::Connected);
        assert_eq!(transport.opens(), 1);
        service.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_failed_open_retries_with_backoff() {
        let transport = Arc::new(ScriptedTransport::default());
        transport.fail_opens.store(2, Ordering::SeqCst);
        let service = start(&transport);
        settle().await;
        assert_eq!(service.status(), ConnectionState::Error);
        assert_eq!(transport.opens(), 1);

        tokio::time::sleep(Duration::from_millis(1_050)).await;
        settle().await;
        assert_eq!(transport.opens(), 2);

        // Second delay is 2s, so nothing new after another second.
        tokio::time::sleep(Duration::from_millis(1_000)).await;
        settle().await;
        assert_eq!(transport.opens(), 2);

        tokio::time::sleep(Duration::from_millis(1_100)).await;
        settle().await;
        assert_eq!(transport.opens(), 3);
        assert_eq!(service.status(), ConnectionState::Connected);
        service.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_server_close_schedules_reconnect() {
        let transport = Arc::new(ScriptedTransport::default());
        let service = start(&transport);
        settle().await;

        transport.senders.lock().unwrap().clear();
        settle().await;
        assert_eq!(service.status(), ConnectionState::Disconnected);

        tokio::time::sleep(Duration::from_millis(1_050)).await;
        settle().await;
        assert_eq!(transport.opens(), 2);
        assert_eq!(service.status(), ConnectionState::Connected);
        service.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_stale_stream_is_replaced() {
        let transport = Arc::new(ScriptedTransport::default());
        let service = start(&transport);
        settle().await;
        assert_eq!(transport.opens(), 1);

        // Silence for longer than the staleness window; health ticks every 10s.
        tokio::time::sleep(Duration::from_secs(51)).await;
        settle().await;
        assert_eq!(transport.opens(), 2);
        service.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_messages_keep_stream_fresh() {
        let transport = Arc::new(ScriptedTransport::default());
        let service = start(&transport);
        settle().await;

        for _ in 0..8 {
            tokio::time::sleep(Duration::from_secs(10)).await;
            transport
                .latest()
                .send(Ok(r#"{"type":"heartbeat"}"#.to_string()))
                .unwrap();
            settle().await;
        }
        assert_eq!(transport.opens(), 1);
        assert_eq!(service.status(), ConnectionState::Connected);
        service.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_set_base_url_reconnects_to_new_endpoint() {
        let transport = Arc::new(ScriptedTransport::default());
        let service = start(&transport);
        settle().await;

        service.set_base_url("http://other:9000");
        settle().await;
        assert_eq!(
            transport.opened_urls.lock().unwrap().as_slice(),
            ["http://agent:8765", "http://other:9000"]
        );

        // Same endpoint again is not a change.
        service.set_base_url("http://other:9000");
        settle().await;
        assert_eq!(transport.opens(), 2);
        service.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_healthy_probe_reconnects_early() {
        let transport = Arc::new(ScriptedTransport::default());
        transport.fail_opens.store(5, Ordering::SeqCst);
        let service = start(&transport);
        settle().await;

        // Burn through retries at 1s, 2s, 4s; the next is due 8s later.
        tokio::time::sleep(Duration::from_millis(7_100)).await;
        settle().await;
        assert_eq!(transport.opens(), 4);

        transport.fail_opens.store(0, Ordering::SeqCst);
        transport.healthy.store(true, Ordering::SeqCst);
        // Health tick at 10s probes and reconnects before the 15s retry.
        tokio::time::sleep(Duration::from_millis(3_000)).await;
        settle().await;
        assert!(transport.probes.load(Ordering::SeqCst) >= 1);
        assert_eq!(transport.opens(), 5);
        assert_eq!(service.status(), ConnectionState::Connected);
        service.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_shutdown_stops_reconnecting() {
        let transport = Arc::new(ScriptedTransport::default());
        transport.fail_opens.store(10, Ordering::SeqCst);
        let service = start(&transport);
        settle().await;
        let status = service.subscribe();

        service.shutdown().await;
        tokio::time::sleep(Duration::from_secs(60)).await;
        settle().await;
        assert_eq!(transport.opens(), 1);
        assert_eq!(*status.borrow(), ConnectionState::Disconnected);
    }
}
