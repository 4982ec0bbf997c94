use crate::config::{ClientSettings, MqttSettings, Settings};
use crate::db::{PgGateway, ReadingStore};
use crate::error::AppError;
use crate::ingest::Ingestor;
use crate::mqtt::{MqttSubscriber, Transport};
use crate::state::ConnectionState;
use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::{interval, sleep, sleep_until, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

pub const DEFAULT_CHECK_INTERVAL: Duration = Duration::from_secs(1);
// Used when the runtime budget does not fit in an Instant.
const FAR_FUTURE: Duration = Duration::from_secs(100 * 365 * 24 * 3600);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SupervisorState {
    Starting,
    Running,
    Draining,
    Stopped,
}

/// Why the bridge left `Running`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StopReason {
    RuntimeElapsed,
    Signal,
    Unrecoverable(String),
}

impl StopReason {
    pub fn exit_code(&self) -> u8 {
        match self {
            StopReason::RuntimeElapsed | StopReason::Signal => 0,
            StopReason::Unrecoverable(_) => 1,
        }
    }
}

impl fmt::Display for StopReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StopReason::RuntimeElapsed => f.write_str("maximum runtime reached"),
            StopReason::Signal => f.write_str("shutdown signal"),
            StopReason::Unrecoverable(why) => write!(f, "unrecoverable: {why}"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RuntimePolicy {
    pub reconnect_delay: Duration,
    pub max_retries: u32,
    pub max_runtime: Duration,
}

impl From<&ClientSettings> for RuntimePolicy {
    fn from(c: &ClientSettings) -> Self {
        Self {
            reconnect_delay: c.reconnect_delay,
            max_retries: c.max_retries,
            max_runtime: c.max_runtime,
        }
    }
}

/// Owns both connections once startup succeeded, watches their health
/// and the runtime budget, and drains them on the way out.
pub struct Supervisor<S, T> {
    store: Arc<S>,
    transport: Arc<T>,
    policy: RuntimePolicy,
    shutdown: CancellationToken,
    check_interval: Duration,
    state: SupervisorState,
}

impl<S, T> Supervisor<S, T>
where
    S: ReadingStore,
    T: Transport,
{
    pub fn new(
        store: Arc<S>,
        transport: Arc<T>,
        policy: RuntimePolicy,
        shutdown: CancellationToken,
    ) -> Self {
        Self {
            store,
            transport,
            policy,
            shutdown,
            check_interval: DEFAULT_CHECK_INTERVAL,
            state: SupervisorState::Starting,
        }
    }

    pub fn with_check_interval(mut self, every: Duration) -> Self {
        self.check_interval = every;
        self
    }

    pub fn state(&self) -> SupervisorState {
        self.state
    }

    /// Run until the budget is spent, a signal arrives or a connection is
    /// lost for good, then drain. Always ends `Stopped`.
    pub async fn run(&mut self) -> StopReason {
        let deadline = deadline_after(self.policy.max_runtime);
        self.transition(SupervisorState::Running);
        let reason = self.watch(deadline).await;
        match &reason {
            StopReason::Unrecoverable(why) => error!(reason = %why, "giving up"),
            other => info!(reason = %other, "stopping"),
        }
        self.transition(SupervisorState::Draining);
        self.drain().await;
        self.transition(SupervisorState::Stopped);
        reason
    }

    fn transition(&mut self, next: SupervisorState) {
        info!(from = ?self.state, to = ?next, "supervisor state changed");
        self.state = next;
    }

    async fn watch(&self, deadline: Instant) -> StopReason {
        let mut ticker = interval(self.check_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        // The first tick completes immediately.
        ticker.tick().await;

        let mut storage_failures = 0u32;
        let mut transport = TransportHealth::default();
        loop {
            if let Err(reason) = self.interruptible(deadline, ticker.tick()).await {
                return reason;
            }
            if let Err(reason) = self.check_storage(&mut storage_failures, deadline).await {
                return reason;
            }
            if let Err(reason) = self.check_transport(&mut transport, deadline).await {
                return reason;
            }
        }
    }

    async fn check_storage(
        &self,
        failures: &mut u32,
        deadline: Instant,
    ) -> Result<(), StopReason> {
        if self.interruptible(deadline, self.store.probe()).await? {
            *failures = 0;
            return Ok(());
        }
        self.count_failure("storage", failures)?;
        self.interruptible(deadline, sleep(self.policy.reconnect_delay)).await?;
        match self.interruptible(deadline, self.store.reconnect()).await? {
            Ok(()) => info!("storage connection restored"),
            Err(e) => error!(error = %e, "storage reconnect failed"),
        }
        Ok(())
    }

    async fn check_transport(
        &self,
        health: &mut TransportHealth,
        deadline: Instant,
    ) -> Result<(), StopReason> {
        match self.transport.state() {
            ConnectionState::Connected => {
                *health = TransportHealth::default();
                return Ok(());
            }
            // A handshake in flight gets one check period; still connecting
            // on the next check counts as a failure.
            ConnectionState::Connecting if !health.was_connecting => {
                health.was_connecting = true;
                return Ok(());
            }
            ConnectionState::Connecting
            | ConnectionState::Disconnected
            | ConnectionState::Degraded => {}
        }
        health.was_connecting = false;
        self.count_failure("transport", &mut health.failures)?;
        self.interruptible(deadline, sleep(self.policy.reconnect_delay)).await?;
        if let Err(e) = self.interruptible(deadline, self.transport.reconnect()).await? {
            error!(error = %e, "transport reconnect failed");
        }
        Ok(())
    }

    fn count_failure(
        &self,
        component: &'static str,
        failures: &mut u32,
    ) -> Result<(), StopReason> {
        *failures += 1;
        if *failures > self.policy.max_retries {
            return Err(StopReason::Unrecoverable(format!(
                "{component} still down after {} reconnect attempt(s)",
                self.policy.max_retries
            )));
        }
        warn!(
            component,
            attempt = *failures,
            max_retries = self.policy.max_retries,
            delay_secs = self.policy.reconnect_delay.as_secs(),
            "connection unhealthy; reconnecting after delay"
        );
        Ok(())
    }

    /// Await `fut` unless the shutdown token fires or the deadline passes first.
    async fn interruptible<F: Future>(
        &self,
        deadline: Instant,
        fut: F,
    ) -> Result<F::Output, StopReason> {
        tokio::select! {
            biased;
            _ = self.shutdown.cancelled() => Err(StopReason::Signal),
            _ = sleep_until(deadline) => Err(StopReason::RuntimeElapsed),
            out = fut => Ok(out),
        }
    }

    // Best effort: every step runs even if an earlier one failed.
    async fn drain(&self) {
        self.transport.pause();
        if let Err(e) = self.transport.unsubscribe().await {
            warn!(error = %e, "unsubscribe failed while draining");
        }
        if let Err(e) = self.transport.disconnect().await {
            warn!(error = %e, "transport disconnect failed while draining");
        }
        if let Err(e) = self.store.close().await {
            warn!(error = %e, "closing storage failed while draining");
        }
    }
}

#[derive(Debug, Default)]
struct TransportHealth {
    failures: u32,
    was_connecting: bool,
}

fn deadline_after(budget: Duration) -> Instant {
    let now = Instant::now();
    now.checked_add(budget)
        .or_else(|| now.checked_add(FAR_FUTURE))
        .unwrap_or(now)
}

async fn until_cancelled<F: Future>(shutdown: &CancellationToken, fut: F) -> Option<F::Output> {
    tokio::select! {
        biased;
        _ = shutdown.cancelled() => None,
        out = fut => Some(out),
    }
}

async fn open_transport(
    store: &PgGateway,
    mqtt: &MqttSettings,
    client_id: &str,
) -> Result<MqttSubscriber, AppError> {
    store.ensure_schema().await?;
    let mut transport = MqttSubscriber::connect(mqtt, client_id).await?;
    if let Err(e) = transport.subscribe(&mqtt.topic, mqtt.qos).await {
        disconnect_quietly(&transport).await;
        return Err(e.into());
    }
    Ok(transport)
}

async fn disconnect_quietly(transport: &MqttSubscriber) {
    if let Err(e) = transport.disconnect().await {
        warn!(error = %e, "disconnecting transport after aborted startup failed");
    }
}

async fn release(store: &PgGateway) {
    if let Err(e) = store.close().await {
        warn!(error = %e, "closing storage after aborted startup failed");
    }
}

/// Startup sequence followed by the supervised run. Any startup failure is
/// returned as an error; a signal during startup is a clean stop.
pub async fn start(
    settings: &Settings,
    shutdown: CancellationToken,
) -> Result<StopReason, AppError> {
    info!(state = ?SupervisorState::Starting, "starting moisture bridge");
    let store = match until_cancelled(&shutdown, PgGateway::connect(&settings.database)).await {
        Some(res) => Arc::new(res?),
        None => return Ok(StopReason::Signal),
    };

    let opened = until_cancelled(
        &shutdown,
        open_transport(&store, &settings.mqtt, &settings.client.id),
    )
    .await;
    let mut transport = match opened {
        Some(Ok(t)) => t,
        Some(Err(e)) => {
            release(&store).await;
            return Err(e);
        }
        None => {
            info!("shutdown requested during startup");
            release(&store).await;
            return Ok(StopReason::Signal);
        }
    };

    if let Err(e) = transport.start(Arc::new(Ingestor::new(store.clone()))) {
        disconnect_quietly(&transport).await;
        release(&store).await;
        return Err(e.into());
    }

    let policy = RuntimePolicy::from(&settings.client);
    info!(
        max_runtime_secs = policy.max_runtime.as_secs(),
        max_retries = policy.max_retries,
        "bridge running"
    );
    let mut supervisor = Supervisor::new(store, Arc::new(transport), policy, shutdown);
    Ok(supervisor.run().await)
}
