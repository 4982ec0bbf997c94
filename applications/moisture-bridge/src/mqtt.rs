use crate::config::MqttSettings;
use crate::error::TransportError;
use crate::state::{ConnectionState, StateCell};
use async_trait::async_trait;
use rumqttc::{
    AsyncClient, ConnAck, Event, EventLoop, MqttOptions, Outgoing, Packet, QoS, SubAck,
    SubscribeReasonCode,
};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, Notify};
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Upper bound for CONNACK / SUBACK round trips and for a reconnect attempt.
pub const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);
const DRAIN_TIMEOUT: Duration = Duration::from_secs(2);
const REQUEST_CAPACITY: usize = 50;

/// Invoked by the delivery task for every inbound publish, one at a time,
/// in the order the broker delivered them.
#[async_trait]
pub trait MessageHandler: Send + Sync + 'static {
    async fn handle(&self, topic: &str, payload: &[u8]);
}

/// What the supervisor needs from a live subscription.
#[async_trait]
pub trait Transport: Send + Sync {
    fn state(&self) -> ConnectionState;
    /// Re-establish the session (or the subscription, when degraded) and
    /// wait for the outcome.
    async fn reconnect(&self) -> Result<(), TransportError>;
    /// Stop handing messages to the handler. Later messages are logged and discarded.
    fn pause(&self);
    async fn unsubscribe(&self) -> Result<(), TransportError>;
    /// Safe to call when already disconnected.
    async fn disconnect(&self) -> Result<(), TransportError>;
}

#[derive(Debug, Clone)]
struct Subscription {
    topic: String,
    qos: QoS,
}

struct Shared {
    state: StateCell,
    accepting: AtomicBool,
    reconnect: Notify,
    closing: CancellationToken,
    subscription: std::sync::Mutex<Option<Subscription>>,
}

impl Shared {
    fn subscription(&self) -> Option<Subscription> {
        self.subscription.lock().ok().and_then(|s| s.clone())
    }

    fn set_subscription(&self, sub: Option<Subscription>) -> Option<Subscription> {
        match self.subscription.lock() {
            Ok(mut guard) => std::mem::replace(&mut *guard, sub),
            Err(_) => None,
        }
    }
}

pub struct MqttSubscriber {
    client: AsyncClient,
    // Held here between connect and start; the delivery task owns it after.
    eventloop: Mutex<Option<EventLoop>>,
    shared: Arc<Shared>,
    task: Mutex<Option<JoinHandle<()>>>,
}

pub fn build_options(settings: &MqttSettings, client_id: &str) -> MqttOptions {
    let client_id = if client_id.trim().is_empty() {
        format!("moisture-bridge-{}", Uuid::new_v4())
    } else {
        client_id.to_string()
    };
    let mut opts = MqttOptions::new(client_id, &settings.broker, settings.port);
    opts.set_keep_alive(settings.keepalive);
    opts.set_clean_session(true);
    if !settings.username.is_empty() && !settings.password.is_empty() {
        opts.set_credentials(&settings.username, &settings.password);
    }
    if settings.port == 8883 {
        opts.set_transport(rumqttc::Transport::tls_with_default_config());
    }
    opts
}

pub fn qos(v: u8) -> QoS {
    match v {
        0 => QoS::AtMostOnce,
        2 => QoS::ExactlyOnce,
        _ => QoS::AtLeastOnce,
    }
}

fn rejected(ack: &SubAck) -> bool {
    ack.return_codes
        .iter()
        .any(|code| matches!(code, SubscribeReasonCode::Failure))
}

impl MqttSubscriber {
    /// Open the session and wait for the broker's CONNACK.
    pub async fn connect(
        settings: &MqttSettings,
        client_id: &str,
    ) -> Result<Self, TransportError> {
        let opts = build_options(settings, client_id);
        let client_id = opts.client_id();
        let (client, mut eventloop) = AsyncClient::new(opts, REQUEST_CAPACITY);
        let shared = Arc::new(Shared {
            state: StateCell::new("transport"),
            accepting: AtomicBool::new(true),
            reconnect: Notify::new(),
            closing: CancellationToken::new(),
            subscription: std::sync::Mutex::new(None),
        });

        shared.state.set(ConnectionState::Connecting);
        let handshake = async {
            loop {
                match eventloop.poll().await {
                    Ok(Event::Incoming(Packet::ConnAck(ack))) => {
                        return Ok::<ConnAck, rumqttc::ConnectionError>(ack)
                    }
                    Ok(_) => continue,
                    Err(e) => return Err(e),
                }
            }
        };
        let failure = match timeout(HANDSHAKE_TIMEOUT, handshake).await {
            Ok(Ok(_)) => None,
            Ok(Err(e)) => Some(e.to_string()),
            Err(_) => Some(format!(
                "no CONNACK within {}s",
                HANDSHAKE_TIMEOUT.as_secs()
            )),
        };
        if let Some(reason) = failure {
            shared.state.set(ConnectionState::Disconnected);
            return Err(TransportError::Unreachable(format!(
                "{}:{}: {reason}",
                settings.broker, settings.port
            )));
        }

        shared.state.set(ConnectionState::Connected);
        info!(
            broker = %settings.broker,
            port = settings.port,
            client_id = %client_id,
            "connected to MQTT broker"
        );
        Ok(Self {
            client,
            eventloop: Mutex::new(Some(eventloop)),
            shared,
            task: Mutex::new(None),
        })
    }

    /// Subscribe and wait for the SUBACK. `topic` may contain a single-level
    /// `+` wildcard, e.g. `moisture/+/data`.
    pub async fn subscribe(&mut self, topic: &str, qos_level: u8) -> Result<(), TransportError> {
        let eventloop = self
            .eventloop
            .get_mut()
            .as_mut()
            .ok_or_else(|| TransportError::Subscribe("delivery already started".into()))?;
        let sub = Subscription {
            topic: topic.to_string(),
            qos: qos(qos_level),
        };
        self.client.subscribe(sub.topic.clone(), sub.qos).await?;

        let wait_ack = async {
            loop {
                match eventloop.poll().await {
                    Ok(Event::Incoming(Packet::SubAck(ack))) => return Ok(ack),
                    Ok(Event::Incoming(Packet::Publish(p))) => {
                        warn!(topic = %p.topic, "discarding message received before SUBACK");
                    }
                    Ok(_) => continue,
                    Err(e) => return Err(TransportError::Unreachable(e.to_string())),
                }
            }
        };
        let ack = timeout(HANDSHAKE_TIMEOUT, wait_ack)
            .await
            .map_err(|_| TransportError::Subscribe(format!("no SUBACK for {topic}")))??;
        if rejected(&ack) {
            return Err(TransportError::Subscribe(format!(
                "broker refused subscription to {topic}"
            )));
        }

        info!(topic = %topic, qos = qos_level, "subscribed");
        self.shared.set_subscription(Some(sub));
        Ok(())
    }

    /// Hand the event loop to a background delivery task.
    pub fn start(&mut self, handler: Arc<dyn MessageHandler>) -> Result<(), TransportError> {
        let eventloop = self
            .eventloop
            .get_mut()
            .take()
            .ok_or_else(|| TransportError::Subscribe("delivery already started".into()))?;
        let task = tokio::spawn(deliver(
            eventloop,
            self.client.clone(),
            self.shared.clone(),
            handler,
        ));
        *self.task.get_mut() = Some(task);
        Ok(())
    }
}

async fn deliver(
    mut eventloop: EventLoop,
    client: AsyncClient,
    shared: Arc<Shared>,
    handler: Arc<dyn MessageHandler>,
) {
    debug!("MQTT delivery loop started");
    loop {
        match eventloop.poll().await {
            Ok(Event::Incoming(Packet::Publish(p))) => {
                if shared.accepting.load(Ordering::Acquire) {
                    handler.handle(&p.topic, &p.payload).await;
                } else {
                    warn!(
                        topic = %p.topic,
                        bytes = p.payload.len(),
                        "discarding message received while draining"
                    );
                }
            }
            Ok(Event::Incoming(Packet::ConnAck(ack))) => on_reconnected(&client, &shared, &ack),
            Ok(Event::Incoming(Packet::SubAck(ack))) => {
                if rejected(&ack) {
                    warn!(return_codes = ?ack.return_codes, "broker refused re-subscription");
                    shared.state.set(ConnectionState::Degraded);
                } else {
                    info!("subscription re-established");
                    shared.state.set(ConnectionState::Connected);
                }
            }
            Ok(Event::Outgoing(Outgoing::Disconnect)) => {
                debug!("DISCONNECT sent");
                break;
            }
            Ok(event) => debug!(?event, "MQTT event"),
            Err(e) => {
                if shared.closing.is_cancelled() {
                    debug!(error = %e, "MQTT connection closed during shutdown");
                    break;
                }
                shared.state.set(ConnectionState::Disconnected);
                warn!(error = %e, "unexpected MQTT disconnection; waiting for reconnect");
                tokio::select! {
                    _ = shared.closing.cancelled() => break,
                    _ = shared.reconnect.notified() => debug!("MQTT reconnect requested"),
                }
            }
        }
    }
    shared.state.set(ConnectionState::Disconnected);
    debug!("MQTT delivery loop stopped");
}

// Clean sessions drop subscriptions on the broker, so they are re-issued.
fn on_reconnected(client: &AsyncClient, shared: &Shared, ack: &ConnAck) {
    if ack.session_present {
        shared.state.set(ConnectionState::Connected);
        return;
    }
    let Some(sub) = shared.subscription() else {
        shared.state.set(ConnectionState::Connected);
        return;
    };
    if let Err(e) = client.try_subscribe(sub.topic.clone(), sub.qos) {
        warn!(topic = %sub.topic, error = %e, "could not re-issue subscription");
        shared.state.set(ConnectionState::Degraded);
    }
}

#[async_trait]
impl Transport for MqttSubscriber {
    fn state(&self) -> ConnectionState {
        self.shared.state.get()
    }

    async fn reconnect(&self) -> Result<(), TransportError> {
        let mut rx = self.shared.state.subscribe();
        let fallback = self.shared.state.get();
        match fallback {
            ConnectionState::Disconnected => {
                self.shared.state.set(ConnectionState::Connecting);
                self.shared.reconnect.notify_one();
            }
            ConnectionState::Degraded => {
                let sub = self
                    .shared
                    .subscription()
                    .ok_or_else(|| TransportError::Subscribe("no active subscription".into()))?;
                self.shared.state.set(ConnectionState::Connecting);
                if let Err(e) = self.client.try_subscribe(sub.topic, sub.qos) {
                    self.shared.state.set(ConnectionState::Degraded);
                    return Err(e.into());
                }
            }
            ConnectionState::Connecting | ConnectionState::Connected => return Ok(()),
        }

        let outcome = timeout(
            HANDSHAKE_TIMEOUT,
            rx.wait_for(|s| *s != ConnectionState::Connecting),
        )
        .await
        .map(|r| r.map(|s| *s));
        if !matches!(outcome, Ok(Ok(_))) {
            // Nothing settled the attempt; step back out of Connecting so
            // the next check retries it.
            self.shared.state.set_if(ConnectionState::Connecting, fallback);
        }
        match outcome {
            Ok(Ok(ConnectionState::Connected)) => {
                info!("reconnected to MQTT broker");
                Ok(())
            }
            Ok(Ok(other)) => Err(TransportError::Unreachable(format!(
                "reconnect attempt ended {other}"
            ))),
            Ok(Err(_)) => Err(TransportError::Unreachable("delivery loop stopped".into())),
            Err(_) => Err(TransportError::Unreachable(format!(
                "no reconnect within {}s",
                HANDSHAKE_TIMEOUT.as_secs()
            ))),
        }
    }

    fn pause(&self) {
        self.shared.accepting.store(false, Ordering::Release);
    }

    async fn unsubscribe(&self) -> Result<(), TransportError> {
        let Some(sub) = self.shared.set_subscription(None) else {
            return Ok(());
        };
        if self.shared.state.get() != ConnectionState::Connected {
            debug!(topic = %sub.topic, "not connected; skipping UNSUBSCRIBE");
            return Ok(());
        }
        self.client.try_unsubscribe(sub.topic.clone())?;
        info!(topic = %sub.topic, "unsubscribed");
        Ok(())
    }

    async fn disconnect(&self) -> Result<(), TransportError> {
        self.pause();
        let Some(mut task) = self.task.lock().await.take() else {
            self.shared.state.set(ConnectionState::Disconnected);
            return Ok(());
        };
        let sent = if self.shared.state.get() == ConnectionState::Connected {
            self.client.try_disconnect().map_err(TransportError::from)
        } else {
            Ok(())
        };
        self.shared.closing.cancel();
        if timeout(DRAIN_TIMEOUT, &mut task).await.is_err() {
            warn!("MQTT delivery loop did not stop in time; aborting it");
            task.abort();
        }
        self.shared.state.set(ConnectionState::Disconnected);
        info!("MQTT client disconnected");
        sent
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::{TcpListener, TcpStream};

    struct Discard;

    #[async_trait]
    impl MessageHandler for Discard {
        async fn handle(&self, _topic: &str, _payload: &[u8]) {}
    }

    /// One MQTT control packet from the client: (packet type, body).
    async fn read_packet(stream: &mut TcpStream) -> (u8, Vec<u8>) {
        let header = stream.read_u8().await.unwrap();
        let mut len = 0usize;
        let mut shift = 0;
        loop {
            let byte = stream.read_u8().await.unwrap();
            len |= usize::from(byte & 0x7f) << shift;
            if byte & 0x80 == 0 {
                break;
            }
            shift += 7;
        }
        let mut body = vec![0; len];
        stream.read_exact(&mut body).await.unwrap();
        (header >> 4, body)
    }

    async fn accept_session(listener: &TcpListener) -> TcpStream {
        let (mut stream, _) = listener.accept().await.unwrap();
        let (kind, _) = read_packet(&mut stream).await;
        assert_eq!(kind, 1, "expected CONNECT");
        stream.write_all(&[0x20, 0x02, 0x00, 0x00]).await.unwrap();
        stream
    }

    async fn answer_subscribe(stream: &mut TcpStream, return_code: u8) {
        let (kind, body) = read_packet(stream).await;
        assert_eq!(kind, 8, "expected SUBSCRIBE");
        stream
            .write_all(&[0x90, 0x03, body[0], body[1], return_code])
            .await
            .unwrap();
    }

    fn settings(port: u16, username: &str, password: &str) -> MqttSettings {
        MqttSettings {
            broker: "127.0.0.1".into(),
            port,
            username: username.into(),
            password: password.into(),
            topic: "moisture/+/data".into(),
            qos: 1,
            keepalive: Duration::from_secs(60),
        }
    }

    #[test]
    fn test_build_options_with_credentials() {
        let opts = build_options(&settings(1883, "user", "pass"), "moisture_client");
        assert_eq!(opts.client_id(), "moisture_client");
        assert_eq!(opts.broker_address(), ("127.0.0.1".to_string(), 1883));
        assert_eq!(opts.keep_alive(), Duration::from_secs(60));
        assert!(opts.clean_session());
        assert_eq!(
            opts.credentials(),
            Some(("user".to_string(), "pass".to_string()))
        );
    }

    #[test]
    fn test_build_options_anonymous_unless_both_set() {
        assert_eq!(build_options(&settings(1883, "user", ""), "c").credentials(), None);
        assert_eq!(build_options(&settings(1883, "", "pass"), "c").credentials(), None);
    }

    #[test]
    fn test_build_options_generates_client_id() {
        let opts = build_options(&settings(1883, "", ""), "  ");
        assert!(opts.client_id().starts_with("moisture-bridge-"));
    }

    #[test]
    fn test_qos() {
        assert_eq!(qos(0), QoS::AtMostOnce);
        assert_eq!(qos(1), QoS::AtLeastOnce);
        assert_eq!(qos(2), QoS::ExactlyOnce);
    }

    #[tokio::test]
    async fn test_connect_refused_is_unreachable() {
        // Nothing listens on port 1.
        let err = MqttSubscriber::connect(&settings(1, "", ""), "test")
            .await
            .err()
            .expect("connect should fail");
        assert!(matches!(err, TransportError::Unreachable(_)), "{err}");
    }

    #[tokio::test]
    async fn test_reconnect_after_broker_drops_session() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let broker = tokio::spawn(async move {
            let mut first = accept_session(&listener).await;
            answer_subscribe(&mut first, 0x01).await;
            drop(first);

            let mut second = accept_session(&listener).await;
            answer_subscribe(&mut second, 0x80).await;
            answer_subscribe(&mut second, 0x01).await;
            second
        });

        let mut sub = MqttSubscriber::connect(&settings(port, "", ""), "test")
            .await
            .unwrap();
        sub.subscribe("moisture/+/data", 1).await.unwrap();
        sub.start(Arc::new(Discard)).unwrap();

        let mut rx = sub.shared.state.subscribe();
        timeout(
            Duration::from_secs(5),
            rx.wait_for(|s| *s == ConnectionState::Disconnected),
        )
        .await
        .unwrap()
        .unwrap();

        // Session comes back, but the broker refuses the re-issued subscription.
        let err = sub.reconnect().await.unwrap_err();
        assert!(matches!(err, TransportError::Unreachable(_)), "{err}");
        assert_eq!(sub.state(), ConnectionState::Degraded);

        // A degraded transport only needs the subscription again.
        sub.reconnect().await.unwrap();
        assert_eq!(sub.state(), ConnectionState::Connected);

        let _session = broker.await.unwrap();
        sub.disconnect().await.unwrap();
        assert_eq!(sub.state(), ConnectionState::Disconnected);
    }
}
