//! MQTT client implementation

use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tracing::{debug, error, info, warn};

use rumqttc::{
    AsyncClient, ConnectionError, Event, EventLoop, MqttOptions, Outgoing, Packet, Publish, QoS,
    Transport,
};

use crate::{
    config::{MqttConfig, MqttTransport},
    errors::LakeError,
    models::Message,
};

/// Capacity of the queue between the network loop and the ingester
const CHANNEL_CAPACITY: usize = 100;

/// How long to wait for the event loop to flush DISCONNECT
const DISCONNECT_TIMEOUT: Duration = Duration::from_secs(5);

/// Broker connection lifecycle
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    Subscribed,
    Receiving,
}

impl ConnectionState {
    /// State while a poll of the event loop is pending
    pub fn polling(self) -> Self {
        match self {
            ConnectionState::Disconnected => ConnectionState::Connecting,
            other => other,
        }
    }

    /// State after the event loop produced `event`
    pub fn advance(self, event: &Result<Event, ConnectionError>) -> Self {
        match event {
            Err(_) => ConnectionState::Disconnected,
            Ok(Event::Incoming(Packet::ConnAck(_))) => ConnectionState::Connected,
            Ok(Event::Incoming(Packet::SubAck(_))) if self == ConnectionState::Connected => {
                ConnectionState::Subscribed
            }
            Ok(Event::Incoming(Packet::Publish(_))) => ConnectionState::Receiving,
            Ok(Event::Outgoing(Outgoing::Disconnect)) => ConnectionState::Disconnected,
            Ok(_) => self,
        }
    }
}

/// A received message and the packet to acknowledge once it is handled.
///
/// Acknowledgements are manual, so a delivery that is never acked is sent
/// again by the broker.
#[derive(Debug)]
pub struct Delivery {
    pub message: Message,
    publish: Publish,
}

impl Delivery {
    fn new(publish: Publish) -> Self {
        Self {
            message: Message::new(publish.topic.clone(), publish.payload.to_vec()),
            publish,
        }
    }
}

/// MQTT client builder, connects and hands over to the event loop task
pub struct MqttClientBuilder {
    client: AsyncClient,
    event_loop: EventLoop,
    topics: Vec<String>,
    connect_retries: u32,
    retry_delay: Duration,
    tx: mpsc::Sender<Delivery>,
    rx: mpsc::Receiver<Delivery>,
    state_tx: watch::Sender<ConnectionState>,
    state_rx: watch::Receiver<ConnectionState>,
}

/// Connected MQTT client delivering messages in broker order
pub struct MqttClient {
    client: AsyncClient,
    rx: mpsc::Receiver<Delivery>,
    state: watch::Receiver<ConnectionState>,
    handle: tokio::task::JoinHandle<Result<(), LakeError>>,
}

impl MqttClientBuilder {
    /// Create a new MQTT client
    pub fn new(config: &MqttConfig) -> Result<Self, LakeError> {
        config.validate()?;

        let mut mqtt_options = MqttOptions::new(&config.client_id, &config.host, config.port);
        mqtt_options.set_keep_alive(config.keep_alive);
        mqtt_options.set_clean_session(config.clean_session);
        mqtt_options.set_manual_acks(true);

        match config.transport {
            MqttTransport::Tcp => {}
            MqttTransport::Tls => {
                mqtt_options.set_transport(Transport::tls_with_default_config());
            }
            MqttTransport::Wss => {
                mqtt_options.set_transport(Transport::wss_with_default_config());
            }
        }

        if let Some((username, password)) = config.credentials() {
            mqtt_options.set_credentials(username, password);
        }

        let (client, event_loop) = AsyncClient::new(mqtt_options, CHANNEL_CAPACITY);
        let (tx, rx) = mpsc::channel(CHANNEL_CAPACITY);
        let (state_tx, state_rx) = watch::channel(ConnectionState::Disconnected);

        Ok(Self {
            client,
            event_loop,
            topics: config.topics.clone(),
            connect_retries: config.connect_retries,
            retry_delay: config.retry_delay,
            tx,
            rx,
            state_tx,
            state_rx,
        })
    }

    /// Connect to the broker and subscribe to topics.
    ///
    /// The first connection is retried with a fixed delay and is fatal once
    /// the retries run out. Later reconnects are left to the event loop.
    pub async fn connect(mut self) -> Result<MqttClient, LakeError> {
        let mut attempt = 0;
        self.state_tx.send_replace(ConnectionState::Connecting);

        loop {
            match self.event_loop.poll().await {
                Ok(Event::Incoming(Packet::ConnAck(_))) => {
                    info!("Connected to MQTT broker on attempt {}", attempt + 1);
                    break;
                }
                Ok(_) => continue,
                Err(e) => {
                    attempt += 1;
                    if attempt >= self.connect_retries {
                        error!(attempts = attempt, error = %e, "Giving up on MQTT broker");
                        return Err(LakeError::ConnectionError {
                            target: "MQTT broker",
                            attempts: attempt,
                            reason: e.to_string(),
                        });
                    }
                    warn!(
                        attempt,
                        max_attempts = self.connect_retries,
                        error = %e,
                        "MQTT broker not reachable, retrying in {:?}",
                        self.retry_delay
                    );
                    tokio::time::sleep(self.retry_delay).await;
                }
            }
        }

        self.state_tx.send_replace(ConnectionState::Connected);
        Self::subscribe(&self.client, &self.topics).await?;

        let handle = tokio::spawn(Self::process_events(
            self.tx,
            self.event_loop,
            self.client.clone(),
            self.topics,
            self.state_tx,
            self.retry_delay,
        ));

        Ok(MqttClient {
            client: self.client,
            rx: self.rx,
            state: self.state_rx,
            handle,
        })
    }

    async fn subscribe(client: &AsyncClient, topics: &[String]) -> Result<(), LakeError> {
        for topic in topics.iter() {
            info!("Subscribing to topic: {}", topic);
            client.subscribe(topic, QoS::AtLeastOnce).await?;
        }
        Ok(())
    }

    /// Process MQTT events
    ///
    /// `rumqttc` reconnects on the next poll after a connection error, but
    /// subscriptions need to be re-established, so every ConnAck triggers a
    /// subscribe. Publishes are forwarded in arrival order, unacknowledged.
    ///
    /// NOTE: If topic subscription fails, the loop will break and return an error.
    async fn process_events(
        tx: mpsc::Sender<Delivery>,
        mut event_loop: EventLoop,
        client: AsyncClient,
        topics: Vec<String>,
        state_tx: watch::Sender<ConnectionState>,
        retry_delay: Duration,
    ) -> Result<(), LakeError> {
        let mut state = *state_tx.borrow();

        loop {
            state = Self::transition(&state_tx, state, state.polling());
            let event = event_loop.poll().await;
            state = Self::transition(&state_tx, state, state.advance(&event));

            match event {
                Ok(Event::Incoming(Packet::ConnAck(_))) => {
                    info!("Reconnected to MQTT broker, subscribing to topics");
                    if let Err(e) = Self::subscribe(&client, &topics).await {
                        error!("Failed to subscribe: {}", e);
                        break Err(e);
                    }
                }
                Ok(Event::Incoming(Packet::Publish(publish))) => {
                    if tx.send(Delivery::new(publish)).await.is_err() {
                        debug!("Receiver closed, leaving message unacknowledged");
                    }
                }
                Ok(Event::Outgoing(Outgoing::Disconnect)) => {
                    info!("Disconnected from MQTT broker");
                    break Ok(());
                }
                Ok(_) => continue,
                Err(e) => {
                    warn!("MQTT connection lost: {}, reconnecting in {:?}", e, retry_delay);
                    tokio::time::sleep(retry_delay).await;
                }
            }
        }
    }

    fn transition(
        state_tx: &watch::Sender<ConnectionState>,
        from: ConnectionState,
        to: ConnectionState,
    ) -> ConnectionState {
        if from != to {
            debug!("MQTT connection state {:?} -> {:?}", from, to);
            state_tx.send_replace(to);
        }
        to
    }
}

impl MqttClient {
    /// Receive next message, `None` once the event loop has stopped
    pub async fn recv(&mut self) -> Option<Delivery> {
        self.rx.recv().await
    }

    /// Next message already queued, without waiting
    pub fn try_recv(&mut self) -> Option<Delivery> {
        self.rx.try_recv().ok()
    }

    /// Acknowledge a delivery to the broker
    pub async fn ack(&self, delivery: &Delivery) -> Result<(), LakeError> {
        self.client.ack(&delivery.publish).await?;
        Ok(())
    }

    /// Current connection state
    pub fn state(&self) -> ConnectionState {
        *self.state.borrow()
    }

    /// Wait for the next state change, `None` once the event loop is gone
    pub async fn state_changed(&mut self) -> Option<ConnectionState> {
        self.state.changed().await.ok()?;
        Some(*self.state.borrow_and_update())
    }

    /// Send DISCONNECT and wait for the event loop to wind down.
    ///
    /// Deliveries still queued are dropped unacknowledged.
    pub async fn disconnect(self) -> Result<(), LakeError> {
        let MqttClient {
            client,
            mut rx,
            handle,
            ..
        } = self;

        info!("Disconnecting from MQTT broker");
        if let Err(e) = client.disconnect().await {
            warn!("Could not request disconnect: {}", e);
        }
        rx.close();

        match tokio::time::timeout(DISCONNECT_TIMEOUT, handle).await {
            Ok(joined) => joined?,
            Err(_) => {
                warn!("MQTT event loop did not stop within {:?}", DISCONNECT_TIMEOUT);
                Ok(())
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rumqttc::{ConnAck, ConnectReturnCode, PubAck, Publish, SubAck, SubscribeReasonCode};

    fn connack() -> Result<Event, ConnectionError> {
        Ok(Event::Incoming(Packet::ConnAck(ConnAck::new(
            ConnectReturnCode::Success,
            false,
        ))))
    }

    fn suback() -> Result<Event, ConnectionError> {
        Ok(Event::Incoming(Packet::SubAck(SubAck::new(
            1,
            vec![SubscribeReasonCode::Success(QoS::AtLeastOnce)],
        ))))
    }

    fn publish() -> Result<Event, ConnectionError> {
        Ok(Event::Incoming(Packet::Publish(Publish::new(
            "lake/raw/int",
            QoS::AtLeastOnce,
            r#"{"value": 42}"#,
        ))))
    }

    #[test]
    fn state_follows_connection_lifecycle() {
        let state = ConnectionState::Disconnected.polling();
        assert_eq!(state, ConnectionState::Connecting);

        let state = state.advance(&connack());
        assert_eq!(state, ConnectionState::Connected);

        let state = state.advance(&suback());
        assert_eq!(state, ConnectionState::Subscribed);

        let state = state.advance(&publish());
        assert_eq!(state, ConnectionState::Receiving);

        let state = state.advance(&Ok(Event::Incoming(Packet::PubAck(PubAck::new(1)))));
        assert_eq!(state, ConnectionState::Receiving);
        assert_eq!(state.polling(), ConnectionState::Receiving);
    }

    #[test]
    fn connection_loss_then_reconnect() {
        let state = ConnectionState::Receiving.advance(&Err(ConnectionError::NetworkTimeout));
        assert_eq!(state, ConnectionState::Disconnected);

        let state = state.polling();
        assert_eq!(state, ConnectionState::Connecting);
        assert_eq!(state.advance(&connack()), ConnectionState::Connected);
    }

    #[test]
    fn suback_only_counts_after_connack() {
        assert_eq!(
            ConnectionState::Receiving.advance(&suback()),
            ConnectionState::Receiving
        );
    }

    #[test]
    fn outgoing_disconnect_ends_session() {
        assert_eq!(
            ConnectionState::Receiving.advance(&Ok(Event::Outgoing(Outgoing::Disconnect))),
            ConnectionState::Disconnected
        );
    }

    #[test]
    fn builder_rejects_invalid_config() {
        let config = MqttConfig {
            host: String::new(),
            port: 1883,
            client_id: "test".to_string(),
            username: None,
            password: None,
            topics: vec!["lake/raw/#".to_string()],
            transport: MqttTransport::Tcp,
            keep_alive: Duration::from_secs(60),
            connect_retries: 1,
            retry_delay: Duration::from_millis(10),
            clean_session: false,
        };

        assert!(matches!(
            MqttClientBuilder::new(&config),
            Err(LakeError::ConfigurationError { .. })
        ));
    }
}
