use log::{debug, error, info, warn};
use rumqttc::{AsyncClient, Event, EventLoop, LastWill, MqttOptions, Outgoing, Packet, QoS, Transport};
use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError, Weak};
use tokio::sync::mpsc;
use tokio::time::{sleep, timeout, Duration};

use crate::config::Config;
use crate::error::{ConsoleError, ConsoleResult};
use crate::notifications::Level;
use crate::router::MessageRouter;

const REQUEST_CHANNEL_CAPACITY: usize = 64;
const MAX_RETRY_INTERVAL: Duration = Duration::from_secs(60);
const OFFLINE_STATUS: &str = r#"{"status":"offline"}"#;
const ONLINE_STATUS: &str = r#"{"status":"online"}"#;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClientState {
    Disconnected,
    Connecting,
    Connected,
    Error(String),
}

impl ClientState {
    pub fn label(&self) -> &'static str {
        match self {
            ClientState::Disconnected => "disconnected",
            ClientState::Connecting => "connecting",
            ClientState::Connected => "connected",
            ClientState::Error(_) => "error",
        }
    }
}

/// Requests queued for the connection loop.
#[derive(Debug, PartialEq)]
pub enum SessionCommand {
    Publish {
        topic: String,
        payload: Vec<u8>,
        qos: QoS,
        retain: bool,
    },
    Subscribe {
        topic: String,
    },
    Unsubscribe {
        topic: String,
    },
    Disconnect,
}

pub type Outbox = mpsc::UnboundedReceiver<SessionCommand>;

enum SessionEnd {
    Shutdown,
    ConnectionLost { was_connected: bool },
}

/// The one broker session shared by every controller.
pub struct MqttService {
    client_state: Mutex<ClientState>,
    outbox: mpsc::UnboundedSender<SessionCommand>,
    subscriptions: Mutex<HashMap<String, usize>>,
    router: Arc<MessageRouter>,
    pub(crate) config: Config,
}

impl MqttService {
    pub fn new(config: Config, router: Arc<MessageRouter>) -> (Arc<Self>, Outbox) {
        let (outbox, outbox_rx) = mpsc::unbounded_channel();
        let service = Arc::new(Self {
            client_state: Mutex::new(ClientState::Disconnected),
            outbox,
            subscriptions: Mutex::new(HashMap::new()),
            router,
            config,
        });
        (service, outbox_rx)
    }

    pub fn state(&self) -> ClientState {
        self.client_state
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub(crate) fn set_state(&self, state: ClientState) {
        *self.client_state.lock().unwrap_or_else(PoisonError::into_inner) = state;
    }

    pub fn is_connected(&self) -> bool {
        self.state() == ClientState::Connected
    }

    /// Queues a publish. Fails with [`ConsoleError::NotConnected`] before
    /// anything is queued when the session is down.
    pub fn publish(&self, topic: &str, payload: &str, qos: QoS, retain: bool) -> ConsoleResult<()> {
        if !self.is_connected() {
            warn!("Refusing to publish to '{}': MQTT client is not connected.", topic);
            return Err(ConsoleError::NotConnected);
        }

        self.outbox
            .send(SessionCommand::Publish {
                topic: topic.to_string(),
                payload: payload.as_bytes().to_vec(),
                qos,
                retain,
            })
            .map_err(|_| ConsoleError::ChannelClosed)?;
        debug!("Message queued for '{}': {}", topic, payload);
        Ok(())
    }

    /// Holds a subscription on `topic` until the guard is dropped. The broker
    /// sees one SUBSCRIBE for the first holder and one UNSUBSCRIBE after the
    /// last. While the session is down nothing is queued; the next ConnAck
    /// subscribes every held topic.
    pub fn subscribe(self: &Arc<Self>, topic: &str) -> SubscriptionGuard {
        let first = {
            let mut subscriptions = self
                .subscriptions
                .lock()
                .unwrap_or_else(PoisonError::into_inner);
            let count = subscriptions.entry(topic.to_string()).or_insert(0);
            *count += 1;
            *count == 1
        };

        if first && self.is_connected() {
            debug!("Subscribing to '{}'.", topic);
            let _ = self.outbox.send(SessionCommand::Subscribe {
                topic: topic.to_string(),
            });
        }

        SubscriptionGuard {
            topic: topic.to_string(),
            service: Arc::downgrade(self),
        }
    }

    fn release(&self, topic: &str) {
        let last = {
            let mut subscriptions = self
                .subscriptions
                .lock()
                .unwrap_or_else(PoisonError::into_inner);
            match subscriptions.get_mut(topic) {
                Some(count) if *count > 1 => {
                    *count -= 1;
                    false
                }
                Some(_) => {
                    subscriptions.remove(topic);
                    true
                }
                None => false,
            }
        };

        if last && self.is_connected() {
            debug!("Unsubscribing from '{}'.", topic);
            let _ = self.outbox.send(SessionCommand::Unsubscribe {
                topic: topic.to_string(),
            });
        }
    }

    #[cfg(test)]
    pub fn subscription_count(&self, topic: &str) -> usize {
        self.subscriptions
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(topic)
            .copied()
            .unwrap_or(0)
    }

    /// One SUBSCRIBE per topic still held, sorted by topic.
    fn resubscriptions(&self) -> Vec<SessionCommand> {
        let mut topics: Vec<String> = self
            .subscriptions
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .keys()
            .cloned()
            .collect();
        topics.sort();
        topics
            .into_iter()
            .map(|topic| SessionCommand::Subscribe { topic })
            .collect()
    }

    pub fn shutdown(&self) {
        let _ = self.outbox.send(SessionCommand::Disconnect);
    }

    fn connected_key(&self) -> String {
        format!("connected:{}:{}", self.config.mqtt_host, self.config.mqtt_port)
    }

    fn build_options(&self, client_id: &str) -> MqttOptions {
        let mut mqtt_options = MqttOptions::new(client_id, &self.config.mqtt_host, self.config.mqtt_port);
        mqtt_options.set_keep_alive(Duration::from_secs(self.config.mqtt_keep_alive_secs.max(5)));
        mqtt_options.set_clean_session(true);
        mqtt_options.set_last_will(LastWill::new(
            &self.config.status_topic,
            OFFLINE_STATUS,
            QoS::AtLeastOnce,
            true,
        ));

        if !self.config.mqtt_username.is_empty() {
            mqtt_options.set_credentials(&self.config.mqtt_username, &self.config.mqtt_password);
        }

        if self.config.mqtt_ssl_enabled {
            mqtt_options.set_transport(Transport::tls_with_default_config());
        }

        mqtt_options
    }

    /// Connection loop. Reconnects with exponential backoff until a
    /// disconnect is requested or the retry budget is spent.
    pub async fn start(self: Arc<Self>, mut outbox_rx: Outbox, mqtt_client_id: String) {
        info!("Starting MQTT service...");

        let initial_retry_interval = Duration::from_millis(self.config.mqtt_retry_interval_ms);
        let max_retries = self.config.mqtt_max_retries;
        let mut retry_interval = initial_retry_interval;
        let mut retries = 0;

        loop {
            if max_retries >= 0 && retries > max_retries {
                error!("Maximum number of retries ({}) reached. Stopping the service.", max_retries);
                self.set_state(ClientState::Error("retry budget exhausted".to_string()));
                break;
            }

            debug!(
                "Configuring MQTT broker at {}:{}...",
                self.config.mqtt_host, self.config.mqtt_port
            );

            let (client, mut eventloop) =
                AsyncClient::new(self.build_options(&mqtt_client_id), REQUEST_CHANNEL_CAPACITY);
            self.set_state(ClientState::Connecting);

            match self.drive(&client, &mut eventloop, &mut outbox_rx).await {
                SessionEnd::Shutdown => {
                    self.set_state(ClientState::Disconnected);
                    info!("MQTT service stopped.");
                    break;
                }
                SessionEnd::ConnectionLost { was_connected } => {
                    if was_connected {
                        retries = 0;
                        retry_interval = initial_retry_interval;
                    }
                }
            }

            warn!("Lost connection to MQTT broker. Retrying in {:?}...", retry_interval);
            retries += 1;
            sleep(retry_interval).await;
            retry_interval = (retry_interval * 2).min(MAX_RETRY_INTERVAL);
        }
    }

    async fn drive(
        &self,
        client: &AsyncClient,
        eventloop: &mut EventLoop,
        outbox_rx: &mut Outbox,
    ) -> SessionEnd {
        let mut was_connected = false;

        loop {
            tokio::select! {
                event = eventloop.poll() => match event {
                    Ok(Event::Incoming(Packet::ConnAck(_))) => {
                        info!("Connected to MQTT broker.");
                        was_connected = true;
                        self.set_state(ClientState::Connected);
                        // Clean sessions forget subscriptions across reconnects.
                        for command in self.resubscriptions() {
                            forward(client, command);
                        }
                        // Toast once per broker, not on every reconnect or restart.
                        self.router.notifier().notify_once(
                            &self.connected_key(),
                            Level::Success,
                            format!("Connected to {}:{}", self.config.mqtt_host, self.config.mqtt_port),
                        );
                        // Overwrites the retained last-will message.
                        if let Err(e) = client.try_publish(&self.config.status_topic, QoS::AtLeastOnce, true, ONLINE_STATUS) {
                            warn!("Failed to publish online status: {:?}", e);
                        }
                    }
                    Ok(Event::Incoming(Packet::Publish(publish))) => {
                        self.router.dispatch(&publish.topic, &publish.payload);
                    }
                    Ok(_) => {}
                    Err(e) => {
                        error!("Error in MQTT event loop: {:?}", e);
                        self.set_state(ClientState::Error(e.to_string()));
                        return SessionEnd::ConnectionLost { was_connected };
                    }
                },
                command = outbox_rx.recv() => match command {
                    Some(SessionCommand::Disconnect) | None => {
                        self.disconnect(client, eventloop).await;
                        return SessionEnd::Shutdown;
                    }
                    Some(command) => forward(client, command),
                },
            }
        }
    }

    async fn disconnect(&self, client: &AsyncClient, eventloop: &mut EventLoop) {
        if client.try_disconnect().is_err() {
            return;
        }
        // Poll until the DISCONNECT packet is flushed.
        let flushed = timeout(Duration::from_secs(1), async {
            loop {
                match eventloop.poll().await {
                    Ok(Event::Outgoing(Outgoing::Disconnect)) | Err(_) => break,
                    Ok(_) => {}
                }
            }
        })
        .await;
        if flushed.is_err() {
            warn!("Timed out flushing MQTT disconnect.");
        }
    }
}

fn forward(client: &AsyncClient, command: SessionCommand) {
    let result = match command {
        SessionCommand::Publish {
            topic,
            payload,
            qos,
            retain,
        } => client.try_publish(topic, qos, retain, payload),
        SessionCommand::Subscribe { topic } => client.try_subscribe(topic, QoS::AtLeastOnce),
        SessionCommand::Unsubscribe { topic } => client.try_unsubscribe(topic),
        SessionCommand::Disconnect => Ok(()),
    };

    if let Err(e) = result {
        error!("Failed to hand request to MQTT client: {:?}", e);
    }
}

/// Keeps a topic subscribed while alive.
pub struct SubscriptionGuard {
    topic: String,
    service: Weak<MqttService>,
}

impl Drop for SubscriptionGuard {
    fn drop(&mut self) {
        if let Some(service) = self.service.upgrade() {
            service.release(&self.topic);
        }
    }
}
