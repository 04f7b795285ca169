/// Production transport backed by rumqttc's MQTT 5.0 client
///
/// One background task owns the rumqttc event loop: it forwards inbound
/// publishes into the session's message stream, captures the CONNACK for
/// the connecting caller, and paces reconnect attempts after a connection
/// loss. Everything else is a thin mapping onto the async client handle.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use rumqttc::v5::mqttbytes::v5::{
    ConnAck, ConnectProperties, ConnectReturnCode, Filter, LastWill, Packet, PublishProperties,
};
use rumqttc::v5::mqttbytes::QoS as MqttQoS;
use rumqttc::v5::{AsyncClient, Event, MqttOptions};
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, warn};

use super::{
    ConnackInfo, ConnectOptions, InboundMessage, MqttTransport, PublishOptions, QoS,
    SubscribeOptions, TransportError,
};
use crate::config::MqttConfig;

use async_trait::async_trait;

/// MQTT 5.0 transport session over rumqttc
pub struct RumqttcTransport {
    config: MqttConfig,
    client_id: String,
    client: Mutex<Option<AsyncClient>>,
    shutdown: Arc<AtomicBool>,
}

impl RumqttcTransport {
    /// Create a transport for the given MQTT client id. No network
    /// activity happens until [`MqttTransport::connect`] is called.
    pub fn new(config: MqttConfig, client_id: impl Into<String>) -> Self {
        Self {
            config,
            client_id: client_id.into(),
            client: Mutex::new(None),
            shutdown: Arc::new(AtomicBool::new(false)),
        }
    }

    fn handle(&self) -> Result<AsyncClient, TransportError> {
        self.client
            .lock()
            .ok()
            .and_then(|guard| guard.clone())
            .ok_or(TransportError::NotConnected)
    }
}

#[async_trait]
impl MqttTransport for RumqttcTransport {
    async fn connect(
        &self,
        options: ConnectOptions,
    ) -> Result<(ConnackInfo, mpsc::UnboundedReceiver<InboundMessage>), TransportError> {
        let address = self
            .config
            .broker_address()
            .map_err(|e| TransportError::Connect(e.to_string()))?;

        let mut mqtt_options =
            MqttOptions::new(self.client_id.clone(), address.host.clone(), address.port);
        if address.tls {
            mqtt_options.set_transport(rumqttc::Transport::tls_with_default_config());
        }
        mqtt_options.set_keep_alive(self.config.keepalive);
        mqtt_options.set_clean_start(self.config.clean_start);
        if let (Some(username), Some(password)) =
            (self.config.username.clone(), self.config.password.clone())
        {
            mqtt_options.set_credentials(username, password);
        }

        // MQTT 5.0 with session expiry 0: presence and subscriptions must
        // not outlive the session.
        let mut connect_properties = ConnectProperties::default();
        connect_properties.session_expiry_interval = Some(0);
        connect_properties.user_properties = options.user_properties.clone();
        mqtt_options.set_connect_properties(connect_properties);

        if let Some(will) = &options.will {
            mqtt_options.set_last_will(LastWill::new(
                will.topic.clone(),
                will.payload.clone(),
                to_mqtt_qos(will.qos),
                will.retain,
                None,
            ));
        }

        let (client, mut event_loop) = AsyncClient::new(mqtt_options, 64);

        let (message_tx, message_rx) = mpsc::unbounded_channel();
        let (connack_tx, connack_rx) = oneshot::channel();

        let shutdown = Arc::clone(&self.shutdown);
        shutdown.store(false, Ordering::SeqCst);
        let reconnect_period = self.config.reconnect_period;
        let client_id = self.client_id.clone();

        tokio::spawn(async move {
            let mut connack_tx = Some(connack_tx);
            loop {
                match event_loop.poll().await {
                    Ok(Event::Incoming(Packet::ConnAck(ack))) => {
                        if ack.code != ConnectReturnCode::Success {
                            warn!(client_id = %client_id, code = ?ack.code, "broker refused connection");
                            if let Some(tx) = connack_tx.take() {
                                let _ = tx.send(Err(TransportError::Connect(format!(
                                    "broker refused connection: {:?}",
                                    ack.code
                                ))));
                            }
                            break;
                        }
                        if let Some(tx) = connack_tx.take() {
                            if tx.send(Ok(connack_info(&ack))).is_err() {
                                // Caller abandoned the connect
                                break;
                            }
                        } else {
                            debug!(client_id = %client_id, "reconnected to broker");
                        }
                    }
                    Ok(Event::Incoming(Packet::Publish(publish))) => {
                        let message = InboundMessage {
                            topic: String::from_utf8_lossy(&publish.topic).into_owned(),
                            payload: publish.payload.to_vec(),
                            user_properties: publish
                                .properties
                                .map(|p| p.user_properties)
                                .unwrap_or_default(),
                        };
                        if message_tx.send(message).is_err() {
                            // Receiver dropped, session is over
                            break;
                        }
                    }
                    Ok(_) => {}
                    Err(err) => {
                        if shutdown.load(Ordering::SeqCst) {
                            break;
                        }
                        warn!(client_id = %client_id, error = %err, "connection lost, retrying");
                        tokio::time::sleep(reconnect_period).await;
                    }
                }
            }
        });

        if let Ok(mut guard) = self.client.lock() {
            *guard = Some(client);
        }

        let connack = match tokio::time::timeout(self.config.connect_timeout, connack_rx).await {
            Ok(Ok(result)) => result?,
            Ok(Err(_)) => {
                self.shutdown.store(true, Ordering::SeqCst);
                return Err(TransportError::Connect(
                    "connection task exited before CONNACK".to_string(),
                ));
            }
            Err(_) => {
                self.shutdown.store(true, Ordering::SeqCst);
                return Err(TransportError::Connect(format!(
                    "no CONNACK within {:?}",
                    self.config.connect_timeout
                )));
            }
        };

        Ok((connack, message_rx))
    }

    async fn disconnect(&self) -> Result<(), TransportError> {
        let client = {
            let mut guard = self
                .client
                .lock()
                .map_err(|_| TransportError::Disconnect("client lock poisoned".to_string()))?;
            guard.take()
        };
        self.shutdown.store(true, Ordering::SeqCst);
        if let Some(client) = client {
            client
                .disconnect()
                .await
                .map_err(|e| TransportError::Disconnect(e.to_string()))?;
        }
        Ok(())
    }

    async fn subscribe(
        &self,
        filter: &str,
        options: SubscribeOptions,
    ) -> Result<(), TransportError> {
        let client = self.handle()?;
        let mut subscription = Filter::new(filter, to_mqtt_qos(options.qos));
        subscription.nolocal = options.no_local;
        client
            .subscribe_many(vec![subscription])
            .await
            .map_err(|e| TransportError::Subscribe(e.to_string()))
    }

    async fn unsubscribe(&self, filter: &str) -> Result<(), TransportError> {
        let client = self.handle()?;
        client
            .unsubscribe(filter)
            .await
            .map_err(|e| TransportError::Unsubscribe(e.to_string()))
    }

    async fn publish(
        &self,
        topic: &str,
        payload: Vec<u8>,
        options: PublishOptions,
    ) -> Result<(), TransportError> {
        let client = self.handle()?;
        let mut properties = PublishProperties::default();
        properties.user_properties = options.user_properties;
        client
            .publish_with_properties(
                topic,
                to_mqtt_qos(options.qos),
                options.retain,
                payload,
                properties,
            )
            .await
            .map_err(|e| TransportError::Publish(e.to_string()))
    }
}

fn connack_info(ack: &ConnAck) -> ConnackInfo {
    ConnackInfo {
        session_present: ack.session_present,
        user_properties: ack
            .properties
            .as_ref()
            .map(|p| p.user_properties.clone())
            .unwrap_or_default(),
    }
}

fn to_mqtt_qos(qos: QoS) -> MqttQoS {
    match qos {
        QoS::AtMostOnce => MqttQoS::AtMostOnce,
        QoS::AtLeastOnce => MqttQoS::AtLeastOnce,
        QoS::ExactlyOnce => MqttQoS::ExactlyOnce,
    }
}
