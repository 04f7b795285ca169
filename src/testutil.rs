/// In-process MQTT broker for tests
///
/// Implements just enough of MQTT 5.0 for both peers to run end-to-end
/// without a network: wildcard topic filters, retained messages, the
/// No-Local subscription option, per-session last-wills, and CONNACK user
/// properties. Every publish is also recorded so tests can assert on wire
/// traffic.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use tokio::sync::mpsc;

use crate::topics::filter_matches;
use crate::transport::{
    ConnackInfo, ConnectOptions, InboundMessage, MqttTransport, PublishOptions, SubscribeOptions,
    TransportError, WillConfig,
};

/// One recorded publish, as the broker saw it
#[derive(Debug, Clone)]
pub struct PublishRecord {
    pub publisher: String,
    pub topic: String,
    pub payload: Vec<u8>,
    pub retain: bool,
    pub user_properties: Vec<(String, String)>,
}

#[derive(Clone)]
struct StoredMessage {
    payload: Vec<u8>,
    user_properties: Vec<(String, String)>,
}

struct Subscription {
    filter: String,
    no_local: bool,
}

struct Session {
    subscriptions: Vec<Subscription>,
    sender: mpsc::UnboundedSender<InboundMessage>,
    will: Option<WillConfig>,
}

#[derive(Default)]
struct BrokerInner {
    sessions: HashMap<String, Session>,
    retained: HashMap<String, StoredMessage>,
    connack_properties: Vec<(String, String)>,
    log: Vec<PublishRecord>,
}

/// Shared in-memory broker; clone handles freely
#[derive(Clone, Default)]
pub struct MemoryBroker {
    inner: Arc<Mutex<BrokerInner>>,
}

impl MemoryBroker {
    pub fn new() -> Self {
        Self::default()
    }

    /// User properties returned in every CONNACK (e.g. broker suggestions)
    pub fn set_connack_properties(&self, properties: Vec<(String, String)>) {
        if let Ok(mut inner) = self.inner.lock() {
            inner.connack_properties = properties;
        }
    }

    /// Create a transport bound to this broker under the given client id
    pub fn transport(&self, client_id: impl Into<String>) -> MemoryTransport {
        MemoryTransport {
            broker: self.clone(),
            client_id: client_id.into(),
        }
    }

    /// Simulate an ungraceful connection loss: the session is removed and
    /// its last-will is published
    pub fn drop_session(&self, client_id: &str) {
        let will = {
            let mut inner = match self.inner.lock() {
                Ok(inner) => inner,
                Err(_) => return,
            };
            inner
                .sessions
                .remove(client_id)
                .and_then(|session| session.will)
        };
        if let Some(will) = will {
            self.publish_from(
                client_id,
                &will.topic,
                will.payload,
                PublishOptions {
                    qos: will.qos,
                    retain: will.retain,
                    user_properties: Vec::new(),
                },
            );
        }
    }

    /// The current retained payload on a topic, if any
    pub fn retained_payload(&self, topic: &str) -> Option<Vec<u8>> {
        self.inner
            .lock()
            .ok()
            .and_then(|inner| inner.retained.get(topic).map(|stored| stored.payload.clone()))
    }

    /// Every publish the broker has accepted, in order
    pub fn publishes(&self) -> Vec<PublishRecord> {
        self.inner
            .lock()
            .map(|inner| inner.log.clone())
            .unwrap_or_default()
    }

    /// Active subscription filters of a session
    pub fn subscriptions(&self, client_id: &str) -> Vec<String> {
        self.inner
            .lock()
            .ok()
            .and_then(|inner| {
                inner.sessions.get(client_id).map(|session| {
                    session
                        .subscriptions
                        .iter()
                        .map(|sub| sub.filter.clone())
                        .collect()
                })
            })
            .unwrap_or_default()
    }

    fn connect_session(
        &self,
        client_id: &str,
        will: Option<WillConfig>,
    ) -> Result<(ConnackInfo, mpsc::UnboundedReceiver<InboundMessage>), TransportError> {
        let (sender, receiver) = mpsc::unbounded_channel();
        let mut inner = self
            .inner
            .lock()
            .map_err(|_| TransportError::Connect("broker lock poisoned".to_string()))?;
        inner.sessions.insert(
            client_id.to_string(),
            Session {
                subscriptions: Vec::new(),
                sender,
                will,
            },
        );
        let connack = ConnackInfo {
            session_present: false,
            user_properties: inner.connack_properties.clone(),
        };
        Ok((connack, receiver))
    }

    /// Graceful disconnect discards the will
    fn disconnect_session(&self, client_id: &str) {
        if let Ok(mut inner) = self.inner.lock() {
            inner.sessions.remove(client_id);
        }
    }

    fn subscribe(&self, client_id: &str, filter: &str, no_local: bool) {
        let retained: Vec<(String, StoredMessage)> = {
            let mut inner = match self.inner.lock() {
                Ok(inner) => inner,
                Err(_) => return,
            };
            if let Some(session) = inner.sessions.get_mut(client_id) {
                session.subscriptions.retain(|sub| sub.filter != filter);
                session.subscriptions.push(Subscription {
                    filter: filter.to_string(),
                    no_local,
                });
            }
            inner
                .retained
                .iter()
                .filter(|(topic, _)| filter_matches(filter, topic))
                .map(|(topic, stored)| (topic.clone(), stored.clone()))
                .collect()
        };
        // Retained messages are delivered on subscribe
        if let Ok(inner) = self.inner.lock() {
            if let Some(session) = inner.sessions.get(client_id) {
                for (topic, stored) in retained {
                    let _ = session.sender.send(InboundMessage {
                        topic,
                        payload: stored.payload,
                        user_properties: stored.user_properties,
                    });
                }
            }
        }
    }

    fn unsubscribe(&self, client_id: &str, filter: &str) {
        if let Ok(mut inner) = self.inner.lock() {
            if let Some(session) = inner.sessions.get_mut(client_id) {
                session.subscriptions.retain(|sub| sub.filter != filter);
            }
        }
    }

    fn publish_from(
        &self,
        publisher: &str,
        topic: &str,
        payload: Vec<u8>,
        options: PublishOptions,
    ) {
        let mut inner = match self.inner.lock() {
            Ok(inner) => inner,
            Err(_) => return,
        };
        inner.log.push(PublishRecord {
            publisher: publisher.to_string(),
            topic: topic.to_string(),
            payload: payload.clone(),
            retain: options.retain,
            user_properties: options.user_properties.clone(),
        });

        if options.retain {
            if payload.is_empty() {
                // Retained-empty clears the slot
                inner.retained.remove(topic);
            } else {
                inner.retained.insert(
                    topic.to_string(),
                    StoredMessage {
                        payload: payload.clone(),
                        user_properties: options.user_properties.clone(),
                    },
                );
            }
        }

        for (session_id, session) in inner.sessions.iter() {
            let matched = session.subscriptions.iter().find(|sub| {
                filter_matches(&sub.filter, topic) && !(sub.no_local && session_id == publisher)
            });
            if matched.is_some() {
                let _ = session.sender.send(InboundMessage {
                    topic: topic.to_string(),
                    payload: payload.clone(),
                    user_properties: options.user_properties.clone(),
                });
            }
        }
    }
}

/// Transport bound to a [`MemoryBroker`] session
pub struct MemoryTransport {
    broker: MemoryBroker,
    client_id: String,
}

#[async_trait]
impl MqttTransport for MemoryTransport {
    async fn connect(
        &self,
        options: ConnectOptions,
    ) -> Result<(ConnackInfo, mpsc::UnboundedReceiver<InboundMessage>), TransportError> {
        self.broker.connect_session(&self.client_id, options.will)
    }

    async fn disconnect(&self) -> Result<(), TransportError> {
        self.broker.disconnect_session(&self.client_id);
        Ok(())
    }

    async fn subscribe(
        &self,
        filter: &str,
        options: SubscribeOptions,
    ) -> Result<(), TransportError> {
        self.broker
            .subscribe(&self.client_id, filter, options.no_local);
        Ok(())
    }

    async fn unsubscribe(&self, filter: &str) -> Result<(), TransportError> {
        self.broker.unsubscribe(&self.client_id, filter);
        Ok(())
    }

    async fn publish(
        &self,
        topic: &str,
        payload: Vec<u8>,
        options: PublishOptions,
    ) -> Result<(), TransportError> {
        self.broker
            .publish_from(&self.client_id, topic, payload, options);
        Ok(())
    }
}
