//! # Message Broker with Actor-based Architecture
//!
//! The reconciliation bus the server and every agent speak over. Topics are
//! `/`-separated; subscriptions use MQTT-style wildcards (`+` for one level,
//! `#` for the rest). The broker runs as an actor:
//!
//! - [`Broker`]: the public handle (cheap to clone, send commands to actor)
//! - `BrokerActor`: owns the subscription table, processes commands
//!   sequentially
//! - `BrokerCommand`: commands sent from handles to the actor
//!
//! Sequential command processing gives the ordering guarantee the protocol
//! leans on: messages published to one topic are delivered to each
//! subscriber in publish order, and per-host updates apply last-writer-wins
//! at the agent.
//!
//! A slow subscriber never stalls the bus: each subscription has a bounded
//! buffer and messages beyond it are dropped with a warning. The keepalive
//! republish corrects any host that missed an update this way.

use std::time::Duration;

use anyhow::{Context, Result};
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, warn};

/// Time allowed for a subscription to be set up before giving up.
pub const SUBSCRIBE_TIMEOUT: Duration = Duration::from_secs(30);

/// Time allowed for a publish to be accepted by the bus.
pub const WRITE_TIMEOUT: Duration = Duration::from_secs(60);

/// Grace period for a clean disconnect.
pub const DISCONNECT_GRACE: Duration = Duration::from_millis(250);

/// Retry interval while waiting for the bus to come up.
pub const CONNECT_RETRY: Duration = Duration::from_secs(2);

/// Total budget for connecting before startup aborts.
pub const CONNECT_BUDGET: Duration = Duration::from_secs(10);

/// Per-subscription message buffer.
const SUBSCRIPTION_BUFFER: usize = 256;

/// Command channel depth for the actor.
const COMMAND_BUFFER: usize = 1024;

/// One message on the bus.
#[derive(Debug, Clone)]
pub struct Message {
    pub topic: String,
    pub payload: Vec<u8>,
}

/// Does `pattern` match `topic`? `+` matches exactly one level, a trailing
/// `#` matches everything below.
pub fn topic_matches(pattern: &str, topic: &str) -> bool {
    let mut pattern_parts = pattern.split('/');
    let mut topic_parts = topic.split('/');
    loop {
        match (pattern_parts.next(), topic_parts.next()) {
            (Some("#"), _) => return true,
            (Some("+"), Some(_)) => {}
            (Some(p), Some(t)) if p == t => {}
            (None, None) => return true,
            _ => return false,
        }
    }
}

enum BrokerCommand {
    Publish {
        topic: String,
        payload: Vec<u8>,
    },
    Subscribe {
        pattern: String,
        reply: oneshot::Sender<mpsc::Receiver<Message>>,
    },
    Disconnect {
        reply: oneshot::Sender<()>,
    },
}

/// Public handle to the bus. Cheap to clone; all handles feed the same
/// actor.
#[derive(Clone)]
pub struct Broker {
    tx: mpsc::Sender<BrokerCommand>,
}

impl std::fmt::Debug for Broker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Broker")
            .field("connected", &self.is_connected())
            .finish()
    }
}

impl Broker {
    /// Start a broker actor and return a handle to it.
    pub fn new() -> Self {
        let (tx, rx) = mpsc::channel(COMMAND_BUFFER);
        let actor = BrokerActor {
            subscriptions: Vec::new(),
        };
        tokio::spawn(actor.run(rx));
        Self { tx }
    }

    pub fn is_connected(&self) -> bool {
        !self.tx.is_closed()
    }

    /// Publish a payload. Bounded by [`WRITE_TIMEOUT`].
    pub async fn publish(&self, topic: &str, payload: Vec<u8>) -> Result<()> {
        let command = BrokerCommand::Publish {
            topic: topic.to_string(),
            payload,
        };
        tokio::time::timeout(WRITE_TIMEOUT, self.tx.send(command))
            .await
            .context("broker write timed out")?
            .context("broker is disconnected")
    }

    /// Subscribe to a topic pattern. Bounded by [`SUBSCRIBE_TIMEOUT`].
    pub async fn subscribe(&self, pattern: &str) -> Result<mpsc::Receiver<Message>> {
        let (reply, rx) = oneshot::channel();
        let command = BrokerCommand::Subscribe {
            pattern: pattern.to_string(),
            reply,
        };
        tokio::time::timeout(SUBSCRIBE_TIMEOUT, async {
            self.tx
                .send(command)
                .await
                .context("broker is disconnected")?;
            rx.await.context("broker dropped subscription request")
        })
        .await
        .context("subscription setup timed out")?
    }

    /// Graceful disconnect: the actor drains queued commands, then stops.
    /// Waits at most [`DISCONNECT_GRACE`] for confirmation.
    pub async fn disconnect(&self) {
        let (reply, rx) = oneshot::channel();
        if self
            .tx
            .send(BrokerCommand::Disconnect { reply })
            .await
            .is_ok()
        {
            let _ = tokio::time::timeout(DISCONNECT_GRACE, rx).await;
        }
    }
}

impl Default for Broker {
    fn default() -> Self {
        Self::new()
    }
}

struct Subscription {
    pattern: String,
    tx: mpsc::Sender<Message>,
}

struct BrokerActor {
    subscriptions: Vec<Subscription>,
}

impl BrokerActor {
    async fn run(mut self, mut rx: mpsc::Receiver<BrokerCommand>) {
        while let Some(command) = rx.recv().await {
            match command {
                BrokerCommand::Publish { topic, payload } => {
                    self.deliver(&topic, payload);
                }
                BrokerCommand::Subscribe { pattern, reply } => {
                    let (tx, sub_rx) = mpsc::channel(SUBSCRIPTION_BUFFER);
                    self.subscriptions.push(Subscription { pattern, tx });
                    let _ = reply.send(sub_rx);
                }
                BrokerCommand::Disconnect { reply } => {
                    debug!("broker disconnecting");
                    // refuse new commands before confirming, so a publish
                    // racing the disconnect fails instead of vanishing
                    rx.close();
                    while let Some(pending) = rx.recv().await {
                        if let BrokerCommand::Publish { topic, payload } = pending {
                            self.deliver(&topic, payload);
                        }
                    }
                    let _ = reply.send(());
                    break;
                }
            }
            // prune subscriptions whose receivers are gone
            self.subscriptions.retain(|s| !s.tx.is_closed());
        }
    }

    fn deliver(&self, topic: &str, payload: Vec<u8>) {
        for sub in &self.subscriptions {
            if !topic_matches(&sub.pattern, topic) {
                continue;
            }
            let message = Message {
                topic: topic.to_string(),
                payload: payload.clone(),
            };
            if let Err(e) = sub.tx.try_send(message) {
                warn!(topic, pattern = %sub.pattern, error = %e, "dropping message for slow subscriber");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn wildcard_matching() {
        assert!(topic_matches("update/srv/#", "update/srv/node-1"));
        assert!(topic_matches("update/srv/#", "update/srv/a/b/c"));
        assert!(!topic_matches("update/srv/#", "update/other/node-1"));
        assert!(topic_matches("ping/+/node-1", "ping/srv/node-1"));
        assert!(!topic_matches("ping/+/node-1", "ping/srv/node-2"));
        assert!(topic_matches("a/b", "a/b"));
        assert!(!topic_matches("a/b", "a/b/c"));
    }

    #[tokio::test]
    async fn publish_reaches_matching_subscriber() {
        let broker = Broker::new();
        let mut rx = broker.subscribe("peers/host/#").await.unwrap();
        broker
            .publish("peers/host/h1/srv", b"update".to_vec())
            .await
            .unwrap();
        let msg = rx.recv().await.unwrap();
        assert_eq!(msg.topic, "peers/host/h1/srv");
        assert_eq!(msg.payload, b"update");
    }

    #[tokio::test]
    async fn non_matching_topic_is_not_delivered() {
        let broker = Broker::new();
        let mut rx = broker.subscribe("signal/srv/#").await.unwrap();
        broker.publish("metrics/srv/n1", b"x".to_vec()).await.unwrap();
        broker.publish("signal/srv/n1", b"y".to_vec()).await.unwrap();
        let msg = rx.recv().await.unwrap();
        assert_eq!(msg.topic, "signal/srv/n1");
    }

    #[tokio::test]
    async fn delivery_preserves_publish_order() {
        let broker = Broker::new();
        let mut rx = broker.subscribe("update/srv/#").await.unwrap();
        for i in 0u8..10 {
            broker
                .publish("update/srv/n1", vec![i])
                .await
                .unwrap();
        }
        for i in 0u8..10 {
            assert_eq!(rx.recv().await.unwrap().payload, vec![i]);
        }
    }

    #[tokio::test]
    async fn disconnect_stops_delivery() {
        let broker = Broker::new();
        let mut rx = broker.subscribe("a/#").await.unwrap();
        broker.disconnect().await;
        assert!(broker.publish("a/b", vec![]).await.is_err());
        assert!(rx.recv().await.is_none());
    }
}
