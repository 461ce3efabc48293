//! Periodic publisher of one designated signal, shaped as a JSON pub/sub
//! network message. Broker transport is someone else's job; messages go out
//! on a broadcast channel.

use crate::config::BridgeConfig;
use crate::gateway::AccessGateway;
use crate::signal::{signal_key, SignalKey, StatusCode, Value};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::time::Duration;
use tokio::sync::{broadcast, watch};
use tokio::time::{self, MissedTickBehavior};
use tracing::{debug, info};

pub const MESSAGE_TYPE_DATA: &str = "ua-data";
pub const BRIDGE_BROADCAST_BUFFER_SIZE: usize = 256;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct DataSetMessage {
    pub data_set_writer_id: u16,
    pub sequence_number: u32,
    pub timestamp: u64,
    pub status: StatusCode,
    pub payload: BTreeMap<String, Value>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct NetworkMessage {
    pub message_id: String,
    pub message_type: String,
    pub publisher_id: String,
    pub messages: Vec<DataSetMessage>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PublishedMessage {
    pub topic: String,
    pub message: NetworkMessage,
}

pub struct PubSubBridge {
    gateway: AccessGateway,
    signal: SignalKey,
    topic: String,
    publisher_id: String,
    writer_id: u16,
    sequence: u32,
}

impl PubSubBridge {
    /// `None` when the configured signal is not registered.
    pub fn new(gateway: AccessGateway, config: &BridgeConfig) -> Option<Self> {
        let signal = signal_key(&config.signal)?;
        if !gateway.store().contains(&signal) {
            return None;
        }
        Some(Self {
            gateway,
            signal,
            topic: config.topic.clone(),
            publisher_id: config.publisher_id.clone(),
            writer_id: config.writer_id,
            sequence: 0,
        })
    }

    pub fn signal(&self) -> SignalKey {
        self.signal
    }

    /// Builds the next message from a fresh snapshot; `None` until the
    /// designated signal has a value.
    pub fn next_message(&mut self) -> Option<PublishedMessage> {
        let snapshot = self.gateway.publish_snapshot();
        let sample = snapshot.get(&self.signal)?;
        let value = sample.value?;

        self.sequence = self.sequence.wrapping_add(1);
        let mut payload = BTreeMap::new();
        payload.insert(self.signal.to_string(), value);

        Some(PublishedMessage {
            topic: self.topic.clone(),
            message: NetworkMessage {
                message_id: format!("{}-{}", self.publisher_id, self.sequence),
                message_type: MESSAGE_TYPE_DATA.to_string(),
                publisher_id: self.publisher_id.clone(),
                messages: vec![DataSetMessage {
                    data_set_writer_id: self.writer_id,
                    sequence_number: self.sequence,
                    timestamp: sample.source_timestamp,
                    status: sample.status,
                    payload,
                }],
            },
        })
    }

    pub async fn run(
        mut self,
        period: Duration,
        sink: broadcast::Sender<PublishedMessage>,
        mut shutdown: watch::Receiver<bool>,
    ) {
        let mut interval = time::interval(period);
        interval.set_missed_tick_behavior(MissedTickBehavior::Skip);
        info!("Bridge publishing {} to {} every {} ms", self.signal, self.topic, period.as_millis());

        loop {
            tokio::select! {
                _ = interval.tick() => {
                    if let Some(message) = self.next_message() {
                        if sink.send(message).is_err() {
                            debug!("No bridge listeners for {}", self.topic);
                        }
                    }
                }
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
            }
        }

        info!("Bridge stopped after {} messages", self.sequence);
    }
}
