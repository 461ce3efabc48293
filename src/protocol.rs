//! Newline-delimited JSON protocol spoken by the TCP server.

use crate::bridge::PublishedMessage;
use crate::gateway::{status_message, DeviceView, SignalInfo, WriteOutcome};
use crate::hub::{Notification, SubscriptionId};
use crate::signal::{Sample, SignalKey, StatusCode, Value};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use thiserror::Error;

pub const MAX_REQUEST_SIZE: usize = 1024;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Request {
    pub id: u32,
    #[serde(default)]
    pub timestamp: u64,
    pub request_type: RequestType,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum RequestType {
    Ping,
    Browse,
    Read {
        signal: String,
    },
    /// Strictly typed write: the JSON value must match the signal type.
    Write {
        signal: String,
        value: Value,
    },
    /// Dashboard entry point: loosely typed value (`"ON"`, `"220.5"`, ...).
    DashboardWrite {
        signal: String,
        value: serde_json::Value,
    },
    HistoryRead {
        signal: String,
        #[serde(default)]
        start_time: Option<u64>,
        #[serde(default)]
        end_time: Option<u64>,
        /// 0 = no limit
        #[serde(default)]
        max_count: usize,
    },
    /// Dashboard history: every signal over one window.
    HistoryAll {
        #[serde(default)]
        start_time: Option<u64>,
        #[serde(default)]
        end_time: Option<u64>,
        #[serde(default)]
        max_count: usize,
    },
    Subscribe {
        signal: String,
        #[serde(default)]
        sampling_interval_ms: Option<u64>,
        #[serde(default)]
        queue_depth: Option<usize>,
        #[serde(default)]
        discard_oldest: Option<bool>,
    },
    Unsubscribe {
        subscription_id: SubscriptionId,
    },
    Snapshot,
    Devices,
    ResetHistory,
    MonitorBridge,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum ResponsePayload {
    Pong,
    Signals(Vec<SignalInfo>),
    Sample(Sample),
    History(Vec<Sample>),
    HistoryAll(BTreeMap<SignalKey, Vec<Sample>>),
    Write(WriteOutcome),
    Subscription {
        subscription_id: SubscriptionId,
        signal: SignalKey,
        sampling_interval_ms: u64,
        queue_depth: usize,
        discard_oldest: bool,
    },
    Snapshot(BTreeMap<SignalKey, Sample>),
    Devices(Vec<DeviceView>),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Response {
    pub id: u32,
    pub timestamp: u64,
    pub status: StatusCode,
    pub message: Option<String>,
    pub payload: Option<ResponsePayload>,
}

impl Response {
    pub fn new(id: u32, timestamp: u64, status: StatusCode, payload: Option<ResponsePayload>) -> Self {
        let message = (!status.is_good()).then(|| status_message(status));
        Self {
            id,
            timestamp,
            status,
            message,
            payload,
        }
    }

    pub fn with_message(mut self, message: impl Into<String>) -> Self {
        self.message = Some(message.into());
        self
    }

    pub fn with_payload(mut self, payload: ResponsePayload) -> Self {
        self.payload = Some(payload);
        self
    }
}

/// One line sent by the server.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum ServerMessage {
    Response(Response),
    Notification(Notification),
    Published(PublishedMessage),
}

#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("Message exceeds {} bytes", MAX_REQUEST_SIZE)]
    MessageTooLarge,
    #[error("Invalid JSON: {0}")]
    InvalidJson(#[source] serde_json::Error),
    #[error("Serialization failed: {0}")]
    Serialization(#[source] serde_json::Error),
}

#[derive(Debug, Default)]
pub struct ProtocolHandler {
    requests_parsed: u64,
    requests_rejected: u64,
}

impl ProtocolHandler {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn parse_request(&mut self, line: &str) -> Result<Request, ProtocolError> {
        if line.len() > MAX_REQUEST_SIZE {
            self.requests_rejected += 1;
            return Err(ProtocolError::MessageTooLarge);
        }
        match serde_json::from_str::<Request>(line) {
            Ok(request) => {
                self.requests_parsed += 1;
                Ok(request)
            }
            Err(e) => {
                self.requests_rejected += 1;
                Err(ProtocolError::InvalidJson(e))
            }
        }
    }

    /// Serialized line without the trailing newline.
    pub fn encode(&self, message: &ServerMessage) -> Result<String, ProtocolError> {
        serde_json::to_string(message).map_err(ProtocolError::Serialization)
    }

    /// Response for a line that could not be decoded. Id 0: the request id is unknown.
    pub fn decoding_error(&self, timestamp: u64, error: &ProtocolError) -> Response {
        Response::new(0, timestamp, StatusCode::BadDecodingError, None)
            .with_message(format!("Invalid request: {}", error))
    }

    pub fn requests_parsed(&self) -> u64 {
        self.requests_parsed
    }

    pub fn requests_rejected(&self) -> u64 {
        self.requests_rejected
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_unit_request() {
        let mut handler = ProtocolHandler::new();
        let request = handler.parse_request(r#"{"id":1,"request_type":"Ping"}"#).unwrap();
        assert_eq!(request.request_type, RequestType::Ping);
        assert_eq!(request.timestamp, 0);
    }

    #[test]
    fn test_history_defaults() {
        let mut handler = ProtocolHandler::new();
        let line = r#"{"id":2,"timestamp":5,"request_type":{"HistoryRead":{"signal":"Device1_Voltage"}}}"#;
        match handler.parse_request(line).unwrap().request_type {
            RequestType::HistoryRead {
                signal,
                start_time,
                end_time,
                max_count,
            } => {
                assert_eq!(signal, "Device1_Voltage");
                assert_eq!((start_time, end_time, max_count), (None, None, 0));
            }
            other => panic!("unexpected request {:?}", other),
        }
    }

    #[test]
    fn test_oversized_request_rejected() {
        let mut handler = ProtocolHandler::new();
        let line = format!(r#"{{"id":1,"request_type":{{"Read":{{"signal":"{}"}}}}}}"#, "x".repeat(MAX_REQUEST_SIZE));
        assert!(matches!(handler.parse_request(&line), Err(ProtocolError::MessageTooLarge)));
        assert_eq!(handler.requests_rejected(), 1);
    }

    #[test]
    fn test_bad_status_carries_message() {
        let response = Response::new(3, 0, StatusCode::BadNotWritable, None);
        assert_eq!(response.message.as_deref(), Some("BadNotWritable: The signal is read-only"));
        assert!(Response::new(3, 0, StatusCode::Good, None).message.is_none());
    }
}
