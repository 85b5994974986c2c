//! Messages exchanged with subscription workers, and the in-process frame
//! transport that carries them.
//!
//! Every frame is one JSON document. A frame holding only `\r\n` is a
//! heartbeat. The first frame from the client is its
//! [`SubscriptionWorkerOptions`](super::SubscriptionWorkerOptions).

use crate::error::{Result, SubscriptionError};
use crate::types::NodeTag;
use crossbeam_channel::{unbounded, Receiver, RecvTimeoutError, Sender};
use parking_lot::Mutex;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::collections::BTreeMap;
use std::time::Duration;

pub const HEARTBEAT: &[u8] = b"\r\n";

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "Type")]
pub enum ClientMessage {
    Acknowledge {
        #[serde(rename = "ChangeVector")]
        change_vector: Option<String>,
    },
    DisposedNotification,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum MessageType {
    ConnectionStatus,
    Confirm,
    Error,
    EndOfBatch,
    Data,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum ConnectionStatus {
    Accepted,
    NotFound,
    Closed,
    Invalid,
    InUse,
    Redirect,
    ConcurrencyReconnect,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct ServerMessage {
    #[serde(rename = "Type")]
    pub kind: MessageType,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<ConnectionStatus>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub exception: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

impl ServerMessage {
    fn of(kind: MessageType) -> Self {
        Self {
            kind,
            status: None,
            message: None,
            exception: None,
            data: None,
        }
    }

    pub fn accepted() -> Self {
        Self {
            status: Some(ConnectionStatus::Accepted),
            ..Self::of(MessageType::ConnectionStatus)
        }
    }

    pub fn confirm() -> Self {
        Self::of(MessageType::Confirm)
    }

    pub fn end_of_batch() -> Self {
        Self::of(MessageType::EndOfBatch)
    }

    pub fn data(data: Value, exception: Option<String>) -> Self {
        Self {
            data: Some(data),
            exception,
            ..Self::of(MessageType::Data)
        }
    }

    /// The final message describing why a connection ended.
    pub fn from_error(error: &SubscriptionError, current_tag: &NodeTag) -> Self {
        let status = match error.connection_status() {
            Some(status) => status,
            None => {
                return Self {
                    message: Some(error.to_string()),
                    exception: Some(format!("{:?}", error)),
                    ..Self::of(MessageType::Error)
                }
            }
        };

        let data = match error {
            SubscriptionError::Closed {
                can_reconnect,
                no_docs_left,
                ..
            } => Some(json!({
                "CanReconnect": can_reconnect,
                "NoDocsLeft": no_docs_left,
            })),
            SubscriptionError::DoesNotBelongToNode {
                appropriate_node,
                reasons,
                ..
            } => Some(json!({
                "RedirectedTag": appropriate_node.as_ref().map(|tag| tag.as_str()),
                "CurrentTag": current_tag.as_str(),
                "Reasons": reasons,
            })),
            _ => None,
        };

        Self {
            status: Some(status),
            message: Some(error.to_string()),
            data,
            ..Self::of(MessageType::ConnectionStatus)
        }
    }

    /// Turn a status or error message back into the error it reports.
    /// `Accepted` and non-status messages yield `None`.
    pub fn to_error(&self) -> Option<SubscriptionError> {
        let message = self.message.clone().unwrap_or_default();
        if self.kind == MessageType::Error {
            return Some(SubscriptionError::InvalidOperation(message));
        }
        if self.kind != MessageType::ConnectionStatus {
            return None;
        }

        let flag = |name: &str| {
            self.data
                .as_ref()
                .and_then(|data| data.get(name))
                .and_then(Value::as_bool)
                .unwrap_or(false)
        };

        match self.status? {
            ConnectionStatus::Accepted => None,
            ConnectionStatus::NotFound => Some(SubscriptionError::DoesNotExist(message)),
            ConnectionStatus::Closed => Some(SubscriptionError::Closed {
                message,
                can_reconnect: flag("CanReconnect"),
                no_docs_left: flag("NoDocsLeft"),
            }),
            ConnectionStatus::Invalid => Some(SubscriptionError::InvalidState(message)),
            ConnectionStatus::InUse => Some(SubscriptionError::InUse(message)),
            ConnectionStatus::ConcurrencyReconnect => {
                Some(SubscriptionError::ChangeVectorUpdateConcurrency(message))
            }
            ConnectionStatus::Redirect => {
                let data = self.data.as_ref();
                let appropriate_node = data
                    .and_then(|data| data.get("RedirectedTag"))
                    .and_then(Value::as_str)
                    .map(NodeTag::from);
                let reasons: BTreeMap<String, String> = data
                    .and_then(|data| data.get("Reasons"))
                    .and_then(|reasons| serde_json::from_value(reasons.clone()).ok())
                    .unwrap_or_default();
                Some(SubscriptionError::DoesNotBelongToNode {
                    message,
                    appropriate_node,
                    reasons,
                    index: Default::default(),
                })
            }
        }
    }
}

impl SubscriptionError {
    /// Status reported to the client for this error; `None` means a plain `Error` message.
    pub fn connection_status(&self) -> Option<ConnectionStatus> {
        match self {
            SubscriptionError::DoesNotExist(_) | SubscriptionError::DatabaseDoesNotExist(_) => {
                Some(ConnectionStatus::NotFound)
            }
            SubscriptionError::Closed { .. } => Some(ConnectionStatus::Closed),
            SubscriptionError::InvalidState(_) => Some(ConnectionStatus::Invalid),
            SubscriptionError::InUse(_) => Some(ConnectionStatus::InUse),
            SubscriptionError::DoesNotBelongToNode { .. } => Some(ConnectionStatus::Redirect),
            SubscriptionError::ChangeVectorUpdateConcurrency(_) => {
                Some(ConnectionStatus::ConcurrencyReconnect)
            }
            _ => None,
        }
    }
}

/// One end of an in-process duplex frame channel.
pub struct Transport {
    tx: Mutex<Option<Sender<Vec<u8>>>>,
    rx: Receiver<Vec<u8>>,
}

/// A connected pair: the first end is the client's, the second the server's.
pub fn duplex() -> (Transport, Transport) {
    let (client_tx, server_rx) = unbounded();
    let (server_tx, client_rx) = unbounded();
    (
        Transport {
            tx: Mutex::new(Some(client_tx)),
            rx: client_rx,
        },
        Transport {
            tx: Mutex::new(Some(server_tx)),
            rx: server_rx,
        },
    )
}

impl Transport {
    pub fn send_frame(&self, frame: Vec<u8>) -> Result<()> {
        let tx = self.tx.lock();
        let tx = tx
            .as_ref()
            .ok_or_else(|| SubscriptionError::ConnectionDown("transport closed".into()))?;
        tx.send(frame)
            .map_err(|_| SubscriptionError::ConnectionDown("peer disconnected".into()))
    }

    pub fn send<T: Serialize>(&self, message: &T) -> Result<()> {
        self.send_frame(serde_json::to_vec(message)?)
    }

    pub fn send_heartbeat(&self) -> Result<()> {
        self.send_frame(HEARTBEAT.to_vec())
    }

    /// Incoming frames, for use in `select!`.
    pub fn frames(&self) -> &Receiver<Vec<u8>> {
        &self.rx
    }

    /// Next non-heartbeat frame, decoded. `Ok(None)` on timeout.
    pub fn recv_timeout<T: DeserializeOwned>(&self, timeout: Duration) -> Result<Option<T>> {
        let deadline = std::time::Instant::now() + timeout;
        loop {
            let remaining = deadline.saturating_duration_since(std::time::Instant::now());
            match self.rx.recv_timeout(remaining) {
                Ok(frame) if is_heartbeat(&frame) => continue,
                Ok(frame) => return decode(&frame).map(Some),
                Err(RecvTimeoutError::Timeout) => return Ok(None),
                Err(RecvTimeoutError::Disconnected) => {
                    return Err(SubscriptionError::ConnectionDown("peer disconnected".into()))
                }
            }
        }
    }

    /// Stop sending; the peer sees a disconnect once it drains what was sent.
    pub fn close(&self) {
        self.tx.lock().take();
    }
}

pub fn is_heartbeat(frame: &[u8]) -> bool {
    frame == HEARTBEAT
}

pub fn decode<T: DeserializeOwned>(frame: &[u8]) -> Result<T> {
    serde_json::from_slice(frame).map_err(|e| SubscriptionError::Deserialization(e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_client_message_wire_format() {
        let ack = ClientMessage::Acknowledge {
            change_vector: Some("A:1-x".into()),
        };
        let json = serde_json::to_value(&ack).unwrap();
        assert_eq!(json, json!({"Type": "Acknowledge", "ChangeVector": "A:1-x"}));

        let disposed: ClientMessage =
            serde_json::from_value(json!({"Type": "DisposedNotification"})).unwrap();
        assert_eq!(disposed, ClientMessage::DisposedNotification);
    }

    #[test]
    fn test_redirect_status_carries_tags() {
        let mut reasons = BTreeMap::new();
        reasons.insert("A".to_string(), "not the mentor".to_string());
        let error = SubscriptionError::DoesNotBelongToNode {
            message: "go to B".into(),
            appropriate_node: Some(NodeTag::from("B")),
            reasons,
            index: Default::default(),
        };

        let message = ServerMessage::from_error(&error, &NodeTag::from("A"));
        assert_eq!(message.status, Some(ConnectionStatus::Redirect));
        let data = message.data.clone().unwrap();
        assert_eq!(data["RedirectedTag"], "B");
        assert_eq!(data["CurrentTag"], "A");

        match message.to_error() {
            Some(SubscriptionError::DoesNotBelongToNode {
                appropriate_node,
                reasons,
                ..
            }) => {
                assert_eq!(appropriate_node, Some(NodeTag::from("B")));
                assert_eq!(reasons["A"], "not the mentor");
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_closed_status_flags() {
        let error = SubscriptionError::Closed {
            message: "done".into(),
            can_reconnect: false,
            no_docs_left: true,
        };
        let message = ServerMessage::from_error(&error, &NodeTag::from("A"));
        let wire = serde_json::to_vec(&message).unwrap();
        let back: ServerMessage = decode(&wire).unwrap();
        assert!(matches!(
            back.to_error(),
            Some(SubscriptionError::Closed {
                can_reconnect: false,
                no_docs_left: true,
                ..
            })
        ));
    }

    #[test]
    fn test_unexpected_errors_become_error_messages() {
        let message = ServerMessage::from_error(
            &SubscriptionError::Storage("disk full".into()),
            &NodeTag::from("A"),
        );
        assert_eq!(message.kind, MessageType::Error);
        assert!(message.exception.is_some());
        assert!(ServerMessage::accepted().to_error().is_none());
    }

    #[test]
    fn test_transport_skips_heartbeats_and_reports_disconnect() {
        let (client, server) = duplex();
        server.send_heartbeat().unwrap();
        server.send(&ServerMessage::confirm()).unwrap();

        let message: ServerMessage = client
            .recv_timeout(Duration::from_secs(1))
            .unwrap()
            .unwrap();
        assert_eq!(message.kind, MessageType::Confirm);

        let none: Option<ServerMessage> = client.recv_timeout(Duration::from_millis(10)).unwrap();
        assert!(none.is_none());

        drop(server);
        let err = client
            .recv_timeout::<ServerMessage>(Duration::from_millis(10))
            .unwrap_err();
        assert!(matches!(err, SubscriptionError::ConnectionDown(_)));
        assert!(client.send(&ClientMessage::DisposedNotification).is_err());
    }
}
