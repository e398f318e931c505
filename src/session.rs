/*
 * Copyright Bret Ambrose. All Rights Reserved.
 * SPDX-License-Identifier: Apache-2.0.
 */

/*!
Module containing the contracts between the client and the MQTT session collaborator.

The session owns the MQTT wire codec: packet framing, the QoS 1 retransmission queue, and
keep-alive ping scheduling.  The client core consumes it purely through the [`MqttSession`]
trait and the [`SessionEvent`] channel, which keeps the codec replaceable and the lifecycle
controller testable against a mock.
 */

use crate::config::{LastWill, QualityOfService};
use crate::error::IotResult;

use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::mpsc::UnboundedSender;

/// Byte stream handed to the session to read inbound MQTT frames from.
pub type SessionInputStream = Box<dyn AsyncRead + Send + Unpin>;

/// Byte stream handed to the session to write outbound MQTT frames to.
pub type SessionOutputStream = Box<dyn AsyncWrite + Send + Unpin>;

/// Events emitted by a session back to the lifecycle controller, in the order produced.
#[derive(Debug)]
pub enum SessionEvent {

    /// The broker accepted the Connect packet.
    Connected,

    /// The broker explicitly rejected the Connect packet.
    ConnectionRefused,

    /// The connection was closed after having been established.
    ConnectionClosed,

    /// The connection failed due to a transport-level error.
    ConnectionError,

    /// The broker violated the MQTT specification in a way the session cannot recover from.
    ProtocolError,

    /// An inbound publish arrived.
    Message {
        /// Topic the message was published to.
        topic: String,

        /// Raw message payload.
        payload: Vec<u8>,
    },

    /// An acknowledgement for a QoS 1 operation arrived.
    Ack {
        /// Packet identifier of the acknowledged operation.
        packet_id: u16,
    },
}

impl fmt::Display for SessionEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SessionEvent::Connected => { write!(f, "Connected") }
            SessionEvent::ConnectionRefused => { write!(f, "ConnectionRefused") }
            SessionEvent::ConnectionClosed => { write!(f, "ConnectionClosed") }
            SessionEvent::ConnectionError => { write!(f, "ConnectionError") }
            SessionEvent::ProtocolError => { write!(f, "ProtocolError") }
            SessionEvent::Message { topic, payload } => { write!(f, "Message {{ topic: \"{}\", payload: <{} bytes> }}", topic, payload.len()) }
            SessionEvent::Ack { packet_id } => { write!(f, "Ack {{ packet_id: {} }}", packet_id) }
        }
    }
}

/// Channel endpoint a session uses to deliver events to the lifecycle controller.
pub type SessionEventSender = UnboundedSender<SessionEvent>;

/// Configuration data a session factory needs to construct a session for one connection
/// attempt.
#[derive(Clone)]
pub struct SessionConfig {

    /// Unique identifier presented to the broker.
    pub client_id: String,

    /// Username field of the Connect packet.  Carries the metrics string when metrics are
    /// enabled; empty otherwise.
    pub username: String,

    /// Password field of the Connect packet, if any.
    pub password: Option<Vec<u8>>,

    /// Keep alive interval, in seconds.
    pub keep_alive_seconds: u16,

    /// Whether the broker should discard prior session state.  The controller forces this off
    /// on reconnect attempts regardless of client configuration.
    pub clean_session: bool,

    /// Optional last-will message.
    pub will: Option<LastWill>,

    /// Optional throttle interval between QoS 1 publish retransmissions.  Interpretation is
    /// session-defined.
    pub publish_retry_throttle: Option<Duration>,
}

impl fmt::Debug for SessionConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "SessionConfig {{ ")?;
        write!(f, "client_id: \"{}\", ", self.client_id)?;
        write!(f, "username: \"{}\", ", self.username)?;
        if self.password.is_some() {
            write!(f, "password: <...redacted>, ")?;
        }
        write!(f, "keep_alive_seconds: {}, ", self.keep_alive_seconds)?;
        write!(f, "clean_session: {} ", self.clean_session)?;
        write!(f, "}}")
    }
}

/// Contract for the MQTT session collaborator consumed by the client core.
///
/// Implementations must be safe to invoke from both the lifecycle event loop and user threads.
/// After [`MqttSession::close`] returns, the session must emit nothing further on its event
/// channel; the controller relies on this to tear the session down without racing stale
/// events into the next connection's lifetime.
pub trait MqttSession: Send + Sync {

    /// Attaches the session to a pair of transport byte streams and begins the MQTT connect
    /// handshake.  The session assumes sole ownership of both streams.
    fn connect_to_streams(&self, input: SessionInputStream, output: SessionOutputStream) -> IotResult<()>;

    /// Hard-closes the session: releases the streams, abandons in-flight operations, and
    /// silences the event channel.
    fn close(&self);

    /// Sends an MQTT Disconnect packet if the session is in a state where doing so is
    /// meaningful.  A graceful shutdown is `disconnect` followed by `close`.
    fn disconnect(&self);

    /// Publishes a payload at QoS 0.  No packet identifier is assigned.
    fn publish_data(&self, payload: &[u8], topic: &str) -> IotResult<()>;

    /// Publishes a payload at QoS 1, returning the packet identifier the eventual
    /// acknowledgement will carry.
    fn publish_data_at_least_once(&self, payload: &[u8], topic: &str) -> IotResult<u16>;

    /// Issues an MQTT Subscribe for a single topic filter, returning the packet identifier the
    /// eventual acknowledgement will carry.
    fn subscribe(&self, topic_filter: &str, qos: QualityOfService) -> IotResult<u16>;

    /// Issues an MQTT Unsubscribe for a single topic filter, returning the packet identifier
    /// the eventual acknowledgement will carry.
    fn unsubscribe(&self, topic_filter: &str) -> IotResult<u16>;
}

/// Factory function type for creating a session for a single connection attempt.
///
/// Invoked by the lifecycle controller once per attempt; events must be delivered through the
/// supplied sender until `close()` is invoked on the returned session.
pub type SessionFactoryFn = Box<dyn Fn(SessionConfig, SessionEventSender) -> IotResult<Arc<dyn MqttSession>> + Send + Sync>;
