/*
 * Copyright Bret Ambrose. All Rights Reserved.
 * SPDX-License-Identifier: Apache-2.0.
 */

/*!
Module containing the public IoT MQTT client and associated types necessary to invoke
operations on it.
 */

pub(crate) mod lifecycle;

use crate::client::lifecycle::ClientCore;
use crate::config::{ClientConfig, QualityOfService};
use crate::error::{IotError, IotResult};
use crate::routing::{AckCallback, ExtendedMessageCallback, MessageCallback, SubscriptionCallback};
use crate::session::SessionFactoryFn;
use crate::transport::{make_channel_factory, TransportSpec};

use std::fmt;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;
use tokio::runtime::Handle;

/// Connection status of the client as observed by the lifecycle controller.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
#[repr(u8)]
pub enum ConnectionState {

    /// A connect has been issued and the transport or MQTT handshake is in progress.
    Connecting = 0,

    /// The broker accepted the Connect packet; the session is live.
    Connected = 1,

    /// The broker explicitly rejected the Connect packet.  The client does not retry from
    /// this state; the caller decides what a rejection means.
    ConnectionRefused = 2,

    /// The connection dropped or failed to establish.  The client schedules a reconnect.
    ConnectionError = 3,

    /// The broker violated the MQTT specification; the client performs a full disconnect.
    ProtocolError = 4,

    /// No connection is in force, either because connect was never issued or because a
    /// disconnect completed.
    Disconnected = 5,
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConnectionState::Connecting => { write!(f, "Connecting") }
            ConnectionState::Connected => { write!(f, "Connected") }
            ConnectionState::ConnectionRefused => { write!(f, "ConnectionRefused") }
            ConnectionState::ConnectionError => { write!(f, "ConnectionError") }
            ConnectionState::ProtocolError => { write!(f, "ProtocolError") }
            ConnectionState::Disconnected => { write!(f, "Disconnected") }
        }
    }
}

pub(crate) struct AtomicConnectionState {
    value: AtomicU8
}

impl AtomicConnectionState {

    pub(crate) fn new(state: ConnectionState) -> Self {
        AtomicConnectionState {
            value: AtomicU8::new(state as u8)
        }
    }

    pub(crate) fn store(&self, state: ConnectionState) {
        self.value.store(state as u8, Ordering::SeqCst);
    }

    pub(crate) fn load(&self) -> ConnectionState {
        match self.value.load(Ordering::SeqCst) {
            0 => ConnectionState::Connecting,
            1 => ConnectionState::Connected,
            2 => ConnectionState::ConnectionRefused,
            3 => ConnectionState::ConnectionError,
            4 => ConnectionState::ProtocolError,
            _ => ConnectionState::Disconnected,
        }
    }
}

/// Callback function type invoked with every connection status transition.  Invoked from a
/// spawned task on the client's runtime, never from the lifecycle event loop itself, so it is
/// safe to invoke client operations from within the callback.
pub type StatusCallback = Arc<dyn Fn(ConnectionState) + Send + Sync>;

/// An MQTT311 client handle for a cloud IoT message broker.
///
/// The handle is cheap to clone; all clones share one underlying client.  A client is
/// constructed against a session factory and a tokio runtime, connected with a
/// [`TransportSpec`] describing either a mutual-TLS socket or a Sigv4-signed websocket, and
/// then drives subscriptions and publishes until disconnected.
#[derive(Clone)]
pub struct IotClient {
    core: Arc<ClientCore>
}

impl IotClient {

    /// Creates a new client from configuration and a session factory.  Fails if mandatory
    /// configuration is missing.
    ///
    /// `runtime` - handle of the tokio runtime that will host the client's event loop and its
    /// callback dispatches.  Handing the client a single-threaded runtime's handle confines
    /// all stream I/O and timers to that thread.
    pub fn new(config: ClientConfig, session_factory: SessionFactoryFn, runtime: &Handle) -> IotResult<Self> {
        if config.client_id.is_empty() {
            return Err(IotError::new_configuration_error("client id must not be empty"));
        }

        Ok(IotClient {
            core: ClientCore::new(config, session_factory, runtime.clone())
        })
    }

    pub(crate) fn from_core(core: Arc<ClientCore>) -> Self {
        IotClient {
            core
        }
    }

    /// Initiates a connection over the given transport.  Exactly the first connect after
    /// construction (or after a completed disconnect) initiates; subsequent calls fail with
    /// [`IotError::AlreadyConnecting`] and have no side effects.
    ///
    /// For the direct TLS path, transport establishment begins immediately.  For the signed
    /// websocket path the credentials provider is consulted asynchronously first, then the
    /// url is signed and the websocket opened.
    ///
    /// `status_callback` - invoked with every subsequent connection status transition.
    pub fn connect(&self, transport: TransportSpec, status_callback: StatusCallback) -> IotResult<()> {
        let channel_factory = make_channel_factory(&transport, self.core.clock.clone())?;
        self.core.connect_with_factory(channel_factory, status_callback)
    }

    /// Disconnects the client: cancels any pending reconnect, closes the session, purges the
    /// acknowledgement registry, and reports [`ConnectionState::Disconnected`].  Idempotent;
    /// a second disconnect is a no-op.
    pub fn disconnect(&self) {
        self.core.disconnect();
    }

    /// Publishes a payload to a topic.
    ///
    /// QoS 0 publishes return `None`.  QoS 1 publishes return the packet identifier of the
    /// in-flight operation; if `ack_callback` is supplied it fires exactly once when the
    /// matching acknowledgement arrives, and never after a subsequent disconnect.
    ///
    /// Fails with [`IotError::NotConnected`] before connect, [`IotError::AlreadyDisconnected`]
    /// after disconnect, and [`IotError::InvalidArgument`] if an ack callback accompanies a
    /// QoS 0 publish.
    pub fn publish(&self, topic: &str, payload: &[u8], qos: QualityOfService, ack_callback: Option<AckCallback>) -> IotResult<Option<u16>> {
        self.core.publish(topic, payload, qos, ack_callback)
    }

    /// Registers a subscription and issues an MQTT Subscribe for its topic filter, returning
    /// the operation's packet identifier.  Subscribing to an already-registered filter
    /// replaces the previous registration.
    ///
    /// `callback` - invoked with the payload of every inbound message whose topic the filter
    /// accepts.  Runs on the client's runtime, never on the lifecycle event loop.
    pub fn subscribe(&self, topic_filter: &str, qos: QualityOfService, callback: MessageCallback, ack_callback: Option<AckCallback>) -> IotResult<u16> {
        self.core.subscribe(topic_filter, qos, SubscriptionCallback::Simple(callback), ack_callback)
    }

    /// Registers a subscription whose callback additionally receives the client handle and
    /// the concrete topic the message arrived on.  Otherwise identical to
    /// [`IotClient::subscribe`].
    pub fn subscribe_extended(&self, topic_filter: &str, qos: QualityOfService, callback: ExtendedMessageCallback, ack_callback: Option<AckCallback>) -> IotResult<u16> {
        self.core.subscribe(topic_filter, qos, SubscriptionCallback::Extended(callback), ack_callback)
    }

    /// Removes a subscription and issues an MQTT Unsubscribe for its topic filter, returning
    /// the operation's packet identifier.
    pub fn unsubscribe(&self, topic_filter: &str, ack_callback: Option<AckCallback>) -> IotResult<u16> {
        self.core.unsubscribe(topic_filter, ack_callback)
    }

    /// Latest connection status observed by the lifecycle controller.
    pub fn connection_state(&self) -> ConnectionState {
        self.core.connection_state()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn failing_session_factory() -> SessionFactoryFn {
        Box::new(|_, _| {
            Err(IotError::new_session_error("not under test"))
        })
    }

    #[tokio::test]
    async fn client_requires_a_client_id() {
        let config = crate::config::ClientConfigBuilder::new("").build();
        let result = IotClient::new(config, failing_session_factory(), &Handle::current());

        assert!(matches!(result, Err(IotError::ConfigurationError(_))));
    }

    #[tokio::test]
    async fn connect_rejects_unusable_transport_configuration() {
        let config = crate::config::ClientConfigBuilder::new("thing").build();
        let client = IotClient::new(config, failing_session_factory(), &Handle::current()).unwrap();

        let transport = TransportSpec::SignedWebsocket {
            endpoint: "".to_string(),
            region: "us-east-1".to_string(),
            credentials_provider: Arc::new(crate::signing::StaticCredentialsProvider::new(crate::signing::Credentials {
                access_key_id: "akid".to_string(),
                secret_access_key: "secret".to_string(),
                session_token: None,
            })),
        };

        let result = client.connect(transport, Arc::new(|_| {}));
        assert!(matches!(result, Err(IotError::ConfigurationError(_))));

        // a failed connect must leave the client reusable
        assert_eq!(ConnectionState::Disconnected, client.connection_state());
    }

    #[test]
    fn atomic_connection_state_round_trips() {
        let cell = AtomicConnectionState::new(ConnectionState::Disconnected);

        for state in [
            ConnectionState::Connecting,
            ConnectionState::Connected,
            ConnectionState::ConnectionRefused,
            ConnectionState::ConnectionError,
            ConnectionState::ProtocolError,
            ConnectionState::Disconnected,
        ] {
            cell.store(state);
            assert_eq!(state, cell.load());
        }
    }
}
