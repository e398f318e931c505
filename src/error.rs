/*
 * Copyright Bret Ambrose. All Rights Reserved.
 * SPDX-License-Identifier: Apache-2.0.
 */

/*!
A module containing the core crate error enumeration, context structures, and conversion
definitions.
 */

use std::error::Error;
use std::fmt;

/// Additional details about a ConfigurationError error variant
#[derive(Debug)]
pub struct ConfigurationErrorContext {
    source: Box<dyn Error + Send + Sync + 'static>
}

/// Additional details about an InvalidArgument error variant
#[derive(Debug)]
pub struct InvalidArgumentContext {
    source: Box<dyn Error + Send + Sync + 'static>
}

/// Additional details about a CredentialsFetchFailure error variant
#[derive(Debug)]
pub struct CredentialsFetchFailureContext {
    source: Box<dyn Error + Send + Sync + 'static>
}

/// Additional details about a SigningFailure error variant
#[derive(Debug)]
pub struct SigningFailureContext {
    source: Box<dyn Error + Send + Sync + 'static>
}

/// Additional details about a TlsError error variant
#[derive(Debug)]
pub struct TlsErrorContext {
    source: Box<dyn Error + Send + Sync + 'static>
}

/// Additional details about a TransportError error variant
#[derive(Debug)]
pub struct TransportErrorContext {
    source: Box<dyn Error + Send + Sync + 'static>
}

/// Additional details about a ConnectionEstablishmentFailure error variant
#[derive(Debug)]
pub struct ConnectionEstablishmentFailureContext {
    source: Box<dyn Error + Send + Sync + 'static>
}

/// Additional details about a SessionError error variant
#[derive(Debug)]
pub struct SessionErrorContext {
    source: Box<dyn Error + Send + Sync + 'static>
}

/// Additional details about an InternalStateError error variant
#[derive(Debug)]
pub struct InternalStateErrorContext {
    source: Box<dyn Error + Send + Sync + 'static>
}

/// Additional details about a StdIoError error variant
#[derive(Debug)]
pub struct StdIoErrorContext {
    source: Box<dyn Error + Send + Sync + 'static>
}

/// Basic error type for the entire basalt-iot crate.
#[derive(Debug)]
#[non_exhaustive]
pub enum IotError {

    /// Error emitted when client construction or a connect attempt is given configuration that
    /// is missing mandatory data (client id, endpoint, region, certificate identity) or whose
    /// data cannot be used to build a connection context.  Never retried.
    ConfigurationError(ConfigurationErrorContext),

    /// Error emitted when `connect` is invoked while a previous connect is still in force.
    /// The client must observe a completed disconnect before connecting again.
    AlreadyConnecting,

    /// Error applied to operations submitted before `connect` has been issued, or while no
    /// session is currently available to carry them.
    NotConnected,

    /// Error applied to operations submitted after `disconnect` has been issued.
    AlreadyDisconnected,

    /// Error emitted when an operation is submitted with arguments that violate a precondition,
    /// such as an acknowledgement callback attached to a QoS 0 publish.
    InvalidArgument(InvalidArgumentContext),

    /// Error emitted when the credentials provider fails to yield credentials for signing a
    /// websocket url.  Recovered by the reconnect loop.
    CredentialsFetchFailure(CredentialsFetchFailureContext),

    /// Error emitted when the Sigv4 signing chain fails.  Only reachable if the underlying
    /// HMAC primitive rejects a key, which does not happen in normal operation.
    SigningFailure(SigningFailureContext),

    /// Generic error associated with parsing TLS configuration data or applying it to a
    /// TLS context
    TlsError(TlsErrorContext),

    /// Generic error associated with transport-level failures after establishment.  For now,
    /// this mostly wraps websocket implementation specific errors
    TransportError(TransportErrorContext),

    /// Error emitted when a transport-level connection to the broker could not be established
    ConnectionEstablishmentFailure(ConnectionEstablishmentFailureContext),

    /// Error surfaced from the MQTT session collaborator when an operation submitted to it fails
    SessionError(SessionErrorContext),

    /// Error emitted by the client when something happens that should never happen.  Always
    /// indicates a bug in the client.
    InternalStateError(InternalStateErrorContext),

    /// Generic error wrapping std::io::Error
    StdIoError(StdIoErrorContext),
}

impl IotError {

    /// Constructs a ConfigurationError variant from an existing error or message.
    pub fn new_configuration_error(source: impl Into<Box<dyn Error + Send + Sync + 'static>>) -> Self {
        IotError::ConfigurationError(
            ConfigurationErrorContext {
                source : source.into()
            }
        )
    }

    pub(crate) fn new_invalid_argument(source: impl Into<Box<dyn Error + Send + Sync + 'static>>) -> Self {
        IotError::InvalidArgument(
            InvalidArgumentContext {
                source : source.into()
            }
        )
    }

    pub(crate) fn new_credentials_fetch_failure(source: impl Into<Box<dyn Error + Send + Sync + 'static>>) -> Self {
        IotError::CredentialsFetchFailure(
            CredentialsFetchFailureContext {
                source : source.into()
            }
        )
    }

    pub(crate) fn new_signing_failure(source: impl Into<Box<dyn Error + Send + Sync + 'static>>) -> Self {
        IotError::SigningFailure(
            SigningFailureContext {
                source : source.into()
            }
        )
    }

    /// Constructs a new TlsError variant from an existing error.  Typically this should be
    /// an error surfacing from a third-party TLS library or an attempt to initialize
    /// configuration for one.
    pub fn new_tls_error(source: impl Into<Box<dyn Error + Send + Sync + 'static>>) -> Self {
        IotError::TlsError(
            TlsErrorContext {
                source : source.into()
            }
        )
    }

    /// Constructs a new TransportError variant from an existing error.  Typically this should be
    /// an error surfacing from a third-party transport library.
    pub fn new_transport_error(source: impl Into<Box<dyn Error + Send + Sync + 'static>>) -> Self {
        IotError::TransportError(
            TransportErrorContext {
                source : source.into()
            }
        )
    }

    pub(crate) fn new_connection_establishment_failure(source: impl Into<Box<dyn Error + Send + Sync + 'static>>) -> Self {
        IotError::ConnectionEstablishmentFailure(
            ConnectionEstablishmentFailureContext {
                source : source.into()
            }
        )
    }

    /// Constructs a new SessionError variant from an existing error.  Used by session
    /// implementations to restrict their operation results to IotError.
    pub fn new_session_error(source: impl Into<Box<dyn Error + Send + Sync + 'static>>) -> Self {
        IotError::SessionError(
            SessionErrorContext {
                source : source.into()
            }
        )
    }

    /// Constructs a new InternalStateError variant from an existing error.  Session
    /// implementations may use this to flag invariant violations of their own.
    pub fn new_internal_state_error(source: impl Into<Box<dyn Error + Send + Sync + 'static>>) -> Self {
        IotError::InternalStateError(
            InternalStateErrorContext {
                source : source.into()
            }
        )
    }

    /// Constructs a StdIoError variant from an existing error.  Typically this should be a
    /// std::io::Error
    pub fn new_std_io_error(source: impl Into<Box<dyn Error + Send + Sync + 'static>>) -> Self {
        IotError::StdIoError(
            StdIoErrorContext {
                source : source.into()
            }
        )
    }
}

impl Error for IotError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match self {
            IotError::ConfigurationError(context) => {
                Some(context.source.as_ref())
            }
            IotError::InvalidArgument(context) => {
                Some(context.source.as_ref())
            }
            IotError::CredentialsFetchFailure(context) => {
                Some(context.source.as_ref())
            }
            IotError::SigningFailure(context) => {
                Some(context.source.as_ref())
            }
            IotError::TlsError(context) => {
                Some(context.source.as_ref())
            }
            IotError::TransportError(context) => {
                Some(context.source.as_ref())
            }
            IotError::ConnectionEstablishmentFailure(context) => {
                Some(context.source.as_ref())
            }
            IotError::SessionError(context) => {
                Some(context.source.as_ref())
            }
            IotError::InternalStateError(context) => {
                Some(context.source.as_ref())
            }
            IotError::StdIoError(context) => {
                Some(context.source.as_ref())
            }
            _ => { None }
        }
    }
}

impl fmt::Display for IotError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            IotError::ConfigurationError(_) => {
                write!(f, "mandatory configuration data is missing or unusable; source contains further details")
            }
            IotError::AlreadyConnecting => {
                write!(f, "connect has already been issued and has not been undone by a completed disconnect")
            }
            IotError::NotConnected => {
                write!(f, "operation requires a connected client - connect has not been issued or no session is currently active")
            }
            IotError::AlreadyDisconnected => {
                write!(f, "operation submitted after disconnect was issued")
            }
            IotError::InvalidArgument(_) => {
                write!(f, "operation submitted with an argument that violates a precondition")
            }
            IotError::CredentialsFetchFailure(_) => {
                write!(f, "credentials provider failed to yield signing credentials")
            }
            IotError::SigningFailure(_) => {
                write!(f, "sigv4 signing chain failed; source contains further details")
            }
            IotError::TlsError(_) => {
                write!(f, "generic error when setting up a tls context")
            }
            IotError::TransportError(_) => {
                write!(f, "transport error; source contains further details")
            }
            IotError::ConnectionEstablishmentFailure(_) => {
                write!(f, "failed to establish a transport-level connection to the broker")
            }
            IotError::SessionError(_) => {
                write!(f, "mqtt session operation failed; source contains further details")
            }
            IotError::InternalStateError(_) => {
                write!(f, "client reached an invalid internal state; almost certainly a client bug")
            }
            IotError::StdIoError(_) => {
                write!(f, "generic error wrapper for std::io::Error when no more specialized error is appropriate; source contains further details")
            }
        }
    }
}

impl From<std::io::Error> for IotError {
    fn from(error: std::io::Error) -> Self {
        IotError::new_std_io_error(error)
    }
}

impl From<rustls::Error> for IotError {
    fn from(error: rustls::Error) -> Self {
        IotError::new_tls_error(error)
    }
}

impl From<rustls_pki_types::InvalidDnsNameError> for IotError {
    fn from(error: rustls_pki_types::InvalidDnsNameError) -> Self {
        IotError::new_connection_establishment_failure(error)
    }
}

impl From<tungstenite::error::Error> for IotError {
    fn from(error: tungstenite::error::Error) -> Self {
        IotError::new_transport_error(error)
    }
}

/// Crate-wide result type for functions that can fail
pub type IotResult<T> = Result<T, IotError>;
