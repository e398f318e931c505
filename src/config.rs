/*
 * Copyright Bret Ambrose. All Rights Reserved.
 * SPDX-License-Identifier: Apache-2.0.
 */

/*!
Module containing types for configuring an IoT MQTT client.
 */

use crate::error::{IotError, IotResult};

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

/// MQTT message delivery quality of service.
///
/// Enum values match MQTT311 spec encoding values.  QoS 2 is deliberately not modeled; the
/// client does not support exactly-once delivery.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub enum QualityOfService {

    /// The message is delivered according to the capabilities of the underlying network. No
    /// response is sent by the receiver and no retry is performed by the sender. The message
    /// arrives at the receiver either once or not at all.
    #[default]
    AtMostOnce = 0,

    /// A level of service that ensures that the message arrives at the receiver at least once.
    AtLeastOnce = 1,
}

impl TryFrom<u8> for QualityOfService {
    type Error = IotError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0 => { Ok(QualityOfService::AtMostOnce) }
            1 => { Ok(QualityOfService::AtLeastOnce) }
            _ => { Err(IotError::new_invalid_argument("quality of service value out of supported range")) }
        }
    }
}

impl fmt::Display for QualityOfService {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            QualityOfService::AtMostOnce => { write!(f, "AtMostOnce") }
            QualityOfService::AtLeastOnce => { write!(f, "AtLeastOnce") }
        }
    }
}

/// A message the broker publishes on behalf of the client if the client disconnects
/// ungracefully.
#[derive(Clone, Debug)]
pub struct LastWill {
    pub(crate) topic: String,
    pub(crate) payload: Vec<u8>,
    pub(crate) qos: QualityOfService,
    pub(crate) retain: bool,
}

impl LastWill {

    /// Creates a new last-will message description.
    pub fn new(topic: &str, payload: &[u8], qos: QualityOfService, retain: bool) -> Self {
        LastWill {
            topic: topic.to_string(),
            payload: payload.to_vec(),
            qos,
            retain,
        }
    }

    /// Topic the will message will be published to.
    pub fn topic(&self) -> &str { &self.topic }

    /// Payload of the will message.
    pub fn payload(&self) -> &[u8] { &self.payload }

    /// Quality of service the will message will be published with.
    pub fn qos(&self) -> QualityOfService { self.qos }

    /// Whether the broker should retain the will message.
    pub fn retain(&self) -> bool { self.retain }
}

pub(crate) const DEFAULT_KEEP_ALIVE_SECONDS : u16 = 300;
pub(crate) const DEFAULT_BASE_RECONNECT_SECONDS : f64 = 1.0;
pub(crate) const DEFAULT_MAXIMUM_RECONNECT_SECONDS : f64 = 128.0;
pub(crate) const DEFAULT_MINIMUM_CONNECTION_SECONDS : u64 = 20;

/// A structure that holds all client-level behavioral configuration.  Immutable once the first
/// connect has been issued.
#[derive(Clone)]
pub struct ClientConfig {
    pub(crate) client_id: String,

    pub(crate) keep_alive_seconds: u16,

    pub(crate) clean_session: bool,

    pub(crate) will: Option<LastWill>,

    pub(crate) metrics_enabled: bool,

    pub(crate) base_reconnect_seconds: f64,
    pub(crate) maximum_reconnect_seconds: f64,
    pub(crate) minimum_connection_seconds: u64,

    pub(crate) auto_resubscribe: bool,

    pub(crate) publish_retry_throttle: Option<Duration>,
}

impl ClientConfig {

    /// Unique identifier presented to the broker in the Connect packet.
    pub fn client_id(&self) -> &str { &self.client_id }

    /// Maximum interval, in seconds, permitted between control packets sent by the client.
    pub fn keep_alive_seconds(&self) -> u16 { self.keep_alive_seconds }

    /// Whether the broker should discard prior session state for this client id.
    pub fn clean_session(&self) -> bool { self.clean_session }

    pub(crate) fn normalize(&mut self) {
        if self.base_reconnect_seconds > self.maximum_reconnect_seconds {
            std::mem::swap(&mut self.base_reconnect_seconds, &mut self.maximum_reconnect_seconds)
        }

        if self.base_reconnect_seconds < 1.0 {
            self.base_reconnect_seconds = 1.0;
        }
    }
}

impl fmt::Debug for ClientConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ClientConfig {{ ")?;
        write!(f, "client_id: \"{}\", ", self.client_id)?;
        write!(f, "keep_alive_seconds: {}, ", self.keep_alive_seconds)?;
        write!(f, "clean_session: {}, ", self.clean_session)?;
        if let Some(will) = &self.will {
            write!(f, "will: <{} bytes to \"{}\">, ", will.payload.len(), will.topic)?;
        }
        write!(f, "metrics_enabled: {}, ", self.metrics_enabled)?;
        write!(f, "base_reconnect_seconds: {}, ", self.base_reconnect_seconds)?;
        write!(f, "maximum_reconnect_seconds: {}, ", self.maximum_reconnect_seconds)?;
        write!(f, "minimum_connection_seconds: {}, ", self.minimum_connection_seconds)?;
        write!(f, "auto_resubscribe: {} ", self.auto_resubscribe)?;
        write!(f, "}}")
    }
}

/// A builder for client-level behavior configuration options
pub struct ClientConfigBuilder {
    config: ClientConfig
}

impl ClientConfigBuilder {

    /// Creates a new builder object for ClientConfig.
    ///
    /// `client_id` - unique string identifying the client to the broker.  Mandatory; the broker
    /// this client targets does not support auto-assigned client ids across reconnects.
    pub fn new(client_id: &str) -> Self {
        ClientConfigBuilder {
            config: ClientConfig {
                client_id: client_id.to_string(),
                keep_alive_seconds: DEFAULT_KEEP_ALIVE_SECONDS,
                clean_session: true,
                will: None,
                metrics_enabled: true,
                base_reconnect_seconds: DEFAULT_BASE_RECONNECT_SECONDS,
                maximum_reconnect_seconds: DEFAULT_MAXIMUM_RECONNECT_SECONDS,
                minimum_connection_seconds: DEFAULT_MINIMUM_CONNECTION_SECONDS,
                auto_resubscribe: true,
                publish_retry_throttle: None,
            }
        }
    }

    /// Sets the maximum time interval, in seconds, that is permitted to elapse between the point
    /// at which the client finishes transmitting one MQTT packet and the point it starts sending
    /// the next.  The session uses PINGREQ packets to maintain this property.
    pub fn with_keep_alive_seconds(mut self, keep_alive_seconds: u16) -> Self {
        self.config.keep_alive_seconds = keep_alive_seconds;
        self
    }

    /// Configures whether the broker should discard prior subscription state for this client id
    /// when the connection is first established.  Forced off internally for reconnect attempts
    /// so that a rejoined session keeps its server-side state.
    pub fn with_clean_session(mut self, clean_session: bool) -> Self {
        self.config.clean_session = clean_session;
        self
    }

    /// Configures a message to be published by the broker if the client disconnects
    /// ungracefully.
    pub fn with_will(mut self, will: LastWill) -> Self {
        self.config.will = Some(will);
        self
    }

    /// Controls whether an SDK metrics string is sent in the username field of the Connect
    /// packet.  On by default.
    pub fn with_metrics_enabled(mut self, metrics_enabled: bool) -> Self {
        self.config.metrics_enabled = metrics_enabled;
        self
    }

    /// Configures the minimum amount of time, in seconds, to wait between connection attempts.
    /// Defaults to one second if not specified.
    pub fn with_base_reconnect_seconds(mut self, base_reconnect_seconds: f64) -> Self {
        self.config.base_reconnect_seconds = base_reconnect_seconds;
        self
    }

    /// Configures the maximum amount of time, in seconds, to wait between connection attempts.
    /// Defaults to 128 seconds if not specified.
    pub fn with_maximum_reconnect_seconds(mut self, maximum_reconnect_seconds: f64) -> Self {
        self.config.maximum_reconnect_seconds = maximum_reconnect_seconds;
        self
    }

    /// Configures the interval of time, in seconds, that the client must remain successfully
    /// connected before the exponential backoff for connection attempts is restored to its
    /// base value.  Defaults to twenty seconds if not specified.
    pub fn with_minimum_connection_seconds(mut self, minimum_connection_seconds: u64) -> Self {
        self.config.minimum_connection_seconds = minimum_connection_seconds;
        self
    }

    /// Configures whether the client re-issues all registered subscriptions each time a
    /// connection is (re)established.  On by default.
    pub fn with_auto_resubscribe(mut self, auto_resubscribe: bool) -> Self {
        self.config.auto_resubscribe = auto_resubscribe;
        self
    }

    /// Configures a throttle interval between QoS 1 publish retransmissions.  Interpretation is
    /// up to the session implementation; the client forwards the value unchanged.
    pub fn with_publish_retry_throttle(mut self, throttle: Duration) -> Self {
        self.config.publish_retry_throttle = Some(throttle);
        self
    }

    /// Builds a new set of client options, consuming the builder in the process.
    pub fn build(mut self) -> ClientConfig {
        self.config.normalize();
        self.config
    }
}

#[derive(Eq, PartialEq, Clone)]
pub(crate) enum TlsMode {
    Standard,
    Mtls
}

/// Opaque struct containing TLS configuration data for the direct connection path.
#[derive(Clone)]
pub struct TlsOptions {
    pub(crate) config: Arc<rustls::ClientConfig>,
    #[allow(dead_code)]
    pub(crate) mode: TlsMode,
}

/// Builder type for constructing TLS configuration.
pub struct TlsOptionsBuilder {
    mode: TlsMode,
    root_ca_bytes: Option<Vec<u8>>,
    certificate_bytes: Option<Vec<u8>>,
    private_key_bytes: Option<Vec<u8>>,
    verify_peer: bool,
    alpn: Option<Vec<u8>> // one protocol only for now
}

impl TlsOptionsBuilder {

    /// Creates a new builder object with default options: standard TLS against the system
    /// trust store, peer verification on, no client identity.
    pub fn new() -> Self {
        TlsOptionsBuilder::default()
    }

    /// Configures the builder to create a mutual TLS context using an X509 certificate and a
    /// private key, by file path.
    pub fn new_with_mtls_from_path(certificate_path: &str, private_key_path: &str) -> std::io::Result<Self> {
        let certificate_bytes = std::fs::read(certificate_path)?;
        let private_key_bytes = std::fs::read(private_key_path)?;

        Ok(TlsOptionsBuilder {
            mode: TlsMode::Mtls,
            root_ca_bytes: None,
            certificate_bytes: Some(certificate_bytes),
            private_key_bytes: Some(private_key_bytes),
            verify_peer: true,
            alpn: None
        })
    }

    /// Configures the builder to create a mutual TLS context using an X509 certificate and a
    /// private key, from memory.
    pub fn new_with_mtls_from_memory(certificate_bytes: &[u8], private_key_bytes: &[u8]) -> Self {
        TlsOptionsBuilder {
            mode: TlsMode::Mtls,
            root_ca_bytes: None,
            certificate_bytes: Some(certificate_bytes.to_vec()),
            private_key_bytes: Some(private_key_bytes.to_vec()),
            verify_peer: true,
            alpn: None
        }
    }

    /// Configures the builder to use a trust store that *only* contains a single root
    /// certificate, supplied by file path.
    pub fn with_root_ca_from_path(mut self, root_ca_path: &str) -> std::io::Result<Self> {
        self.root_ca_bytes = Some(std::fs::read(root_ca_path)?);
        Ok(self)
    }

    /// Configures the builder to use a trust store that *only* contains a single root
    /// certificate, supplied from memory.
    pub fn with_root_ca_from_memory(mut self, root_ca_bytes: &[u8]) -> Self {
        self.root_ca_bytes = Some(root_ca_bytes.to_vec());
        self
    }

    /// Controls whether the peer's certificate chain and host name are verified during the TLS
    /// handshake.  Disabling verification accepts any peer and is the caller's responsibility.
    pub fn with_verify_peer(mut self, verify_peer: bool) -> Self {
        self.verify_peer = verify_peer;
        self
    }

    /// Sets an ALPN protocol to negotiate during the TLS handshake.  Should multiple protocols
    /// become a valid use case, new APIs will be added to manipulate the set of protocols.
    pub fn with_alpn(mut self, alpn: &[u8]) -> Self {
        self.alpn = Some(alpn.to_vec());
        self
    }

    /// Builds client TLS options using the `rustls` crate
    pub fn build_rustls(self) -> IotResult<TlsOptions> {
        // validate the client identity before touching any trust store so that a missing or
        // unusable certificate identity always surfaces as a configuration error
        let client_identity =
            match self.mode {
                TlsMode::Standard => { None }
                TlsMode::Mtls => {
                    let certificate_bytes = self.certificate_bytes.as_deref()
                        .ok_or_else(|| IotError::new_configuration_error("mtls configuration is missing certificate data"))?;
                    let private_key_bytes = self.private_key_bytes.as_deref()
                        .ok_or_else(|| IotError::new_configuration_error("mtls configuration is missing private key data"))?;

                    Some(parse_client_identity(certificate_bytes, private_key_bytes)?)
                }
            };

        let builder =
            if self.verify_peer {
                let root_cert_store = build_root_ca_store(self.root_ca_bytes.as_deref())?;
                rustls::ClientConfig::builder()
                    .with_root_certificates(root_cert_store)
            } else {
                rustls::ClientConfig::builder()
                    .dangerous()
                    .with_custom_certificate_verifier(Arc::new(AcceptAnyServerCert::new()))
            };

        let mut config =
            match client_identity {
                None => {
                    builder.with_no_client_auth()
                }
                Some((certs, private_key)) => {
                    builder.with_client_auth_cert(certs, private_key)?
                }
            };

        config.alpn_protocols = Vec::new();
        if let Some(alpn) = self.alpn {
            config.alpn_protocols.push(alpn);
        }

        Ok(TlsOptions {
            config: Arc::new(config),
            mode: self.mode,
        })
    }
}

impl Default for TlsOptionsBuilder {
    fn default() -> Self {
        TlsOptionsBuilder {
            mode: TlsMode::Standard,
            root_ca_bytes: None,
            certificate_bytes: None,
            private_key_bytes: None,
            verify_peer: true,
            alpn: None
        }
    }
}

/// Parses an X509 client identity out of pem data.  The whole certificate chain must be
/// well formed; a truncated or garbled identity is rejected here rather than left for the
/// broker to refuse.
fn parse_client_identity(certificate_bytes: &[u8], private_key_bytes: &[u8]) -> IotResult<(Vec<rustls_pki_types::CertificateDer<'static>>, rustls_pki_types::PrivateKeyDer<'static>)> {
    let certificates = rustls_pemfile::certs(&mut &certificate_bytes[..])
        .collect::<Result<Vec<_>, _>>()
        .map_err(|_| IotError::new_configuration_error("certificate identity pem data is malformed"))?;

    if certificates.is_empty() {
        return Err(IotError::new_configuration_error("certificate identity not found in supplied pem data"));
    }

    let private_key = rustls_pemfile::private_key(&mut &private_key_bytes[..])
        .map_err(|_| IotError::new_configuration_error("private key pem data is malformed"))?
        .ok_or_else(|| IotError::new_configuration_error("no private key found in supplied pem data"))?;

    Ok((certificates, private_key))
}

fn build_root_ca_store(root_ca_bytes: Option<&[u8]>) -> IotResult<rustls::RootCertStore> {
    let mut root_cert_store = rustls::RootCertStore::empty();

    match root_ca_bytes {
        Some(pem_bytes) => {
            // a user-pinned trust anchor must be usable in full
            for certificate in rustls_pemfile::certs(&mut &pem_bytes[..]) {
                let certificate = certificate
                    .map_err(|_| IotError::new_configuration_error("root ca pem data is malformed"))?;
                root_cert_store.add(certificate)?;
            }

            if root_cert_store.is_empty() {
                return Err(IotError::new_configuration_error("no root certificates found in supplied pem data"));
            }
        }
        None => {
            // individually unusable system certificates are tolerated, an empty store is not
            let system_certs = rustls_native_certs::load_native_certs()
                .map_err(IotError::new_tls_error)?;
            let (added, _ignored) = root_cert_store.add_parsable_certificates(system_certs);
            if added == 0 {
                return Err(IotError::new_tls_error("no usable certificates in the system trust store"));
            }
        }
    }

    Ok(root_cert_store)
}

/// Certificate verifier that accepts any peer.  Installed only when the user explicitly turns
/// peer verification off; signature validation is still delegated to the crypto provider.
#[derive(Debug)]
struct AcceptAnyServerCert {
    provider: Arc<rustls::crypto::CryptoProvider>,
}

impl AcceptAnyServerCert {
    fn new() -> Self {
        AcceptAnyServerCert {
            provider: Arc::new(rustls::crypto::ring::default_provider()),
        }
    }
}

impl rustls::client::danger::ServerCertVerifier for AcceptAnyServerCert {
    fn verify_server_cert(
        &self,
        _end_entity: &rustls_pki_types::CertificateDer<'_>,
        _intermediates: &[rustls_pki_types::CertificateDer<'_>],
        _server_name: &rustls_pki_types::ServerName<'_>,
        _ocsp_response: &[u8],
        _now: rustls_pki_types::UnixTime,
    ) -> Result<rustls::client::danger::ServerCertVerified, rustls::Error> {
        Ok(rustls::client::danger::ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        message: &[u8],
        cert: &rustls_pki_types::CertificateDer<'_>,
        dss: &rustls::DigitallySignedStruct,
    ) -> Result<rustls::client::danger::HandshakeSignatureValid, rustls::Error> {
        rustls::crypto::verify_tls12_signature(message, cert, dss, &self.provider.signature_verification_algorithms)
    }

    fn verify_tls13_signature(
        &self,
        message: &[u8],
        cert: &rustls_pki_types::CertificateDer<'_>,
        dss: &rustls::DigitallySignedStruct,
    ) -> Result<rustls::client::danger::HandshakeSignatureValid, rustls::Error> {
        rustls::crypto::verify_tls13_signature(message, cert, dss, &self.provider.signature_verification_algorithms)
    }

    fn supported_verify_schemes(&self) -> Vec<rustls::SignatureScheme> {
        self.provider.signature_verification_algorithms.supported_schemes()
    }
}
