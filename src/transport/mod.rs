/*
 * Copyright Bret Ambrose. All Rights Reserved.
 * SPDX-License-Identifier: Apache-2.0.
 */

/*!
Module containing the transport adapter: the description of where and how to connect, and the
machinery that turns either transport variant into a uniform duplex byte channel for the
session to frame MQTT over.
 */

pub(crate) mod ws;

use crate::config::TlsOptions;
use crate::error::{IotError, IotResult};
use crate::session::{SessionInputStream, SessionOutputStream};
use crate::signing::{CredentialsProvider, SkewAdjustedClock};

use log::*;
use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use tokio::net::TcpStream;
use tokio_rustls::TlsConnector;

/// Description of the transport a connect attempt should use.
#[derive(Clone)]
pub enum TransportSpec {

    /// A direct TLS socket to the broker, authenticated by an X509 client identity carried in
    /// the TLS options.
    DirectTls {
        /// Broker host name.
        endpoint: String,

        /// Broker port.
        port: u16,

        /// TLS context configuration, including the client certificate identity.
        tls_options: TlsOptions,
    },

    /// A websocket carrying MQTT frames, opened against a Sigv4-signed url.
    SignedWebsocket {
        /// Broker host name.
        endpoint: String,

        /// Signing region for the url signature.
        region: String,

        /// Source of the signing credentials.
        credentials_provider: Arc<dyn CredentialsProvider>,
    },
}

impl fmt::Debug for TransportSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TransportSpec::DirectTls { endpoint, port, .. } => {
                write!(f, "TransportSpec::DirectTls {{ endpoint: \"{}\", port: {} }}", endpoint, port)
            }
            TransportSpec::SignedWebsocket { endpoint, region, .. } => {
                write!(f, "TransportSpec::SignedWebsocket {{ endpoint: \"{}\", region: \"{}\" }}", endpoint, region)
            }
        }
    }
}

/// A pair of byte streams the session frames MQTT over, regardless of the underlying carrier.
pub struct DuplexByteChannel {

    /// Stream the session reads inbound bytes from.
    pub input: SessionInputStream,

    /// Stream the session writes outbound bytes to.
    pub output: SessionOutputStream,
}

pub(crate) type ChannelFactoryReturn = Pin<Box<dyn Future<Output = IotResult<DuplexByteChannel>> + Send>>;

/// Factory function for creating the transport byte channel for a single connection attempt.
/// It might wrap a TLS stream, it might wrap a websocket-to-pipe bridge; the session does not
/// care.
pub(crate) type ChannelFactoryFn = Box<dyn Fn() -> ChannelFactoryReturn + Send + Sync>;

/// Builds a reusable channel factory for the given transport description.  Configuration
/// problems (unusable endpoint, unbuildable TLS context) surface here, synchronously, rather
/// than on the first attempt.
pub(crate) fn make_channel_factory(spec: &TransportSpec, clock: Arc<SkewAdjustedClock>) -> IotResult<ChannelFactoryFn> {
    match spec {
        TransportSpec::DirectTls { endpoint, port, tls_options } => {
            if endpoint.is_empty() {
                return Err(IotError::new_configuration_error("direct tls transport requires a non-empty endpoint"));
            }

            let endpoint = endpoint.clone();
            let port = *port;
            let tls_options = tls_options.clone();

            Ok(Box::new(move || {
                Box::pin(make_direct_tls_channel(endpoint.clone(), port, tls_options.clone()))
            }))
        }
        TransportSpec::SignedWebsocket { endpoint, region, credentials_provider } => {
            if endpoint.is_empty() || region.is_empty() {
                return Err(IotError::new_configuration_error("signed websocket transport requires a non-empty endpoint and region"));
            }

            // standard TLS against the system trust store; the url signature carries the
            // authentication
            let tls_options = crate::config::TlsOptionsBuilder::new().build_rustls()?;

            let endpoint = endpoint.clone();
            let region = region.clone();
            let credentials_provider = credentials_provider.clone();

            Ok(Box::new(move || {
                Box::pin(ws::make_signed_websocket_channel(endpoint.clone(), region.clone(), credentials_provider.clone(), clock.clone(), tls_options.clone()))
            }))
        }
    }
}

async fn make_direct_tls_channel(endpoint: String, port: u16, tls_options: TlsOptions) -> IotResult<DuplexByteChannel> {
    debug!("transport - opening direct tls connection to {}:{}", endpoint, port);

    let tcp_stream = TcpStream::connect((endpoint.as_str(), port)).await
        .map_err(IotError::new_connection_establishment_failure)?;

    let domain = rustls_pki_types::ServerName::try_from(endpoint)?;

    let connector = TlsConnector::from(tls_options.config.clone());
    let tls_stream = connector.connect(domain, tcp_stream).await
        .map_err(IotError::new_connection_establishment_failure)?;

    info!("transport - direct tls connection established");

    let (read_half, write_half) = tokio::io::split(tls_stream);

    Ok(DuplexByteChannel {
        input: Box::new(read_half),
        output: Box::new(write_half),
    })
}
