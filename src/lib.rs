/*
 * Copyright Bret Ambrose. All Rights Reserved.
 * SPDX-License-Identifier: Apache-2.0.
 */

/*!
This crate provides the connection core of an MQTT311 client for cloud IoT message brokers
that authenticate either by mutual TLS with an X509 client identity or by a Sigv4-signed
websocket upgrade.

The crate owns three tightly-coupled concerns:

* the connection lifecycle: connect, disconnect, reconnect with exponential backoff,
  connection-age-based backoff restore, automatic resubscription, and clean/persistent
  session semantics
* the dual transport plumbing: direct TLS sockets on one path and, on the other, a websocket
  whose binary frames are re-streamed through an internally-bound byte pipe so the MQTT codec
  can consume it as if it were a socket
* subscription routing and acknowledgement bookkeeping: topic-filter matching with `+`/`#`
  wildcards, per-subscription callback dispatch, and correlation of QoS 1 acknowledgements to
  user completion callbacks by packet identifier

The MQTT wire codec itself is deliberately *not* part of this crate.  The client consumes it
through the [`session::MqttSession`] trait; any codec that can frame MQTT311 over a pair of
byte streams and report lifecycle events can sit behind the client.

# Usage

To use this crate, you'll first need to add it to your project's Cargo.toml:

```toml
[dependencies]
basalt-iot = "0.3"
```

(Temporary) If your project does not include [`tokio`](https://crates.io/crates/tokio), you
will need to add it too:

```toml
[dependencies]
tokio = { version = "1", features = ["full"] }
```

# Example: Connect with a mutual-TLS identity

```no_run
use basalt_iot::client::IotClient;
use basalt_iot::config::{ClientConfigBuilder, TlsOptionsBuilder};
use basalt_iot::transport::TransportSpec;
use std::sync::Arc;
use tokio::runtime::Handle;

# fn make_session_factory() -> basalt_iot::session::SessionFactoryFn { unimplemented!() }
#
#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let config = ClientConfigBuilder::new("my-thing")
        .with_keep_alive_seconds(60)
        .build();

    let tls_options = TlsOptionsBuilder::new_with_mtls_from_path("cert.pem", "key.pem")?
        .build_rustls()?;

    let client = IotClient::new(config, make_session_factory(), &Handle::current())?;

    client.connect(
        TransportSpec::DirectTls {
            endpoint: "example.iot.us-east-1.amazonaws.com".to_string(),
            port: 8883,
            tls_options,
        },
        Arc::new(|state| { println!("connection state: {}", state); }))?;

    // <subscribe, publish, ...>

    Ok(())
}
```

# Example: Connect over a Sigv4-signed websocket

```no_run
use basalt_iot::client::IotClient;
use basalt_iot::config::ClientConfigBuilder;
use basalt_iot::signing::{Credentials, StaticCredentialsProvider};
use basalt_iot::transport::TransportSpec;
use std::sync::Arc;
use tokio::runtime::Handle;

# fn make_session_factory() -> basalt_iot::session::SessionFactoryFn { unimplemented!() }
#
#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let config = ClientConfigBuilder::new("my-thing").build();
    let client = IotClient::new(config, make_session_factory(), &Handle::current())?;

    let credentials_provider = Arc::new(StaticCredentialsProvider::new(Credentials {
        access_key_id: "<access key>".to_string(),
        secret_access_key: "<secret key>".to_string(),
        session_token: None,
    }));

    client.connect(
        TransportSpec::SignedWebsocket {
            endpoint: "example.iot.us-east-1.amazonaws.com".to_string(),
            region: "us-east-1".to_string(),
            credentials_provider,
        },
        Arc::new(|state| { println!("connection state: {}", state); }))?;

    // <subscribe, publish, ...>

    Ok(())
}
```
*/

#![warn(missing_docs)]

pub mod client;
pub mod config;
pub mod error;
pub mod routing;
pub mod session;
pub mod signing;
pub mod transport;

pub use client::{ConnectionState, IotClient, StatusCallback};
pub use config::{ClientConfig, ClientConfigBuilder, LastWill, QualityOfService, TlsOptions, TlsOptionsBuilder};
pub use error::{IotError, IotResult};
pub use transport::TransportSpec;
