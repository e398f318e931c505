/*
 * Copyright Bret Ambrose. All Rights Reserved.
 * SPDX-License-Identifier: Apache-2.0.
 */

/*!
Websocket transport path: opens a Sigv4-signed websocket and re-streams its binary frames
through an internally-bound byte pipe so the session can treat it as a socket.
 */

use crate::config::TlsOptions;
use crate::error::{IotError, IotResult};
use crate::signing::{sign_websocket_url, CredentialsProvider, SkewAdjustedClock};
use crate::transport::DuplexByteChannel;

use chrono::{DateTime, Utc};
use futures_util::{SinkExt, StreamExt};
use log::*;
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, DuplexStream};
use tokio::net::TcpStream;
use tokio_rustls::TlsConnector;
use tokio_tungstenite::{client_async, WebSocketStream};
use tungstenite::client::IntoClientRequest;
use tungstenite::handshake::client::generate_key;
use tungstenite::Message;

pub(crate) const WEBSOCKET_SUBPROTOCOL : &str = "mqttv3.1";
pub(crate) const WEBSOCKET_TLS_PORT : u16 = 443;

// sized so a maximal mqtt message crosses the pipe without partial reads; the session's
// decoder does not recover from mid-message truncation
pub(crate) const INTERNAL_PIPE_CAPACITY : usize = 128 * 1024;

struct HandshakeRequest {
    handshake_builder: http::request::Builder,
}

impl IntoClientRequest for HandshakeRequest {
    fn into_client_request(self) -> tungstenite::Result<tungstenite::handshake::client::Request> {
        let final_request = self.handshake_builder.body(())?;
        Ok(tungstenite::handshake::client::Request::from(final_request))
    }
}

fn create_websocket_handshake_request(signed_url: &str, host: &str) -> http::request::Builder {
    http::Request::builder()
        .uri(signed_url)
        .version(http::Version::HTTP_11)
        .header("Sec-WebSocket-Protocol", WEBSOCKET_SUBPROTOCOL)
        .header("Sec-WebSocket-Key", generate_key())
        .header("Connection", "Upgrade")
        .header("Upgrade", "websocket")
        .header("Sec-WebSocket-Version", 13)
        .header("Host", host)
}

pub(crate) async fn make_signed_websocket_channel(endpoint: String, region: String, credentials_provider: Arc<dyn CredentialsProvider>, clock: Arc<SkewAdjustedClock>, tls_options: TlsOptions) -> IotResult<DuplexByteChannel> {
    debug!("transport - fetching credentials for websocket url signing");
    let credentials = credentials_provider.fetch_credentials().await
        .map_err(IotError::new_credentials_fetch_failure)?;

    let signed_url = sign_websocket_url(&endpoint, &region, &credentials, clock.now())?;

    debug!("transport - opening websocket connection to {}:{}", endpoint, WEBSOCKET_TLS_PORT);
    let tcp_stream = TcpStream::connect((endpoint.as_str(), WEBSOCKET_TLS_PORT)).await
        .map_err(IotError::new_connection_establishment_failure)?;

    let domain = rustls_pki_types::ServerName::try_from(endpoint.clone())?;
    let connector = TlsConnector::from(tls_options.config.clone());
    let tls_stream = connector.connect(domain, tcp_stream).await
        .map_err(IotError::new_connection_establishment_failure)?;

    let handshake_request = HandshakeRequest {
        handshake_builder: create_websocket_handshake_request(&signed_url, &endpoint)
    };

    let (websocket_stream, response) =
        match client_async(handshake_request, tls_stream).await {
            Ok(success) => { success }
            Err(error) => {
                // a signature invalidated by device clock skew surfaces here as a rejected
                // upgrade; the rejection still advertises the server's time, so record it
                // and the retry will sign with a corrected timestamp
                if let tungstenite::Error::Http(rejection) = &error {
                    observe_server_date(&clock, rejection.headers());
                }
                return Err(IotError::new_connection_establishment_failure(error));
            }
        };

    observe_server_date(&clock, response.headers());

    info!("transport - websocket connection established");

    Ok(bridge_websocket(websocket_stream))
}

fn observe_server_date(clock: &SkewAdjustedClock, headers: &http::HeaderMap) {
    let Some(value) = headers.get(http::header::DATE) else { return };
    let Ok(date_string) = value.to_str() else { return };

    match DateTime::parse_from_rfc2822(date_string) {
        Ok(server_time) => {
            debug!("transport - correcting signing clock against server date header");
            clock.set_server_time(server_time.with_timezone(&Utc));
        }
        Err(error) => {
            warn!("transport - ignoring unparseable date header \"{}\": {}", date_string, error);
        }
    }
}

/// Binds a websocket to a fresh internal byte pipe and hands the session-facing endpoints
/// back as a duplex channel.  A pump task owns the websocket for the rest of its life; it
/// exits when either side closes, which in turn closes the other side.
pub(crate) fn bridge_websocket<S>(websocket: WebSocketStream<S>) -> DuplexByteChannel where S : AsyncRead + AsyncWrite + Send + Unpin + 'static {
    let (session_side, bridge_side) = tokio::io::duplex(INTERNAL_PIPE_CAPACITY);
    let (session_read, session_write) = tokio::io::split(session_side);

    tokio::spawn(run_websocket_pump(websocket, bridge_side));

    DuplexByteChannel {
        input: Box::new(session_read),
        output: Box::new(session_write),
    }
}

async fn run_websocket_pump<S>(mut websocket: WebSocketStream<S>, bridge_side: DuplexStream) where S : AsyncRead + AsyncWrite + Send + Unpin + 'static {
    let (mut pipe_reader, mut pipe_writer) = tokio::io::split(bridge_side);
    let mut outbound_frame : [u8; 4096] = [0; 4096];

    loop {
        tokio::select! {
            // outbound session bytes become binary websocket messages, unbuffered
            read_result = pipe_reader.read(outbound_frame.as_mut_slice()) => {
                match read_result {
                    Ok(0) => {
                        debug!("websocket pump - session streams dropped, shutting down");
                        break;
                    }
                    Ok(bytes_read) => {
                        if let Err(error) = websocket.send(Message::Binary(outbound_frame[..bytes_read].to_vec())).await {
                            info!("websocket pump - send failed: {:?}", error);
                            break;
                        }
                    }
                    Err(error) => {
                        info!("websocket pump - pipe read failed: {:?}", error);
                        break;
                    }
                }
            }
            // inbound binary messages are written into the pipe in order and in full
            message_result = websocket.next() => {
                match message_result {
                    Some(Ok(Message::Binary(data))) => {
                        if let Err(error) = pipe_writer.write_all(&data).await {
                            info!("websocket pump - pipe write failed: {:?}", error);
                            break;
                        }
                    }
                    Some(Ok(Message::Ping(_))) | Some(Ok(Message::Pong(_))) => {
                        // pings are answered by the framing layer on the next flush
                    }
                    Some(Ok(Message::Close(_))) => {
                        info!("websocket pump - close frame received");
                        break;
                    }
                    Some(Ok(message)) => {
                        // non-binary payloads are a protocol violation at this layer
                        warn!("websocket pump - discarding non-binary message: {:?}", message);
                    }
                    Some(Err(error)) => {
                        info!("websocket pump - websocket read failed: {:?}", error);
                        break;
                    }
                    None => {
                        info!("websocket pump - websocket stream ended");
                        break;
                    }
                }
            }
        }
    }

    let _ = websocket.close(None).await;
}
