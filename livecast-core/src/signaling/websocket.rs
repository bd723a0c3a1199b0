//! WebSocket backing for a [`ChannelLink`]

use futures::{SinkExt, StreamExt};
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio_tungstenite::{connect_async, tungstenite::Message, MaybeTlsStream, WebSocketStream};
use tracing::{debug, error, warn};

use super::channel::ChannelLink;
use super::message::Envelope;
use crate::{Error, Result};

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Connect and spawn the reader/writer pumps. The returned link is the client end.
pub async fn open(url: &str, connect_timeout: Duration) -> Result<ChannelLink> {
    let (ws_stream, _) = tokio::time::timeout(connect_timeout, connect_async(url))
        .await
        .map_err(|_| {
            Error::SignalingUnavailable(format!("connect to {url} timed out after {connect_timeout:?}"))
        })?
        .map_err(|e| Error::SignalingUnavailable(format!("failed to connect to {url}: {e}")))?;

    let (write, read) = ws_stream.split();
    let (outbound_tx, outbound_rx) = mpsc::unbounded_channel();
    let (inbound_tx, inbound_rx) = mpsc::unbounded_channel();

    tokio::spawn(writer_task(write, outbound_rx));
    tokio::spawn(reader_task(read, inbound_tx));

    Ok(ChannelLink {
        outbound: outbound_tx,
        inbound: inbound_rx,
    })
}

async fn writer_task(
    mut write: futures::stream::SplitSink<WsStream, Message>,
    mut rx: mpsc::UnboundedReceiver<Envelope>,
) {
    while let Some(envelope) = rx.recv().await {
        let json = match envelope.to_json() {
            Ok(json) => json,
            Err(e) => {
                error!(error = %e, "Failed to encode signaling envelope");
                continue;
            }
        };
        if let Err(e) = write.send(Message::Text(json)).await {
            error!(error = %e, "Failed to send WebSocket message");
            break;
        }
    }

    // Sender side released: tell the server we are going away.
    if let Err(e) = write.close().await {
        debug!(error = %e, "WebSocket close handshake failed");
    }
    debug!("Signaling writer terminated");
}

async fn reader_task(
    mut read: futures::stream::SplitStream<WsStream>,
    tx: mpsc::UnboundedSender<Envelope>,
) {
    while let Some(frame) = read.next().await {
        match frame {
            Ok(Message::Text(text)) => match Envelope::from_json(&text) {
                Ok(envelope) => {
                    if tx.send(envelope).is_err() {
                        break;
                    }
                }
                Err(e) => warn!(error = %e, "Discarding malformed signaling frame"),
            },
            Ok(Message::Close(_)) => {
                debug!("WebSocket closed by server");
                break;
            }
            Err(e) => {
                warn!(error = %e, "WebSocket read error");
                break;
            }
            _ => {}
        }
    }

    debug!("Signaling reader terminated");
}
