use anyhow::{Context, Result};
use async_trait::async_trait;
use futures::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tokio_tungstenite::{connect_async, tungstenite::Message};
use tracing::debug;

/// What the reading half of a transport reports upward.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportFrame {
    Text(String),
    /// The peer closed the session deliberately.
    Closed { reason: Option<String> },
    /// The link dropped without a close handshake.
    Failed(String),
}

/// One open transport session as a pair of channels.
///
/// Dropping `outbound` closes the session from the client side.
pub struct TransportLink {
    pub outbound: mpsc::UnboundedSender<String>,
    pub inbound: mpsc::UnboundedReceiver<TransportFrame>,
}

#[async_trait]
pub trait Connector: Send + Sync {
    async fn connect(&self, url: &str) -> Result<TransportLink>;
}

/// JSON text frames over a WebSocket.
pub struct WebSocketConnector;

#[async_trait]
impl Connector for WebSocketConnector {
    async fn connect(&self, url: &str) -> Result<TransportLink> {
        let (ws_stream, _) = connect_async(url)
            .await
            .with_context(|| format!("failed to connect websocket: {url}"))?;
        let (mut ws_writer, mut ws_reader) = ws_stream.split();
        let (outbound, mut outbound_rx) = mpsc::unbounded_channel::<String>();
        let (inbound_tx, inbound) = mpsc::unbounded_channel();

        tokio::spawn(async move {
            while let Some(text) = outbound_rx.recv().await {
                if let Err(err) = ws_writer.send(Message::Text(text)).await {
                    debug!(error = %err, "websocket write failed");
                    return;
                }
            }
            let _ = ws_writer.close().await;
        });

        tokio::spawn(async move {
            while let Some(msg) = ws_reader.next().await {
                let frame = match msg {
                    Ok(Message::Text(text)) => TransportFrame::Text(text),
                    Ok(Message::Close(close)) => {
                        let _ = inbound_tx.send(TransportFrame::Closed {
                            reason: close.map(|frame| frame.reason.to_string()),
                        });
                        return;
                    }
                    Ok(_) => continue,
                    Err(err) => {
                        let _ = inbound_tx.send(TransportFrame::Failed(format!(
                            "websocket receive failed: {err}"
                        )));
                        return;
                    }
                };
                if inbound_tx.send(frame).is_err() {
                    return;
                }
            }
            let _ = inbound_tx.send(TransportFrame::Failed("websocket stream ended".into()));
        });

        Ok(TransportLink { outbound, inbound })
    }
}
