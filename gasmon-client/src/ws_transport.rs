//! Transport WebSocket du canal push (`GET /ws` du kernel).
//!
//! Chaque `open()` établit une socket et lance une tâche passerelle entre la
//! socket et les deux canaux de `PushConnection`. La tâche s'arrête quand le
//! serveur ferme, quand la socket échoue ou quand le client lâche `outbound`.

use futures_util::future::BoxFuture;
use futures_util::{SinkExt, StreamExt};
use gasmon_common::{ClientCommand, PushConnection, PushError, PushTransport, ServerFrame};
use tokio::sync::mpsc;
use tokio_tungstenite::{connect_async, tungstenite::Message};
use tracing::{debug, warn};

#[derive(Debug, Clone)]
pub struct WsTransport {
    url: String,
}

impl WsTransport {
    pub fn new(url: impl Into<String>) -> Self {
        Self { url: url.into() }
    }
}

impl PushTransport for WsTransport {
    fn open(&self) -> BoxFuture<'_, Result<PushConnection, PushError>> {
        Box::pin(async move {
            let (stream, _) = connect_async(self.url.as_str())
                .await
                .map_err(|e| PushError::Connect(e.to_string()))?;
            let (mut sink, mut source) = stream.split();

            let (cmd_tx, mut cmd_rx) = mpsc::unbounded_channel::<ClientCommand>();
            let (frame_tx, frame_rx) = mpsc::unbounded_channel::<ServerFrame>();

            tokio::spawn(async move {
                loop {
                    tokio::select! {
                        cmd = cmd_rx.recv() => match cmd {
                            Some(cmd) => {
                                let text = match serde_json::to_string(&cmd) {
                                    Ok(text) => text,
                                    Err(e) => {
                                        warn!(error = %e, "Command serialization failed");
                                        continue;
                                    }
                                };
                                if let Err(e) = sink.send(Message::Text(text)).await {
                                    warn!(error = %e, "WebSocket send failed");
                                    break;
                                }
                            }
                            None => {
                                let _ = sink.close().await;
                                break;
                            }
                        },
                        msg = source.next() => match msg {
                            Some(Ok(Message::Text(text))) => match serde_json::from_str::<ServerFrame>(&text) {
                                Ok(frame) => {
                                    if frame_tx.send(frame).is_err() {
                                        break;
                                    }
                                }
                                Err(e) => debug!(error = %e, "Ignoring malformed server frame"),
                            },
                            Some(Ok(Message::Close(_))) | None => break,
                            Some(Ok(_)) => {}
                            Some(Err(e)) => {
                                warn!(error = %e, "WebSocket receive failed");
                                break;
                            }
                        },
                    }
                }
                debug!("WebSocket bridge closed");
            });

            Ok(PushConnection { outbound: cmd_tx, inbound: frame_rx })
        })
    }
}
