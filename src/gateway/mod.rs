//! Connection Gateway: per-subscriber session lifecycle over a minimal
//! newline-delimited-JSON TCP endpoint.
//!
//! Every connection gets `init` (current Snapshot), then `history`
//! (bounded event replay), then every live event as it's published.
//! Inbound is just `{"type":"ping"}` → `pong`; anything else is
//! ignored. A dropped connection just releases its bus subscription.

use serde::Deserialize;
use serde_json::json;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::{TcpListener, TcpStream};

use crate::event_bus::{Event, SharedEventBus};
use crate::state_hub::SharedStateHub;

#[derive(Debug, Deserialize)]
struct InboundMessage {
    #[serde(rename = "type")]
    kind: String,
}

pub struct ConnectionGateway {
    bus: SharedEventBus,
    state_hub: SharedStateHub,
    history_limit: usize,
}

impl ConnectionGateway {
    pub fn new(bus: SharedEventBus, state_hub: SharedStateHub, history_limit: usize) -> Self {
        Self {
            bus,
            state_hub,
            history_limit,
        }
    }

    #[tracing::instrument(skip(self), fields(bind = %bind_addr))]
    pub async fn serve(&self, bind_addr: &str) -> anyhow::Result<()> {
        let listener = TcpListener::bind(bind_addr).await?;
        tracing::info!("connection gateway listening");

        loop {
            let (stream, peer) = listener.accept().await?;
            tracing::debug!(%peer, "subscriber connected");
            if let Err(e) = self.handle_session(stream).await {
                tracing::debug!(%peer, error = %e, "subscriber session ended");
            }
        }
    }

    async fn handle_session(&self, stream: TcpStream) -> anyhow::Result<()> {
        let (read_half, mut write_half) = stream.into_split();
        let mut lines = BufReader::new(read_half).lines();

        let subscription = self.bus.subscribe().await;
        let mut receiver = subscription.receiver;
        let sub_id = subscription.id;

        let snapshot = self.state_hub.snapshot().await;
        self.send(&mut write_half, &Event::new("init", serde_json::to_value(&snapshot)?)).await?;

        let history = self.bus.history(self.history_limit).await;
        self.send(
            &mut write_half,
            &Event::new("history", serde_json::to_value(&history)?),
        )
        .await?;

        loop {
            tokio::select! {
                line = lines.next_line() => {
                    match line {
                        Ok(Some(text)) => {
                            if let Ok(msg) = serde_json::from_str::<InboundMessage>(&text) {
                                if msg.kind == "ping" {
                                    self.send(&mut write_half, &Event::new("pong", json!({}))).await?;
                                }
                                // Unknown inbound types are ignored, not fatal.
                            }
                        }
                        Ok(None) => break, // connection closed by peer
                        Err(e) => {
                            tracing::debug!(error = %e, "error reading from subscriber");
                            break;
                        }
                    }
                }
                event = receiver.recv() => {
                    match event {
                        Some(event) => {
                            if self.send(&mut write_half, &event).await.is_err() {
                                break;
                            }
                        }
                        None => break,
                    }
                }
            }
        }

        self.bus.unsubscribe(sub_id).await;
        Ok(())
    }

    async fn send(&self, out: &mut (impl AsyncWriteExt + Unpin), event: &Event) -> anyhow::Result<()> {
        let mut line = serde_json::to_string(event)?;
        line.push('\n');
        out.write_all(line.as_bytes()).await?;
        Ok(())
    }
}
