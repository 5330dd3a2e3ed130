//! Reconnecting private WebSocket driver shared by venue connectors
//!
//! Each venue supplies a [`StreamSession`] describing how to open, authenticate,
//! keep alive and parse its private position feed. The driver owns the
//! reconnect loop and exposes the feed as an infinite stream that stops only
//! when the consumer drops it.

use async_trait::async_trait;
use futures::stream::{self, BoxStream, StreamExt};
use futures_util::SinkExt;
use rand::Rng;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::interval;
use tokio_tungstenite::{connect_async, tungstenite::Message};
use tracing::{debug, error, info, warn};
use url::Url;

use super::traits::ConnectorResult;
use crate::domain::PositionEvent;
use crate::error::ConnectorError;

/// Maximum reconnection delay
const MAX_RECONNECT_DELAY_SECS: u64 = 60;

const CONNECT_TIMEOUT_SECS: u64 = 10;

/// Buffer between the socket task and the consumer
const CHANNEL_CAPACITY: usize = 256;

/// Connection parameters resolved right before each connect
#[derive(Debug, Clone)]
pub struct SessionPlan {
    pub url: String,
    /// Sent in order right after the socket opens (auth, subscribe)
    pub handshake: Vec<String>,
}

#[async_trait]
pub trait StreamSession: Send + Sync + 'static {
    fn label(&self) -> &'static str;

    /// Resolve the URL and handshake; called before every (re)connect
    async fn prepare(&self) -> ConnectorResult<SessionPlan>;

    /// Application-level keepalive run on `keepalive_interval`
    async fn keepalive(&self) -> ConnectorResult<()> {
        Ok(())
    }

    fn keepalive_interval(&self) -> Duration {
        Duration::from_secs(20)
    }

    /// Frame sent on the keepalive tick
    fn ping_frame(&self) -> Message {
        Message::Ping(Vec::new())
    }

    /// Decode one text frame into zero or more position events
    fn parse(&self, text: &str) -> Vec<PositionEvent>;
}

/// Spawn the socket task and expose it as a stream.
pub fn reconnecting_stream(session: Arc<dyn StreamSession>) -> BoxStream<'static, PositionEvent> {
    let (tx, rx) = mpsc::channel(CHANNEL_CAPACITY);
    tokio::spawn(run_session(session, tx));

    stream::unfold(rx, |mut rx| async move {
        let event = rx.recv().await?;
        Some((event, rx))
    })
    .boxed()
}

async fn run_session(session: Arc<dyn StreamSession>, tx: mpsc::Sender<PositionEvent>) {
    let mut attempt: u32 = 0;
    let max_delay = Duration::from_secs(MAX_RECONNECT_DELAY_SECS);

    info!(stream = session.label(), "Starting position stream");

    loop {
        if tx.is_closed() {
            debug!(stream = session.label(), "Position stream consumer dropped");
            return;
        }

        match connect_and_stream(session.as_ref(), &tx).await {
            Ok(()) => {
                info!(stream = session.label(), "Position stream closed normally");
                attempt = 0;
            }
            Err(e) => {
                attempt += 1;
                error!(stream = session.label(), attempt, "Position stream error: {}", e);
            }
        }

        if tx.is_closed() {
            return;
        }

        // Backoff with ±25% jitter
        let delay = (Duration::from_secs(1) * attempt.clamp(1, 60)).min(max_delay);
        let jitter_range = delay.as_millis() as u64 / 4;
        let jitter = rand::thread_rng().gen_range(0..=jitter_range);
        let final_delay = delay.saturating_sub(Duration::from_millis(jitter_range / 2))
            + Duration::from_millis(jitter);

        info!(
            stream = session.label(),
            "Reconnecting in {:?} (attempt {})",
            final_delay,
            attempt + 1
        );
        tokio::select! {
            _ = tokio::time::sleep(final_delay) => {}
            _ = tx.closed() => return,
        }
    }
}

async fn connect_and_stream(
    session: &dyn StreamSession,
    tx: &mpsc::Sender<PositionEvent>,
) -> ConnectorResult<()> {
    let plan = session.prepare().await?;
    let url = Url::parse(&plan.url)
        .map_err(|e| ConnectorError::rejected("url", format!("invalid WebSocket URL: {}", e)))?;

    info!(stream = session.label(), "Connecting to {}", url.host_str().unwrap_or("?"));

    let (ws_stream, _) = tokio::time::timeout(
        Duration::from_secs(CONNECT_TIMEOUT_SECS),
        connect_async(url.as_str()),
    )
    .await
    .map_err(|_| ConnectorError::TransientNetwork("WebSocket connection timeout".to_string()))??;

    let (mut write, mut read) = ws_stream.split();
    for frame in plan.handshake {
        write.send(Message::Text(frame)).await?;
    }

    info!(stream = session.label(), "Position stream connected");

    let mut keepalive = interval(session.keepalive_interval());
    keepalive.tick().await;

    loop {
        tokio::select! {
            msg = read.next() => {
                match msg {
                    Some(Ok(Message::Text(text))) => {
                        for event in session.parse(&text) {
                            if tx.send(event).await.is_err() {
                                return Ok(());
                            }
                        }
                    }
                    Some(Ok(Message::Ping(data))) => {
                        if let Err(e) = write.send(Message::Pong(data)).await {
                            error!(stream = session.label(), "Failed to send pong: {}", e);
                        }
                    }
                    Some(Ok(Message::Close(_))) => {
                        info!(stream = session.label(), "Received close frame");
                        break;
                    }
                    Some(Err(e)) => return Err(e.into()),
                    None => break,
                    _ => {}
                }
            }
            _ = keepalive.tick() => {
                if let Err(e) = session.keepalive().await {
                    warn!(stream = session.label(), "Stream keepalive failed: {}", e);
                }
                if let Err(e) = write.send(session.ping_frame()).await {
                    error!(stream = session.label(), "Failed to send ping: {}", e);
                    break;
                }
            }
            _ = tx.closed() => return Ok(()),
        }
    }

    Ok(())
}
