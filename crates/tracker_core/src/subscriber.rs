use std::time::Duration;

use anyhow::{anyhow, bail, Context, Result};
use async_trait::async_trait;
use futures::{SinkExt, Stream, StreamExt};
use tokio::sync::watch;
use tokio_tungstenite::{
    connect_async,
    tungstenite::{Error as WsError, Message},
};
use tracing::{debug, info, warn};
use url::Url;

use crate::{
    dispatch::Topic,
    stomp::{decode_all, decode_each, Command, Frame},
};

pub const DEFAULT_RECONNECT_DELAY: Duration = Duration::from_secs(5);
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// Receiver of everything the subscriber pulls off the broker.
#[async_trait]
pub trait EventSink: Send + Sync {
    async fn on_message(&self, destination: &str, body: &[u8]);
    async fn on_connection_change(&self, connected: bool);
}

#[derive(Debug, Clone)]
pub struct SubscriberConfig {
    pub broker_url: String,
    pub reconnect_delay: Duration,
    pub connect_timeout: Duration,
    pub topics: Vec<Topic>,
}

impl SubscriberConfig {
    pub fn new(broker_url: impl Into<String>) -> Self {
        Self {
            broker_url: broker_url.into(),
            reconnect_delay: DEFAULT_RECONNECT_DELAY,
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
            topics: Topic::ALL.to_vec(),
        }
    }
}

/// Long-lived STOMP-over-WebSocket consumer. Reconnects after a fixed delay
/// for as long as the task runs.
pub struct LiveEventSubscriber {
    config: SubscriberConfig,
}

impl LiveEventSubscriber {
    pub fn new(config: SubscriberConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &SubscriberConfig {
        &self.config
    }

    /// Runs until the surrounding task is aborted.
    pub async fn run(&self, sink: &dyn EventSink) {
        let (_never_stop, shutdown) = watch::channel(false);
        self.run_until(sink, shutdown).await;
    }

    /// Runs until `shutdown` flips to true or its sender is dropped. A live
    /// session is ended with a STOMP DISCONNECT before returning.
    pub async fn run_until(&self, sink: &dyn EventSink, mut shutdown: watch::Receiver<bool>) {
        let mut attempt: u64 = 0;
        loop {
            if stop_requested(&shutdown) {
                return;
            }
            attempt += 1;
            let mut connected = false;
            let ended = self.run_session(sink, &mut connected, &mut shutdown).await;
            match &ended {
                Ok(SessionEnd::Shutdown) => info!(
                    broker_url = %self.config.broker_url,
                    "subscriber: disconnected on shutdown"
                ),
                Ok(SessionEnd::Closed) => info!(
                    broker_url = %self.config.broker_url,
                    "subscriber: broker closed the session"
                ),
                Err(err) => warn!(
                    broker_url = %self.config.broker_url,
                    attempt,
                    error = %format!("{err:#}"),
                    "subscriber: broker session failed"
                ),
            }
            if connected {
                sink.on_connection_change(false).await;
                attempt = 0;
            }
            if matches!(ended, Ok(SessionEnd::Shutdown)) {
                return;
            }
            tokio::select! {
                _ = tokio::time::sleep(self.config.reconnect_delay) => {}
                _ = shutdown_requested(&mut shutdown) => return,
            }
        }
    }

    async fn run_session(
        &self,
        sink: &dyn EventSink,
        connected: &mut bool,
        shutdown: &mut watch::Receiver<bool>,
    ) -> Result<SessionEnd> {
        let url = Url::parse(&self.config.broker_url)
            .with_context(|| format!("invalid broker url: {}", self.config.broker_url))?;
        let host = url.host_str().unwrap_or("localhost").to_string();

        let (ws_stream, _) = connect_async(url.as_str())
            .await
            .with_context(|| format!("failed to connect websocket: {url}"))?;
        let (mut ws_writer, mut ws_reader) = ws_stream.split();

        ws_writer
            .send(Message::Text(Frame::connect(&host).to_text()?))
            .await
            .context("failed to send CONNECT frame")?;

        tokio::time::timeout(self.config.connect_timeout, await_connected(&mut ws_reader))
            .await
            .context("timed out waiting for CONNECTED")??;

        for (index, topic) in self.config.topics.iter().enumerate() {
            let frame = Frame::subscribe(&format!("sub-{index}"), topic.destination());
            ws_writer
                .send(Message::Text(frame.to_text()?))
                .await
                .with_context(|| format!("failed to subscribe to {}", topic.destination()))?;
        }

        *connected = true;
        sink.on_connection_change(true).await;
        info!(
            broker_url = %self.config.broker_url,
            topics = self.config.topics.len(),
            "subscriber: connected"
        );

        loop {
            let next = tokio::select! {
                _ = shutdown_requested(shutdown) => {
                    ws_writer
                        .send(Message::Text(Frame::disconnect().to_text()?))
                        .await
                        .context("failed to send DISCONNECT frame")?;
                    let _ = ws_writer.close().await;
                    return Ok(SessionEnd::Shutdown);
                }
                next = ws_reader.next() => next,
            };
            let Some(msg) = next else {
                return Ok(SessionEnd::Closed);
            };
            let msg = msg.context("websocket receive failed")?;
            if let Message::Close(_) = msg {
                return Ok(SessionEnd::Closed);
            }
            let Some(data) = message_bytes(msg) else {
                continue;
            };
            for decoded in decode_each(&data) {
                let frame = match decoded {
                    Ok(frame) => frame,
                    Err(err) => {
                        warn!(error = %err, "subscriber: dropping undecodable STOMP frame");
                        continue;
                    }
                };
                match frame.command {
                    Command::Message => match frame.header("destination") {
                        Some(destination) => sink.on_message(destination, &frame.body).await,
                        None => warn!("subscriber: MESSAGE frame without destination"),
                    },
                    Command::Error => bail!("broker sent ERROR: {}", error_text(&frame)),
                    other => debug!(command = %other, "subscriber: ignoring frame"),
                }
            }
        }
    }
}

enum SessionEnd {
    Closed,
    Shutdown,
}

fn stop_requested(shutdown: &watch::Receiver<bool>) -> bool {
    *shutdown.borrow() || shutdown.has_changed().is_err()
}

/// Resolves once shutdown is signalled or the signalling side is gone.
async fn shutdown_requested(shutdown: &mut watch::Receiver<bool>) {
    let _ = shutdown.wait_for(|stop| *stop).await;
}

async fn await_connected<S>(reader: &mut S) -> Result<Frame>
where
    S: Stream<Item = Result<Message, WsError>> + Unpin,
{
    while let Some(msg) = reader.next().await {
        let Some(data) = message_bytes(msg?) else {
            continue;
        };
        for frame in decode_all(&data)? {
            match frame.command {
                Command::Connected => return Ok(frame),
                Command::Error => bail!("broker rejected CONNECT: {}", error_text(&frame)),
                other => debug!(command = %other, "subscriber: frame before CONNECTED"),
            }
        }
    }
    Err(anyhow!("websocket closed before CONNECTED"))
}

fn message_bytes(msg: Message) -> Option<Vec<u8>> {
    match msg {
        Message::Text(text) => Some(text.into_bytes()),
        Message::Binary(bytes) => Some(bytes),
        _ => None,
    }
}

fn error_text(frame: &Frame) -> String {
    match frame.header("message") {
        Some(message) => message.to_string(),
        None => String::from_utf8_lossy(&frame.body).into_owned(),
    }
}

#[cfg(test)]
#[path = "tests/subscriber_tests.rs"]
mod tests;
