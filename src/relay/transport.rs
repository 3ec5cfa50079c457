/**
 * ============================================================================
 * TRANSPORT ADAPTER MODULE
 * ============================================================================
 *
 * PURPOSE: Feed raw frames from a live connection into the relay
 *
 * FrameHandler is the only ingress seam: anything that can observe raw
 * transport frames (a socket tap, a replayed log, a test) calls
 * `on_raw_frame` once per frame.
 *
 * WebSocketSource is the bundled adapter. It connects to an Engine.IO
 * WebSocket endpoint, answers keepalive pings, joins the default namespace
 * after the open packet, and hands every text frame to the handler.
 *
 * ============================================================================
 */

use crate::relay::error::TransportError;
use futures_util::{SinkExt, StreamExt};
use once_cell::sync::Lazy;
use regex::Regex;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::time::timeout;
use tokio_tungstenite::{connect_async, tungstenite::Message};

/**
 * Receiver of raw transport frames
 * Called once per frame, in arrival order
 */
pub trait FrameHandler: Send + Sync {
    fn on_raw_frame(&self, frame: &str);
}

static CONTEXT_PATTERN: Lazy<Option<Regex>> =
    Lazy::new(|| Regex::new(r"[?&]context=([0-9a-fA-F\-]{16,64})").ok());

/**
 * Capture context from a page URL's `context=` query parameter
 */
pub fn extract_context(url: &str) -> Option<String> {
    let pattern = CONTEXT_PATTERN.as_ref()?;
    pattern
        .captures(url)
        .and_then(|caps| caps.get(1))
        .map(|m| m.as_str().to_string())
}

const ENGINE_PING: &str = "2";
const ENGINE_PONG: &str = "3";
const SOCKET_CONNECT: &str = "40";

/**
 * WebSocket frame source
 */
pub struct WebSocketSource {
    url: String,
    connect_timeout: Duration,
    handler: Arc<dyn FrameHandler>,
}

impl WebSocketSource {
    pub fn new(url: impl Into<String>, handler: Arc<dyn FrameHandler>) -> Self {
        Self {
            url: url.into(),
            connect_timeout: Duration::from_secs(10),
            handler,
        }
    }

    pub fn with_connect_timeout(mut self, connect_timeout: Duration) -> Self {
        self.connect_timeout = connect_timeout;
        self
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    /**
     * Run one connection until the peer closes it or shutdown is signalled
     * Returns the number of frames delivered to the handler
     */
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) -> Result<u64, TransportError> {
        log::info!("Connecting to {}", self.url);
        let (mut ws, _response) = timeout(self.connect_timeout, connect_async(self.url.as_str()))
            .await
            .map_err(|_| TransportError::ConnectTimeout {
                url: self.url.clone(),
                timeout: self.connect_timeout,
            })??;
        log::info!("Connected to {}", self.url);

        let mut frames = 0u64;
        loop {
            tokio::select! {
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        log::info!("Closing frame source {}", self.url);
                        let _ = ws.close(None).await;
                        return Ok(frames);
                    }
                }
                next = ws.next() => {
                    let Some(message) = next else {
                        log::info!("Frame source {} ended", self.url);
                        return Ok(frames);
                    };
                    let text = match message? {
                        Message::Text(text) => text,
                        Message::Binary(bytes) => match String::from_utf8(bytes) {
                            Ok(text) => text,
                            Err(_) => {
                                log::trace!("Skipping non-UTF-8 binary frame");
                                continue;
                            }
                        },
                        Message::Close(frame) => {
                            log::info!("Frame source {} closed: {:?}", self.url, frame);
                            return Ok(frames);
                        }
                        _ => continue,
                    };

                    frames += 1;
                    self.handler.on_raw_frame(&text);

                    if text == ENGINE_PING {
                        ws.send(Message::Text(ENGINE_PONG.to_string())).await?;
                    } else if text.starts_with('0') {
                        ws.send(Message::Text(SOCKET_CONNECT.to_string())).await?;
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_extract_context_from_page_url() {
        assert_eq!(
            extract_context("https://apex.prosperousuniverse.com/?context=0123456789abcdef01"),
            Some("0123456789abcdef01".to_string())
        );
        assert_eq!(
            extract_context("https://x.test/app?tab=2&context=aaaa-bbbb-cccc-dddd&x=1"),
            Some("aaaa-bbbb-cccc-dddd".to_string())
        );
    }

    #[test]
    fn test_extract_context_rejects_short_or_missing() {
        assert_eq!(extract_context("https://x.test/?context=abc"), None);
        assert_eq!(extract_context("https://x.test/?other=0123456789abcdef"), None);
        assert_eq!(extract_context("https://x.test/#context=0123456789abcdef"), None);
    }
}
