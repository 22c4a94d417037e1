//! Watch channel building blocks: frame decoding, liveness and reconnect backoff.

use std::time::Duration;

use bytes::BytesMut;
use kinformer_core::WatchEvent;
use metrics::counter;
use tokio::time::Instant;
use tracing::warn;

use crate::transport::WatchChunk;

pub const DEFAULT_HEARTBEAT: Duration = Duration::from_secs(30);
pub const DEFAULT_BACKOFF_BASE: Duration = Duration::from_secs(1);
/// 2^10 seconds.
pub const DEFAULT_BACKOFF_MAX: Duration = Duration::from_secs(1024);

/// Observable lifecycle of a watch channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ChannelState {
    Idle,
    Connecting,
    Open,
    Reconnecting,
    Closed,
}

/// Splits a byte stream into newline-terminated lines.
#[derive(Debug, Default)]
pub struct LineDecoder {
    buf: BytesMut,
}

impl LineDecoder {
    pub fn new() -> Self { Self::default() }

    pub fn push(&mut self, chunk: &[u8]) -> Vec<String> {
        self.buf.extend_from_slice(chunk);
        let mut out = Vec::new();
        while let Some(pos) = self.buf.iter().position(|&b| b == b'\n') {
            let line = self.buf.split_to(pos);
            let _ = self.buf.split_to(1); // drop '\n'
            match std::str::from_utf8(&line) {
                Ok(s) => out.push(s.trim_end_matches('\r').to_string()),
                Err(e) => warn!(error = %e, len = line.len(), "dropping non-utf8 watch line"),
            }
        }
        out
    }

    /// Bytes received after the last newline.
    pub fn pending(&self) -> usize { self.buf.len() }
}

/// Turns transport chunks into watch events. Undecodable input is logged and skipped.
#[derive(Debug, Default)]
pub struct FrameDecoder {
    lines: LineDecoder,
}

impl FrameDecoder {
    pub fn new() -> Self { Self::default() }

    pub fn decode(&mut self, chunk: WatchChunk) -> Vec<WatchEvent> {
        match chunk {
            WatchChunk::Frame(text) => decode_event(&text).into_iter().collect(),
            WatchChunk::Bytes(bytes) => self.lines.push(&bytes).iter().filter_map(|l| decode_event(l)).collect(),
        }
    }
}

pub fn decode_event(text: &str) -> Option<WatchEvent> {
    let text = text.trim();
    if text.is_empty() {
        return None;
    }
    match serde_json::from_str::<WatchEvent>(text) {
        Ok(ev) => Some(ev),
        Err(e) => {
            counter!("watch_decode_errors_total", 1u64);
            let head: String = text.chars().take(120).collect();
            warn!(error = %e, line = %head, "error while parsing watch event");
            None
        }
    }
}

/// Dead-man timer: the channel is presumed dead after 1.5x the server's
/// declared heartbeat interval without any frame.
#[derive(Debug, Clone, Copy)]
pub struct Heartbeat {
    timeout: Option<Duration>,
}

impl Heartbeat {
    /// `None` disables liveness tracking.
    pub fn new(interval: Option<Duration>) -> Self { Self { timeout: interval.map(|i| i * 3 / 2) } }

    pub fn timeout(&self) -> Option<Duration> { self.timeout }

    /// Deadline counted from now; call again after every received frame.
    pub fn deadline(&self) -> Option<Instant> { self.timeout.map(|t| Instant::now() + t) }
}

impl Default for Heartbeat {
    fn default() -> Self { Self::new(Some(DEFAULT_HEARTBEAT)) }
}

/// Sleeps until `deadline`, or forever when there is none.
pub async fn sleep_until_opt(deadline: Option<Instant>) {
    match deadline {
        Some(d) => tokio::time::sleep_until(d).await,
        None => std::future::pending::<()>().await,
    }
}

/// `delay = min(2^attempt * base, max)`; `attempt` grows per failure and resets on success.
#[derive(Debug, Clone)]
pub struct Backoff {
    attempt: u32,
    base: Duration,
    max: Duration,
}

impl Backoff {
    pub fn new(base: Duration, max: Duration) -> Self { Self { attempt: 0, base, max } }

    pub fn attempt(&self) -> u32 { self.attempt }

    pub fn next_delay(&mut self) -> Duration {
        let delay = 2u32
            .checked_pow(self.attempt)
            .and_then(|f| self.base.checked_mul(f))
            .map_or(self.max, |d| d.min(self.max));
        self.attempt = self.attempt.saturating_add(1);
        delay
    }

    pub fn reset(&mut self) { self.attempt = 0; }
}

impl Default for Backoff {
    fn default() -> Self { Self::new(DEFAULT_BACKOFF_BASE, DEFAULT_BACKOFF_MAX) }
}
