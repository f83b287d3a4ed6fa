//! Outbound chunking of streamed executor output.

use std::sync::Arc;
use std::time::Duration;

use chatbridge_protocol::{
    BrokerResult, MessageFormat, OutboundMessage, SessionKey, StreamEvent, Transport,
};

const MIN_BATCH_INTERVAL: Duration = Duration::from_millis(300);
const MAX_BATCH_INTERVAL: Duration = Duration::from_millis(500);
const DEFAULT_MAX_CHUNK_BYTES: usize = 3500;

/// Delivers rewritten stream chunks to one transport, splitting anything
/// larger than `max_chunk` bytes into consecutive sends. Empty chunks are
/// control frames and produce no output.
///
/// The clamped interval is reserved for time-based coalescing; the current
/// contract is "send promptly", so `flush` has nothing to do.
pub struct Batcher {
    #[allow(dead_code)]
    interval: Duration,
    max_chunk: usize,
    transport: Arc<dyn Transport>,
    key: SessionKey,
}

impl Batcher {
    pub fn new(
        interval: Duration,
        max_chunk: usize,
        transport: Arc<dyn Transport>,
        key: SessionKey,
    ) -> Self {
        let interval = interval.clamp(MIN_BATCH_INTERVAL, MAX_BATCH_INTERVAL);
        let max_chunk = if max_chunk == 0 {
            DEFAULT_MAX_CHUNK_BYTES
        } else {
            max_chunk
        };
        Self {
            interval,
            max_chunk,
            transport,
            key,
        }
    }

    pub async fn on_event(&self, event: &StreamEvent) -> BrokerResult<()> {
        if event.chunk.is_empty() {
            return Ok(());
        }
        self.send_chunked(&event.chunk, event.format).await
    }

    /// Safe to call after the runner completes; nothing is buffered.
    pub async fn flush(&self) -> BrokerResult<()> {
        Ok(())
    }

    async fn send_chunked(&self, text: &str, format: Option<MessageFormat>) -> BrokerResult<()> {
        let mut rest = text;
        while rest.len() > self.max_chunk {
            let split = floor_char_boundary(rest, self.max_chunk);
            let (head, tail) = rest.split_at(split);
            self.send(head, format).await?;
            rest = tail;
        }
        if !rest.is_empty() {
            self.send(rest, format).await?;
        }
        Ok(())
    }

    async fn send(&self, text: &str, format: Option<MessageFormat>) -> BrokerResult<()> {
        self.transport
            .send(OutboundMessage {
                session_key: self.key.clone(),
                text: text.to_owned(),
                format,
            })
            .await
    }
}

/// Largest index `<= max` that is a char boundary. `max` must be below
/// `text.len()` and above zero for splitting to make progress; callers
/// guarantee `text.len() > max >= 1`.
fn floor_char_boundary(text: &str, max: usize) -> usize {
    let mut index = max;
    while index > 0 && !text.is_char_boundary(index) {
        index -= 1;
    }
    if index == 0 {
        // A single code point wider than max; send it whole rather than
        // corrupt it.
        text.chars()
            .next()
            .map(char::len_utf8)
            .unwrap_or(text.len())
    } else {
        index
    }
}
