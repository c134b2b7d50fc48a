//! Bulk reply event stream: line framing, decoding, and the consumer task.
//!
//! The backend sends one JSON event per line. Server-sent-event framing
//! (`data:` prefixes, comment lines, blank separators) is accepted too, so the
//! same decoder serves a plain chunked body and an SSE endpoint.

use std::collections::VecDeque;
use std::sync::Arc;

use bytes::{Buf, Bytes, BytesMut};
use deck_logging::{deck_debug, deck_info, deck_warn};
use futures_util::stream::{self, BoxStream, Stream, StreamExt};
use jobdeck_core::{BulkEvent, MessageId, ResourceKey, SubscriptionId};
use serde::{Deserialize, Serialize};

use crate::client::JobBackend;
use crate::guard::{Lease, ResourceGuard, SubscriptionHandle};
use crate::{FailureKind, OpError};

/// Event payloads, one per item, already stripped of framing.
pub type EventLines = BoxStream<'static, Result<String, OpError>>;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct StreamSettings {
    /// Malformed lines in a row before the stream is given up on.
    pub max_consecutive_decode_errors: u32,
}

impl Default for StreamSettings {
    fn default() -> Self {
        Self {
            max_consecutive_decode_errors: 3,
        }
    }
}

/// Splits a byte stream into event payload lines.
#[derive(Debug, Default)]
pub struct LineDecoder {
    buffer: BytesMut,
}

impl LineDecoder {
    pub fn push(&mut self, chunk: &[u8]) -> Vec<String> {
        self.buffer.extend_from_slice(chunk);
        let mut lines = Vec::new();
        while let Some(newline) = self.buffer.iter().position(|byte| *byte == b'\n') {
            let line = self.buffer.split_to(newline);
            self.buffer.advance(1);
            if let Some(payload) = payload(&line) {
                lines.push(payload);
            }
        }
        lines
    }

    /// Flushes a final line that had no trailing newline.
    pub fn finish(&mut self) -> Option<String> {
        let rest = self.buffer.split();
        payload(&rest)
    }
}

fn payload(raw: &[u8]) -> Option<String> {
    let line = String::from_utf8_lossy(raw);
    let line = line.trim_end_matches('\r').trim();
    if line.is_empty() || line.starts_with(':') {
        return None;
    }
    if let Some(data) = line.strip_prefix("data:") {
        let data = data.trim_start();
        return (!data.is_empty()).then(|| data.to_string());
    }
    if ["event:", "id:", "retry:"]
        .iter()
        .any(|field| line.starts_with(field))
    {
        return None;
    }
    Some(line.to_string())
}

/// Adapts a raw body into payload lines. A transport error ends the stream after it is yielded.
pub fn decode_lines<S>(bytes: S) -> EventLines
where
    S: Stream<Item = Result<Bytes, OpError>> + Send + 'static,
{
    let state = (Box::pin(bytes), LineDecoder::default(), VecDeque::new(), false);
    stream::unfold(state, |(mut bytes, mut decoder, mut ready, mut done)| async move {
        loop {
            if let Some(line) = ready.pop_front() {
                return Some((Ok(line), (bytes, decoder, ready, done)));
            }
            if done {
                return None;
            }
            match bytes.next().await {
                Some(Ok(chunk)) => ready.extend(decoder.push(&chunk)),
                Some(Err(err)) => {
                    done = true;
                    return Some((Err(err), (bytes, decoder, ready, done)));
                }
                None => {
                    done = true;
                    ready.extend(decoder.finish());
                }
            }
        }
    })
    .boxed()
}

/// Receives everything the consumer task learns about its stream.
pub trait BulkSink: Send + Sync + 'static {
    fn started(&self, sub: SubscriptionId, message_ids: Vec<MessageId>);
    fn event(&self, sub: SubscriptionId, event: BulkEvent);
    fn decode_failed(&self, sub: SubscriptionId, message: String);
    fn failed(&self, sub: SubscriptionId, error: OpError);
}

#[derive(Clone)]
pub struct EventStreamConsumer {
    guard: ResourceGuard,
    settings: StreamSettings,
}

impl EventStreamConsumer {
    pub fn new(guard: ResourceGuard, settings: StreamSettings) -> Self {
        Self { guard, settings }
    }

    /// Opens the bulk reply stream and starts consuming it in the background.
    ///
    /// Only one bulk stream may be open at a time. The returned handle cancels
    /// the stream when released or dropped.
    pub async fn open(
        &self,
        backend: &dyn JobBackend,
        message_ids: Vec<MessageId>,
        sink: Arc<dyn BulkSink>,
    ) -> Result<SubscriptionHandle, OpError> {
        let lease = self.guard.acquire(ResourceKey::BulkReply)?;
        let handle = self.guard.handle(&lease);
        let lines = backend.open_bulk_stream(&message_ids).await?;
        if lease.token.is_cancelled() {
            return Err(OpError::new(
                FailureKind::Cancelled,
                "bulk reply cancelled while connecting",
            ));
        }
        deck_info!("Bulk reply stream open for {} messages", message_ids.len());
        sink.started(lease.sub, message_ids);
        tokio::spawn(consume(
            self.guard.clone(),
            lease,
            lines,
            sink,
            self.settings.clone(),
        ));
        Ok(handle)
    }
}

async fn consume(
    guard: ResourceGuard,
    lease: Lease,
    mut lines: EventLines,
    sink: Arc<dyn BulkSink>,
    settings: StreamSettings,
) {
    let Lease { key, sub, token } = lease;
    let limit = settings.max_consecutive_decode_errors.max(1);
    let mut decode_errors = 0u32;

    let reason = loop {
        let next = tokio::select! {
            biased;
            _ = token.cancelled() => break "cancelled",
            next = lines.next() => next,
        };
        if token.is_cancelled() {
            break "cancelled";
        }
        match next {
            Some(Ok(line)) => match serde_json::from_str::<BulkEvent>(&line) {
                Ok(event) => {
                    decode_errors = 0;
                    deck_debug!("Bulk event {}", event.kind());
                    let terminal = event.is_terminal();
                    sink.event(sub, event);
                    if terminal {
                        break "terminal event";
                    }
                }
                Err(err) => {
                    decode_errors += 1;
                    deck_warn!("Undecodable bulk event ({}/{}): {}", decode_errors, limit, err);
                    if decode_errors >= limit {
                        sink.failed(
                            sub,
                            OpError::new(
                                FailureKind::StreamDecode,
                                format!("{decode_errors} malformed events in a row: {err}"),
                            ),
                        );
                        break "decode errors";
                    }
                    sink.decode_failed(sub, err.to_string());
                }
            },
            Some(Err(err)) => {
                sink.failed(sub, err);
                break "transport error";
            }
            None => {
                sink.failed(
                    sub,
                    OpError::unreachable("stream ended before a terminal event"),
                );
                break "end of stream";
            }
        }
    };

    // The connection closes here and nowhere else.
    drop(lines);
    deck_info!("Bulk reply stream closed ({})", reason);
    guard.release(&key, sub);
}
