//! Decoding of the Anthropic SSE body into normalized [`StreamEvent`]s.

use super::stream::{ContentBlockInfo, ContentDelta, StreamEvent as WireEvent};
use crate::provider::error::Error;
use crate::provider::http::SseParser;
use crate::provider::types::{MalformedEventPolicy, StreamEvent, UsageDelta};
use bytes::Bytes;
use futures::{Stream, StreamExt};
use std::collections::VecDeque;
use std::pin::Pin;
use tracing::{debug, warn};

/// Lazy sequence of normalized events for one response.
pub type EventStream = Pin<Box<dyn Stream<Item = Result<StreamEvent, Error>> + Send>>;

/// Incremental decoder. One instance per response body.
#[derive(Debug, Default)]
pub struct StreamDecoder {
    parser: SseParser,
    policy: MalformedEventPolicy,
}

impl StreamDecoder {
    pub fn new(policy: MalformedEventPolicy) -> Self {
        Self {
            parser: SseParser::new(),
            policy,
        }
    }

    /// Feed a raw chunk and return the events completed by it.
    pub fn feed(&mut self, chunk: &[u8]) -> Vec<StreamEvent> {
        self.parser
            .feed(chunk)
            .into_iter()
            .filter_map(|data| self.decode_line(&data))
            .collect()
    }

    /// End of input. An incomplete trailing line is dropped, never parsed.
    pub fn finish(&mut self) {
        let dropped = self.parser.finish();
        if dropped > 0 {
            debug!(bytes = dropped, "Discarding incomplete trailing SSE line");
        }
    }

    fn decode_line(&self, data: &str) -> Option<StreamEvent> {
        match serde_json::from_str::<WireEvent>(data) {
            Ok(event) => map_event(event),
            Err(e) => {
                warn!("Failed to parse Anthropic event: {e}\nData: {data}");
                match self.policy {
                    MalformedEventPolicy::Skip => None,
                    MalformedEventPolicy::Surface => Some(StreamEvent::Malformed(data.to_string())),
                }
            }
        }
    }
}

/// Collapse the provider taxonomy into the normalized contract.
fn map_event(event: WireEvent) -> Option<StreamEvent> {
    match event {
        WireEvent::MessageStart { message } => Some(StreamEvent::UsageDelta(UsageDelta {
            input_tokens: message.usage.input_tokens,
            output_tokens: message.usage.output_tokens,
            cache_write_tokens: message.usage.cache_creation_input_tokens,
            cache_read_tokens: message.usage.cache_read_input_tokens,
        })),
        WireEvent::MessageDelta { usage } => Some(StreamEvent::UsageDelta(UsageDelta {
            input_tokens: 0,
            output_tokens: usage.output_tokens,
            cache_write_tokens: None,
            cache_read_tokens: None,
        })),
        WireEvent::ContentBlockStart {
            content_block: ContentBlockInfo::Text { text },
        } => Some(StreamEvent::TextDelta(text)),
        WireEvent::ContentBlockDelta {
            delta: ContentDelta::Text { text },
        } => Some(StreamEvent::TextDelta(text)),
        WireEvent::ContentBlockStart { .. }
        | WireEvent::ContentBlockDelta { .. }
        | WireEvent::Other => None,
    }
}

struct DecodeState<S> {
    bytes: Pin<Box<S>>,
    decoder: StreamDecoder,
    ready: VecDeque<StreamEvent>,
    done: bool,
}

/// Wrap a byte stream into a lazy event stream.
///
/// Events come out in wire order, held back only until their line is complete.
/// A transport error is yielded once and ends the stream.
pub fn decode_stream<S, E>(bytes: S, policy: MalformedEventPolicy) -> EventStream
where
    S: Stream<Item = Result<Bytes, E>> + Send + 'static,
    E: Into<Error> + Send + 'static,
{
    let state = DecodeState {
        bytes: Box::pin(bytes),
        decoder: StreamDecoder::new(policy),
        ready: VecDeque::new(),
        done: false,
    };

    Box::pin(futures::stream::unfold(state, |mut state| async move {
        loop {
            if let Some(event) = state.ready.pop_front() {
                return Some((Ok(event), state));
            }
            if state.done {
                return None;
            }
            match state.bytes.next().await {
                Some(Ok(chunk)) => {
                    let events = state.decoder.feed(&chunk);
                    state.ready.extend(events);
                }
                Some(Err(e)) => {
                    state.done = true;
                    return Some((Err(e.into()), state));
                }
                None => {
                    state.decoder.finish();
                    state.done = true;
                }
            }
        }
    }))
}
