// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//! Stream decoding: reassembles provider SSE bytes into normalized events.
//!
//! The transport hands over raw byte chunks whose boundaries are arbitrary
//! (a single SSE event may be split across TCP packets, or several events
//! may arrive in one read).  [`SseDecoder`] buffers bytes across reads and
//! drains only complete `\n`-terminated lines; each `data:` payload goes to
//! a provider-specific [`FrameParser`], which yields zero or more
//! [`StreamEvent`]s in frame order.

use std::sync::Arc;

use futures::{Stream, StreamExt};
use serde_json::Value;

use crate::{EventStream, ProviderError, StreamEvent};

/// Provider-specific frame parser.
///
/// Receives the payload of one SSE `data:` line and returns the normalized
/// events it encodes.  A parse failure is reported as a single
/// `Err(ProviderError::Parse)`; the decoder stops emitting after the first
/// parse error.
pub trait FrameParser: Send + Sync {
    fn parse_data(&self, data: &str) -> Vec<Result<StreamEvent, ProviderError>>;
}

/// Push decoder for SSE byte streams.
///
/// Feed it transport chunks as they arrive; it returns the events decoded
/// from every line completed by that chunk.  Bytes after the last newline
/// are carried over to the next call.
pub struct SseDecoder<P> {
    parser: P,
    buf: String,
    /// Set after the first parse error; all further input is discarded.
    failed: bool,
}

impl<P: FrameParser> SseDecoder<P> {
    pub fn new(parser: P) -> Self {
        Self {
            parser,
            buf: String::new(),
            failed: false,
        }
    }

    /// Decode one transport chunk.
    pub fn feed(&mut self, chunk: &[u8]) -> Vec<Result<StreamEvent, ProviderError>> {
        if self.failed {
            return Vec::new();
        }
        self.buf.push_str(&String::from_utf8_lossy(chunk));

        let mut events = Vec::new();
        while let Some(nl_pos) = self.buf.find('\n') {
            // Strip the optional Windows-style \r before \n.
            let line = self.buf[..nl_pos].trim_end_matches('\r').to_string();
            // Advance past the consumed line including the \n.
            self.buf = self.buf[nl_pos + 1..].to_string();

            let Some(data) = line.strip_prefix("data: ").or_else(|| line.strip_prefix("data:"))
            else {
                // Empty keep-alive lines, `event:` lines, and `:` comments
                // carry no payload in the dialects we decode.
                continue;
            };
            let data = data.trim();
            if data.is_empty() {
                continue;
            }
            for item in self.parser.parse_data(data) {
                let is_err = item.is_err();
                events.push(item);
                if is_err {
                    self.failed = true;
                    return events;
                }
            }
        }
        events
    }
}

/// Adapt a transport byte stream into an [`EventStream`].
///
/// Transport errors become `Transient` provider errors (an interrupted
/// stream is retryable); everything else goes through [`SseDecoder`].
pub fn decode_stream<S>(bytes: S, parser: Arc<dyn FrameParser>) -> EventStream
where
    S: Stream<Item = Result<Vec<u8>, ProviderError>> + Send + 'static,
{
    let decoder = SseDecoder::new(SharedParser(parser));
    let event_stream = bytes
        .scan(decoder, |decoder, chunk| {
            let events = match chunk {
                Ok(b) => decoder.feed(&b),
                Err(e) => vec![Err(e)],
            };
            std::future::ready(Some(events))
        })
        .flat_map(futures::stream::iter);
    Box::pin(event_stream)
}

/// Decode the body of a streaming HTTP response.
///
/// Non-success statuses are classified through [`ProviderError::from_status`]
/// before any decoding happens.
pub async fn decode_response(
    resp: reqwest::Response,
    parser: Arc<dyn FrameParser>,
) -> Result<EventStream, ProviderError> {
    if !resp.status().is_success() {
        let status = resp.status().as_u16();
        let body = resp.text().await.unwrap_or_default();
        return Err(ProviderError::from_status(status, &body));
    }
    tracing::debug!(status = resp.status().as_u16(), "decoding provider event stream");
    let bytes = resp.bytes_stream().map(|chunk| {
        chunk
            .map(|b| b.to_vec())
            .map_err(|e| ProviderError::network(e.to_string()))
    });
    Ok(decode_stream(bytes, parser))
}

struct SharedParser(Arc<dyn FrameParser>);

impl FrameParser for SharedParser {
    fn parse_data(&self, data: &str) -> Vec<Result<StreamEvent, ProviderError>> {
        self.0.parse_data(data)
    }
}

// ─── OpenAI-compatible wire dialect ──────────────────────────────────────────

/// Parser for the OpenAI-compatible chat-completions SSE dialect, which the
/// majority of gateways and local servers speak.
#[derive(Debug, Default)]
pub struct WireParser;

impl FrameParser for WireParser {
    fn parse_data(&self, data: &str) -> Vec<Result<StreamEvent, ProviderError>> {
        if data == "[DONE]" {
            return vec![Ok(StreamEvent::Done)];
        }
        let v: Value = match serde_json::from_str(data) {
            Ok(v) => v,
            Err(e) => {
                return vec![Err(ProviderError::parse(format!(
                    "invalid JSON in stream frame: {e}"
                )))]
            }
        };
        parse_chunk(&v)
    }
}

fn parse_chunk(v: &Value) -> Vec<Result<StreamEvent, ProviderError>> {
    // Usage-only chunk (emitted when stream_options.include_usage = true).
    if let Some(usage) = v.get("usage").filter(|u| !u.is_null()) {
        return vec![Ok(StreamEvent::Usage {
            input_tokens: usage["prompt_tokens"].as_u64().unwrap_or(0) as u32,
            output_tokens: usage["completion_tokens"].as_u64().unwrap_or(0) as u32,
        })];
    }

    let choice = &v["choices"][0];
    let delta = &choice["delta"];

    // Tool call delta — parallel calls are interleaved by "index"; each SSE
    // chunk carries exactly one tool-call delta in practice.
    if let Some(tc) = delta.get("tool_calls").and_then(|t| t.get(0)) {
        return vec![Ok(StreamEvent::ToolCallDelta {
            index: tc["index"].as_u64().unwrap_or(0) as u32,
            id: tc["id"].as_str().unwrap_or("").to_string(),
            name: tc["function"]["name"].as_str().unwrap_or("").to_string(),
            arguments: tc["function"]["arguments"]
                .as_str()
                .unwrap_or("")
                .to_string(),
        })];
    }

    // Thinking delta — `reasoning_content` (llama.cpp, DeepSeek) or
    // `reasoning` (OpenRouter) carry the same semantics.
    let thinking = delta
        .get("reasoning_content")
        .and_then(|c| c.as_str())
        .or_else(|| delta.get("reasoning").and_then(|c| c.as_str()));
    if let Some(t) = thinking {
        if !t.is_empty() {
            return vec![Ok(StreamEvent::ThinkingDelta(t.to_string()))];
        }
    }

    if let Some(text) = delta.get("content").and_then(|c| c.as_str()) {
        if !text.is_empty() {
            return vec![Ok(StreamEvent::TextDelta(text.to_string()))];
        }
    }

    // Role announcements, empty deltas, and finish_reason-only chunks carry
    // no event; the [DONE] sentinel that follows emits Done.
    Vec::new()
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
