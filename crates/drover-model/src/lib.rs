// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
pub mod decode;
mod error;
mod events;
mod mock;
mod provider;
mod types;

pub use decode::{decode_response, decode_stream, FrameParser, SseDecoder, WireParser};
pub use error::ProviderError;
pub use events::StreamEvent;
pub use mock::{MockProvider, ProviderScript, ScriptedMockProvider};
pub use provider::{ChatProvider, EventStream};
pub use types::*;
