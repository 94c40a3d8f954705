pub mod client;
pub mod decoder;
pub mod endpoints;

pub use client::{UpstreamClient, UpstreamReply};
pub use decoder::{DecodedEvent, EventStreamDecoder, deduplicate_tool_calls, parse_bracket_tool_calls};
pub use endpoints::UpstreamEndpoints;

/// How much of an upstream error body to keep in logs.
pub(crate) const UPSTREAM_BODY_PREVIEW_CHARS: usize = 512;
