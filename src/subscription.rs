use anyhow::Result;

use crate::stream::frames::Frame;

/// A source of event-stream frames. Implemented by the WebSocket
/// subscription; a test double can feed canned frames through the same
/// driver loop.
#[trait_variant::make(Send)]
pub trait Subscription {
    /// Next decodable frame, `None` once the stream is closed.
    async fn next(&mut self) -> Option<Result<Frame>>;
}
