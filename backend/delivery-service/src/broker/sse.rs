//! Server-Sent Events rendering of a subscription.

use std::convert::Infallible;
use std::time::Duration;

use actix_web::web::Bytes;
use futures::stream::{self, Stream};
use tokio::time::{interval_at, Instant, Interval, MissedTickBehavior};

use super::{ConnectionDropped, EventFrame, Subscription};

pub const KEEP_ALIVE: &str = ": keep-alive\n\n";

impl EventFrame {
    /// `id:`, `event:` and `data:` lines terminated by a blank line.
    pub fn to_sse(&self) -> String {
        let data = serde_json::to_string(&self.data).unwrap_or_else(|_| "null".to_string());
        format!("id: {}\nevent: {}\ndata: {}\n\n", self.id, self.event_type, data)
    }
}

/// Final frame telling the client why the stream ended.
pub fn dropped_frame(reason: ConnectionDropped) -> String {
    let data = serde_json::json!({ "reason": reason, "message": reason.to_string() });
    format!("event: connection_dropped\ndata: {data}\n\n")
}

struct StreamState {
    subscription: Subscription,
    heartbeat: Interval,
    finished: bool,
}

/// Frames as SSE chunks, with a keep-alive comment every `heartbeat`.
/// Dropping the stream drops the subscription.
pub fn event_stream(
    subscription: Subscription,
    heartbeat: Duration,
) -> impl Stream<Item = Result<Bytes, Infallible>> {
    let mut ticker = interval_at(Instant::now() + heartbeat, heartbeat);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    let state = StreamState {
        subscription,
        heartbeat: ticker,
        finished: false,
    };

    stream::unfold(state, |mut state| async move {
        if state.finished {
            return None;
        }

        let chunk = tokio::select! {
            next = state.subscription.next() => match next {
                Ok(frame) => frame.to_sse(),
                Err(reason) => {
                    tracing::debug!(
                        subscriber_id = %state.subscription.id(),
                        topic = %state.subscription.topic(),
                        reason = %reason,
                        "Event stream ended"
                    );
                    state.finished = true;
                    dropped_frame(reason)
                }
            },
            _ = state.heartbeat.tick() => KEEP_ALIVE.to_string(),
        };

        Some((Ok(Bytes::from(chunk)), state))
    })
}
