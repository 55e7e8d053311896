use serde::{Deserialize, Serialize};

/// Token sent by the task page each time a shape lands in its bin.
pub const SORTED_TOKEN: &str = "sorted";
/// Token sent when the board is cleared and the round restarts.
pub const COMPLETED_TOKEN: &str = "completed";

/// An event delivered on a participant's live channel.
///
/// The channel carries opaque payloads; only the two known tokens have any
/// effect. Everything else is carried through as `Unknown` and ignored
/// without an error, so the channel never observes a failure.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LiveEvent {
    Sorted,
    Completed,
    Unknown(String),
}

impl LiveEvent {
    /// Decodes a raw payload from the live channel.
    ///
    /// Accepts the bare token as well as its JSON string encoding, which is
    /// what a browser client that stringifies the token before sending
    /// produces.
    pub fn decode(raw: &str) -> Self {
        match raw {
            SORTED_TOKEN => return Self::Sorted,
            COMPLETED_TOKEN => return Self::Completed,
            _ => {}
        }

        if let Ok(inner) = serde_json::from_str::<String>(raw) {
            match inner.as_str() {
                SORTED_TOKEN => return Self::Sorted,
                COMPLETED_TOKEN => return Self::Completed,
                _ => {}
            }
        }

        Self::Unknown(raw.to_string())
    }
}

/// Per-participant counters for the shape-sorting task.
///
/// A fresh participant starts at zero on both counters. Counters only ever
/// move forward; any reset belongs to whoever recreates the participant,
/// never to event handling.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskProgress {
    pub shapes_sorted: i64,
    pub rounds_completed: i64,
}

impl TaskProgress {
    /// Applies one live event to the counters.
    ///
    /// `Unknown` events leave both counters untouched; there is no failure
    /// case for any input.
    pub fn apply(&mut self, event: &LiveEvent) {
        match event {
            LiveEvent::Sorted => self.shapes_sorted += 1,
            LiveEvent::Completed => self.rounds_completed += 1,
            LiveEvent::Unknown(_) => {}
        }
    }
}
