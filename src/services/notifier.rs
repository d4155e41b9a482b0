// src/services/notifier.rs

//! Notification capability seam.
//!
//! The actual Telegram sink lives outside this crate. The library formats
//! messages and fires them at a `Notifier`; delivery is best-effort.

use tracing::info;

/// Telegram's hard message size limit; sinks chunk on newline boundaries
/// below this.
pub const MESSAGE_CHUNK_LIMIT: usize = 4096;

/// Fire-and-forget message sink.
pub trait Notifier: Send + Sync {
    fn send_message(&self, message: String);
}

/// Discards everything.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopNotifier;

impl Notifier for NoopNotifier {
    fn send_message(&self, _message: String) {}
}

/// Writes notifications to the log, one chunk per record.
#[derive(Debug, Clone, Copy, Default)]
pub struct LogNotifier;

impl Notifier for LogNotifier {
    fn send_message(&self, message: String) {
        for chunk in split_message(&message, MESSAGE_CHUNK_LIMIT) {
            info!(target: "notifier", "{chunk}");
        }
    }
}

/// Split a message into chunks of at most `limit` bytes, preferring newline
/// boundaries. A single line longer than the limit is split mid-line.
pub fn split_message(message: &str, limit: usize) -> Vec<String> {
    if message.len() <= limit {
        return vec![message.to_string()];
    }

    let mut chunks = Vec::new();
    let mut current = String::new();

    for line in message.split('\n') {
        let mut line = line;
        while line.len() > limit {
            if !current.is_empty() {
                chunks.push(std::mem::take(&mut current));
            }
            let split_at = floor_char_boundary(line, limit);
            chunks.push(line[..split_at].to_string());
            line = &line[split_at..];
        }

        let needed = if current.is_empty() {
            line.len()
        } else {
            current.len() + 1 + line.len()
        };
        if needed > limit {
            chunks.push(std::mem::take(&mut current));
        }
        if !current.is_empty() {
            current.push('\n');
        }
        current.push_str(line);
    }

    if !current.is_empty() {
        chunks.push(current);
    }

    chunks
}

fn floor_char_boundary(s: &str, index: usize) -> usize {
    let mut index = index.min(s.len());
    while index > 0 && !s.is_char_boundary(index) {
        index -= 1;
    }
    index
}
