//! Server-sent-event framing for the streaming relay.
//!
//! Chat-completion providers stream `data: <json>\n\n` frames terminated by
//! a literal `data: [DONE]` sentinel. The relay re-frames each payload after
//! the transformer has seen it, so only minimal parsing lives here: frame
//! splitting and data-line extraction.

/// Literal end-of-stream marker. Matched case-sensitively, exactly.
pub const DONE_SENTINEL: &str = "[DONE]";

/// Split the buffer into the first complete SSE frame and the remainder.
/// Frames are separated by a blank line (`\n\n`).
pub fn split_frame(buffer: &str) -> Option<(String, String)> {
    let idx = buffer.find("\n\n")?;
    let (frame, rest) = buffer.split_at(idx + 2);
    Some((frame.to_string(), rest.to_string()))
}

/// Extract the payload of the first `data:` line in a frame.
pub fn data_payload(frame: &str) -> Option<&str> {
    for line in frame.lines() {
        if let Some(rest) = line.strip_prefix("data:") {
            return Some(rest.trim_start());
        }
    }
    None
}

/// Format a payload as one caller-facing SSE frame.
pub fn format_frame(payload: &str) -> String {
    format!("data: {}\n\n", payload)
}
