//! Stateful, line-oriented Server-Sent Events parser.
//!
//! Handles:
//! - Partial frames across TCP chunks (trailing incomplete line kept in state)
//! - Multi-line `data` fields (joined with `\n`)
//! - CRLF and LF line endings
//! - Comment/keep-alive lines (`:...`)
//! - Buffer compaction to prevent unbounded growth
//!
//! The parser never fails: malformed lines are logged and ignored, matching
//! the "parser never fails" failure model — a single bad line can't take
//! down a stream.

use crate::types::SseEvent;
use bytes::{Buf, BytesMut};
use memchr::memchr;

/// Accumulator for the event currently being assembled.
#[derive(Default)]
struct PartialEvent {
    event: Option<String>,
    data: String,
    id: Option<String>,
    retry: Option<u64>,
    has_field: bool,
}

impl PartialEvent {
    fn take(&mut self) -> SseEvent {
        let event = SseEvent {
            event: self.event.take(),
            data: std::mem::take(&mut self.data),
            id: self.id.take(),
            retry: self.retry.take(),
        };
        self.has_field = false;
        event
    }
}

/// Line-based SSE parser. Owns a pending byte buffer and the
/// in-progress event accumulator; both persist across [`Self::parse_chunk`]
/// calls so a read can split anywhere — mid-line or mid-event — without
/// losing state.
pub struct SseParser {
    buffer: BytesMut,
    consumed: usize,
    current: PartialEvent,
}

impl SseParser {
    pub fn new() -> Self {
        Self::with_capacity(8192)
    }

    pub fn with_capacity(cap: usize) -> Self {
        Self {
            buffer: BytesMut::with_capacity(cap),
            consumed: 0,
            current: PartialEvent::default(),
        }
    }

    /// Append bytes to the pending buffer without parsing them yet.
    pub fn feed(&mut self, bytes: &[u8]) {
        if self.consumed > self.buffer.len() / 2 && self.consumed > 4096 {
            self.compact();
        }
        self.buffer.extend_from_slice(bytes);
    }

    fn compact(&mut self) {
        if self.consumed > 0 {
            self.buffer.advance(self.consumed);
            self.consumed = 0;
        }
    }

    /// Feed `bytes` and drain every complete event currently available.
    /// Equivalent to spec's `parse_chunk(state, bytes) -> (events, state')`,
    /// modelled here as mutation of `self` plus a returned event list.
    pub fn parse_chunk(&mut self, bytes: &[u8]) -> Vec<SseEvent> {
        self.feed(bytes);
        let mut events = Vec::new();
        while let Some(event) = self.next_event() {
            events.push(event);
        }
        events
    }

    /// Try to assemble one more event out of already-buffered bytes.
    /// Returns `None` when more data is needed; any lines already consumed
    /// while scanning remain folded into `self.current`.
    fn next_event(&mut self) -> Option<SseEvent> {
        loop {
            let line_end = {
                let buf = &self.buffer[self.consumed..];
                memchr(b'\n', buf)?
            };
            let start = self.consumed;
            let mut end = start + line_end;
            self.consumed = start + line_end + 1;
            if end > start && self.buffer.get(end - 1) == Some(&b'\r') {
                end -= 1;
            }
            let line = self.buffer[start..end].to_vec();

            if line.is_empty() {
                if self.current.has_field {
                    return Some(self.current.take());
                }
                continue;
            }
            if line[0] == b':' {
                tracing::debug!(
                    line = %String::from_utf8_lossy(&line),
                    "ignoring SSE comment/keep-alive line"
                );
                continue;
            }
            self.apply_field_line(&line);
        }
    }

    fn apply_field_line(&mut self, line: &[u8]) {
        let (field, value) = match memchr(b':', line) {
            Some(colon) => {
                let value_start = if line.get(colon + 1) == Some(&b' ') {
                    colon + 2
                } else {
                    colon + 1
                };
                (&line[..colon], &line[value_start..])
            }
            // SSE allows a bare field name with no colon, meaning an empty value.
            None => (line, &line[line.len()..]),
        };

        let Ok(value) = std::str::from_utf8(value) else {
            tracing::debug!("ignoring SSE field with non-UTF-8 value");
            return;
        };

        match field {
            b"data" => {
                if !self.current.data.is_empty() {
                    self.current.data.push('\n');
                }
                self.current.data.push_str(value);
                self.current.has_field = true;
            }
            b"event" => {
                self.current.event = Some(value.to_string());
                self.current.has_field = true;
            }
            b"id" => {
                self.current.id = Some(value.to_string());
                self.current.has_field = true;
            }
            b"retry" => match value.parse::<u64>() {
                Ok(ms) => {
                    self.current.retry = Some(ms);
                    self.current.has_field = true;
                }
                Err(_) => {
                    tracing::debug!(value, "ignoring non-integer retry field");
                }
            },
            other => {
                tracing::debug!(
                    field = %String::from_utf8_lossy(other),
                    "ignoring unrecognized SSE field"
                );
            }
        }
    }

    /// Emit whatever event is pending at end-of-stream, clearing state.
    pub fn flush(&mut self) -> Option<SseEvent> {
        if self.current.has_field {
            Some(self.current.take())
        } else {
            None
        }
    }

    /// Reset to a fresh state, discarding any partial event or buffered
    /// bytes. Used when a cancelled stream abandons its in-flight parse.
    pub fn reset(&mut self) {
        self.buffer.clear();
        self.consumed = 0;
        self.current = PartialEvent::default();
    }

    /// Bytes still pending in the buffer (not yet consumed into a line).
    pub fn pending_bytes(&self) -> usize {
        self.buffer.len() - self.consumed
    }
}

impl Default for SseParser {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn simple_event() {
        let mut parser = SseParser::new();
        let events = parser.parse_chunk(b"data: hello world\n\n");
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].data, "hello world");
        assert!(events[0].event.is_none());
    }

    #[test]
    fn multiline_data_joins_with_newline() {
        let mut parser = SseParser::new();
        let events = parser.parse_chunk(b"data: line1\ndata: line2\ndata: line3\n\n");
        assert_eq!(events[0].data, "line1\nline2\nline3");
    }

    #[test]
    fn event_and_id_fields() {
        let mut parser = SseParser::new();
        let events = parser.parse_chunk(b"event: message\nid: 42\ndata: payload\n\n");
        assert_eq!(events[0].event.as_deref(), Some("message"));
        assert_eq!(events[0].id.as_deref(), Some("42"));
        assert_eq!(events[0].data, "payload");
    }

    #[test]
    fn retry_field_parses_as_integer() {
        let mut parser = SseParser::new();
        let events = parser.parse_chunk(b"retry: 5000\ndata: x\n\n");
        assert_eq!(events[0].retry, Some(5000));
    }

    #[test]
    fn non_integer_retry_is_ignored_not_fatal() {
        let mut parser = SseParser::new();
        let events = parser.parse_chunk(b"retry: soon\ndata: x\n\n");
        assert_eq!(events[0].retry, None);
        assert_eq!(events[0].data, "x");
    }

    #[test]
    fn crlf_line_endings() {
        let mut parser = SseParser::new();
        let events = parser.parse_chunk(b"data: hello\r\n\r\n");
        assert_eq!(events[0].data, "hello");
    }

    #[test]
    fn comment_lines_are_ignored() {
        let mut parser = SseParser::new();
        let events = parser.parse_chunk(b": keep-alive\ndata: x\n\n");
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].data, "x");
    }

    #[test]
    fn zero_byte_data_line_yields_empty_data_event() {
        let mut parser = SseParser::new();
        let events = parser.parse_chunk(b"data:\n\n");
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].data, "");
    }

    #[test]
    fn partial_event_across_two_feeds() {
        let mut parser = SseParser::new();
        assert!(parser.parse_chunk(b"data: hel").is_empty());
        let events = parser.parse_chunk(b"lo\n\n");
        assert_eq!(events[0].data, "hello");
    }

    #[test]
    fn byte_by_byte_split_matches_single_shot() {
        let input = b"data: {\"x\":1}\n\ndata: {\"x\":2}\n\ndata: [DONE]\n\n";

        let mut whole = SseParser::new();
        let all_at_once = whole.parse_chunk(input);

        let mut split = SseParser::new();
        let mut incremental = Vec::new();
        for byte in input {
            incremental.extend(split.parse_chunk(&[*byte]));
        }

        assert_eq!(all_at_once.len(), incremental.len());
        for (a, b) in all_at_once.iter().zip(incremental.iter()) {
            assert_eq!(a.data, b.data);
        }
    }

    #[test]
    fn done_sentinel_detected_by_event_helper() {
        let mut parser = SseParser::new();
        let events = parser.parse_chunk(b"data: [DONE]\n\n");
        assert!(events[0].is_done_sentinel());
    }

    #[test]
    fn flush_emits_trailing_event_without_blank_line() {
        let mut parser = SseParser::new();
        assert!(parser.parse_chunk(b"data: trailing").is_empty());
        let flushed = parser.flush().unwrap();
        assert_eq!(flushed.data, "trailing");
        assert!(parser.flush().is_none());
    }

    #[test]
    fn blank_lines_with_no_fields_are_skipped() {
        let mut parser = SseParser::new();
        let events = parser.parse_chunk(b"\n\ndata: x\n\n");
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].data, "x");
    }

    #[test]
    fn reset_discards_partial_state() {
        let mut parser = SseParser::new();
        parser.parse_chunk(b"data: partial");
        parser.reset();
        assert!(parser.flush().is_none());
        assert_eq!(parser.pending_bytes(), 0);
    }
}
