//! # Event frames
//!
//! Text protocol spoken on the producer port. An event is a run of
//! `field: value` lines ended by a blank line:
//!
//! ```text
//! event: appConnect
//! data: demoapp
//!
//! data: provide demo
//! data: P .hinge/open
//!
//! ```
//!
//! - `event` sets the type (default `message`)
//! - each `data` line appends one payload line
//! - `id` sets the optional event id
//! - lines starting with `:` are comments
//! - `\n`, `\r\n` and a lone `\r` all end a line
//!
//! Closing the stream flushes a pending event.

use bytes::{Buf, BufMut, BytesMut};
use tokio_util::codec::{Decoder, Encoder};

use crate::error::ProtocolError;

pub const DEFAULT_MAX_LINE_LENGTH: usize = 64 * 1024;

/// Event type used when no `event:` line is present.
pub const MESSAGE: &str = "message";

/// A decoded or to-be-sent event.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Event {
    pub event_type: String,
    pub data: String,
    pub id: Option<String>,
}

impl Event {
    pub fn new(event_type: impl Into<String>, data: impl Into<String>) -> Self {
        Self {
            event_type: event_type.into(),
            data: data.into(),
            id: None,
        }
    }

    pub fn message(data: impl Into<String>) -> Self {
        Self::new(MESSAGE, data)
    }

    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = Some(id.into());
        self
    }
}

#[derive(Default)]
struct Pending {
    event_type: Option<String>,
    data: String,
    id: Option<String>,
    seen: bool,
}

impl Pending {
    fn take(&mut self) -> Option<Event> {
        if !std::mem::take(&mut self.seen) {
            return None;
        }
        let mut data = std::mem::take(&mut self.data);
        if data.ends_with('\n') {
            data.pop();
        }
        Some(Event {
            event_type: self.event_type.take().unwrap_or_else(|| MESSAGE.to_string()),
            data,
            id: self.id.take(),
        })
    }
}

/// Stateful codec for event frames. One instance per connection.
pub struct EventCodec {
    max_line_length: usize,
    pending: Pending,
    // Last chunk ended in `\r`; a leading `\n` in the next chunk belongs to it.
    skip_lf: bool,
}

impl Default for EventCodec {
    fn default() -> Self {
        Self::new()
    }
}

impl EventCodec {
    pub fn new() -> Self {
        Self::with_max_line_length(DEFAULT_MAX_LINE_LENGTH)
    }

    pub fn with_max_line_length(max_line_length: usize) -> Self {
        Self {
            max_line_length,
            pending: Pending::default(),
            skip_lf: false,
        }
    }

    /// Feed one complete line. Returns an event when the line ends one.
    fn process_line(&mut self, line: &[u8]) -> Result<Option<Event>, ProtocolError> {
        if line.is_empty() {
            return Ok(self.pending.take());
        }
        let line = std::str::from_utf8(line).map_err(|_| ProtocolError::InvalidUtf8("event line"))?;
        if line.starts_with(':') {
            return Ok(None);
        }
        let (field, value) = match line.split_once(':') {
            Some((field, value)) => (field, value.strip_prefix(' ').unwrap_or(value)),
            None => (line, ""),
        };
        match field {
            "event" => {
                self.pending.event_type = Some(value.to_string());
                self.pending.seen = true;
            }
            "data" => {
                self.pending.data.push_str(value);
                self.pending.data.push('\n');
                self.pending.seen = true;
            }
            "id" => {
                self.pending.id = Some(value.to_string());
                self.pending.seen = true;
            }
            _ => tracing::trace!(field, "ignoring event field"),
        }
        Ok(None)
    }
}

impl Decoder for EventCodec {
    type Item = Event;
    type Error = ProtocolError;

    fn decode(&mut self, buf: &mut BytesMut) -> Result<Option<Event>, ProtocolError> {
        loop {
            if self.skip_lf && !buf.is_empty() {
                if buf[0] == b'\n' {
                    buf.advance(1);
                }
                self.skip_lf = false;
            }
            let Some(pos) = buf.iter().position(|&b| b == b'\n' || b == b'\r') else {
                if buf.len() > self.max_line_length {
                    return Err(ProtocolError::LineTooLong {
                        limit: self.max_line_length,
                    });
                }
                return Ok(None);
            };
            if pos > self.max_line_length {
                return Err(ProtocolError::LineTooLong {
                    limit: self.max_line_length,
                });
            }
            let line = buf.split_to(pos);
            if buf.get_u8() == b'\r' {
                match buf.first() {
                    Some(b'\n') => buf.advance(1),
                    Some(_) => {}
                    None => self.skip_lf = true,
                }
            }
            if let Some(event) = self.process_line(&line)? {
                return Ok(Some(event));
            }
        }
    }

    fn decode_eof(&mut self, buf: &mut BytesMut) -> Result<Option<Event>, ProtocolError> {
        if let Some(event) = self.decode(buf)? {
            return Ok(Some(event));
        }
        if !buf.is_empty() {
            let line = buf.split();
            if let Some(event) = self.process_line(&line)? {
                return Ok(Some(event));
            }
        }
        Ok(self.pending.take())
    }
}

impl Encoder<Event> for EventCodec {
    type Error = ProtocolError;

    fn encode(&mut self, event: Event, dst: &mut BytesMut) -> Result<(), ProtocolError> {
        dst.reserve(event.event_type.len() + event.data.len() + 32);
        dst.put_slice(b"event: ");
        dst.put_slice(event.event_type.as_bytes());
        dst.put_u8(b'\n');
        if let Some(id) = &event.id {
            dst.put_slice(b"id: ");
            dst.put_slice(id.as_bytes());
            dst.put_u8(b'\n');
        }
        for line in event.data.split('\n') {
            dst.put_slice(b"data: ");
            dst.put_slice(line.strip_suffix('\r').unwrap_or(line).as_bytes());
            dst.put_u8(b'\n');
        }
        dst.put_u8(b'\n');
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn decode_all(codec: &mut EventCodec, input: &[u8]) -> Vec<Event> {
        let mut buf = BytesMut::from(input);
        let mut out = Vec::new();
        while let Some(ev) = codec.decode(&mut buf).unwrap() {
            out.push(ev);
        }
        out
    }

    #[test]
    fn decodes_typed_multiline_event() {
        let mut codec = EventCodec::new();
        let events = decode_all(
            &mut codec,
            b"event: appConnect\ndata: demoapp\n\ndata: provide demo\ndata: P .a\n\n",
        );
        assert_eq!(
            events,
            vec![
                Event::new("appConnect", "demoapp"),
                Event::message("provide demo\nP .a"),
            ]
        );
    }

    #[test]
    fn handles_every_line_ending() {
        let mut codec = EventCodec::new();
        let events = decode_all(&mut codec, b"data: a\r\ndata: b\rdata: c\n\r\n");
        assert_eq!(events, vec![Event::message("a\nb\nc")]);
    }

    #[test]
    fn cr_lf_split_across_chunks() {
        let mut codec = EventCodec::new();
        let mut buf = BytesMut::from(&b"data: x\r"[..]);
        assert_eq!(codec.decode(&mut buf).unwrap(), None);
        buf.extend_from_slice(b"\n\r\n");
        assert_eq!(codec.decode(&mut buf).unwrap(), Some(Event::message("x")));
    }

    #[test]
    fn fragments_are_buffered() {
        let mut codec = EventCodec::new();
        let mut buf = BytesMut::new();
        for chunk in [&b"da"[..], b"ta: hel", b"lo\n", b"\n"] {
            buf.extend_from_slice(chunk);
            if let Some(ev) = codec.decode(&mut buf).unwrap() {
                assert_eq!(ev, Event::message("hello"));
                return;
            }
        }
        panic!("event never completed");
    }

    #[test]
    fn comments_and_unknown_fields_are_ignored() {
        let mut codec = EventCodec::new();
        let events = decode_all(&mut codec, b": keepalive\nretry: 10\nfoo\ndata: x\n\n");
        assert_eq!(events, vec![Event::message("x")]);
    }

    #[test]
    fn stray_blank_lines_do_not_dispatch() {
        let mut codec = EventCodec::new();
        assert!(decode_all(&mut codec, b"\n\n: only a comment\n\n").is_empty());
    }

    #[test]
    fn value_without_space_and_empty_data() {
        let mut codec = EventCodec::new();
        let events = decode_all(&mut codec, b"event:ping\ndata\n\nid: 7\ndata:  two\n\n");
        assert_eq!(events[0], Event::new("ping", ""));
        assert_eq!(events[1], Event::message(" two").with_id("7"));
    }

    #[test]
    fn close_flushes_pending_event() {
        let mut codec = EventCodec::new();
        let mut buf = BytesMut::from(&b"event: fireAndForget\ndata: update demo\ndata: C .a b"[..]);
        assert_eq!(codec.decode(&mut buf).unwrap(), None);
        let ev = codec.decode_eof(&mut buf).unwrap().unwrap();
        assert_eq!(ev, Event::new("fireAndForget", "update demo\nC .a b"));
        assert_eq!(codec.decode_eof(&mut buf).unwrap(), None);
    }

    #[test]
    fn long_line_is_rejected() {
        let mut codec = EventCodec::with_max_line_length(8);
        let mut buf = BytesMut::from(&b"data: 0123456789"[..]);
        assert!(matches!(
            codec.decode(&mut buf),
            Err(ProtocolError::LineTooLong { limit: 8 })
        ));
    }

    #[test]
    fn invalid_utf8_is_rejected() {
        let mut codec = EventCodec::new();
        let mut buf = BytesMut::from(&b"data: \xff\n"[..]);
        assert!(matches!(codec.decode(&mut buf), Err(ProtocolError::InvalidUtf8(_))));
    }

    #[test]
    fn encode_writes_one_data_line_per_payload_line() {
        let mut codec = EventCodec::new();
        let mut dst = BytesMut::new();
        codec
            .encode(Event::new("replySuccess", "ok").with_id("3"), &mut dst)
            .unwrap();
        codec.encode(Event::message("a\nb"), &mut dst).unwrap();
        assert_eq!(
            &dst[..],
            b"event: replySuccess\nid: 3\ndata: ok\n\nevent: message\ndata: a\ndata: b\n\n"
        );

        let decoded = decode_all(&mut EventCodec::new(), &dst);
        assert_eq!(decoded[1], Event::message("a\nb"));
    }
}
