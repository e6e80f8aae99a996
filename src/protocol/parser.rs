//! Incremental packet parser.
//!
//! Packets carry no length prefix: a message ends where its JSON object
//! ends. The parser is stateless; callers keep the unconsumed tail of their
//! buffer and feed it again together with newly arrived bytes.

use serde_json::Value;

use crate::protocol::packet::{Packet, WireMessage};

#[derive(Debug, Default, PartialEq, Eq)]
pub struct ParseOutcome {
    pub packets: Vec<Packet>,
    /// Bytes at the start of the input that are fully accounted for.
    pub consumed: usize,
}

/// Extracts every complete packet from `buffer`.
///
/// Bytes after `consumed` form at most one incomplete object and must be
/// retained by the caller. Input that can never become a JSON object is
/// reported as a single [`Packet::ProtocolViolation`] covering the rest of
/// the buffer.
pub fn feed(buffer: &[u8]) -> ParseOutcome {
    let mut outcome = ParseOutcome::default();
    let mut pos = 0;

    loop {
        let start = pos + leading_whitespace(&buffer[pos..]);
        if start == buffer.len() {
            outcome.consumed = start;
            break;
        }

        if buffer[start] != b'{' {
            outcome.packets.push(violation(&buffer[start..]));
            outcome.consumed = buffer.len();
            break;
        }

        let mut stream = serde_json::Deserializer::from_slice(&buffer[start..]).into_iter::<Value>();
        match stream.next() {
            Some(Ok(value)) => {
                let end = start + stream.byte_offset();
                outcome.packets.push(decode(value, &buffer[start..end]));
                outcome.consumed = end;
                pos = end;
            }
            Some(Err(e)) if e.is_eof() => {
                // Incomplete object: wait for more bytes.
                outcome.consumed = start;
                break;
            }
            Some(Err(e)) => {
                tracing::warn!(error = %e, offset = start, "malformed JSON in packet stream");
                outcome.packets.push(violation(&buffer[start..]));
                outcome.consumed = buffer.len();
                break;
            }
            None => {
                outcome.consumed = buffer.len();
                break;
            }
        }
    }

    outcome
}

fn leading_whitespace(bytes: &[u8]) -> usize {
    bytes.iter().take_while(|b| b.is_ascii_whitespace()).count()
}

fn decode(value: Value, raw: &[u8]) -> Packet {
    match serde_json::from_value::<WireMessage>(value) {
        Ok(msg) => Packet::from(msg),
        Err(e) => {
            tracing::warn!(error = %e, "well-formed packet with unknown shape");
            violation(raw)
        }
    }
}

fn violation(raw: &[u8]) -> Packet {
    Packet::ProtocolViolation(String::from_utf8_lossy(raw).trim().to_string())
}

/// Accumulation buffer in front of [`feed`]; drops the consumed prefix after
/// every parse.
///
/// Bytes are scanned once as they arrive. The JSON parser only runs when the
/// scan has seen a top-level object close, or bytes that can never start one.
#[derive(Debug, Default)]
pub struct PacketBuffer {
    pending: Vec<u8>,
    scan: ObjectScan,
}

/// Resumable brace matcher over `pending`.
#[derive(Debug, Default)]
struct ObjectScan {
    pos: usize,
    depth: usize,
    in_string: bool,
    escaped: bool,
}

impl ObjectScan {
    /// Advances over `bytes[self.pos..]`. Returns `true` once the parser has
    /// something to decide: a closed top-level object or a stray byte.
    fn advance(&mut self, bytes: &[u8]) -> bool {
        while self.pos < bytes.len() {
            let b = bytes[self.pos];
            self.pos += 1;
            if self.depth == 0 {
                match b {
                    b'{' => self.depth = 1,
                    b if b.is_ascii_whitespace() => {}
                    _ => return true,
                }
                continue;
            }
            if self.in_string {
                if self.escaped {
                    self.escaped = false;
                } else if b == b'\\' {
                    self.escaped = true;
                } else if b == b'"' {
                    self.in_string = false;
                }
                continue;
            }
            match b {
                b'"' => self.in_string = true,
                b'{' | b'[' => self.depth += 1,
                b'}' | b']' => {
                    self.depth -= 1;
                    if self.depth == 0 {
                        return true;
                    }
                }
                _ => {}
            }
        }
        false
    }
}

impl PacketBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn extend(&mut self, bytes: &[u8]) {
        self.pending.extend_from_slice(bytes);
    }

    pub fn drain_packets(&mut self) -> Vec<Packet> {
        if !self.scan.advance(&self.pending) {
            if self.scan.depth == 0 {
                // Only whitespace so far.
                self.pending.clear();
                self.scan = ObjectScan::default();
            }
            return Vec::new();
        }
        let outcome = feed(&self.pending);
        if outcome.consumed > 0 {
            self.pending.drain(..outcome.consumed);
        }
        // The tail holds no complete object; rescan it from its start.
        self.scan = ObjectScan::default();
        outcome.packets
    }

    /// Length of the incomplete fragment still waiting for more bytes.
    pub fn pending_len(&self) -> usize {
        self.pending.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::packet::encode;
    use crate::script::Script;

    fn sample_stream() -> (Vec<Packet>, Vec<u8>) {
        let packets = vec![
            Packet::RunScript(Script::new("demo.js", "click(btn1)\nassertTextEquals(lbl1,'hi')")),
            Packet::UserEvent("type(edit, \"{\\\"quoted\\\"}\")".into()),
            Packet::ScriptLog("ünïcödé ✓".into()),
            Packet::ScriptError("mismatch: got 'bye'".into()),
            Packet::ScriptEnd,
        ];
        let mut bytes = Vec::new();
        for p in &packets {
            bytes.extend(encode(p).unwrap());
        }
        (packets, bytes)
    }

    fn feed_chunks(chunks: &[&[u8]]) -> Vec<Packet> {
        let mut buffer = PacketBuffer::new();
        let mut out = Vec::new();
        for chunk in chunks {
            buffer.extend(chunk);
            out.extend(buffer.drain_packets());
        }
        out
    }

    #[test]
    fn fragment_then_rest_yields_one_packet() {
        let mut buffer = PacketBuffer::new();
        buffer.extend(br#"{"cmd":"ru"#);
        assert!(buffer.drain_packets().is_empty());
        assert_eq!(buffer.pending_len(), 10);

        buffer.extend(br#"nScript","script":"click(btn1)"}"#);
        let packets = buffer.drain_packets();
        assert_eq!(packets, vec![Packet::RunScript(Script::new("", "click(btn1)"))]);
        assert_eq!(buffer.pending_len(), 0);
    }

    #[test]
    fn byte_at_a_time_emits_only_after_last_byte() {
        let bytes = encode(&Packet::ScriptLog("step {1} \"done\"".into())).unwrap();
        // Drop the trailing newline so the last byte is the closing brace.
        let bytes = &bytes[..bytes.len() - 1];
        let mut buffer = PacketBuffer::new();
        for (i, b) in bytes.iter().enumerate() {
            buffer.extend(std::slice::from_ref(b));
            let packets = buffer.drain_packets();
            if i + 1 < bytes.len() {
                assert!(packets.is_empty(), "packet emitted early at byte {i}");
            } else {
                assert_eq!(packets, vec![Packet::ScriptLog("step {1} \"done\"".into())]);
            }
        }
    }

    #[test]
    fn every_split_matches_single_feed() {
        let (expected, bytes) = sample_stream();
        assert_eq!(feed(&bytes).packets, expected);

        for i in 0..=bytes.len() {
            for j in i..=bytes.len() {
                let got = feed_chunks(&[&bytes[..i], &bytes[i..j], &bytes[j..]]);
                assert_eq!(got, expected, "split at {i}/{j}");
            }
        }
    }

    #[test]
    fn several_packets_in_one_read() {
        let input = b"  {\"cmd\":\"scriptEnd\"}\n\n{\"cmd\":\"scriptLog\",\"data\":\"x\"}{\"cmd\":\"scri";
        let outcome = feed(input);
        assert_eq!(
            outcome.packets,
            vec![Packet::ScriptEnd, Packet::ScriptLog("x".into())]
        );
        assert_eq!(&input[outcome.consumed..], b"{\"cmd\":\"scri");
    }

    #[test]
    fn unknown_command_is_reported_and_parsing_continues() {
        let input = b"{\"cmd\":\"selfDestruct\",\"data\":1}\n{\"cmd\":\"scriptEnd\"}\n";
        let outcome = feed(input);
        assert_eq!(
            outcome.packets,
            vec![
                Packet::ProtocolViolation("{\"cmd\":\"selfDestruct\",\"data\":1}".into()),
                Packet::ScriptEnd,
            ]
        );
        assert_eq!(outcome.consumed, input.len());
    }

    #[test]
    fn missing_or_mistyped_fields_are_violations() {
        let outcome = feed(br#"{"cmd":"runScript"}{"cmd":"scriptLog","data":5}"#);
        assert_eq!(outcome.packets.len(), 2);
        assert!(outcome
            .packets
            .iter()
            .all(|p| matches!(p, Packet::ProtocolViolation(_))));
    }

    #[test]
    fn garbage_consumes_the_buffer() {
        let input = b"{\"cmd\":\"scriptEnd\"} hello {";
        let outcome = feed(input);
        assert_eq!(
            outcome.packets,
            vec![Packet::ScriptEnd, Packet::ProtocolViolation("hello {".into())]
        );
        assert_eq!(outcome.consumed, input.len());

        let outcome = feed(b"{\"cmd\" 12}");
        assert!(matches!(outcome.packets[..], [Packet::ProtocolViolation(_)]));
    }

    #[test]
    fn empty_and_whitespace_input() {
        assert_eq!(feed(b""), ParseOutcome::default());
        let outcome = feed(b" \r\n\t");
        assert!(outcome.packets.is_empty());
        assert_eq!(outcome.consumed, 4);
    }

    #[test]
    fn braces_inside_strings_do_not_end_an_object() {
        let bytes = encode(&Packet::ScriptLog("}{ \\\" ] [ {{".into())).unwrap();
        for i in 0..=bytes.len() {
            let got = feed_chunks(&[&bytes[..i], &bytes[i..]]);
            assert_eq!(got, vec![Packet::ScriptLog("}{ \\\" ] [ {{".into())], "split at {i}");
        }
    }

    #[test]
    fn large_packet_is_scanned_once() {
        let payload = "x".repeat(1 << 20);
        let bytes = encode(&Packet::ScriptLog(payload.clone())).unwrap();
        let mut buffer = PacketBuffer::new();
        let mut received = Vec::new();
        for chunk in bytes.chunks(4096) {
            buffer.extend(chunk);
            received.extend(buffer.drain_packets());
            if received.is_empty() {
                // Scan resumed where the previous read stopped.
                assert_eq!(buffer.scan.pos, buffer.pending_len());
            }
        }
        assert_eq!(received, vec![Packet::ScriptLog(payload)]);
        assert_eq!(buffer.pending_len(), 0);
    }

    #[test]
    fn trailing_newline_is_not_left_pending() {
        let mut buffer = PacketBuffer::new();
        buffer.extend(b"{\"cmd\":\"scriptEnd\"}");
        assert_eq!(buffer.drain_packets(), vec![Packet::ScriptEnd]);
        buffer.extend(b"\n");
        assert!(buffer.drain_packets().is_empty());
        assert_eq!(buffer.pending_len(), 0);
    }

    #[test]
    fn stray_bytes_still_reach_the_parser() {
        let mut buffer = PacketBuffer::new();
        buffer.extend(b"  hello");
        assert_eq!(buffer.drain_packets(), vec![Packet::ProtocolViolation("hello".into())]);
        assert_eq!(buffer.pending_len(), 0);
    }
}
