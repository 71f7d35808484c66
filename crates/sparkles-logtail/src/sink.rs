//! Rendering received output.

use std::io::Write;
use std::str::Utf8Error;

use chrono::{DateTime, Local};

const STAMP_FORMAT: &str = "%H:%M:%S";
const STAMP_COLOR: &str = "\x1b[32m";
const RESET: &str = "\x1b[0m";

/// Receives decoded chunks in stream order.
pub trait OutputSink: Send {
    /// Render `text`, received at `received_at`. Must not reorder or drop content.
    fn emit(&mut self, received_at: DateTime<Local>, text: &str) -> std::io::Result<()>;
}

/// Writes each chunk with a local-time prefix and flushes it immediately.
///
/// ```text
/// 14:02:11 Downloading inputs...
///          fetched 3 files
/// ```
#[derive(Debug)]
pub struct TerminalSink<W> {
    out: W,
    color: bool,
}

impl TerminalSink<std::io::Stdout> {
    pub fn stdout(color: bool) -> Self {
        Self::new(std::io::stdout(), color)
    }
}

impl<W: Write + Send> TerminalSink<W> {
    pub fn new(out: W, color: bool) -> Self {
        Self { out, color }
    }

    pub fn into_inner(self) -> W {
        self.out
    }
}

impl<W: Write + Send> OutputSink for TerminalSink<W> {
    fn emit(&mut self, received_at: DateTime<Local>, text: &str) -> std::io::Result<()> {
        let rendered = render_chunk(received_at, text, self.color);
        self.out.write_all(rendered.as_bytes())?;
        self.out.flush()
    }
}

/// Format one chunk: the first line carries the timestamp, continuation lines
/// are aligned under it. A trailing newline does not produce an empty line.
pub fn render_chunk(received_at: DateTime<Local>, text: &str, color: bool) -> String {
    let stamp = received_at.format(STAMP_FORMAT).to_string();
    let indent = " ".repeat(stamp.len());
    let body = text
        .strip_suffix("\r\n")
        .or_else(|| text.strip_suffix('\n'))
        .unwrap_or(text);
    let lines: Vec<&str> = body.split('\n').collect();
    let last = lines.len() - 1;

    let mut rendered = String::with_capacity(body.len() + stamp.len() + 16);
    for (index, line) in lines.into_iter().enumerate() {
        // Only a CR that ends a CRLF pair is a line terminator.
        let line = if index < last {
            line.strip_suffix('\r').unwrap_or(line)
        } else {
            line
        };
        if index == 0 {
            if color {
                rendered.push_str(STAMP_COLOR);
                rendered.push_str(&stamp);
                rendered.push_str(RESET);
            } else {
                rendered.push_str(&stamp);
            }
        } else {
            rendered.push_str(&indent);
        }
        rendered.push(' ');
        rendered.push_str(line);
        rendered.push('\n');
    }
    rendered
}

/// Incremental UTF-8 decoder over consecutive chunks.
///
/// A character split across a chunk boundary is held back until the rest of
/// it arrives; invalid bytes are an error.
#[derive(Debug, Default)]
pub struct ChunkDecoder {
    pending: Vec<u8>,
}

impl ChunkDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Decode `payload`, returning the text that is complete so far.
    pub fn decode(&mut self, payload: &[u8]) -> Result<String, Utf8Error> {
        let mut bytes = std::mem::take(&mut self.pending);
        bytes.extend_from_slice(payload);

        match String::from_utf8(bytes) {
            Ok(text) => Ok(text),
            Err(err) => {
                let utf8 = err.utf8_error();
                if utf8.error_len().is_some() {
                    return Err(utf8);
                }
                let mut bytes = err.into_bytes();
                self.pending = bytes.split_off(utf8.valid_up_to());
                String::from_utf8(bytes).map_err(|e| e.utf8_error())
            }
        }
    }

    /// Bytes held back waiting for the rest of a character.
    pub fn pending_len(&self) -> usize {
        self.pending.len()
    }

    /// Fail if the stream ended in the middle of a character.
    pub fn finish(&mut self) -> Result<(), Utf8Error> {
        let pending = std::mem::take(&mut self.pending);
        std::str::from_utf8(&pending).map(|_| ())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn at(h: u32, m: u32, s: u32) -> DateTime<Local> {
        Local.with_ymd_and_hms(2024, 3, 1, h, m, s).unwrap()
    }

    #[test]
    fn test_render_single_line() {
        assert_eq!(
            render_chunk(at(9, 5, 7), "starting job\n", false),
            "09:05:07 starting job\n"
        );
    }

    #[test]
    fn test_render_aligns_continuation_lines() {
        assert_eq!(
            render_chunk(at(14, 2, 11), "a\r\nb\nc", false),
            "14:02:11 a\n         b\n         c\n"
        );
    }

    #[test]
    fn test_render_keeps_bare_carriage_return() {
        assert_eq!(
            render_chunk(at(8, 0, 0), "50%\r", false),
            "08:00:00 50%\r\n"
        );
        assert_eq!(
            render_chunk(at(8, 0, 0), "10%\r20%\r\n", false),
            "08:00:00 10%\r20%\n"
        );
        assert_eq!(
            render_chunk(at(8, 0, 0), "done\r\n", false),
            "08:00:00 done\n"
        );
    }

    #[test]
    fn test_render_color() {
        let rendered = render_chunk(at(1, 2, 3), "x", true);
        assert_eq!(rendered, "\x1b[32m01:02:03\x1b[0m x\n");
    }

    #[test]
    fn test_terminal_sink_preserves_order() {
        let mut sink = TerminalSink::new(Vec::new(), false);
        sink.emit(at(10, 0, 0), "first\n").unwrap();
        sink.emit(at(10, 0, 1), "second\n").unwrap();
        let out = String::from_utf8(sink.into_inner()).unwrap();
        assert_eq!(out, "10:00:00 first\n10:00:01 second\n");
    }

    #[test]
    fn test_decoder_passes_ascii() {
        let mut decoder = ChunkDecoder::new();
        assert_eq!(decoder.decode(b"hello").unwrap(), "hello");
        assert_eq!(decoder.pending_len(), 0);
        assert!(decoder.finish().is_ok());
    }

    #[test]
    fn test_decoder_joins_split_character() {
        let snowman = "☃".as_bytes();
        let mut decoder = ChunkDecoder::new();
        let mut first = b"a".to_vec();
        first.extend_from_slice(&snowman[..1]);
        assert_eq!(decoder.decode(&first).unwrap(), "a");
        assert_eq!(decoder.pending_len(), 1);
        assert_eq!(decoder.decode(&snowman[1..2]).unwrap(), "");
        let mut last = snowman[2..].to_vec();
        last.extend_from_slice(b"b");
        assert_eq!(decoder.decode(&last).unwrap(), "☃b");
        assert!(decoder.finish().is_ok());
    }

    #[test]
    fn test_decoder_rejects_invalid_bytes() {
        let mut decoder = ChunkDecoder::new();
        assert!(decoder.decode(&[b'o', b'k', 0xff, b'x']).is_err());
    }

    #[test]
    fn test_decoder_rejects_truncated_stream() {
        let mut decoder = ChunkDecoder::new();
        assert_eq!(decoder.decode(&"é".as_bytes()[..1]).unwrap(), "");
        assert!(decoder.finish().is_err());
    }
}
