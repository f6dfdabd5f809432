//! Companion string resources
//!
//! Text resources live next to the animation file with a `.trs` extension.
//! The format is a sequence of `#<id>` headers, each followed by free text
//! terminated by a blank line. Three terminator conventions exist in the
//! wild (CRLF-CRLF, LF-LF, and a single CRLF directly before the next `#`
//! header), and continuation lines starting with `//` fold into the
//! previous line. Some resources are obfuscated: a 16-byte `ETRS` header
//! followed by the body XORed with a fixed key.

use crate::chunk::ETRS;
use byteorder::{BigEndian, ByteOrder};
use std::cell::Cell;
use tracing::warn;

const OBFUSCATION_HEADER_LEN: usize = 16;
const OBFUSCATION_KEY: u8 = 0xCC;

/// Returned for ids with no entry in the table.
pub const UNKNOWN_STRING: &str = "unknown string";

/// Immutable id-to-text table built once per played animation.
pub struct StringResource {
    strings: Vec<(i32, String)>,
    last: Cell<Option<(i32, usize)>>,
}

impl StringResource {
    /// Parses a string resource, de-obfuscating it first when it carries an
    /// `ETRS` header.
    pub fn parse(data: &[u8]) -> Self {
        let decoded;
        let mut body = data;
        if data.len() > OBFUSCATION_HEADER_LEN && BigEndian::read_u32(data) == u32::from_be_bytes(ETRS.0) {
            decoded = data[OBFUSCATION_HEADER_LEN..]
                .iter()
                .map(|&b| b ^ OBFUSCATION_KEY)
                .collect::<Vec<u8>>();
            body = &decoded;
        }

        let mut strings = Vec::new();
        let mut pos = 0usize;
        while let Some(hash) = find_byte(body, pos, b'#') {
            let line_end = find_byte(body, hash, b'\n').unwrap_or(body.len());
            let Some(id) = trailing_number(&body[hash..line_end]) else {
                pos = line_end;
                continue;
            };

            let mut start = line_end;
            while start < body.len() && (body[start] == b'\n' || body[start] == b'\r') {
                start += 1;
            }
            let (end, resume) = find_terminator(body, start);
            strings.push((id, fold_lines(&body[start..end])));
            pos = resume;
        }

        Self {
            strings,
            last: Cell::new(None),
        }
    }

    /// Looks up a string by id, falling back to [`UNKNOWN_STRING`].
    pub fn get(&self, id: i32) -> &str {
        if let Some((last_id, idx)) = self.last.get() {
            if last_id == id {
                return &self.strings[idx].1;
            }
        }
        for (idx, (entry_id, text)) in self.strings.iter().enumerate() {
            if *entry_id == id {
                self.last.set(Some((id, idx)));
                return text;
            }
        }
        warn!(id, "invalid string id");
        self.last.set(None);
        UNKNOWN_STRING
    }

    pub fn len(&self) -> usize {
        self.strings.len()
    }

    pub fn is_empty(&self) -> bool {
        self.strings.is_empty()
    }
}

fn find_byte(data: &[u8], from: usize, byte: u8) -> Option<usize> {
    data.get(from..)?.iter().position(|&b| b == byte).map(|i| from + i)
}

/// Extracts the run of digits at the end of a header line.
fn trailing_number(line: &[u8]) -> Option<i32> {
    let end = line.iter().rposition(|b| b.is_ascii_digit())? + 1;
    let mut start = end;
    while start > 0 && line[start - 1].is_ascii_digit() {
        start -= 1;
    }
    std::str::from_utf8(&line[start..end]).ok()?.parse().ok()
}

/// Finds the end of a string body. Returns the exclusive end of the text
/// and the position to resume scanning for the next header.
fn find_terminator(data: &[u8], start: usize) -> (usize, usize) {
    let mut i = start;
    while i < data.len() {
        if data[i..].starts_with(b"\r\n\r\n") {
            return (i, i + 2);
        }
        if data[i..].starts_with(b"\n\n") {
            return (i, i + 1);
        }
        if data[i..].starts_with(b"\r\n#") {
            return (i, i + 2);
        }
        i += 1;
    }
    (data.len(), data.len())
}

/// Joins `//` continuation lines back onto their predecessor and strips
/// carriage returns.
fn fold_lines(body: &[u8]) -> String {
    let text = String::from_utf8_lossy(body);
    let mut value = String::new();
    for (i, line) in text.split('\n').enumerate() {
        let line = line.strip_suffix('\r').unwrap_or(line);
        if let Some(rest) = line.strip_prefix("//") {
            value.push(' ');
            value.push_str(rest);
        } else {
            if i > 0 {
                value.push('\n');
            }
            value.push_str(line);
        }
    }
    value
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_crlf_terminated() {
        let data = b"#1\r\nhello\r\n\r\n#2\r\nworld\r\n\r\n";
        let res = StringResource::parse(data);
        assert_eq!(res.len(), 2);
        assert_eq!(res.get(1), "hello");
        assert_eq!(res.get(2), "world");
    }

    #[test]
    fn test_parse_lf_terminated() {
        let data = b"#10\nfirst line\nsecond line\n\n#11\nother\n\n";
        let res = StringResource::parse(data);
        assert_eq!(res.get(10), "first line\nsecond line");
        assert_eq!(res.get(11), "other");
    }

    #[test]
    fn test_parse_single_crlf_before_next_header() {
        let data = b"#5\r\nshort\r\n#6\r\nnext\r\n\r\n";
        let res = StringResource::parse(data);
        assert_eq!(res.get(5), "short");
        assert_eq!(res.get(6), "next");
    }

    #[test]
    fn test_continuation_folding() {
        let data = b"#3\nfirst part\n//second part\n\n";
        let res = StringResource::parse(data);
        assert_eq!(res.get(3), "first part second part");
    }

    #[test]
    fn test_unknown_id_fallback() {
        let res = StringResource::parse(b"#1\nhi\n\n");
        assert_eq!(res.get(99), UNKNOWN_STRING);
        // Cache must not pin the miss.
        assert_eq!(res.get(1), "hi");
    }

    #[test]
    fn test_header_with_label_text() {
        // Header lines may carry a label before the numeric id.
        let data = b"#intro 42\nwelcome\n\n";
        let res = StringResource::parse(data);
        assert_eq!(res.get(42), "welcome");
    }

    #[test]
    fn test_obfuscated_resource() {
        let plain: &[u8] = b"#7\nsecret\n\n";
        let mut data = Vec::new();
        data.extend_from_slice(b"ETRS");
        data.extend_from_slice(&[0u8; 12]);
        data.extend(plain.iter().map(|&b| b ^ OBFUSCATION_KEY));

        let res = StringResource::parse(&data);
        assert_eq!(res.get(7), "secret");
    }
}
