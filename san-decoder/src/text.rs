//! Text overlay resolution
//!
//! Text sub-chunks carry a draw position, style flags and a clip rectangle,
//! followed by either inline text or a string id resolved through the
//! companion string table. The text itself may start with in-band escape
//! sequences selecting a font and color. Resolution produces a draw
//! instruction; glyph rendering happens behind the host seam.

use byteorder::{ByteOrder, LittleEndian};
use san_core::StringResource;
use tracing::debug;

use crate::{Error, Result};

pub const STYLE_CENTER: u16 = 0x01;
pub const STYLE_ALIGN_RIGHT: u16 = 0x02;
pub const STYLE_WORD_WRAP: u16 = 0x04;
pub const STYLE_SWITCHABLE: u16 = 0x08;
pub const STYLE_FILL_BACKGROUND: u16 = 0x10;
/// Legacy vertical-alignment bits kept for format compatibility; wrap and
/// clip handling take precedence over them.
pub const STYLE_VERTICAL_FIX: u16 = 0x40;
pub const STYLE_NO_VERTICAL_FIX: u16 = 0x100;

/// Inset used when word wrap re-derives the clip rectangle.
const WRAP_MARGIN: i32 = 10;

const HEADER_LEN: usize = 16;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Rect {
    pub left: i32,
    pub top: i32,
    pub right: i32,
    pub bottom: i32,
}

/// A fully resolved text draw instruction.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TextDraw {
    pub x: i32,
    pub y: i32,
    pub font: u8,
    pub color: u8,
    pub style: u16,
    pub wrap: bool,
    pub clip: Rect,
    pub text: String,
}

/// Resolves a text sub-chunk payload against the frame dimensions.
///
/// `inline` distinguishes the literal-text chunk variant from the
/// string-id variant. Returns `None` when nothing should be drawn: a
/// missing string table, or subtitles disabled together with the
/// switchable style bit.
pub fn resolve(
    payload: &[u8],
    inline: bool,
    strings: Option<&StringResource>,
    subtitles: bool,
    frame_width: usize,
    frame_height: usize,
) -> Result<Option<TextDraw>> {
    if payload.len() < HEADER_LEN {
        return Err(Error::TruncatedSubChunk);
    }
    let x = LittleEndian::read_i16(&payload[0..]) as i32;
    let y = LittleEndian::read_i16(&payload[2..]) as i32;
    let style = LittleEndian::read_i16(&payload[4..]) as u16;
    // Caller-supplied clip rectangle; read for completeness, but both draw
    // paths below derive their own clip.
    let _left = LittleEndian::read_i16(&payload[6..]) as i32;
    let _top = LittleEndian::read_i16(&payload[8..]) as i32;
    let _clip_w = LittleEndian::read_i16(&payload[10..]) as i32;
    let _clip_h = LittleEndian::read_i16(&payload[12..]) as i32;

    let text: String = if inline {
        String::from_utf8_lossy(trim_nul(&payload[HEADER_LEN..])).into_owned()
    } else {
        if payload.len() < HEADER_LEN + 2 {
            return Err(Error::TruncatedSubChunk);
        }
        let id = LittleEndian::read_u16(&payload[HEADER_LEN..]) as i32;
        match strings {
            Some(table) => table.get(id).to_owned(),
            None => {
                debug!(id, "no string table loaded, skipping text chunk");
                return Ok(None);
            }
        }
    };

    if !subtitles && style & STYLE_SWITCHABLE != 0 {
        return Ok(None);
    }

    let mut rest = text.as_str();
    while let Some(stripped) = rest.strip_prefix('/') {
        rest = stripped;
    }

    let mut font = 0u8;
    let mut color = 15u8;
    while let Some(escape) = rest.strip_prefix('^') {
        let mut chars = escape.chars();
        match chars.next() {
            Some('f') => {
                let d = chars.next().and_then(|c| c.to_digit(10));
                font = d.ok_or(Error::BadTextEscape('f'))? as u8;
                rest = &rest[3..];
            }
            Some('c') => {
                let hi = chars.next().and_then(|c| c.to_digit(10));
                let lo = chars.next().and_then(|c| c.to_digit(10));
                match (hi, lo) {
                    (Some(hi), Some(lo)) => color = (hi * 10 + lo) as u8,
                    _ => return Err(Error::BadTextEscape('c')),
                }
                rest = &rest[4..];
            }
            Some(other) => return Err(Error::BadTextEscape(other)),
            None => return Err(Error::BadTextEscape(' ')),
        }
    }

    let wrap = style & STYLE_WORD_WRAP != 0;
    let clip = if wrap {
        // Wrapped text ignores the caller-supplied rectangle and clips to
        // fixed margins inside the frame.
        Rect {
            left: WRAP_MARGIN,
            top: WRAP_MARGIN,
            right: frame_width as i32 - WRAP_MARGIN,
            bottom: frame_height as i32 - WRAP_MARGIN,
        }
    } else {
        Rect {
            left: 0,
            top: 0,
            right: frame_width as i32,
            bottom: frame_height as i32,
        }
    };

    Ok(Some(TextDraw {
        x,
        y,
        font,
        color,
        style,
        wrap,
        clip,
        text: rest.to_owned(),
    }))
}

fn trim_nul(bytes: &[u8]) -> &[u8] {
    match bytes.iter().position(|&b| b == 0) {
        Some(end) => &bytes[..end],
        None => bytes,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn payload(style: u16, text: &[u8]) -> Vec<u8> {
        let mut out = Vec::new();
        out.extend_from_slice(&20i16.to_le_bytes()); // x
        out.extend_from_slice(&30i16.to_le_bytes()); // y
        out.extend_from_slice(&(style as i16).to_le_bytes());
        out.extend_from_slice(&[0; 10]); // clip rect + pad
        out.extend_from_slice(text);
        out
    }

    #[test]
    fn test_escape_parsing() {
        let draw = resolve(&payload(0, b"^f2^c13Hello"), true, None, true, 320, 200)
            .unwrap()
            .unwrap();
        assert_eq!(draw.font, 2);
        assert_eq!(draw.color, 13);
        assert_eq!(draw.text, "Hello");
    }

    #[test]
    fn test_unknown_escape_is_fatal() {
        assert!(matches!(
            resolve(&payload(0, b"^x9bad"), true, None, true, 320, 200),
            Err(Error::BadTextEscape('x'))
        ));
    }

    #[test]
    fn test_defaults_without_escapes() {
        let draw = resolve(&payload(0, b"plain"), true, None, true, 320, 200)
            .unwrap()
            .unwrap();
        assert_eq!(draw.font, 0);
        assert_eq!(draw.color, 15);
        assert_eq!((draw.x, draw.y), (20, 30));
        assert_eq!(
            draw.clip,
            Rect {
                left: 0,
                top: 0,
                right: 320,
                bottom: 200
            }
        );
    }

    #[test]
    fn test_wrap_rederives_clip_from_margins() {
        let draw = resolve(
            &payload(STYLE_WORD_WRAP, b"wrapped"),
            true,
            None,
            true,
            320,
            200,
        )
        .unwrap()
        .unwrap();
        assert!(draw.wrap);
        assert_eq!(
            draw.clip,
            Rect {
                left: 10,
                top: 10,
                right: 310,
                bottom: 190
            }
        );
    }

    #[test]
    fn test_switchable_skipped_when_subtitles_off() {
        let res = resolve(
            &payload(STYLE_SWITCHABLE, b"subtitle"),
            true,
            None,
            false,
            320,
            200,
        )
        .unwrap();
        assert!(res.is_none());
    }

    #[test]
    fn test_leading_slashes_skipped() {
        let draw = resolve(&payload(0, b"//routed text"), true, None, true, 320, 200)
            .unwrap()
            .unwrap();
        assert_eq!(draw.text, "routed text");
    }

    #[test]
    fn test_string_id_lookup() {
        let table = StringResource::parse(b"#12\nfrom table\n\n");
        let mut p = payload(0, &[]);
        p.extend_from_slice(&12u16.to_le_bytes());
        let draw = resolve(&p, false, Some(&table), true, 320, 200)
            .unwrap()
            .unwrap();
        assert_eq!(draw.text, "from table");
    }

    #[test]
    fn test_missing_table_degrades_to_skip() {
        let mut p = payload(0, &[]);
        p.extend_from_slice(&12u16.to_le_bytes());
        assert!(resolve(&p, false, None, true, 320, 200).unwrap().is_none());
    }
}
