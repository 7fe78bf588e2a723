//! Track token codec.
//!
//! Tokens follow the node's own binary track layout (big-endian, strings in
//! java "modified UTF-8"), wrapped in standard base64:
//!
//! ```text
//! u32 header   (flags << 30) | message size
//! u8  version  present when flags & 1
//! utf title, utf author, i64 length, utf identifier, bool is_stream,
//! [v2+] nullable utf uri, [v3] nullable utf artwork, nullable utf isrc,
//! utf source name, <source specific bytes>, i64 position
//! ```
//!
//! Source specific bytes are kept as an opaque blob, so tokens produced by a
//! node for sources this crate doesn't know about still round-trip.

use base64::{engine::general_purpose::STANDARD, Engine};

use crate::error::{Result, VoicelinkError};
use crate::model::TrackInfo;

const TRACK_INFO_VERSIONED: u32 = 1;
const TRACK_INFO_VERSION: u8 = 3;
const SIZE_MASK: u32 = 0x3FFF_FFFF;

/// Result of decoding a track token.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DecodedTrack {
    /// Track description.
    pub info: TrackInfo,
    /// Format version found in the token.
    pub version: u8,
    /// Fields written by the source manager, not interpreted here.
    pub source_data: Vec<u8>,
}

/// Encodes `info` with the latest format version and no source data.
pub fn encode(info: &TrackInfo) -> String {
    encode_with(info, &[])
}

/// Encodes `info` followed by the given source specific bytes.
pub fn encode_with(info: &TrackInfo, source_data: &[u8]) -> String {
    let mut body = Writer::default();

    body.u8(TRACK_INFO_VERSION);
    body.utf(&info.title);
    body.utf(&info.author);
    body.i64(info.length as i64);
    body.utf(&info.identifier);
    body.bool(info.is_stream);
    body.nullable_utf(info.uri.as_deref());
    body.nullable_utf(info.artwork_url.as_deref());
    body.nullable_utf(info.isrc.as_deref());
    body.utf(&info.source_name);
    body.raw(source_data);
    body.i64(info.position as i64);

    let size = body.0.len() as u32;
    let mut message = Vec::with_capacity(body.0.len() + 4);
    message.extend_from_slice(&((TRACK_INFO_VERSIONED << 30) | size).to_be_bytes());
    message.extend_from_slice(&body.0);

    STANDARD.encode(message)
}

/// Decodes a track token.
///
/// Fails with [`VoicelinkError::TrackDecodeError`] on invalid base64, a size
/// header that doesn't match the payload, or any truncated field.
pub fn decode(token: &str) -> Result<DecodedTrack> {
    let bytes = STANDARD
        .decode(token.trim())
        .map_err(|e| VoicelinkError::TrackDecodeError(e.to_string()))?;

    let mut reader = Reader::new(&bytes);
    let header = reader.u32()?;
    let flags = header >> 30;
    let size = (header & SIZE_MASK) as usize;

    if size != reader.remaining() {
        return Err(VoicelinkError::TrackDecodeError(format!(
            "size header says {size} bytes, got {}", reader.remaining()
        )));
    }

    let version = if flags & TRACK_INFO_VERSIONED != 0 { reader.u8()? } else { 1 };
    if version == 0 || version > TRACK_INFO_VERSION {
        return Err(VoicelinkError::TrackDecodeError(format!("unknown version {version}")));
    }

    let title = reader.utf()?;
    let author = reader.utf()?;
    let length = reader.i64()?.max(0) as u64;
    let identifier = reader.utf()?;
    let is_stream = reader.bool()?;
    let uri = if version >= 2 { reader.nullable_utf()? } else { Some(reader.utf()?) };
    let (artwork_url, isrc) = if version >= 3 {
        (reader.nullable_utf()?, reader.nullable_utf()?)
    } else {
        (None, None)
    };
    let source_name = reader.utf()?;

    // Position is always the trailing field.
    let source_len = reader.remaining().checked_sub(8).ok_or_else(truncated)?;
    let source_data = reader.take(source_len)?.to_vec();
    let position = reader.i64()?.max(0) as u64;

    Ok(DecodedTrack {
        info: TrackInfo {
            identifier,
            is_seekable: !is_stream,
            author,
            length,
            is_stream,
            position,
            title,
            uri,
            artwork_url,
            isrc,
            source_name,
        },
        version,
        source_data,
    })
}

fn truncated() -> VoicelinkError {
    VoicelinkError::TrackDecodeError("truncated token".to_string())
}

#[derive(Default)]
struct Writer(Vec<u8>);

impl Writer {
    fn u8(&mut self, value: u8) {
        self.0.push(value);
    }

    fn bool(&mut self, value: bool) {
        self.0.push(value as u8);
    }

    fn i64(&mut self, value: i64) {
        self.0.extend_from_slice(&value.to_be_bytes());
    }

    fn raw(&mut self, bytes: &[u8]) {
        self.0.extend_from_slice(bytes);
    }

    /// Java modified UTF-8: utf-16 units, nul as two bytes, u16 length prefix.
    ///
    /// Strings longer than u16::MAX bytes are cut on a character boundary.
    fn utf(&mut self, value: &str) {
        let mut encoded = Vec::with_capacity(value.len());
        let mut units = [0; 2];

        for ch in value.chars() {
            let start = encoded.len();
            for unit in ch.encode_utf16(&mut units).iter() {
                push_unit(&mut encoded, *unit);
            }
            if encoded.len() > u16::MAX as usize {
                encoded.truncate(start);
                break;
            }
        }

        self.0.extend_from_slice(&(encoded.len() as u16).to_be_bytes());
        self.0.extend_from_slice(&encoded);
    }

    fn nullable_utf(&mut self, value: Option<&str>) {
        self.bool(value.is_some());
        if let Some(value) = value {
            self.utf(value);
        }
    }
}

fn push_unit(encoded: &mut Vec<u8>, unit: u16) {
    match unit {
        0x0001..=0x007F => encoded.push(unit as u8),
        0x0000 | 0x0080..=0x07FF => {
            encoded.push(0xC0 | ((unit >> 6) & 0x1F) as u8);
            encoded.push(0x80 | (unit & 0x3F) as u8);
        }
        _ => {
            encoded.push(0xE0 | ((unit >> 12) & 0x0F) as u8);
            encoded.push(0x80 | ((unit >> 6) & 0x3F) as u8);
            encoded.push(0x80 | (unit & 0x3F) as u8);
        }
    }
}

struct Reader<'a> {
    bytes: &'a [u8],
    cursor: usize,
}

impl<'a> Reader<'a> {
    fn new(bytes: &'a [u8]) -> Self {
        Self { bytes, cursor: 0 }
    }

    fn remaining(&self) -> usize {
        self.bytes.len() - self.cursor
    }

    fn take(&mut self, len: usize) -> Result<&'a [u8]> {
        if self.remaining() < len {
            return Err(truncated());
        }
        let slice = &self.bytes[self.cursor..self.cursor + len];
        self.cursor += len;
        Ok(slice)
    }

    fn u8(&mut self) -> Result<u8> {
        Ok(self.take(1)?[0])
    }

    fn bool(&mut self) -> Result<bool> {
        Ok(self.u8()? != 0)
    }

    fn u32(&mut self) -> Result<u32> {
        let mut buf = [0; 4];
        buf.copy_from_slice(self.take(4)?);
        Ok(u32::from_be_bytes(buf))
    }

    fn i64(&mut self) -> Result<i64> {
        let mut buf = [0; 8];
        buf.copy_from_slice(self.take(8)?);
        Ok(i64::from_be_bytes(buf))
    }

    fn utf(&mut self) -> Result<String> {
        let mut len = [0; 2];
        len.copy_from_slice(self.take(2)?);
        let raw = self.take(u16::from_be_bytes(len) as usize)?;

        let mut units = Vec::with_capacity(raw.len());
        let mut i = 0;
        while i < raw.len() {
            let b = raw[i] as u16;
            let (unit, width) = match b >> 4 {
                0..=7 => (b, 1),
                12 | 13 => {
                    let b2 = *raw.get(i + 1).ok_or_else(malformed_utf)? as u16;
                    (((b & 0x1F) << 6) | (b2 & 0x3F), 2)
                }
                14 => {
                    let b2 = *raw.get(i + 1).ok_or_else(malformed_utf)? as u16;
                    let b3 = *raw.get(i + 2).ok_or_else(malformed_utf)? as u16;
                    (((b & 0x0F) << 12) | ((b2 & 0x3F) << 6) | (b3 & 0x3F), 3)
                }
                _ => return Err(malformed_utf()),
            };
            units.push(unit);
            i += width;
        }

        String::from_utf16(&units).map_err(|_| malformed_utf())
    }

    fn nullable_utf(&mut self) -> Result<Option<String>> {
        if self.bool()? {
            Ok(Some(self.utf()?))
        } else {
            Ok(None)
        }
    }
}

fn malformed_utf() -> VoicelinkError {
    VoicelinkError::TrackDecodeError("malformed string".to_string())
}

#[cfg(test)]
mod test {
    use super::*;

    fn info(is_stream: bool, artwork: Option<&str>) -> TrackInfo {
        TrackInfo {
            identifier: "dQw4w9WgXcQ".to_string(),
            is_seekable: !is_stream,
            author: "Rick Astley".to_string(),
            length: if is_stream { u64::MAX >> 1 } else { 212_000 },
            is_stream,
            position: 0,
            title: "Never Gonna Give You Up".to_string(),
            uri: Some("https://www.youtube.com/watch?v=dQw4w9WgXcQ".to_string()),
            artwork_url: artwork.map(str::to_string),
            isrc: None,
            source_name: "youtube".to_string(),
        }
    }

    #[test]
    fn test_normal_track_survives_encoding() {
        let original = info(false, Some("https://i.ytimg.com/vi/dQw4w9WgXcQ/mqdefault.jpg"));

        let decoded = decode(&encode(&original)).unwrap();

        assert_eq!(decoded.info, original);
        assert_eq!(decoded.version, TRACK_INFO_VERSION);
        assert!(decoded.source_data.is_empty());
    }

    #[test]
    fn test_live_stream_survives_encoding() {
        let original = info(true, Some("https://i.ytimg.com/vi/live.jpg"));

        let decoded = decode(&encode(&original)).unwrap();

        assert!(decoded.info.is_stream);
        assert!(!decoded.info.is_seekable);
        assert_eq!(decoded.info, original);
    }

    #[test]
    fn test_track_without_artwork_survives_encoding() {
        let original = info(false, None);

        let decoded = decode(&encode(&original)).unwrap();

        assert_eq!(decoded.info.artwork_url, None);
        assert_eq!(decoded.info, original);
    }

    #[test]
    fn test_unknown_source_keeps_its_blob() {
        let mut original = info(false, None);
        original.source_name = "someplugin".to_string();
        let blob = [0, 3, b'a', b'b', b'c', 1];

        let decoded = decode(&encode_with(&original, &blob)).unwrap();

        assert_eq!(decoded.info.source_name, "someplugin");
        assert_eq!(decoded.source_data, blob);
        assert_eq!(encode_with(&decoded.info, &decoded.source_data), encode_with(&original, &blob));
    }

    #[test]
    fn test_non_ascii_titles() {
        let mut original = info(false, None);
        original.title = "夜に駆ける \u{1F3B5} nul:\0".to_string();

        let decoded = decode(&encode(&original)).unwrap();

        assert_eq!(decoded.info.title, original.title);
    }

    #[test]
    fn test_oversized_title_is_cut_between_characters() {
        let mut original = info(false, None);
        // 1 + 10923 * 6 bytes once encoded, just past the u16 limit.
        original.title = format!("a{}", "\u{1F3B5}".repeat(10_923));

        let decoded = decode(&encode(&original)).unwrap();

        assert_eq!(decoded.info.title, format!("a{}", "\u{1F3B5}".repeat(10_922)));
        assert_eq!(decoded.info.author, original.author);
    }

    #[test]
    fn test_truncated_token_fails() {
        let token = encode(&info(false, None));
        let mut bytes = STANDARD.decode(&token).unwrap();
        bytes.truncate(bytes.len() - 10);

        let result = decode(&STANDARD.encode(bytes));

        assert!(matches!(result, Err(VoicelinkError::TrackDecodeError(_))));
    }

    #[test]
    fn test_garbage_token_fails() {
        assert!(matches!(decode("not base64!"), Err(VoicelinkError::TrackDecodeError(_))));
        assert!(matches!(decode("AAAA"), Err(VoicelinkError::TrackDecodeError(_))));
    }
}
