use base64::Engine as _;
use base64::alphabet;
use base64::engine::{DecodePaddingMode, GeneralPurpose, GeneralPurposeConfig};
use log::warn;

use crate::mail::message::{MessagePart, RawMessage};

/// Gmail hands out base64url, sometimes padded and sometimes not.
const URL_SAFE_LENIENT: GeneralPurpose = GeneralPurpose::new(
    &alphabet::URL_SAFE,
    GeneralPurposeConfig::new()
        .with_encode_padding(false)
        .with_decode_padding_mode(DecodePaddingMode::Indifferent),
);

/// Picks the best body part of `msg` and decodes it to text.
///
/// Order: the top-level body if it carries inline data, then the first
/// immediate `text/plain` child, then the first `text/html` child, then
/// the first child with any inline data. HTML is returned as-is, markup
/// included. A message without decodable data yields an empty string.
pub fn decode_body(msg: &RawMessage) -> String {
    let Some(part) = select_body_part(&msg.payload) else {
        warn!("message {}: no inline body data, extracting from empty text", msg.id);
        return String::new();
    };

    let data = part.inline_data().unwrap_or_default();
    match decode_base64url(data) {
        Some(text) => text,
        None => {
            warn!(
                "message {}: malformed body data in {} part, extracting from empty text",
                msg.id, part.mime_type
            );
            String::new()
        }
    }
}

fn select_body_part(payload: &MessagePart) -> Option<&MessagePart> {
    if payload.inline_data().is_some() {
        return Some(payload);
    }

    let with_data = || payload.parts.iter().filter(|p| p.inline_data().is_some());

    with_data()
        .find(|p| p.is_mime("text/plain"))
        .or_else(|| with_data().find(|p| p.is_mime("text/html")))
        .or_else(|| with_data().next())
}

/// base64url to UTF-8; invalid sequences are replaced rather than failing.
pub fn decode_base64url(data: &str) -> Option<String> {
    let bytes = URL_SAFE_LENIENT.decode(data.trim()).ok()?;
    Some(String::from_utf8_lossy(&bytes).into_owned())
}

pub fn decode_mime_words(raw: &[u8]) -> String {
    let mut line = b"X: ".to_vec();
    line.extend_from_slice(raw);
    line.extend_from_slice(b"\r\n");

    match mailparse::parse_header(&line) {
        Ok((h, _idx)) => h.get_value(), // decodes RFC 2047
        Err(_) => String::from_utf8_lossy(raw).into_owned(),
    }
}

pub fn parse_date_header(value: &str) -> i64 {
    mailparse::dateparse(value).unwrap_or(0)
}

/// Single-line preview of `s`, for log output.
pub fn normalize_snippet(s: &str, max_chars: usize) -> String {
    let mut out = String::new();
    for line in s.lines() {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        if !out.is_empty() {
            out.push(' ');
        }
        out.push_str(line);
        if out.chars().count() >= max_chars {
            break;
        }
    }
    out.chars().take(max_chars).collect()
}
