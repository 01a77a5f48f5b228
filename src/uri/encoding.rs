//! Path segment encoding and normalization.

use percent_encoding::{AsciiSet, CONTROLS, percent_decode_str, utf8_percent_encode};

use crate::error::{FileOpError, FileOpResult};

/// Characters escaped inside a parsed path segment. `%` is absent because it
/// always starts an escape; `*` and `?` are absent because they are globs.
const SEGMENT: &AsciiSet = &CONTROLS
    .add(b' ')
    .add(b'"')
    .add(b'#')
    .add(b'<')
    .add(b'>')
    .add(b'\\')
    .add(b'^')
    .add(b'`')
    .add(b'{')
    .add(b'|')
    .add(b'}')
    .add(b';');

/// Characters escaped in a literal name (listing results, `child()`).
const NAME: &AsciiSet = &SEGMENT.add(b'%').add(b'*').add(b'?').add(b'/');

pub(crate) fn has_wildcard(encoded: &str) -> bool {
    encoded.contains('*') || encoded.contains('?')
}

pub(crate) fn encode_name(name: &str) -> String {
    utf8_percent_encode(name, NAME).to_string()
}

pub(crate) fn decode(encoded: &str) -> String {
    percent_decode_str(encoded).decode_utf8_lossy().into_owned()
}

/// Escape wildcards of a quoted (literal) expression.
pub(crate) fn quote_wildcards(raw: &str) -> String {
    raw.replace('*', "%2A").replace('?', "%3F")
}

/// Validate `%XX` escapes (upper-casing them) and encode reserved characters.
fn encode_segment(input: &str, segment: &str) -> FileOpResult<String> {
    let bytes = segment.as_bytes();
    let mut checked = String::with_capacity(segment.len());
    let mut i = 0;
    while i < segment.len() {
        if bytes[i] == b'%' {
            let escape = segment.get(i + 1..i + 3).filter(|hex| {
                hex.len() == 2 && hex.bytes().all(|b| b.is_ascii_hexdigit())
            });
            match escape {
                Some(hex) => {
                    checked.push('%');
                    checked.push_str(&hex.to_ascii_uppercase());
                    i += 3;
                }
                None => {
                    return Err(FileOpError::malformed(
                        input,
                        format!("unsupported escape sequence in segment '{}'", segment),
                    ));
                }
            }
        } else {
            // Safe: '%' is ASCII, so `i` always sits on a char boundary here.
            let ch = segment[i..].chars().next().unwrap_or_default();
            checked.push(ch);
            i += ch.len_utf8();
        }
    }
    Ok(utf8_percent_encode(&checked, SEGMENT).to_string())
}

/// Normalize an absolute path: resolve `.`/`..`, encode segments and keep a
/// trailing slash as the directory marker.
pub(crate) fn normalize_path(input: &str, raw: &str) -> FileOpResult<String> {
    if !raw.starts_with('/') {
        return Err(FileOpError::malformed(input, "path must be absolute"));
    }

    let parts: Vec<&str> = raw[1..].split('/').collect();
    let last = parts.len() - 1;
    let mut stack: Vec<String> = Vec::with_capacity(parts.len());
    let mut directory = false;

    for (idx, part) in parts.iter().enumerate() {
        match *part {
            "" if idx == last => directory = !stack.is_empty(),
            "" => {
                return Err(FileOpError::malformed(input, "empty path segment"));
            }
            "." => directory = idx == last,
            ".." => {
                stack.pop();
                directory = idx == last;
            }
            segment => {
                stack.push(encode_segment(input, segment)?);
                directory = false;
            }
        }
    }

    if stack.is_empty() {
        return Ok("/".to_string());
    }

    let mut path = String::with_capacity(raw.len() + 8);
    for segment in &stack {
        path.push('/');
        path.push_str(segment);
    }
    if directory {
        path.push('/');
    }
    Ok(path)
}
