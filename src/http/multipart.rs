//! Multipart body sub-parser, emitting the classic multipart-parser event
//! set (`on_part_data_begin`, `on_header_field`, `on_header_value`,
//! `on_headers_complete`, `on_part_data`, `on_part_data_end`, `on_body_end`).
//!
//! The HTTP core hands this parser the whole body in one call (see the
//! module doc comment on the simplification this crate makes), so rather
//! than a byte-at-a-time scanner this walks from one `--boundary` occurrence
//! to the next.

use crate::error::{Code, Error, Result};

pub const BOUNDARY_MAX_LEN: usize = 70;

/// The content-type lexer's precise state set.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum CtState {
    Uninit,
    InContentType,
    TypeIsMultipart,
    AlmostBoundary,
    Boundary,
    BoundaryStart,
    BoundaryCommon,
    BoundaryQuoted,
    BoundaryEnd,
    OutContentType,
    NotMultipart,
    BoundaryOk,
}

/// Chars RFC 2046 permits inside a boundary, plus the space which is only
/// valid between other characters (trailing space is OWS and gets
/// stripped).
fn is_boundary_char(c: u8) -> bool {
    c.is_ascii_digit()
        || c.is_ascii_alphabetic()
        || matches!(c, b'\'' | b'(' | b')' | b'+' | b',' | b'-' | b'.' | b'/' | b':' | b'=' | b'?' | b'_' | b' ')
}

/// Scans a `Content-Type` header value, driving [`CtState`] from
/// `UNINIT` through to `BOUNDARY_OK` or `NOT_MULTIPART`. Returns the
/// extracted boundary (without the leading `--`) on success.
///
/// `boundary=` need not be the first `;`-delimited parameter — a parameter
/// that isn't `boundary=` is skipped in favor of the next one, the same
/// roll-forward the state machine this mirrors does.
pub fn scan_content_type(value: &[u8]) -> Result<Option<Vec<u8>>> {
    let mut state = CtState::Uninit;
    let lower: Vec<u8> = value.iter().map(|b| b.to_ascii_lowercase()).collect();
    let mut i = 0;
    state = CtState::InContentType;

    if !lower.starts_with(b"multipart/") {
        return Ok(None);
    }
    state = CtState::TypeIsMultipart;
    i += "multipart/".len();
    while i < lower.len() && lower[i] != b';' {
        i += 1;
    }
    if i >= lower.len() {
        return Ok(None); // TYPE_IS_MULTIPART with no params -> OUT_CONTENT_TYPE, no boundary
    }

    const TAG: &[u8] = b"boundary=";
    loop {
        i += 1; // skip ';'
        state = CtState::AlmostBoundary;

        while i < lower.len() && (lower[i] == b' ' || lower[i] == b'\t') {
            i += 1;
        }

        if lower[i..].len() >= TAG.len() && &lower[i..i + TAG.len()] == TAG {
            state = CtState::Boundary;
            i += TAG.len();
            break;
        }
        // Not this parameter's `boundary=`; roll forward to the next one.
        while i < lower.len() && lower[i] != b';' {
            i += 1;
        }
        if i >= lower.len() {
            return Err(Error::new(Code::MultipartHeader, "multipart Content-Type missing boundary= parameter"));
        }
    }

    let raw = &value[i..];
    let boundary = if raw.first() == Some(&b'"') {
        state = CtState::BoundaryQuoted;
        let end = raw[1..].iter().position(|&b| b == b'"').map(|p| p + 1);
        match end {
            Some(end) => raw[1..end].to_vec(),
            None => return Err(Error::new(Code::MultipartHeader, "unterminated quoted boundary")),
        }
    } else {
        state = CtState::BoundaryCommon;
        let end = raw.iter().position(|&b| !is_boundary_char(b)).unwrap_or(raw.len());
        raw[..end].to_vec()
    };
    state = CtState::BoundaryStart;

    // OWS stripping: trailing space/tab.
    let trimmed_len = boundary.iter().rposition(|&b| b != b' ' && b != b'\t').map(|p| p + 1).unwrap_or(0);
    let boundary = boundary[..trimmed_len].to_vec();
    state = CtState::BoundaryEnd;

    if boundary.is_empty() {
        return Err(Error::new(Code::MultipartHeader, "empty multipart boundary"));
    }
    if boundary.len() > BOUNDARY_MAX_LEN {
        return Err(Error::new(Code::MultipartHeader, "multipart boundary exceeds 70 bytes"));
    }
    if !boundary.iter().all(|&b| is_boundary_char(b)) {
        return Err(Error::new(Code::MultipartHeader, "multipart boundary contains a disallowed character"));
    }

    state = CtState::BoundaryOk;
    debug_assert_eq!(state, CtState::BoundaryOk);
    Ok(Some(boundary))
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MultipartEvent {
    DataBegin,
    HeaderField(Vec<u8>),
    HeaderValue(Vec<u8>),
    HeadersComplete,
    Data(Vec<u8>),
    DataEnd,
    BodyEnd,
}

pub struct MultipartParser {
    delimiter: Vec<u8>,
}

impl MultipartParser {
    pub fn new(boundary: Vec<u8>) -> Result<MultipartParser> {
        if boundary.is_empty() || boundary.len() > BOUNDARY_MAX_LEN {
            return Err(Error::new(Code::MultipartHeader, "invalid multipart boundary length"));
        }
        let mut delimiter = Vec::with_capacity(boundary.len() + 2);
        delimiter.extend_from_slice(b"--");
        delimiter.extend_from_slice(&boundary);
        Ok(MultipartParser { delimiter })
    }

    /// Parses a whole multipart body in one call, emitting
    /// begin/field/value/headers-complete/data/data-end for each part in
    /// order, followed by a final body-end.
    pub fn execute(&self, body: &[u8]) -> Result<Vec<MultipartEvent>> {
        let mut events = Vec::new();
        let mut cursor = match find(body, &self.delimiter, 0) {
            Some(pos) => pos + self.delimiter.len(),
            None => return Err(Error::new(Code::MultipartBody, "multipart body contains no boundary")),
        };

        loop {
            if body[cursor..].starts_with(b"--") {
                events.push(MultipartEvent::BodyEnd);
                return Ok(events);
            }
            cursor += skip_crlf(&body[cursor..]);

            let header_end = match find(body, b"\r\n\r\n", cursor) {
                Some(pos) => pos,
                None => return Err(Error::new(Code::MultipartBody, "multipart part headers never terminated")),
            };

            events.push(MultipartEvent::DataBegin);
            for line in body[cursor..header_end].split(|&b| b == b'\n') {
                let line = strip_trailing_cr(line);
                if line.is_empty() {
                    continue;
                }
                let colon = line.iter().position(|&b| b == b':').ok_or_else(|| Error::new(Code::MultipartBody, "malformed multipart header line"))?;
                let field = &line[..colon];
                let mut value = &line[colon + 1..];
                while value.first() == Some(&b' ') || value.first() == Some(&b'\t') {
                    value = &value[1..];
                }
                events.push(MultipartEvent::HeaderField(field.to_vec()));
                events.push(MultipartEvent::HeaderValue(value.to_vec()));
            }
            events.push(MultipartEvent::HeadersComplete);

            let data_start = header_end + 4;
            let next_delim = find(body, &self.delimiter, data_start).ok_or_else(|| Error::new(Code::MultipartBody, "multipart part never closed by a boundary"))?;
            let data_end = data_start + strip_trailing_crlf_len(&body[data_start..next_delim]);
            events.push(MultipartEvent::Data(body[data_start..data_end].to_vec()));
            events.push(MultipartEvent::DataEnd);

            cursor = next_delim + self.delimiter.len();
        }
    }
}

fn find(haystack: &[u8], needle: &[u8], from: usize) -> Option<usize> {
    if needle.is_empty() || from > haystack.len() {
        return None;
    }
    haystack[from..].windows(needle.len()).position(|w| w == needle).map(|p| p + from)
}

fn skip_crlf(data: &[u8]) -> usize {
    if data.starts_with(b"\r\n") {
        2
    } else {
        0
    }
}

fn strip_trailing_cr(line: &[u8]) -> &[u8] {
    if line.last() == Some(&b'\r') {
        &line[..line.len() - 1]
    } else {
        line
    }
}

fn strip_trailing_crlf_len(data: &[u8]) -> usize {
    if data.ends_with(b"\r\n") {
        data.len() - 2
    } else {
        data.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn scans_simple_boundary() {
        let boundary = scan_content_type(b"multipart/form; boundary=cafebabe").unwrap();
        assert_eq!(boundary, Some(b"cafebabe".to_vec()));
    }

    #[test]
    fn strips_trailing_ows_in_boundary() {
        let boundary = scan_content_type(b"multipart/form; boundary=abc  ").unwrap();
        assert_eq!(boundary, Some(b"abc".to_vec()));
    }

    #[test]
    fn rejects_oversized_boundary() {
        let long = "a".repeat(80);
        let header = format!("multipart/form; boundary={}", long);
        let err = scan_content_type(header.as_bytes()).unwrap_err();
        assert_eq!(err.code, Code::MultipartHeader);
    }

    #[test]
    fn non_multipart_returns_none() {
        assert_eq!(scan_content_type(b"application/json").unwrap(), None);
    }

    #[test]
    fn boundary_with_an_embedded_space_is_kept_whole() {
        let boundary = scan_content_type(b"multipart/form; boundary=abc def").unwrap();
        assert_eq!(boundary, Some(b"abc def".to_vec()));
    }

    #[test]
    fn finds_boundary_after_an_earlier_parameter() {
        let boundary = scan_content_type(b"multipart/form; charset=utf-8; boundary=abc").unwrap();
        assert_eq!(boundary, Some(b"abc".to_vec()));
    }

    #[test]
    fn missing_boundary_among_other_parameters_is_an_error() {
        let err = scan_content_type(b"multipart/form; charset=utf-8").unwrap_err();
        assert_eq!(err.code, Code::MultipartHeader);
    }

    #[test]
    fn parses_two_part_body() {
        let body = b"--cafebabe\r\n\
Content-Disposition: form-data; name=\"description\"\r\n\r\n\
some text\r\n\
--cafebabe\r\n\
Content-Disposition: form-data; name=\"myFile\"; filename=\"foo.txt\"\r\n\
Content-Type: text/plain\r\n\r\n\
content of the uploaded file foo.txt\r\n\
--cafebabe--\r\n";
        let parser = MultipartParser::new(b"cafebabe".to_vec()).unwrap();
        let events = parser.execute(body).unwrap();
        assert_eq!(events.first(), Some(&MultipartEvent::DataBegin));
        assert_eq!(events.last(), Some(&MultipartEvent::BodyEnd));
        assert!(events.contains(&MultipartEvent::Data(b"some text".to_vec())));
        assert!(events.contains(&MultipartEvent::Data(b"content of the uploaded file foo.txt".to_vec())));
    }
}
