//! End-to-end HTTP request and multipart body parses.

use cat::http::{Event, Parser, ParserType};

#[test]
fn post_request_completes_with_expected_metadata() {
    let raw = b"POST /api/build/v1/foo HTTP/1.1\r\n\
Host: www.foo.com\r\n\
User-Agent: curl/7.64.1\r\n\
Accept: */*\r\n\
Content-Length: 7\r\n\
Content-Type: application/x-www-form-urlencoded\r\n\
\r\n\
foo=bar";

    let mut parser = Parser::new(ParserType::Request);
    let (events, stats) = parser.execute(raw).unwrap();

    assert!(stats.message_complete);
    assert!(stats.keep_alive);

    let url = events
        .iter()
        .find_map(|e| match e {
            Event::Url(range) => Some(std::str::from_utf8(&raw[range.clone()]).unwrap()),
            _ => None,
        })
        .unwrap();
    assert_eq!(url, "/api/build/v1/foo");

    let body = events
        .iter()
        .find_map(|e| match e {
            Event::Body(range) => Some(&raw[range.clone()]),
            _ => None,
        })
        .unwrap();
    assert_eq!(body, b"foo=bar");
}

#[test]
fn multipart_body_emits_field_and_file_parts_in_order() {
    let raw = "POST /upload HTTP/1.1\r\n\
Content-Type: multipart/form; boundary=cafebabe\r\n\
Content-Length: 236\r\n\r\n\
--cafebabe\r\n\
Content-Disposition: form-data; name=\"description\"\r\n\r\n\
some text\r\n\
--cafebabe\r\n\
Content-Disposition: form-data; name=\"myFile\"; filename=\"foo.txt\"\r\n\
Content-Type: text/plain\r\n\r\n\
content of the uploaded file foo.txt\r\n\
--cafebabe--\r\n"
        .as_bytes()
        .to_vec();

    let mut parser = Parser::new(ParserType::Request);
    let (events, stats) = parser.execute(&raw).unwrap();
    assert!(stats.message_complete);

    let order: Vec<&'static str> = events
        .iter()
        .filter_map(|e| match e {
            Event::MultipartDataBegin => Some("begin"),
            Event::MultipartHeaderField(_) => Some("field"),
            Event::MultipartHeaderValue(_) => Some("value"),
            Event::MultipartHeadersComplete => Some("headers_complete"),
            Event::MultipartData(_) => Some("data"),
            Event::MultipartDataEnd => Some("data_end"),
            _ => None,
        })
        .collect();

    assert_eq!(
        order,
        vec![
            "begin", "field", "value", "headers_complete", "data", "data_end", "begin", "field", "value", "field", "value", "headers_complete", "data", "data_end",
        ]
    );
}
