use http::{
    HeaderMap, Method, StatusCode, Uri, Version,
    header::{CONNECTION, CONTENT_LENGTH, EXPECT, HeaderName, HeaderValue, TRANSFER_ENCODING},
};

use crate::error::{Parse, ProtoError};

use super::{codec::TransferCoding, head::{RequestHead, ResponseHead}};

const MAX_HEADERS: usize = 128;

/// A parsed message head together with its body framing and the connection
/// disposition the headers imply.
#[derive(Debug)]
pub struct Decoded<H> {
    pub head: H,
    pub coding: TransferCoding,
    /// the peer asked for (or the protocol version implies) closing the
    /// connection after this message.
    pub close: bool,
}

/// parse a complete request head (everything through the blank line).
pub fn decode_request_head(buf: &[u8]) -> Result<Decoded<RequestHead>, ProtoError> {
    let mut headers = [httparse::EMPTY_HEADER; MAX_HEADERS];
    let mut req = httparse::Request::new(&mut headers);

    match req.parse(buf)? {
        httparse::Status::Complete(_) => {}
        // the caller hands over a head terminated by a blank line, so a
        // partial parse means the message is malformed.
        httparse::Status::Partial => return Err(ProtoError::Parse(Parse::HeaderName)),
    }

    let method = Method::from_bytes(req.method.unwrap().as_bytes()).map_err(|_| ProtoError::Parse(Parse::Method))?;
    let target: Uri = req.path.unwrap().parse().map_err(|_| ProtoError::Parse(Parse::Uri))?;
    let version = match req.version.unwrap() {
        0 => Version::HTTP_10,
        1 => Version::HTTP_11,
        _ => return Err(ProtoError::Parse(Parse::Version)),
    };

    // requests without a body default to no body; responses differ.
    let mut coding = TransferCoding::eof();
    let mut close = version == Version::HTTP_10;
    let mut expect_continue = false;

    let mut map = HeaderMap::with_capacity(req.headers.len());
    for header in req.headers.iter() {
        let name = HeaderName::from_bytes(header.name.as_bytes()).map_err(|_| ProtoError::Parse(Parse::HeaderName))?;
        let value = HeaderValue::from_bytes(header.value).map_err(|_| ProtoError::Parse(Parse::HeaderValue))?;

        match name {
            TRANSFER_ENCODING => {
                if version != Version::HTTP_11 {
                    return Err(ProtoError::Parse(Parse::TransferEncoding));
                }
                apply_transfer_encoding(&value, &mut coding)?;
            }
            CONTENT_LENGTH => apply_content_length(&value, &mut coding)?,
            CONNECTION => apply_connection(&value, version, &mut close)?,
            EXPECT => {
                if !value.as_bytes().eq_ignore_ascii_case(b"100-continue") {
                    return Err(ProtoError::Parse(Parse::HeaderValue));
                }
                expect_continue = true;
            }
            _ => {}
        }

        map.append(name, value);
    }

    Ok(Decoded {
        head: RequestHead {
            method,
            target,
            version,
            headers: map,
            expect_continue,
        },
        coding,
        close,
    })
}

/// parse a complete response head. `method` is the request method the
/// response answers, which decides body suppression for HEAD.
pub fn decode_response_head(buf: &[u8], method: &Method) -> Result<Decoded<ResponseHead>, ProtoError> {
    let mut headers = [httparse::EMPTY_HEADER; MAX_HEADERS];
    let mut res = httparse::Response::new(&mut headers);

    let parsed = httparse::ParserConfig::default()
        // obsolete line folding is still seen from legacy servers; fold it
        // into the previous value rather than failing the exchange.
        .allow_obsolete_multiline_headers_in_responses(true)
        .parse_response(&mut res, buf)?;
    match parsed {
        httparse::Status::Complete(_) => {}
        httparse::Status::Partial => return Err(ProtoError::Parse(Parse::StatusLine)),
    }

    let status = StatusCode::from_u16(res.code.unwrap()).map_err(|_| ProtoError::Parse(Parse::StatusLine))?;
    let version = match res.version.unwrap() {
        0 => Version::HTTP_10,
        1 => Version::HTTP_11,
        _ => return Err(ProtoError::Parse(Parse::Version)),
    };
    let reason = res.reason.filter(|r| !r.is_empty()).map(str::to_string);

    let mut coding = TransferCoding::eof();
    let mut saw_framing = false;
    let mut close = version == Version::HTTP_10;

    let mut map = HeaderMap::with_capacity(res.headers.len());
    for header in res.headers.iter() {
        let name = HeaderName::from_bytes(header.name.as_bytes()).map_err(|_| ProtoError::Parse(Parse::HeaderName))?;
        let value = HeaderValue::from_bytes(header.value).map_err(|_| ProtoError::Parse(Parse::HeaderValue))?;

        match name {
            TRANSFER_ENCODING => {
                apply_transfer_encoding(&value, &mut coding)?;
                saw_framing = true;
            }
            CONTENT_LENGTH => {
                apply_content_length(&value, &mut coding)?;
                saw_framing = true;
            }
            CONNECTION => apply_connection(&value, version, &mut close)?,
            _ => {}
        }

        map.append(name, value);
    }

    let head = ResponseHead {
        version,
        status,
        reason,
        headers: map,
    };

    // certain responses never carry a body regardless of framing headers.
    let coding = if *method == Method::HEAD || head.body_forbidden() {
        TransferCoding::eof()
    } else if !saw_framing {
        // a response without explicit framing runs until the peer closes.
        close = true;
        TransferCoding::unbounded()
    } else {
        coding
    };

    Ok(Decoded { head, coding, close })
}

/// any transfer encoding other than exactly `chunked` is rejected outright.
fn apply_transfer_encoding(value: &HeaderValue, coding: &mut TransferCoding) -> Result<(), ProtoError> {
    let value = value.to_str().map_err(|_| ProtoError::Parse(Parse::HeaderValue))?;
    for token in value.split(',') {
        let token = token.trim();
        if token.is_empty() {
            continue;
        }
        if !token.eq_ignore_ascii_case("chunked") {
            return Err(ProtoError::Parse(Parse::TransferEncoding));
        }
        coding.try_set(TransferCoding::decode_chunked())?;
    }
    Ok(())
}

fn apply_content_length(value: &HeaderValue, coding: &mut TransferCoding) -> Result<(), ProtoError> {
    // a folded header may carry a comma separated list; all entries must
    // agree on one value.
    let value = value.to_str().map_err(|_| ProtoError::Parse(Parse::ContentLength))?;
    for token in value.split(',') {
        let token = token.trim();
        if token.is_empty() || !token.bytes().all(|b| b.is_ascii_digit()) {
            return Err(ProtoError::Parse(Parse::ContentLength));
        }
        let len: u64 = token.parse().map_err(|_| ProtoError::Parse(Parse::ContentLength))?;
        coding.try_set(TransferCoding::length(len))?;
    }
    Ok(())
}

fn apply_connection(value: &HeaderValue, _version: Version, close: &mut bool) -> Result<(), ProtoError> {
    let value = value.to_str().map_err(|_| ProtoError::Parse(Parse::HeaderValue))?;
    for token in value.split(',') {
        let token = token.trim();
        if token.eq_ignore_ascii_case("keep-alive") {
            *close = false;
        } else if token.eq_ignore_ascii_case("close") {
            *close = true;
        }
    }
    Ok(())
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn get_with_query_arguments() {
        let head = b"GET /echo?x=1&x=2 HTTP/1.1\r\nHost: h\r\n\r\n";
        let decoded = decode_request_head(head).unwrap();
        assert_eq!(decoded.head.method, Method::GET);
        assert_eq!(decoded.head.target.path(), "/echo");
        assert_eq!(decoded.head.target.query(), Some("x=1&x=2"));
        assert_eq!(decoded.head.version, Version::HTTP_11);
        assert!(decoded.coding.is_eof());
        assert!(!decoded.close);
        assert_eq!(decoded.head.headers.get("host").unwrap(), "h");
    }

    #[test]
    fn http10_closes_by_default() {
        let decoded = decode_request_head(b"GET / HTTP/1.0\r\n\r\n").unwrap();
        assert!(decoded.close);
        let decoded = decode_request_head(b"GET / HTTP/1.0\r\nConnection: keep-alive\r\n\r\n").unwrap();
        assert!(!decoded.close);
    }

    #[test]
    fn http11_connection_close() {
        let decoded = decode_request_head(b"GET / HTTP/1.1\r\nConnection: close\r\n\r\n").unwrap();
        assert!(decoded.close);
    }

    #[test]
    fn header_lookup_is_case_insensitive_and_ordered() {
        let head = b"GET / HTTP/1.1\r\nX-One: 1\r\nContent-Type: text/plain\r\nX-Two: 2\r\n\r\n";
        let decoded = decode_request_head(head).unwrap();
        let headers = &decoded.head.headers;
        assert_eq!(headers.get("x-one"), headers.get("X-ONE"));
        let names: Vec<_> = headers.keys().map(|n| n.as_str()).collect();
        assert_eq!(names, vec!["x-one", "content-type", "x-two"]);
    }

    #[test]
    fn chunked_framing() {
        let head = b"POST /u HTTP/1.1\r\nTransfer-Encoding: chunked\r\n\r\n";
        let decoded = decode_request_head(head).unwrap();
        assert!(matches!(decoded.coding, TransferCoding::DecodeChunked(..)));
    }

    #[test]
    fn unknown_transfer_encoding_is_fatal() {
        for head in [
            &b"POST / HTTP/1.1\r\nTransfer-Encoding: gzip\r\n\r\n"[..],
            &b"POST / HTTP/1.1\r\nTransfer-Encoding: gzip, chunked\r\n\r\n"[..],
            &b"POST / HTTP/1.1\r\nTransfer-Encoding: identity\r\n\r\n"[..],
        ] {
            assert!(
                matches!(
                    decode_request_head(head),
                    Err(ProtoError::Parse(Parse::TransferEncoding))
                ),
                "{head:?}"
            );
        }
    }

    #[test]
    fn transfer_encoding_on_http10_is_fatal() {
        let head = b"POST / HTTP/1.0\r\nTransfer-Encoding: chunked\r\n\r\n";
        assert!(decode_request_head(head).is_err());
    }

    #[test]
    fn duplicate_content_length() {
        // identical duplicates collapse.
        let head = b"POST / HTTP/1.1\r\nContent-Length: 5\r\nContent-Length: 5\r\n\r\n";
        let decoded = decode_request_head(head).unwrap();
        assert_eq!(decoded.coding, TransferCoding::length(5));

        // disagreeing duplicates are fatal, folded or not.
        for head in [
            &b"POST / HTTP/1.1\r\nContent-Length: 5\r\nContent-Length: 6\r\n\r\n"[..],
            &b"POST / HTTP/1.1\r\nContent-Length: 5, 6\r\n\r\n"[..],
        ] {
            assert!(decode_request_head(head).is_err(), "{head:?}");
        }
    }

    #[test]
    fn expect_continue_flag() {
        let head = b"POST / HTTP/1.1\r\nExpect: 100-continue\r\nContent-Length: 2\r\n\r\n";
        let decoded = decode_request_head(head).unwrap();
        assert!(decoded.head.expect_continue);
    }

    #[test]
    fn crlf_in_target_rejected() {
        // raw CR in the request line never reaches the uri parser.
        assert!(decode_request_head(b"GET /a\rb HTTP/1.1\r\n\r\n").is_err());
    }

    #[test]
    fn response_head_basic() {
        let decoded =
            decode_response_head(b"HTTP/1.1 200 OK\r\nContent-Length: 2\r\n\r\n", &Method::GET).unwrap();
        assert_eq!(decoded.head.status, StatusCode::OK);
        assert_eq!(decoded.coding, TransferCoding::length(2));
        assert!(!decoded.close);
    }

    #[test]
    fn response_custom_reason_preserved() {
        let decoded = decode_response_head(b"HTTP/1.1 200 Fine\r\n\r\n", &Method::GET).unwrap();
        assert_eq!(decoded.head.reason.as_deref(), Some("Fine"));
    }

    #[test]
    fn head_and_204_have_no_body() {
        let decoded =
            decode_response_head(b"HTTP/1.1 200 OK\r\nContent-Length: 10\r\n\r\n", &Method::HEAD).unwrap();
        assert!(decoded.coding.is_eof());

        let decoded = decode_response_head(b"HTTP/1.1 204 No Content\r\n\r\n", &Method::GET).unwrap();
        assert!(decoded.coding.is_eof());

        let decoded = decode_response_head(b"HTTP/1.1 304 Not Modified\r\n\r\n", &Method::GET).unwrap();
        assert!(decoded.coding.is_eof());
    }

    #[test]
    fn response_without_framing_reads_until_close() {
        let decoded = decode_response_head(b"HTTP/1.0 200 OK\r\n\r\n", &Method::GET).unwrap();
        assert_eq!(decoded.coding, TransferCoding::unbounded());
        assert!(decoded.close);
    }
}
