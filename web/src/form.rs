//! request argument parsing: query strings, urlencoded and multipart
//! bodies.

use bytes::Bytes;
use memchr::memmem;
use tracing::warn;

/// An uploaded file out of a `multipart/form-data` body.
#[derive(Debug, Clone)]
pub struct UploadedFile {
    pub filename: String,
    pub content_type: String,
    pub body: Bytes,
}

/// Ordered multi-value argument map. Names keep their first-appearance
/// order; values per name keep submission order.
#[derive(Debug, Default, Clone)]
pub struct Arguments {
    entries: Vec<(String, Vec<Bytes>)>,
}

impl Arguments {
    pub fn push(&mut self, name: &str, value: Bytes) {
        match self.entries.iter_mut().find(|(n, _)| n == name) {
            Some((_, values)) => values.push(value),
            None => self.entries.push((name.to_string(), vec![value])),
        }
    }

    /// all values supplied for `name`.
    pub fn get_all(&self, name: &str) -> &[Bytes] {
        self.entries
            .iter()
            .find(|(n, _)| n == name)
            .map(|(_, values)| values.as_slice())
            .unwrap_or(&[])
    }

    /// the last value supplied for `name`, decoded as UTF-8.
    pub fn get(&self, name: &str) -> Option<String> {
        let value = self.get_all(name).last()?;
        Some(String::from_utf8_lossy(value).into_owned())
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.entries.iter().map(|(n, _)| n.as_str())
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// merge `other` after this one's values.
    pub fn extend(&mut self, other: Arguments) {
        for (name, values) in other.entries {
            for value in values {
                self.push(&name, value);
            }
        }
    }
}

/// parse a query string or `application/x-www-form-urlencoded` body.
pub fn parse_qs(input: &[u8]) -> Arguments {
    let mut args = Arguments::default();
    for pair in input.split(|b| *b == b'&') {
        if pair.is_empty() {
            continue;
        }
        let (name, value) = match memchr::memchr(b'=', pair) {
            Some(i) => (&pair[..i], &pair[i + 1..]),
            None => (pair, &[][..]),
        };
        let name = String::from_utf8_lossy(&unescape(name)).into_owned();
        args.push(&name, Bytes::from(unescape(value)));
    }
    args
}

/// percent-decode with `+` as space, the form-urlencoded flavor.
/// malformed escapes pass through untouched.
fn unescape(input: &[u8]) -> Vec<u8> {
    let plus_as_space: Vec<u8> = input.iter().map(|b| if *b == b'+' { b' ' } else { *b }).collect();
    percent_encoding::percent_decode(&plus_as_space).collect()
}

/// parse the body arguments a request carries, keyed off its content type.
/// returns parsed arguments plus any uploaded files.
pub fn parse_body_arguments(content_type: &str, body: &Bytes) -> (Arguments, Vec<(String, UploadedFile)>) {
    if content_type.starts_with("application/x-www-form-urlencoded") {
        (parse_qs(body), Vec::new())
    } else if let Some(boundary) = multipart_boundary(content_type) {
        parse_multipart(boundary.as_bytes(), body)
    } else {
        (Arguments::default(), Vec::new())
    }
}

fn multipart_boundary(content_type: &str) -> Option<String> {
    let rest = content_type.strip_prefix("multipart/form-data")?;
    for param in rest.split(';') {
        let param = param.trim();
        if let Some(value) = param.strip_prefix("boundary=") {
            let value = value.trim_matches('"');
            if !value.is_empty() {
                return Some(value.to_string());
            }
        }
    }
    None
}

/// parse a `multipart/form-data` body (RFC 7578 subset: form fields and
/// file uploads, no nested multiparts).
fn parse_multipart(boundary: &[u8], body: &Bytes) -> (Arguments, Vec<(String, UploadedFile)>) {
    let mut args = Arguments::default();
    let mut files = Vec::new();

    // the terminating boundary is "--boundary--"; everything of interest
    // sits between "--boundary" markers.
    let mut marker = Vec::with_capacity(boundary.len() + 4);
    marker.extend_from_slice(b"--");
    marker.extend_from_slice(boundary);

    let Some(final_idx) = memmem::rfind(&body[..], &marker) else {
        warn!(target: "multipart", "multipart body missing final boundary");
        return (args, files);
    };
    if body.get(final_idx + marker.len()..final_idx + marker.len() + 2) != Some(&b"--"[..]) {
        warn!(target: "multipart", "multipart body missing final boundary");
        return (args, files);
    }

    let mut separator = Vec::with_capacity(marker.len() + 2);
    separator.extend_from_slice(b"\r\n");
    separator.extend_from_slice(&marker);

    let content = body.slice(..final_idx);
    let mut parts: Vec<Bytes> = Vec::new();
    // first part starts right after the first marker.
    let mut cursor = match memmem::find(&content[..], &marker) {
        Some(0) => marker.len(),
        _ => {
            warn!(target: "multipart", "multipart body does not start with boundary");
            return (args, files);
        }
    };
    loop {
        match memmem::find(&content[cursor..], &separator) {
            Some(next) => {
                parts.push(content.slice(cursor..cursor + next));
                cursor += next + separator.len();
            }
            None => {
                parts.push(content.slice(cursor..));
                break;
            }
        }
    }

    for part in parts {
        // each part is "\r\nheaders\r\n\r\nvalue\r\n".
        let part = if part.starts_with(b"\r\n") { part.slice(2..) } else { part };
        let Some(header_end) = memmem::find(&part[..], b"\r\n\r\n") else {
            warn!(target: "multipart", "multipart part missing header terminator");
            continue;
        };
        let headers = &part[..header_end];
        let mut value = part.slice(header_end + 4..);
        if value.ends_with(b"\r\n") {
            value.truncate(value.len() - 2);
        }

        let mut name = None;
        let mut filename = None;
        let mut content_type = "application/unknown".to_string();
        for line in headers.split(|b| *b == b'\n') {
            let line = String::from_utf8_lossy(line);
            let line = line.trim_end_matches('\r');
            if let Some(disposition) = strip_header(line, "content-disposition") {
                for piece in disposition.split(';') {
                    let piece = piece.trim();
                    if let Some(v) = piece.strip_prefix("name=") {
                        name = Some(v.trim_matches('"').to_string());
                    } else if let Some(v) = piece.strip_prefix("filename=") {
                        filename = Some(v.trim_matches('"').to_string());
                    }
                }
            } else if let Some(ct) = strip_header(line, "content-type") {
                content_type = ct.trim().to_string();
            }
        }

        let Some(name) = name else {
            warn!(target: "multipart", "multipart part without a field name");
            continue;
        };

        match filename {
            Some(filename) => files.push((
                name,
                UploadedFile {
                    filename,
                    content_type,
                    body: value,
                },
            )),
            None => args.push(&name, value),
        }
    }

    (args, files)
}

fn strip_header<'a>(line: &'a str, name: &str) -> Option<&'a str> {
    let (header, value) = line.split_once(':')?;
    header.trim().eq_ignore_ascii_case(name).then(|| value.trim())
}
