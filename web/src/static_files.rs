//! static file serving with content hashing, conditional requests and
//! byte ranges.

use std::{
    cell::RefCell,
    collections::HashMap,
    path::{Component, Path, PathBuf},
    time::SystemTime,
};

use async_trait::async_trait;
use bytes::Bytes;
use gale_http::{StatusCode, header};
use percent_encoding::percent_decode_str;
use sha2::{Digest, Sha512};
use tokio::io::{AsyncReadExt, AsyncSeekExt};
use tracing::debug;

use crate::{
    error::HttpError,
    handler::{Handler, RequestContext},
};

/// cache entries are the content hash plus the modification time they were
/// computed at.
type HashCache = RefCell<HashMap<PathBuf, (SystemTime, String)>>;

/// length of the version tag exposed in `?v=` urls.
const VERSION_TAG_LEN: usize = 10;

const FILE_CHUNK: usize = 65536;

/// Shared state of the static file subsystem: root directory, url prefix
/// and the per-path content hash cache.
pub struct StaticFiles {
    root: PathBuf,
    url_prefix: String,
    default_filename: Option<String>,
    hashes: HashCache,
}

impl StaticFiles {
    pub fn new(root: PathBuf, url_prefix: String, default_filename: Option<String>) -> Self {
        Self {
            root,
            url_prefix,
            default_filename,
            hashes: RefCell::new(HashMap::new()),
        }
    }

    pub fn url_prefix(&self) -> &str {
        &self.url_prefix
    }

    /// url for a static asset including its content version tag.
    pub fn static_url(&self, path: &str) -> String {
        let base = format!("{}{}", self.url_prefix, path);
        match self.resolve(path).ok().and_then(|abs| self.content_hash(&abs)) {
            Some(hash) => format!("{}?v={}", base, &hash[..VERSION_TAG_LEN]),
            None => base,
        }
    }

    /// resolve a url path to an absolute path under the root, refusing
    /// anything that would escape it.
    fn resolve(&self, url_path: &str) -> Result<PathBuf, HttpError> {
        let decoded = percent_decode_str(url_path).decode_utf8_lossy();

        let mut resolved = self.root.clone();
        for component in Path::new(decoded.as_ref()).components() {
            match component {
                Component::Normal(segment) => resolved.push(segment),
                Component::CurDir => {}
                // anything pointing upward or restarting at a root escapes
                // the configured directory.
                Component::ParentDir | Component::RootDir | Component::Prefix(_) => {
                    return Err(HttpError::forbidden(format!("path escapes static root: {url_path}")));
                }
            }
        }
        Ok(resolved)
    }

    /// full SHA-512 content hash, cached per absolute path and refreshed
    /// when the file's modification time changes.
    fn content_hash(&self, abs: &Path) -> Option<String> {
        let mtime = std::fs::metadata(abs).and_then(|m| m.modified()).ok()?;
        if let Some((cached_at, hash)) = self.hashes.borrow().get(abs) {
            if *cached_at == mtime {
                return Some(hash.clone());
            }
        }

        let contents = std::fs::read(abs).ok()?;
        let hash = hex::encode(Sha512::digest(&contents));
        self.hashes.borrow_mut().insert(abs.to_path_buf(), (mtime, hash.clone()));
        Some(hash)
    }

    /// serve `url_path` into the response.
    pub async fn serve(&self, ctx: &mut RequestContext<'_>, url_path: &str) -> Result<(), HttpError> {
        let mut abs = self.resolve(url_path)?;

        let mut meta = tokio::fs::metadata(&abs).await.map_err(not_found)?;
        if meta.is_dir() {
            match &self.default_filename {
                Some(default_filename) => {
                    abs.push(default_filename);
                    meta = tokio::fs::metadata(&abs).await.map_err(not_found)?;
                }
                None => return Err(HttpError::not_found()),
            }
        }
        if !meta.is_file() {
            return Err(HttpError::not_found());
        }

        let hash = self
            .content_hash(&abs)
            .ok_or_else(|| HttpError::internal("static file became unreadable"))?;
        let etag = format!("\"{}\"", &hash[..VERSION_TAG_LEN * 2]);

        ctx.set_header(header::ETAG, &etag);
        ctx.set_header(header::ACCEPT_RANGES, "bytes");
        if let Ok(modified) = meta.modified() {
            ctx.set_header(header::LAST_MODIFIED, &httpdate::fmt_http_date(modified));
        }

        let mime = mime_guess::from_path(&abs).first_or_octet_stream();
        ctx.set_header(header::CONTENT_TYPE, mime.as_ref());

        // a request that named the current version may cache effectively
        // forever; anything else stays revalidatable.
        let versioned = ctx
            .request
            .query_arguments()
            .get("v")
            .map(|v| !v.is_empty() && hash.starts_with(&v))
            .unwrap_or(false);
        if versioned {
            ctx.set_header(header::CACHE_CONTROL, "max-age=315360000");
        } else {
            ctx.set_header(header::CACHE_CONTROL, "public");
        }

        // conditional request?
        let if_none_match = ctx
            .request
            .headers
            .get(header::IF_NONE_MATCH)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string);
        if let Some(inm) = if_none_match {
            if inm.split(',').any(|candidate| candidate.trim() == etag || candidate.trim() == "*") {
                ctx.set_status(StatusCode::NOT_MODIFIED);
                return ctx.finish().await;
            }
        }

        let size = meta.len();
        let range = ctx
            .request
            .headers
            .get(header::RANGE)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string);

        let (start, end) = match range {
            Some(ref header_value) => match parse_range(header_value, size) {
                Some(range) => {
                    ctx.set_status(StatusCode::PARTIAL_CONTENT);
                    ctx.set_header(
                        header::CONTENT_RANGE,
                        &format!("bytes {}-{}/{}", range.0, range.1 - 1, size),
                    );
                    range
                }
                None => {
                    debug!(target: "static_files", "unsatisfiable range {header_value:?} for {abs:?}");
                    ctx.set_status(StatusCode::RANGE_NOT_SATISFIABLE);
                    ctx.set_header(header::CONTENT_RANGE, &format!("bytes */{size}"));
                    return ctx.finish().await;
                }
            },
            None => (0, size),
        };

        let mut file = tokio::fs::File::open(&abs).await.map_err(not_found)?;
        if start > 0 {
            file.seek(std::io::SeekFrom::Start(start))
                .await
                .map_err(|e| HttpError::internal(e.to_string()))?;
        }

        let mut remaining = end - start;
        while remaining > 0 {
            let take = remaining.min(FILE_CHUNK as u64) as usize;
            let mut buf = vec![0u8; take];
            file.read_exact(&mut buf)
                .await
                .map_err(|e| HttpError::internal(e.to_string()))?;
            remaining -= take as u64;
            ctx.write(Bytes::from(buf))?;
            if remaining > 0 {
                // stream large files instead of buffering them whole.
                ctx.flush().await?;
            }
        }

        ctx.finish().await
    }
}

fn not_found(e: std::io::Error) -> HttpError {
    match e.kind() {
        std::io::ErrorKind::PermissionDenied => HttpError::new(StatusCode::FORBIDDEN),
        _ => HttpError::not_found(),
    }
}

/// parse a single `bytes=a-b` range against the entity size, normalizing
/// to a half-open interval. `None` when absent from the entity.
fn parse_range(value: &str, size: u64) -> Option<(u64, u64)> {
    let ranges = http_range_header::parse_range_header(value).ok()?;
    let validated = ranges.validate(size).ok()?;
    let first = validated.first()?;
    Some((*first.start(), *first.end() + 1))
}

/// Handler serving files below the configured static root. The route
/// pattern is expected to capture the relative path as its first group.
pub struct StaticFileHandler;

#[async_trait(?Send)]
impl Handler for StaticFileHandler {
    async fn get(&mut self, ctx: &mut RequestContext<'_>) -> Result<(), HttpError> {
        let files = ctx
            .static_files()
            .ok_or_else(|| HttpError::internal("static_path setting required"))?;
        let path = ctx
            .request
            .path_params
            .positional(0)
            .map(str::to_string)
            .ok_or_else(|| HttpError::internal("static route pattern must capture the file path"))?;
        if path.is_empty() {
            return Err(HttpError::not_found());
        }
        files.serve(ctx, &path).await
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn files(root: &Path) -> StaticFiles {
        StaticFiles::new(root.to_path_buf(), "/static/".to_string(), None)
    }

    #[test]
    fn resolve_rejects_escapes() {
        let files = files(Path::new("/srv/static"));
        assert!(files.resolve("css/site.css").is_ok());
        assert!(files.resolve("a/./b.txt").is_ok());
        assert!(files.resolve("../etc/passwd").is_err());
        assert!(files.resolve("a/../../etc/passwd").is_err());
        assert!(files.resolve("/etc/passwd").is_err());
        // percent-encoded traversal is decoded before the check.
        assert!(files.resolve("%2e%2e/etc/passwd").is_err());
    }

    #[test]
    fn resolve_stays_under_root() {
        let files = files(Path::new("/srv/static"));
        let resolved = files.resolve("img/logo.png").unwrap();
        assert_eq!(resolved, Path::new("/srv/static/img/logo.png"));
    }

    #[test]
    fn static_url_appends_version() {
        let dir = std::env::temp_dir().join(format!("gale-static-test-{}", std::process::id()));
        std::fs::create_dir_all(&dir).unwrap();
        std::fs::write(dir.join("app.js"), b"console.log(1)").unwrap();

        let files = files(&dir);
        let url = files.static_url("app.js");
        assert!(url.starts_with("/static/app.js?v="), "{url}");
        let tag = url.rsplit_once("v=").unwrap().1;
        assert_eq!(tag.len(), VERSION_TAG_LEN);

        let expected = hex::encode(Sha512::digest(b"console.log(1)"));
        assert!(expected.starts_with(tag));

        // a missing file produces an unversioned url.
        assert_eq!(files.static_url("nope.js"), "/static/nope.js");

        std::fs::remove_dir_all(&dir).unwrap();
    }

    #[test]
    fn range_parsing() {
        assert_eq!(parse_range("bytes=0-4", 10), Some((0, 5)));
        assert_eq!(parse_range("bytes=5-", 10), Some((5, 10)));
        assert_eq!(parse_range("bytes=-3", 10), Some((7, 10)));
        assert_eq!(parse_range("bytes=20-30", 10), None);
        assert_eq!(parse_range("lines=1-2", 10), None);
    }
}
