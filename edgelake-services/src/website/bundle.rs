use std::{
    collections::HashMap,
    io::{Cursor, Read},
};

use bytes::Bytes;
use anyhow::bail;
use edgelake_core::AnyResult;
use http::{
    header::{self, HeaderValue},
    Response, StatusCode,
};
use mime_guess::mime;

const INDEX: &str = "index.html";

/// Upper bound on the decompressed size of one bundle.
pub const MAX_BUNDLE_BYTES: u64 = 256 * 1024 * 1024;
const PREALLOC_LIMIT: u64 = 1024 * 1024;

/// Unpacked website archive held in memory, keyed by relative file path.
#[derive(Debug, Default)]
pub struct Bundle {
    files: HashMap<String, Bytes>,
}

impl Bundle {
    pub fn from_zip(data: Bytes) -> AnyResult<Self> {
        Self::from_zip_limited(data, MAX_BUNDLE_BYTES)
    }

    /// Unpacks `data`, failing once the decompressed files exceed `limit` bytes.
    /// Declared entry sizes are not trusted.
    pub fn from_zip_limited(data: Bytes, limit: u64) -> AnyResult<Self> {
        let mut archive = zip::ZipArchive::new(Cursor::new(data))?;
        let mut files = HashMap::with_capacity(archive.len());
        let mut total = 0u64;
        for i in 0..archive.len() {
            let file = archive.by_index(i)?;
            if file.is_dir() {
                continue;
            }
            let name = file.name().trim_start_matches('/').to_string();
            let remaining = limit - total;
            if file.size() > remaining {
                bail!("bundle exceeds {limit} bytes at `{name}`");
            }
            let mut content = Vec::with_capacity(file.size().min(PREALLOC_LIMIT) as usize);
            file.take(remaining + 1).read_to_end(&mut content)?;
            let read = content.len() as u64;
            if read > remaining {
                bail!("bundle exceeds {limit} bytes at `{name}`");
            }
            total += read;
            files.insert(name, Bytes::from(content));
        }
        Ok(Self { files })
    }

    pub fn contains(&self, path: &str) -> bool {
        self.files.contains_key(path.trim_start_matches('/'))
    }

    pub fn get(&self, path: &str) -> Option<&Bytes> {
        self.files.get(path.trim_start_matches('/'))
    }

    pub fn len(&self) -> usize {
        self.files.len()
    }

    pub fn is_empty(&self) -> bool {
        self.files.is_empty()
    }

    /// Serves `path` with directory index and single-page-application
    /// fallback to the root `index.html`.
    pub fn serve(&self, path: &str, head: bool) -> Response<Bytes> {
        let key = path.trim_start_matches('/');
        let candidates = [
            (!key.is_empty() && !key.ends_with('/')).then(|| key.to_string()),
            Some(format!("{key}{}{INDEX}", if key.is_empty() || key.ends_with('/') { "" } else { "/" })),
            Some(INDEX.to_string()),
        ];
        for name in candidates.into_iter().flatten() {
            if let Some(body) = self.files.get(&name) {
                return respond(StatusCode::OK, content_type(&name), body.clone(), head);
            }
        }
        respond(
            StatusCode::NOT_FOUND,
            HeaderValue::from_static("text/plain; charset=utf-8"),
            Bytes::from_static(b"not found"),
            head,
        )
    }
}

fn respond(status: StatusCode, ctype: HeaderValue, body: Bytes, head: bool) -> Response<Bytes> {
    let mut resp = Response::new(if head { Bytes::new() } else { body.clone() });
    *resp.status_mut() = status;
    let headers = resp.headers_mut();
    headers.insert(header::CONTENT_TYPE, ctype);
    headers.insert(header::CONTENT_LENGTH, HeaderValue::from(body.len()));
    resp
}

fn content_type(name: &str) -> HeaderValue {
    let guess = mime_guess::from_path(name).first_or_octet_stream();
    let value = if guess.type_() == mime::TEXT && guess.get_param(mime::CHARSET).is_none() {
        format!("{guess}; charset=utf-8")
    } else {
        guess.to_string()
    };
    HeaderValue::from_str(&value)
        .unwrap_or_else(|_| HeaderValue::from_static("application/octet-stream"))
}

/// Lexically normalizes an absolute path, resolving `.` and `..`.
pub fn clean_path(path: &str) -> String {
    let mut parts: Vec<&str> = Vec::new();
    for segment in path.split('/') {
        match segment {
            "" | "." => {}
            ".." => {
                parts.pop();
            }
            s => parts.push(s),
        }
    }
    format!("/{}", parts.join("/"))
}

#[cfg(test)]
pub(crate) fn zip_files(files: &[(&str, &str)]) -> Bytes {
    use std::io::Write;

    let mut writer = zip::ZipWriter::new(Cursor::new(Vec::new()));
    let options = zip::write::SimpleFileOptions::default();
    for (name, content) in files {
        writer.start_file(*name, options).unwrap();
        writer.write_all(content.as_bytes()).unwrap();
    }
    Bytes::from(writer.finish().unwrap().into_inner())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn bundle() -> Bundle {
        Bundle::from_zip(zip_files(&[
            ("index.html", "<h1>home</h1>"),
            ("about/index.html", "<h1>about</h1>"),
            ("app.js", "console.log(1)"),
        ]))
        .unwrap()
    }

    #[test]
    fn test_file_index() {
        let b = bundle();
        assert_eq!(b.len(), 3);
        assert!(b.contains("index.html"));
        assert!(b.contains("/about/index.html"));
        assert!(!b.contains("about"));
    }

    #[test]
    fn test_serve_file_and_directory() {
        let b = bundle();
        let resp = b.serve("/app.js", false);
        assert_eq!(resp.status(), StatusCode::OK);
        assert_eq!(resp.body().as_ref(), b"console.log(1)");
        let resp = b.serve("/", false);
        assert_eq!(resp.headers()[header::CONTENT_TYPE], "text/html; charset=utf-8");

        let resp = b.serve("/about/", false);
        assert_eq!(resp.body().as_ref(), b"<h1>about</h1>");
        let resp = b.serve("/about", false);
        assert_eq!(resp.body().as_ref(), b"<h1>about</h1>");
    }

    #[test]
    fn test_spa_fallback() {
        let b = bundle();
        let resp = b.serve("/dashboard/settings", false);
        assert_eq!(resp.status(), StatusCode::OK);
        assert_eq!(resp.body().as_ref(), b"<h1>home</h1>");

        let empty = Bundle::from_zip(zip_files(&[("app.js", "")])).unwrap();
        assert_eq!(empty.serve("/missing", false).status(), StatusCode::NOT_FOUND);
    }

    #[test]
    fn test_head_has_length_without_body() {
        let resp = bundle().serve("/", true);
        assert!(resp.body().is_empty());
        assert_eq!(resp.headers()[header::CONTENT_LENGTH], "13");
    }

    #[test]
    fn test_content_type_guess() {
        assert_eq!(content_type("logo.png"), "image/png");
        assert_eq!(content_type("style.CSS"), "text/css; charset=utf-8");
        assert_eq!(content_type("blob"), "application/octet-stream");
    }

    #[test]
    fn test_size_limit() {
        let big = "x".repeat(4096);
        let data = zip_files(&[("index.html", "<h1>home</h1>"), ("big.bin", &big)]);
        assert!(Bundle::from_zip_limited(data.clone(), 1024).is_err());
        assert!(Bundle::from_zip_limited(data.clone(), 4096).is_err());
        assert_eq!(Bundle::from_zip_limited(data, 4096 + 13).unwrap().len(), 2);
    }

    #[test]
    fn test_clean_path() {
        assert_eq!(clean_path("/a/./b/../c"), "/a/c");
        assert_eq!(clean_path("//index.html"), "/index.html");
        assert_eq!(clean_path("/../.."), "/");
        assert_eq!(clean_path(""), "/");
    }
}
