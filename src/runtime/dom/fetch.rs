//! Resource lookup for `fetch`, `<script>`, `<link>` and `importScripts`
//!
//! Nothing here touches the network. A small set of fake origins maps onto
//! the dist directory; every other URL is a 404.

use std::path::{Path, PathBuf};

use crate::resolver::{TEST_CASES_ORIGIN, TEST_CASES_PATH_ORIGIN};

/// Origins served from the dist directory, most specific first
pub(crate) const KNOWN_ORIGINS: &[&str] = &[TEST_CASES_PATH_ORIGIN, TEST_CASES_ORIGIN, "https://example.com/public/path/"];

/// Address of the page every web runner pretends to be
pub(crate) const PAGE_URL: &str = "https://test.cases/path/index.html";

/// Dist-relative path of a fake-origin URL, without query or fragment
pub(crate) fn dist_relative(url: &str) -> Option<String> {
    let rest = KNOWN_ORIGINS.iter().find_map(|origin| url.strip_prefix(origin))?;
    let rest = rest.split(['?', '#']).next().unwrap_or_default();
    Some(percent_decode(rest))
}

fn percent_decode(s: &str) -> String {
    let bytes = s.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] == b'%'
            && i + 2 < bytes.len()
            && let Some(byte) = std::str::from_utf8(&bytes[i + 1..i + 3]).ok().and_then(|h| u8::from_str_radix(h, 16).ok())
        {
            out.push(byte);
            i += 3;
            continue;
        }
        out.push(bytes[i]);
        i += 1;
    }
    String::from_utf8_lossy(&out).into_owned()
}

/// File a URL refers to: fake origins map into `dist`, `file://` URLs map
/// to their path
pub(crate) fn resolve_path(dist: &Path, url: &str) -> Option<PathBuf> {
    if let Some(relative) = dist_relative(url) {
        return Some(dist.join(relative));
    }
    let parsed = url::Url::parse(url).ok()?;
    if parsed.scheme() == "file" {
        return parsed.to_file_path().ok();
    }
    None
}

/// Fake-origin URL a dist file would be served from
pub(crate) fn fake_url(dist: &Path, path: &Path) -> String {
    match path.strip_prefix(dist) {
        Ok(relative) => {
            let relative = relative
                .components()
                .map(|c| c.as_os_str().to_string_lossy().into_owned())
                .collect::<Vec<_>>()
                .join("/");
            format!("{TEST_CASES_PATH_ORIGIN}{relative}")
        }
        Err(_) => crate::runtime::esm::file_url(path),
    }
}

/// What `fetch` resolves with
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct FetchResponse {
    pub(crate) status: u16,
    pub(crate) status_text: &'static str,
    pub(crate) body: String,
    pub(crate) content_type: &'static str,
}

impl FetchResponse {
    fn not_found() -> Self {
        Self {
            status: 404,
            status_text: "Not Found",
            body: String::new(),
            content_type: "text/plain",
        }
    }

    pub(crate) fn to_json(&self) -> serde_json::Value {
        serde_json::json!({
            "status": self.status,
            "statusText": self.status_text,
            "body": self.body,
            "contentType": self.content_type,
        })
    }
}

fn content_type(path: &Path) -> &'static str {
    match path.extension().and_then(|e| e.to_str()) {
        Some("js" | "mjs" | "cjs") => "application/javascript",
        Some("json") => "application/json",
        Some("css") => "text/css",
        Some("html") => "text/html",
        Some("wasm") => "application/wasm",
        Some("svg") => "image/svg+xml",
        _ => "text/plain",
    }
}

/// Read a resource; missing files and unknown origins are 404s
pub(crate) fn fetch(dist: &Path, url: &str) -> FetchResponse {
    let Some(path) = resolve_path(dist, url) else {
        tracing::debug!(url = %url, "fetch outside known origins");
        return FetchResponse::not_found();
    };
    match std::fs::read(&path) {
        Ok(bytes) => FetchResponse {
            status: 200,
            status_text: "OK",
            body: String::from_utf8_lossy(&bytes).into_owned(),
            content_type: content_type(&path),
        },
        Err(e) => {
            tracing::debug!(path = %path.display(), error = %e, "fetch miss");
            FetchResponse::not_found()
        }
    }
}

/// Read a resource as text, `None` when it does not exist
pub(crate) fn read_text(dist: &Path, url: &str) -> Option<String> {
    let response = fetch(dist, url);
    (response.status == 200).then_some(response.body)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_known_origins_map_to_dist() {
        assert_eq!(dist_relative("https://test.cases/path/a/b.js?x=1").as_deref(), Some("a/b.js"));
        assert_eq!(dist_relative("https://test.cases/main.css").as_deref(), Some("main.css"));
        assert_eq!(dist_relative("https://example.com/public/path/x%20y.json").as_deref(), Some("x y.json"));
        assert_eq!(dist_relative("https://elsewhere.dev/a.js"), None);
    }

    #[test]
    fn test_fetch_reads_files_and_404s() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("data.json"), "{\"ok\":true}").unwrap();
        let hit = fetch(dir.path(), "https://test.cases/path/data.json");
        assert_eq!(hit.status, 200);
        assert_eq!(hit.content_type, "application/json");
        assert_eq!(hit.body, "{\"ok\":true}");
        assert_eq!(fetch(dir.path(), "https://test.cases/path/missing.json").status, 404);
        assert_eq!(fetch(dir.path(), "https://other.example/data.json").status, 404);
    }

    #[test]
    fn test_fake_url_of_dist_file() {
        let dist = Path::new("/tmp/dist");
        assert_eq!(fake_url(dist, Path::new("/tmp/dist/chunks/a.js")), "https://test.cases/path/chunks/a.js");
    }
}
