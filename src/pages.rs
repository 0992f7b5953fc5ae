//! Interstitial "please wait" pages and their static assets

use hyper::body::Bytes;
use std::path::{Component, Path, PathBuf};
use tracing::{debug, warn};

/// URL prefix under which `<pages_dir>/static/` is served
pub const ASSET_PREFIX: &str = "/thawgate/";

/// Served when the configured page can't be read
pub const FALLBACK_PAGE: &str = r#"<!DOCTYPE html>
<html>
<head>
<meta charset="utf-8">
<meta http-equiv="refresh" content="1">
<title>Starting up</title>
</head>
<body>
<p>The service is waking up. This page reloads automatically.</p>
</body>
</html>
"#;

#[derive(Debug, Clone)]
pub struct Pages {
    dir: PathBuf,
    variant: u8,
}

impl Pages {
    pub fn new(dir: impl Into<PathBuf>, variant: u8) -> Self {
        Self {
            dir: dir.into(),
            variant,
        }
    }

    pub fn page_path(&self) -> PathBuf {
        self.dir.join(format!("{}.html", self.variant))
    }

    /// The page shown while a request is blocked; read on every call so pages
    /// can be edited without a restart
    pub async fn interstitial(&self) -> Bytes {
        let path = self.page_path();
        match tokio::fs::read(&path).await {
            Ok(content) => Bytes::from(content),
            Err(e) => {
                warn!(path = %path.display(), error = %e, "Cannot read interstitial page, serving fallback");
                Bytes::from_static(FALLBACK_PAGE.as_bytes())
            }
        }
    }

    /// Look up a file below `<pages_dir>/static/`. Paths that would escape
    /// that directory resolve to nothing.
    pub async fn asset(&self, relative: &str) -> Option<(Bytes, &'static str)> {
        let relative = Path::new(relative.trim_start_matches('/'));
        if relative.as_os_str().is_empty()
            || !relative.components().all(|c| matches!(c, Component::Normal(_)))
        {
            debug!(path = %relative.display(), "Rejected asset path");
            return None;
        }

        let path = self.dir.join("static").join(relative);
        match tokio::fs::read(&path).await {
            Ok(content) => Some((Bytes::from(content), content_type(&path))),
            Err(e) => {
                debug!(path = %path.display(), error = %e, "Asset not found");
                None
            }
        }
    }
}

fn content_type(path: &Path) -> &'static str {
    match path.extension().and_then(|e| e.to_str()) {
        Some("html") | Some("htm") => "text/html; charset=utf-8",
        Some("css") => "text/css",
        Some("js") => "application/javascript",
        Some("json") => "application/json",
        Some("svg") => "image/svg+xml",
        Some("png") => "image/png",
        Some("jpg") | Some("jpeg") => "image/jpeg",
        Some("gif") => "image/gif",
        Some("ico") => "image/x-icon",
        Some("woff2") => "font/woff2",
        Some("txt") => "text/plain; charset=utf-8",
        _ => "application/octet-stream",
    }
}
