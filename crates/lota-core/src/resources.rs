//! Static dashboard resources.
//!
//! The dashboard is a closed set of files. [`Asset`] names each one together
//! with the request path that serves it and its content type; a
//! [`ResourceStore`] supplies the bytes.

use std::borrow::Cow;
use std::collections::HashMap;

/// A dashboard file the relay knows how to serve.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Asset {
    Index,
    Script,
    Style,
    Favicon,
    /// Document sent with 404 responses. Not addressable by path.
    ErrorPage,
}

impl Asset {
    /// Assets served directly by request path.
    pub const ROUTABLE: [Asset; 4] = [Asset::Index, Asset::Script, Asset::Style, Asset::Favicon];

    /// File name inside the resource store.
    pub fn file_name(self) -> &'static str {
        match self {
            Asset::Index => "index.html",
            Asset::Script => "script.js",
            Asset::Style => "style.css",
            Asset::Favicon => "favicon.ico",
            Asset::ErrorPage => "error.html",
        }
    }

    /// Request path serving this asset.
    pub fn request_path(self) -> Option<&'static str> {
        match self {
            Asset::Index => Some("/"),
            Asset::Script => Some("/script.js"),
            Asset::Style => Some("/style.css"),
            Asset::Favicon => Some("/favicon.ico"),
            Asset::ErrorPage => None,
        }
    }

    pub fn content_type(self) -> &'static str {
        content_type_for(self.file_name())
    }

    /// Look up the asset served at `path`. Matching is exact and case-sensitive.
    pub fn from_request_path(path: &str) -> Option<Asset> {
        Self::ROUTABLE
            .into_iter()
            .find(|asset| asset.request_path() == Some(path))
    }
}

/// Content type for a file name, by extension.
pub fn content_type_for(name: &str) -> &'static str {
    match name.rsplit_once('.').map(|(_, ext)| ext) {
        Some("html") | Some("htm") => "text/html",
        Some("js") => "text/javascript",
        Some("css") => "text/css",
        Some("ico") => "image/x-icon",
        Some("png") => "image/png",
        Some("svg") => "image/svg+xml",
        Some("json") => "application/json",
        _ => "application/octet-stream",
    }
}

/// Bytes of a stored file plus the content type to serve them with.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Resource {
    pub content_type: &'static str,
    pub body: Cow<'static, [u8]>,
}

impl Resource {
    pub fn len(&self) -> usize {
        self.body.len()
    }

    pub fn is_empty(&self) -> bool {
        self.body.is_empty()
    }
}

/// Read-only source of dashboard files.
pub trait ResourceStore: Send + Sync {
    /// Fetch a file by name.
    fn get(&self, name: &str) -> Option<Resource>;

    /// Fetch a known asset.
    fn asset(&self, asset: Asset) -> Option<Resource> {
        self.get(asset.file_name())
    }
}

/// In-memory resource store.
#[derive(Debug, Default, Clone)]
pub struct MemoryResources {
    files: HashMap<String, Vec<u8>>,
}

impl MemoryResources {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a file, replacing any previous content under the same name.
    pub fn insert(&mut self, name: impl Into<String>, body: impl Into<Vec<u8>>) {
        self.files.insert(name.into(), body.into());
    }

    /// Builder-style [`insert`](Self::insert).
    pub fn with(mut self, name: impl Into<String>, body: impl Into<Vec<u8>>) -> Self {
        self.insert(name, body);
        self
    }
}

impl ResourceStore for MemoryResources {
    fn get(&self, name: &str) -> Option<Resource> {
        self.files.get(name).map(|body| Resource {
            content_type: content_type_for(name),
            body: Cow::Owned(body.clone()),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_asset_paths() {
        assert_eq!(Asset::from_request_path("/"), Some(Asset::Index));
        assert_eq!(Asset::from_request_path("/script.js"), Some(Asset::Script));
        assert_eq!(Asset::from_request_path("/style.css"), Some(Asset::Style));
        assert_eq!(Asset::from_request_path("/favicon.ico"), Some(Asset::Favicon));
        assert_eq!(Asset::from_request_path("/error.html"), None);
        assert_eq!(Asset::from_request_path("/Script.js"), None);
        assert_eq!(Asset::from_request_path("/unknown"), None);
    }

    #[test]
    fn test_content_types() {
        assert_eq!(Asset::Index.content_type(), "text/html");
        assert_eq!(Asset::Script.content_type(), "text/javascript");
        assert_eq!(Asset::Style.content_type(), "text/css");
        assert_eq!(Asset::Favicon.content_type(), "image/x-icon");
        assert_eq!(Asset::ErrorPage.content_type(), "text/html");
        assert_eq!(content_type_for("blob"), "application/octet-stream");
    }

    #[test]
    fn test_memory_store() {
        let store = MemoryResources::new().with("index.html", "<h1>hi</h1>");

        let index = store.asset(Asset::Index).unwrap();
        assert_eq!(index.content_type, "text/html");
        assert_eq!(&index.body[..], b"<h1>hi</h1>");
        assert!(store.asset(Asset::Script).is_none());
    }
}
