// src/runtime/fetch.rs
//! Resource fetching for unit construction
//!
//! Units prefetch shared libraries through a [`ResourceFetcher`] before they
//! enter their run loop, and load job inputs named by location before
//! parsing. Fetching happens on the unit's own thread, so a blocking
//! implementation never stalls the orchestrator.

use crate::utils::errors::{EngineError, Result};
use bytes::Bytes;
use std::collections::HashMap;
use std::path::PathBuf;

/// Capability to load a resource by location
pub trait ResourceFetcher: Send + Sync {
    fn load(&self, url: &str) -> Result<Bytes>;
}

/// Ordered list of library locations, optionally relative to a base path
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LibrarySet {
    pub locations: Vec<String>,
    pub base_path: Option<String>,
}

impl LibrarySet {
    pub fn new<I, S>(locations: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            locations: locations.into_iter().map(Into::into).collect(),
            base_path: None,
        }
    }

    pub fn with_base_path(mut self, base_path: impl Into<String>) -> Self {
        self.base_path = Some(base_path.into());
        self
    }

    /// Locations with the base path applied, in listed order
    pub fn resolved_locations(&self) -> Vec<String> {
        self.locations
            .iter()
            .map(|location| match &self.base_path {
                Some(base) => format!("{}{}", base, location),
                None => location.clone(),
            })
            .collect()
    }
}

/// Reads resources from the local filesystem
#[derive(Debug, Clone, Default)]
pub struct FileFetcher {
    root: Option<PathBuf>,
}

impl FileFetcher {
    pub fn new() -> Self {
        Self::default()
    }

    /// Resolve relative locations against `root`
    pub fn with_root(root: impl Into<PathBuf>) -> Self {
        Self {
            root: Some(root.into()),
        }
    }
}

impl ResourceFetcher for FileFetcher {
    fn load(&self, url: &str) -> Result<Bytes> {
        let path = match &self.root {
            Some(root) => root.join(url),
            None => PathBuf::from(url),
        };

        std::fs::read(&path)
            .map(Bytes::from)
            .map_err(|e| EngineError::FetchFailed {
                url: url.to_string(),
                reason: e.to_string(),
            })
    }
}

/// In-memory resources, for embedded libraries and tests
#[derive(Debug, Clone, Default)]
pub struct StaticFetcher {
    entries: HashMap<String, Bytes>,
}

impl StaticFetcher {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_entry(mut self, url: impl Into<String>, content: impl Into<Bytes>) -> Self {
        self.entries.insert(url.into(), content.into());
        self
    }
}

impl ResourceFetcher for StaticFetcher {
    fn load(&self, url: &str) -> Result<Bytes> {
        self.entries
            .get(url)
            .cloned()
            .ok_or_else(|| EngineError::FetchFailed {
                url: url.to_string(),
                reason: "no such resource".to_string(),
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_resolved_locations_apply_base_path() {
        let set = LibrarySet::new(["a.js", "b.js"]).with_base_path("/static/libs/");
        assert_eq!(
            set.resolved_locations(),
            vec!["/static/libs/a.js", "/static/libs/b.js"]
        );

        let bare = LibrarySet::new(["a.js"]);
        assert_eq!(bare.resolved_locations(), vec!["a.js"]);
    }

    #[test]
    fn test_static_fetcher() {
        let fetcher = StaticFetcher::new().with_entry("lib.js", "content");
        assert_eq!(fetcher.load("lib.js").unwrap(), Bytes::from("content"));
        assert!(matches!(
            fetcher.load("other.js"),
            Err(EngineError::FetchFailed { .. })
        ));
    }

    #[test]
    fn test_file_fetcher_reads_relative_to_root() {
        let dir = tempfile::tempdir().unwrap();
        let mut file = std::fs::File::create(dir.path().join("decoder.js")).unwrap();
        file.write_all(b"decoder").unwrap();

        let fetcher = FileFetcher::with_root(dir.path());
        assert_eq!(fetcher.load("decoder.js").unwrap(), Bytes::from("decoder"));

        let err = fetcher.load("absent.js").unwrap_err();
        assert!(err.to_string().contains("absent.js"));
    }
}
