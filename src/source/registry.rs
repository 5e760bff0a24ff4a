//! Format id to source factory.

use super::framed::FramedFormat;
use super::indexed::IndexedSource;
use super::jsonl::JsonLinesFormat;
use super::types::IterableSource;
use crate::error::{PlayerError, Result};
use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Arc;

/// Builds a source for a location (a path for file formats).
pub type SourceFactory = Arc<dyn Fn(&str) -> Result<Box<dyn IterableSource>> + Send + Sync>;

/// Identifies a source to open.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SourceDescriptor {
    pub format: String,
    pub location: String,
}

impl SourceDescriptor {
    pub fn new(format: impl Into<String>, location: impl Into<String>) -> Self {
        Self {
            format: format.into(),
            location: location.into(),
        }
    }
}

/// Registry of source factories keyed by format id.
#[derive(Clone, Default)]
pub struct SourceRegistry {
    factories: BTreeMap<String, SourceFactory>,
}

impl SourceRegistry {
    /// An empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// A registry with the built-in file formats (`jsonl`, `tlog`).
    pub fn with_builtin() -> Self {
        let mut registry = Self::new();
        registry.register("jsonl", |location: &str| {
            Ok(Box::new(IndexedSource::new(location, JsonLinesFormat)) as Box<dyn IterableSource>)
        });
        registry.register("tlog", |location: &str| {
            Ok(Box::new(IndexedSource::new(location, FramedFormat)) as Box<dyn IterableSource>)
        });
        registry
    }

    /// Register (or replace) the factory for `format`.
    pub fn register<F>(&mut self, format: impl Into<String>, factory: F)
    where
        F: Fn(&str) -> Result<Box<dyn IterableSource>> + Send + Sync + 'static,
    {
        self.factories.insert(format.into(), Arc::new(factory));
    }

    pub fn formats(&self) -> impl Iterator<Item = &str> {
        self.factories.keys().map(String::as_str)
    }

    /// Build an uninitialized source for `descriptor`.
    pub fn open(&self, descriptor: &SourceDescriptor) -> Result<Box<dyn IterableSource>> {
        let factory = self
            .factories
            .get(&descriptor.format)
            .ok_or_else(|| PlayerError::UnknownFormat(descriptor.format.clone()))?;
        factory(&descriptor.location)
    }

    /// Build a source for a file, choosing the format by extension.
    pub fn open_path(&self, path: impl AsRef<Path>) -> Result<Box<dyn IterableSource>> {
        let path = path.as_ref();
        let format = path
            .extension()
            .and_then(|ext| ext.to_str())
            .ok_or_else(|| PlayerError::UnknownFormat(path.display().to_string()))?;
        self.open(&SourceDescriptor::new(
            format.to_ascii_lowercase(),
            path.to_string_lossy(),
        ))
    }
}
