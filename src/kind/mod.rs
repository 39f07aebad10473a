//! Queue kind declarations and catalog.
//!
//! A queue kind selects a worker pool: how many workers it may run at once
//! and whether each worker gets its own OS thread. Kinds are declared either
//! statically as types implementing [`QueueKind`], or at runtime as
//! [`KindSpec`] values loaded from TOML.

use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use std::any::TypeId;
use std::collections::HashMap;
use std::path::Path;

/// A statically declared queue kind.
///
/// ```
/// use fnqueue::kind::QueueKind;
///
/// struct Thumbnails;
///
/// impl QueueKind for Thumbnails {
///     const MAX_WORKERS: usize = 4;
/// }
///
/// assert_eq!(Thumbnails::spec().max_workers, 4);
/// ```
pub trait QueueKind: Send + Sync + 'static {
    /// Upper bound on concurrently running workers. Values below 1 are treated as 1.
    const MAX_WORKERS: usize;

    /// Run each worker on its own long-lived OS thread instead of the
    /// shared async scheduler. Useful when actions block for long periods.
    const DEDICATED_THREAD: bool = false;

    /// Named after the type with module paths stripped, generic arguments
    /// included (`Sharded<Thumbnails>`). Override to choose another name.
    fn spec() -> KindSpec {
        KindSpec::new(
            short_type_name(std::any::type_name::<Self>()),
            Self::MAX_WORKERS,
        )
        .dedicated(Self::DEDICATED_THREAD)
    }
}

/// `a::Foo<b::Bar, c::Baz>` becomes `Foo<Bar, Baz>`.
fn short_type_name(full: &str) -> String {
    fn last_segment(path: &str) -> &str {
        path.rsplit("::").next().unwrap_or(path)
    }

    let mut short = String::with_capacity(full.len());
    let mut start = 0;
    for (i, c) in full.char_indices() {
        if matches!(c, '<' | '>' | ',' | ' ' | '(' | ')' | '[' | ']' | ';' | '&') {
            short.push_str(last_segment(&full[start..i]));
            short.push(c);
            start = i + c.len_utf8();
        }
    }
    short.push_str(last_segment(&full[start..]));
    short
}

/// Runtime description of a queue kind.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct KindSpec {
    pub name: String,
    pub max_workers: usize,
    #[serde(default)]
    pub dedicated_thread: bool,
}

impl KindSpec {
    pub fn new(name: impl Into<String>, max_workers: usize) -> Self {
        Self {
            name: name.into(),
            max_workers: max_workers.max(1),
            dedicated_thread: false,
        }
    }

    pub fn dedicated(mut self, dedicated_thread: bool) -> Self {
        self.dedicated_thread = dedicated_thread;
        self
    }

    /// Reject specs that could never run work.
    pub fn validate(&self) -> Result<()> {
        if self.name.trim().is_empty() {
            return Err(Error::Config("queue kind name must not be empty".to_string()));
        }
        if self.max_workers == 0 {
            return Err(Error::Config(format!(
                "queue kind {} must allow at least one worker",
                self.name
            )));
        }
        Ok(())
    }
}

/// Map key for the pool registry.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub(crate) enum KindKey {
    Type(TypeId),
    Named(String),
}

impl KindKey {
    pub(crate) fn of<K: QueueKind>() -> Self {
        KindKey::Type(TypeId::of::<K>())
    }

    pub(crate) fn named(spec: &KindSpec) -> Self {
        KindKey::Named(spec.name.clone())
    }
}

/// Top-level TOML wrapper.
#[derive(Debug, Deserialize)]
struct KindFile {
    kind: KindSpec,
}

/// Catalog of runtime-declared queue kinds, indexed by name.
#[derive(Debug, Default)]
pub struct KindCatalog {
    kinds: HashMap<String, KindSpec>,
}

impl KindCatalog {
    /// Create an empty catalog.
    pub fn empty() -> Self {
        Self::default()
    }

    /// Load all `.toml` files from a directory and build the catalog.
    pub fn load_from_dir(dir: &Path) -> Result<Self> {
        let mut catalog = Self::empty();

        let entries = std::fs::read_dir(dir).map_err(|e| {
            Error::Config(format!("cannot read kinds dir {}: {e}", dir.display()))
        })?;

        for entry in entries {
            let path = entry?.path();
            if path.extension().is_some_and(|ext| ext == "toml") {
                let content = std::fs::read_to_string(&path)?;
                let file: KindFile = toml::from_str(&content).map_err(|e| {
                    Error::Config(format!("bad kind config {}: {e}", path.display()))
                })?;
                if catalog.get(&file.kind.name).is_some() {
                    return Err(Error::Config(format!(
                        "duplicate queue kind {} in {}",
                        file.kind.name,
                        path.display()
                    )));
                }
                catalog.insert(file.kind)?;
            }
        }

        Ok(catalog)
    }

    /// Add a kind. Names must be unique within a catalog.
    pub fn insert(&mut self, spec: KindSpec) -> Result<()> {
        spec.validate()?;
        if self.kinds.contains_key(&spec.name) {
            return Err(Error::Config(format!("duplicate queue kind {}", spec.name)));
        }
        self.kinds.insert(spec.name.clone(), spec);
        Ok(())
    }

    /// Look up a kind by name.
    pub fn get(&self, name: &str) -> Option<&KindSpec> {
        self.kinds.get(name)
    }

    /// Kinds sorted by name.
    pub fn iter(&self) -> impl Iterator<Item = &KindSpec> {
        let mut kinds: Vec<_> = self.kinds.values().collect();
        kinds.sort_by(|a, b| a.name.cmp(&b.name));
        kinds.into_iter()
    }

    pub fn len(&self) -> usize {
        self.kinds.len()
    }

    pub fn is_empty(&self) -> bool {
        self.kinds.is_empty()
    }
}
