//! Picture catalog loaded once at startup
//!
//! Every regular file in the catalog directory becomes one [`Picture`]: the
//! file name is the answer players must guess, the file content is split on
//! `\n` into the lines revealed during a round. Splitting keeps trailing empty
//! lines, so a file ending in a newline has a final blank line that is revealed
//! like any other.
//!
//! The catalog is immutable after loading and is shared behind an `Arc`.

use crate::error::CatalogError;
use log::{debug, info, warn};
use rand::Rng;
use std::fs;
use std::path::Path;
use std::sync::Arc;

/// A named sequence of text lines
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Picture {
    pub name: String,
    pub lines: Vec<String>,
}

impl Picture {
    pub fn new(name: impl Into<String>, lines: Vec<String>) -> Self {
        Self {
            name: name.into(),
            lines,
        }
    }

    /// Builds a picture from raw file content using plain `\n` splitting
    pub fn from_content(name: impl Into<String>, content: &str) -> Self {
        Self::new(name, content.split('\n').map(str::to_string).collect())
    }

    pub fn line_count(&self) -> usize {
        self.lines.len()
    }
}

/// All pictures available for a round, ordered by name
#[derive(Debug, Clone)]
pub struct Catalog {
    pictures: Vec<Arc<Picture>>,
}

impl Catalog {
    /// Loads every regular file in `path` as a picture
    ///
    /// Sub-directories are skipped. Fails with [`CatalogError::Io`] when the
    /// directory or a file cannot be read and with [`CatalogError::Empty`]
    /// when no pictures were found.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, CatalogError> {
        let path = path.as_ref();
        let io_err = |source: std::io::Error| CatalogError::Io {
            path: path.to_path_buf(),
            source,
        };

        let mut entries = fs::read_dir(path)
            .map_err(io_err)?
            .collect::<Result<Vec<_>, _>>()
            .map_err(io_err)?;
        entries.sort_by_key(|entry| entry.file_name());

        let mut pictures = Vec::with_capacity(entries.len());
        for entry in entries {
            let file_type = entry.file_type().map_err(io_err)?;
            if !file_type.is_file() {
                warn!("Skipping non-file catalog entry {:?}", entry.path());
                continue;
            }

            let bytes = fs::read(entry.path()).map_err(|source| CatalogError::Io {
                path: entry.path(),
                source,
            })?;
            let name = entry.file_name().to_string_lossy().into_owned();
            let picture = Picture::from_content(name, &String::from_utf8_lossy(&bytes));
            debug!(
                "Loaded picture '{}' ({} lines)",
                picture.name,
                picture.line_count()
            );
            pictures.push(picture);
        }

        let catalog = Self::from_pictures(pictures)
            .ok_or_else(|| CatalogError::Empty(path.to_path_buf()))?;
        info!("Loaded {} pictures from {:?}", catalog.len(), path);
        Ok(catalog)
    }

    /// Wraps already-built pictures; `None` if there are none
    pub fn from_pictures(pictures: Vec<Picture>) -> Option<Self> {
        if pictures.is_empty() {
            return None;
        }
        Some(Self {
            pictures: pictures.into_iter().map(Arc::new).collect(),
        })
    }

    /// Picks one picture uniformly at random
    pub fn pick<R: Rng + ?Sized>(&self, rng: &mut R) -> Arc<Picture> {
        let index = rng.gen_range(0..self.pictures.len());
        Arc::clone(&self.pictures[index])
    }

    pub fn get(&self, index: usize) -> Option<&Arc<Picture>> {
        self.pictures.get(index)
    }

    pub fn iter(&self) -> impl Iterator<Item = &Arc<Picture>> {
        self.pictures.iter()
    }

    pub fn len(&self) -> usize {
        self.pictures.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pictures.is_empty()
    }
}
