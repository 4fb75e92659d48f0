//! Enrolled identities and access to their stored photos.

use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::path::{Component, Path, PathBuf};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum GalleryError {
    #[error("enrollment photo not found: {0}")]
    NotFound(String),
    #[error("invalid photo reference: {0}")]
    InvalidReference(String),
    #[error("reading {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("gallery manifest: {0}")]
    Manifest(#[from] toml::de::Error),
}

/// One enrolled identity, as owned by the user-management collaborator.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EnrollmentRecord {
    pub identity_id: String,
    /// Reference to the enrollment photo, resolved by a [`PhotoStore`].
    pub photo: String,
}

impl EnrollmentRecord {
    pub fn new(identity_id: impl Into<String>, photo: impl Into<String>) -> Self {
        Self {
            identity_id: identity_id.into(),
            photo: photo.into(),
        }
    }
}

/// Candidate identities for one authentication attempt.
///
/// Records without a photo reference never reach the matcher, and each
/// identity appears at most once.
#[derive(Debug, Clone, Default)]
pub struct Gallery {
    records: Vec<EnrollmentRecord>,
}

#[derive(Debug, Deserialize)]
struct Manifest {
    #[serde(default)]
    enrollment: Vec<EnrollmentRecord>,
}

impl Gallery {
    /// Build a gallery, keeping the first record for each identity.
    pub fn from_records(records: impl IntoIterator<Item = EnrollmentRecord>) -> Self {
        let mut seen = HashSet::new();
        let mut kept = Vec::new();
        for record in records {
            if record.photo.trim().is_empty() {
                continue;
            }
            if !seen.insert(record.identity_id.clone()) {
                tracing::warn!(
                    identity = %record.identity_id,
                    photo = %record.photo,
                    "duplicate enrollment ignored"
                );
                continue;
            }
            kept.push(record);
        }
        Self { records: kept }
    }

    /// Parse a TOML manifest of `[[enrollment]]` tables.
    pub fn from_toml(src: &str) -> Result<Self, GalleryError> {
        let manifest: Manifest = toml::from_str(src)?;
        Ok(Self::from_records(manifest.enrollment))
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &EnrollmentRecord> {
        self.records.iter()
    }
}

/// Loads encoded enrollment photos by reference.
pub trait PhotoStore {
    fn load(&self, reference: &str) -> Result<Vec<u8>, GalleryError>;
}

/// Photos stored under a media root directory.
///
/// References are relative paths; absolute paths and `..` components are
/// refused so a reference cannot escape the root.
#[derive(Debug, Clone)]
pub struct FsPhotoStore {
    root: PathBuf,
}

impl FsPhotoStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn resolve(&self, reference: &str) -> Result<PathBuf, GalleryError> {
        let rel = Path::new(reference);
        let safe = rel
            .components()
            .all(|c| matches!(c, Component::Normal(_) | Component::CurDir));
        if reference.is_empty() || !safe {
            return Err(GalleryError::InvalidReference(reference.to_string()));
        }
        Ok(self.root.join(rel))
    }
}

impl PhotoStore for FsPhotoStore {
    fn load(&self, reference: &str) -> Result<Vec<u8>, GalleryError> {
        let path = self.resolve(reference)?;
        std::fs::read(&path).map_err(|source| {
            if source.kind() == std::io::ErrorKind::NotFound {
                GalleryError::NotFound(reference.to_string())
            } else {
                GalleryError::Io { path, source }
            }
        })
    }
}

/// In-memory photo store.
#[derive(Debug, Clone, Default)]
pub struct MemoryPhotoStore {
    photos: HashMap<String, Vec<u8>>,
}

impl MemoryPhotoStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, reference: impl Into<String>, bytes: Vec<u8>) {
        self.photos.insert(reference.into(), bytes);
    }

    pub fn with_photo(mut self, reference: impl Into<String>, bytes: Vec<u8>) -> Self {
        self.insert(reference, bytes);
        self
    }
}

impl PhotoStore for MemoryPhotoStore {
    fn load(&self, reference: &str) -> Result<Vec<u8>, GalleryError> {
        self.photos
            .get(reference)
            .cloned()
            .ok_or_else(|| GalleryError::NotFound(reference.to_string()))
    }
}
