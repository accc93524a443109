//! Output artifacts on disk and the index used to find them by bare filename.
//!
//! Layout under the output root:
//!
//! ```text
//! final_outputs/      generation
//! upscaled_outputs/   upscale
//! scheduler_outputs/  scheduler comparison
//! ```
//!
//! A bare filename is resolved against the index in [`ArtifactCategory::PRECEDENCE`]
//! order, so a name present in two roots always resolves to the same one.

use std::collections::BTreeMap;
use std::fs::{self, File, OpenOptions};
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};
use std::sync::{PoisonError, RwLock};

use chrono::{DateTime, Utc};
use image::DynamicImage;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::util::{encode_png, sanitize_fragment};
use crate::{EaselError, Result};

const INDEXED_EXTENSIONS: [&str; 3] = ["png", "jpg", "jpeg"];
const MAX_NAME_ATTEMPTS: usize = 8;

/// Declaration order is lookup precedence.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ArtifactCategory {
    Generation,
    Upscale,
    SchedulerComparison,
}

impl ArtifactCategory {
    pub const PRECEDENCE: [ArtifactCategory; 3] = [
        ArtifactCategory::Generation,
        ArtifactCategory::Upscale,
        ArtifactCategory::SchedulerComparison,
    ];

    pub fn dir_name(self) -> &'static str {
        match self {
            ArtifactCategory::Generation => "final_outputs",
            ArtifactCategory::Upscale => "upscaled_outputs",
            ArtifactCategory::SchedulerComparison => "scheduler_outputs",
        }
    }
}

/// A stored image. Never mutated once created.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Artifact {
    pub filename: String,
    pub path: PathBuf,
    pub category: ArtifactCategory,
    pub created_at: DateTime<Utc>,
    pub size_bytes: u64,
    /// Short description of the request that produced it; absent for files
    /// found on disk at start-up.
    pub source: Option<String>,
}

type Index = BTreeMap<ArtifactCategory, BTreeMap<String, Artifact>>;

pub struct ArtifactStore {
    root: PathBuf,
    index: RwLock<Index>,
}

impl ArtifactStore {
    /// Creates the category directories if needed and indexes what they hold.
    pub fn open(root: impl Into<PathBuf>) -> Result<Self> {
        let root = root.into();
        for category in ArtifactCategory::PRECEDENCE {
            fs::create_dir_all(root.join(category.dir_name()))?;
        }
        let index = Self::scan(&root)?;
        let count: usize = index.values().map(BTreeMap::len).sum();
        info!(root = %root.display(), artifacts = count, "opened artifact store");
        Ok(Self {
            root,
            index: RwLock::new(index),
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn category_dir(&self, category: ArtifactCategory) -> PathBuf {
        self.root.join(category.dir_name())
    }

    /// Rebuilds the index from disk, picking up files written by other tools.
    pub fn refresh(&self) -> Result<()> {
        let index = Self::scan(&self.root)?;
        *self.index.write().unwrap_or_else(PoisonError::into_inner) = index;
        Ok(())
    }

    fn scan(root: &Path) -> Result<Index> {
        let mut index = Index::new();
        for category in ArtifactCategory::PRECEDENCE {
            let entries = index.entry(category).or_default();
            let dir = root.join(category.dir_name());
            let listing = match fs::read_dir(&dir) {
                Ok(listing) => listing,
                Err(e) if e.kind() == ErrorKind::NotFound => continue,
                Err(e) => return Err(e.into()),
            };
            for entry in listing {
                let path = entry?.path();
                let indexed = path
                    .extension()
                    .and_then(|e| e.to_str())
                    .is_some_and(|e| INDEXED_EXTENSIONS.contains(&e.to_ascii_lowercase().as_str()));
                if !indexed || !path.is_file() {
                    continue;
                }
                let Some(filename) = path.file_name().and_then(|n| n.to_str()).map(String::from)
                else {
                    continue;
                };
                let artifact = Self::describe(path, filename.clone(), category, None)?;
                entries.insert(filename, artifact);
            }
        }
        Ok(index)
    }

    fn describe(
        path: PathBuf,
        filename: String,
        category: ArtifactCategory,
        source: Option<String>,
    ) -> Result<Artifact> {
        let metadata = fs::metadata(&path)?;
        let created_at = metadata
            .created()
            .or_else(|_| metadata.modified())
            .map(DateTime::<Utc>::from)
            .unwrap_or_else(|_| Utc::now());
        Ok(Artifact {
            filename,
            path,
            category,
            created_at,
            size_bytes: metadata.len(),
            source,
        })
    }

    fn insert(&self, artifact: Artifact) {
        self.index
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .entry(artifact.category)
            .or_default()
            .insert(artifact.filename.clone(), artifact);
    }

    /// Writes `image` as `{descriptor}_{suffix}.png`. The suffix is random and
    /// the file is created exclusively, so concurrent writers with the same
    /// descriptor never overwrite each other.
    pub fn store(
        &self,
        image: &DynamicImage,
        category: ArtifactCategory,
        descriptor: &str,
        source: Option<String>,
    ) -> Result<Artifact> {
        let bytes = encode_png(image).map_err(EaselError::generation)?;
        let mut descriptor = sanitize_fragment(descriptor, 80);
        if descriptor.is_empty() {
            descriptor = "image".to_string();
        }
        let dir = self.category_dir(category);

        for _ in 0..MAX_NAME_ATTEMPTS {
            let suffix = Uuid::new_v4().simple().to_string();
            let filename = format!("{descriptor}_{}.png", &suffix[..12]);
            let path = dir.join(&filename);
            let file = match OpenOptions::new().write(true).create_new(true).open(&path) {
                Ok(file) => file,
                Err(e) if e.kind() == ErrorKind::AlreadyExists => continue,
                Err(e) => return Err(e.into()),
            };
            write_fresh(&path, file, &bytes)?;

            let artifact = Self::describe(path, filename, category, source)?;
            debug!(filename = %artifact.filename, ?category, bytes = artifact.size_bytes, "stored artifact");
            self.insert(artifact.clone());
            return Ok(artifact);
        }
        Err(EaselError::Io(std::io::Error::new(
            ErrorKind::AlreadyExists,
            format!("no free filename for '{descriptor}' after {MAX_NAME_ATTEMPTS} attempts"),
        )))
    }

    /// Writes `image` under exactly `filename`, replacing a previous file of
    /// that name. Used for deterministic names.
    pub fn store_named(
        &self,
        image: &DynamicImage,
        category: ArtifactCategory,
        filename: &str,
        source: Option<String>,
    ) -> Result<Artifact> {
        if !is_bare_name(filename) {
            return Err(EaselError::Validation(format!(
                "'{filename}' is not a bare filename"
            )));
        }
        let bytes = encode_png(image).map_err(EaselError::generation)?;
        let path = self.category_dir(category).join(filename);
        // Rename over the target so a concurrent reader sees the old or the new file.
        let staging = path.with_extension(format!("{}.part", Uuid::new_v4().simple()));
        fs::write(&staging, &bytes)?;
        if let Err(e) = fs::rename(&staging, &path) {
            let _ = fs::remove_file(&staging);
            return Err(e.into());
        }

        let artifact = Self::describe(path, filename.to_string(), category, source)?;
        debug!(filename = %artifact.filename, ?category, bytes = artifact.size_bytes, "stored named artifact");
        self.insert(artifact.clone());
        Ok(artifact)
    }

    /// Finds a bare filename in any category, by precedence.
    pub fn resolve(&self, filename: &str) -> Result<Artifact> {
        if !is_bare_name(filename) {
            return Err(EaselError::FileNotFound(filename.to_string()));
        }
        let index = self.index.read().unwrap_or_else(PoisonError::into_inner);
        ArtifactCategory::PRECEDENCE
            .iter()
            .find_map(|category| index.get(category)?.get(filename))
            .cloned()
            .ok_or_else(|| EaselError::FileNotFound(filename.to_string()))
    }

    /// Every artifact: by category precedence, then newest first, then name.
    pub fn list(&self) -> Vec<Artifact> {
        let index = self.index.read().unwrap_or_else(PoisonError::into_inner);
        let mut artifacts = Vec::new();
        for entries in index.values() {
            let start = artifacts.len();
            artifacts.extend(entries.values().cloned());
            artifacts[start..].sort_by(|a: &Artifact, b: &Artifact| {
                b.created_at
                    .cmp(&a.created_at)
                    .then_with(|| a.filename.cmp(&b.filename))
            });
        }
        artifacts
    }

    /// Resolves a filename and reads its bytes.
    pub fn read(&self, filename: &str) -> Result<(Artifact, Vec<u8>)> {
        let artifact = self.resolve(filename)?;
        match fs::read(&artifact.path) {
            Ok(bytes) => Ok((artifact, bytes)),
            Err(e) if e.kind() == ErrorKind::NotFound => {
                Err(EaselError::FileNotFound(filename.to_string()))
            }
            Err(e) => Err(e.into()),
        }
    }
}

/// Fills a file this call just created; on failure the partial file is
/// removed so a later scan never indexes it.
fn write_fresh(path: &Path, mut file: File, bytes: &[u8]) -> Result<()> {
    let written = file.write_all(bytes).and_then(|()| file.sync_all());
    if let Err(e) = written {
        drop(file);
        if let Err(cleanup) = fs::remove_file(path) {
            warn!(path = %path.display(), error = %cleanup, "could not remove partial artifact");
        }
        return Err(e.into());
    }
    Ok(())
}

pub(crate) fn is_bare_name(name: &str) -> bool {
    !name.is_empty() && !name.contains(['/', '\\']) && !name.contains("..")
}
