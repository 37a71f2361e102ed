//! Project identity: the stable name that groups one directory's containers.

use sha2::{Digest, Sha256};
use std::fmt;
use std::path::{Path, PathBuf};

use crate::errors::{Result, StackError};

const HASH_PREFIX_LEN: usize = 6;

/// Filesystem-derived project name, e.g. `analytics_3f9a1c`.
///
/// The same directory always yields the same identity; two directories with
/// the same basename differ in the hash suffix.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ProjectIdentity {
    name: String,
    dir: PathBuf,
}

impl ProjectIdentity {
    /// Derive the identity for `dir`, using `configured_name` as the readable
    /// part when set.
    pub fn derive(dir: &Path, configured_name: Option<&str>) -> Result<Self> {
        let dir = dir
            .canonicalize()
            .map_err(StackError::io(format!("error retrieving working directory {}", dir.display())))?;

        let base = configured_name
            .map(str::to_string)
            .or_else(|| dir.file_name().map(|n| n.to_string_lossy().to_string()))
            .unwrap_or_default();
        let mut readable: String = base
            .to_lowercase()
            .chars()
            .filter(|c| c.is_ascii_lowercase() || c.is_ascii_digit())
            .collect();
        if readable.is_empty() {
            readable = "project".to_string();
        }

        let digest = Sha256::digest(dir.to_string_lossy().as_bytes());
        let hash = format!("{:x}", digest);

        Ok(Self {
            name: format!("{}_{}", readable, &hash[..HASH_PREFIX_LEN]),
            dir,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Canonical project directory.
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Repository of the runtime image built for this project.
    pub fn image_repository(&self) -> String {
        format!("{}/airflow", self.name)
    }
}

impl fmt::Display for ProjectIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.name)
    }
}
