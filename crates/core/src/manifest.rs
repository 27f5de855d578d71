//! Run integrity manifest
//!
//! Records the SHA-256 digest of every file in a run directory so that later
//! edits, deletions or additions can be detected.

use std::collections::BTreeMap;
use std::path::Path;

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tokio::fs;
use tokio::io::AsyncReadExt;
use tracing::{debug, warn};

use crate::error::{Error, Result};

pub const MANIFEST_FILE: &str = "manifest.json";

/// Digest of every file in a run directory
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RunManifest {
    pub algorithm: String,
    /// Relative path (forward slashes) to hex digest
    pub files: BTreeMap<String, String>,
    /// Digest over the sorted `path digest` lines
    pub root: String,
}

/// Outcome of checking a run directory against its manifest
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct VerifyReport {
    pub mismatched: Vec<String>,
    pub missing: Vec<String>,
    pub unexpected: Vec<String>,
    pub root_matches: bool,
}

impl VerifyReport {
    pub fn is_intact(&self) -> bool {
        self.root_matches
            && self.mismatched.is_empty()
            && self.missing.is_empty()
            && self.unexpected.is_empty()
    }
}

/// Compute SHA-256 hash of data
pub fn hash(data: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(data);
    hex::encode(hasher.finalize())
}

/// Compute SHA-256 hash of a file
pub async fn hash_file(path: impl AsRef<Path>) -> Result<String> {
    let mut file = fs::File::open(path).await?;
    let mut hasher = Sha256::new();
    let mut buffer = vec![0u8; 64 * 1024];

    loop {
        let n = file.read(&mut buffer).await?;
        if n == 0 {
            break;
        }
        hasher.update(&buffer[..n]);
    }

    Ok(hex::encode(hasher.finalize()))
}

impl RunManifest {
    /// Hash every file under `run_dir` except the manifest itself
    pub async fn compute(run_dir: &Path) -> Result<Self> {
        let mut files = BTreeMap::new();
        for (relative, path) in list_files(run_dir)? {
            files.insert(relative, hash_file(&path).await?);
        }
        let root = root_digest(&files);
        debug!("Computed manifest over {} file(s)", files.len());
        Ok(Self {
            algorithm: "sha256".to_string(),
            files,
            root,
        })
    }

    pub async fn write(&self, run_dir: &Path) -> Result<()> {
        fs::write(run_dir.join(MANIFEST_FILE), serde_json::to_vec_pretty(self)?).await?;
        Ok(())
    }

    pub async fn read(run_dir: &Path) -> Result<Self> {
        let path = run_dir.join(MANIFEST_FILE);
        if !path.exists() {
            return Err(Error::Config(format!("{} has no {}", run_dir.display(), MANIFEST_FILE)));
        }
        Ok(serde_json::from_slice(&fs::read(path).await?)?)
    }
}

fn root_digest(files: &BTreeMap<String, String>) -> String {
    let listing: String = files
        .iter()
        .map(|(path, digest)| format!("{digest}  {path}\n"))
        .collect();
    hash(listing.as_bytes())
}

fn list_files(run_dir: &Path) -> Result<Vec<(String, std::path::PathBuf)>> {
    let mut out = Vec::new();
    for entry in walkdir::WalkDir::new(run_dir).sort_by_file_name() {
        let entry = entry.map_err(|e| Error::Io(std::io::Error::new(std::io::ErrorKind::Other, e)))?;
        if !entry.file_type().is_file() {
            continue;
        }
        let relative = entry
            .path()
            .strip_prefix(run_dir)
            .map_err(|e| Error::Config(e.to_string()))?
            .components()
            .map(|c| c.as_os_str().to_string_lossy().into_owned())
            .collect::<Vec<_>>()
            .join("/");
        if relative == MANIFEST_FILE {
            continue;
        }
        out.push((relative, entry.into_path()));
    }
    Ok(out)
}

/// Recompute digests for a finished run and compare with its manifest
pub async fn verify_run(run_dir: &Path) -> Result<VerifyReport> {
    let recorded = RunManifest::read(run_dir).await?;
    let current = RunManifest::compute(run_dir).await?;

    let mut report = VerifyReport {
        root_matches: recorded.root == root_digest(&recorded.files),
        ..Default::default()
    };

    for (path, digest) in &recorded.files {
        match current.files.get(path) {
            None => report.missing.push(path.clone()),
            Some(actual) if actual != digest => report.mismatched.push(path.clone()),
            Some(_) => {}
        }
    }
    report.unexpected = current
        .files
        .keys()
        .filter(|p| !recorded.files.contains_key(*p))
        .cloned()
        .collect();

    if !report.is_intact() {
        warn!(
            "Run {} failed verification: {} changed, {} missing, {} unexpected",
            run_dir.display(),
            report.mismatched.len(),
            report.missing.len(),
            report.unexpected.len()
        );
    }
    Ok(report)
}
