//! Payload catalog and dummy payload generation.

use rand::RngCore;
use serde::{Deserialize, Serialize};
use std::fs::File;
use std::io::{self, BufWriter, Write};
use std::path::{Path, PathBuf};
use tracing::{info, warn};

const MIB: u64 = 1024 * 1024;

/// Larger payloads are created sparse instead of random-filled
const RANDOM_FILL_LIMIT: u64 = 10 * MIB;

/// One payload: a local file of a nominal size
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PayloadSpec {
    pub key: String,
    pub file: String,
    pub size_mb: u64,
}

impl PayloadSpec {
    pub fn new(key: &str, file: &str, size_mb: u64) -> Self {
        Self {
            key: key.to_string(),
            file: file.to_string(),
            size_mb,
        }
    }

    pub fn size_bytes(&self) -> u64 {
        self.size_mb * MIB
    }
}

/// Ordered payload key -> file mapping.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PayloadCatalog {
    entries: Vec<PayloadSpec>,
}

impl Default for PayloadCatalog {
    fn default() -> Self {
        Self {
            entries: vec![
                PayloadSpec::new("10MB", "10m.jpg", 10),
                PayloadSpec::new("50MB", "50m.mp4", 50),
                PayloadSpec::new("100MB", "100m.mp4", 100),
            ],
        }
    }
}

impl From<Vec<PayloadSpec>> for PayloadCatalog {
    fn from(entries: Vec<PayloadSpec>) -> Self {
        Self { entries }
    }
}

impl PayloadCatalog {
    pub fn get(&self, key: &str) -> Option<&PayloadSpec> {
        self.entries.iter().find(|entry| entry.key == key)
    }

    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.entries.iter().map(|entry| entry.key.as_str())
    }

    pub fn iter(&self) -> impl Iterator<Item = &PayloadSpec> {
        self.entries.iter()
    }

    /// Create missing payload files under `dir`.
    ///
    /// Files up to 10 MiB are filled with random bytes; larger ones are
    /// zero-filled sparse files of the nominal size.
    ///
    /// Returns the paths that were created.
    pub fn ensure_files(&self, dir: &Path) -> io::Result<Vec<PathBuf>> {
        let mut created = Vec::new();
        for entry in &self.entries {
            let path = dir.join(&entry.file);
            if path.exists() {
                continue;
            }
            warn!(
                path = %path.display(),
                size_mb = entry.size_mb,
                "Payload missing, creating dummy file"
            );
            let len = entry.size_bytes();
            if len > RANDOM_FILL_LIMIT {
                File::create(&path)?.set_len(len)?;
            } else {
                write_random(&path, len)?;
            }
            created.push(path);
        }
        if !created.is_empty() {
            info!(count = created.len(), "Dummy payloads created");
        }
        Ok(created)
    }
}

fn write_random(path: &Path, len: u64) -> io::Result<()> {
    let mut writer = BufWriter::new(File::create(path)?);
    let mut rng = rand::thread_rng();
    let mut block = vec![0u8; MIB as usize];
    let mut remaining = len;
    while remaining > 0 {
        let n = remaining.min(MIB) as usize;
        rng.fill_bytes(&mut block[..n]);
        writer.write_all(&block[..n])?;
        remaining -= n as u64;
    }
    writer.flush()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_catalog_order() {
        let catalog = PayloadCatalog::default();
        assert_eq!(catalog.keys().collect::<Vec<_>>(), vec!["10MB", "50MB", "100MB"]);
        assert_eq!(catalog.get("50MB").unwrap().file, "50m.mp4");
        assert!(catalog.get("1GB").is_none());
    }

    #[test]
    fn test_ensure_files_creates_only_missing() {
        let dir = tempfile::tempdir().unwrap();
        let catalog = PayloadCatalog::from(vec![
            PayloadSpec::new("1MB", "one.bin", 1),
            PayloadSpec::new("2MB", "two.bin", 2),
        ]);
        std::fs::write(dir.path().join("one.bin"), b"keep").unwrap();

        let created = catalog.ensure_files(dir.path()).unwrap();
        assert_eq!(created, vec![dir.path().join("two.bin")]);
        assert_eq!(std::fs::read(dir.path().join("one.bin")).unwrap(), b"keep");
        assert_eq!(
            std::fs::metadata(dir.path().join("two.bin")).unwrap().len(),
            2 * 1024 * 1024
        );

        assert!(catalog.ensure_files(dir.path()).unwrap().is_empty());
    }

    #[test]
    fn test_catalog_from_toml_list() {
        #[derive(Deserialize)]
        struct Wrapper {
            payloads: PayloadCatalog,
        }
        let wrapper: Wrapper = toml::from_str(
            r#"
            payloads = [
                { key = "tiny", file = "tiny.bin", size_mb = 1 },
            ]
            "#,
        )
        .unwrap();
        assert_eq!(wrapper.payloads.get("tiny").unwrap().size_bytes(), 1024 * 1024);
    }
}
