use std::fs::{self, File};
use std::io::Write;
use std::path::Path;

use anyhow::{Context, Result};
use serde::de::DeserializeOwned;
use serde::Serialize;

/// Write bytes atomically: temp file in the same directory, fsync, rename.
/// A crash mid-write leaves either the old file or the new one, never a
/// torn mix.
pub fn write_atomic(path: &Path, bytes: &[u8]) -> Result<()> {
    let dir = path.parent().context("path has no parent directory")?;
    fs::create_dir_all(dir)
        .with_context(|| format!("Failed to create directory {:?}", dir))?;

    let tmp = dir.join(format!(
        ".{}.tmp",
        path.file_name().and_then(|n| n.to_str()).unwrap_or("state")
    ));

    {
        let mut file = File::create(&tmp)
            .with_context(|| format!("Failed to create temp file {:?}", tmp))?;
        file.write_all(bytes)?;
        file.sync_all()?;
    }

    fs::rename(&tmp, path)
        .with_context(|| format!("Failed to rename {:?} into place", tmp))?;
    Ok(())
}

pub fn save_json<T: Serialize>(path: &Path, value: &T) -> Result<()> {
    let bytes = serde_json::to_vec_pretty(value).context("Failed to serialize state")?;
    write_atomic(path, &bytes)
}

pub fn load_json<T: DeserializeOwned>(path: &Path) -> Result<Option<T>> {
    if !path.exists() {
        return Ok(None);
    }
    let bytes = fs::read(path).with_context(|| format!("Failed to read {:?}", path))?;
    let value = serde_json::from_slice(&bytes)
        .with_context(|| format!("Corrupt state file {:?}", path))?;
    Ok(Some(value))
}

pub fn save_bincode<T: Serialize>(path: &Path, value: &T) -> Result<()> {
    let bytes = bincode::serialize(value).context("Failed to serialize state")?;
    write_atomic(path, &bytes)
}

pub fn load_bincode<T: DeserializeOwned>(path: &Path) -> Result<Option<T>> {
    if !path.exists() {
        return Ok(None);
    }
    let bytes = fs::read(path).with_context(|| format!("Failed to read {:?}", path))?;
    let value = bincode::deserialize(&bytes)
        .with_context(|| format!("Corrupt state file {:?}", path))?;
    Ok(Some(value))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;

    #[derive(Debug, PartialEq, Serialize, Deserialize)]
    struct Sample {
        term: u64,
        voted_for: Option<u64>,
    }

    #[test]
    fn test_json_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("raft").join("state.json");

        let state = Sample { term: 5, voted_for: Some(2) };
        save_json(&path, &state).unwrap();

        let loaded: Sample = load_json(&path).unwrap().unwrap();
        assert_eq!(loaded, state);
    }

    #[test]
    fn test_load_missing_returns_none() {
        let dir = tempfile::tempdir().unwrap();
        let loaded: Option<Sample> = load_json(&dir.path().join("absent.json")).unwrap();
        assert!(loaded.is_none());
    }

    #[test]
    fn test_overwrite_is_atomic_replacement() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("state.json");

        save_json(&path, &Sample { term: 1, voted_for: None }).unwrap();
        save_json(&path, &Sample { term: 2, voted_for: Some(9) }).unwrap();

        let loaded: Sample = load_json(&path).unwrap().unwrap();
        assert_eq!(loaded.term, 2);
        // No stray temp files left behind
        let names: Vec<_> = fs::read_dir(dir.path())
            .unwrap()
            .map(|e| e.unwrap().file_name())
            .collect();
        assert_eq!(names.len(), 1);
    }

    #[test]
    fn test_bincode_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("index").join("postings");
        save_bincode(&path, &vec![1u64, 2, 3]).unwrap();
        let loaded: Vec<u64> = load_bincode(&path).unwrap().unwrap();
        assert_eq!(loaded, vec![1, 2, 3]);
    }

    #[test]
    fn test_corrupt_file_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("state.json");
        fs::write(&path, b"{not json").unwrap();
        let result: Result<Option<Sample>> = load_json(&path);
        assert!(result.is_err());
    }
}
