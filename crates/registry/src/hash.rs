//! Artifact directory content hashing.

use crate::errors::{RegistryError, Result};
use std::fs::{self, File};
use std::io::Read;
use std::path::{Path, PathBuf};

const CHUNK_SIZE: usize = 8192;

/// Every regular file under `dir`, sorted by relative path.
fn sorted_files(dir: &Path) -> Result<Vec<PathBuf>> {
    let mut files = Vec::new();
    let mut pending = vec![dir.to_path_buf()];

    while let Some(current) = pending.pop() {
        for entry in fs::read_dir(&current).map_err(|e| RegistryError::io(&current, e))? {
            let entry = entry.map_err(|e| RegistryError::io(&current, e))?;
            let path = entry.path();
            let file_type = entry.file_type().map_err(|e| RegistryError::io(&path, e))?;
            if file_type.is_dir() {
                pending.push(path);
            } else if file_type.is_file() {
                files.push(path);
            }
        }
    }

    files.sort_by(|a, b| a.strip_prefix(dir).ok().cmp(&b.strip_prefix(dir).ok()));
    Ok(files)
}

/// blake3 digest over the relative path and contents of every file under
/// `dir`, visited in sorted order and read in fixed-size chunks.
///
/// Directories with identical file names and bytes hash identically no
/// matter where they live on disk.
pub fn content_hash(dir: &Path) -> Result<String> {
    if !dir.is_dir() {
        return Err(RegistryError::ArtifactNotFound(dir.display().to_string()));
    }

    let mut hasher = blake3::Hasher::new();
    let mut buf = [0u8; CHUNK_SIZE];

    for path in sorted_files(dir)? {
        let relative = path.strip_prefix(dir).unwrap_or(&path);
        let name = relative.to_string_lossy();
        hasher.update(&(name.len() as u64).to_le_bytes());
        hasher.update(name.as_bytes());

        let mut file = File::open(&path).map_err(|e| RegistryError::io(&path, e))?;
        loop {
            let read = file.read(&mut buf).map_err(|e| RegistryError::io(&path, e))?;
            if read == 0 {
                break;
            }
            hasher.update(&buf[..read]);
        }
    }

    Ok(hex::encode(hasher.finalize().as_bytes()))
}
