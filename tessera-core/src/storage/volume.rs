//! Volume copies for backup and restore

use crc32fast::Hasher;
use std::fs::{self, File};
use std::io::Read;
use std::path::{Path, PathBuf};
use tracing::debug;

use super::{TableDescriptor, DESCRIPTOR_FILE};
use crate::{Result, TesseraError};

/// What a volume copy moved
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CopyStats {
    pub files: usize,
    pub bytes: u64,
}

/// CRC32 of a file's contents
pub fn file_checksum(path: &Path) -> Result<u32> {
    let mut file = File::open(path)?;
    let mut hasher = Hasher::new();
    let mut buf = vec![0u8; 64 * 1024];
    loop {
        let n = file.read(&mut buf)?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
    }
    Ok(hasher.finalize())
}

/// Replace `to` with a copy of the directory tree `from`. Every file is
/// checksummed after copying; the copy is assembled under a temporary name
/// and only then moved over `to`.
pub fn copy_volume(from: &Path, to: &Path) -> Result<CopyStats> {
    let temp = sibling(to, "copying");
    if temp.exists() {
        fs::remove_dir_all(&temp)?;
    }

    let result = copy_tree(from, &temp);
    let stats = match result {
        Ok(stats) => stats,
        Err(e) => {
            let _ = fs::remove_dir_all(&temp);
            return Err(e);
        }
    };

    if to.exists() {
        let old = sibling(to, "old");
        fs::rename(to, &old)?;
        fs::rename(&temp, to)?;
        fs::remove_dir_all(&old)?;
    } else {
        if let Some(parent) = to.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::rename(&temp, to)?;
    }
    debug!("Copied {:?} to {:?}: {} files, {} bytes", from, to, stats.files, stats.bytes);
    Ok(stats)
}

fn copy_tree(from: &Path, to: &Path) -> Result<CopyStats> {
    let mut stats = CopyStats::default();
    let mut pending = vec![(from.to_path_buf(), to.to_path_buf())];
    while let Some((src_dir, dst_dir)) = pending.pop() {
        fs::create_dir_all(&dst_dir)?;
        for entry in fs::read_dir(&src_dir)? {
            let entry = entry?;
            let src = entry.path();
            let dst = dst_dir.join(entry.file_name());
            if entry.file_type()?.is_dir() {
                pending.push((src, dst));
                continue;
            }
            let bytes = fs::copy(&src, &dst)?;
            let expected = file_checksum(&src)?;
            let actual = file_checksum(&dst)?;
            if expected != actual {
                return Err(TesseraError::ChecksumMismatch { expected, actual });
            }
            File::open(&dst)?.sync_all()?;
            stats.files += 1;
            stats.bytes += bytes;
        }
    }
    Ok(stats)
}

fn sibling(path: &Path, suffix: &str) -> PathBuf {
    let mut name = path.file_name().unwrap_or_default().to_os_string();
    name.push(format!(".{}", suffix));
    path.with_file_name(name)
}

/// Check that `dir` holds a readable table, returning its descriptor
pub fn validate_volume(dir: &Path) -> Result<TableDescriptor> {
    if !dir.is_dir() {
        return Err(TesseraError::TableNotFound(format!("{:?} is not a directory", dir)));
    }
    TableDescriptor::load(&dir.join(DESCRIPTOR_FILE))
}
