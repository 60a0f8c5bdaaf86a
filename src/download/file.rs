use std::path::{Path, PathBuf};

use sha2::{Digest, Sha256};
use tokio::fs::{self, OpenOptions};
use tokio::io::AsyncWriteExt;

/// Temporary sibling of `path` that receives the bytes before the rename.
pub fn part_path(path: &Path) -> PathBuf {
    let mut name = path.file_name().unwrap_or_default().to_os_string();
    name.push(".part");
    path.with_file_name(name)
}

/// Write `bytes` to `path` so that `path` either does not exist or holds the
/// complete content.
///
/// The data goes to a `.part` file in the same directory, is flushed and
/// synced, then renamed over `path`. On any error the `.part` file is removed.
pub async fn write_atomically(path: &Path, bytes: &[u8]) -> std::io::Result<u64> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).await?;
    }
    let part = part_path(path);

    let result = write_part_then_rename(&part, path, bytes).await;
    if result.is_err() {
        let _ = fs::remove_file(&part).await;
    }
    result
}

async fn write_part_then_rename(part: &Path, path: &Path, bytes: &[u8]) -> std::io::Result<u64> {
    let mut file = OpenOptions::new()
        .create(true)
        .write(true)
        .truncate(true)
        .open(part)
        .await?;
    file.write_all(bytes).await?;
    file.flush().await?;
    file.sync_all().await?;
    drop(file);

    fs::rename(part, path).await?;
    Ok(bytes.len() as u64)
}

/// Lowercase hex SHA-256 of `bytes`.
pub fn sha256_hex(bytes: &[u8]) -> String {
    to_hex(&Sha256::digest(bytes))
}

/// Streamed SHA-256 of a file on disk, for `verify --checksums`.
pub fn sha256_file(path: &Path) -> std::io::Result<String> {
    let mut file = std::fs::File::open(path)?;
    let mut hasher = Sha256::new();
    std::io::copy(&mut file, &mut hasher)?;
    Ok(to_hex(&hasher.finalize()))
}

fn to_hex(digest: &[u8]) -> String {
    use std::fmt::Write as _;
    let mut out = String::with_capacity(digest.len() * 2);
    for b in digest {
        let _ = write!(out, "{:02x}", b);
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_dir(name: &str) -> PathBuf {
        let dir = std::env::temp_dir()
            .join("pixdl")
            .join("file_tests")
            .join(name);
        let _ = std::fs::remove_dir_all(&dir);
        std::fs::create_dir_all(&dir).unwrap();
        dir
    }

    #[test]
    fn test_part_path() {
        assert_eq!(
            part_path(Path::new("/a/1_1_x.jpg")),
            PathBuf::from("/a/1_1_x.jpg.part")
        );
    }

    #[test]
    fn test_sha256_hex_known_value() {
        assert_eq!(
            sha256_hex(b"abc"),
            "ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad"
        );
    }

    #[test]
    fn test_sha256_file_matches_bytes() {
        let dir = test_dir("sha_file");
        let path = dir.join("f.bin");
        std::fs::write(&path, b"abc").unwrap();
        assert_eq!(sha256_file(&path).unwrap(), sha256_hex(b"abc"));
    }

    #[tokio::test]
    async fn test_write_atomically_creates_file() {
        let dir = test_dir("creates");
        let path = dir.join("nested").join("1_1_a.jpg");
        let n = write_atomically(&path, b"image-bytes").await.unwrap();
        assert_eq!(n, 11);
        assert_eq!(std::fs::read(&path).unwrap(), b"image-bytes");
        assert!(!part_path(&path).exists());
    }

    #[tokio::test]
    async fn test_write_atomically_replaces_stale_part() {
        let dir = test_dir("stale_part");
        let path = dir.join("1_1_a.jpg");
        std::fs::write(part_path(&path), b"leftover from a crash, longer").unwrap();
        write_atomically(&path, b"new").await.unwrap();
        assert_eq!(std::fs::read(&path).unwrap(), b"new");
        assert!(!part_path(&path).exists());
    }

    #[tokio::test]
    async fn test_write_failure_leaves_nothing() {
        let dir = test_dir("rename_fails");
        // A non-empty directory at the final path makes the rename fail.
        let path = dir.join("1_1_a.jpg");
        std::fs::create_dir_all(path.join("inner")).unwrap();
        assert!(write_atomically(&path, b"x").await.is_err());
        assert!(!part_path(&path).exists());
    }
}
