use std::path::Path;

use anyhow::{Context, Result};
use tokio::io::AsyncReadExt;

const BUF_SIZE: usize = 64 * 1024;

/// Compute the MD5 of a file, reading in 64 KB chunks.
/// Returns the lowercase hex digest (32 chars), the same form Drive
/// reports as `md5Checksum`.
pub async fn compute_md5(path: &Path) -> Result<String> {
    let mut file = tokio::fs::File::open(path)
        .await
        .with_context(|| format!("Cannot open {}", path.display()))?;

    let mut ctx = md5::Context::new();
    let mut buf = vec![0u8; BUF_SIZE];

    loop {
        let n = file.read(&mut buf).await?;
        if n == 0 {
            break;
        }
        ctx.consume(&buf[..n]);
    }

    Ok(format!("{:x}", ctx.compute()))
}

/// MD5 of an in-memory buffer.
pub fn md5_hex(bytes: &[u8]) -> String {
    format!("{:x}", md5::compute(bytes))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    #[tokio::test]
    async fn md5_of_known_content() {
        let mut f = NamedTempFile::new().unwrap();
        f.write_all(b"hello world").unwrap();
        f.flush().unwrap();

        let hash = compute_md5(f.path()).await.unwrap();
        assert_eq!(hash, "5eb63bbbe01eeed093cb22bb8f5acdc3");
    }

    #[tokio::test]
    async fn md5_of_empty_file() {
        let f = NamedTempFile::new().unwrap();
        let hash = compute_md5(f.path()).await.unwrap();
        assert_eq!(hash, "d41d8cd98f00b204e9800998ecf8427e");
    }

    #[tokio::test]
    async fn streamed_and_buffered_agree() {
        let data: Vec<u8> = (0..200_000u32).map(|i| (i % 251) as u8).collect();
        let mut f = NamedTempFile::new().unwrap();
        f.write_all(&data).unwrap();
        f.flush().unwrap();

        assert_eq!(compute_md5(f.path()).await.unwrap(), md5_hex(&data));
    }
}
