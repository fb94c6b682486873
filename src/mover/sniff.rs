//! Magic-byte sniffing for plaintext images

use std::path::Path;
use tokio::io::AsyncReadExt;

/// Bytes needed to recognize every supported format
pub const SNIFF_LEN: usize = 12;

/// Whether `buf` starts like a PNG, JPEG, WEBP or GIF file
pub fn is_plain_image_magic(buf: &[u8]) -> bool {
    if buf.len() < SNIFF_LEN {
        return false;
    }
    if buf.starts_with(&[0xff, 0xd8, 0xff]) {
        return true;
    }
    if buf.starts_with(&[0x89, b'P', b'N', b'G', 0x0d, 0x0a, 0x1a, 0x0a]) {
        return true;
    }
    if &buf[..4] == b"RIFF" && &buf[8..12] == b"WEBP" {
        return true;
    }
    buf.starts_with(b"GIF87a") || buf.starts_with(b"GIF89a")
}

/// Read the first bytes of `path` (fewer if the file is shorter)
pub async fn read_head(path: &Path, len: usize) -> std::io::Result<Vec<u8>> {
    let mut file = tokio::fs::File::open(path).await?;
    let mut head = vec![0u8; len];
    let mut filled = 0;
    while filled < len {
        let n = file.read(&mut head[filled..]).await?;
        if n == 0 {
            break;
        }
        filled += n;
    }
    head.truncate(filled);
    Ok(head)
}

/// Whether the file at `path` is a plaintext image; unreadable files are not
pub async fn is_plain_image_file(path: &Path) -> bool {
    match read_head(path, SNIFF_LEN).await {
        Ok(head) => is_plain_image_magic(&head),
        Err(_) => false,
    }
}
