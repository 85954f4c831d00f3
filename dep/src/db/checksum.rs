//! MD5 checksums for archive products.
//!
//! The archive expects `md5sum`-compatible lines: the hex digest, two
//! spaces, then the file's base name.

use md5::{Digest, Md5};
use std::fs::File;
use std::io::{self, Read};
use std::path::Path;

/// MD5 of in-memory content as lowercase hex.
pub fn calculate_checksum(content: &[u8]) -> String {
    let mut hasher = Md5::new();
    hasher.update(content);
    hex::encode(hasher.finalize())
}

/// MD5 of a file, streamed in 64 KiB chunks.
pub fn file_md5(path: &Path) -> io::Result<String> {
    let mut file = File::open(path)?;
    let mut hasher = Md5::new();
    let mut buf = vec![0u8; 64 * 1024];
    loop {
        let n = file.read(&mut buf)?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
    }
    Ok(hex::encode(hasher.finalize()))
}

/// `"{md5}  {basename}\n"`
pub fn md5sum_line(md5: &str, path: &Path) -> String {
    let name = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    format!("{}  {}\n", md5, name)
}

/// Write `{target}.md5sum`-style output for `target` into `out`.
pub fn write_md5sum(target: &Path, out: &Path) -> io::Result<String> {
    let md5 = file_md5(target)?;
    std::fs::write(out, md5sum_line(&md5, target))?;
    Ok(md5)
}
