use std::fs::File;
use std::io::{self, BufReader, Read};
use std::path::Path;

/// Compute the BLAKE3 hash of a byte slice, returning the hex-encoded digest.
#[must_use]
pub fn blake3_bytes(data: &[u8]) -> String {
    blake3::hash(data).to_hex().to_string()
}

/// Compute a content digest for a whole directory.
///
/// Files are visited in sorted order and both the relative path and the
/// contents feed the hash, so renaming a file changes the digest.
/// Entries named in `skip` (matched against the first path component) are
/// ignored, which lets callers leave out nested `node_modules`.
///
/// # Errors
/// Returns an error if the directory cannot be walked or a file cannot be read.
pub fn blake3_dir(root: &Path, skip: &[&str]) -> io::Result<String> {
    let mut hasher = blake3::Hasher::new();

    let walker = walkdir::WalkDir::new(root)
        .min_depth(1)
        .sort_by_file_name()
        .into_iter()
        .filter_entry(|e| {
            e.depth() != 1
                || e
                    .file_name()
                    .to_str()
                    .map_or(true, |name| !skip.contains(&name))
        });

    for entry in walker {
        let entry = entry.map_err(io::Error::other)?;
        if !entry.file_type().is_file() {
            continue;
        }
        let rel = entry
            .path()
            .strip_prefix(root)
            .map_err(io::Error::other)?;
        hasher.update(rel.to_string_lossy().replace('\\', "/").as_bytes());
        hasher.update(&[0]);
        hash_file_into(&mut hasher, entry.path())?;
        hasher.update(&[0]);
    }

    Ok(hasher.finalize().to_hex().to_string())
}

/// Stream a file's contents into `hasher`.
fn hash_file_into(hasher: &mut blake3::Hasher, path: &Path) -> io::Result<()> {
    let mut reader = BufReader::new(File::open(path)?);
    let mut buffer = [0u8; 8192];
    loop {
        let bytes_read = reader.read(&mut buffer)?;
        if bytes_read == 0 {
            return Ok(());
        }
        hasher.update(&buffer[..bytes_read]);
    }
}
