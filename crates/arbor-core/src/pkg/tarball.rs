//! Package tarballs: download with a size cap, unpack into the cache.

use super::error::PkgError;
use super::manifest::Manifest;
use bytes::{Bytes, BytesMut};
use flate2::read::GzDecoder;
use reqwest::{Client, StatusCode};
use std::fs;
use std::io;
use std::path::{Component, Path, PathBuf};
use std::time::Duration;
use tar::{Archive, EntryType};

/// Largest tarball accepted from a registry (200 MB).
pub const MAX_TARBALL_SIZE: u64 = 200 * 1024 * 1024;

const DOWNLOAD_TIMEOUT: Duration = Duration::from_secs(30);

/// Download a tarball, refusing bodies larger than `max_bytes`.
///
/// The body is read chunk by chunk so an oversized download is cut short
/// even when the server sends no `Content-Length`.
///
/// # Errors
/// `E404` for a missing tarball, `ENETWORK` for any other failure.
pub async fn download_tarball(client: &Client, url: &str, max_bytes: u64) -> Result<Bytes, PkgError> {
    let mut response = client
        .get(url)
        .timeout(DOWNLOAD_TIMEOUT)
        .send()
        .await
        .map_err(|e| PkgError::network(format!("GET {url}: {e}")))?;

    match response.status() {
        StatusCode::NOT_FOUND => return Err(PkgError::not_found(url)),
        status if !status.is_success() => {
            return Err(PkgError::network(format!("GET {url}: {status}")));
        }
        _ => {}
    }

    let too_large = |len: u64| PkgError::network(format!("{url} is {len} bytes, over the {max_bytes} byte limit"));
    if let Some(len) = response.content_length().filter(|len| *len > max_bytes) {
        return Err(too_large(len));
    }

    let mut body = BytesMut::new();
    while let Some(chunk) = response
        .chunk()
        .await
        .map_err(|e| PkgError::network(format!("GET {url}: {e}")))?
    {
        body.extend_from_slice(&chunk);
        if body.len() as u64 > max_bytes {
            return Err(too_large(body.len() as u64));
        }
    }
    Ok(body.freeze())
}

/// Digest recorded as `_integrity` for tarballs that carry no registry metadata.
#[must_use]
pub fn tarball_integrity(bytes: &[u8]) -> String {
    format!("blake3-{}", arbor_util::hash::blake3_bytes(bytes))
}

/// Unpack a gzipped package tarball so its contents land directly in `dest`.
///
/// The archive's leading directory (`package/` for most packages) is
/// stripped. Unpacking goes to a sibling temp dir that is renamed into
/// place, so `dest` is either complete or absent. If `dest` already
/// exists the call is a no-op.
///
/// # Errors
/// Returns an error for unreadable archives, archives with no files, or
/// entries that would land outside `dest`.
pub fn extract_tgz_atomic(bytes: &[u8], dest: &Path) -> Result<(), PkgError> {
    if dest.exists() {
        return Ok(());
    }
    let parent = dest
        .parent()
        .ok_or_else(|| PkgError::fs(format!("{} has no parent directory", dest.display())))?;
    fs::create_dir_all(parent).map_err(|e| PkgError::io_at(parent, &e))?;

    let staging = tempfile::Builder::new()
        .prefix(".unpack-")
        .tempdir_in(parent)
        .map_err(|e| PkgError::io_at(parent, &e))?;
    let unpacked = staging.path().join("package");
    let files = unpack_stripped(bytes, &unpacked)?;
    if files == 0 {
        return Err(PkgError::fs("tarball contains no files"));
    }

    match fs::rename(&unpacked, dest) {
        Ok(()) => Ok(()),
        // A concurrent unpack of the same artifact got there first.
        Err(_) if dest.exists() => Ok(()),
        Err(_) => arbor_util::fs::move_dir(&unpacked, dest).map_err(|e| PkgError::io_at(dest, &e)),
    }
}

/// Read the `package.json` out of a gzipped tarball.
///
/// # Errors
/// Returns an error if the tarball cannot be unpacked or has no manifest.
pub fn read_tgz_manifest(bytes: &[u8]) -> Result<Manifest, PkgError> {
    let scratch = tempfile::tempdir()?;
    let dest = scratch.path().join("package");
    extract_tgz_atomic(bytes, &dest)?;
    if !dest.join("package.json").is_file() {
        return Err(PkgError::not_local(&dest));
    }
    Manifest::read_dir(&dest)
}

/// Entry path with its first component removed, or `None` for the root itself.
fn strip_root(path: &Path) -> Result<Option<PathBuf>, PkgError> {
    let mut rel = PathBuf::new();
    let mut past_root = false;
    for component in path.components() {
        match component {
            Component::Normal(part) if past_root => rel.push(part),
            Component::Normal(_) => past_root = true,
            Component::CurDir => {}
            _ => return Err(unsafe_entry(path)),
        }
    }
    Ok((!rel.as_os_str().is_empty()).then_some(rel))
}

fn unsafe_entry(path: &Path) -> PkgError {
    PkgError::fs(format!("tarball entry {} escapes the package directory", path.display()))
}

/// Unpack regular files and directories under `dest`; returns the file count.
///
/// Links and device entries are skipped.
fn unpack_stripped(bytes: &[u8], dest: &Path) -> Result<usize, PkgError> {
    let read_err = |e: io::Error| PkgError::fs(format!("unreadable tarball: {e}"));
    let mut archive = Archive::new(GzDecoder::new(bytes));
    let mut files = 0;

    for entry in archive.entries().map_err(read_err)? {
        let mut entry = entry.map_err(read_err)?;
        let path = entry.path().map_err(read_err)?.into_owned();
        let Some(rel) = strip_root(&path)? else {
            continue;
        };
        let out = dest.join(&rel);

        match entry.header().entry_type() {
            EntryType::Directory => {
                fs::create_dir_all(&out).map_err(|e| PkgError::io_at(&out, &e))?;
            }
            EntryType::Regular | EntryType::Continuous => {
                if let Some(parent) = out.parent() {
                    fs::create_dir_all(parent).map_err(|e| PkgError::io_at(parent, &e))?;
                }
                let mut file = fs::File::create(&out).map_err(|e| PkgError::io_at(&out, &e))?;
                io::copy(&mut entry, &mut file).map_err(|e| PkgError::io_at(&out, &e))?;
                #[cfg(unix)]
                {
                    use std::os::unix::fs::PermissionsExt;
                    if let Ok(mode) = entry.header().mode() {
                        // Owner keeps read and write whatever the archive says.
                        let _ = fs::set_permissions(&out, fs::Permissions::from_mode(mode | 0o600));
                    }
                }
                files += 1;
            }
            _ => {}
        }
    }
    Ok(files)
}
