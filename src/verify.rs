//! Confirms a local file matches the size and ETag the listing reported.
//!
//! Used both before a task runs, to decide whether the destination can be
//! skipped, and after a download lands in its temporary path, before the
//! move into place.

use std::fs::{self, File};
use std::io::Read;
use std::path::Path;

use md5::{Digest, Md5};
use tracing::debug;

use crate::error::FetchError;

/// Verify `path` against the expected size and, when the ETag is a plain
/// MD5 digest, its checksum. A multipart-upload ETag (contains `-`) cannot
/// be recomputed locally, so only the size is checked for those.
pub fn verify_file(
    path: &Path,
    expected_size: u64,
    expected_etag: Option<&str>,
) -> Result<(), FetchError> {
    let actual_size = fs::metadata(path)?.len();
    if actual_size != expected_size {
        return Err(FetchError::Integrity {
            path: path.to_path_buf(),
            reason: format!("size mismatch: expected {expected_size}, found {actual_size}"),
        });
    }

    if let Some(etag) = expected_etag {
        let etag = etag.trim_matches('"');
        if etag.contains('-') {
            debug!(path = %path.display(), "multipart etag, size check only");
            return Ok(());
        }
        let actual = md5_hex(path)?;
        if !actual.eq_ignore_ascii_case(etag) {
            return Err(FetchError::Integrity {
                path: path.to_path_buf(),
                reason: format!("checksum mismatch: expected {etag}, computed {actual}"),
            });
        }
    }

    Ok(())
}

/// Skip-decision form of [`verify_file`]: a missing or nonconforming file
/// is simply "no match".
pub fn file_matches(path: &Path, expected_size: u64, expected_etag: Option<&str>) -> bool {
    path.exists() && verify_file(path, expected_size, expected_etag).is_ok()
}

fn md5_hex(path: &Path) -> Result<String, FetchError> {
    let mut file = File::open(path)?;
    let mut hasher = Md5::new();
    let mut buffer = [0u8; 64 * 1024];
    loop {
        let read = file.read(&mut buffer)?;
        if read == 0 {
            break;
        }
        hasher.update(&buffer[..read]);
    }
    Ok(format!("{:x}", hasher.finalize()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn write_file(dir: &Path, name: &str, data: &[u8]) -> std::path::PathBuf {
        let path = dir.join(name);
        File::create(&path).unwrap().write_all(data).unwrap();
        path
    }

    #[test]
    fn matching_file_passes() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_file(dir.path(), "b02.jp2", b"pixel data");
        // MD5 of "pixel data"
        let etag = format!("\"{:x}\"", Md5::digest(b"pixel data"));
        assert!(verify_file(&path, 10, Some(&etag)).is_ok());
        assert!(file_matches(&path, 10, Some(&etag)));
    }

    #[test]
    fn size_mismatch_fails() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_file(dir.path(), "b02.jp2", b"pixel data");
        let err = verify_file(&path, 11, None).unwrap_err();
        assert!(matches!(err, FetchError::Integrity { .. }));
    }

    #[test]
    fn checksum_mismatch_fails() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_file(dir.path(), "b02.jp2", b"pixel data");
        let err = verify_file(&path, 10, Some("\"d41d8cd98f00b204e9800998ecf8427e\""))
            .unwrap_err();
        assert!(matches!(err, FetchError::Integrity { .. }));
    }

    #[test]
    fn multipart_etag_falls_back_to_size() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_file(dir.path(), "b02.jp2", b"pixel data");
        assert!(verify_file(&path, 10, Some("\"abc123-4\"")).is_ok());
        assert!(verify_file(&path, 9, Some("\"abc123-4\"")).is_err());
    }

    #[test]
    fn missing_file_does_not_match() {
        let dir = tempfile::tempdir().unwrap();
        assert!(!file_matches(&dir.path().join("absent"), 10, None));
    }

    #[test]
    fn etag_comparison_ignores_quotes_and_case() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_file(dir.path(), "b02.jp2", b"pixel data");
        let etag = format!("{:X}", Md5::digest(b"pixel data"));
        assert!(verify_file(&path, 10, Some(&etag)).is_ok());
    }
}
