/// Compressed tar archives for the image cache and preseed directories.
///
/// Extraction distinguishes a corrupted archive from a filesystem failure so
/// the operator knows whether to suspect the backup or the node. An archive
/// that unpacks to nothing is an error: it indicates a corrupt or empty
/// source, not a legitimately empty backup.
use std::fs::File;
use std::io;
use std::path::Path;

use flate2::Compression;
use flate2::read::GzDecoder;
use flate2::write::GzEncoder;

use crate::error::{EngineError, Result};

/// Archive the contents of `src_dir` into a gzip-compressed tarball at
/// `dest`. Entries are stored relative to the directory root.
pub fn create_tar_gz(src_dir: &Path, dest: &Path) -> Result<()> {
    let file = File::create(dest)?;
    let mut builder = tar::Builder::new(GzEncoder::new(file, Compression::default()));
    builder.append_dir_all(".", src_dir)?;
    let encoder = builder.into_inner()?;
    encoder.finish()?;
    Ok(())
}

/// Unpack a gzip-compressed tarball into `dest`, which must already exist.
/// `what` names the artifact in error messages.
pub fn extract_tar_gz(archive_path: &Path, dest: &Path, what: &str) -> Result<()> {
    let file = File::open(archive_path).map_err(|source| EngineError::Filesystem {
        what: what.to_string(),
        source,
    })?;
    let mut archive = tar::Archive::new(GzDecoder::new(file));

    if let Err(source) = archive.unpack(dest) {
        if is_corrupt_error(&source) {
            return Err(EngineError::CorruptArchive {
                what: what.to_string(),
            });
        }
        return Err(EngineError::Filesystem {
            what: what.to_string(),
            source,
        });
    }

    let mut entries = std::fs::read_dir(dest).map_err(|source| EngineError::Filesystem {
        what: what.to_string(),
        source,
    })?;
    if entries.next().is_none() {
        return Err(EngineError::EmptyArchive {
            what: what.to_string(),
        });
    }
    Ok(())
}

/// Decoder and header failures arrive as these kinds; anything else is a
/// problem with the destination filesystem.
fn is_corrupt_error(err: &io::Error) -> bool {
    matches!(
        err.kind(),
        io::ErrorKind::InvalidData | io::ErrorKind::InvalidInput | io::ErrorKind::UnexpectedEof
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::tempdir;

    #[test]
    fn test_archive_roundtrip() {
        let src = tempdir().unwrap();
        fs::write(src.path().join("bootloader.img"), b"image bytes").unwrap();
        fs::create_dir(src.path().join("ubuntu")).unwrap();
        fs::write(src.path().join("ubuntu").join("amd64.squashfs"), b"squash").unwrap();

        let staging = tempdir().unwrap();
        let archive_path = staging.path().join("image-storage.tar.gz");
        create_tar_gz(src.path(), &archive_path).unwrap();

        let dest = tempdir().unwrap();
        extract_tar_gz(&archive_path, dest.path(), "images").unwrap();

        assert_eq!(
            fs::read(dest.path().join("bootloader.img")).unwrap(),
            b"image bytes"
        );
        assert_eq!(
            fs::read(dest.path().join("ubuntu").join("amd64.squashfs")).unwrap(),
            b"squash"
        );
    }

    #[test]
    fn test_empty_extraction_is_an_error() {
        let src = tempdir().unwrap();
        let staging = tempdir().unwrap();
        let archive_path = staging.path().join("empty.tar.gz");
        create_tar_gz(src.path(), &archive_path).unwrap();

        let dest = tempdir().unwrap();
        let err = extract_tar_gz(&archive_path, dest.path(), "preseeds").unwrap_err();
        assert!(matches!(err, EngineError::EmptyArchive { .. }));
        assert!(err.to_string().contains("did not contain any files"));
    }

    #[test]
    fn test_garbage_reported_as_corrupt() {
        let staging = tempdir().unwrap();
        let archive_path = staging.path().join("bogus.tar.gz");
        fs::write(&archive_path, b"this is not a gzip stream at all").unwrap();

        let dest = tempdir().unwrap();
        let err = extract_tar_gz(&archive_path, dest.path(), "images").unwrap_err();
        assert!(matches!(err, EngineError::CorruptArchive { .. }));
        assert!(err.to_string().contains("not a valid .tar.gz"));
    }

    #[test]
    fn test_truncated_archive_reported_as_corrupt() {
        let src = tempdir().unwrap();
        fs::write(src.path().join("data.bin"), vec![7u8; 64 * 1024]).unwrap();

        let staging = tempdir().unwrap();
        let archive_path = staging.path().join("truncated.tar.gz");
        create_tar_gz(src.path(), &archive_path).unwrap();
        let bytes = fs::read(&archive_path).unwrap();
        fs::write(&archive_path, &bytes[..bytes.len() / 2]).unwrap();

        let dest = tempdir().unwrap();
        let err = extract_tar_gz(&archive_path, dest.path(), "images").unwrap_err();
        assert!(matches!(err, EngineError::CorruptArchive { .. }));
    }
}
