use std::{
    collections::HashMap,
    io::{self, Read},
};

use sha1::{Digest, Sha1};
use turbopath::{AbsoluteSystemPath, AnchoredSystemPathBuf, PathError, RelativeUnixPathBuf};

/// File path → git blob hash, keyed by the unix flavor so maps serialize
/// identically across platforms.
pub type FileHashes = HashMap<RelativeUnixPathBuf, String>;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("io error while hashing {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: io::Error,
    },
    #[error(transparent)]
    Path(#[from] PathError),
}

/// Hashes a single file the way git hashes a blob: sha1 over
/// `"blob {len}\0"` followed by the content bytes. Symlinks hash the link
/// target string rather than whatever the link resolves to.
pub fn hash_file(path: &AbsoluteSystemPath) -> Result<String, Error> {
    let metadata = path.symlink_metadata().map_err(|source| Error::Io {
        path: path.to_string(),
        source,
    })?;

    if metadata.is_symlink() {
        let target = path.read_link().map_err(|source| Error::Io {
            path: path.to_string(),
            source,
        })?;
        let target = target.to_string_lossy();
        return Ok(hash_blob_bytes(target.as_bytes()));
    }

    let mut hasher = Sha1::new();
    hasher.update(format!("blob {}\0", metadata.len()).as_bytes());
    let mut file = path.open().map_err(|source| Error::Io {
        path: path.to_string(),
        source,
    })?;
    let mut buffer = [0u8; 8192];
    loop {
        let n = file.read(&mut buffer).map_err(|source| Error::Io {
            path: path.to_string(),
            source,
        })?;
        if n == 0 {
            break;
        }
        hasher.update(&buffer[..n]);
    }
    Ok(hex::encode(hasher.finalize()))
}

fn hash_blob_bytes(bytes: &[u8]) -> String {
    let mut hasher = Sha1::new();
    hasher.update(format!("blob {}\0", bytes.len()).as_bytes());
    hasher.update(bytes);
    hex::encode(hasher.finalize())
}

/// Hashes a set of anchored files, returning unix-keyed blob hashes.
/// Files that vanished between discovery and hashing are skipped.
pub fn hash_files(
    anchor: &AbsoluteSystemPath,
    files: impl IntoIterator<Item = AnchoredSystemPathBuf>,
) -> Result<FileHashes, Error> {
    let mut hashes = FileHashes::new();
    for file in files {
        let full_path = anchor.resolve(&file);
        match hash_file(&full_path) {
            Ok(hash) => {
                hashes.insert(file.to_unix()?, hash);
            }
            Err(Error::Io { source, .. }) if source.kind() == io::ErrorKind::NotFound => continue,
            Err(e) => return Err(e),
        }
    }
    Ok(hashes)
}
