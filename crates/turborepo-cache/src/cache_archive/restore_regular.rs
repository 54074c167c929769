use std::{
    fs::OpenOptions,
    io::{self, Read},
    path::Path,
};

use tar::Entry;
use turbopath::{AbsoluteSystemPath, AnchoredSystemPath, AnchoredSystemPathBuf};

use crate::{
    CacheError,
    cache_archive::{restore::canonicalize_name, restore_directory::safe_mkdir_all},
};

pub fn restore_regular(
    anchor: &AbsoluteSystemPath,
    entry_path: &Path,
    entry: &mut Entry<impl Read>,
) -> Result<AnchoredSystemPathBuf, CacheError> {
    let processed_name = canonicalize_name(entry_path)?;
    safe_mkdir_file(anchor, &processed_name)?;

    let resolved = anchor.resolve(&processed_name);
    let mut options = OpenOptions::new();
    options.write(true).create(true).truncate(true);
    #[cfg(unix)]
    {
        use std::os::unix::fs::OpenOptionsExt;
        options.mode(entry.header().mode()?);
    }

    let mut file = resolved.open_with_options(options)?;
    io::copy(entry, &mut file)?;

    Ok(processed_name)
}

/// Ensures the parent directory chain exists, with the same symlink-escape
/// guard used for directory entries.
pub fn safe_mkdir_file(
    anchor: &AbsoluteSystemPath,
    processed_name: &AnchoredSystemPath,
) -> Result<(), CacheError> {
    if let Some(parent) = processed_name.parent() {
        if !parent.as_str().is_empty() {
            safe_mkdir_all(anchor, parent, 0o755)?;
        }
    }
    Ok(())
}
