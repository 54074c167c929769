use std::{
    backtrace::Backtrace,
    fs,
    fs::OpenOptions,
    io::{BufWriter, Read, Write},
    sync::atomic::{AtomicU64, Ordering},
};

use path_slash::PathExt as _;
use sha2::{Digest, Sha512};
use tar::{EntryType, Header};
use turbopath::{AbsoluteSystemPath, AbsoluteSystemPathBuf, AnchoredSystemPath};

use crate::CacheError;

/// Process-wide counter so concurrent writers in one process never collide
/// on a temp name. Combined with the pid it is unique across processes too.
static TEMP_FILE_COUNTER: AtomicU64 = AtomicU64::new(0);

fn generate_temp_path(final_path: &AbsoluteSystemPath) -> AbsoluteSystemPathBuf {
    let file_name = final_path.file_name().unwrap_or("cache");
    let unique = TEMP_FILE_COUNTER.fetch_add(1, Ordering::Relaxed);
    final_path
        .parent()
        .expect("cache path has a parent directory")
        .join_component(&format!(
            ".{file_name}.{}.{unique}.tmp",
            std::process::id()
        ))
}

/// Streaming archive writer: `tar -> zstd -> BufWriter -> temp file`.
///
/// Writes land in a temp file that [`CacheWriter::finish`] atomically
/// renames into place; a writer dropped early removes its temp file, so a
/// crash mid-write leaves no visible artifact.
pub struct CacheWriter<'a> {
    builder: Option<tar::Builder<Box<dyn Write + Send + 'a>>>,
    temp_path: Option<AbsoluteSystemPathBuf>,
    final_path: Option<AbsoluteSystemPathBuf>,
}

impl Drop for CacheWriter<'_> {
    fn drop(&mut self) {
        if let Some(temp_path) = self.temp_path.take() {
            // Best effort; we may already be unwinding.
            let _ = temp_path.remove_file();
        }
    }
}

impl<'a> CacheWriter<'a> {
    /// Creates an archive at `path` (extension `zst` selects compression).
    pub fn create(path: &AbsoluteSystemPath) -> Result<Self, CacheError> {
        let temp_path = generate_temp_path(path);

        let mut options = OpenOptions::new();
        options.write(true).create(true).truncate(true);
        let file = temp_path.open_with_options(options)?;
        // Flush to disk in 1mb chunks.
        let buffered = BufWriter::with_capacity(1 << 20, file);

        let writer = Self::wrap_writer(buffered, path.extension() == Some("zst"))?;
        Ok(CacheWriter {
            builder: Some(tar::Builder::new(writer)),
            temp_path: Some(temp_path),
            final_path: Some(path.to_owned()),
        })
    }

    /// Builds an in-memory archive, used by the remote tier.
    pub fn from_writer(
        writer: impl Write + Send + 'a,
        use_compression: bool,
    ) -> Result<Self, CacheError> {
        let writer = Self::wrap_writer(writer, use_compression)?;
        Ok(CacheWriter {
            builder: Some(tar::Builder::new(writer)),
            temp_path: None,
            final_path: None,
        })
    }

    fn wrap_writer(
        writer: impl Write + Send + 'a,
        use_compression: bool,
    ) -> Result<Box<dyn Write + Send + 'a>, CacheError> {
        if use_compression {
            let encoder = zstd::Encoder::new(writer, 0)?.auto_finish();
            Ok(Box::new(encoder))
        } else {
            Ok(Box::new(writer))
        }
    }

    /// Adds one anchored file, directory, or symlink.
    pub fn add_file(
        &mut self,
        anchor: &AbsoluteSystemPath,
        file_path: &AnchoredSystemPath,
    ) -> Result<(), CacheError> {
        let source_path = anchor.resolve(file_path);
        let file_info = source_path.symlink_metadata()?;

        let mut entry_name = file_path.to_unix()?;
        entry_name.make_canonical_for_tar(file_info.is_dir());

        let mut header = Self::create_header(&file_info)?;
        let builder = self.builder.as_mut().expect("builder lives until finish");

        if header.entry_type() == EntryType::Regular && file_info.len() > 0 {
            let file = source_path.open()?;
            builder.append_data(&mut header, entry_name.as_str(), file)?;
        } else if header.entry_type() == EntryType::Symlink {
            // Link targets are stored unix-style like entry names.
            let target = source_path.read_link()?;
            let target = target
                .to_slash()
                .ok_or_else(|| CacheError::InvalidFilePath(
                    target.to_string_lossy().into_owned(),
                    Backtrace::capture(),
                ))?
                .into_owned();
            builder.append_link(&mut header, entry_name.as_str(), target)?;
        } else {
            builder.append_data(&mut header, entry_name.as_str(), std::io::empty())?;
        }

        Ok(())
    }

    fn create_header(file_info: &fs::Metadata) -> Result<Header, CacheError> {
        let mut header = Header::new_gnu();

        #[cfg(unix)]
        let mode = {
            use std::os::unix::fs::MetadataExt;
            file_info.mode()
        };
        #[cfg(windows)]
        let mode = 0o755;
        header.set_mode(mode);

        if file_info.is_symlink() {
            // The linkname is set with append_link so long targets get the
            // GNU extension treatment.
            header.set_entry_type(EntryType::Symlink);
            header.set_size(0);
        } else if file_info.is_dir() {
            header.set_entry_type(EntryType::Directory);
            header.set_size(0);
        } else if file_info.is_file() {
            header.set_entry_type(EntryType::Regular);
            header.set_size(file_info.len());
        } else {
            return Err(CacheError::CreateUnsupportedFileType(Backtrace::capture()));
        }

        // Identical inputs must produce identical archives on any machine.
        header.set_uid(0);
        header.set_gid(0);
        header.set_mtime(0);
        header.as_gnu_mut().expect("gnu header").set_atime(0);
        header.as_gnu_mut().expect("gnu header").set_ctime(0);

        Ok(header)
    }

    /// Finalizes the archive and atomically moves it into place.
    pub fn finish(mut self) -> Result<(), CacheError> {
        // Dropping the builder flushes the tar footer and the zstd frame.
        let builder = self.builder.take().expect("finish called once");
        builder.into_inner()?.flush()?;

        if let (Some(temp_path), Some(final_path)) =
            (self.temp_path.take(), self.final_path.take())
        {
            temp_path.rename(&final_path)?;
        }
        Ok(())
    }
}

/// SHA-512 of a finished artifact's bytes (the compressed stream), hex.
pub fn artifact_digest(path: &AbsoluteSystemPath) -> Result<String, CacheError> {
    let mut hasher = Sha512::new();
    let mut file = path.open()?;
    let mut buffer = [0u8; 8192];
    loop {
        let n = file.read(&mut buffer)?;
        if n == 0 {
            break;
        }
        hasher.update(&buffer[..n]);
    }
    Ok(hex::encode(hasher.finalize()))
}

#[cfg(test)]
mod test {
    use anyhow::Result;
    use tempfile::tempdir;
    use turbopath::AnchoredSystemPathBuf;

    use super::*;
    use crate::cache_archive::CacheReader;

    #[test]
    fn test_round_trip_files_and_dirs() -> Result<()> {
        for compressed in [false, true] {
            let input = tempdir()?;
            let input_path = AbsoluteSystemPath::from_std_path(input.path())?;
            let archive_dir = tempdir()?;
            let name = if compressed { "out.tar.zst" } else { "out.tar" };
            let archive_path =
                AbsoluteSystemPath::from_std_path(archive_dir.path())?.join_component(name);

            input_path.join_component("dist").create_dir_all()?;
            input_path
                .join_components(&["dist", "index.js"])
                .create_with_contents("console.log('hi')")?;

            let mut writer = CacheWriter::create(&archive_path)?;
            writer.add_file(input_path, &AnchoredSystemPathBuf::from_raw("dist")?)?;
            writer.add_file(
                input_path,
                &AnchoredSystemPathBuf::from_raw("dist/index.js")?,
            )?;
            writer.finish()?;

            let output = tempdir()?;
            let output_path = AbsoluteSystemPath::from_std_path(output.path())?;
            let restored = CacheReader::open(&archive_path)?.restore(output_path)?;

            assert_eq!(restored.len(), 2);
            assert_eq!(
                output_path
                    .join_components(&["dist", "index.js"])
                    .read_to_string()?,
                "console.log('hi')"
            );
        }
        Ok(())
    }

    #[test]
    fn test_archives_are_byte_identical_across_runs() -> Result<()> {
        let input = tempdir()?;
        let input_path = AbsoluteSystemPath::from_std_path(input.path())?;
        input_path
            .join_component("file.txt")
            .create_with_contents("stable")?;

        let make_archive = || -> Result<Vec<u8>> {
            let mut body = Vec::new();
            {
                let mut writer = CacheWriter::from_writer(&mut body, false)?;
                writer.add_file(input_path, &AnchoredSystemPathBuf::from_raw("file.txt")?)?;
                writer.finish()?;
            }
            Ok(body)
        };

        assert_eq!(make_archive()?, make_archive()?);
        Ok(())
    }

    #[cfg(unix)]
    #[test]
    fn test_rejects_fifo() -> Result<()> {
        use std::ffi::CString;

        let input = tempdir()?;
        let input_path = AbsoluteSystemPath::from_std_path(input.path())?;
        let fifo = input_path.join_component("fifo");
        let fifo_name = CString::new(fifo.as_str())?;
        unsafe {
            libc::mkfifo(fifo_name.as_ptr(), 0o644);
        }

        let archive_dir = tempdir()?;
        let archive_path =
            AbsoluteSystemPath::from_std_path(archive_dir.path())?.join_component("out.tar");
        let mut writer = CacheWriter::create(&archive_path)?;
        let result = writer.add_file(input_path, &AnchoredSystemPathBuf::from_raw("fifo")?);
        assert!(matches!(
            result,
            Err(CacheError::CreateUnsupportedFileType(_))
        ));
        Ok(())
    }

    #[test]
    fn test_temp_file_cleaned_up_without_finish() -> Result<()> {
        let archive_dir = tempdir()?;
        let archive_path =
            AbsoluteSystemPath::from_std_path(archive_dir.path())?.join_component("out.tar.zst");
        {
            let _writer = CacheWriter::create(&archive_path)?;
        }
        let leftovers: Vec<_> = std::fs::read_dir(archive_dir.path())?
            .filter_map(|e| e.ok())
            .collect();
        assert!(leftovers.is_empty(), "temp files left behind: {leftovers:?}");
        assert!(!archive_path.exists());
        Ok(())
    }
}
