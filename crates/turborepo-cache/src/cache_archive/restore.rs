use std::{
    backtrace::Backtrace,
    collections::HashMap,
    io::Read,
    path::{Path, PathBuf},
};

use petgraph::graph::DiGraph;
use turbopath::{AbsoluteSystemPath, AnchoredSystemPathBuf, RelativeUnixPath};

use crate::{
    CacheError,
    cache_archive::{
        restore_directory::restore_directory,
        restore_regular::restore_regular,
        restore_symlink::{canonicalize_linkname, restore_symlink},
    },
};

pub struct CacheReader<'a> {
    reader: Box<dyn Read + 'a>,
}

impl<'a> CacheReader<'a> {
    pub fn open(path: &AbsoluteSystemPath) -> Result<Self, CacheError> {
        let file = path.open()?;
        Self::from_reader(file, path.extension() == Some("zst"))
    }

    pub fn from_reader(reader: impl Read + 'a, is_compressed: bool) -> Result<Self, CacheError> {
        let reader: Box<dyn Read> = if is_compressed {
            Box::new(zstd::Decoder::new(reader)?)
        } else {
            Box::new(reader)
        };
        Ok(CacheReader { reader })
    }

    /// Unpacks every entry beneath `anchor`, returning the anchored names
    /// that were written.
    pub fn restore(
        &mut self,
        anchor: &AbsoluteSystemPath,
    ) -> Result<Vec<AnchoredSystemPathBuf>, CacheError> {
        let mut restored = Vec::new();
        anchor.create_dir_all()?;

        let mut archive = tar::Archive::new(&mut self.reader);

        // Symlinks whose target is not on disk yet are deferred to a second
        // phase where they are ordered by their link dependencies.
        let mut deferred_symlinks: Vec<(AnchoredSystemPathBuf, PathBuf)> = Vec::new();

        for entry in archive.entries()? {
            let mut entry = entry?;
            // Entry::path (not Header::path) so GNU long names resolve.
            let entry_path = entry.path()?.into_owned();

            match entry.header().entry_type() {
                tar::EntryType::Directory => {
                    let mode = entry.header().mode()?;
                    restored.push(restore_directory(anchor, &entry_path, mode)?);
                }
                tar::EntryType::Regular => {
                    restored.push(restore_regular(anchor, &entry_path, &mut entry)?);
                }
                tar::EntryType::Symlink => {
                    let name = canonicalize_name(&entry_path)?;
                    let target = entry
                        .link_name()?
                        .ok_or_else(|| CacheError::MalformedTar(Backtrace::capture()))?
                        .into_owned();
                    match restore_symlink(anchor, &name, &target, false) {
                        Ok(()) => restored.push(name),
                        Err(CacheError::LinkTargetDoesNotExist(_, _)) => {
                            deferred_symlinks.push((name, target));
                        }
                        Err(e) => return Err(e),
                    }
                }
                other => {
                    return Err(CacheError::RestoreUnsupportedFileType(
                        other,
                        Backtrace::capture(),
                    ));
                }
            }
        }

        restored.extend(Self::restore_deferred_symlinks(anchor, deferred_symlinks)?);
        Ok(restored)
    }

    /// Restores symlinks that point at other deferred symlinks, ordered so
    /// that targets exist before the links naming them. A cycle among the
    /// remaining links is fatal; a target that never materializes is
    /// restored dangling, matching what the archive recorded.
    fn restore_deferred_symlinks(
        anchor: &AbsoluteSystemPath,
        symlinks: Vec<(AnchoredSystemPathBuf, PathBuf)>,
    ) -> Result<Vec<AnchoredSystemPathBuf>, CacheError> {
        let mut graph = DiGraph::new();
        let mut nodes = HashMap::new();
        let mut link_lookup = HashMap::new();
        let mut restored = Vec::new();

        for (name, target) in symlinks {
            let canonical_source = canonicalize_linkname(anchor, &name, name.as_std_path())?;
            let canonical_target = canonicalize_linkname(anchor, &name, &target)?;

            let source_node = *nodes
                .entry(canonical_source.clone())
                .or_insert_with(|| graph.add_node(canonical_source.clone()));
            let target_node = *nodes
                .entry(canonical_target.clone())
                .or_insert_with(|| graph.add_node(canonical_target));
            graph.add_edge(source_node, target_node, ());

            link_lookup.insert(canonical_source, (name, target));
        }

        let ordering = petgraph::algo::toposort(&graph, None)
            .map_err(|_| CacheError::CycleDetected(Backtrace::capture()))?;

        // Toposort over source -> target edges puts targets last; walk in
        // reverse so each target is created before its link.
        for node in ordering.into_iter().rev() {
            let Some((name, target)) = link_lookup.get(&graph[node]) else {
                continue;
            };
            restore_symlink(anchor, name, target, true)?;
            restored.push(name.clone());
        }

        Ok(restored)
    }
}

/// Validates a tar entry name. Names written by the archive writer are
/// anchored unix paths; anything absolute, escaping, or (on Windows)
/// containing `\` is rejected before it touches the filesystem.
pub(crate) fn canonicalize_name(name: &Path) -> Result<AnchoredSystemPathBuf, CacheError> {
    let name_str = name.to_str().ok_or_else(|| {
        CacheError::InvalidFilePath(name.to_string_lossy().into_owned(), Backtrace::capture())
    })?;

    if cfg!(windows) && name_str.contains('\\') {
        return Err(CacheError::WindowsUnsafeName(
            name_str.to_string(),
            Backtrace::capture(),
        ));
    }

    let trimmed = name_str.trim_end_matches('/');
    let unix = RelativeUnixPath::new(trimmed)
        .map_err(|_| CacheError::InvalidFilePath(name_str.to_string(), Backtrace::capture()))?;
    if trimmed.is_empty()
        || unix
            .as_str()
            .split('/')
            .any(|segment| segment.is_empty() || segment == "." || segment == "..")
    {
        return Err(CacheError::InvalidFilePath(
            name_str.to_string(),
            Backtrace::capture(),
        ));
    }

    Ok(unix.to_system())
}

#[cfg(test)]
mod test {
    use std::io::empty;

    use anyhow::Result;
    use tar::Header;
    use tempfile::tempdir;
    use test_case::test_case;
    use turbopath::AbsoluteSystemPath;

    use super::*;

    enum TarEntry {
        File(&'static str, &'static [u8]),
        Dir(&'static str),
        Symlink {
            link: &'static str,
            target: &'static str,
        },
    }

    fn build_tar(entries: &[TarEntry]) -> Result<Vec<u8>> {
        let mut body = Vec::new();
        {
            let mut builder = tar::Builder::new(&mut body);
            for entry in entries {
                match entry {
                    TarEntry::File(path, contents) => {
                        let mut header = Header::new_gnu();
                        header.set_entry_type(tar::EntryType::Regular);
                        header.set_mode(0o644);
                        header.set_size(contents.len() as u64);
                        builder.append_data(&mut header, path, *contents)?;
                    }
                    TarEntry::Dir(path) => {
                        let mut header = Header::new_gnu();
                        header.set_entry_type(tar::EntryType::Directory);
                        header.set_mode(0o755);
                        header.set_size(0);
                        builder.append_data(&mut header, path, empty())?;
                    }
                    TarEntry::Symlink { link, target } => {
                        let mut header = Header::new_gnu();
                        header.set_entry_type(tar::EntryType::Symlink);
                        header.set_size(0);
                        builder.append_link(&mut header, link, target)?;
                    }
                }
            }
            builder.finish()?;
        }
        Ok(body)
    }

    #[test]
    fn test_name_traversal_rejected() -> Result<()> {
        let tar = build_tar(&[TarEntry::File("../escape", b"gotcha")])?;
        let output = tempdir()?;
        let anchor = AbsoluteSystemPath::from_std_path(output.path())?;
        let result = CacheReader::from_reader(&tar[..], false)?.restore(anchor);
        assert!(matches!(result, Err(CacheError::InvalidFilePath(_, _))));
        Ok(())
    }

    #[cfg(unix)]
    #[test_case(&["b", "c"] ; "links before target")]
    #[test_case(&["c", "b"] ; "reverse order")]
    fn test_symlink_chain_restores_in_any_order(order: &[&str]) -> Result<()> {
        // b -> a, c -> b, with `a` the only real file.
        let mut entries = vec![TarEntry::File("a", b"real")];
        for name in order {
            match *name {
                "b" => entries.push(TarEntry::Symlink {
                    link: "b",
                    target: "a",
                }),
                "c" => entries.push(TarEntry::Symlink {
                    link: "c",
                    target: "b",
                }),
                _ => unreachable!(),
            }
        }
        let tar = build_tar(&entries)?;

        let output = tempdir()?;
        let anchor = AbsoluteSystemPath::from_std_path(output.path())?;
        let restored = CacheReader::from_reader(&tar[..], false)?.restore(anchor)?;
        assert_eq!(restored.len(), 3);

        let c = anchor.join_component("c");
        assert_eq!(c.read_to_string()?, "real");
        let b_target = anchor.join_component("b").read_link()?;
        assert_eq!(b_target.to_string_lossy(), "a");
        Ok(())
    }

    #[cfg(unix)]
    #[test]
    fn test_symlink_cycle_rejected() -> Result<()> {
        let tar = build_tar(&[
            TarEntry::Symlink {
                link: "one",
                target: "two",
            },
            TarEntry::Symlink {
                link: "two",
                target: "three",
            },
            TarEntry::Symlink {
                link: "three",
                target: "one",
            },
        ])?;
        let output = tempdir()?;
        let anchor = AbsoluteSystemPath::from_std_path(output.path())?;
        let result = CacheReader::from_reader(&tar[..], false)?.restore(anchor);
        assert!(matches!(result, Err(CacheError::CycleDetected(_))));
        Ok(())
    }

    #[cfg(unix)]
    #[test]
    fn test_dangling_symlink_restores() -> Result<()> {
        let tar = build_tar(&[TarEntry::Symlink {
            link: "orphan",
            target: "never-created",
        }])?;
        let output = tempdir()?;
        let anchor = AbsoluteSystemPath::from_std_path(output.path())?;
        let restored = CacheReader::from_reader(&tar[..], false)?.restore(anchor)?;
        assert_eq!(restored.len(), 1);
        let target = anchor.join_component("orphan").read_link()?;
        assert_eq!(target.to_string_lossy(), "never-created");
        Ok(())
    }

    #[test]
    fn test_directory_entries_restore_parents() -> Result<()> {
        let tar = build_tar(&[
            TarEntry::Dir("one/"),
            TarEntry::Dir("one/two/"),
            TarEntry::File("one/two/file", b"deep"),
        ])?;
        let output = tempdir()?;
        let anchor = AbsoluteSystemPath::from_std_path(output.path())?;
        let restored = CacheReader::from_reader(&tar[..], false)?.restore(anchor)?;
        assert_eq!(restored.len(), 3);
        assert_eq!(
            anchor
                .join_components(&["one", "two", "file"])
                .read_to_string()?,
            "deep"
        );
        Ok(())
    }

    #[test]
    fn test_fifo_rejected() -> Result<()> {
        let mut body = Vec::new();
        {
            let mut builder = tar::Builder::new(&mut body);
            let mut header = Header::new_gnu();
            header.set_entry_type(tar::EntryType::Fifo);
            header.set_size(0);
            builder.append_data(&mut header, "fifo", empty())?;
            builder.finish()?;
        }
        let output = tempdir()?;
        let anchor = AbsoluteSystemPath::from_std_path(output.path())?;
        let result = CacheReader::from_reader(&body[..], false)?.restore(anchor);
        assert!(matches!(
            result,
            Err(CacheError::RestoreUnsupportedFileType(_, _))
        ));
        Ok(())
    }

    #[test]
    fn test_canonicalize_name_rejects_dot_segments() {
        assert!(canonicalize_name(Path::new("a/./b")).is_err());
        assert!(canonicalize_name(Path::new("a/../b")).is_err());
        assert!(canonicalize_name(Path::new("/rooted")).is_err());
        assert!(canonicalize_name(Path::new("fine/name")).is_ok());
        // Trailing slashes from directory entries are fine.
        assert!(canonicalize_name(Path::new("dir/")).is_ok());
    }
}
