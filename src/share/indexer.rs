//! Walks the configured roots and hashes what changed since the previous tree.
//!
//! Indexing blocks on disk I/O and hashing; it runs on the blocking thread pool.

use super::{ShareDirectory, ShareFile, ShareRoot, ShareTree};
use crate::tth;
use std::{
    collections::BTreeMap,
    fs, io,
    path::{Path, PathBuf},
    sync::Arc,
};

/// How many files an index run hashed, and how many it took over from the previous tree.
#[derive(Default, Debug, Clone, Copy, PartialEq, Eq)]
pub struct IndexStats {
    pub hashed: usize,
    pub reused: usize,
}

/// Builds a new tree for `roots`, reusing hashes from `previous` for files whose size and
/// modification time did not change.
pub(crate) fn index(
    roots: &BTreeMap<String, PathBuf>,
    previous: &ShareTree,
) -> (ShareTree, IndexStats) {
    let mut stats = IndexStats::default();
    let mut indexed = Vec::new();

    for (alias, path) in roots {
        let root_path = format!("/{}", alias);

        match index_directory(path, alias, &root_path, previous, &mut stats) {
            Ok(directory) => indexed.push(ShareRoot {
                alias: alias.clone(),
                path: path.clone(),
                directory,
            }),
            Err(error) => {
                log::error!("Failed to index share {} at {:?}: {}", alias, path, error)
            }
        }
    }

    (ShareTree::new(indexed), stats)
}

fn index_directory(
    real_path: &Path,
    name: &str,
    path: &str,
    previous: &ShareTree,
    stats: &mut IndexStats,
) -> io::Result<ShareDirectory> {
    let mut directory = ShareDirectory {
        name: name.to_owned(),
        path: path.to_owned(),
        ..ShareDirectory::default()
    };

    for entry in fs::read_dir(real_path)? {
        let entry = entry?;
        let entry_name = match entry.file_name().into_string() {
            Ok(name) => name,
            Err(name) => {
                log::warn!("Skipping non UTF-8 file name {:?}", name);
                continue;
            }
        };
        let entry_real_path = entry.path();
        let entry_path = format!("{}/{}", path, entry_name);

        let link_metadata = entry.metadata()?;
        // Symlinks are followed to files only, so the walk cannot loop.
        let metadata = if link_metadata.file_type().is_symlink() {
            match fs::metadata(&entry_real_path) {
                Ok(metadata) if metadata.is_file() => metadata,
                Ok(_) => {
                    log::debug!("Skipping symlinked directory {:?}", entry_real_path);
                    continue;
                }
                Err(error) => {
                    log::warn!("Skipping dangling symlink {:?}: {}", entry_real_path, error);
                    continue;
                }
            }
        } else {
            link_metadata
        };

        if metadata.is_dir() {
            match index_directory(&entry_real_path, &entry_name, &entry_path, previous, stats) {
                Ok(child) => {
                    directory.directories.insert(entry_name, child);
                }
                Err(error) => log::warn!("Skipping directory {:?}: {}", entry_real_path, error),
            }
            continue;
        }

        if !metadata.is_file() {
            continue;
        }

        let size = metadata.len();
        let modified = metadata.modified()?;

        let reusable = previous.file_by_path(&entry_path).filter(|old| {
            old.size == size && old.modified == modified && old.real_path == entry_real_path
        });

        let (tth, leaves) = match reusable {
            Some(old) => {
                stats.reused += 1;
                (old.tth, old.leaves.clone())
            }
            None => match tth::leaves_file(&entry_real_path) {
                Ok(leaves) => {
                    stats.hashed += 1;
                    (leaves.root(), Arc::new(leaves))
                }
                Err(error) => {
                    log::warn!("Skipping unreadable file {:?}: {}", entry_real_path, error);
                    continue;
                }
            },
        };

        log::trace!("Indexed {} ({} bytes, {})", entry_path, size, tth);

        directory.files.insert(
            entry_name.clone(),
            ShareFile {
                name: entry_name,
                path: entry_path,
                real_path: entry_real_path,
                size,
                modified,
                tth,
                leaves,
            },
        );
    }

    Ok(directory)
}

// ----------------------------------------------------------------------------//
