//! Shared directories, their hashed file tree and the file list we serve.

use crate::{
    tiger::TigerHash,
    tth::Leaves,
};
use std::{
    collections::{BTreeMap, HashMap},
    path::PathBuf,
    sync::Arc,
    time::SystemTime,
};

pub(crate) mod filelist;
pub(crate) mod indexer;

pub use self::{
    filelist::{FileList, FileListDirectory, FileListFile},
    indexer::IndexStats,
};

/// A hashed file in the share.
#[derive(Clone, Debug)]
pub struct ShareFile {
    pub name: String,
    /// Path as peers see it, rooted at the alias: `/alias/dir/file`.
    pub path: String,
    pub real_path: PathBuf,
    pub size: u64,
    pub modified: SystemTime,
    pub tth: TigerHash,
    pub leaves: Arc<Leaves>,
}

#[derive(Clone, Debug, Default)]
pub struct ShareDirectory {
    pub name: String,
    /// Path as peers see it, rooted at the alias: `/alias/dir`.
    pub path: String,
    pub directories: BTreeMap<String, ShareDirectory>,
    pub files: BTreeMap<String, ShareFile>,
}

impl ShareDirectory {
    fn visit_files<'a>(&'a self, out: &mut Vec<&'a ShareFile>) {
        out.extend(self.files.values());
        for directory in self.directories.values() {
            directory.visit_files(out);
        }
    }

    fn to_file_list(&self) -> FileListDirectory {
        FileListDirectory {
            name: self.name.clone(),
            directories: self
                .directories
                .values()
                .map(ShareDirectory::to_file_list)
                .collect(),
            files: self
                .files
                .values()
                .map(|file| FileListFile {
                    name: file.name.clone(),
                    size: file.size,
                    tth: file.tth,
                })
                .collect(),
        }
    }
}

/// A configured share: an on-disk directory published under an alias.
#[derive(Clone, Debug)]
pub struct ShareRoot {
    pub alias: String,
    pub path: PathBuf,
    pub directory: ShareDirectory,
}

/// Every share root, indexed by TTH. Replaced as a whole after each re-index.
#[derive(Clone, Debug, Default)]
pub struct ShareTree {
    roots: BTreeMap<String, ShareRoot>,
    by_tth: HashMap<TigerHash, ShareFile>,
    by_path: HashMap<String, ShareFile>,
    file_count: usize,
    total_size: u64,
}

impl ShareTree {
    pub fn new(roots: impl IntoIterator<Item = ShareRoot>) -> Self {
        let roots: BTreeMap<_, _> = roots
            .into_iter()
            .map(|root| (root.alias.clone(), root))
            .collect();

        let mut files = Vec::new();
        for root in roots.values() {
            root.directory.visit_files(&mut files);
        }

        let file_count = files.len();
        let total_size = files.iter().map(|file| file.size).sum();
        let by_tth = files
            .iter()
            .map(|file| (file.tth, (*file).clone()))
            .collect();
        let by_path = files
            .iter()
            .map(|file| (file.path.clone(), (*file).clone()))
            .collect();

        Self {
            roots,
            by_tth,
            by_path,
            file_count,
            total_size,
        }
    }

    pub fn roots(&self) -> impl Iterator<Item = &ShareRoot> {
        self.roots.values()
    }

    pub fn file_count(&self) -> usize {
        self.file_count
    }

    pub fn total_size(&self) -> u64 {
        self.total_size
    }

    pub fn file_by_tth(&self, tth: &TigerHash) -> Option<&ShareFile> {
        self.by_tth.get(tth)
    }

    pub fn file_by_path(&self, path: &str) -> Option<&ShareFile> {
        self.by_path.get(path)
    }

    pub fn files(&self) -> impl Iterator<Item = &ShareFile> {
        self.by_path.values()
    }

    /// Every directory in the tree, roots included.
    pub fn directories(&self) -> Vec<&ShareDirectory> {
        let mut out = Vec::new();
        let mut stack: Vec<&ShareDirectory> =
            self.roots.values().map(|root| &root.directory).collect();

        while let Some(directory) = stack.pop() {
            out.push(directory);
            stack.extend(directory.directories.values());
        }

        out
    }

    pub fn to_file_list(&self, cid: &TigerHash, generator: &str) -> FileList {
        FileList {
            version: "1".to_owned(),
            cid: cid.to_string(),
            base: "/".to_owned(),
            generator: generator.to_owned(),
            root: FileListDirectory {
                name: String::new(),
                directories: self
                    .roots
                    .values()
                    .map(|root| root.directory.to_file_list())
                    .collect(),
                files: Vec::new(),
            },
        }
    }
}
