//! Local filesystem source. Remote paths are `/`-separated and resolved
//! beneath the `root` parameter.

use eyre::{bail, Context, Result};
use std::fs::{self, File};
use std::path::{Component, Path, PathBuf};

use walkdir::WalkDir;

use super::{EntryKind, ReadSeek, RemoteEntry, Source, SourceParams};

#[derive(Debug, Clone)]
pub struct LocalSource {
    root: PathBuf,
}

impl LocalSource {
    pub fn new(params: &SourceParams) -> Result<Self> {
        let root = PathBuf::from(params.root().unwrap_or("/"));
        if !root.exists() {
            bail!("source root does not exist: {}", root.display());
        }
        Ok(Self { root })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn resolve(&self, remote: &str) -> Result<PathBuf> {
        let rel = Path::new(remote.trim_start_matches('/'));
        for comp in rel.components() {
            if !matches!(comp, Component::Normal(_)) {
                bail!("refusing path containing non-normal components: {}", remote);
            }
        }
        Ok(self.root.join(rel))
    }
}

impl Source for LocalSource {
    fn list(&mut self, path: &str) -> Result<Vec<RemoteEntry>> {
        let dir = self.resolve(path)?;
        let mut entries = Vec::new();

        for next in WalkDir::new(&dir).min_depth(1).max_depth(1).sort_by_file_name() {
            let entry = next.with_context(|| format!("list directory {}", dir.display()))?;
            let name = entry.file_name().to_string_lossy().into_owned();
            let file_type = entry.file_type();
            let kind = if file_type.is_dir() {
                EntryKind::Directory
            } else if file_type.is_file() {
                EntryKind::File
            } else {
                log::debug!("skipping non-regular entry {}", entry.path().display());
                continue;
            };
            entries.push(RemoteEntry::new(path, name, kind));
        }

        Ok(entries)
    }

    fn stat(&mut self, path: &str) -> Result<u64> {
        let abs = self.resolve(path)?;
        let meta = fs::metadata(&abs).with_context(|| format!("stat {}", abs.display()))?;
        if !meta.is_file() {
            bail!("not a regular file: {}", abs.display());
        }
        Ok(meta.len())
    }

    fn open_read<'a>(&'a mut self, path: &str) -> Result<Box<dyn ReadSeek + 'a>> {
        let abs = self.resolve(path)?;
        let file = File::open(&abs).with_context(|| format!("open {}", abs.display()))?;
        Ok(Box::new(file))
    }
}
