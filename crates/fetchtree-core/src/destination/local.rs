//! Local directory destination: each file is written with positional writes
//! into `<target>.partial` and renamed into place once every part arrived.

use eyre::{bail, Context, Result};
use std::fs::{self, File, OpenOptions};
use std::io;
use std::path::{Component, Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use super::{Destination, FileManifest, Sink};
use crate::checksum::{entity_tag, ChecksumType};
use crate::transfer_plan::{missing_parts, FinishedPart};

const PARTIAL_SUFFIX: &str = "partial";

#[derive(Debug, Clone)]
pub struct LocalDirDestination {
    root: PathBuf,
    strip_prefix: Option<String>,
    tag: ChecksumType,
}

impl LocalDirDestination {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            strip_prefix: None,
            tag: ChecksumType::default(),
        }
    }

    /// Remote paths below `prefix` land directly under the root.
    pub fn strip_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.strip_prefix = Some(prefix.into());
        self
    }

    pub fn entity_tag(mut self, tag: ChecksumType) -> Self {
        self.tag = tag;
        self
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Local path a remote file is written to.
    pub fn target_for(&self, remote_path: &str) -> Result<PathBuf> {
        let mut rel = remote_path;
        if let Some(prefix) = self.strip_prefix.as_deref() {
            let prefix = prefix.trim_end_matches('/');
            if let Some(rest) = rel.strip_prefix(prefix) {
                if rest.is_empty() || rest.starts_with('/') {
                    rel = rest;
                }
            }
        }
        let rel = rel.trim_start_matches('/');
        if rel.is_empty() {
            // The seed itself was a file: keep its name.
            let name = remote_path.rsplit('/').find(|s| !s.is_empty());
            return match name {
                Some(name) => Ok(self.root.join(name)),
                None => bail!("cannot derive a file name from {}", remote_path),
            };
        }
        let rel = Path::new(rel);
        for comp in rel.components() {
            if !matches!(comp, Component::Normal(_)) {
                bail!(
                    "refusing path containing non-normal components: {}",
                    remote_path
                );
            }
        }
        Ok(self.root.join(rel))
    }
}

impl Destination for LocalDirDestination {
    fn open(&self, manifest: &FileManifest) -> Result<Arc<dyn Sink>> {
        let target = self.target_for(&manifest.remote_path)?;
        if let Some(parent) = target.parent() {
            fs::create_dir_all(parent)
                .with_context(|| format!("create directory {}", parent.display()))?;
        }

        let mut partial_name = target.as_os_str().to_owned();
        partial_name.push(".");
        partial_name.push(PARTIAL_SUFFIX);
        let partial = PathBuf::from(partial_name);

        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(&partial)
            .with_context(|| format!("create {}", partial.display()))?;
        file.set_len(manifest.size)
            .with_context(|| format!("preallocate {}", partial.display()))?;

        Ok(Arc::new(LocalFileSink {
            file,
            partial,
            target,
            manifest: manifest.clone(),
            tag: self.tag,
            committed: AtomicBool::new(false),
        }))
    }
}

/// One file being assembled on local disk.
pub struct LocalFileSink {
    file: File,
    partial: PathBuf,
    target: PathBuf,
    manifest: FileManifest,
    tag: ChecksumType,
    committed: AtomicBool,
}

impl LocalFileSink {
    pub fn target(&self) -> &Path {
        &self.target
    }

    pub fn is_committed(&self) -> bool {
        self.committed.load(Ordering::SeqCst)
    }
}

impl Sink for LocalFileSink {
    fn put(&self, part_number: u32, data: &[u8]) -> Result<String> {
        if part_number == 0 || part_number > self.manifest.expected_parts {
            bail!(
                "part {} outside 1..={} for {}",
                part_number,
                self.manifest.expected_parts,
                self.target.display()
            );
        }
        let offset = self.manifest.offset_of(part_number);
        write_all_at(&self.file, data, offset).with_context(|| {
            format!(
                "write part {} at offset {} of {}",
                part_number,
                offset,
                self.partial.display()
            )
        })?;
        Ok(entity_tag(data, self.tag))
    }

    fn finalize(&self, parts: &[FinishedPart]) -> Result<()> {
        let missing = missing_parts(parts, self.manifest.expected_parts);
        if !missing.is_empty() {
            bail!(
                "incomplete part set for {}: missing parts {:?}; leaving {}",
                self.target.display(),
                missing,
                self.partial.display()
            );
        }
        self.file
            .sync_all()
            .with_context(|| format!("sync {}", self.partial.display()))?;
        fs::rename(&self.partial, &self.target).with_context(|| {
            format!(
                "rename {} to {}",
                self.partial.display(),
                self.target.display()
            )
        })?;
        self.committed.store(true, Ordering::SeqCst);
        Ok(())
    }

    fn close(&self) -> Result<()> {
        if !self.is_committed() {
            self.file
                .sync_data()
                .with_context(|| format!("sync {}", self.partial.display()))?;
        }
        Ok(())
    }

    fn describe(&self) -> String {
        self.target.display().to_string()
    }
}

#[cfg(unix)]
fn write_all_at(file: &File, data: &[u8], offset: u64) -> io::Result<()> {
    use std::os::unix::fs::FileExt;
    file.write_all_at(data, offset)
}

#[cfg(windows)]
fn write_all_at(file: &File, mut data: &[u8], mut offset: u64) -> io::Result<()> {
    use std::os::windows::fs::FileExt;
    while !data.is_empty() {
        let written = file.seek_write(data, offset)?;
        if written == 0 {
            return Err(io::Error::new(
                io::ErrorKind::WriteZero,
                "failed to write whole part",
            ));
        }
        data = &data[written..];
        offset += written as u64;
    }
    Ok(())
}
