// SPDX-License-Identifier: BSD-3-Clause

//! The set of files the mount exposes: regular files that had an open descriptor at checkpoint
//! time, keyed by their flattened local name.

use crate::error::{Error, Result};
use crate::images::proto::{FdinfoEntry, RegFileEntry};
use crate::images::ImageFile;
use log::{info, warn};
use std::collections::{BTreeMap, HashMap};
use std::fs;
use std::path::Path;
use std::sync::Arc;

pub const FDINFO_PREFIX: &str = "fdinfo-";
pub const REGFILE_IMAGE: &str = "reg-files.img";

/// Replaces the path separators that remain after stripping the leading one.
pub const FLATTEN_CHAR: char = '.';

/// Maps an absolute remote path to the single-level name it is exposed under, e.g.
/// `/x/y/z` becomes `x.y.z`.
pub fn local_name(remote_path: &str) -> String {
    remote_path
        .strip_prefix('/')
        .unwrap_or(remote_path)
        .replace('/', &FLATTEN_CHAR.to_string())
}

/// A regular file exposed by the mount.
#[derive(Debug, Clone, PartialEq)]
pub struct RegistryEntry {
    local_name: String,
    fd: u32,
    file: RegFileEntry,
}

impl RegistryEntry {
    pub fn local_name(&self) -> &str {
        &self.local_name
    }

    /// Descriptor number the checkpointed process had this file open under.
    pub fn fd(&self) -> u32 {
        self.fd
    }

    pub fn id(&self) -> u32 {
        self.file.id
    }

    /// Absolute path on the origin host, which is also where the local copy lands.
    pub fn remote_path(&self) -> &Path {
        Path::new(&self.file.name)
    }

    /// Mode bits as recorded at checkpoint time, always carrying a file type.
    pub fn mode(&self) -> u32 {
        let mode = self.file.mode.unwrap_or(0);
        if mode & libc::S_IFMT == 0 {
            mode | libc::S_IFREG
        } else {
            mode
        }
    }

    pub fn size(&self) -> u64 {
        self.file.size.unwrap_or(0)
    }

    /// `open(2)` flags the file was open with.
    pub fn flags(&self) -> u32 {
        self.file.flags
    }

    pub fn record(&self) -> &RegFileEntry {
        &self.file
    }
}

/// Read-only after construction, shared by every request.
#[derive(Debug, Default)]
pub struct FileRegistry {
    // Sorted by local name; the position also determines the inode.
    entries: Vec<Arc<RegistryEntry>>,
    by_name: HashMap<String, usize>,
}

impl FileRegistry {
    /// Joins descriptor records with regular-file records on their id. Only descriptors of type
    /// "regular file" take part, and a file record without such a descriptor is left out.
    pub fn build<F, R>(fdinfos: F, regfiles: R) -> Self
    where
        F: IntoIterator<Item = FdinfoEntry>,
        R: IntoIterator<Item = RegFileEntry>,
    {
        let mut owners: HashMap<u32, u32> = HashMap::new();
        for fdinfo in fdinfos.into_iter().filter(FdinfoEntry::is_regular_file) {
            owners.entry(fdinfo.id).or_insert(fdinfo.fd);
        }

        let mut kept: BTreeMap<String, RegistryEntry> = BTreeMap::new();
        for file in regfiles {
            let Some(&fd) = owners.get(&file.id) else {
                continue;
            };
            let name = local_name(&file.name);
            if let Some(existing) = kept.get(&name) {
                warn!(
                    "{} and {} both map to {name}, keeping the first",
                    existing.file.name, file.name
                );
                continue;
            }
            kept.insert(
                name.clone(),
                RegistryEntry {
                    local_name: name,
                    fd,
                    file,
                },
            );
        }

        let entries: Vec<_> = kept.into_values().map(Arc::new).collect();
        let by_name = entries
            .iter()
            .enumerate()
            .map(|(i, e)| (e.local_name.clone(), i))
            .collect();
        FileRegistry { entries, by_name }
    }

    /// Reads every `fdinfo-*.img` and the `reg-files.img` found in `dir`.
    pub fn from_image_dir(dir: &Path) -> Result<Self> {
        let wrap = |image: &Path| {
            let image = image.display().to_string();
            move |source: Error| Error::RegistryBuild {
                image,
                source: Box::new(source),
            }
        };

        let mut fdinfo_images = Vec::new();
        for dirent in fs::read_dir(dir).map_err(|e| wrap(dir)(e.into()))? {
            let dirent = dirent.map_err(|e| wrap(dir)(e.into()))?;
            let name = dirent.file_name();
            let name = name.to_string_lossy();
            if name.starts_with(FDINFO_PREFIX) && name.ends_with(".img") {
                fdinfo_images.push(dirent.path());
            }
        }
        fdinfo_images.sort();

        let mut fdinfos = Vec::new();
        for path in &fdinfo_images {
            let entries: Vec<FdinfoEntry> =
                ImageFile::new(path).read_entries().map_err(wrap(path.as_path()))?;
            fdinfos.extend(entries);
        }

        let regfile_path = dir.join(REGFILE_IMAGE);
        let regfiles: Vec<RegFileEntry> = ImageFile::new(&regfile_path)
            .read_entries()
            .map_err(wrap(regfile_path.as_path()))?;

        let registry = FileRegistry::build(fdinfos, regfiles);
        info!(
            "{}: {} descriptor images, {} open regular files",
            dir.display(),
            fdinfo_images.len(),
            registry.len()
        );
        Ok(registry)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn get(&self, name: &str) -> Option<&Arc<RegistryEntry>> {
        self.by_name.get(name).map(|&i| &self.entries[i])
    }

    /// Position of `name` in listing order.
    pub fn index_of(&self, name: &str) -> Option<usize> {
        self.by_name.get(name).copied()
    }

    pub fn get_index(&self, index: usize) -> Option<&Arc<RegistryEntry>> {
        self.entries.get(index)
    }

    pub fn iter(&self) -> impl Iterator<Item = &Arc<RegistryEntry>> {
        self.entries.iter()
    }
}
