//! The traced memory image: sections of the traced program's address
//! space, indexed by address-space identifier and virtual address.
//!
//! Sections share their backing buffers through reference counting, so
//! one image (or copies of it) can serve several decoders at once. The
//! fallback callbacks live behind a lock; the section list itself is
//! only mutated while the image is idle.

use std::{
    fmt,
    fs::File,
    path::{Path, PathBuf},
    sync::{Arc, Mutex},
};

use memmap2::Mmap;
use ptflow_codec::{Error, Result};

/// The CR3 value standing for "unknown, match any".
pub const NO_CR3: u64 = u64::MAX;

/// Address-space identifier: the CR3 of the process the addresses belong
/// to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Asid {
    pub cr3: u64,
}

impl Asid {
    #[must_use]
    pub const fn new(cr3: u64) -> Self {
        Self { cr3 }
    }

    #[must_use]
    pub const fn unknown() -> Self {
        Self { cr3: NO_CR3 }
    }

    /// Two identifiers match when they are equal or either side is
    /// unknown.
    #[must_use]
    pub const fn matches(&self, other: &Asid) -> bool {
        self.cr3 == NO_CR3 || other.cr3 == NO_CR3 || self.cr3 == other.cr3
    }
}

impl Default for Asid {
    fn default() -> Self {
        Self::unknown()
    }
}

/// Fallback for addresses no image section covers.
pub trait ReadMemory {
    /// Read memory at `ip` into `buf`; shorter reads are allowed.
    fn read_memory(&mut self, buf: &mut [u8], asid: Asid, ip: u64) -> Result<usize>;
}

/// Lazy binary loading.
///
/// Invoked once per freshly observed CR3 whose addresses are unmapped;
/// returning `Ok` makes the decoder retry the lookup exactly once.
pub trait LoadCr3 {
    fn new_cr3(&mut self, cr3: u64, ip: u64) -> Result<()>;
}

#[derive(Clone)]
enum Backing {
    Mapped(Arc<Mmap>),
    Owned(Arc<[u8]>),
}

impl Backing {
    fn bytes(&self) -> &[u8] {
        match self {
            Backing::Mapped(map) => map,
            Backing::Owned(bytes) => bytes,
        }
    }
}

#[derive(Clone)]
struct Section {
    name: Option<PathBuf>,
    backing: Backing,
    offset: usize,
    size: usize,
    asid: Asid,
    vaddr: u64,
}

impl Section {
    fn bytes(&self) -> &[u8] {
        &self.backing.bytes()[self.offset..self.offset + self.size]
    }

    fn end(&self) -> u64 {
        self.vaddr + self.size as u64
    }

    fn contains(&self, asid: Asid, ip: u64) -> bool {
        self.asid.matches(&asid) && ip >= self.vaddr && ip < self.end()
    }

    fn overlaps(&self, other: &Section) -> bool {
        self.asid.matches(&other.asid) && self.vaddr < other.end() && other.vaddr < self.end()
    }
}

/// Section store over the traced program's memory.
#[derive(Default)]
pub struct Image {
    sections: Vec<Section>,
    fallback: Mutex<Option<Box<dyn ReadMemory + Send>>>,
    load_cr3: Mutex<Option<Box<dyn LoadCr3 + Send>>>,
}

impl fmt::Debug for Image {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Image")
            .field("sections", &self.sections.len())
            .finish_non_exhaustive()
    }
}

impl Image {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Map `size` bytes at `file_offset` of `path` to the virtual range
    /// starting at `vaddr` in address space `asid`.
    ///
    /// [`Error::Invalid`] for an empty or out-of-file range,
    /// [`Error::BadImage`] when the range overlaps an existing section
    /// of a matching address space.
    pub fn add_file(
        &mut self,
        path: impl AsRef<Path>,
        file_offset: u64,
        size: u64,
        asid: Asid,
        vaddr: u64,
    ) -> Result<()> {
        let path = path.as_ref();
        let file = File::open(path).map_err(|error| {
            log::warn!("failed to open {}: {error}", path.display());
            Error::Invalid
        })?;
        // SAFETY: the mapping is read-only and shared; see the memmap2
        // documentation for the aliasing requirements.
        let map = unsafe {
            Mmap::map(&file).map_err(|error| {
                log::warn!("failed to map {}: {error}", path.display());
                Error::Invalid
            })?
        };

        let offset = usize::try_from(file_offset).map_err(|_| Error::Invalid)?;
        let size = usize::try_from(size).map_err(|_| Error::Invalid)?;
        if size == 0 || offset.checked_add(size).is_none_or(|end| end > map.len()) {
            return Err(Error::Invalid);
        }

        self.insert(Section {
            name: Some(path.to_path_buf()),
            backing: Backing::Mapped(Arc::new(map)),
            offset,
            size,
            asid,
            vaddr,
        })
    }

    /// Add an owned in-memory section.
    pub fn add_region(&mut self, bytes: impl Into<Arc<[u8]>>, asid: Asid, vaddr: u64) -> Result<()> {
        let bytes = bytes.into();
        if bytes.is_empty() {
            return Err(Error::Invalid);
        }
        self.insert(Section {
            name: None,
            backing: Backing::Owned(bytes.clone()),
            offset: 0,
            size: bytes.len(),
            asid,
            vaddr,
        })
    }

    fn insert(&mut self, section: Section) -> Result<()> {
        if self.sections.iter().any(|existing| existing.overlaps(&section)) {
            return Err(Error::BadImage);
        }
        self.sections.push(section);
        Ok(())
    }

    /// Remove all sections added from `path` for a matching address
    /// space; returns how many were removed.
    pub fn remove_by_filename(&mut self, path: impl AsRef<Path>, asid: Asid) -> usize {
        let path = path.as_ref();
        let before = self.sections.len();
        self.sections.retain(|section| {
            !(section.asid.matches(&asid) && section.name.as_deref() == Some(path))
        });
        before - self.sections.len()
    }

    /// Remove all sections of a matching address space; returns how many
    /// were removed.
    pub fn remove_by_asid(&mut self, asid: Asid) -> usize {
        let before = self.sections.len();
        self.sections.retain(|section| !section.asid.matches(&asid));
        before - self.sections.len()
    }

    /// Add all of `other`'s sections, sharing their backings.
    ///
    /// Sections that would overlap existing ones are skipped; returns the
    /// number of skipped sections.
    pub fn copy_from(&mut self, other: &Image) -> usize {
        let mut ignored = 0;
        for section in &other.sections {
            if self.insert(section.clone()).is_err() {
                ignored += 1;
            }
        }
        ignored
    }

    /// Install a read fallback for addresses outside all sections.
    pub fn set_memory_callback(&mut self, callback: Box<dyn ReadMemory + Send>) {
        *self.fallback.lock().unwrap_or_else(std::sync::PoisonError::into_inner) = Some(callback);
    }

    /// Install a lazy-load hook for freshly observed address spaces.
    pub fn set_new_cr3_callback(&mut self, callback: Box<dyn LoadCr3 + Send>) {
        *self.load_cr3.lock().unwrap_or_else(std::sync::PoisonError::into_inner) = Some(callback);
    }

    /// Read up to `buf.len()` bytes at `ip`.
    ///
    /// Consecutive sections are read through; [`Error::Nomap`] when
    /// nothing covers `ip` and no fallback serves it.
    pub fn read(&self, buf: &mut [u8], asid: Asid, ip: u64) -> Result<usize> {
        let mut filled = 0;
        while filled < buf.len() {
            let at = ip + filled as u64;
            let Some(section) = self
                .sections
                .iter()
                .find(|section| section.contains(asid, at))
            else {
                break;
            };
            let start = (at - section.vaddr) as usize;
            let bytes = section.bytes();
            let take = (bytes.len() - start).min(buf.len() - filled);
            buf[filled..filled + take].copy_from_slice(&bytes[start..start + take]);
            filled += take;
        }
        if filled > 0 {
            return Ok(filled);
        }

        let mut fallback = self.fallback.lock().map_err(|_| Error::BadLock)?;
        match fallback.as_mut() {
            Some(callback) => callback.read_memory(buf, asid, ip),
            None => Err(Error::Nomap),
        }
    }

    /// Report a freshly observed CR3 to the lazy-load hook.
    ///
    /// Returns whether a hook was installed and succeeded.
    pub(crate) fn notify_new_cr3(&self, cr3: u64, ip: u64) -> Result<bool> {
        let mut hook = self.load_cr3.lock().map_err(|_| Error::BadLock)?;
        match hook.as_mut() {
            Some(callback) => {
                callback.new_cr3(cr3, ip)?;
                Ok(true)
            }
            None => Ok(false),
        }
    }
}
