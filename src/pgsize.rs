//! Page size emulation.
//!
//! Some environments emulate a user page size larger than the base page size the
//! kernel actually works with, e.g. 16KiB pages on a 4KiB kernel. Memory related
//! kernel interfaces (`mincore`, `mlock`, file mapping faults) keep operating on
//! kernel pages, so tests probing them have to convert between both units.
//! Without emulation both sizes are equal and every conversion is the identity.

use std::{fs, io, path::Path};

use once_cell::sync::OnceCell;
use thiserror::Error;

/// Error returned when a page size model is not supported.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum PageSizeError {
    #[error("page size {0} is not a power of two")]
    NotPowerOfTwo(usize),
    #[error("kernel page size {kernel} exceeds user page size {user}")]
    KernelLargerThanUser { user: usize, kernel: usize },
    #[error("page size model already initialized")]
    AlreadyInitialized,
}

/// User visible and kernel page sizes of the running system.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PageSizeModel {
    user_page_size: usize,
    kernel_page_size: usize,
}

static MODEL: OnceCell<PageSizeModel> = OnceCell::new();

impl PageSizeModel {
    /// Both sizes must be powers of two, the kernel one not larger than the user one.
    pub fn new(user_page_size: usize, kernel_page_size: usize) -> Result<Self, PageSizeError> {
        for size in [user_page_size, kernel_page_size] {
            if !size.is_power_of_two() {
                return Err(PageSizeError::NotPowerOfTwo(size));
            }
        }

        if kernel_page_size > user_page_size {
            return Err(PageSizeError::KernelLargerThanUser {
                user: user_page_size,
                kernel: kernel_page_size,
            });
        }

        Ok(Self {
            user_page_size,
            kernel_page_size,
        })
    }

    /// Query the running system.
    ///
    /// The user page size comes from `sysconf(_SC_PAGESIZE)`. The kernel page size is
    /// `kernel_override` if given, the smallest `KernelPageSize` of the mappings in
    /// `/proc/self/smaps` otherwise, falling back to the user page size.
    pub fn detect(kernel_override: Option<usize>) -> Result<Self, PageSizeError> {
        let user = user_page_size();
        let kernel = kernel_override
            .or_else(smaps_kernel_page_size)
            .unwrap_or(user);

        tracing::debug!(user, kernel, "detected page sizes");
        Self::new(user, kernel)
    }

    /// Detect the process-wide model, see [`PageSizeModel::detect`].
    pub fn init(kernel_override: Option<usize>) -> Result<&'static Self, PageSizeError> {
        let model = Self::detect(kernel_override)?;
        MODEL
            .set(model)
            .map_err(|_| PageSizeError::AlreadyInitialized)?;

        Ok(MODEL.get_or_init(|| model))
    }

    /// The process-wide model, detected without override on first use.
    ///
    /// A failed detection is returned as is and retried on the next call.
    pub fn current() -> Result<&'static Self, PageSizeError> {
        current_in(&MODEL, || Self::detect(None))
    }

    pub fn user_page_size(&self) -> usize {
        self.user_page_size
    }

    pub fn kernel_page_size(&self) -> usize {
        self.kernel_page_size
    }

    /// Whether the user page size is emulated on top of smaller kernel pages.
    pub fn is_emulated(&self) -> bool {
        self.user_page_size != self.kernel_page_size
    }

    fn ratio(&self) -> usize {
        self.user_page_size / self.kernel_page_size
    }

    /// Number of whole kernel pages covered by `size` bytes.
    pub fn nr_kernel_pages(&self, size: usize) -> usize {
        size / self.kernel_page_size
    }

    pub fn user_pages_to_kernel_pages(&self, nr_pages: usize) -> usize {
        nr_pages * self.ratio()
    }

    /// Truncates when `nr_pages` is not a multiple of the kernel pages per user page.
    pub fn kernel_pages_to_user_pages(&self, nr_pages: usize) -> usize {
        nr_pages / self.ratio()
    }

    /// Length of the vector `mincore` fills for `user_pages` pages, one byte per kernel page.
    pub fn mincore_vector_len(&self, user_pages: usize) -> usize {
        self.user_pages_to_kernel_pages(user_pages)
    }

    /// Move a non-zero offset into the last kernel page of the first user page, so
    /// that touching it faults in every kernel page before it.
    pub fn mlock_offset(&self, offset: usize) -> usize {
        if self.is_emulated() && offset > 0 {
            self.user_page_size - self.kernel_page_size + offset
        } else {
            offset
        }
    }

    /// `content` repeated until it reaches into the last kernel page of a user page.
    ///
    /// Mapping faults allow reading the partial kernel page past the end of a file but
    /// not the kernel pages after it, so backing files need that much content.
    pub fn emulation_fill(&self, content: &str) -> String {
        if !self.is_emulated() || content.is_empty() {
            return content.to_owned();
        }

        let nr_writes = self.kernel_page_size * (self.ratio() - 1) / content.len() + 1;
        content.repeat(nr_writes)
    }

    /// Write the [`emulation_fill`](Self::emulation_fill) of `content` to `path` at once.
    pub fn write_emulation_file(&self, path: &Path, content: &str) -> io::Result<()> {
        fs::write(path, self.emulation_fill(content))
    }
}

fn current_in<F>(cell: &OnceCell<PageSizeModel>, detect: F) -> Result<&PageSizeModel, PageSizeError>
where
    F: FnOnce() -> Result<PageSizeModel, PageSizeError>,
{
    cell.get_or_try_init(|| {
        detect().map_err(|err| {
            tracing::warn!(%err, "unsupported page sizes");
            err
        })
    })
}

fn user_page_size() -> usize {
    nix::unistd::sysconf(nix::unistd::SysconfVar::PAGE_SIZE)
        .ok()
        .flatten()
        .and_then(|size| usize::try_from(size).ok())
        .unwrap_or(4096)
}

#[cfg(smaps)]
fn smaps_kernel_page_size() -> Option<usize> {
    match fs::read_to_string("/proc/self/smaps") {
        Ok(smaps) => parse_kernel_page_size(&smaps),
        Err(err) => {
            tracing::debug!(%err, "cannot read /proc/self/smaps");
            None
        }
    }
}

#[cfg(not(smaps))]
fn smaps_kernel_page_size() -> Option<usize> {
    None
}

/// Smallest `KernelPageSize` entry of an smaps listing, in bytes.
pub fn parse_kernel_page_size(smaps: &str) -> Option<usize> {
    smaps
        .lines()
        .filter_map(|line| line.strip_prefix("KernelPageSize:"))
        .filter_map(|value| {
            value
                .trim()
                .strip_suffix("kB")
                .and_then(|kb| kb.trim().parse::<usize>().ok())
        })
        .min()
        .map(|kb| kb * 1024)
}
