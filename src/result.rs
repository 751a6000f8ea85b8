//! Result records and the process-wide result stream.
//!
//! Every outcome of a test program ends up as one line on the result stream:
//!
//! ```text
//! ignore_mask.rs:212: TFAIL: group 0 (FAN_CLASS_CONTENT) got event: mask 20 (expected 0)
//! ```
//!
//! and bumps a counter keyed by its [`ResultKind`]. The counters live in a shared
//! anonymous mapping, so records emitted by forked children are accounted for in
//! the parent.

use std::{
    borrow::Cow,
    fmt::Display,
    io::{self, stdout, Write},
    ops::Deref,
    panic::Location,
    path::Path,
    ptr::{self, NonNull},
    sync::{
        atomic::{AtomicU32, Ordering},
        Mutex, PoisonError,
    },
};

use nix::libc;
use once_cell::sync::OnceCell;

use crate::errno::errno_name;

/// Exit status bit set when any expectation failed.
pub const EXIT_FAIL: i32 = 1;
/// Exit status bit set when the run was broken.
pub const EXIT_BROK: i32 = 2;
/// Exit status bit set when warnings were reported.
pub const EXIT_WARN: i32 = 4;
/// Exit status of a run that was not applicable to this system.
pub const EXIT_CONF: i32 = 32;

/// Kind of a result record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, strum::Display, strum::EnumIter)]
pub enum ResultKind {
    /// The expectation held.
    #[strum(serialize = "TPASS")]
    Pass,
    /// The expectation did not hold.
    #[strum(serialize = "TFAIL")]
    Fail,
    /// The feature under test is not available in this configuration.
    #[strum(serialize = "TCONF")]
    Conf,
    /// The environment is broken, further results can't be trusted.
    #[strum(serialize = "TBROK")]
    Brok,
    /// Something went wrong outside of the test itself, e.g. during cleanup.
    #[strum(serialize = "TWARN")]
    Warn,
    /// Informational message, not counted.
    #[strum(serialize = "TINFO")]
    Info,
}

impl ResultKind {
    /// Qualify the record with an errno, whose name is appended to the message.
    pub const fn with_errno(self, errno: i32) -> ResultFlags {
        ResultFlags {
            kind: self,
            errno: Some(errno),
        }
    }
}

/// A [`ResultKind`], optionally qualified with an errno.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ResultFlags {
    pub kind: ResultKind,
    pub errno: Option<i32>,
}

impl From<ResultKind> for ResultFlags {
    fn from(kind: ResultKind) -> Self {
        Self { kind, errno: None }
    }
}

/// File and line a record originates from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SourceLocation {
    file: Cow<'static, str>,
    line: u32,
}

impl SourceLocation {
    pub const fn new(file: &'static str, line: u32) -> Self {
        Self {
            file: Cow::Borrowed(file),
            line,
        }
    }

    pub fn owned(file: String, line: u32) -> Self {
        Self {
            file: Cow::Owned(file),
            line,
        }
    }

    /// Location of the caller of the current `#[track_caller]` function.
    #[track_caller]
    pub fn caller() -> Self {
        Location::caller().into()
    }

    pub fn file(&self) -> &str {
        &self.file
    }

    pub fn line(&self) -> u32 {
        self.line
    }
}

impl From<&'static Location<'static>> for SourceLocation {
    fn from(location: &'static Location<'static>) -> Self {
        Self::new(location.file(), location.line())
    }
}

impl Display for SourceLocation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let path = Path::new(self.file.as_ref());
        let name = path
            .file_name()
            .map(|name| name.to_string_lossy())
            .unwrap_or_else(|| path.to_string_lossy());

        write!(f, "{name}:{}", self.line)
    }
}

/// Snapshot of the result counters.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct ResultCounts {
    pub passed: u32,
    pub failed: u32,
    pub broken: u32,
    pub skipped: u32,
    pub warnings: u32,
}

impl ResultCounts {
    /// Number of counted records.
    pub fn total(&self) -> u32 {
        self.passed + self.failed + self.broken + self.skipped + self.warnings
    }

    /// Exit status for a run which produced these counts.
    pub fn exit_code(&self) -> i32 {
        let mut code = 0;

        if self.failed > 0 {
            code |= EXIT_FAIL;
        }
        if self.broken > 0 {
            code |= EXIT_BROK;
        }
        if self.warnings > 0 {
            code |= EXIT_WARN;
        }
        if code == 0 && self.passed == 0 && self.skipped > 0 {
            code = EXIT_CONF;
        }

        code
    }
}

#[repr(C)]
struct Counters {
    passed: AtomicU32,
    failed: AtomicU32,
    broken: AtomicU32,
    skipped: AtomicU32,
    warnings: AtomicU32,
}

impl Counters {
    fn counter(&self, kind: ResultKind) -> Option<&AtomicU32> {
        match kind {
            ResultKind::Pass => Some(&self.passed),
            ResultKind::Fail => Some(&self.failed),
            ResultKind::Conf => Some(&self.skipped),
            ResultKind::Brok => Some(&self.broken),
            ResultKind::Warn => Some(&self.warnings),
            ResultKind::Info => None,
        }
    }

    fn all(&self) -> [&AtomicU32; 5] {
        [
            &self.passed,
            &self.failed,
            &self.broken,
            &self.skipped,
            &self.warnings,
        ]
    }
}

/// [`Counters`] in a `MAP_SHARED | MAP_ANONYMOUS` mapping, inherited by forked children.
struct SharedCounters(NonNull<Counters>);

// SAFETY: the mapping is only accessed through atomics and lives as long as `self`.
unsafe impl Send for SharedCounters {}
unsafe impl Sync for SharedCounters {}

impl SharedCounters {
    fn new() -> io::Result<Self> {
        // SAFETY: anonymous mapping, no file descriptor or fixed address involved.
        let addr = unsafe {
            libc::mmap(
                ptr::null_mut(),
                std::mem::size_of::<Counters>(),
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_SHARED | libc::MAP_ANONYMOUS,
                -1,
                0,
            )
        };
        if addr == libc::MAP_FAILED {
            return Err(io::Error::last_os_error());
        }

        // Anonymous mappings are zero filled, which is a valid `Counters`.
        NonNull::new(addr.cast::<Counters>())
            .map(Self)
            .ok_or_else(|| io::Error::new(io::ErrorKind::Other, "mmap returned NULL"))
    }
}

impl Deref for SharedCounters {
    type Target = Counters;

    fn deref(&self) -> &Counters {
        // SAFETY: the pointer comes from a successful mmap of the right size.
        unsafe { self.0.as_ref() }
    }
}

impl Drop for SharedCounters {
    fn drop(&mut self) {
        // SAFETY: the mapping was created in `new` and is not referenced anymore.
        unsafe {
            libc::munmap(self.0.as_ptr().cast(), std::mem::size_of::<Counters>());
        }
    }
}

/// Writes result records to a stream and keeps count of them.
pub struct Reporter {
    sink: Mutex<Box<dyn Write + Send>>,
    counters: SharedCounters,
}

static GLOBAL: OnceCell<Reporter> = OnceCell::new();

impl Reporter {
    /// Create a reporter writing to `sink`.
    pub fn new(sink: Box<dyn Write + Send>) -> io::Result<Self> {
        Ok(Self {
            sink: Mutex::new(sink),
            counters: SharedCounters::new()?,
        })
    }

    /// Create a reporter writing to the standard output.
    pub fn stdout() -> io::Result<Self> {
        Self::new(Box::new(stdout()))
    }

    /// The process-wide reporter, writing to the standard output.
    pub fn global() -> &'static Reporter {
        GLOBAL.get_or_init(|| Self::stdout().unwrap_or_else(|err| fatal(&err)))
    }

    /// Emit one record and count it.
    pub fn report(
        &self,
        flags: impl Into<ResultFlags>,
        location: SourceLocation,
        message: impl Display,
    ) {
        let flags = flags.into();
        let mut line = format!("{location}: {}: {message}", flags.kind);
        if let Some(errno) = flags.errno {
            line.push_str(&format!(": {} ({errno})", errno_name(errno)));
        }

        self.write_line(&line);

        if let Some(counter) = self.counters.counter(flags.kind) {
            counter.fetch_add(1, Ordering::SeqCst);
        }
    }

    /// Current value of the counters.
    pub fn counts(&self) -> ResultCounts {
        ResultCounts {
            passed: self.counters.passed.load(Ordering::SeqCst),
            failed: self.counters.failed.load(Ordering::SeqCst),
            broken: self.counters.broken.load(Ordering::SeqCst),
            skipped: self.counters.skipped.load(Ordering::SeqCst),
            warnings: self.counters.warnings.load(Ordering::SeqCst),
        }
    }

    /// Zero the counters, before running another test program.
    pub fn reset(&self) {
        for counter in self.counters.all() {
            counter.store(0, Ordering::SeqCst);
        }
    }

    /// Write text which is not a record, e.g. hints for the reader.
    pub fn write_raw(&self, text: impl Display) {
        self.write_line(&text.to_string());
    }

    /// Write the summary block of the current counters.
    pub fn print_summary(&self) {
        let counts = self.counts();
        self.write_raw(format_args!(
            "\nSummary:\npassed   {}\nfailed   {}\nbroken   {}\nskipped  {}\nwarnings {}",
            counts.passed, counts.failed, counts.broken, counts.skipped, counts.warnings
        ));
    }

    /// Flush the stream, e.g. before forking.
    pub fn flush(&self) {
        let mut sink = self.sink.lock().unwrap_or_else(PoisonError::into_inner);
        if let Err(err) = sink.flush() {
            fatal(&err)
        }
    }

    fn write_line(&self, line: &str) {
        let mut sink = self.sink.lock().unwrap_or_else(PoisonError::into_inner);
        if let Err(err) = writeln!(sink, "{line}").and_then(|()| sink.flush()) {
            fatal(&err)
        }
    }
}

/// Losing the result stream leaves nothing to report through.
fn fatal(err: &io::Error) -> ! {
    eprintln!("kconftest: cannot write to the result stream: {err}");
    std::process::exit(EXIT_BROK)
}

/// Anything holding a [`Reporter`], so that the `expect_*!` macros accept
/// a test context as well as a bare reporter.
pub trait Report {
    fn reporter(&self) -> &Reporter;
}

impl Report for Reporter {
    fn reporter(&self) -> &Reporter {
        self
    }
}

impl<R: Report + ?Sized> Report for &R {
    fn reporter(&self) -> &Reporter {
        (**self).reporter()
    }
}

impl<R: Report + ?Sized> Report for &mut R {
    fn reporter(&self) -> &Reporter {
        (**self).reporter()
    }
}
