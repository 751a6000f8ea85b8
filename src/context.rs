use std::{
    fs, io,
    os::unix::fs::PermissionsExt,
    panic::{catch_unwind, AssertUnwindSafe},
    path::{Path, PathBuf},
};

use nix::{
    libc,
    sys::{
        signal::{kill, Signal},
        wait::{waitpid, WaitStatus},
    },
    unistd::{fork, ForkResult, Pid},
};
use rand::distributions::{Alphanumeric, DistString};
use tempfile::TempDir;
use thiserror::Error;

use crate::{
    config::Config,
    driver::report_panic,
    features::{CapabilityProbe, KernelFeature},
    pgsize::PageSizeModel,
    result::{Report, Reporter, ResultKind, EXIT_BROK},
    test::{TestDescriptor, TestError, TestResult},
    utils::{is_mountpoint, mount_fs, rmdir, umount},
};

const NUM_RAND_CHARS: usize = 32;

/// Error raised while provisioning the fixtures of a test program.
#[derive(Error, Debug)]
pub enum ContextError {
    #[error("cannot create temporary directory: {0}")]
    TempDir(#[source] io::Error),
    #[error("cannot stage resource file {name}: {source}")]
    Resource { name: String, source: io::Error },
    #[error("cannot create mount point {}: {source}", path.display())]
    Mountpoint { path: PathBuf, source: io::Error },
    #[error("cannot mount {fs_type} on {}: {source}", path.display())]
    Mount {
        fs_type: String,
        path: PathBuf,
        source: nix::Error,
    },
}

/// Exit status of a forked child.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChildExit {
    pub pid: Pid,
    pub status: WaitStatus,
}

impl ChildExit {
    /// Whether the child exited with status 0.
    pub fn success(&self) -> bool {
        matches!(self.status, WaitStatus::Exited(_, 0))
    }
}

/// Fixtures and ambient state of a running test program.
///
/// Dropping the context tears the fixtures down: remaining children are killed,
/// the mount is removed and the temporary directory deleted.
pub struct TestContext<'a> {
    reporter: &'a Reporter,
    config: &'a Config,
    probe: &'a dyn CapabilityProbe,
    descriptor: &'a TestDescriptor,
    base_path: PathBuf,
    temp_dir: Option<TempDir>,
    mountpoint: Option<PathBuf>,
    variant: usize,
    children: Vec<Pid>,
}

impl<'a> TestContext<'a> {
    /// Provision the fixtures `descriptor` asks for.
    pub fn new(
        reporter: &'a Reporter,
        config: &'a Config,
        probe: &'a dyn CapabilityProbe,
        descriptor: &'a TestDescriptor,
    ) -> Result<Self, ContextError> {
        let mut builder = tempfile::Builder::new();
        builder.prefix("kconftest-");
        let temp_dir = match &config.settings.tmpdir {
            Some(dir) => builder.tempdir_in(dir),
            None => builder.tempdir(),
        }
        .map_err(ContextError::TempDir)?;

        let mut ctx = TestContext {
            reporter,
            config,
            probe,
            descriptor,
            base_path: temp_dir.path().to_path_buf(),
            temp_dir: Some(temp_dir),
            mountpoint: None,
            variant: 0,
            children: Vec::new(),
        };
        tracing::debug!(program = descriptor.name, path = %ctx.base_path.display(), "created test directory");

        ctx.stage_resources()?;
        ctx.mount()?;

        Ok(ctx)
    }

    fn stage_resources(&self) -> Result<(), ContextError> {
        if self.descriptor.resource_files.is_empty() {
            return Ok(());
        }

        let resource_dir = self.config.resource_dir();
        for &name in self.descriptor.resource_files {
            fs::copy(resource_dir.join(name), self.path(name)).map_err(|source| {
                ContextError::Resource {
                    name: name.to_owned(),
                    source,
                }
            })?;
            tracing::debug!(name, "staged resource file");
        }

        Ok(())
    }

    fn mount(&mut self) -> Result<(), ContextError> {
        let Some(requirement) = self.descriptor.mount else {
            return Ok(());
        };

        let path = self.path(requirement.mountpoint);
        let fs_type = requirement
            .fs_type
            .unwrap_or(&self.config.settings.mount_fs_type);

        fs::create_dir_all(&path).map_err(|source| ContextError::Mountpoint {
            path: path.clone(),
            source,
        })?;
        mount_fs(fs_type, &path).map_err(|source| ContextError::Mount {
            fs_type: fs_type.to_owned(),
            path: path.clone(),
            source,
        })?;

        tracing::debug!(fs_type, path = %path.display(), "mounted fresh file system");
        self.mountpoint = Some(path);
        Ok(())
    }

    pub fn reporter(&self) -> &'a Reporter {
        self.reporter
    }

    pub fn config(&self) -> &'a Config {
        self.config
    }

    pub fn descriptor(&self) -> &'a TestDescriptor {
        self.descriptor
    }

    /// Index of the variant being run.
    pub fn variant(&self) -> usize {
        self.variant
    }

    pub(crate) fn set_variant(&mut self, variant: usize) {
        self.variant = variant;
    }

    /// Return the base path for this context.
    pub fn base_path(&self) -> &Path {
        &self.base_path
    }

    /// Path of `name` in the test directory.
    pub fn path<P: AsRef<Path>>(&self, name: P) -> PathBuf {
        self.base_path.join(name)
    }

    /// Generate a random path.
    pub fn gen_path(&self) -> PathBuf {
        self.base_path()
            .join(Alphanumeric.sample_string(&mut rand::thread_rng(), NUM_RAND_CHARS))
    }

    /// The fresh mount, if the program asked for one.
    pub fn mountpoint(&self) -> Option<&Path> {
        self.mountpoint.as_deref()
    }

    pub fn supports(&self, feature: KernelFeature) -> bool {
        self.probe.supported(feature)
    }

    /// End the current case with `TCONF` unless `feature` is supported.
    #[track_caller]
    pub fn require_feature(&self, feature: KernelFeature) -> TestResult {
        if self.supports(feature) {
            Ok(())
        } else {
            Err(TestError::conf(format!("{feature} not supported by the kernel")))
        }
    }

    /// The page size model, breaking the run when it cannot be determined.
    #[track_caller]
    pub fn page_size(&self) -> Result<&'static PageSizeModel, TestError> {
        match PageSizeModel::current() {
            Ok(model) => Ok(model),
            Err(err) => Err(TestError::broken(format!(
                "cannot determine page sizes: {err}"
            ))),
        }
    }

    /// Fork a child running `f`, without waiting for it.
    ///
    /// Records the child emits are counted in the parent. The child exits with 0
    /// unless `f` fails or panics, which is reported from the child.
    #[track_caller]
    pub fn spawn_child<F>(&mut self, f: F) -> Result<Pid, TestError>
    where
        F: FnOnce(&Reporter) -> TestResult,
    {
        if !self.descriptor.forks_children {
            return Err(TestError::broken(format!(
                "{} forks a child without declaring forks_children",
                self.descriptor.name
            )));
        }

        // Buffered output would otherwise be written twice.
        self.reporter.flush();

        // SAFETY: the harness is single threaded, the child only runs `f` and exits.
        match unsafe { fork() }? {
            ForkResult::Child => {
                let reporter = self.reporter;
                let code = match catch_unwind(AssertUnwindSafe(|| f(reporter))) {
                    Ok(Ok(())) => 0,
                    Ok(Err(err)) => {
                        err.report(reporter);
                        err.exit_code()
                    }
                    Err(payload) => {
                        report_panic(reporter, payload);
                        EXIT_BROK
                    }
                };
                reporter.flush();

                // SAFETY: skip the parent's atexit handlers and destructors.
                unsafe { libc::_exit(code) }
            }
            ForkResult::Parent { child } => {
                tracing::debug!(pid = %child, "forked child");
                self.children.push(child);
                Ok(child)
            }
        }
    }

    /// Wait for a child forked with [`TestContext::spawn_child`].
    #[track_caller]
    pub fn wait_child(&mut self, pid: Pid) -> Result<ChildExit, TestError> {
        let status = waitpid(pid, None)?;
        self.children.retain(|&child| child != pid);
        tracing::debug!(%pid, ?status, "reaped child");

        Ok(ChildExit { pid, status })
    }

    /// Fork a child running `f` and wait for it.
    #[track_caller]
    pub fn fork_child<F>(&mut self, f: F) -> Result<ChildExit, TestError>
    where
        F: FnOnce(&Reporter) -> TestResult,
    {
        let pid = self.spawn_child(f)?;
        self.wait_child(pid)
    }

    /// Wait for every child still running, a child which did not exit
    /// successfully breaks the run.
    ///
    /// Every child is waited for even when an earlier one fails, the first
    /// failure is returned.
    pub fn reap_children(&mut self) -> TestResult {
        let mut result = Ok(());

        for pid in std::mem::take(&mut self.children) {
            let err = match waitpid(pid, None) {
                Ok(status) if (ChildExit { pid, status }).success() => continue,
                Ok(status) => {
                    tracing::debug!(%pid, ?status, "child exited abnormally");
                    TestError::broken(format!("Reported by child ({pid})"))
                }
                Err(errno) => TestError::broken_errno(errno, format!("waitpid({pid}) failed")),
            };

            if result.is_ok() {
                result = Err(err);
            }
        }

        result
    }

    fn warn(&self, message: impl std::fmt::Display, errno: Option<i32>) {
        let flags = match errno {
            Some(errno) => ResultKind::Warn.with_errno(errno),
            None => ResultKind::Warn.into(),
        };
        self.reporter.report(flags, crate::here!(), message);
    }

    fn kill_children(&mut self) {
        for pid in std::mem::take(&mut self.children) {
            let _ = kill(pid, Signal::SIGKILL);
            if let Err(err) = waitpid(pid, None) {
                self.warn(format_args!("waitpid({pid}) failed"), Some(err as i32));
            }
        }
    }

    /// Unmount the fresh mount unless the program already did, then remove
    /// the mount point.
    fn unmount(&mut self) {
        let Some(path) = self.mountpoint.take() else {
            return;
        };

        match is_mountpoint(&path) {
            Ok(true) => {
                if let Err(err) = umount(&path) {
                    self.warn(
                        format_args!("umount({}) failed", path.display()),
                        Some(err as i32),
                    );
                    return;
                }
            }
            Ok(false) => tracing::debug!(path = %path.display(), "already unmounted"),
            Err(err) => {
                self.warn(
                    format_args!("stat({}) failed", path.display()),
                    Some(err as i32),
                );
                return;
            }
        }

        if let Err(err) = rmdir(&path) {
            self.warn(
                format_args!("rmdir({}) failed", path.display()),
                Some(err as i32),
            );
        }
    }

    /// Restore owner permissions on directories, which tests may have removed.
    fn restore_permissions(&self) {
        for entry in walkdir::WalkDir::new(&self.base_path)
            .into_iter()
            .filter_map(Result::ok)
            .filter(|entry| entry.file_type().is_dir())
        {
            let Ok(metadata) = entry.metadata() else {
                continue;
            };
            let mode = metadata.permissions().mode();
            if mode & 0o700 != 0o700 {
                let _ = fs::set_permissions(
                    entry.path(),
                    fs::Permissions::from_mode(mode | 0o700),
                );
            }
        }
    }
}

impl Report for TestContext<'_> {
    fn reporter(&self) -> &Reporter {
        self.reporter
    }
}

impl Drop for TestContext<'_> {
    fn drop(&mut self) {
        self.kill_children();
        self.unmount();
        self.restore_permissions();

        if let Some(temp_dir) = self.temp_dir.take() {
            if let Err(err) = temp_dir.close() {
                self.warn(
                    format_args!("cannot remove {}: {err}", self.base_path.display()),
                    err.raw_os_error(),
                );
            }
        }
    }
}
