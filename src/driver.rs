//! Lifecycle of a test program: requirement checks, fixtures, setup, the
//! variant and case loop, cleanup and the summary.

use std::{
    any::Any,
    cell::{Cell, RefCell},
    panic::{catch_unwind, set_hook, take_hook, AssertUnwindSafe},
    sync::Once,
};

use nix::unistd::Uid;

use crate::{
    config::Config,
    context::TestContext,
    features::{has_capability, CapabilityProbe},
    result::{Reporter, ResultCounts, ResultKind, SourceLocation},
    test::{TestDescriptor, TestError, TestProgram, TestResult},
};

thread_local! {
    static PANIC_LOCATION: RefCell<Option<SourceLocation>> = const { RefCell::new(None) };
    static GUARDED: Cell<bool> = const { Cell::new(false) };
}

/// Record the location of panics, so that they are reported where they happened.
///
/// Panics raised while a test program runs are reported as `TBROK` records
/// and not printed by the default hook.
pub fn install_panic_hook() {
    static INSTALL: Once = Once::new();

    INSTALL.call_once(|| {
        let previous = take_hook();
        set_hook(Box::new(move |info| {
            if let Some(location) = info.location() {
                PANIC_LOCATION.with(|cell| {
                    cell.replace(Some(SourceLocation::owned(
                        location.file().to_owned(),
                        location.line(),
                    )))
                });
            }

            if !GUARDED.with(Cell::get) {
                previous(info);
            }
        }));
    });
}

/// Run `f`, turning a panic into a broken run.
pub(crate) fn guarded<F>(f: F) -> TestResult
where
    F: FnOnce() -> TestResult,
{
    let outer = GUARDED.with(|guarded| guarded.replace(true));
    let result = catch_unwind(AssertUnwindSafe(f));
    GUARDED.with(|guarded| guarded.set(outer));

    result.unwrap_or_else(|payload| Err(panic_error(payload)))
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    payload
        .downcast_ref::<String>()
        .cloned()
        .or_else(|| payload.downcast_ref::<&str>().map(|&s| s.to_string()))
        .unwrap_or_default()
}

fn panic_error(payload: Box<dyn Any + Send>) -> TestError {
    let location = PANIC_LOCATION
        .with(RefCell::take)
        .unwrap_or_else(|| SourceLocation::new("<unknown>", 0));

    TestError::Broken {
        message: format!("Test panicked: {}", panic_message(payload.as_ref())),
        errno: None,
        location,
    }
}

/// Report a caught panic as `TBROK`.
pub(crate) fn report_panic(reporter: &Reporter, payload: Box<dyn Any + Send>) {
    panic_error(payload).report(reporter);
}

/// Runs test programs against a reporter.
pub struct Driver<'a> {
    reporter: &'a Reporter,
    config: &'a Config,
    probe: &'a dyn CapabilityProbe,
}

impl<'a> Driver<'a> {
    pub fn new(reporter: &'a Reporter, config: &'a Config, probe: &'a dyn CapabilityProbe) -> Self {
        install_panic_hook();

        Self {
            reporter,
            config,
            probe,
        }
    }

    /// Run a registered test program and return its counts.
    pub fn run(&self, descriptor: &TestDescriptor) -> ResultCounts {
        let mut program = (descriptor.program)();
        self.run_program(descriptor, program.as_mut())
    }

    /// Run `program` as described by `descriptor`, from a zeroed set of counters
    /// to the printed summary.
    pub fn run_program(
        &self,
        descriptor: &TestDescriptor,
        program: &mut dyn TestProgram,
    ) -> ResultCounts {
        self.reporter.reset();
        tracing::info!(program = descriptor.name, "starting");

        self.execute(descriptor, program);

        self.reporter.print_summary();
        let counts = self.reporter.counts();
        if (counts.failed > 0 || counts.broken > 0) && !descriptor.tags.is_empty() {
            self.print_hints(descriptor);
        }

        tracing::info!(program = descriptor.name, ?counts, "finished");
        counts
    }

    fn execute(&self, descriptor: &TestDescriptor, program: &mut dyn TestProgram) {
        if let Err(err) = self.check_requirements(descriptor) {
            err.report(self.reporter);
            return;
        }

        let mut ctx = match TestContext::new(self.reporter, self.config, self.probe, descriptor) {
            Ok(ctx) => ctx,
            Err(err) => {
                TestError::broken(err.to_string()).report(self.reporter);
                return;
            }
        };

        match guarded(|| program.setup(&mut ctx)) {
            Ok(()) => self.run_cases(descriptor, program, &mut ctx),
            Err(err) => err.report(self.reporter),
        }

        if let Err(err) = guarded(|| program.cleanup(&mut ctx)) {
            self.reporter.report(
                ResultKind::Warn,
                err.location().clone(),
                format_args!("cleanup: {err}"),
            );
        }
    }

    fn check_requirements(&self, descriptor: &TestDescriptor) -> TestResult {
        if descriptor.needs_root() && !Uid::effective().is_root() {
            return Err(TestError::conf("Test needs to be run as root"));
        }

        if let Some(cap) = descriptor
            .required_caps
            .iter()
            .find(|&&cap| !has_capability(cap))
        {
            return Err(TestError::conf(format!("Test needs {cap:?}")));
        }

        if let Some(feature) = descriptor
            .required_features
            .iter()
            .find(|&&feature| !self.probe.supported(feature))
        {
            return Err(TestError::conf(format!(
                "{feature} not supported by the kernel"
            )));
        }

        Ok(())
    }

    fn run_cases(
        &self,
        descriptor: &TestDescriptor,
        program: &mut dyn TestProgram,
        ctx: &mut TestContext<'_>,
    ) {
        for variant in 0..descriptor.variant_count {
            ctx.set_variant(variant);
            if descriptor.variant_count > 1 {
                tracing::info!(program = descriptor.name, variant, "running variant");
            }

            for case in 0..descriptor.case_count {
                let before = self.reporter.counts().total();

                let result = guarded(|| program.run(ctx, case));
                // A broken child outranks whatever the case itself returned.
                let result = match (result, ctx.reap_children()) {
                    (_, Err(err @ TestError::Broken { .. })) => Err(err),
                    (result, _) => result,
                };

                match result {
                    Ok(()) if self.reporter.counts().total() == before => {
                        TestError::broken(format!("Test {case} haven't reported results!"))
                            .report(self.reporter);
                        return;
                    }
                    Ok(()) => {}
                    Err(err @ TestError::Conf { .. }) => err.report(self.reporter),
                    Err(err) => {
                        err.report(self.reporter);
                        return;
                    }
                }
            }
        }
    }

    fn print_hints(&self, descriptor: &TestDescriptor) {
        self.reporter
            .write_raw("\nHINT: You _MAY_ be missing kernel fixes, see:\n");
        for tag in descriptor.tags {
            self.reporter.write_raw(tag.hint());
        }
    }
}
