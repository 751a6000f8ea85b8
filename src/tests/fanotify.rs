//! Ignore masks of fanotify marks.
//!
//! Check that fanotify merges the ignore mask of a mark with the mask of a mark
//! of another type on the same group. Groups of the first priority class have
//! no ignore mark and always get the event, the others only when the ignore
//! mark does not cover the object the event happens on.

use std::{fs, path::Path};

use kconftest::{
    bail_brok, bail_conf,
    features::{KernelFeature, FAN_MARK_FILESYSTEM, FAN_MARK_IGNORE_SURV},
    report,
    test::{MountRequirement, Safe, Tag, TestContext, TestDescriptor, TestError, TestProgram, TestResult},
    utils::{bind_mount, umount},
};
use nix::{
    errno::Errno,
    sys::fanotify::{EventFFlags, Fanotify, FanotifyEvent, InitFlags, MarkFlags, MaskFlags},
    unistd::Pid,
};

use super::kernel_older_than;

const MOUNT_PATH: &str = "fs_mnt";
const MNT2_PATH: &str = "mntpoint";
const DIR_PATH: &str = "fs_mnt/testdir";
const FILE_PATH: &str = "fs_mnt/testdir/testfile";
const FILE2_PATH: &str = "fs_mnt/testdir/testfile2";
const FILE_MNT2: &str = "mntpoint/testdir/testfile";

const GROUPS_PER_PRIO: usize = 3;

const CLASSES: [(InitFlags, &str); 3] = [
    (InitFlags::FAN_CLASS_PRE_CONTENT, "FAN_CLASS_PRE_CONTENT"),
    (InitFlags::FAN_CLASS_CONTENT, "FAN_CLASS_CONTENT"),
    (InitFlags::FAN_CLASS_NOTIF, "FAN_CLASS_NOTIF"),
];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum MarkType {
    Inode,
    /// Inode mark on a directory, watching its children when asked to.
    Parent,
    Mount,
    Filesystem,
}

impl MarkType {
    fn flags(self) -> MarkFlags {
        match self {
            MarkType::Inode | MarkType::Parent => MarkFlags::empty(),
            MarkType::Mount => MarkFlags::FAN_MARK_MOUNT,
            MarkType::Filesystem => MarkFlags::from_bits_retain(FAN_MARK_FILESYSTEM),
        }
    }

    fn name(self) -> &'static str {
        match self {
            MarkType::Inode => "FAN_MARK_INODE",
            MarkType::Parent => "FAN_MARK_PARENT",
            MarkType::Mount => "FAN_MARK_MOUNT",
            MarkType::Filesystem => "FAN_MARK_FILESYSTEM",
        }
    }
}

struct Case {
    name: &'static str,
    mark_path: &'static str,
    mark_type: MarkType,
    ignore_path: &'static str,
    ignore_type: MarkType,
    ignored_flags: MaskFlags,
    event_path: &'static str,
    expected_with_ignore: MaskFlags,
    expected_without_ignore: MaskFlags,
}

const NONE: MaskFlags = MaskFlags::empty();
const OPEN: MaskFlags = MaskFlags::FAN_OPEN;
const ON_CHILD: MaskFlags = MaskFlags::FAN_EVENT_ON_CHILD;

const CASES: [Case; 10] = [
    Case {
        name: "ignore mount events created on a specific file",
        mark_path: MOUNT_PATH,
        mark_type: MarkType::Mount,
        ignore_path: FILE_MNT2,
        ignore_type: MarkType::Inode,
        ignored_flags: NONE,
        event_path: FILE_PATH,
        expected_with_ignore: NONE,
        expected_without_ignore: OPEN,
    },
    Case {
        name: "don't ignore mount events created on another file",
        mark_path: MOUNT_PATH,
        mark_type: MarkType::Mount,
        ignore_path: FILE_PATH,
        ignore_type: MarkType::Inode,
        ignored_flags: NONE,
        event_path: FILE2_PATH,
        expected_with_ignore: OPEN,
        expected_without_ignore: OPEN,
    },
    Case {
        name: "ignore inode events created on a specific mount point",
        mark_path: FILE_PATH,
        mark_type: MarkType::Inode,
        ignore_path: MNT2_PATH,
        ignore_type: MarkType::Mount,
        ignored_flags: NONE,
        event_path: FILE_MNT2,
        expected_with_ignore: NONE,
        expected_without_ignore: OPEN,
    },
    Case {
        name: "don't ignore inode events created on another mount point",
        mark_path: FILE_MNT2,
        mark_type: MarkType::Inode,
        ignore_path: MNT2_PATH,
        ignore_type: MarkType::Mount,
        ignored_flags: NONE,
        event_path: FILE_PATH,
        expected_with_ignore: OPEN,
        expected_without_ignore: OPEN,
    },
    Case {
        name: "ignore fs events created on a specific file",
        mark_path: MOUNT_PATH,
        mark_type: MarkType::Filesystem,
        ignore_path: FILE_PATH,
        ignore_type: MarkType::Inode,
        ignored_flags: NONE,
        event_path: FILE_PATH,
        expected_with_ignore: NONE,
        expected_without_ignore: OPEN,
    },
    Case {
        name: "don't ignore fs events created on another file",
        mark_path: MOUNT_PATH,
        mark_type: MarkType::Filesystem,
        ignore_path: FILE_PATH,
        ignore_type: MarkType::Inode,
        ignored_flags: NONE,
        event_path: FILE2_PATH,
        expected_with_ignore: OPEN,
        expected_without_ignore: OPEN,
    },
    Case {
        name: "ignore fs events created on a specific mount point",
        mark_path: MOUNT_PATH,
        mark_type: MarkType::Filesystem,
        ignore_path: MNT2_PATH,
        ignore_type: MarkType::Mount,
        ignored_flags: NONE,
        event_path: FILE_MNT2,
        expected_with_ignore: NONE,
        expected_without_ignore: OPEN,
    },
    Case {
        name: "don't ignore fs events created on another mount point",
        mark_path: MOUNT_PATH,
        mark_type: MarkType::Filesystem,
        ignore_path: MNT2_PATH,
        ignore_type: MarkType::Mount,
        ignored_flags: NONE,
        event_path: FILE_PATH,
        expected_with_ignore: OPEN,
        expected_without_ignore: OPEN,
    },
    Case {
        name: "ignore events on file created inside a parent watching children",
        mark_path: FILE_PATH,
        mark_type: MarkType::Inode,
        ignore_path: DIR_PATH,
        ignore_type: MarkType::Parent,
        ignored_flags: ON_CHILD,
        event_path: FILE_PATH,
        expected_with_ignore: NONE,
        expected_without_ignore: OPEN,
    },
    Case {
        name: "don't ignore events on file created inside a parent not watching children",
        mark_path: FILE_PATH,
        mark_type: MarkType::Inode,
        ignore_path: DIR_PATH,
        ignore_type: MarkType::Parent,
        ignored_flags: NONE,
        event_path: FILE_PATH,
        expected_with_ignore: OPEN,
        expected_without_ignore: OPEN,
    },
];

/// `fanotify_mark`, `FAN_MARK_FILESYSTEM` being not applicable on some file systems.
#[track_caller]
fn mark(group: &Fanotify, flags: MarkFlags, mask: MaskFlags, path: &Path) -> TestResult {
    match group.mark(flags, mask, None, Some(path)) {
        Ok(()) => Ok(()),
        Err(Errno::ENODEV | Errno::EOPNOTSUPP | Errno::EXDEV)
            if flags.contains(MarkFlags::from_bits_retain(FAN_MARK_FILESYSTEM)) =>
        {
            Err(TestError::conf(format!(
                "FAN_MARK_FILESYSTEM not supported on {}",
                path.display()
            )))
        }
        Err(errno) => Err(TestError::broken_errno(
            errno,
            format!(
                "fanotify_mark({}, {:#x}, {:#x}) failed",
                path.display(),
                flags.bits(),
                mask.bits()
            ),
        )),
    }
}

#[derive(Default)]
struct IgnoreMask {
    bind_mounted: bool,
}

impl IgnoreMask {
    /// Flags of the ignore mark for the current variant:
    /// the legacy ignored mask, or `FAN_MARK_IGNORE`.
    fn ignore_flags(variant: usize) -> MarkFlags {
        if variant == 0 {
            MarkFlags::FAN_MARK_IGNORED_MASK | MarkFlags::FAN_MARK_IGNORED_SURV_MODIFY
        } else {
            MarkFlags::from_bits_retain(FAN_MARK_IGNORE_SURV)
        }
    }

    fn add_ignore_marks(ctx: &TestContext<'_>, group: &Fanotify, tc: &Case) -> TestResult {
        let legacy = ctx.variant() == 0;
        let ignored_onchild = tc.ignored_flags.contains(ON_CHILD);
        let flags = MarkFlags::FAN_MARK_ADD | tc.ignore_type.flags();
        let path = ctx.path(tc.ignore_path);

        mark(
            group,
            flags | Self::ignore_flags(ctx.variant()),
            OPEN | tc.ignored_flags,
            &path,
        )?;

        // A legacy ignored mask on a parent only applies to events on children
        // when the mark mask watches them.
        if legacy && ignored_onchild {
            return mark(group, flags, OPEN | tc.ignored_flags, &path);
        }

        // FAN_EVENT_ON_CHILD in the mark mask must not affect FAN_MARK_IGNORE.
        if !legacy && tc.ignore_type == MarkType::Parent {
            let mask = if !ignored_onchild {
                MaskFlags::FAN_CLOSE_WRITE | ON_CHILD | MaskFlags::FAN_ONDIR
            } else if tc.mark_type == MarkType::Parent {
                return Ok(());
            } else {
                MaskFlags::FAN_CLOSE | MaskFlags::FAN_ONDIR
            };
            return mark(group, flags, mask, &path);
        }

        Ok(())
    }

    fn create_groups(ctx: &TestContext<'_>, tc: &Case) -> Result<Vec<Vec<Fanotify>>, TestError> {
        let mut groups = Vec::with_capacity(CLASSES.len());

        for (p, (class, _)) in CLASSES.iter().enumerate() {
            let mut prio = Vec::with_capacity(GROUPS_PER_PRIO);

            for _ in 0..GROUPS_PER_PRIO {
                let group = Fanotify::init(*class | InitFlags::FAN_NONBLOCK, EventFFlags::O_RDONLY)
                    .safe("fanotify_init")?;

                // FAN_EVENT_ON_CHILD has no effect on file system, mount or
                // non-directory inode marks.
                mark(
                    &group,
                    MarkFlags::FAN_MARK_ADD | tc.mark_type.flags(),
                    tc.expected_without_ignore | ON_CHILD | MaskFlags::FAN_ONDIR,
                    &ctx.path(tc.mark_path),
                )?;

                if p > 0 {
                    Self::add_ignore_marks(ctx, &group, tc)?;
                }
                prio.push(group);
            }
            groups.push(prio);
        }

        Ok(groups)
    }

    /// Open `path` from a child, returning its pid.
    fn generate_event(ctx: &mut TestContext<'_>, path: &Path) -> Result<Pid, TestError> {
        let exit = ctx.fork_child(|_| {
            fs::File::open(path).safe("open")?;
            Ok(())
        })?;

        if !exit.success() {
            bail_brok!("Child process terminated incorrectly");
        }

        Ok(exit.pid)
    }

    fn verify_event(
        ctx: &TestContext<'_>,
        p: usize,
        group: usize,
        event: &FanotifyEvent,
        expected: MaskFlags,
        child: Pid,
    ) {
        let class = CLASSES[p].1;
        let mask = event.mask().bits();
        // Only FID reporting groups get FAN_ONDIR.
        let expected = (expected - MaskFlags::FAN_ONDIR).bits();

        if mask != expected {
            report!(
                ctx,
                Fail,
                "group {group} ({class}) got event: mask {mask:x} (expected {expected:x}) pid={}",
                event.pid()
            );
        } else if event.pid() != child.as_raw() {
            report!(
                ctx,
                Fail,
                "group {group} ({class}) got event: mask {mask:x} pid={} (expected {child})",
                event.pid()
            );
        } else {
            report!(
                ctx,
                Pass,
                "group {group} ({class}) got event: mask {mask:x} pid={}",
                event.pid()
            );
        }
    }
}

impl TestProgram for IgnoreMask {
    fn setup(&mut self, ctx: &mut TestContext<'_>) -> TestResult {
        fs::create_dir(ctx.path(DIR_PATH)).safe("mkdir(testdir)")?;
        fs::write(ctx.path(FILE_PATH), "1").safe("write(testfile)")?;
        fs::write(ctx.path(FILE2_PATH), "1").safe("write(testfile2)")?;

        // Another bind mount, to generate events through another mount point.
        fs::create_dir(ctx.path(MNT2_PATH)).safe("mkdir(mntpoint)")?;
        bind_mount(&ctx.path(MOUNT_PATH), &ctx.path(MNT2_PATH)).safe("mount(MS_BIND)")?;
        self.bind_mounted = true;

        Ok(())
    }

    fn run(&mut self, ctx: &mut TestContext<'_>, case: usize) -> TestResult {
        let tc = &CASES[case];
        report!(ctx, Info, "Test #{case}: {}", tc.name);

        if tc.mark_type == MarkType::Filesystem {
            ctx.require_feature(KernelFeature::FanotifyFilesystemMark)?;
        }
        if ctx.variant() == 1 {
            ctx.require_feature(KernelFeature::FanotifyMarkIgnore)?;
        }
        if tc.ignored_flags.contains(ON_CHILD) && kernel_older_than(5, 9) {
            bail_conf!(
                "ignored mask in combination with flag FAN_EVENT_ON_CHILD has undefined behavior on kernel < 5.9"
            );
        }

        // Groups are closed when dropped at the end of the case, along with their marks.
        let groups = Self::create_groups(ctx, tc)?;
        let event_path = ctx.path(tc.event_path);
        let child = Self::generate_event(ctx, &event_path)?;
        let mark_name = tc.mark_type.name();
        let ignore_name = tc.ignore_type.name();

        // Groups without a matching ignore mask got the event.
        for (p, prio) in groups.iter().enumerate() {
            if p > 0 && tc.expected_with_ignore.is_empty() {
                break;
            }

            let class = CLASSES[p].1;
            let expected = if p == 0 {
                tc.expected_without_ignore
            } else {
                tc.expected_with_ignore
            };

            for (i, group) in prio.iter().enumerate() {
                match group.read_events() {
                    Err(Errno::EAGAIN) => {
                        report!(ctx, Fail, "group {i} ({class}) with {mark_name} did not get event")
                    }
                    Err(errno) => bail_brok!(errno = errno, "reading fanotify events failed"),
                    Ok(events) => match events.as_slice() {
                        [] => report!(
                            ctx,
                            Fail,
                            "group {i} ({class}) with {mark_name} did not get event"
                        ),
                        [event] => Self::verify_event(ctx, p, i, event, expected, child),
                        events => report!(
                            ctx,
                            Fail,
                            "group {i} ({class}) with {mark_name} got more than one event ({})",
                            events.len()
                        ),
                    },
                }
            }
        }

        // Groups with a matching ignore mask did not get the event.
        if tc.expected_with_ignore.is_empty() {
            for (p, prio) in groups.iter().enumerate().skip(1) {
                let class = CLASSES[p].1;

                for (i, group) in prio.iter().enumerate() {
                    match group.read_events() {
                        Ok(events) if !events.is_empty() => report!(
                            ctx,
                            Fail,
                            "group {i} ({class}) with {mark_name} and {ignore_name} ignore mask got unexpected event (mask {:x})",
                            events[0].mask().bits()
                        ),
                        Ok(_) | Err(Errno::EAGAIN) => report!(
                            ctx,
                            Pass,
                            "group {i} ({class}) with {mark_name} and {ignore_name} ignore mask got no event"
                        ),
                        Err(errno) => bail_brok!(errno = errno, "reading fanotify events failed"),
                    }
                }
            }
        }

        Ok(())
    }

    fn cleanup(&mut self, ctx: &mut TestContext<'_>) -> TestResult {
        if self.bind_mounted {
            umount(&ctx.path(MNT2_PATH)).safe("umount(mntpoint)")?;
            self.bind_mounted = false;
        }

        Ok(())
    }
}

fn program() -> Box<dyn TestProgram> {
    Box::<IgnoreMask>::default()
}

inventory::submit! {
    TestDescriptor {
        description: "fanotify merges ignore masks with marks of other types",
        case_count: CASES.len(),
        variant_count: 2,
        forks_children: true,
        mount: Some(MountRequirement::new(MOUNT_PATH)),
        required_features: &[KernelFeature::Fanotify],
        tags: &[
            Tag::new("linux-git", "9bdda4e9cf2d"),
            Tag::new("linux-git", "2f02fd3fa13e"),
        ],
        ..TestDescriptor::new("fanotify_ignore_mask", program)
    }
}

#[cfg(test)]
mod tests {
    use std::{collections::HashSet, io};

    use kconftest::{
        config::Config, driver::Driver, features::KernelProbe, result::Reporter,
        test::TestDescriptor,
    };
    use nix::unistd::Uid;

    use super::{IgnoreMask, MarkType, CASES};

    fn descriptor() -> &'static TestDescriptor {
        inventory::iter::<TestDescriptor>
            .into_iter()
            .find(|descriptor| descriptor.name == "fanotify_ignore_mask")
            .unwrap()
    }

    #[test]
    fn registration() {
        let descriptor = descriptor();

        assert_eq!(descriptor.case_count, CASES.len());
        assert_eq!(descriptor.variant_count, 2);
        assert!(descriptor.needs_root());
        assert!(descriptor.forks_children);
    }

    #[test]
    fn cases_without_ignore_expect_the_event() {
        for tc in &CASES {
            assert!(!tc.expected_without_ignore.is_empty(), "{}", tc.name);
            assert!(
                tc.expected_with_ignore.is_empty()
                    || tc.expected_with_ignore == tc.expected_without_ignore
            );
        }
        assert!(CASES.iter().any(|tc| tc.ignore_type == MarkType::Parent));
    }

    #[test]
    fn variants_use_different_ignore_flags() {
        assert_ne!(IgnoreMask::ignore_flags(0), IgnoreMask::ignore_flags(1));
    }

    #[test]
    fn unsupported_fanotify_is_not_a_failure() {
        let reporter = Reporter::new(Box::new(io::sink())).unwrap();
        let config = Config::default();
        let probe = HashSet::new();

        let counts = Driver::new(&reporter, &config, &probe).run(descriptor());

        assert_eq!(counts.failed, 0);
        assert_eq!(counts.broken, 0);
        assert!(counts.skipped > 0);
    }

    #[test]
    fn ignore_mask() {
        if !Uid::effective().is_root() {
            return;
        }

        let reporter = Reporter::new(Box::new(io::sink())).unwrap();
        let config = Config::default();
        let probe = KernelProbe::default();

        let counts = Driver::new(&reporter, &config, &probe).run(descriptor());

        // Mounting may not be allowed, but a mismatch always is a failure.
        assert_eq!(counts.failed, 0);
    }
}
