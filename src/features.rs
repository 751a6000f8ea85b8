use std::{
    cell::RefCell,
    collections::{HashMap, HashSet},
};

use serde::{Deserialize, Serialize};

/// `FAN_MARK_FILESYSTEM`, mark the whole file system of the path.
pub const FAN_MARK_FILESYSTEM: u32 = 0x0000_0100;
/// `FAN_MARK_IGNORE | FAN_MARK_IGNORED_SURV_MODIFY`, the ignore mask flavour
/// which honours `FAN_EVENT_ON_CHILD` and `FAN_ONDIR`.
pub const FAN_MARK_IGNORE_SURV: u32 = 0x0000_0440;

/// Kernel features which are not available on every kernel.
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Hash,
    strum::Display,
    strum::EnumIter,
    strum::EnumMessage,
    Serialize,
    Deserialize,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum KernelFeature {
    /// The fanotify API is available and usable by the caller
    Fanotify,
    /// fanotify marks can be set on a whole file system (FAN_MARK_FILESYSTEM)
    FanotifyFilesystemMark,
    /// The FAN_MARK_IGNORE flag is supported, Linux 6.0 and later
    FanotifyMarkIgnore,
}

/// Answers whether a kernel feature is supported.
/// Unsupported features make the dependent cases `TCONF`, never `TFAIL`.
pub trait CapabilityProbe {
    fn supported(&self, feature: KernelFeature) -> bool;
}

/// Probes the running kernel, caching the answers.
#[derive(Debug, Default)]
pub struct KernelProbe {
    disabled: HashSet<KernelFeature>,
    cache: RefCell<HashMap<KernelFeature, bool>>,
}

impl KernelProbe {
    /// Create a probe which reports `disabled` features as unsupported without probing.
    pub fn new(disabled: HashSet<KernelFeature>) -> Self {
        Self {
            disabled,
            cache: RefCell::default(),
        }
    }

    #[cfg(fanotify)]
    fn probe(feature: KernelFeature) -> bool {
        use nix::sys::fanotify::{EventFFlags, Fanotify, InitFlags, MarkFlags, MaskFlags};

        let group = match Fanotify::init(InitFlags::FAN_CLASS_NOTIF, EventFFlags::O_RDONLY) {
            Ok(group) => group,
            Err(err) => {
                tracing::debug!(%feature, %err, "fanotify_init failed");
                return false;
            }
        };

        let flags = match feature {
            KernelFeature::Fanotify => return true,
            KernelFeature::FanotifyFilesystemMark => {
                MarkFlags::FAN_MARK_ADD | MarkFlags::from_bits_retain(FAN_MARK_FILESYSTEM)
            }
            KernelFeature::FanotifyMarkIgnore => {
                MarkFlags::FAN_MARK_ADD | MarkFlags::from_bits_retain(FAN_MARK_IGNORE_SURV)
            }
        };

        match group.mark(flags, MaskFlags::FAN_OPEN, None, Some("/")) {
            Ok(()) => true,
            Err(err) => {
                tracing::debug!(%feature, %err, "fanotify_mark failed");
                false
            }
        }
    }

    #[cfg(not(fanotify))]
    fn probe(_feature: KernelFeature) -> bool {
        false
    }
}

impl CapabilityProbe for KernelProbe {
    fn supported(&self, feature: KernelFeature) -> bool {
        if self.disabled.contains(&feature) {
            return false;
        }

        *self
            .cache
            .borrow_mut()
            .entry(feature)
            .or_insert_with(|| Self::probe(feature))
    }
}

/// Answers from a fixed set, for tests and dry runs.
impl CapabilityProbe for HashSet<KernelFeature> {
    fn supported(&self, feature: KernelFeature) -> bool {
        self.contains(&feature)
    }
}

#[cfg(capabilities)]
pub use caps::Capability;

/// Process capabilities, only known on Linux.
#[cfg(not(capabilities))]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Capability {}

/// Whether the effective set of the process holds `cap`.
#[cfg(capabilities)]
pub fn has_capability(cap: Capability) -> bool {
    caps::has_cap(None, caps::CapSet::Effective, cap).unwrap_or(false)
}

#[cfg(not(capabilities))]
pub fn has_capability(cap: Capability) -> bool {
    match cap {}
}

#[cfg(test)]
mod tests {
    use std::collections::HashSet;

    use strum::IntoEnumIterator;

    use super::{CapabilityProbe, KernelFeature, KernelProbe};

    #[test]
    fn disabled_features_are_unsupported() {
        let probe = KernelProbe::new(KernelFeature::iter().collect());

        for feature in KernelFeature::iter() {
            assert!(!probe.supported(feature));
        }
    }

    #[test]
    fn answers_are_cached() {
        let probe = KernelProbe::default();
        let first = probe.supported(KernelFeature::FanotifyMarkIgnore);

        assert_eq!(probe.supported(KernelFeature::FanotifyMarkIgnore), first);
        assert_eq!(probe.cache.borrow().len(), 1);
    }

    #[test]
    fn names() {
        assert_eq!(
            KernelFeature::FanotifyFilesystemMark.to_string(),
            "fanotify_filesystem_mark"
        );

        let fixed: HashSet<_> = [KernelFeature::Fanotify].into();
        assert!(fixed.supported(KernelFeature::Fanotify));
        assert!(!fixed.supported(KernelFeature::FanotifyMarkIgnore));
    }
}
