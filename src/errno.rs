//! Matching observed errno values against a set of expected ones.

use std::{borrow::Cow, fmt::Display};

use nix::errno::Errno;

/// Return the symbolic name of a raw errno value, e.g. `ENOENT` for 2.
///
/// Values unknown to the platform are rendered as their number.
pub fn errno_name(errno: i32) -> Cow<'static, str> {
    if errno == 0 {
        return Cow::Borrowed("SUCCESS");
    }

    match Errno::from_raw(errno) {
        Errno::UnknownErrno => Cow::Owned(errno.to_string()),
        known => Cow::Owned(format!("{known:?}")),
    }
}

/// An ordered set of errno values a failing call may return.
/// Duplicates are allowed but have no effect.
///
/// Values are kept raw, so that numbers the platform has no name for still
/// only match themselves.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ErrnoSet<'a>(Cow<'a, [i32]>);

impl<'a> ErrnoSet<'a> {
    pub fn new(errnos: &'a [i32]) -> Self {
        Self(Cow::Borrowed(errnos))
    }

    /// Whether `errno` literally equals one of the expected values.
    pub fn contains(&self, errno: i32) -> bool {
        self.0.contains(&errno)
    }

    /// Comma separated symbolic names of the expected values.
    pub fn names(&self) -> String {
        self.0
            .iter()
            .map(|&errno| errno_name(errno))
            .collect::<Vec<_>>()
            .join(", ")
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl From<Errno> for ErrnoSet<'static> {
    fn from(errno: Errno) -> Self {
        Self(Cow::Owned(vec![errno as i32]))
    }
}

impl From<&[Errno]> for ErrnoSet<'static> {
    fn from(errnos: &[Errno]) -> Self {
        Self(errnos.iter().map(|&errno| errno as i32).collect())
    }
}

impl<const N: usize> From<&[Errno; N]> for ErrnoSet<'static> {
    fn from(errnos: &[Errno; N]) -> Self {
        Self::from(errnos.as_slice())
    }
}

impl From<i32> for ErrnoSet<'static> {
    fn from(errno: i32) -> Self {
        Self(Cow::Owned(vec![errno]))
    }
}

impl<'a> From<&'a [i32]> for ErrnoSet<'a> {
    fn from(errnos: &'a [i32]) -> Self {
        Self::new(errnos)
    }
}

impl<'a, const N: usize> From<&'a [i32; N]> for ErrnoSet<'a> {
    fn from(errnos: &'a [i32; N]) -> Self {
        Self::new(errnos)
    }
}

impl Display for ErrnoSet<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.names())
    }
}

#[cfg(test)]
mod tests {
    use nix::errno::Errno;

    use super::{errno_name, ErrnoSet};

    #[test]
    fn contains() {
        let set = ErrnoSet::from(&[Errno::EPERM, Errno::EACCES]);

        assert!(set.contains(Errno::EACCES as i32));
        assert!(set.contains(Errno::EPERM as i32));
        assert!(!set.contains(Errno::ENOENT as i32));
        assert!(!set.contains(0));
    }

    #[test]
    fn empty_set_contains_nothing() {
        let set = ErrnoSet::new(&[]);

        assert!(set.is_empty());
        assert!(!set.contains(0));
        assert!(!set.contains(Errno::EPERM as i32));
        assert_eq!(set.names(), "");
    }

    #[test]
    fn duplicates_are_harmless() {
        let set = ErrnoSet::from(&[Errno::EINVAL, Errno::EINVAL]);

        assert_eq!(set.len(), 2);
        assert!(set.contains(Errno::EINVAL as i32));
    }

    #[test]
    fn names() {
        let errnos = [Errno::from_raw(2), Errno::from_raw(13)];
        let set = ErrnoSet::from(&errnos);
        let names = set.names();

        assert!(names.contains("ENOENT"));
        assert!(names.contains("EACCES"));
        assert_eq!(names, "ENOENT, EACCES");
        assert_eq!(set.to_string(), names);
    }

    #[test]
    fn long_names_are_not_truncated() {
        let errnos = [Errno::ENOTRECOVERABLE; 8];
        let names = ErrnoSet::from(&errnos).names();

        assert_eq!(names.matches("ENOTRECOVERABLE").count(), 8);
    }

    #[test]
    fn single_errno() {
        let set = ErrnoSet::from(Errno::EBADF);

        assert!(set.contains(libc_ebadf()));
        assert_eq!(set.names(), "EBADF");
    }

    fn libc_ebadf() -> i32 {
        nix::libc::EBADF
    }

    #[test]
    fn unknown_values_only_match_themselves() {
        let errnos = [9999, nix::libc::ENOENT];
        let set = ErrnoSet::from(&errnos);

        assert!(set.contains(9999));
        assert!(!set.contains(0));
        assert_eq!(set.names(), "9999, ENOENT");

        let set = ErrnoSet::from(0i32);
        assert!(set.contains(0));
        assert_eq!(set.names(), "SUCCESS");
    }

    #[test]
    fn unknown_and_zero() {
        assert_eq!(errno_name(0), "SUCCESS");
        assert_eq!(errno_name(9999), "9999");
        assert_eq!(errno_name(nix::libc::ENOENT), "ENOENT");
    }
}
