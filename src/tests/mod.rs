//! Test programs shipped with the harness.

use nix::sys::utsname::uname;

pub mod fanotify;

/// `major.minor` of a kernel release string such as `6.1.0-13-amd64`.
fn parse_kernel_release(release: &str) -> Option<(u32, u32)> {
    let mut numbers = release
        .split(|c: char| !c.is_ascii_digit())
        .map(str::parse::<u32>);

    match (numbers.next(), numbers.next()) {
        (Some(Ok(major)), Some(Ok(minor))) => Some((major, minor)),
        _ => None,
    }
}

/// Whether the running kernel is older than `major.minor`. Unknown versions are not.
pub fn kernel_older_than(major: u32, minor: u32) -> bool {
    let Ok(uts) = uname() else {
        return false;
    };

    let release = uts.release().to_string_lossy();
    match parse_kernel_release(&release) {
        Some(version) => version < (major, minor),
        None => {
            tracing::debug!(%release, "cannot parse kernel release");
            false
        }
    }
}

#[cfg(test)]
mod tests {
    use super::parse_kernel_release;

    #[test]
    fn kernel_release() {
        assert_eq!(parse_kernel_release("6.1.0-13-amd64"), Some((6, 1)));
        assert_eq!(parse_kernel_release("5.10.102.1-microsoft-standard-WSL2"), Some((5, 10)));
        assert_eq!(parse_kernel_release("4.19"), Some((4, 19)));
        assert_eq!(parse_kernel_release("unknown"), None);
    }
}
