use std::path::Path;

use nix::{
    mount::{mount, umount2, MntFlags, MsFlags},
    sys::stat::lstat,
};

/// Wrapper for `rmdir`, which nix does not expose.
pub fn rmdir<P: ?Sized + nix::NixPath>(path: &P) -> nix::Result<()> {
    // SAFETY: `cstr` is a valid NUL terminated path for the duration of the call.
    let res = path.with_nix_path(|cstr| unsafe { nix::libc::rmdir(cstr.as_ptr()) })?;
    nix::errno::Errno::result(res).map(std::mem::drop)
}

/// Wrapper for `mount(fs_type, target, fs_type, 0, NULL)`, mounting a fresh
/// instance of a virtual file system such as `tmpfs`.
pub fn mount_fs<P: ?Sized + nix::NixPath>(fs_type: &str, target: &P) -> nix::Result<()> {
    mount(
        Some(fs_type),
        target,
        Some(fs_type),
        MsFlags::empty(),
        None::<&str>,
    )
}

/// Wrapper for `mount(source, target, "none", MS_BIND, NULL)`.
pub fn bind_mount<P1, P2>(source: &P1, target: &P2) -> nix::Result<()>
where
    P1: ?Sized + nix::NixPath,
    P2: ?Sized + nix::NixPath,
{
    mount(
        Some(source),
        target,
        Some("none"),
        MsFlags::MS_BIND,
        None::<&str>,
    )
}

/// Wrapper for `umount2(target, 0)`.
pub fn umount<P: ?Sized + nix::NixPath>(target: &P) -> nix::Result<()> {
    umount2(target, MntFlags::empty())
}

/// Whether `path` is the root of a mount, i.e. lives on another device than its parent.
pub fn is_mountpoint(path: &Path) -> nix::Result<bool> {
    let Some(parent) = path.parent() else {
        return Ok(true);
    };

    Ok(lstat(path)?.st_dev != lstat(parent)?.st_dev)
}
