//! Mount helpers.
//!
//! Thin wrappers over rfuse3 raw Session APIs. On Linux the mount is
//! unprivileged (requires fusermount3 in PATH).

use std::path::Path;

use rfuse3::MountOptions;
use rfuse3::raw::MountHandle;

use super::KubeFs;

fn default_mount_options() -> MountOptions {
    let uid = unsafe { libc::getuid() };
    let gid = unsafe { libc::getgid() };
    let mut options = MountOptions::default();
    options
        .fs_name("kubefs")
        .force_readdir_plus(true)
        .uid(uid)
        .gid(gid);
    options
}

/// Mount the filesystem at the given empty directory.
#[cfg(target_os = "linux")]
pub async fn mount_kubefs(
    fs: KubeFs,
    mountpoint: impl AsRef<Path>,
) -> std::io::Result<MountHandle> {
    let session = rfuse3::raw::Session::new(default_mount_options());
    session
        .mount_with_unprivileged(fs, mountpoint.as_ref().as_os_str())
        .await
}

/// Fallback stub for non-Linux targets.
#[cfg(not(target_os = "linux"))]
pub async fn mount_kubefs(
    _fs: KubeFs,
    _mountpoint: impl AsRef<Path>,
) -> std::io::Result<MountHandle> {
    let _ = default_mount_options();
    Err(std::io::Error::new(
        std::io::ErrorKind::Unsupported,
        "FUSE mount is only supported on Linux in this build",
    ))
}
