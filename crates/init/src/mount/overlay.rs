//! Overlayfs construction and the chroot transition used both by the
//! overlay-mount path and by the distribution-init boot path. Ports
//! `util.cpp`'s `UtilMountOverlayFs`.

use std::io;
use std::path::Path;

use nix::mount::MsFlags;
use nix::unistd::chdir;

/// Builds `<target>/rw` (tmpfs), `<target>/rw/upper`, `<target>/rw/work`,
/// then mounts an overlay at `target` with `lower` as its lowerdir. Any
/// `string_options` the caller already parsed out of the mount request are
/// appended after the overlay's own `lowerdir=/upperdir=/workdir=` triple.
pub async fn mount_overlay(
    target: &str,
    lower: &str,
    mount_flags: MsFlags,
    string_options: &str,
) -> io::Result<()> {
    tokio::fs::create_dir_all(target).await?;

    let rw = format!("{target}/rw");
    nix::mount::mount(
        Option::<&str>::None,
        rw.as_str(),
        Some("tmpfs"),
        MsFlags::empty(),
        Option::<&str>::None,
    )
    .map_err(nix_to_io)?;

    let upper = format!("{rw}/upper");
    tokio::fs::create_dir_all(&upper).await?;

    let work = format!("{rw}/work");
    tokio::fs::create_dir_all(&work).await?;

    let mut options = format!("lowerdir={lower},upperdir={upper},workdir={work}");
    if !string_options.is_empty() {
        options.push(',');
        options.push_str(string_options);
    }

    nix::mount::mount(
        Option::<&str>::None,
        target,
        Some("overlay"),
        mount_flags,
        Some(options.as_str()),
    )
    .map_err(nix_to_io)
}

/// Removes the scratch `<target>/rw` tree after a non-chroot overlay has
/// been move-mounted onto its real target. Best-effort with a short
/// exponential backoff, since a lingering reference (e.g. a probe that
/// opened a file under `rw` a moment ago) can make the first unlink attempt
/// fail transiently.
pub async fn cleanup_overlay_scratch(target: &str) -> io::Result<()> {
    use tokio_retry::Retry;
    use tokio_retry::strategy::{ExponentialBackoff, jitter};

    let rw = format!("{target}/rw");
    let strategy = ExponentialBackoff::from_millis(50).map(jitter).take(3);
    Retry::spawn(strategy, || tokio::fs::remove_dir_all(&rw)).await
}

/// Move-mounts `.` onto `/` and `chroot`s into it. Matches `LSW_MOUNT`'s
/// literal `chdir(target); chroot(".")` sequence (not `pivot_root`; see
/// DESIGN.md Open Question 3).
pub fn chroot_into(target: &str) -> io::Result<()> {
    chdir(Path::new(target)).map_err(nix_to_io)?;
    nix::unistd::chroot(".").map_err(nix_to_io)
}

fn nix_to_io(err: nix::Error) -> io::Error {
    io::Error::from_raw_os_error(err as i32)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn chroot_into_nonexistent_path_fails_without_panicking() {
        let result = chroot_into("/this/path/does/not/exist/at/all");
        assert!(result.is_err());
    }
}
