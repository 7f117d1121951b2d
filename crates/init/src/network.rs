//! Network/perf bring-up run once, early in boot: loopback-up, the
//! cross-distribution shared tmpfs, the `/etc/resolv.conf` symlink into it,
//! and `binfmt_misc` registration of the Windows-interop interpreter.
//! Ports `main.cpp`'s network-config handler plus spec.md §4.10, supplemented
//! per SPEC_FULL.md §4.10 with a small perf-tuning sysctl set grounded on
//! `examples/other_examples/92b06617_orbstack-swift-nio__vinit-src-startup.rs.rs`'s
//! `apply_perf_tuning_early`/`late`.

use std::io;
use std::os::fd::AsRawFd;

use nix::mount::MsFlags;

use shared::vm_config::GuestConfig;

const SHARE_MOUNT_POINT: &str = "/mnt/shared";
const RESOLV_CONF_PATH: &str = "/etc/resolv.conf";
const BINFMT_MOUNT_POINT: &str = "/proc/sys/fs/binfmt_misc";
/// Path the guest-resident interop helper is registered under. `F` keeps the
/// registration valid across the mount-namespace changes every child session
/// and distro-init launch perform (the interpreter's own inode is opened
/// once at registration time rather than re-resolved per exec).
const INTEROP_REGISTRATION: &str = ":interop:M::MZ::/init:F";

fn write_sysctl(path: &str, value: &str) -> io::Result<()> {
    std::fs::write(path, value).inspect_err(|e| {
        tracing::warn!(path, error = %e, "failed to write sysctl");
    })
}

/// Writes the always-on knobs spec.md §4.10 and §6 name: dmesg-restrict and
/// the inotify watch ceiling (raised because user containers commonly run
/// file watchers that would otherwise exhaust the kernel default).
pub fn apply_perf_tuning_early() {
    let _ = write_sysctl("/proc/sys/kernel/dmesg_restrict", "0");
    let _ = write_sysctl("/proc/sys/fs/inotify/max_user_watches", "524288");
}

/// Additional sysctls applied only when the host has negotiated
/// `enable_kernel_perf_tuning` (SPEC_FULL.md §4.10 **(NEW)**). Never spawns a
/// tuning daemon — every effect here is a direct `/proc/sys` write.
pub fn apply_perf_tuning_late(config: &GuestConfig) {
    if !config.enable_kernel_perf_tuning {
        return;
    }

    let _ = write_sysctl("/proc/sys/vm/swappiness", "10");
    let _ = write_sysctl("/proc/sys/kernel/pid_max", "4194304");
    let _ = write_sysctl("/proc/sys/net/core/somaxconn", "4096");
}

/// Brings the loopback interface up via `SIOCSIFFLAGS`, matching the
/// original's direct ioctl rather than shelling out to `ip link set lo up`.
pub fn enable_loopback() -> io::Result<()> {
    let socket = nix::sys::socket::socket(
        nix::sys::socket::AddressFamily::Inet,
        nix::sys::socket::SockType::Datagram,
        nix::sys::socket::SockFlag::empty(),
        None,
    )
    .map_err(nix_to_io)?;

    let mut request: libc::ifreq = unsafe { std::mem::zeroed() };
    let name = b"lo\0";
    for (dst, src) in request.ifr_name.iter_mut().zip(name.iter()) {
        *dst = *src as libc::c_char;
    }

    let fd = socket.as_raw_fd();
    if unsafe { libc::ioctl(fd, libc::SIOCGIFFLAGS, &mut request) } < 0 {
        return Err(io::Error::last_os_error());
    }

    unsafe {
        request.ifr_ifru.ifru_flags |= (libc::IFF_UP | libc::IFF_RUNNING) as i16;
    }

    if unsafe { libc::ioctl(fd, libc::SIOCSIFFLAGS, &request) } < 0 {
        return Err(io::Error::last_os_error());
    }

    Ok(())
}

/// Creates the cross-distribution shared tmpfs and marks it `MS_SHARED` so
/// mounts made under it by one distro's mount namespace propagate to others.
pub async fn mount_cross_distro_share() -> io::Result<()> {
    crate::util::mkdir_p(SHARE_MOUNT_POINT)?;

    nix::mount::mount(
        Option::<&str>::None,
        SHARE_MOUNT_POINT,
        Some("tmpfs"),
        MsFlags::empty(),
        Option::<&str>::None,
    )
    .map_err(nix_to_io)?;

    nix::mount::mount(
        Option::<&str>::None,
        SHARE_MOUNT_POINT,
        Option::<&str>::None,
        MsFlags::MS_SHARED,
        Option::<&str>::None,
    )
    .map_err(nix_to_io)
}

/// Points `/etc/resolv.conf` at a file under the shared tmpfs so a
/// later-started network agent (out of scope here) can write it without
/// racing this process's own filesystem staging.
pub fn symlink_resolv_conf() -> io::Result<()> {
    let target = format!("{SHARE_MOUNT_POINT}/resolv.conf");
    match std::fs::remove_file(RESOLV_CONF_PATH) {
        Ok(()) => {}
        Err(e) if e.kind() == io::ErrorKind::NotFound => {}
        Err(e) => return Err(e),
    }

    std::os::unix::fs::symlink(&target, RESOLV_CONF_PATH)
}

/// Mounts `binfmt_misc` and registers the interop interpreter, matching
/// spec.md §4.10's closing bullet.
pub async fn register_binfmt_interop() -> io::Result<()> {
    crate::util::mkdir_p(BINFMT_MOUNT_POINT)?;

    nix::mount::mount(
        Option::<&str>::None,
        BINFMT_MOUNT_POINT,
        Some("binfmt_misc"),
        MsFlags::empty(),
        Option::<&str>::None,
    )
    .map_err(nix_to_io)?;

    tokio::fs::write(
        format!("{BINFMT_MOUNT_POINT}/register"),
        INTEROP_REGISTRATION,
    )
    .await
}

fn nix_to_io(err: nix::Error) -> io::Error {
    io::Error::from_raw_os_error(err as i32)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn interop_registration_string_sets_fork_before_exec_flag() {
        assert!(INTEROP_REGISTRATION.ends_with(":F"));
    }
}
