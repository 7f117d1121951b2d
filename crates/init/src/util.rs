//! Small boot-time helpers: the kmsg log writer, `mkdir -p`, and a
//! retry-wrapped mount call. Ports `util.cpp`'s `InitializeLogging` /
//! `UtilMkdirPath` / `UtilMount`.

use std::fs::OpenOptions;
use std::io;
use std::os::fd::{AsRawFd, OwnedFd};
use std::path::Path;

use nix::mount::MsFlags;

/// A `tracing_subscriber::fmt::MakeWriter` that writes every formatted line
/// to the kernel log device. Cloning is cheap: the underlying fd is shared
/// (dup'd once at construction), matching the original's single
/// process-wide `g_LogFd`.
#[derive(Clone)]
pub struct KmsgWriter {
    fd: std::sync::Arc<OwnedFd>,
}

impl KmsgWriter {
    pub fn open() -> io::Result<Self> {
        let file = OpenOptions::new().write(true).open("/dev/kmsg")?;
        Ok(Self {
            fd: std::sync::Arc::new(OwnedFd::from(file)),
        })
    }
}

impl AsRawFd for KmsgWriter {
    fn as_raw_fd(&self) -> std::os::fd::RawFd {
        self.fd.as_raw_fd()
    }
}

impl io::Write for KmsgWriter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let n = unsafe { libc::write(self.fd.as_raw_fd(), buf.as_ptr().cast(), buf.len()) };
        if n < 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(n as usize)
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

impl<'a> tracing_subscriber::fmt::MakeWriter<'a> for KmsgWriter {
    type Writer = KmsgWriter;

    fn make_writer(&'a self) -> Self::Writer {
        self.clone()
    }
}

/// Creates `path` and every missing parent directory, matching `mkdir -p`
/// (and tolerating the target already existing).
pub fn mkdir_p(path: &str) -> io::Result<()> {
    match std::fs::create_dir_all(path) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == io::ErrorKind::AlreadyExists => Ok(()),
        Err(e) => Err(e),
    }
}

/// `mount(2)` with the `nofail` convention folded in: an `ENOENT` on the
/// target is swallowed (treated as success) when `nofail` is set, matching
/// `UtilMount`'s handling of the mount-options `nofail` token.
pub fn mount_with_nofail(
    source: Option<&str>,
    target: &str,
    fstype: Option<&str>,
    flags: MsFlags,
    data: Option<&str>,
    nofail: bool,
) -> io::Result<()> {
    match nix::mount::mount(source, target, fstype, flags, data) {
        Ok(()) => Ok(()),
        Err(nix::Error::ENOENT) if nofail && Path::new(target).exists() => Ok(()),
        Err(e) => Err(io::Error::from_raw_os_error(e as i32)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mkdir_p_tolerates_already_existing_directory() {
        let dir = tempfile::tempdir().unwrap();
        let nested = dir.path().join("a/b/c");
        mkdir_p(nested.to_str().unwrap()).unwrap();
        assert!(nested.is_dir());
        // second call over the same path must not error
        mkdir_p(nested.to_str().unwrap()).unwrap();
    }
}
