//! Bidirectional byte pump between a pseudo-terminal master and a pair of
//! remote endpoints (typically the two directions of a vsock stream).
//! Ports the relay loop described in spec.md §4.6; the original's equivalent
//! poll loop lives in `util.cpp` alongside `UtilAcceptVsock`'s timeout
//! handling, reused here for the non-blocking-write-then-defer pattern.

use std::io;
use std::os::fd::{AsRawFd, OwnedFd, RawFd};
use std::time::Duration;

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, unix::AsyncFd};

const BUFFER_SIZE: usize = 4096;

/// Non-blocking wrapper around a pty master fd, driven through tokio's
/// generic fd-readiness primitive (the pty master is not a tokio-native
/// stream type).
pub struct PtyMaster {
    inner: AsyncFd<OwnedFd>,
}

impl PtyMaster {
    pub fn new(fd: OwnedFd) -> io::Result<Self> {
        set_nonblocking(fd.as_raw_fd())?;
        Ok(Self {
            inner: AsyncFd::new(fd)?,
        })
    }

    async fn read(&self, buf: &mut [u8]) -> io::Result<usize> {
        loop {
            let mut guard = self.inner.readable().await?;
            match guard.try_io(|fd| read_raw(fd.as_raw_fd(), buf)) {
                Ok(result) => return result,
                Err(_would_block) => continue,
            }
        }
    }

    /// Single non-blocking write attempt; never waits for writability. The
    /// fd is already `O_NONBLOCK`, so this is a direct syscall rather than
    /// a `try_io`-over-`writable()` dance — a stalled write must not have
    /// any way to block the caller, since the caller is a `select!` branch
    /// that has to stay concurrent with draining pty-master reads.
    fn try_write(&self, buf: &[u8]) -> io::Result<usize> {
        write_raw(self.inner.get_ref().as_raw_fd(), buf)
    }
}

fn set_nonblocking(fd: RawFd) -> io::Result<()> {
    let flags = unsafe { libc::fcntl(fd, libc::F_GETFL) };
    if flags < 0 {
        return Err(io::Error::last_os_error());
    }

    let result = unsafe { libc::fcntl(fd, libc::F_SETFL, flags | libc::O_NONBLOCK) };
    if result < 0 {
        return Err(io::Error::last_os_error());
    }

    Ok(())
}

fn read_raw(fd: RawFd, buf: &mut [u8]) -> io::Result<usize> {
    let n = unsafe { libc::read(fd, buf.as_mut_ptr().cast(), buf.len()) };
    if n < 0 {
        Err(io::Error::last_os_error())
    } else {
        Ok(n as usize)
    }
}

fn write_raw(fd: RawFd, buf: &[u8]) -> io::Result<usize> {
    let n = unsafe { libc::write(fd, buf.as_ptr().cast(), buf.len()) };
    if n < 0 {
        Err(io::Error::last_os_error())
    } else {
        Ok(n as usize)
    }
}

/// Runs the relay to completion: pumps bytes from `input` to the pty master
/// and from the pty master to `output`, with the deferred-write buffer
/// (`pending_stdin`) spec.md §4.6 requires so a stalled pty-master write
/// never blocks draining new input, and vice versa. Half-closes both
/// endpoints on exit.
pub async fn relay<R, W>(mut input: R, mut output: W, pty_master: PtyMaster) -> io::Result<()>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut pending_stdin: Option<(Vec<u8>, usize)> = None;
    let mut input_open = true;
    let mut read_buf = [0u8; BUFFER_SIZE];
    let mut master_buf = [0u8; BUFFER_SIZE];

    loop {
        // Retry cadence for a stalled pty-master write: 100ms while there is
        // deferred data, inert otherwise. Folding the retry into this branch
        // (rather than awaiting writability, or blocking ahead of the
        // select!) keeps the pty-master-read branch pollable the whole time
        // a write is stalled.
        let pending_retry = async {
            match &pending_stdin {
                Some(_) => tokio::time::sleep(Duration::from_millis(100)).await,
                None => std::future::pending().await,
            }
        };

        tokio::select! {
            biased;

            result = input.read(&mut read_buf), if input_open && pending_stdin.is_none() => {
                match result {
                    Ok(0) => {
                        input_open = false;
                    }
                    Ok(n) => {
                        match pty_master.try_write(&read_buf[..n]) {
                            Ok(written) if written < n => {
                                pending_stdin = Some((read_buf[..n].to_vec(), written));
                            }
                            Ok(_) => {}
                            Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                                pending_stdin = Some((read_buf[..n].to_vec(), 0));
                            }
                            Err(e) => return Err(e),
                        }
                    }
                    Err(e) => return Err(e),
                }
            }

            result = pty_master.read(&mut master_buf) => {
                match result {
                    Ok(0) => break,
                    Ok(n) => {
                        output.write_all(&master_buf[..n]).await?;
                    }
                    Err(e) if e.raw_os_error() == Some(libc::EIO) => {
                        // Pty closed underneath us; not a real error.
                        break;
                    }
                    Err(e) => return Err(e),
                }
            }

            _ = pending_retry, if pending_stdin.is_some() => {
                let (buf, offset) = pending_stdin.take().expect("guarded by is_some");
                match pty_master.try_write(&buf[offset..]) {
                    Ok(n) if offset + n < buf.len() => {
                        pending_stdin = Some((buf, offset + n));
                    }
                    Ok(_) => {}
                    Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                        pending_stdin = Some((buf, offset));
                    }
                    Err(e) => return Err(e),
                }
            }
        }
    }

    let _ = output.shutdown().await;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn set_nonblocking_rejects_invalid_fd() {
        assert!(set_nonblocking(-1).is_err());
    }
}
