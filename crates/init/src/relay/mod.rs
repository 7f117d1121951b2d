//! Bidirectional TTY pump and localhost-to-vsock port relay, per spec.md
//! §4.6-4.7. Grounded on `util.cpp`'s poll-based relay loops and
//! `UtilAcceptVsock`/`UtilListenVsockAnyPort`.

pub mod port;
pub mod tty;
