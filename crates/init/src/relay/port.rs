//! Localhost-to-vsock port relay: binds an ephemeral vsock listen socket,
//! reports its port to the caller, then bridges every accepted vsock
//! connection to a fresh TCP connection against a guest-local loopback
//! port, for the lifetime of the VM. Ports the "port relay" accept loop of
//! spec.md §4.7, grounded on the same `UtilListenVsockAnyPort` accept
//! pattern as the child-session fabric (`session.rs`).

use std::io;
use std::net::SocketAddr;

use tokio::net::TcpStream;
use tokio_vsock::{VsockAddr, VsockListener, VsockStream};

const VMADDR_CID_ANY: u32 = 0xFFFF_FFFF;

/// Binds an ephemeral vsock listen socket, reports its port via
/// `report_port`, then relays every accepted connection to
/// `127.0.0.1:target_port` until the process exits. Runs detached; errors
/// accepting or bridging a single connection are logged and do not stop the
/// loop.
pub async fn run<F, Fut>(target_port: u16, report_port: F) -> io::Result<()>
where
    F: FnOnce(u32) -> Fut,
    Fut: std::future::Future<Output = io::Result<()>>,
{
    let listener = VsockListener::bind(VsockAddr::new(VMADDR_CID_ANY, 0))?;
    let port = listener.local_addr()?.port();
    report_port(port).await?;

    loop {
        let (vsock_stream, peer) = match listener.accept().await {
            Ok(accepted) => accepted,
            Err(e) => {
                tracing::error!(error = %e, "port relay accept failed");
                continue;
            }
        };

        tracing::info!(?peer, target_port, "port relay connection accepted");
        tokio::spawn(async move {
            if let Err(e) = bridge_one(vsock_stream, target_port).await {
                tracing::warn!(error = %e, target_port, "port relay connection ended with error");
            }
        });
    }
}

async fn bridge_one(mut vsock_stream: VsockStream, target_port: u16) -> io::Result<()> {
    let addr = SocketAddr::from(([127, 0, 0, 1], target_port));
    let mut tcp_stream = TcpStream::connect(addr).await?;
    tokio::io::copy_bidirectional(&mut vsock_stream, &mut tcp_stream).await?;
    Ok(())
}
