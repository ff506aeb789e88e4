//! Safe TCP bind/connect helper functions.

use std::net::{Ipv4Addr, SocketAddr};

use tokio::net::{TcpListener, TcpSocket, TcpStream};
use tokio::time::{self, Duration};

use crate::utils::ReplistateError;

/// Wrapper over tokio `TcpListener::bind()` that provides a retrying logic.
pub(crate) async fn tcp_bind_with_retry(
    bind_addr: SocketAddr,
    mut retries: u8,
) -> Result<TcpListener, ReplistateError> {
    loop {
        let socket = TcpSocket::new_v4()?;
        socket.set_linger(None)?;
        socket.set_reuseaddr(true)?;
        socket.set_nodelay(true)?;

        let bind_addr = (Ipv4Addr::UNSPECIFIED, bind_addr.port()).into();
        socket.bind(bind_addr)?;

        match socket.listen(1024) {
            Ok(listener) => return Ok(listener),
            Err(err) => {
                if retries == 0 {
                    return Err(err.into());
                }
                retries -= 1;
                time::sleep(Duration::from_secs(1)).await;
            }
        }
    }
}

/// Wrapper over tokio `TcpStream::connect()` bounded by a connect timeout.
/// Peer messaging is one-shot and best-effort, so a slow peer must not hold
/// a handler longer than the configured connection timeout.
pub(crate) async fn tcp_connect_with_timeout(
    conn_addr: SocketAddr,
    timeout: Duration,
) -> Result<TcpStream, ReplistateError> {
    match time::timeout(timeout, TcpStream::connect(conn_addr)).await {
        Ok(Ok(stream)) => {
            stream.set_nodelay(true)?;
            Ok(stream)
        }
        Ok(Err(err)) => Err(ReplistateError::PeerUnreachable(format!(
            "connect to '{}': {}",
            conn_addr, err
        ))),
        Err(_) => Err(ReplistateError::PeerUnreachable(format!(
            "connect to '{}': timed out",
            conn_addr
        ))),
    }
}
