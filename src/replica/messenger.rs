//! Peer messaging layer: accepts one-command inbound connections and feeds
//! decoded commands into the machine's event loop; sends commands out as
//! best-effort one-shot connections, unicast or broadcast over the
//! configured pool list.

use std::net::SocketAddr;

use tokio::io::AsyncWriteExt;
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{self, Duration};

use crate::replica::codec::PeerCommand;
use crate::utils::{
    tcp_bind_with_retry, tcp_connect_with_timeout, ReplistateError,
};

/// Peer messaging module. Inbound connections each carry exactly one
/// command; outbound sends open a fresh connection per command, bounded by
/// the configured connection timeout.
#[derive(Debug)]
pub(crate) struct PeerMessenger {
    /// My own advertised address.
    me: SocketAddr,

    /// The full configured pool list (including myself).
    peers: Vec<SocketAddr>,

    /// Connect/read/write timeout for any one peer interaction.
    conn_timeout: Duration,

    /// Receiver side of the inbound command channel.
    rx_recv: mpsc::UnboundedReceiver<PeerCommand>,

    /// Join handle of the listener task.
    _acceptor_handle: JoinHandle<()>,
}

impl PeerMessenger {
    /// Creates the messenger: binds the command listener on `me` and spawns
    /// the acceptor task feeding decoded commands into the recv channel.
    pub(crate) async fn new_and_setup(
        me: SocketAddr,
        peers: Vec<SocketAddr>,
        conn_timeout: Duration,
    ) -> Result<Self, ReplistateError> {
        let (tx_recv, rx_recv) = mpsc::unbounded_channel();

        let listener = tcp_bind_with_retry(me, 10).await?;
        pf_info!("accepting peer commands on '{}'", me);

        let acceptor_handle = tokio::spawn(async move {
            loop {
                match listener.accept().await {
                    Ok((stream, addr)) => {
                        let tx_recv = tx_recv.clone();
                        tokio::spawn(async move {
                            Self::serve_conn(
                                stream,
                                addr,
                                conn_timeout,
                                tx_recv,
                            )
                            .await;
                        });
                    }
                    Err(e) => {
                        pf_warn!("error accepting peer connection: {}", e);
                    }
                }
            }
        });

        Ok(PeerMessenger {
            me,
            peers,
            conn_timeout,
            rx_recv,
            _acceptor_handle: acceptor_handle,
        })
    }

    /// My own advertised address as an identifier string.
    pub(crate) fn me(&self) -> String {
        self.me.to_string()
    }

    /// Receives the next decoded inbound command.
    pub(crate) async fn recv_cmd(
        &mut self,
    ) -> Result<PeerCommand, ReplistateError> {
        match self.rx_recv.recv().await {
            Some(cmd) => Ok(cmd),
            None => logged_err!("recv channel has been closed"),
        }
    }

    /// Sends one command to one peer address. Failures are returned for the
    /// caller to classify; the machine treats them as skip-and-log.
    pub(crate) async fn unicast(
        &self,
        cmd: &PeerCommand,
        peer: SocketAddr,
    ) -> Result<(), ReplistateError> {
        let mut stream =
            tcp_connect_with_timeout(peer, self.conn_timeout).await?;
        let frame = cmd.encode();
        time::timeout(self.conn_timeout, async {
            stream.write_all(&frame).await?;
            stream.shutdown().await
        })
        .await
        .map_err(|_| {
            ReplistateError::PeerUnreachable(format!(
                "send to '{}': timed out",
                peer
            ))
        })?
        .map_err(|e| {
            ReplistateError::PeerUnreachable(format!(
                "send to '{}': {}",
                peer, e
            ))
        })?;
        Ok(())
    }

    /// Same as `unicast` against an opaque address string (the form carried
    /// inside commands and versions).
    pub(crate) async fn unicast_addr(
        &self,
        cmd: &PeerCommand,
        peer: &str,
    ) -> Result<(), ReplistateError> {
        let peer_addr: SocketAddr = peer.parse().map_err(|e| {
            ReplistateError::PeerUnreachable(format!(
                "bad peer address '{}': {}",
                peer, e
            ))
        })?;
        self.unicast(cmd, peer_addr).await
    }

    /// Sends one command to every pool member except myself. Best-effort:
    /// per-peer failures are logged at debug level and skipped.
    pub(crate) async fn broadcast(&self, cmd: &PeerCommand) {
        for &peer in &self.peers {
            if peer == self.me {
                continue;
            }
            if let Err(e) = self.unicast(cmd, peer).await {
                pf_debug!("broadcast of {} skipping peer: {}", cmd.kind, e);
            }
        }
    }

    async fn serve_conn(
        mut stream: TcpStream,
        addr: SocketAddr,
        conn_timeout: Duration,
        tx_recv: mpsc::UnboundedSender<PeerCommand>,
    ) {
        let decoded =
            time::timeout(conn_timeout, PeerCommand::read_from(&mut stream))
                .await;
        match decoded {
            Ok(Ok(cmd)) => {
                pf_debug!("received {} from '{}'", cmd.kind, cmd.sender);
                if let Err(e) = tx_recv.send(cmd) {
                    pf_error!("error feeding recv channel: {}", e);
                }
            }
            Ok(Err(e)) => {
                // malformed frame: drop this connection, keep serving
                pf_warn!("malformed frame from '{}': {}", addr, e);
            }
            Err(_) => {
                pf_warn!("frame from '{}' timed out", addr);
            }
        }
    }
}

#[cfg(test)]
mod messenger_tests {
    use super::*;
    use crate::replica::codec::CommandKind;
    use crate::replica::version::{ReplicatorState, Version};

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn broadcast_skips_self_and_dead_peers(
    ) -> Result<(), ReplistateError> {
        let addr0: SocketAddr = "127.0.0.1:57330".parse()?;
        let addr1: SocketAddr = "127.0.0.1:57331".parse()?;
        let dead: SocketAddr = "127.0.0.1:57339".parse()?;
        let pool = vec![addr0, addr1, dead];

        let sender = PeerMessenger::new_and_setup(
            addr0,
            pool.clone(),
            Duration::from_secs(2),
        )
        .await?;
        let mut receiver =
            PeerMessenger::new_and_setup(addr1, pool, Duration::from_secs(2))
                .await?;

        let cmd = PeerCommand::addr_only(
            CommandKind::SolicitVersion,
            sender.me(),
        );
        sender.broadcast(&cmd).await;

        let received = receiver.recv_cmd().await?;
        assert_eq!(received, cmd);
        Ok(())
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn unicast_version_bearing_command() -> Result<(), ReplistateError>
    {
        let addr0: SocketAddr = "127.0.0.1:57333".parse()?;
        let addr1: SocketAddr = "127.0.0.1:57334".parse()?;
        let pool = vec![addr0, addr1];

        let sender = PeerMessenger::new_and_setup(
            addr0,
            pool.clone(),
            Duration::from_secs(2),
        )
        .await?;
        let mut receiver =
            PeerMessenger::new_and_setup(addr1, pool, Duration::from_secs(2))
                .await?;

        let mut version = Version::new(7, 42, sender.me());
        version.set_state(ReplicatorState::Leader);
        let cmd = PeerCommand::with_version(
            CommandKind::LeaderVersion,
            sender.me(),
            version,
        );
        sender.unicast_addr(&cmd, "127.0.0.1:57334").await?;

        let received = receiver.recv_cmd().await?;
        assert_eq!(received, cmd);
        Ok(())
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn malformed_frame_dropped_connection_survives(
    ) -> Result<(), ReplistateError> {
        let addr0: SocketAddr = "127.0.0.1:57336".parse()?;
        let mut receiver = PeerMessenger::new_and_setup(
            addr0,
            vec![addr0],
            Duration::from_secs(2),
        )
        .await?;

        // garbage frame first
        let mut garbage = TcpStream::connect(addr0).await?;
        garbage.write_all(&[0xde, 0xad, 0xbe, 0xef, 0x01]).await?;
        garbage.shutdown().await?;

        // a well-formed frame afterwards still gets through
        let cmd = PeerCommand::addr_only(
            CommandKind::SolicitVersion,
            "127.0.0.1:57337",
        );
        let mut ok_stream = TcpStream::connect(addr0).await?;
        ok_stream.write_all(&cmd.encode()).await?;
        ok_stream.shutdown().await?;

        let received = receiver.recv_cmd().await?;
        assert_eq!(received, cmd);
        Ok(())
    }
}
