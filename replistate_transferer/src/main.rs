//! File-transferer child executable. Forked by the replication daemon to
//! move the state/version file pair between two daemons; exits 0 only when
//! the full pair transferred. The parent daemon promotes or cleans the temp
//! files this process leaves behind, keyed by this process's pid.
//!
//! A downloading child binds an ephemeral callback listener, asks the
//! source daemon for the pair with a `REPLICATION_TRANSFER_FILE` command
//! carrying the callback address, and receives the two files on the
//! accepted connection. An uploading child is forked by the serving daemon
//! with that callback address as its peer argument, snapshots the local
//! pair, and pushes the snapshot.

use std::fs;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};

use clap::{Parser, ValueEnum};
use env_logger::Env;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::time::{self, Duration};

use replistate::{pf_error, pf_info, CommandKind, PeerCommand, ReplistateError};

/// Upper bound on either transferred file. The replicated pair is tens of
/// kilobytes; anything huge means a confused peer.
const MAX_FILE_LEN: u64 = 64 << 20;

/// Transfer direction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum Mode {
    /// Pull the pair from a peer daemon into local temp files.
    Down,
    /// Push the local pair to a downloading transferer's callback address.
    Up,
}

/// Command line arguments definition.
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct CliArgs {
    /// Transfer direction.
    #[arg(value_enum)]
    mode: Mode,

    /// Path of the replicated state file.
    state_file: PathBuf,

    /// Path of the version file.
    version_file: PathBuf,

    /// Peer address: the source daemon for 'down', the downloader's
    /// callback listener for 'up'.
    peer: SocketAddr,

    /// Overall deadline in seconds for the whole transfer.
    #[arg(long, default_value_t = 300)]
    timeout: u64,
}

/// `<path>.<pid>.<ext>` for this process's temporary copy of one file.
fn temp_path(path: &Path, ext: &str) -> PathBuf {
    PathBuf::from(format!(
        "{}.{}.{}",
        path.display(),
        std::process::id(),
        ext
    ))
}

/// Sends one length-prefixed blob (u64 big-endian length, then the bytes).
async fn send_blob(
    conn: &mut TcpStream,
    blob: &[u8],
) -> Result<(), ReplistateError> {
    conn.write_all(&(blob.len() as u64).to_be_bytes()).await?;
    conn.write_all(blob).await?;
    Ok(())
}

/// Receives one length-prefixed blob.
async fn recv_blob(conn: &mut TcpStream) -> Result<Vec<u8>, ReplistateError> {
    let mut len_bytes = [0u8; 8];
    conn.read_exact(&mut len_bytes).await.map_err(|e| {
        ReplistateError::WireFormat(format!("short blob read: {}", e))
    })?;
    let len = u64::from_be_bytes(len_bytes);
    if len > MAX_FILE_LEN {
        return Err(ReplistateError::WireFormat(format!(
            "blob length {} exceeds cap",
            len
        )));
    }

    let mut blob = vec![0u8; len as usize];
    conn.read_exact(&mut blob).await.map_err(|e| {
        ReplistateError::WireFormat(format!("short blob read: {}", e))
    })?;
    Ok(blob)
}

/// Downloads the pair from the source daemon into local temp files, which
/// the parent daemon will promote after reaping this process.
async fn run_download(args: &CliArgs) -> Result<(), ReplistateError> {
    // bind the callback listener first, then ask the source daemon to push
    // the pair to it
    let listener = TcpListener::bind("0.0.0.0:0").await?;
    let callback_port = listener.local_addr()?.port();

    let mut request = TcpStream::connect(args.peer).await.map_err(|e| {
        ReplistateError::PeerUnreachable(format!(
            "connect to '{}': {}",
            args.peer, e
        ))
    })?;
    let callback_addr = SocketAddr::new(
        request.local_addr()?.ip(),
        callback_port,
    );
    let cmd = PeerCommand::addr_only(
        CommandKind::TransferFile,
        callback_addr.to_string(),
    );
    request.write_all(&cmd.encode()).await?;
    request.shutdown().await?;
    pf_info!(
        "requested pair from '{}', awaiting push on '{}'",
        args.peer,
        callback_addr
    );

    let (mut push, from) = listener.accept().await?;
    pf_info!("serving daemon connected from '{}'", from);
    let version_blob = recv_blob(&mut push).await?;
    let state_blob = recv_blob(&mut push).await?;

    // a pair with only one file present is incomplete by definition, and
    // the wire format cannot express that; both blobs arrived if we got
    // here, so land them in the temp files
    fs::write(temp_path(&args.version_file, "down"), &version_blob)?;
    fs::write(temp_path(&args.state_file, "down"), &state_blob)?;
    pf_info!(
        "received pair: {} version bytes, {} state bytes",
        version_blob.len(),
        state_blob.len()
    );
    Ok(())
}

/// Uploads the local pair to a downloading transferer: snapshots both files
/// first so the daemon may keep modifying the originals, then pushes the
/// snapshot and removes it.
async fn run_upload(args: &CliArgs) -> Result<(), ReplistateError> {
    let version_snap = temp_path(&args.version_file, "up");
    let state_snap = temp_path(&args.state_file, "up");
    let snap_err = |e: std::io::Error| {
        ReplistateError::FileIo(format!("snapshotting pair: {}", e))
    };
    fs::copy(&args.version_file, &version_snap).map_err(snap_err)?;
    fs::copy(&args.state_file, &state_snap).map_err(snap_err)?;

    let result = async {
        let mut push = TcpStream::connect(args.peer).await.map_err(|e| {
            ReplistateError::PeerUnreachable(format!(
                "connect to '{}': {}",
                args.peer, e
            ))
        })?;
        send_blob(&mut push, &fs::read(&version_snap)?).await?;
        send_blob(&mut push, &fs::read(&state_snap)?).await?;
        push.shutdown().await?;
        Ok(())
    }
    .await;

    let _ = fs::remove_file(&version_snap);
    let _ = fs::remove_file(&state_snap);
    if result.is_ok() {
        pf_info!("pushed pair toward '{}'", args.peer);
    }
    result
}

async fn transferer_main(args: CliArgs) -> Result<(), ReplistateError> {
    let deadline = Duration::from_secs(args.timeout);
    let transfer = async {
        match args.mode {
            Mode::Down => run_download(&args).await,
            Mode::Up => run_upload(&args).await,
        }
    };
    match time::timeout(deadline, transfer).await {
        Ok(result) => result,
        Err(_) => Err(ReplistateError::TransferFailed(format!(
            "transfer did not finish within {:?}",
            deadline
        ))),
    }
}

#[tokio::main(flavor = "current_thread")]
async fn main() {
    env_logger::Builder::from_env(Env::default().default_filter_or("info"))
        .format_timestamp(None)
        .format_module_path(true)
        .format_target(false)
        .init();

    let args = CliArgs::parse();
    if let Err(e) = transferer_main(args).await {
        pf_error!("transferer_main exitted: {}", e);
        std::process::exit(1);
    }
}
