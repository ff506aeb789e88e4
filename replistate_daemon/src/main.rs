//! Replication daemon executable.

use std::collections::HashSet;
use std::net::SocketAddr;

use clap::Parser;
use env_logger::Env;
use tokio::runtime::Builder;
use tokio::signal::unix::{signal, SignalKind};
use tokio::sync::watch;

use replistate::{pf_error, pf_warn, ReplicatorStateMachine, ReplistateError};

/// Command line arguments definition.
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct CliArgs {
    /// My replication address, must appear in the pool list.
    #[arg(short, long)]
    listen: SocketAddr,

    /// The full pool list of replication daemon addresses.
    /// Example: '-p host1:9620 -p host2:9620 -p host3:9620'.
    #[arg(short, long)]
    peers: Vec<SocketAddr>,

    /// Configuration parameters as a TOML fragment string.
    #[arg(short, long)]
    config: Option<String>,

    /// Number of tokio worker threads.
    #[arg(long, default_value_t = 2)]
    threads: usize,
}

impl CliArgs {
    /// Sanitize command line arguments, return `Ok(())` on success or
    /// `Err(ReplistateError)` on any error.
    fn sanitize(&self) -> Result<(), ReplistateError> {
        // check for duplicate peers
        let mut peers_set = HashSet::new();
        for addr in self.peers.iter() {
            if peers_set.contains(addr) {
                return Err(ReplistateError::Config(format!(
                    "duplicate peer address '{}' given",
                    addr
                )));
            }
            peers_set.insert(addr);
        }

        if self.peers.is_empty() {
            Err(ReplistateError::Config(
                "empty peer pool list given".into(),
            ))
        } else if !peers_set.contains(&self.listen) {
            Err(ReplistateError::Config(format!(
                "listen address '{}' not in the pool list",
                self.listen
            )))
        } else if self.listen.port() <= 1024 {
            Err(ReplistateError::Config(format!(
                "invalid listen port {}",
                self.listen.port()
            )))
        } else if self.threads < 2 {
            Err(ReplistateError::Config(format!(
                "invalid number of threads {}",
                self.threads
            )))
        } else {
            Ok(())
        }
    }
}

// Daemon executable main entrance.
fn daemon_main() -> Result<(), ReplistateError> {
    // read in and parse command line arguments
    let args = CliArgs::parse();
    args.sanitize()?;

    // create tokio multi-threaded runtime
    let runtime = Builder::new_multi_thread()
        .enable_all()
        .worker_threads(args.threads)
        .thread_name("tokio-worker-replistate")
        .build()?;

    // enter tokio runtime, set up the machine, and start the main event
    // loop logic
    runtime.block_on(async move {
        let mut machine = ReplicatorStateMachine::new_and_setup(
            args.listen,
            args.peers.clone(),
            args.config.as_deref(),
        )
        .await?;

        // flip the termination flag on SIGINT or SIGTERM
        let (tx_term, rx_term) = watch::channel(false);
        tokio::spawn(async move {
            let mut sigterm = match signal(SignalKind::terminate()) {
                Ok(sigterm) => sigterm,
                Err(e) => {
                    pf_error!("error installing SIGTERM handler: {}", e);
                    return;
                }
            };
            tokio::select! {
                _ = tokio::signal::ctrl_c() => {},
                _ = sigterm.recv() => {},
            }
            pf_warn!("termination signal received");
            if let Err(e) = tx_term.send(true) {
                pf_error!("error signalling termination: {}", e);
            }
        });

        machine.run(rx_term).await
    })
}

fn main() {
    env_logger::Builder::from_env(Env::default().default_filter_or("info"))
        .format_timestamp(None)
        .format_module_path(true)
        .format_target(false)
        .init();

    if let Err(e) = daemon_main() {
        pf_error!("daemon_main exitted: {}", e);
        std::process::exit(1);
    }
}
