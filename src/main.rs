use clap::{Parser, Subcommand};
use color_print::cformat;
use rand::{Rng, rngs::SmallRng};
use std::{error::Error, sync::Arc, time::Duration};
use token_mutex::{
    Address, CHECK_TIMEOUT, DEFAULT_NAME_SERVER, DEFAULT_TYPE, Peer, PeerConfig, RATE,
    directory::NameServer, log, poisson::Poisson, server::Skeleton,
};

#[derive(Parser)]
#[command(name = "token-mutex", version, about = "Token-based distributed mutual exclusion")]
struct Cli {
    /// Log filter such as `info` or `token_mutex=debug`. `RUST_LOG` takes precedence.
    #[arg(short, long, global = true, default_value = "info", env = "TOKEN_MUTEX_LOG")]
    log_level: String,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run the name server that peers register with.
    NameServer {
        #[arg(short, long, default_value = DEFAULT_NAME_SERVER, env = "TOKEN_MUTEX_NAME_SERVER")]
        address: Address,

        /// Seconds between liveness sweeps over every registered peer.
        #[arg(long, default_value_t = 30)]
        check_interval: u64,
    },

    /// Join the mesh and enter the critical section at random intervals.
    Peer {
        #[arg(long, default_value = "127.0.0.1")]
        host: String,

        /// Port to listen on, chosen at random when omitted.
        #[arg(short, long, value_parser = clap::value_parser!(u16).range(40001..50000))]
        port: Option<u16>,

        #[arg(short = 't', long = "type", default_value = DEFAULT_TYPE)]
        kind: String,

        #[arg(short, long, default_value = DEFAULT_NAME_SERVER, env = "TOKEN_MUTEX_NAME_SERVER")]
        name_server: Address,

        /// Average number of critical-section entries per second.
        #[arg(short, long, default_value_t = RATE)]
        rate: f64,
    },
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn Error + Send + Sync>> {
    let cli = Cli::parse();
    log::init(&cli.log_level)?;

    match cli.command {
        Command::NameServer {
            address,
            check_interval,
        } => run_name_server(address, Duration::from_secs(check_interval)).await,
        Command::Peer {
            host,
            port,
            kind,
            name_server,
            rate,
        } => {
            let port = port.unwrap_or_else(|| rand::rng().random_range(40001..50000));
            let config = PeerConfig {
                address: Address::new(host, port),
                name_server,
                kind,
            };
            run_peer(config, rate).await
        }
    }
}

async fn run_name_server(
    address: Address,
    check_interval: Duration,
) -> Result<(), Box<dyn Error + Send + Sync>> {
    let names = NameServer::new(CHECK_TIMEOUT);
    let skeleton = Skeleton::bind(&address).await?;
    log::info(&cformat!(
        "Name server listening on <bold>{}</bold>. Press Ctrl-C to stop.",
        skeleton.address()
    ));

    let sweeper = names.spawn_sweeper(check_interval);
    tokio::select! {
        _ = skeleton.run(Arc::new(names)) => {}
        _ = tokio::signal::ctrl_c() => log::info("Stopping the name server."),
    }
    sweeper.abort();
    Ok(())
}

async fn run_peer(config: PeerConfig, rate: f64) -> Result<(), Box<dyn Error + Send + Sync>> {
    let peer = Peer::start(config).await?;
    log::info(&peer.peer_list().describe().await);

    let mut poisson = Poisson::from_entropy(rate);
    let outcome = tokio::select! {
        result = work(&peer, &mut poisson) => result,
        _ = tokio::signal::ctrl_c() => {
            log::warn("Received an interrupt, leaving the mesh.");
            Ok(())
        }
    };

    peer.destroy().await?;
    log::info("All done!");
    Ok(outcome?)
}

async fn work(peer: &Peer, poisson: &mut Poisson<SmallRng>) -> token_mutex::Result<()> {
    loop {
        tokio::time::sleep(poisson.next_delay()).await;

        peer.acquire().await?;
        log::info(&cformat!(
            "Peer <bold>{}</bold> is <green, bold>inside</green, bold> the critical section.",
            peer.id()
        ));
        tokio::time::sleep(poisson.next_delay()).await;
        log::debug(&peer.status().await.to_string());
        peer.release().await?;
    }
}
