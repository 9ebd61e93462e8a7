use clap::Parser;
use log::info;
use server::config::{ScoreConfig, TeamMode};
use server::fallback::FallbackLog;
use server::network::Server;
use server::rpc::{DatabaseClient, OfflineTransport, RpcTransport, TcpTransport};
use std::sync::Arc;

#[derive(Parser, Debug)]
#[command(author, version, about = "Race server with deferred score reconciliation")]
struct Args {
    /// Server IP address to bind to
    #[arg(short = 'H', long, default_value = "127.0.0.1")]
    host: String,

    /// Server port to listen on
    #[arg(short, long, default_value = "8303")]
    port: u16,

    /// Tick rate (updates per second)
    #[arg(short, long, default_value = "50", value_parser = clap::value_parser!(u32).range(1..))]
    tick_rate: u32,

    /// Maximum number of connected players
    #[arg(short, long, default_value = "64")]
    max_clients: usize,

    /// Address of the score database. Without it every call fails and
    /// durable writes go straight to the fallback log.
    #[arg(long)]
    database: Option<String>,

    #[arg(long, default_value = "Tutorial")]
    map: String,

    #[arg(long, default_value = "Novice")]
    server_type: String,

    /// File receiving durable writes that could not be confirmed
    #[arg(long, default_value = "score_fallback.log")]
    fallback_log: String,

    /// Answer rank requests privately
    #[arg(long)]
    hide_score: bool,

    /// Load per-checkpoint best times
    #[arg(long, default_value_t = true, action = clap::ArgAction::Set)]
    checkpoint_save: bool,

    #[arg(long, value_enum, default_value_t = TeamMode::Optional)]
    team_mode: TeamMode,

    /// Seconds between a player's votes
    #[arg(long, default_value = "3")]
    vote_delay: u64,

    /// Seconds between map votes on the server
    #[arg(long, default_value = "10")]
    map_vote_delay: u64,

    /// Seconds a pending score write may wait before it is logged; 0 waits forever
    #[arg(long, default_value = "300")]
    pending_deadline: u64,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    env_logger::init();
    let args = Args::parse();

    let config = ScoreConfig {
        map_name: args.map,
        server_type: args.server_type,
        hide_score: args.hide_score,
        checkpoint_save: args.checkpoint_save,
        team_mode: args.team_mode,
        tick_rate: args.tick_rate,
        vote_delay_secs: args.vote_delay,
        map_vote_delay_secs: args.map_vote_delay,
        pending_deadline_secs: (args.pending_deadline > 0).then_some(args.pending_deadline),
    };

    let transport: Arc<dyn RpcTransport> = match &args.database {
        Some(addr) => {
            info!("Using score database at {}", addr);
            Arc::new(TcpTransport::spawn(addr))
        }
        None => {
            info!("No score database configured, running offline");
            Arc::new(OfflineTransport)
        }
    };

    let fallback = FallbackLog::open(&args.fallback_log)?;
    info!("Fallback log at {}", fallback.path().display());

    let address = format!("{}:{}", args.host, args.port);
    let mut server = Server::new(
        &address,
        args.max_clients,
        config,
        DatabaseClient::new(transport),
        Box::new(fallback),
    )
    .await?;

    server.run().await
}
