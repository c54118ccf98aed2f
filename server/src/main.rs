use clap::Parser;
use log::info;
use server::network::Server;
use server::session::ServerConfig;
use std::path::PathBuf;

/// Parses command-line arguments, builds the server configuration and runs
/// the update loop until Ctrl+C.
#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    #[derive(Parser, Debug)]
    #[clap(author, version, about)]
    struct Args {
        /// IP address to bind to
        #[clap(short = 'H', long, default_value = "0.0.0.0")]
        host: String,
        /// UDP port to listen on
        #[clap(short, long, default_value = "27015")]
        port: u16,
        /// Server name shown in the lobby
        #[clap(short, long, default_value = "Subsea Server")]
        name: String,
        /// Maximum number of connected players
        #[clap(short, long, default_value = "16")]
        max_players: usize,
        /// Join password; omit for an open server
        #[clap(long)]
        password: Option<String>,
        /// Message of the day shown in the lobby
        #[clap(long, default_value = "")]
        message: String,
        /// Start a new round automatically while players wait in the lobby
        #[clap(long)]
        auto_restart: bool,
        /// Disallow joining as a spectator
        #[clap(long)]
        no_spectating: bool,
        /// Disable mid-round respawning
        #[clap(long)]
        no_respawn: bool,
        /// Ban list location
        #[clap(long, default_value = "banlist.json")]
        banlist: PathBuf,
        /// Saved player permissions location
        #[clap(long, default_value = "permissions.json")]
        permissions: PathBuf,
    }

    env_logger::init();
    let args = Args::parse();

    let config = ServerConfig {
        name: args.name,
        port: args.port,
        max_clients: args.max_players,
        password: args.password,
        server_message: args.message,
        allow_spectating: !args.no_spectating,
        allow_respawn: !args.no_respawn,
        auto_restart: args.auto_restart,
        banlist_path: args.banlist,
        permissions_path: args.permissions,
    };

    let mut server = Server::new(&args.host, config).await?;

    tokio::select! {
        result = server.run() => result?,
        _ = tokio::signal::ctrl_c() => {
            info!("Received Ctrl+C, shutting down");
        }
    }

    Ok(())
}
