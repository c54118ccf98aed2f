use clap::Parser;
use client::network::{ClientConfig, ClientRunner};
use log::info;

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Server address to connect to
    #[arg(short = 's', long, default_value = "127.0.0.1:27015")]
    server: String,

    /// Player name
    #[arg(short, long, default_value = "Player")]
    name: String,

    /// Join password, if the server requires one
    #[arg(long)]
    password: Option<String>,

    /// Join as a spectator
    #[arg(long)]
    spectate: bool,

    /// Preferred jobs, most wanted first
    #[arg(short, long)]
    job: Vec<String>,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    env_logger::init();
    let args = Args::parse();

    info!("Connecting to {}", args.server);
    let config = ClientConfig {
        name: args.name,
        password: args.password,
        spectate_only: args.spectate,
        job_preferences: args.job,
    };

    let mut runner = ClientRunner::new(&args.server, config).await?;
    runner.run().await?;

    if let Some(reason) = runner.client.disconnect_reason() {
        info!("Session ended: {}", reason);
    }
    Ok(())
}
