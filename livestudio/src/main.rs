mod simulate;

use anyhow::Result;
use clap::{Parser, Subcommand};
use tracing::info;

use livestudio_core::{logging, Config};

#[derive(Parser, Debug)]
#[command(name = "livestudio")]
#[command(about = "Live studio media-routing client", long_about = None)]
struct Args {
    /// Configuration file (toml, yaml or json)
    #[arg(long, short, env = "LIVESTUDIO_CONFIG")]
    config: Option<String>,

    /// Override logging.level
    #[arg(long)]
    log_level: Option<String>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run a host and guests against an in-process SFU and print the result
    Simulate {
        /// Guests asking to join
        #[arg(long, default_value_t = 2)]
        guests: usize,

        /// How many of those guests the host turns away
        #[arg(long, default_value_t = 0)]
        deny: usize,

        /// Host also shares its screen
        #[arg(long)]
        screen_share: bool,
    },
    /// Print the effective configuration as JSON
    PrintConfig,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let mut config = Config::load(args.config.as_deref())?;
    if let Some(level) = args.log_level {
        config.logging.level = level;
    }
    config
        .validate()
        .map_err(|e| anyhow::anyhow!("Configuration validation failed: {e}"))?;

    match args.command {
        Command::PrintConfig => {
            println!("{}", serde_json::to_string_pretty(&config)?);
        }
        Command::Simulate {
            guests,
            deny,
            screen_share,
        } => {
            logging::init_logging(&config.logging)?;
            info!(room_id = %config.studio.room_id, guests, deny, "Starting studio simulation");
            let report = simulate::run(
                &config,
                simulate::Options {
                    guests,
                    deny: deny.min(guests),
                    screen_share,
                },
            )
            .await?;
            println!("{}", serde_json::to_string_pretty(&report)?);
        }
    }

    Ok(())
}
