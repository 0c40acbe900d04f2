use clap::{Parser, Subcommand};
use std::path::PathBuf;
use tracing::error;
use zapdesk_cli::{
    default_config_path, get_config_dir, init_tracing, load_config, run_check_number,
    run_onboarding, run_serve, run_status, verify,
};

#[derive(Parser)]
#[command(name = "zapdesk")]
#[command(version)]
#[command(about = "Multi-tenant WhatsApp help desk")]
struct Cli {
    /// Path to the config file (defaults to ~/.zapdesk/config.json)
    #[arg(short, long, global = true, env = "ZAPDESK_CONFIG")]
    config: Option<PathBuf>,
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Attach configured channels and start the gateway
    Serve,
    /// Run the setup wizard and seed the first channel
    Onboard,
    /// Show configuration and bridge reachability
    Status,
    /// Resolve a phone number to its WhatsApp id
    CheckNumber {
        /// Channel whose bridge session performs the lookup
        #[arg(long)]
        channel: i64,
        number: String,
    },
    /// Verify an AI prompt API key against the configured endpoint
    VerifyKey {
        key: String,
        /// Overrides the configured AI API base
        #[arg(long)]
        api_base: Option<String>,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let _guard = init_tracing(&get_config_dir().join("logs"));

    let cli = Cli::parse();

    match cli.command.unwrap_or(Commands::Serve) {
        Commands::Onboard => {
            let path = cli.config.unwrap_or_else(default_config_path);
            if let Err(e) = run_onboarding(path).await {
                error!("Onboarding failed: {:#}", e);
            }
        }
        Commands::Status => run_status(cli.config).await,
        Commands::Serve => {
            let config = load_config(cli.config)?;
            run_serve(config).await?;
        }
        Commands::CheckNumber { channel, number } => {
            let config = load_config(cli.config)?;
            let jid = run_check_number(&config, channel, &number).await?;
            println!("{}", jid);
        }
        Commands::VerifyKey { key, api_base } => {
            let api_base = match api_base {
                Some(base) => base,
                None => load_config(cli.config)?.ai.api_base,
            };
            match verify::verify_api_key(&api_base, &key).await {
                Ok(msg) => println!("{}", msg),
                Err(e) => println!("{}", e),
            }
        }
    }

    Ok(())
}
