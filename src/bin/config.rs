//! Gateway Config CLI
//!
//! View and manage schema registry configuration.

use clap::{Parser, Subcommand};
use gateway_schemas::GatewayConfig;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "schema-config")]
#[command(about = "View and manage gateway schema registry configuration")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Show current configuration
    Show {
        /// Config file to load (optional)
        #[arg(short, long)]
        config: Option<String>,

        /// Output as TOML
        #[arg(long)]
        toml: bool,

        /// Output as JSON
        #[arg(long)]
        json: bool,
    },

    /// Initialize a new config file
    Init {
        /// Output path (default: gateway.toml)
        #[arg(short, long, default_value = "gateway.toml")]
        output: String,
    },

    /// Validate configuration
    Validate {
        /// Config file to validate
        #[arg(short, long)]
        config: Option<String>,
    },
}

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();

    if let Err(e) = run(cli) {
        eprintln!("Error: {}", e);
        std::process::exit(1);
    }
}

fn run(cli: Cli) -> Result<(), Box<dyn std::error::Error>> {
    match cli.command {
        Commands::Show { config, toml, json } => {
            let cfg = GatewayConfig::load_from(config.as_deref())?;

            if json {
                println!("{}", serde_json::to_string_pretty(&cfg)?);
            } else if toml {
                println!("{}", ::toml::to_string_pretty(&cfg)?);
            } else {
                println!("📋 Gateway Schema Registry Configuration\n");
                println!("Branch:");
                println!("  Max versions: {}", cfg.branch.max_versions);
                println!("  Max unused: {}s", cfg.branch.max_unused_seconds);

                println!("\nRegistry:");
                println!("  Sweep interval: {}s", cfg.registry.sweep_interval_seconds);
                println!("  Inbox warn depth: {}", cfg.registry.inbox_warn_depth);
            }
        }

        Commands::Init { output } => {
            let cfg = GatewayConfig::default();
            cfg.save(&output)?;
            println!("✅ Created config file: {}", output);
        }

        Commands::Validate { config } => {
            let loaded = GatewayConfig::load_from(config.as_deref())
                .map_err(gateway_schemas::RegistryError::from)
                .and_then(|cfg| cfg.validate().map(|_| cfg));

            match loaded {
                Ok(cfg) => {
                    println!("✅ Configuration is valid");
                    println!("   Max versions: {}", cfg.branch.max_versions);
                    println!("   Max unused: {}s", cfg.branch.max_unused_seconds);
                }
                Err(e) => {
                    eprintln!("❌ Configuration error: {}", e);
                    std::process::exit(1);
                }
            }
        }
    }

    Ok(())
}
