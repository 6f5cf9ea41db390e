//! modelgate - alias-based routing and fallback dispatch across LLM providers
//!
//! A local gateway that maps caller-facing model aliases onto concrete
//! provider targets, scopes credentials per entry, and falls back across
//! candidates when a provider fails.

use std::path::Path;

use clap::{Parser, Subcommand};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use modelgate::config::Config;
use modelgate::credentials::CredentialResolver;

#[derive(Parser)]
#[command(name = "modelgate")]
#[command(about = "Alias-based routing, credential scoping and fallback dispatch across LLM providers")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the gateway server
    Serve {
        /// Path to configuration file
        #[arg(short, long, default_value = "config.toml")]
        config: String,

        /// Override listen address
        #[arg(short, long)]
        listen: Option<String>,
    },

    /// Validate configuration file and try resolving every credential
    Check {
        /// Path to configuration file
        #[arg(short, long, default_value = "config.toml")]
        config: String,
    },

    /// Show configured model entries
    Models {
        /// Path to configuration file
        #[arg(short, long, default_value = "config.toml")]
        config: String,
    },

    /// Print the candidates a request for ALIAS would try, in order
    Route {
        alias: String,

        /// Path to configuration file
        #[arg(short, long, default_value = "config.toml")]
        config: String,
    },
}

impl Commands {
    fn config_path(&self) -> &str {
        match self {
            Commands::Serve { config, .. }
            | Commands::Check { config }
            | Commands::Models { config }
            | Commands::Route { config, .. } => config,
        }
    }
}

fn init_tracing(level: &str) {
    let default_filter = format!("modelgate={},tower_http={}", level, level);
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| default_filter.into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let path = cli.command.config_path().to_string();
    let config = Config::from_file(Path::new(&path))?;
    init_tracing(&config.logging.level);
    tracing::info!(config = %path, models = config.models.len(), "Loaded configuration");

    match cli.command {
        Commands::Serve { listen, .. } => {
            let mut config = config;
            if let Some(addr) = listen {
                tracing::info!(listen = %addr, "Override listen address");
                config.server.listen = addr;
            }
            modelgate::server::run_server(config).await
        }

        Commands::Check { .. } => {
            println!(
                "Configuration OK: {} model entries, default strategy {}",
                config.models.len(),
                config.routing.default_strategy
            );

            // Diagnostic only: the gateway itself resolves credentials lazily
            let resolver = CredentialResolver::new();
            let mut failed = 0usize;
            for entry in config.entries() {
                if let Some(message) = &entry.config_error {
                    failed += 1;
                    println!(
                        "  FAILED  {} -> {}/{}: {}",
                        entry.alias, entry.provider_id, entry.target_model, message
                    );
                    continue;
                }
                match resolver.resolve(&entry.credential) {
                    Ok(_) => println!(
                        "  ok      {} -> {}/{} [{}]",
                        entry.alias,
                        entry.provider_id,
                        entry.target_model,
                        entry.credential.describe()
                    ),
                    Err(e) => {
                        failed += 1;
                        println!(
                            "  FAILED  {} -> {}/{} [{}]: {}",
                            entry.alias,
                            entry.provider_id,
                            entry.target_model,
                            entry.credential.describe(),
                            e
                        );
                    }
                }
            }
            if failed > 0 {
                tracing::warn!(failed, "Some model entries could not be resolved");
            }
            Ok(())
        }

        Commands::Models { .. } => {
            let router = config.router()?;
            println!(
                "{:<24} {:<14} {:<28} {:<14} CREDENTIAL",
                "ALIAS", "PROVIDER", "MODEL", "STRATEGY"
            );
            for entry in config.entries() {
                println!(
                    "{:<24} {:<14} {:<28} {:<14} {}",
                    entry.alias,
                    entry.provider_id,
                    entry.target_model,
                    router.strategy_for(&entry.alias),
                    entry.credential.describe()
                );
            }
            Ok(())
        }

        Commands::Route { alias, .. } => {
            let router = config.router()?;
            let decision = router.route(&alias)?;
            println!(
                "{} ({}): {} candidate(s)",
                decision.alias,
                router.strategy_for(&alias),
                decision.len()
            );
            for (position, candidate) in decision.candidates().iter().enumerate() {
                println!(
                    "  {}. {}/{} [{}]",
                    position + 1,
                    candidate.entry.provider_id,
                    candidate.target_model,
                    candidate.entry.credential.describe()
                );
            }
            Ok(())
        }
    }
}
