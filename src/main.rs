use clap::{Parser, Subcommand};
use smsbatch::config::resolve_config_path;
use std::path::PathBuf;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Parser)]
#[command(name = "smsbatch")]
#[command(about = "Windowed, rate-limited SMS batch dispatcher", long_about = None)]
struct Cli {
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Serve the trigger API and run dispatch cycles on the configured schedule
    Run,
    /// Run one dispatch cycle and print its report
    Cycle,
    Config {
        #[command(subcommand)]
        action: ConfigAction,
    },
    Template {
        #[command(subcommand)]
        action: TemplateAction,
    },
}

#[derive(Subcommand)]
enum ConfigAction {
    Init {
        #[arg(long)]
        stdout: bool,
    },
    Validate,
}

#[derive(Subcommand)]
enum TemplateAction {
    Add {
        /// Template id; a random one is generated when omitted
        #[arg(long)]
        id: Option<String>,
        /// Column holding the sender id of each record
        #[arg(long)]
        sender_field: String,
        /// Body text with {{FIELD}} placeholders
        text: String,
    },
    List,
    Remove {
        id: String,
    },
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "smsbatch=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let cli = Cli::parse();

    let config_path = resolve_config_path(cli.config.as_deref());

    match cli.command {
        Some(Commands::Run) | None => {
            smsbatch::cli::run::run(config_path).await?;
        }
        Some(Commands::Cycle) => {
            smsbatch::cli::run::cycle(config_path).await?;
        }
        Some(Commands::Config { action }) => match action {
            ConfigAction::Init { stdout } => {
                smsbatch::cli::config::init(stdout)?;
            }
            ConfigAction::Validate => {
                smsbatch::cli::config::validate(config_path)?;
            }
        },
        Some(Commands::Template { action }) => match action {
            TemplateAction::Add {
                id,
                sender_field,
                text,
            } => {
                smsbatch::cli::template::add(config_path, id, text, sender_field).await?;
            }
            TemplateAction::List => {
                smsbatch::cli::template::list(config_path).await?;
            }
            TemplateAction::Remove { id } => {
                smsbatch::cli::template::remove(config_path, id).await?;
            }
        },
    }

    Ok(())
}
