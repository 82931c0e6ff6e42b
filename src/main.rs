use clap::{Parser, Subcommand};
use qwq_serve::{ModelManager, ModelSource, Result, ServeArgs};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "qwq-serve")]
#[command(about = "Chat-completion HTTP service for a Hugging Face causal language model")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Load the model and serve the chat API
    Serve(ServeArgs),
    /// Download the model files into the local cache
    Pull(ModelSource),
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Serve(args) => ModelManager::new(args.into_config()?).serve().await?,
        Commands::Pull(source) => ModelManager::pull(&source).await?,
    }

    Ok(())
}
