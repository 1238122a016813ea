use anyhow::Context;
use beach_stream::terminal::app;
use beach_stream::terminal::cli::{Cli, Command};
use clap::Parser;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let label = match &cli.command {
        Command::Host(args) => format!("host on {}", args.listen),
        Command::Join(args) => format!("join {}", args.url),
    };
    app::run(cli).await.with_context(|| format!("beach-stream {label}"))
}
