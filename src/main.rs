mod ezturp;

use clap::Parser;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = ezturp::app::Cli::parse();
    ezturp::run(cli).await
}
