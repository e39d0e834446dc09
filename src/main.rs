use clap::Parser;
use flowplane::cli::Cli;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    cli.init_logging()?;

    if !cli.execute().await? {
        std::process::exit(1);
    }
    Ok(())
}
