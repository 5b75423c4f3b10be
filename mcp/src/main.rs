use clap::Parser;
use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

use semlayer_mcp_runtime::{McpCommands, RuntimeArgs, run as run_mcp};

#[derive(Parser)]
#[command(
    name = "semlayer-mcp",
    version,
    about = "MCP server exposing a dbt semantic layer over stdio"
)]
struct Cli {
    #[command(flatten)]
    runtime: RuntimeArgs,

    #[command(subcommand)]
    command: McpCommands,
}

fn init_tracing(json: bool) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| "semlayer_mcp=info,semlayer_mcp_runtime=info".into());
    let registry = tracing_subscriber::registry().with(filter);
    // stdout is the protocol channel
    if json {
        registry
            .with(
                tracing_subscriber::fmt::layer()
                    .json()
                    .with_writer(std::io::stderr),
            )
            .init();
    } else {
        registry
            .with(
                tracing_subscriber::fmt::layer()
                    .with_ansi(false)
                    .with_writer(std::io::stderr),
            )
            .init();
    }
}

#[tokio::main]
async fn main() {
    let _ = dotenvy::dotenv();
    let cli = Cli::parse();
    init_tracing(cli.runtime.log_json);

    let code = run_mcp(cli.runtime, cli.command).await;
    std::process::exit(code);
}
