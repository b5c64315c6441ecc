use std::time::Duration;

use clap::{Parser, ValueEnum};
use cram_mcp_runtime::{DEFAULT_TIMEOUT_SECS, McpCommands, McpRuntimeConfig, run as run_mcp};
use serde_json::json;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Clone, Copy, Debug, PartialEq, Eq, ValueEnum)]
enum LogFormat {
    Json,
    Pretty,
}

#[derive(Parser)]
#[command(
    name = "cram-mcp",
    version,
    about = "cram-books MCP server: books, students and weekly planners over stdio"
)]
struct Cli {
    /// Execution endpoint of the spreadsheet backend
    #[arg(long, env = "EXEC_URL")]
    exec_url: Option<String>,

    /// Per-request upstream timeout in seconds
    #[arg(long, env = "CRAM_HTTP_TIMEOUT_SECS", default_value_t = DEFAULT_TIMEOUT_SECS)]
    timeout_secs: u64,

    /// Log output format (always written to stderr)
    #[arg(long, env = "CRAM_LOG_FORMAT", value_enum, default_value_t = LogFormat::Json)]
    log_format: LogFormat,

    #[command(subcommand)]
    command: McpCommands,
}

fn init_tracing(format: LogFormat) {
    // stdout carries the protocol
    let registry = tracing_subscriber::registry().with(
        tracing_subscriber::EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| "cram_mcp=info,cram_mcp_runtime=info".into()),
    );
    match format {
        LogFormat::Json => registry
            .with(tracing_subscriber::fmt::layer().json().with_writer(std::io::stderr))
            .init(),
        LogFormat::Pretty => registry
            .with(tracing_subscriber::fmt::layer().pretty().with_writer(std::io::stderr))
            .init(),
    }
}

fn parse_exec_url(raw: Option<&str>) -> Result<url::Url, String> {
    let raw = raw
        .map(str::trim)
        .filter(|raw| !raw.is_empty())
        .ok_or_else(|| "EXEC_URL is not set".to_string())?;
    let url = url::Url::parse(raw).map_err(|e| format!("EXEC_URL is not a valid URL: {e}"))?;
    if !matches!(url.scheme(), "http" | "https") {
        return Err(format!(
            "EXEC_URL must use http or https, got '{}'",
            url.scheme()
        ));
    }
    Ok(url)
}

#[tokio::main]
async fn main() {
    let _ = dotenvy::dotenv();
    let cli = Cli::parse();
    init_tracing(cli.log_format);

    let exec_url = match parse_exec_url(cli.exec_url.as_deref()) {
        Ok(url) => url,
        Err(message) => {
            let payload = json!({ "error": "config_error", "message": message });
            eprintln!("{payload}");
            std::process::exit(2);
        }
    };

    let config = McpRuntimeConfig {
        exec_url,
        timeout: Duration::from_secs(cli.timeout_secs.max(1)),
    };
    let code = run_mcp(config, cli.command).await;
    std::process::exit(code);
}
