use clap::{Parser, Subcommand};
use reqwest::header::{HeaderMap, HeaderValue, AUTHORIZATION};
use serde_json::Value;

#[derive(Parser)]
#[command(name = "proxy-cli")]
#[command(about = "Admin CLI for upstream-proxy", long_about = None)]
struct Cli {
    #[arg(short, long, default_value = "http://localhost:8081")]
    url: String,

    /// Admin API bearer key.
    #[arg(short, long, env = "UPSTREAM_PROXY_ADMIN_KEY")]
    key: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Uptime and open connections
    Status,
    /// Peer state for every upstream
    Upstreams {
        /// Show one upstream only.
        name: Option<String>,
    },
    /// Reports of the most recent sessions
    Sessions {
        #[arg(short, long, default_value_t = 10)]
        limit: usize,
    },
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();
    let client = reqwest::Client::new();

    let mut headers = HeaderMap::new();
    headers.insert(AUTHORIZATION, HeaderValue::from_str(&format!("Bearer {}", cli.key))?);

    let path = match &cli.command {
        Commands::Status => "status",
        Commands::Upstreams { .. } => "upstreams",
        Commands::Sessions { .. } => "sessions",
    };
    let res = client
        .get(format!("{}/admin/{}", cli.url.trim_end_matches('/'), path))
        .headers(headers)
        .send()
        .await?;

    let status = res.status();
    if !status.is_success() {
        eprintln!("Error: Admin API returned status {}", status);
        if let Ok(text) = res.text().await {
            eprintln!("Response: {}", text);
        }
        std::process::exit(1);
    }

    let mut json: Value = res.json().await?;
    match cli.command {
        Commands::Upstreams { name: Some(name) } => {
            if let Value::Array(upstreams) = &mut json {
                upstreams.retain(|u| u.get("name").and_then(Value::as_str) == Some(name.as_str()));
            }
        }
        Commands::Sessions { limit } => {
            if let Value::Array(sessions) = &mut json {
                sessions.truncate(limit);
            }
        }
        _ => {}
    }
    println!("{}", serde_json::to_string_pretty(&json)?);
    Ok(())
}
