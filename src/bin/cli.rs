//! CLI for cluster operations

use anyhow::{bail, Context};
use clap::{Parser, Subcommand};
use pgmon::common::format_kb;
use serde_json::{json, Value};

#[derive(Parser)]
#[command(name = "pgmon")]
#[command(about = "pgmon placement-group monitor CLI")]
#[command(version)]
struct Cli {
    /// Coordinator URL
    #[arg(long, default_value = "http://localhost:6800")]
    coordinator: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Cluster health
    Health {
        /// Print every affected node and PG
        #[arg(long)]
        detail: bool,
    },

    /// Placement group views
    Pg {
        #[command(subcommand)]
        command: PgCommands,
    },

    /// Per-pool object counts
    PoolStats {
        /// Pool IDs
        #[arg(required = true)]
        pools: Vec<u64>,
    },

    /// Cluster capacity
    Statfs,

    /// Replica role and proposal state
    Status,

    SetFullRatio { ratio: f32 },

    SetNearfullRatio { ratio: f32 },

    /// Mark a PG for re-creation
    ForceCreatePg { pgid: String },

    /// Submit a node report from a JSON file
    Report {
        node: String,
        #[arg(long)]
        file: std::path::PathBuf,
    },
}

#[derive(Subcommand)]
enum PgCommands {
    /// Summary line
    Stat,
    /// Full PG map as JSON
    Dump,
    /// One PG
    Map { pgid: String },
}

struct Client {
    base: String,
    http: reqwest::Client,
}

impl Client {
    async fn get(&self, path: &str) -> anyhow::Result<Value> {
        let resp = self
            .http
            .get(format!("{}{}", self.base, path))
            .send()
            .await
            .with_context(|| format!("GET {}", path))?;
        Self::decode(resp).await
    }

    async fn post(&self, path: &str, body: Value) -> anyhow::Result<Value> {
        let resp = self
            .http
            .post(format!("{}{}", self.base, path))
            .json(&body)
            .send()
            .await
            .with_context(|| format!("POST {}", path))?;
        Self::decode(resp).await
    }

    async fn decode(resp: reqwest::Response) -> anyhow::Result<Value> {
        let status = resp.status();
        let body: Value = resp.json().await.unwrap_or(Value::Null);
        if !status.is_success() {
            let msg = body["error"].as_str().unwrap_or("no details");
            bail!("coordinator answered {}: {}", status, msg);
        }
        Ok(body)
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt::init();

    let cli = Cli::parse();
    let client = Client {
        base: cli.coordinator.trim_end_matches('/').to_string(),
        http: reqwest::Client::new(),
    };

    match cli.command {
        Commands::Health { detail } => {
            let report = client.get("/health").await?;
            println!("{}", report["status"].as_str().unwrap_or("UNKNOWN"));
            let mut sections = vec!["summary"];
            if detail {
                sections.push("detail");
            }
            for section in sections {
                for line in report[section].as_array().into_iter().flatten() {
                    println!("  {}", line.as_str().unwrap_or_default());
                }
            }
        }

        Commands::Pg { command } => match command {
            PgCommands::Stat => {
                let s = client.get("/pg/stat").await?;
                let states: Vec<String> = s["by_state"]
                    .as_object()
                    .into_iter()
                    .flatten()
                    .map(|(state, n)| format!("{} {}", n, state))
                    .collect();
                println!(
                    "v{}: {} pgs: {}; {} objects; {} used, {} / {} avail",
                    s["version"],
                    s["num_pgs"],
                    states.join(", "),
                    s["num_objects"],
                    format_kb(s["kb_used"].as_u64().unwrap_or(0)),
                    format_kb(s["kb_avail"].as_u64().unwrap_or(0)),
                    format_kb(s["kb"].as_u64().unwrap_or(0)),
                );
            }
            PgCommands::Dump => {
                let dump = client.get("/pg/dump").await?;
                println!("{}", serde_json::to_string_pretty(&dump)?);
            }
            PgCommands::Map { pgid } => {
                let resp = client
                    .post("/query", json!({ "query": "pg_map", "pgid": pgid }))
                    .await?;
                println!("{}", serde_json::to_string_pretty(&resp["stat"])?);
            }
        },

        Commands::PoolStats { pools } => {
            let resp = client
                .post("/query", json!({ "query": "pool_stats", "pools": pools }))
                .await?;
            for (pool, stat) in resp["pools"].as_object().into_iter().flatten() {
                println!(
                    "pool {}: {} pgs, {} objects, {} degraded, {} unfound",
                    pool,
                    stat["num_pgs"],
                    stat["num_objects"],
                    stat["num_objects_degraded"],
                    stat["num_objects_unfound"]
                );
            }
        }

        Commands::Statfs => {
            let resp = client.post("/query", json!({ "query": "statfs" })).await?;
            println!("Capacity:");
            println!("  Total: {}", format_kb(resp["kb"].as_u64().unwrap_or(0)));
            println!("  Used: {}", format_kb(resp["kb_used"].as_u64().unwrap_or(0)));
            println!("  Available: {}", format_kb(resp["kb_avail"].as_u64().unwrap_or(0)));
            println!("  Objects: {}", resp["num_objects"]);
        }

        Commands::Status => {
            let status = client.get("/admin/status").await?;
            println!("{}", serde_json::to_string_pretty(&status)?);
        }

        Commands::SetFullRatio { ratio } => {
            let ack = client
                .post("/command", json!({ "command": "set_full_ratio", "ratio": ratio }))
                .await?;
            println!("{}", ack["ack"].as_str().unwrap_or_default());
        }

        Commands::SetNearfullRatio { ratio } => {
            let ack = client
                .post(
                    "/command",
                    json!({ "command": "set_nearfull_ratio", "ratio": ratio }),
                )
                .await?;
            println!("{}", ack["ack"].as_str().unwrap_or_default());
        }

        Commands::ForceCreatePg { pgid } => {
            let ack = client
                .post("/command", json!({ "command": "force_create_pg", "pgid": pgid }))
                .await?;
            println!("{}", ack["ack"].as_str().unwrap_or_default());
        }

        Commands::Report { node, file } => {
            let raw = std::fs::read(&file)
                .with_context(|| format!("reading {}", file.display()))?;
            let report: Value = serde_json::from_slice(&raw)?;
            let ack = client.post(&format!("/report/{}", node), report).await?;
            println!("{}", ack);
        }
    }

    Ok(())
}
