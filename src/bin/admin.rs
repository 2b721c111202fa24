// pubflow admin CLI
// Operator commands against a running server; `run-due` doubles as the
// external trigger for scheduled runs (run it from cron)

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use colored::Colorize;
use serde_json::{json, Value};
use tracing::{debug, info, warn};

use pubflow::{ActionRun, ActionRunId, AutomationId, PubId};

#[derive(Parser)]
#[command(name = "pubflow-admin")]
#[command(about = "pubflow admin CLI - trigger due runs and inspect action runs")]
#[command(version = "0.1")]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Base URL of the pubflow server
    #[arg(long, env = "PUBFLOW_URL", default_value = "http://localhost:4000")]
    url: String,

    /// Bearer token for the RPC API
    #[arg(long, env = "PUBFLOW_TOKEN")]
    token: Option<String>,

    /// Community the command applies to
    #[arg(short, long, env = "PUBFLOW_COMMUNITY")]
    community: String,

    #[arg(short, long)]
    verbose: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Execute every scheduled run that is due
    RunDue,

    /// Cancel a scheduled run
    Cancel { action_run_id: ActionRunId },

    /// Run an automation immediately
    Run {
        automation_id: AutomationId,

        #[arg(long)]
        pub_id: Option<PubId>,
    },

    /// Show one action run
    ShowRun { action_run_id: ActionRunId },

    /// List action runs, optionally by status
    ListRuns {
        #[arg(long)]
        status: Option<String>,
    },
}

struct Client {
    http: reqwest::Client,
    base: String,
    token: Option<String>,
}

impl Client {
    fn new(url: &str, community: &str, token: Option<String>) -> Self {
        Self {
            http: reqwest::Client::new(),
            base: format!(
                "{}/api/v0/c/{}",
                url.trim_end_matches('/'),
                urlencoding::encode(community)
            ),
            token,
        }
    }

    fn request(&self, method: reqwest::Method, path: &str) -> reqwest::RequestBuilder {
        let builder = self.http.request(method, format!("{}{}", self.base, path));
        match &self.token {
            Some(token) => builder.bearer_auth(token),
            None => builder,
        }
    }

    async fn send(&self, builder: reqwest::RequestBuilder) -> Result<Value> {
        let response = builder.send().await.context("request to pubflow failed")?;
        let status = response.status();
        let body: Value = response.json().await.unwrap_or(Value::Null);
        if !status.is_success() {
            let message = body["error"]["message"].as_str().unwrap_or("unknown error");
            bail!("{} {}", status, message);
        }
        Ok(body)
    }

    async fn get(&self, path: &str) -> Result<Value> {
        self.send(self.request(reqwest::Method::GET, path)).await
    }

    async fn post(&self, path: &str, body: Value) -> Result<Value> {
        self.send(self.request(reqwest::Method::POST, path).json(&body))
            .await
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    if let Err(e) = dotenv::dotenv() {
        debug!("no .env file loaded: {}", e);
    }

    let cli = Cli::parse();
    let log_level = if cli.verbose { "debug" } else { "info" };
    tracing_subscriber::fmt().with_env_filter(log_level).init();

    let client = Client::new(&cli.url, &cli.community, cli.token.clone());

    match cli.command {
        Commands::RunDue => run_due(&client).await?,
        Commands::Cancel { action_run_id } => {
            client
                .post(&format!("/action-runs/{}/cancel", action_run_id), json!({}))
                .await?;
            println!("{} cancelled {}", "✓".green(), action_run_id);
        }
        Commands::Run {
            automation_id,
            pub_id,
        } => {
            let body = client
                .post(
                    &format!("/automations/{}/run", automation_id),
                    json!({ "pubId": pub_id, "stack": [] }),
                )
                .await?;
            print_result(&body["result"], 0);
        }
        Commands::ShowRun { action_run_id } => {
            let run: ActionRun =
                serde_json::from_value(client.get(&format!("/action-runs/{}", action_run_id)).await?)?;
            print_run(&run);
        }
        Commands::ListRuns { status } => {
            let path = match status {
                Some(status) => format!("/action-runs?status={}", urlencoding::encode(&status)),
                None => "/action-runs".to_string(),
            };
            let runs: Vec<ActionRun> = serde_json::from_value(client.get(&path).await?)?;
            if runs.is_empty() {
                println!("{}", "no action runs".dimmed());
            }
            for run in &runs {
                print_run(run);
            }
        }
    }

    Ok(())
}

async fn run_due(client: &Client) -> Result<()> {
    let due: Vec<ActionRun> = serde_json::from_value(client.get("/action-runs?due=true").await?)?;
    info!("⏰ {} due scheduled runs", due.len());

    let mut failed = 0;
    for run in &due {
        let automation_id = match run.automation_id {
            Some(id) => id,
            None => {
                warn!(action_run_id = %run.id, "scheduled run has no automation, skipping");
                continue;
            }
        };
        let body = json!({
            "pubId": run.pub_id,
            "event": run.event,
            "actionRunId": run.id,
            "stack": run.stack,
        });
        match client
            .post(&format!("/automations/{}/run-delayed", automation_id), body)
            .await
        {
            Ok(response) => print_result(&response["result"], 0),
            Err(e) => {
                failed += 1;
                println!("{} {} {}", "✗".red(), run.id, e);
            }
        }
    }

    if failed > 0 {
        bail!("{} of {} due runs could not be triggered", failed, due.len());
    }
    Ok(())
}

fn print_run(run: &ActionRun) {
    println!(
        "{} {} {} event={} pub={} depth={}",
        status_label(run.status.as_str()),
        run.id,
        run.run_at
            .map(|at| format!("run_at={}", at.to_rfc3339()))
            .unwrap_or_default(),
        run.event,
        run.pub_id.map(|p| p.to_string()).unwrap_or_else(|| "-".into()),
        run.stack.len(),
    );
    if let Some(error) = &run.error {
        println!("    {}", error.to_string().red());
    }
}

fn print_result(result: &Value, indent: usize) {
    let status = result["status"].as_str().unwrap_or("?");
    println!(
        "{}{} {}",
        "  ".repeat(indent),
        status_label(status),
        result["actionRunId"].as_str().unwrap_or("?")
    );
    if let Some(chained) = result["chained"].as_array() {
        for child in chained {
            print_result(child, indent + 1);
        }
    }
}

fn status_label(status: &str) -> colored::ColoredString {
    match status {
        "success" => status.green(),
        "failure" => status.red(),
        "cancelled" => status.yellow(),
        "scheduled" => status.cyan(),
        _ => status.normal(),
    }
}
