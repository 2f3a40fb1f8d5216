//! Warden CLI
//!
//! Usage:
//!   warden check --config warden.yaml
//!   warden eval --config warden.yaml --request review.json
//!   warden eval --config warden.yaml < review.json
//!
//! `eval` accepts either a bare admission request or a full `AdmissionReview`
//! and prints the `AdmissionReview` carrying the decision.

use std::io::Read;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, bail};
use clap::{Parser, Subcommand};
use serde_json::{Value, json};
use tracing::info;
use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

use warden::{AdmissionRequest, AdmissionReview, Controller, PolicyRegistry, RegistryOptions, ReviewVersion};

/// Warden - admission decisions from WebAssembly policies
#[derive(Parser, Debug)]
#[command(name = "warden")]
#[command(about = "Evaluate admission requests against Wasm policies")]
struct Args {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Load every policy and validate its settings
    Check {
        /// Configuration file
        #[arg(long, short)]
        config: PathBuf,
    },
    /// Evaluate one admission request
    Eval {
        /// Configuration file
        #[arg(long, short)]
        config: PathBuf,
        /// Request or AdmissionReview as JSON; read from stdin when omitted
        #[arg(long, short)]
        request: Option<PathBuf>,
        /// Deadline for each policy, overriding the configured ones
        #[arg(long)]
        timeout_ms: Option<u64>,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Logs go to stderr so stdout only carries the review
    tracing_subscriber::registry()
        .with(fmt::layer().with_writer(std::io::stderr))
        .with(EnvFilter::from_default_env().add_directive(tracing::Level::INFO.into()))
        .init();

    let args = Args::parse();
    match args.command {
        Command::Check { config } => {
            let controller = controller(&config).await?;
            info!(policies = controller.registry().len(), "all policies are valid");
        }
        Command::Eval {
            config,
            request,
            timeout_ms,
        } => {
            let input = read_input(request.as_deref())?;
            let (version, request) = parse_request(&input)?;
            let controller = controller(&config).await?;

            let decision = match timeout_ms {
                Some(ms) => {
                    controller
                        .validate_with_timeout(&request, Duration::from_millis(ms))
                        .await
                }
                None => controller.validate(&request).await,
            };
            let review = json!({
                "apiVersion": version.api_version(),
                "kind": "AdmissionReview",
                "response": decision.into_response(&request.uid),
            });
            println!("{}", serde_json::to_string_pretty(&review)?);
        }
    }

    Ok(())
}

async fn controller(config: &Path) -> anyhow::Result<Controller> {
    let settings = warden::config::load_from_file(config)
        .with_context(|| format!("cannot load {}", config.display()))?;
    let registry = PolicyRegistry::load(&settings, RegistryOptions::default()).await?;
    let controller = Controller::builder(registry).initialize().await?;
    Ok(controller)
}

fn read_input(path: Option<&Path>) -> anyhow::Result<String> {
    match path {
        Some(path) => std::fs::read_to_string(path)
            .with_context(|| format!("cannot read {}", path.display())),
        None => {
            let mut input = String::new();
            std::io::stdin()
                .read_to_string(&mut input)
                .context("cannot read stdin")?;
            Ok(input)
        }
    }
}

/// The request and the review version to answer with.
fn parse_request(input: &str) -> anyhow::Result<(ReviewVersion, AdmissionRequest)> {
    let value: Value = serde_json::from_str(input).context("input is not JSON")?;
    if value.get("kind").and_then(Value::as_str) != Some("AdmissionReview") {
        let request = serde_json::from_value(value).context("invalid admission request")?;
        return Ok((ReviewVersion::V1, request));
    }

    let review: AdmissionReview = serde_json::from_value(value).context("invalid AdmissionReview")?;
    let version = ReviewVersion::SUPPORTED
        .into_iter()
        .find(|v| v.api_version() == review.api_version)
        .unwrap_or(ReviewVersion::V1);
    let Some(request) = review.request else {
        bail!("AdmissionReview has no request");
    };
    Ok((version, request))
}
