//! rill-run: load a guest bundle headlessly and print what it built
//!
//! ## Example Usage
//!
//! ```bash
//! # Print the tree a bundle renders
//! rill-run app.js --props '{"title":"Inbox"}'
//!
//! # Deliver host events after the load, then dump everything
//! rill-run app.js --event refresh --event select='{"id":3}' --output all
//!
//! # Use a config file, overriding the timeout
//! rill-run app.js --config engine.json --timeout-ms 500
//! ```
//!
//! Load failures exit with status 1 and print the error kind on stderr.
//! Invalid arguments and unreadable files exit with status 2.

use std::path::PathBuf;
use std::process::ExitCode;

use anyhow::{Context, Result};
use clap::{Parser, ValueEnum};
use rill::{Engine, EngineConfig, EngineError, EngineOptions, GuestLogger, ProviderKind, Value};
use serde_json::{json, Value as Json};
use std::sync::Arc;
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(
    name = "rill-run",
    version,
    about = "Run a rill guest bundle headlessly",
    long_about = "Loads a guest bundle into a sandboxed engine with a headless receiver,\n\
                  delivers the requested host events and prints the resulting tree,\n\
                  health and diagnostics as JSON."
)]
struct Cli {
    /// Guest bundle (JavaScript, CommonJS style)
    bundle: PathBuf,

    /// Initial props as a JSON object
    #[arg(long)]
    props: Option<String>,

    /// Sandbox provider (default: probe the environment)
    #[arg(long)]
    provider: Option<ProviderKind>,

    /// Execution budget in milliseconds
    #[arg(long)]
    timeout_ms: Option<u64>,

    /// Module the bundle may require (repeatable; replaces the default list)
    #[arg(long = "allow", value_name = "MODULE")]
    allow: Vec<String>,

    /// Operations a single batch may apply before backpressure
    #[arg(long)]
    max_batch_size: Option<usize>,

    /// Host event to deliver after load, as NAME or NAME=JSON (repeatable)
    #[arg(long = "event", value_name = "NAME[=JSON]")]
    events: Vec<String>,

    /// Engine config file (JSON); flags override it
    #[arg(long)]
    config: Option<PathBuf>,

    /// Debug mode: verbose guest logging and engine tracing
    #[arg(long)]
    debug: bool,

    /// What to print
    #[arg(long, value_enum, default_value_t = Output::Tree)]
    output: Output,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, ValueEnum)]
enum Output {
    Tree,
    Health,
    Diagnostics,
    All,
}

/// Guest console output goes to stderr so stdout stays machine-readable.
struct StderrLogger;

impl GuestLogger for StderrLogger {
    fn log(&self, message: &str) {
        eprintln!("[guest] {message}");
    }

    fn warn(&self, message: &str) {
        eprintln!("[guest:warn] {message}");
    }

    fn error(&self, message: &str) {
        eprintln!("[guest:error] {message}");
    }
}

impl Cli {
    fn engine_config(&self) -> Result<EngineConfig> {
        let mut config = match &self.config {
            Some(path) => EngineConfig::load(path)?.with_env_overrides(),
            None => EngineConfig::from_env(),
        };
        if let Some(kind) = self.provider {
            config.provider = Some(kind);
        }
        if let Some(ms) = self.timeout_ms {
            config.timeout_ms = ms;
        }
        if !self.allow.is_empty() {
            config.require_whitelist = self.allow.clone();
        }
        if let Some(n) = self.max_batch_size {
            config.receiver_max_batch_size = n;
        }
        config.debug |= self.debug;
        Ok(config)
    }

    fn initial_props(&self) -> Result<Option<Value>> {
        self.props
            .as_deref()
            .map(|raw| {
                let json: Json = serde_json::from_str(raw).context("--props is not valid JSON")?;
                Ok(Value::from_json(&json))
            })
            .transpose()
    }

    fn host_events(&self) -> Result<Vec<(String, Value)>> {
        self.events.iter().map(|spec| parse_event(spec)).collect()
    }
}

fn parse_event(spec: &str) -> Result<(String, Value)> {
    match spec.split_once('=') {
        Some((name, raw)) => {
            let payload: Json = serde_json::from_str(raw)
                .with_context(|| format!("payload of event '{name}' is not valid JSON"))?;
            Ok((name.to_string(), Value::from_json(&payload)))
        }
        None => Ok((spec.to_string(), Value::Null)),
    }
}

fn init_tracing(debug: bool) {
    let default = if debug { "rill=debug,rill_sandbox=debug" } else { "warn" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

fn report(engine: &Engine, receiver: &rill::Receiver, output: Output) -> Result<Json> {
    let health = || serde_json::to_value(engine.get_health());
    let diagnostics = || serde_json::to_value(engine.get_diagnostics());
    Ok(match output {
        Output::Tree => receiver.snapshot(),
        Output::Health => health()?,
        Output::Diagnostics => diagnostics()?,
        Output::All => json!({
            "tree": receiver.snapshot(),
            "health": health()?,
            "diagnostics": diagnostics()?,
        }),
    })
}

async fn run(cli: Cli) -> Result<Result<Json, EngineError>> {
    let config = cli.engine_config()?;
    let props = cli.initial_props()?;
    let events = cli.host_events()?;
    let code = std::fs::read_to_string(&cli.bundle)
        .with_context(|| format!("failed to read bundle {}", cli.bundle.display()))?;

    let engine = match Engine::new(EngineOptions::new(config).with_logger(Arc::new(StderrLogger))) {
        Ok(engine) => engine,
        Err(err) => return Ok(Err(err)),
    };
    let outcome = async {
        let receiver = engine.create_receiver(|_| {})?;
        engine.load_bundle(&code, props).await?;
        for (name, payload) in events {
            engine.send_event(&name, payload)?;
        }
        Ok::<_, EngineError>(receiver)
    }
    .await;

    let result = match outcome {
        Ok(receiver) => {
            let receiver = receiver.borrow();
            Ok(report(&engine, &receiver, cli.output)?)
        }
        Err(err) => Err(err),
    };
    engine.destroy();
    Ok(result)
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> ExitCode {
    let cli = Cli::parse();
    init_tracing(cli.debug);

    match run(cli).await {
        Ok(Ok(out)) => match serde_json::to_string_pretty(&out) {
            Ok(text) => {
                println!("{text}");
                ExitCode::SUCCESS
            }
            Err(err) => {
                eprintln!("error: {err}");
                ExitCode::from(2)
            }
        },
        Ok(Err(err)) => {
            eprintln!("error[{}]: {}", err.kind(), err);
            ExitCode::from(1)
        }
        Err(err) => {
            eprintln!("error: {err:#}");
            ExitCode::from(2)
        }
    }
}
