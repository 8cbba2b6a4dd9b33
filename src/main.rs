//! hubwire-probe - connect to a hub, listen for events, call methods.
//!
//! Useful for poking a hub server from the terminal. Events are printed to
//! stdout as JSON lines; logs go to stderr (`RUST_LOG` controls the level).

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use clap::Parser;
use hubwire::{ConnectionOptions, HubContext, ProviderProps, ProviderState, RawHandler};
use serde_json::Value;

hubwire::hub! {
    /// Untyped descriptor: the probe only uses raw names.
    hub ProbeHub {
        methods {}
        callbacks {}
    }
}

#[derive(Parser)]
#[command(name = "hubwire-probe")]
#[command(version)]
#[command(about = "Connect to a hub, print pushed events and invoke methods")]
struct Cli {
    /// Hub endpoint URL (http(s):// or ws(s)://).
    #[arg(long)]
    endpoint: Option<String>,

    /// JSON file with connection options.
    #[arg(long)]
    config: Option<PathBuf>,

    /// Access token sent with negotiate and the socket upgrade.
    #[arg(long)]
    token: Option<String>,

    /// Connect over WebSocket directly, without negotiating.
    #[arg(long)]
    skip_negotiation: bool,

    /// Do not reconnect when the connection drops.
    #[arg(long)]
    no_reconnect: bool,

    /// Print events pushed under this name (repeatable).
    #[arg(long = "listen", value_name = "NAME")]
    listen: Vec<String>,

    /// Invoke this method once connected.
    #[arg(long, value_name = "NAME")]
    invoke: Option<String>,

    /// Positional arguments for --invoke, as a JSON array.
    #[arg(long, default_value = "[]")]
    args: String,
}

/// Merge file, environment and command-line settings.
fn build_options(cli: &Cli) -> Result<ConnectionOptions> {
    let mut options = match &cli.config {
        Some(path) => ConnectionOptions::load(path)?,
        None => {
            let mut options = ConnectionOptions::default();
            options.apply_env_overrides();
            options
        }
    };

    if let Some(endpoint) = &cli.endpoint {
        options.endpoint.clone_from(endpoint);
    }
    if let Some(token) = &cli.token {
        options.access_token = Some(token.clone());
    }
    if cli.skip_negotiation {
        options.skip_negotiation = true;
    }

    if options.endpoint.is_empty() {
        bail!("no hub endpoint: pass --endpoint, --config or set HUBWIRE_ENDPOINT");
    }
    Ok(options)
}

fn parse_args(raw: &str) -> Result<Vec<Value>> {
    let value: Value = serde_json::from_str(raw).context("--args is not valid JSON")?;
    match value {
        Value::Array(items) => Ok(items),
        _ => bail!("--args must be a JSON array"),
    }
}

fn print_event(name: &str) -> RawHandler {
    let name = name.to_string();
    Arc::new(move |args: &[Value]| {
        let line = serde_json::json!({ "event": name, "args": args });
        println!("{line}");
    })
}

#[tokio::main]
async fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info"))
        .format_timestamp_secs()
        .init();

    let cli = Cli::parse();
    let options = build_options(&cli)?;
    let invoke_args = parse_args(&cli.args)?;

    let context = HubContext::<ProbeHub>::new();
    let mut provider = context.provider();
    provider
        .activate(ProviderProps::new(options).with_auto_reconnect(!cli.no_reconnect))
        .await;

    if provider.state() != ProviderState::Connected {
        bail!("could not connect to the hub (state {:?})", provider.state());
    }

    for name in &cli.listen {
        context.subscribe_raw(name, print_event(name))?;
        log::info!("Listening for '{}'", name);
    }

    if let Some(method) = &cli.invoke {
        let result = context
            .invoker()
            .invoke_raw(method, invoke_args)
            .await
            .with_context(|| format!("invoking '{method}' failed"))?;
        println!("{}", serde_json::json!({ "invoke": method, "result": result }));
    }

    if !cli.listen.is_empty() {
        let mut state = provider.watch_state();
        tokio::select! {
            result = tokio::signal::ctrl_c() => {
                result.context("failed to listen for Ctrl-C")?;
                log::info!("Interrupted, disconnecting");
            }
            () = async {
                while state.changed().await.is_ok() {
                    if *state.borrow() == ProviderState::Closed {
                        break;
                    }
                }
            } => {
                log::warn!("Connection closed");
            }
        }
    }

    provider.deactivate().await;
    Ok(())
}
