//! ilmp - ILMP streaming client
//!
//! Connects to an ILMP server, optionally sends one command with a printing
//! callback, and reports everything the server pushes back.

mod config;

use clap::{Parser, Subcommand};
use config::Config;
use ilmp_client::{Connection, Fault, Tokens, WireVersion};
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "ilmp")]
#[command(about = "Inspect and watch ILMP streaming servers")]
#[command(version)]
struct Cli {
    /// YAML config file
    #[arg(short, long, env = "ILMP_CONFIG")]
    config: Option<PathBuf>,

    /// Server host
    #[arg(long)]
    host: Option<String>,

    /// Server port
    #[arg(short, long)]
    port: Option<u16>,

    /// Site directory named in commands
    #[arg(long)]
    site_dir: Option<String>,

    /// Seconds between keepalive pings
    #[arg(long)]
    ping_interval: Option<u64>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Connect and report the negotiated wire format
    Status {
        /// Seconds to wait for the server to reveal its wire format
        #[arg(long, default_value_t = 5)]
        wait: u64,
    },

    /// Send a command and print what its callback receives
    Watch {
        /// Command name
        name: String,

        /// Pageview id
        #[arg(long, default_value_t = 1)]
        pageview: i64,

        /// Arguments: int:<n>, plain:<text> or json:<document>
        args: Vec<Argument>,

        /// Do not append a callback to the command
        #[arg(long)]
        no_callback: bool,
    },
}

#[derive(Debug, Clone)]
enum Argument {
    Int(i64),
    Plain(String),
    Json(String),
}

impl FromStr for Argument {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.split_once(':') {
            Some(("int", value)) => value
                .parse()
                .map(Argument::Int)
                .map_err(|e| format!("invalid int '{}': {}", value, e)),
            Some(("plain", value)) => Ok(Argument::Plain(value.to_string())),
            Some(("json", value)) => Ok(Argument::Json(value.to_string())),
            _ => Err(format!(
                "expected int:<n>, plain:<text> or json:<document>, got '{}'",
                s
            )),
        }
    }
}

enum Event {
    Ready,
    Fault(Fault),
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();

    let mut config = match &cli.config {
        Some(path) => {
            let config = Config::load_from(path)?;
            tracing::info!("Loaded config from {}", path.display());
            config
        }
        None => Config::from_env(),
    };
    if let Some(host) = cli.host {
        config.server.host = host;
    }
    if let Some(port) = cli.port {
        config.server.port = port;
    }
    if let Some(site_dir) = cli.site_dir {
        config.server.site_dir = site_dir;
    }
    if let Some(secs) = cli.ping_interval {
        config.keepalive.ping_interval_secs = secs;
    }

    let conn = Connection::new(config.connection_config());
    let (tx, mut events) = mpsc::unbounded_channel();
    let ready_tx = tx.clone();
    conn.on_ready(move || {
        let _ = ready_tx.send(Event::Ready);
    });
    conn.on_error(move |fault| {
        let _ = tx.send(Event::Fault(fault));
    });

    tracing::info!(
        "Connecting to {}:{}",
        config.server.host,
        config.server.port
    );
    conn.connect()?;

    match events.recv().await {
        Some(Event::Ready) => tracing::info!(conn = %conn.id(), "Connected"),
        Some(Event::Fault(fault)) => return Err(fault.into()),
        None => return Err("connection dropped its hooks".into()),
    }

    let result = match cli.command {
        Commands::Status { wait } => status(&conn, &mut events, Duration::from_secs(wait)).await,
        Commands::Watch {
            name,
            pageview,
            args,
            no_callback,
        } => watch(&conn, &mut events, &name, pageview, args, no_callback).await,
    };

    conn.close();
    result
}

/// Waits until the first inbound frame settles the wire format.
async fn status(
    conn: &Connection,
    events: &mut mpsc::UnboundedReceiver<Event>,
    wait: Duration,
) -> Result<(), Box<dyn std::error::Error>> {
    let deadline = tokio::time::Instant::now() + wait;

    while tokio::time::Instant::now() < deadline {
        if let Ok(Event::Fault(fault)) = events.try_recv() {
            return Err(fault.into());
        }
        if conn.protocol_version() != WireVersion::AwaitingVersion {
            break;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }

    match conn.protocol_version() {
        WireVersion::AwaitingVersion => println!("connected; server sent nothing yet"),
        WireVersion::V1 => println!("connected; legacy (v1) wire format"),
        WireVersion::V2 => println!("connected; batched (v2) wire format"),
    }
    Ok(())
}

/// Sends one command and prints deliveries until a fault or Ctrl-C.
async fn watch(
    conn: &Connection,
    events: &mut mpsc::UnboundedReceiver<Event>,
    name: &str,
    pageview: i64,
    args: Vec<Argument>,
    no_callback: bool,
) -> Result<(), Box<dyn std::error::Error>> {
    let mut cmd = conn.command(name, pageview);
    for arg in args {
        cmd = match arg {
            Argument::Int(value) => cmd.int(value),
            Argument::Plain(value) => cmd.plain(value),
            Argument::Json(value) => cmd.json(value),
        };
    }
    if !no_callback {
        cmd = cmd.callback(Printer);
    }
    if let Some(handle) = cmd.last_callback() {
        tracing::info!(
            pageview_id = handle.pageview_id(),
            callback_id = handle.callback_id(),
            "Registered callback"
        );
    }
    cmd.send();

    loop {
        tokio::select! {
            event = events.recv() => match event {
                Some(Event::Fault(fault)) => return Err(fault.into()),
                Some(Event::Ready) => {}
                None => return Ok(()),
            },
            _ = tokio::signal::ctrl_c() => {
                tracing::info!("Interrupted");
                for info in conn.callbacks() {
                    tracing::info!(
                        pageview_id = info.pageview_id,
                        callback_id = info.callback_id,
                        refcount = info.refcount,
                        "Callback still registered"
                    );
                }
                return Ok(());
            }
        }
    }
}

struct Printer;

impl ilmp_client::Callback for Printer {
    fn on_data(&mut self, params: &mut Tokens<'_>) {
        let params: Vec<String> = params
            .map(|p| String::from_utf8_lossy(p).into_owned())
            .collect();
        println!("{}", params.join(" | "));
    }

    fn on_json(&mut self, json: &[u8]) {
        match serde_json::from_slice::<serde_json::Value>(json) {
            Ok(value) => println!("{:#}", value),
            Err(_) => println!("{}", String::from_utf8_lossy(json)),
        }
    }
}

impl Drop for Printer {
    fn drop(&mut self) {
        tracing::info!("Callback released");
    }
}
