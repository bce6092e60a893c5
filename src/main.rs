//! Binary entrypoint for the meshscope CLI.
//!
//! Commands:
//! - `init` - create a starter `config.toml`
//! - `color <ID>...` - print the display color assigned to each node id
//! - `replay <CAPTURE>` - run the ingestion pipeline against a recorded capture and print a
//!   JSON summary of what was observed
//!
//! See the library crate docs for module-level details: `meshscope::`.
use anyhow::{anyhow, Result};
use clap::{Parser, Subcommand};
use log::{info, warn};
use std::path::PathBuf;
use std::sync::Arc;

use meshscope::broadcast::{EventBroadcaster, SubscriberId, Subscription};
use meshscope::color::color_for;
use meshscope::config::Config;
use meshscope::connection::ConnectionManager;
use meshscope::model::{ConnectionStatus, LogMessage, Node, Packet};
use meshscope::monitor::MeshView;
use meshscope::transport::replay::ReplayProvider;

#[derive(Parser)]
#[command(name = "meshscope")]
#[command(about = "Telemetry ingestion and monitoring for packet-radio mesh networks")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Configuration file path (can be used before or after subcommand)
    #[arg(short, long, default_value = "config.toml", global = true)]
    config: String,

    /// Verbose logging (-v, -vv for more; may appear before or after subcommand)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    verbose: u8,
}

#[derive(Subcommand)]
enum Commands {
    /// Write a default configuration file
    Init,
    /// Show the display color assigned to node ids
    Color {
        #[arg(required = true)]
        ids: Vec<String>,
    },
    /// Replay a recorded JSON-lines capture through the ingestion pipeline
    Replay {
        /// Capture file
        capture: PathBuf,
        /// Link kind to request (serial, network, ble); defaults to the configured kind
        #[arg(short, long)]
        kind: Option<String>,
        /// Serial port path
        #[arg(short, long)]
        port: Option<String>,
        /// Network host
        #[arg(long)]
        host: Option<String>,
        /// Short-range wireless device address
        #[arg(long)]
        address: Option<String>,
        /// Multiplier for recorded delays (0 replays as fast as possible)
        #[arg(long, default_value_t = 1.0)]
        pace: f64,
        /// Print only the final summary, not each event
        #[arg(long)]
        summary: bool,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Commands::Init => {
            init_logging(&None, cli.verbose);
            Config::create_default(&cli.config).await?;
            info!("Configuration file created at {}", cli.config);
        }
        Commands::Color { ids } => {
            for id in ids {
                let color = color_for(&id);
                let (r, g, b) = color.to_rgb();
                println!(
                    "{}\thue={} sat={} val={}\trgb=({}, {}, {})\t{}",
                    id,
                    color.hue,
                    color.saturation,
                    color.value,
                    r,
                    g,
                    b,
                    color.hex()
                );
            }
        }
        Commands::Replay {
            capture,
            kind,
            port,
            host,
            address,
            pace,
            summary,
        } => {
            let config = match Config::load(&cli.config).await {
                Ok(config) => Some(config),
                Err(e) => {
                    eprintln!("{} (using defaults)", e);
                    None
                }
            };
            init_logging(&config, cli.verbose);
            let config = config.unwrap_or_default();

            let mut params = config.connect_params();
            if port.is_some() {
                params.port = port;
            }
            if host.is_some() {
                params.host = host;
            }
            if address.is_some() {
                params.address = address;
            }
            let kind = kind.unwrap_or_else(|| config.connection.kind.clone());

            let events = EventBroadcaster::new();
            let follower = Follower::subscribe(&events);
            let follower_ids = follower.ids();
            let mut status = events.connection_status().subscribe();
            let printer =
                tokio::spawn(follower.run(MeshView::from_config(&config.monitor), !summary));

            let provider = ReplayProvider::new(&capture).with_pace(pace);
            let mut manager = ConnectionManager::new(Arc::new(provider), events.clone())
                .with_tuning(config.tuning());

            let outcome = manager.connect(&kind, &params);
            if outcome.is_ok() {
                info!("Replaying {}", capture.display());
                wait_until_idle(&manager, &mut status).await;
            }
            manager.disconnect().await;

            Follower::unsubscribe(&events, follower_ids);
            let view = printer
                .await
                .map_err(|e| anyhow!("event printer failed: {}", e))?;
            let report = serde_json::json!({
                "state": manager.state().to_string(),
                "view": view.summary(),
                "metrics": meshscope::metrics::snapshot(),
            });
            println!("{}", serde_json::to_string_pretty(&report)?);
            outcome?;
        }
    }

    Ok(())
}

/// Block until the manager leaves `Connecting`/`Connected` or the user interrupts.
async fn wait_until_idle(
    manager: &ConnectionManager,
    status: &mut Subscription<ConnectionStatus>,
) {
    while manager.state().is_active() {
        tokio::select! {
            update = status.recv() => {
                if update.is_none() {
                    break;
                }
            }
            _ = tokio::signal::ctrl_c() => {
                warn!("Interrupted; disconnecting");
                break;
            }
        }
    }
}

/// Prints events as they arrive and folds them into a [`MeshView`].
struct Follower {
    nodes: Subscription<Node>,
    packets: Subscription<Packet>,
    status: Subscription<ConnectionStatus>,
    logs: Subscription<LogMessage>,
}

impl Follower {
    fn subscribe(events: &EventBroadcaster) -> Self {
        Self {
            nodes: events.node_discovered().subscribe(),
            packets: events.packet_received().subscribe(),
            status: events.connection_status().subscribe(),
            logs: events.log_message().subscribe(),
        }
    }

    fn ids(&self) -> [SubscriberId; 4] {
        [self.nodes.id(), self.packets.id(), self.status.id(), self.logs.id()]
    }

    /// Close every subscription so a running follower drains its queues and returns.
    fn unsubscribe(events: &EventBroadcaster, ids: [SubscriberId; 4]) {
        let [nodes, packets, status, logs] = ids;
        events.node_discovered().unsubscribe(nodes);
        events.packet_received().unsubscribe(packets);
        events.connection_status().unsubscribe(status);
        events.log_message().unsubscribe(logs);
    }

    async fn run(mut self, mut view: MeshView, echo: bool) -> MeshView {
        loop {
            tokio::select! {
                Some(node) = self.nodes.recv() => {
                    if echo {
                        println!(
                            "node    {} {} \"{}\" {} {}",
                            node.id,
                            node.short_name,
                            node.long_name,
                            node.hardware_model,
                            color_for(&node.id).hex()
                        );
                    }
                    view.apply_node(node);
                }
                Some(packet) = self.packets.recv() => {
                    if echo {
                        println!(
                            "packet  #{} {} -> {} {}{}",
                            packet.id,
                            packet.from_node,
                            packet.to_node,
                            packet.port_number,
                            packet
                                .text
                                .as_deref()
                                .map(|t| format!(" \"{}\"", meshscope::logutil::escape_log(t)))
                                .unwrap_or_default()
                        );
                    }
                    view.apply_packet(packet);
                }
                Some(status) = self.status.recv() => {
                    if echo {
                        let word = if status.connected { "up" } else { "down" };
                        println!("status  {} ({})", word, status.reason);
                    }
                    view.apply_status(status);
                }
                Some(message) = self.logs.recv() => view.apply_log(message),
                else => break,
            }
        }
        view
    }
}

fn init_logging(config: &Option<Config>, verbosity: u8) {
    use std::io::Write;
    let mut builder = env_logger::Builder::new();
    // CLI verbosity overrides the configured level
    let configured = config
        .as_ref()
        .and_then(|c| c.logging.level.parse::<log::LevelFilter>().ok())
        .unwrap_or(log::LevelFilter::Info);
    let base_level = match verbosity {
        0 => configured,
        1 => log::LevelFilter::Debug,
        _ => log::LevelFilter::Trace,
    };
    builder.filter_level(base_level);

    let log_file = config
        .as_ref()
        .and_then(|c| c.logging.file.as_ref())
        .and_then(|path| {
            std::fs::OpenOptions::new()
                .create(true)
                .append(true)
                .open(path)
                .ok()
        });

    if let Some(f) = log_file {
        let write_mutex = std::sync::Arc::new(std::sync::Mutex::new(f));
        // Echo to the console only when attached to a terminal
        let is_tty = atty::is(atty::Stream::Stdout);
        builder.format(move |fmt, record| {
            let ts = chrono::Utc::now().format("%Y-%m-%dT%H:%M:%SZ");
            let line = format!("{} [{}] {}", ts, record.level(), record.args());
            if let Ok(mut guard) = write_mutex.lock() {
                let _ = writeln!(guard, "{}", line);
            }
            if is_tty {
                writeln!(fmt, "{}", line)
            } else {
                Ok(())
            }
        });
    } else {
        builder.format(|fmt, record| {
            let ts = chrono::Utc::now().format("%Y-%m-%dT%H:%M:%SZ");
            writeln!(fmt, "{} [{}] {}", ts, record.level(), record.args())
        });
    }
    let _ = builder.try_init();
}
