use std::str::FromStr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{anyhow, bail, Result};
use clap::{Parser, Subcommand, ValueEnum};
use meshsync_core::{kinds, ChangeEvent, Config, EventType, KindRegistration, ResourceSource, Subscriber};
use meshsync_engine::{negotiate, Engine, EngineOptions};
use meshsync_kube::KubeSource;
use tokio::signal;
use tokio::sync::watch;
use tracing::info;

#[derive(Parser, Debug)]
#[command(name = "meshsyncctl", version, about = "Mesh configuration sync CLI")]
struct Cli {
    /// Output format
    #[arg(short = 'o', long = "output", value_enum, global = true, default_value_t = Output::Human)]
    output: Output,

    /// Namespace scope (default: all namespaces)
    #[arg(long = "ns", global = true)]
    namespace: Option<String>,

    /// DNS domain suffix stamped onto translated configs
    #[arg(long = "domain", global = true, default_value = "cluster.local")]
    domain: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Copy, Clone, Debug, Eq, PartialEq, ValueEnum)]
enum Output {
    Human,
    Json,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Show negotiated schema versions for the built-in mesh kinds
    Kinds,
    /// List configs of a kind
    Ls {
        /// Kind name, e.g. "Gateway" or "TrafficRoute"
        kind: String,
    },
    /// Print one config as canonical JSON
    Get {
        kind: String,
        name: String,
    },
    /// Stream change events for one kind (or all built-ins) until Ctrl-C
    Watch {
        kind: Option<String>,
    },
}

fn init_tracing() {
    let env = std::env::var("MESHSYNC_LOG").unwrap_or_else(|_| "info".to_string());
    let filter = tracing_subscriber::EnvFilter::from_str(&env)
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).with_target(true).init();
}

fn resolve_kind(name: &str) -> Result<KindRegistration> {
    kinds::builtin().into_iter().find(|r| r.kind.eq_ignore_ascii_case(name)).ok_or_else(|| {
        let known: Vec<String> = kinds::builtin().into_iter().map(|r| r.kind).collect();
        anyhow!("unknown kind {:?}; known kinds: {}", name, known.join(", "))
    })
}

struct RunningEngine {
    engine: Arc<Engine>,
    stop: watch::Sender<bool>,
    task: tokio::task::JoinHandle<()>,
}

impl RunningEngine {
    async fn shutdown(self) {
        self.stop.send(true).ok();
        self.task.await.ok();
    }
}

/// Build the engine against the live cluster and start it in the background.
async fn start_engine(registrations: Vec<KindRegistration>, domain: &str) -> Result<RunningEngine> {
    let source = Arc::new(KubeSource::new().await?);
    let options = EngineOptions { domain_suffix: domain.to_string() };
    let engine = Arc::new(Engine::new(source, registrations, options).await?);

    let (stop, stop_rx) = watch::channel(false);
    let run_engine = engine.clone();
    let task = tokio::spawn(async move {
        if let Err(e) = run_engine.run(stop_rx).await {
            tracing::error!(error = %e, "engine stopped with error");
        }
    });
    Ok(RunningEngine { engine, stop, task })
}

async fn wait_synced(running: &RunningEngine) -> Result<()> {
    let deadline = Instant::now() + Duration::from_secs(60);
    while !running.engine.has_synced() {
        if Instant::now() > deadline {
            bail!("timed out waiting for initial sync");
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    Ok(())
}

fn render_age(creation_ts: i64) -> String {
    if creation_ts <= 0 {
        return "-".to_string();
    }
    let secs = (chrono::Utc::now().timestamp() - creation_ts).max(0);
    match secs {
        s if s < 120 => format!("{}s", s),
        s if s < 7200 => format!("{}m", s / 60),
        s if s < 172_800 => format!("{}h", s / 3600),
        s => format!("{}d", s / 86_400),
    }
}

fn print_configs(configs: &[Config], output: Output) -> Result<()> {
    match output {
        Output::Human => {
            println!("{:<16} {:<28} {:<10} {}", "NAMESPACE", "NAME", "VERSION", "AGE");
            for c in configs {
                let ns = if c.meta.namespace.is_empty() { "-" } else { &c.meta.namespace };
                println!(
                    "{:<16} {:<28} {:<10} {}",
                    ns,
                    c.meta.name,
                    c.meta.kind.version,
                    render_age(c.meta.creation_timestamp)
                );
            }
        }
        Output::Json => println!("{}", serde_json::to_string_pretty(configs)?),
    }
    Ok(())
}

fn print_event(ev: &ChangeEvent) -> meshsync_core::Result<()> {
    if let Some(config) = ev.config() {
        let sigil = match ev.event {
            EventType::Add => "+",
            EventType::Update => "~",
            EventType::Delete => "-",
        };
        println!("{} {} {}", sigil, ev.kind.kind, config.key());
    }
    Ok(())
}

#[tokio::main(flavor = "multi_thread")]
async fn main() -> Result<()> {
    init_tracing();
    let cli = Cli::parse();

    match cli.command {
        Commands::Kinds => {
            let source = KubeSource::new().await?;
            println!("{:<20} {:<12} {:<12} {}", "KIND", "PREFERRED", "WATCHED", "STATUS");
            for reg in kinds::builtin() {
                let served = source.available_versions(&reg.group, &reg.kind).await?;
                match negotiate(&reg, &served) {
                    Ok(nk) => {
                        let status = if nk.skewed() { "fallback" } else { "ok" };
                        println!(
                            "{:<20} {:<12} {:<12} {}",
                            reg.kind, nk.preferred.version, nk.cluster.version, status
                        );
                    }
                    Err(e) => {
                        println!("{:<20} {:<12} {:<12} {}", reg.kind, reg.preferred_version, "-", e);
                    }
                }
            }
        }
        Commands::Ls { kind } => {
            let reg = resolve_kind(&kind)?;
            let gvk = reg.preferred_gvk();
            let running = start_engine(vec![reg], &cli.domain).await?;
            wait_synced(&running).await?;
            let configs = running.engine.list(&gvk, cli.namespace.as_deref());
            print_configs(&configs, cli.output)?;
            running.shutdown().await;
        }
        Commands::Get { kind, name } => {
            let reg = resolve_kind(&kind)?;
            let gvk = reg.preferred_gvk();
            let running = start_engine(vec![reg], &cli.domain).await?;
            wait_synced(&running).await?;
            let found =
                running.engine.get(&gvk, cli.namespace.as_deref().unwrap_or(""), &name);
            running.shutdown().await;
            match found {
                Some(config) => match cli.output {
                    Output::Human => print_configs(std::slice::from_ref(&config), cli.output)?,
                    Output::Json => println!("{}", serde_json::to_string_pretty(&config)?),
                },
                None => bail!("{} {:?} not found", gvk, name),
            }
        }
        Commands::Watch { kind } => {
            let registrations = match kind {
                Some(name) => vec![resolve_kind(&name)?],
                None => kinds::builtin(),
            };
            let gvks: Vec<_> = registrations.iter().map(|r| r.preferred_gvk()).collect();
            let running = start_engine(registrations, &cli.domain).await?;

            // Registered before sync completes, so the bootstrap replay of
            // the initial world is printed too.
            let printer: Arc<dyn Subscriber> = Arc::new(print_event);
            for gvk in &gvks {
                running.engine.register(gvk, printer.clone());
            }
            wait_synced(&running).await?;
            info!(kinds = gvks.len(), "watching; Ctrl-C to stop");

            signal::ctrl_c().await?;
            info!("Ctrl-C received; shutting down");
            running.shutdown().await;
        }
    }
    Ok(())
}
