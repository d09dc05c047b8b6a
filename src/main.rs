use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use colored::Colorize;
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use srctunnel::collector::DependencyCollector;
use srctunnel::config::{expand_tilde, Config};
use srctunnel::resolver::DirectoryResolver;
use srctunnel::tunnel::protocol::HelloFlags;
use srctunnel::tunnel::{Agent, AgentConfig, AgentState, TcpDialer};
use srctunnel::{BuildParams, RemoteWorkspace, UnitId, UnitResolver};

#[derive(Parser)]
#[command(name = "srctunnel")]
#[command(author, version, about = "Expose a remote source tree over an outbound tunnel")]
struct Cli {
    /// Enable debug logging
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Config file (default: ~/.config/srctunnel/config.toml)
    #[arg(long, global = true, env = "SRCTUNNEL_CONFIG")]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Serve local sources: dial the relay and reconnect until a fatal error
    Agent {
        /// Relay address to dial
        #[arg(long, env = "SRCTUNNEL_RELAY")]
        relay: Option<String>,

        /// Workspace root (repeatable; default: current directory)
        #[arg(long = "root")]
        roots: Vec<PathBuf>,

        /// Standard root; its units are never shipped
        #[arg(long)]
        std_root: Option<PathBuf>,
    },

    /// Accept an agent and mirror a unit's closure into a directory
    Pull {
        /// Address to accept agents on
        #[arg(long, env = "SRCTUNNEL_LISTEN")]
        listen: Option<String>,

        /// Unit to fetch
        unit: String,

        /// Directory to materialize into
        #[arg(long)]
        dest: PathBuf,

        /// Include the unit's test files and test imports
        #[arg(long)]
        tests: bool,

        /// Keep re-syncing after every change
        #[arg(long)]
        watch: bool,
    },

    /// List units under the local roots
    Units {
        #[arg(long = "root")]
        roots: Vec<PathBuf>,

        #[arg(long)]
        json: bool,
    },

    /// Print the local dependency closure of a unit
    Closure {
        unit: String,

        #[arg(long)]
        tests: bool,

        #[arg(long = "root")]
        roots: Vec<PathBuf>,

        #[arg(long)]
        std_root: Option<PathBuf>,

        #[arg(long)]
        json: bool,
    },
}

fn init_logging(verbose: bool) {
    let default = if verbose { "debug" } else { "info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));

    tracing_subscriber::registry()
        .with(fmt::layer().with_writer(std::io::stderr))
        .with(filter)
        .init();
}

/// CLI roots win over configured ones; with neither, the current directory.
fn resolver(config: &Config, roots: Vec<PathBuf>, std_root: Option<PathBuf>) -> DirectoryResolver {
    let mut roots: Vec<PathBuf> = if roots.is_empty() {
        config.roots.clone()
    } else {
        roots.iter().map(|r| expand_tilde(r)).collect()
    };
    if roots.is_empty() {
        roots.push(PathBuf::from("."));
    }

    let resolver = DirectoryResolver::new(roots);
    match std_root
        .map(|r| expand_tilde(&r))
        .or_else(|| config.std_root.clone())
    {
        Some(std_root) => resolver.with_std_root(std_root),
        None => resolver,
    }
}

fn unit_id(name: String, tests: bool) -> UnitId {
    if tests {
        UnitId::with_tests(name)
    } else {
        UnitId::new(name)
    }
}

fn shutdown_on_ctrl_c() -> CancellationToken {
    let token = CancellationToken::new();
    let trigger = token.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::info!("Interrupted, shutting down");
            trigger.cancel();
        }
    });
    token
}

async fn run(cli: Cli) -> Result<()> {
    let config = Config::load(cli.config.as_deref())?;

    match cli.command {
        Command::Agent {
            relay,
            roots,
            std_root,
        } => {
            let relay = relay
                .or_else(|| config.relay.clone())
                .context("No relay address: pass --relay or set `relay` in the config file")?;
            let resolver = resolver(&config, roots, std_root);

            let mut flags = HelloFlags::WATCH;
            if resolver.std_root().is_some() {
                flags |= HelloFlags::STD_ROOT;
            }
            tracing::info!(roots = ?resolver.roots(), "Serving sources");

            let agent = Agent::new(TcpDialer::new(relay), AgentState::new(Arc::new(resolver)))
                .with_config(AgentConfig {
                    flags,
                    ..AgentConfig::default()
                });
            agent.run(shutdown_on_ctrl_c()).await?;
        }

        Command::Pull {
            listen,
            unit,
            dest,
            tests,
            watch,
        } => {
            let listen = listen
                .or_else(|| config.listen.clone())
                .context("No listen address: pass --listen or set `listen` in the config file")?;
            let listener = TcpListener::bind(&listen)
                .await
                .with_context(|| format!("Failed to listen on {}", listen))?;

            let shutdown = shutdown_on_ctrl_c();
            let workspace = Arc::new(RemoteWorkspace::new(BuildParams::host()));
            let accepting = {
                let workspace = workspace.clone();
                let shutdown = shutdown.clone();
                tokio::spawn(async move { workspace.listen(listener, &shutdown).await })
            };

            let unit = unit_id(unit, tests);
            let dest = expand_tilde(&dest);
            let pulled = if watch {
                workspace.mirror(&unit, &dest, &shutdown).await
            } else {
                workspace
                    .pull(&unit, &dest, &shutdown)
                    .await
                    .map(|stats| {
                        println!(
                            "{} {} into {} ({} written, {} unchanged, {} removed)",
                            "Pulled".green().bold(),
                            unit,
                            dest.display(),
                            stats.written,
                            stats.unchanged,
                            stats.removed
                        );
                    })
            };

            shutdown.cancel();
            accepting.await??;
            pulled?;
        }

        Command::Units { roots, json } => {
            let units = resolver(&config, roots, None).list_units()?;
            if json {
                println!("{}", serde_json::to_string_pretty(&units)?);
            } else {
                for unit in units {
                    println!("{}", unit);
                }
            }
        }

        Command::Closure {
            unit,
            tests,
            roots,
            std_root,
            json,
        } => {
            let resolver = resolver(&config, roots, std_root);
            let params = BuildParams::host();
            let closure =
                DependencyCollector::new(&resolver, &params).collect(&unit_id(unit, tests))?;

            if json {
                let members: Vec<_> = closure
                    .iter()
                    .map(|member| {
                        serde_json::json!({
                            "name": member.unit.name,
                            "dir": member.unit.dir,
                            "files": member.unit.files,
                            "imports": member.unit.imports,
                        })
                    })
                    .collect();
                println!("{}", serde_json::to_string_pretty(&members)?);
            } else {
                for member in closure {
                    println!("{}", member.unit.name);
                }
            }
        }
    }

    Ok(())
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();
    init_logging(cli.verbose);

    match run(cli).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("{} {:#}", "error:".red().bold(), e);
            ExitCode::FAILURE
        }
    }
}
