// src/main.rs

use owehost::config::{ConfigManager, HostConfig, LogFormat};
use owehost::generator::GenerateOptions;
use owehost::host::LinuxHost;
use owehost::rebuild::{JsonIndex, RebuildOptions};
use owehost::scanner::{validate_integrity, IntegrityIssue};
use owehost::service::{Components, Service};
use serde::Serialize;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use structopt::StructOpt;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

/// Actor recorded on events emitted by this tool
const ACTOR: &str = "system";

#[derive(Debug, StructOpt)]
#[structopt(name = "owehost-recovery", about = "Scan, verify and rebuild hosting state from the filesystem")]
struct Opt {
    /// Path to configuration file
    #[structopt(short, long, parse(from_os_str))]
    config: Option<PathBuf>,

    #[structopt(subcommand)]
    command: Command,
}

#[derive(Debug, StructOpt)]
enum Command {
    /// Read every tenant back from disk
    Scan {
        #[structopt(long)]
        tenant: Option<u32>,
        #[structopt(long)]
        json: bool,
        #[structopt(short, long)]
        verbose: bool,
    },

    /// Resynchronise the external index with the filesystem
    Rebuild {
        #[structopt(long)]
        tenant: Option<u32>,
        #[structopt(long)]
        dry_run: bool,
        #[structopt(long)]
        skip_validation: bool,
        /// Rewrite tenant rows that already match
        #[structopt(long)]
        force: bool,
        #[structopt(long)]
        json: bool,
    },

    /// Regenerate users, cgroups, vhosts and pools, then reload services
    Generate {
        #[structopt(long)]
        tenant: Option<u32>,
        #[structopt(long)]
        dry_run: bool,
        #[structopt(long)]
        skip_nginx: bool,
        #[structopt(long)]
        skip_phpfpm: bool,
        #[structopt(long)]
        skip_users: bool,
        #[structopt(long)]
        json: bool,
    },

    /// Report integrity problems; exits 1 when any are found
    Verify {
        #[structopt(long)]
        json: bool,
    },

    /// Remove vhosts and pools no site accounts for
    Cleanup {
        #[structopt(long)]
        dry_run: bool,
        #[structopt(long)]
        json: bool,
    },

    /// Run background maintenance until SIGINT or SIGTERM
    Daemon,
}

#[derive(Debug, Serialize)]
struct VerifyOutput {
    issues: Vec<IntegrityIssue>,
    #[serde(skip_serializing_if = "Option::is_none")]
    consistency: Option<owehost::rebuild::ConsistencyReport>,
}

#[derive(Debug, Serialize)]
struct CleanupOutput {
    configs: Vec<String>,
    pools: Vec<PathBuf>,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let opt = Opt::from_args();

    // Load configuration
    let config = ConfigManager::load(opt.config.as_deref())?.into_config();
    init_tracing(&config);
    info!("Version: {}", env!("CARGO_PKG_VERSION"));

    let host = Arc::new(LinuxHost::new(Duration::from_secs(config.exec.timeout_secs)));
    let components = Components::build(&config, host)?;
    let token = CancellationToken::new();
    spawn_signal_handler(token.clone())?;

    let ok = match opt.command {
        Command::Scan { tenant, json, verbose } => {
            let result = components.scanner.scan(tenant, &token).await?;
            if json {
                print_json(&result)?;
            } else {
                for snapshot in &result.tenants {
                    let name = snapshot.identity.as_ref().map_or("?", |i| i.name.as_str());
                    println!(
                        "a-{} {}: {} sites, {} tls, {} databases, {} errors",
                        snapshot.tenant_id,
                        name,
                        snapshot.sites.len(),
                        snapshot.tls.len(),
                        snapshot.databases.len(),
                        snapshot.errors.len()
                    );
                    if verbose {
                        for site in &snapshot.sites {
                            println!("  site {} ({})", site.domain, site.runtime);
                        }
                        for err in &snapshot.errors {
                            println!("  error {}: {}", err.resource, err.message);
                        }
                    }
                }
                println!("{} tenants, {} errors", result.tenants.len(), result.error_count());
            }
            true
        }

        Command::Rebuild { tenant, dry_run, skip_validation, force, json } => {
            let index = JsonIndex::open(components.store.layout().index_file())?;
            let opts = RebuildOptions {
                dry_run,
                tenant_id: tenant,
                skip_validation,
                force_overwrite: force,
            };
            let report = components.rebuilder.rebuild(&index, &opts, ACTOR, &token).await?;
            if !dry_run {
                index.flush().await?;
            }
            if json {
                print_json(&report)?;
            } else {
                println!(
                    "{} tenants scanned, {} updated, {} sites, {} tls, {} databases, {} errors",
                    report.tenants_scanned,
                    report.tenants_updated,
                    report.sites,
                    report.tls,
                    report.databases,
                    report.errors.len()
                );
                for err in &report.errors {
                    println!("  a-{} {}: {}", err.tenant_id, err.resource, err.message);
                }
            }
            true
        }

        Command::Generate { tenant, dry_run, skip_nginx, skip_phpfpm, skip_users, json } => {
            let opts = GenerateOptions {
                tenant_id: tenant,
                dry_run,
                skip_nginx,
                skip_phpfpm,
                skip_users,
            };
            let report = components.generator.generate_all(&opts, ACTOR, &token).await?;
            if json {
                print_json(&report)?;
            } else {
                println!(
                    "{} tenants, {} users created, {} vhosts, {} pools, reloaded [{}], {} errors",
                    report.tenants,
                    report.users_created,
                    report.nginx_configs,
                    report.pool_configs,
                    report.reloaded.join(", "),
                    report.errors.len()
                );
                for err in &report.errors {
                    println!("  a-{} {}: {}", err.tenant_id, err.resource, err.message);
                }
            }
            report.errors.is_empty()
        }

        Command::Verify { json } => {
            let scan = components.scanner.scan_all(&token).await?;
            let issues: Vec<IntegrityIssue> = scan.tenants.iter().flat_map(validate_integrity).collect();

            let index_path = components.store.layout().index_file();
            let consistency = if JsonIndex::exists(&index_path) {
                let index = JsonIndex::open(&index_path)?;
                Some(components.rebuilder.verify_consistency(&index, &token).await?)
            } else {
                None
            };
            let clean = issues.is_empty() && consistency.as_ref().map_or(true, |c| c.is_consistent());

            if json {
                print_json(&VerifyOutput { issues, consistency })?;
            } else {
                for issue in &issues {
                    println!("a-{} {} [{:?}] {}", issue.tenant_id, issue.resource, issue.severity, issue.message);
                }
                if let Some(report) = &consistency {
                    for m in &report.mismatches {
                        println!("a-{} {}: filesystem={} index={}", m.tenant_id, m.field, m.filesystem, m.index);
                    }
                    for missing in &report.missing_in_index {
                        println!("missing in index: {}", missing);
                    }
                    for missing in &report.missing_on_filesystem {
                        println!("missing on filesystem: {}", missing);
                    }
                }
                println!("{} issues", issues.len());
            }
            clean
        }

        Command::Cleanup { dry_run, json } => {
            let configs = components.generator.cleanup_stale_configs(dry_run, &token).await?;
            let pools = components.generator.cleanup_stale_pools(dry_run, &token).await?;
            if json {
                print_json(&CleanupOutput { configs, pools })?;
            } else {
                let verb = if dry_run { "would remove" } else { "removed" };
                for name in &configs {
                    println!("{} config {}", verb, name);
                }
                for path in &pools {
                    println!("{} pool {}", verb, path.display());
                }
            }
            true
        }

        Command::Daemon => {
            run_daemon(config, token).await?;
            true
        }
    };

    if !ok {
        std::process::exit(1);
    }
    Ok(())
}

fn init_tracing(config: &HostConfig) {
    // RUST_LOG wins over the configured level
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.logging.level));
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr);
    match config.logging.format {
        LogFormat::Json => builder.json().init(),
        LogFormat::Plain => builder.init(),
    }
}

fn print_json<T: Serialize>(value: &T) -> Result<(), serde_json::Error> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

fn spawn_signal_handler(token: CancellationToken) -> std::io::Result<()> {
    use tokio::signal::unix::{signal, SignalKind};

    let mut sigint = signal(SignalKind::interrupt())?;
    let mut sigterm = signal(SignalKind::terminate())?;

    tokio::spawn(async move {
        tokio::select! {
            _ = sigint.recv() => {
                warn!("Received SIGINT, cancelling...");
            }
            _ = sigterm.recv() => {
                warn!("Received SIGTERM, cancelling...");
            }
        }
        token.cancel();
    });
    Ok(())
}

async fn run_daemon(config: HostConfig, token: CancellationToken) -> Result<(), Box<dyn std::error::Error>> {
    info!("Starting owehost service...");
    let service = Service::new(config).await?;

    // Wait for shutdown signal
    token.cancelled().await;

    info!("Shutting down...");
    if let Err(e) = service.shutdown().await {
        error!("Shutdown failed: {}", e);
        return Err(e.into());
    }

    info!("owehost has been shut down.");
    Ok(())
}
