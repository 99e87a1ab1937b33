use clap::Parser;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

mod cli;

use cli::{AuthCommands, Cli, Commands};
use km_auth::{EncryptedFileCache, TokenCache};
use km_config::{CliOverrides, ConfigLoader};
use km_monitor::{MonitorOptions, MonitorOrchestrator, MonitoringResult};

/// Exit code for an interrupted run, per shell convention (128 + SIGINT).
const EXIT_SIGINT: i32 = 130;

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    let code = match run(cli).await {
        Ok(code) => code,
        Err(error) => {
            eprintln!("[Monitor] error: {error:#}");
            1
        }
    };
    std::process::exit(code);
}

async fn run(cli: Cli) -> anyhow::Result<i32> {
    match cli.command {
        Commands::Monitor {
            api_endpoint,
            api_key,
            buffer_size,
            batch_size,
            flush_interval,
            log_level,
            debug,
            replay,
            child,
        } => {
            let overrides = CliOverrides {
                api_endpoint,
                api_key,
                buffer_size,
                batch_size,
                flush_interval_secs: flush_interval,
                log_level,
                debug,
            };

            let mut loader = ConfigLoader::new();
            loader.load_default_file()?;
            loader.load_env();
            loader.apply_overrides(&overrides);
            let config = loader.finish()?;

            init_tracing(&config.log_level, config.debug);

            let (command, args) = match child.split_first() {
                Some((command, args)) => (command.clone(), args.to_vec()),
                None if replay.is_some() => (String::new(), Vec::new()),
                None => {
                    anyhow::bail!("no child command; usage: km monitor [flags] -- <command> [args]")
                }
            };

            let cancel = CancellationToken::new();
            let interrupted = Arc::new(AtomicBool::new(false));
            {
                let cancel = cancel.clone();
                let interrupted = Arc::clone(&interrupted);
                tokio::spawn(async move {
                    if tokio::signal::ctrl_c().await.is_ok() {
                        interrupted.store(true, Ordering::SeqCst);
                        cancel.cancel();
                    }
                });
            }

            let orchestrator = MonitorOrchestrator::new(config);
            let result = orchestrator
                .run(
                    MonitorOptions {
                        command,
                        args,
                        env: Vec::new(),
                        replay,
                    },
                    cancel,
                )
                .await?;

            print_summary(&result);

            if interrupted.load(Ordering::SeqCst) {
                return Ok(EXIT_SIGINT);
            }
            Ok(result.child_exit_code.unwrap_or(0))
        }

        Commands::Auth { action } => {
            init_tracing("warn", false);
            let cache = EncryptedFileCache::open_default().await?;
            match action {
                AuthCommands::Status => {
                    let scopes = cache.scopes().await;
                    if scopes.is_empty() {
                        eprintln!("[Monitor] no cached tokens");
                        return Ok(0);
                    }
                    for scope in scopes {
                        if let Some(token) = cache.get(&scope).await {
                            let state = if token.is_expired() {
                                "expired"
                            } else {
                                "valid"
                            };
                            eprintln!(
                                "[Monitor] scope {scope}: {state}, expires {}",
                                token.expires_at.to_rfc3339()
                            );
                        }
                    }
                }
                AuthCommands::Clear => {
                    cache.clear().await;
                    eprintln!("[Monitor] token cache cleared");
                }
            }
            Ok(0)
        }

        Commands::Version => {
            println!("km {}", env!("CARGO_PKG_VERSION"));
            Ok(0)
        }
    }
}

/// Diagnostics go to stderr only; stdout belongs to the proxied protocol.
fn init_tracing(level: &str, debug: bool) {
    use tracing_subscriber::EnvFilter;

    let default = if debug { "debug" } else { level };
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(default.to_string()));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_ansi(false)
        .init();
}

fn print_summary(result: &MonitoringResult) {
    eprintln!(
        "[Monitor] session {} finished: {} events observed, {} captured, {} uploaded in {} batches",
        result.session_id,
        result.filter_stats.evaluated,
        result.filter_stats.captured,
        result.uploaded_events,
        result.uploaded_batches,
    );
    if result.filter_stats.filtered > 0 {
        eprintln!(
            "[Monitor] filtered: {} (method {}, ping {}, direction {}, size {}, risk {}, content {})",
            result.filter_stats.filtered,
            result.filter_stats.by_method,
            result.filter_stats.by_ping,
            result.filter_stats.by_direction,
            result.filter_stats.by_size,
            result.filter_stats.by_risk,
            result.filter_stats.by_content,
        );
    }
    if result.failed_batches > 0 {
        eprintln!(
            "[Monitor] {} batches failed to upload and remain staged",
            result.failed_batches
        );
    }

    for (name, report) in &result.plugin_reports.security {
        eprintln!(
            "[Security] {name}: {} analyzed, {} issues",
            report.total_analyzed, report.issues_found
        );
        for (level, count) in &report.risk_distribution {
            eprintln!("[Security] {name}: {level}: {count}");
        }
        for recommendation in &report.recommendations {
            eprintln!("[Security] {name}: {recommendation}");
        }
    }
    for (name, value) in &result.plugin_reports.analytics {
        eprintln!("[Analytics] {name}: {value}");
    }
}
