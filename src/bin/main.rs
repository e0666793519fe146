//! Order Delta Sync CLI

use clap::{ArgGroup, Parser, Subcommand};
use console::style;
use indicatif::{ProgressBar, ProgressStyle};
use order_delta_sync::config::LogFormat;
use order_delta_sync::error::ErrorContext;
use order_delta_sync::{
    ApiClient, Error, MergeOrchestrator, MergePlan, MondayClient, PgSyncStore, PostgresClient,
    ResolvedConfig, Resolver, SAMPLE_CONFIG, SyncConfig, SyncEngine, SyncProgress, SyncStore,
    TemplateEngine,
};
use std::process::ExitCode;
use std::sync::Arc;
use tracing::{error, info};
use tracing_subscriber::{EnvFilter, fmt};

#[derive(Parser)]
#[command(name = "order-delta-sync")]
#[command(author, version, about = "Sync staged order changes to a monday.com board")]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Config file path
    #[arg(short, long, global = true)]
    config: Option<String>,

    /// Environment section to use (default: the document's default_environment)
    #[arg(short, long, global = true)]
    env: Option<String>,

    /// Log level
    #[arg(long, global = true, env = "LOG_LEVEL")]
    log_level: Option<String>,

    /// JSON output
    #[arg(long, global = true)]
    json: bool,

    /// Quiet mode
    #[arg(short, long, global = true)]
    quiet: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Merge changes into the delta tables and push them to the board
    #[command(group(ArgGroup::new("mode").required(true).args(["dry_run", "execute"])))]
    Sync {
        /// Simulate every remote call
        #[arg(long)]
        dry_run: bool,
        /// Perform remote calls
        #[arg(long)]
        execute: bool,
        /// Maximum header rows to sync
        #[arg(long)]
        limit: Option<usize>,
        /// Only sync this customer
        #[arg(long)]
        customer: Option<String>,
        /// Skip change detection and merge; sync what is already staged
        #[arg(long)]
        skip_merge: bool,
    },
    /// Show row counts per sync state
    Status,
    /// Validate configuration, schema and SQL templates without writing
    Check,
    /// Generate sample config
    Init {
        #[arg(short, long, default_value = "order-delta-sync.toml")]
        output: String,
    },
}

type CliResult<T> = Result<T, Box<dyn std::error::Error>>;

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    if let Commands::Init { output } = &cli.command {
        init_logging(cli.log_level.as_deref().unwrap_or("info"), cli.quiet, cli.json);
        return exit(run_init(output));
    }

    let (config, source) = match load_config(cli.config.as_deref()) {
        Ok(loaded) => loaded,
        Err(e) => {
            init_logging("info", cli.quiet, cli.json);
            return exit(Err(e.into()));
        }
    };
    let level = cli.log_level.as_deref().unwrap_or(&config.logging.level);
    init_logging(
        level,
        cli.quiet,
        cli.json || config.logging.format == LogFormat::Json,
    );
    info!("Loaded config from {}", source);

    exit(run(cli, config).await)
}

/// Exit code 2 when the run could not start (configuration, templates,
/// connection); 1 for every other failure.
fn exit(result: CliResult<()>) -> ExitCode {
    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!("Error: {}", e);
            let mut cause = e.source();
            while let Some(inner) = cause {
                error!("  caused by: {}", inner);
                cause = inner.source();
            }
            match e.downcast_ref::<Error>() {
                Some(err) if err.is_fatal() => ExitCode::from(2),
                _ => ExitCode::FAILURE,
            }
        }
    }
}

async fn run(cli: Cli, config: SyncConfig) -> CliResult<()> {
    let env = cli
        .env
        .clone()
        .unwrap_or_else(|| config.default_environment.clone());

    match cli.command {
        Commands::Sync {
            dry_run,
            execute,
            limit,
            customer,
            skip_merge,
        } => {
            let dry_run = dry_run && !execute;
            let options = SyncOptions {
                dry_run,
                limit,
                customer,
                skip_merge,
            };
            run_sync(&config, &env, options, cli.json, cli.quiet).await
        }
        Commands::Status => run_status(&config, &env, cli.json).await,
        Commands::Check => run_check(&config, &env, cli.json).await,
        Commands::Init { .. } => unreachable!(), // Handled in main
    }
}

fn load_config(path: Option<&str>) -> Result<(SyncConfig, String), Error> {
    if let Some(p) = path {
        return Ok((SyncConfig::from_file(p)?, p.to_string()));
    }

    for default in &["order-delta-sync.toml", ".order-delta-sync.toml"] {
        if std::path::Path::new(default).exists() {
            return Ok((SyncConfig::from_file(default)?, default.to_string()));
        }
    }

    Ok((SyncConfig::from_env()?, "environment".to_string()))
}

/// Check the environment's configuration, then connect and resolve the schema.
async fn connect(config: &SyncConfig, env: &str) -> CliResult<(Arc<PostgresClient>, ResolvedConfig)> {
    let resolver = Resolver::new(config);
    let checked = resolver.resolve_static(env)?;
    if checked.database_url.is_empty() {
        return Err(Error::config(format!(
            "No database_url for environment '{}' (set it in the config or DATABASE_URL)",
            env
        ))
        .into());
    }
    let pg = Arc::new(PostgresClient::connect(&checked.database_url).await?);
    let resolved = resolver.resolve(env, pg.as_ref()).await?;
    Ok((pg, resolved))
}

struct SyncOptions {
    dry_run: bool,
    limit: Option<usize>,
    customer: Option<String>,
    skip_merge: bool,
}

async fn run_sync(
    config: &SyncConfig,
    env: &str,
    options: SyncOptions,
    json: bool,
    quiet: bool,
) -> CliResult<()> {
    let interactive = !quiet && !json;
    if interactive {
        println!("Order Delta Sync v{}", order_delta_sync::VERSION);
        println!(
            "Environment: {}  Mode: {}\n",
            env,
            if options.dry_run { "dry run" } else { "execute" }
        );
    }

    let (pg, resolved) = connect(config, env).await?;
    let engine = TemplateEngine::new();
    let board = Arc::new(MondayClient::new(&config.monday, &resolved.board_id)?);
    let api = Arc::new(ApiClient::new(
        board,
        resolved.batch.clone(),
        resolved.retry.clone(),
    ));

    let merge = if options.skip_merge {
        info!("Skipping change detection and merge");
        None
    } else {
        let plan = MergePlan::render(&engine, &resolved)?;
        let report = MergeOrchestrator::new(pg.clone(), api.clone(), plan)
            .run(options.dry_run)
            .await?;
        if interactive {
            println!(
                "Merged: {} headers staged, {} lines staged{}",
                report.headers_staged,
                report.lines_staged,
                if report.unpivot_skipped {
                    " (no size columns)"
                } else {
                    ""
                }
            );
            if report.invalid_size_cells > 0 {
                println!(
                    "  {} size cells were not a number and were skipped",
                    report.invalid_size_cells
                );
            }
            for (customer, reason) in &report.group_errors {
                println!("  Group for {} failed: {}", customer, reason);
            }
        }
        Some(report)
    };

    let store = Arc::new(PgSyncStore::new(pg, &engine, &resolved)?);
    let mut sync = SyncEngine::new(store, api, &resolved);
    let progress = interactive.then(|| {
        let bar = ProgressBar::new(0);
        bar.set_style(
            ProgressStyle::with_template("{spinner} [{pos}/{len}] {msg}")
                .unwrap_or_else(|_| ProgressStyle::default_spinner()),
        );
        bar
    });
    if let Some(bar) = progress.clone() {
        sync = sync.with_progress(move |p: SyncProgress| {
            bar.set_length(p.customers_total as u64);
            bar.set_position(p.customers_done as u64);
            bar.set_message(format!("{} ({})", p.customer, p.phase));
        });
    }

    let result = sync
        .run(options.limit, options.customer.as_deref(), options.dry_run)
        .await?;
    if let Some(bar) = progress {
        bar.finish_and_clear();
    }

    if json {
        let summary = serde_json::json!({ "merge": merge, "sync": result });
        println!("{}", serde_json::to_string_pretty(&summary)?);
    } else if !quiet {
        if result.success {
            println!("{} Sync completed successfully", style("✓").green());
        } else {
            println!("{} Sync completed with errors", style("✗").red());
        }
        println!("\nDuration: {}ms", result.duration_ms);
        println!(
            "Items: {}  Sub-items: {}  Failed: {}\n",
            result.total_items(),
            result.total_lines(),
            result.total_failed()
        );

        for (customer, cr) in &result.customers {
            let icon = if cr.is_success() {
                style("✓").green()
            } else {
                style("✗").red()
            };
            println!(
                "  {} {}: {} created, {} updated, {} failed; lines {} / {} / {} ({} calls, {}ms)",
                icon,
                customer,
                cr.created,
                cr.updated,
                cr.failed,
                cr.lines_created,
                cr.lines_updated,
                cr.lines_failed,
                cr.batches,
                cr.duration_ms
            );
            for e in &cr.errors {
                println!("      Error: {}", e);
            }
        }
        if result.skipped_leased > 0 {
            println!(
                "\n{} rows skipped: leased by another run",
                result.skipped_leased
            );
        }
    }

    if result.success {
        Ok(())
    } else {
        Err(format!("{} records ended in ERROR", result.total_failed()).into())
    }
}

async fn run_status(config: &SyncConfig, env: &str, json: bool) -> CliResult<()> {
    let (pg, resolved) = connect(config, env).await?;
    let store = PgSyncStore::new(pg, &TemplateEngine::new(), &resolved)?;
    let report = store.status().await?;

    if json {
        println!("{}", serde_json::to_string_pretty(&report)?);
    } else {
        println!("Sync state ({})\n", env);
        for (table, states) in &report.tables {
            let counts: Vec<String> = states.iter().map(|(s, n)| format!("{}={}", s, n)).collect();
            println!("  {}: {}", table, counts.join(", "));
        }
        println!("\nOutstanding: {}", report.outstanding());
    }
    Ok(())
}

async fn run_check(config: &SyncConfig, env: &str, json: bool) -> CliResult<()> {
    let (pg, resolved) = connect(config, env).await?;
    pg.ping().await?;

    let engine = TemplateEngine::new();
    let plan = MergePlan::render(&engine, &resolved)?;
    PgSyncStore::new(pg, &engine, &resolved)?;

    let sizes: Vec<&str> = resolved.size_columns.iter().map(|s| s.code()).collect();
    if json {
        let summary = serde_json::json!({
            "environment": resolved.environment,
            "tables": resolved.tables.all(),
            "size_columns": sizes,
            "statements": plan.statements().iter().map(|(name, _)| *name).collect::<Vec<_>>(),
            "postgres": "ok",
        });
        println!("{}", serde_json::to_string_pretty(&summary)?);
    } else {
        println!("{} PostgreSQL reachable", style("✓").green());
        println!(
            "{} Tables: {}",
            style("✓").green(),
            resolved.tables.all().join(", ")
        );
        println!(
            "{} {} size columns: {}",
            style("✓").green(),
            sizes.len(),
            sizes.join(", ")
        );
        for (name, _) in plan.statements() {
            println!("{} Rendered {}", style("✓").green(), name);
        }
    }
    Ok(())
}

fn run_init(output: &str) -> CliResult<()> {
    std::fs::write(output, SAMPLE_CONFIG).with_context(|| format!("Failed to write {}", output))?;
    println!("✓ Created: {}", output);
    println!("\nEdit the file or use environment variables:");
    println!("  DATABASE_URL, MONDAY_API_TOKEN");
    Ok(())
}

fn init_logging(level: &str, quiet: bool, json_output: bool) {
    if quiet {
        return;
    }
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));

    // Logs go to stderr when JSON output is enabled so stdout stays parseable
    if json_output {
        fmt()
            .json()
            .with_env_filter(filter)
            .with_target(false)
            .with_writer(std::io::stderr)
            .init();
    } else {
        fmt().with_env_filter(filter).with_target(false).init();
    }
}
