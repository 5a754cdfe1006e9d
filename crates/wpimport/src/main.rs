use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result, bail};
use clap::{Args, CommandFactory, Parser, Subcommand};
use tracing::{Level, info, warn};
use wpimport_core::config::{SourceConfigPatch, load_config, patch_source_config};
use wpimport_core::identity::IdentityMap;
use wpimport_core::migrate::{LATEST_VERSION, pending_migration_count, run_migrations};
use wpimport_core::model::ContentKind;
use wpimport_core::orchestrator::{MigrationOptions, MigrationOrchestrator};
use wpimport_core::report::MigrationOutcome;
use wpimport_core::runtime::{
    InitOptions, MIGRATIONS_POLICY_MESSAGE, PathOverrides, ResolutionContext, ResolvedPaths,
    ensure_runtime_ready_for_migration, init_layout, inspect_runtime, normalize_for_display,
    resolve_paths,
};
use wpimport_core::schema::{SchemaSyncReport, sync_schema};
use wpimport_core::source::{HttpMediaFetcher, SourceClientConfig, WordPressClient};
use wpimport_core::store::SqliteContentStore;

#[derive(Debug, Parser)]
#[command(
    name = "wpimport",
    version,
    about = "Import WordPress content into a local CMS content store"
)]
struct Cli {
    #[arg(long, global = true, value_name = "PATH")]
    project_root: Option<PathBuf>,
    #[arg(long, global = true, value_name = "PATH")]
    data_dir: Option<PathBuf>,
    #[arg(long, global = true, value_name = "PATH")]
    config: Option<PathBuf>,
    #[arg(long, global = true, help = "Print resolved runtime diagnostics")]
    diagnostics: bool,
    #[arg(short, long, global = true, help = "Log at debug level")]
    verbose: bool,
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Clone)]
struct RuntimeOptions {
    project_root: Option<PathBuf>,
    data_dir: Option<PathBuf>,
    config: Option<PathBuf>,
    diagnostics: bool,
}

impl RuntimeOptions {
    fn from_cli(cli: &Cli) -> Self {
        Self {
            project_root: cli.project_root.clone(),
            data_dir: cli.data_dir.clone(),
            config: cli.config.clone(),
            diagnostics: cli.diagnostics,
        }
    }
}

#[derive(Debug, Subcommand)]
enum Commands {
    Init(InitArgs),
    Status,
    Run(RunArgs),
    Db(DbArgs),
    Schema(SchemaArgs),
}

#[derive(Debug, Args)]
struct InitArgs {
    #[arg(long, value_name = "URL", help = "WordPress site to record in config.toml")]
    source_url: Option<String>,
    #[arg(long, help = "Overwrite an existing config file")]
    force: bool,
    #[arg(long, help = "Skip writing .wpimport/config.toml")]
    no_config: bool,
}

#[derive(Debug, Args)]
struct RunArgs {
    #[arg(long, value_name = "URL", help = "Override the configured WordPress site")]
    source_url: Option<String>,
    #[arg(
        short = 'k',
        long = "kind",
        value_name = "KIND",
        help = "Import only these kinds (authors, categories, tags, media, posts)"
    )]
    kinds: Vec<String>,
    #[arg(long, help = "Download media files")]
    media: bool,
    #[arg(long, value_name = "N")]
    workers: Option<usize>,
    #[arg(long, value_name = "N")]
    page_size: Option<usize>,
    #[arg(long, help = "Save the identity map after the run")]
    checkpoint: bool,
    #[arg(long, help = "Skip records recorded in the last checkpoint")]
    resume: bool,
    #[arg(long, help = "Print the outcome as JSON")]
    json: bool,
}

#[derive(Debug, Args)]
struct DbArgs {
    #[command(subcommand)]
    command: DbSubcommand,
}

#[derive(Debug, Subcommand)]
enum DbSubcommand {
    Migrate,
    Stats,
}

#[derive(Debug, Args)]
struct SchemaArgs {
    #[command(subcommand)]
    command: SchemaSubcommand,
}

#[derive(Debug, Subcommand)]
enum SchemaSubcommand {
    Plan,
    Sync {
        #[arg(long, help = "Report changes without applying them")]
        dry_run: bool,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.verbose);
    let runtime = RuntimeOptions::from_cli(&cli);

    match cli.command {
        Some(Commands::Init(args)) => run_init(&runtime, args),
        Some(Commands::Status) => run_status(&runtime),
        Some(Commands::Run(args)) => run_migration(&runtime, args).await,
        Some(Commands::Db(DbArgs { command })) => match command {
            DbSubcommand::Migrate => run_db_migrate(&runtime),
            DbSubcommand::Stats => run_db_stats(&runtime),
        },
        Some(Commands::Schema(SchemaArgs { command })) => match command {
            SchemaSubcommand::Plan => run_schema(&runtime, true),
            SchemaSubcommand::Sync { dry_run } => run_schema(&runtime, dry_run),
        },
        None => {
            let mut command = Cli::command();
            command.print_help()?;
            println!();
            Ok(())
        }
    }
}

fn init_tracing(verbose: bool) {
    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_target(false)
        .with_max_level(if verbose { Level::DEBUG } else { Level::INFO })
        .init();
}

fn run_init(runtime: &RuntimeOptions, args: InitArgs) -> Result<()> {
    let paths = resolve_runtime_paths(runtime)?;
    let report = init_layout(
        &paths,
        &InitOptions {
            materialize_config: !args.no_config,
            source_url: args.source_url.clone(),
            force: args.force,
        },
    )?;
    let patched_config = match &args.source_url {
        Some(url) if !report.wrote_config && !args.no_config => patch_source_config(
            &paths.config_path,
            &SourceConfigPatch {
                set_url: Some(url.clone()),
                set_api_path: None,
            },
        )?,
        _ => false,
    };

    println!("Initialized wpimport runtime layout");
    println!("project_root: {}", normalize_for_display(&paths.project_root));
    println!("state_dir: {}", normalize_for_display(&paths.state_dir));
    println!("data_dir: {}", normalize_for_display(&paths.data_dir));
    println!("db_path: {}", normalize_for_display(&paths.db_path));
    println!("config_path: {}", normalize_for_display(&paths.config_path));
    println!("media_dir: {}", normalize_for_display(&paths.media_dir));
    println!("created_dirs: {}", report.created_dirs.len());
    println!("wrote_config: {}", report.wrote_config);
    println!("patched_config: {patched_config}");
    println!("policy: {MIGRATIONS_POLICY_MESSAGE}");
    print_diagnostics(runtime, &paths);
    Ok(())
}

fn run_status(runtime: &RuntimeOptions) -> Result<()> {
    let paths = resolve_runtime_paths(runtime)?;
    let status = inspect_runtime(&paths)?;
    let config = load_config(&paths.config_path)?;
    let pending = pending_migration_count(&paths)?;

    println!("runtime status");
    println!("project_root: {}", normalize_for_display(&paths.project_root));
    println!(
        "project_root_exists: {}",
        format_flag(status.project_root_exists)
    );
    println!("state_dir_exists: {}", format_flag(status.state_dir_exists));
    println!("data_dir_exists: {}", format_flag(status.data_dir_exists));
    println!("db_exists: {}", format_flag(status.db_exists));
    println!(
        "db_size_bytes: {}",
        status
            .db_size_bytes
            .map(|size| size.to_string())
            .unwrap_or_else(|| "n/a".to_string())
    );
    println!("config_exists: {}", format_flag(status.config_exists));
    println!("media_dir_exists: {}", format_flag(status.media_dir_exists));
    println!(
        "source.api_base: {}",
        config
            .api_base_url()
            .unwrap_or_else(|| "<not configured>".to_string())
    );
    println!("migrations.pending: {pending}");
    println!("migrations.latest: {LATEST_VERSION}");
    print_warnings(&status.warnings);
    print_diagnostics(runtime, &paths);
    Ok(())
}

async fn run_migration(runtime: &RuntimeOptions, args: RunArgs) -> Result<()> {
    let paths = resolve_runtime_paths(runtime)?;
    let status = inspect_runtime(&paths)?;
    ensure_runtime_ready_for_migration(&paths, &status)?;

    let config = load_config(&paths.config_path)?;
    let client_config = match &args.source_url {
        Some(url) => SourceClientConfig {
            api_base: String::new(),
            user_agent: config.user_agent(),
            timeout_ms: config.http_timeout_ms(),
        }
        .with_source_url(url, &config.api_path()),
        None => SourceClientConfig::from_config(&config)?,
    };

    let mut options = MigrationOptions::from_config(&config)?;
    if !args.kinds.is_empty() {
        options.kinds = parse_kinds(&args.kinds)?;
    }
    if args.media {
        options.import_media = true;
    }
    if let Some(workers) = args.workers {
        options.workers = workers;
    }
    if let Some(page_size) = args.page_size {
        options.page_size = page_size;
    }

    let store = SqliteContentStore::open(&paths)?;
    let identities = if args.resume {
        let loaded = store.load_identity_checkpoint()?;
        info!("resuming with {} checkpointed identities", loaded.len());
        loaded
    } else {
        IdentityMap::new()
    };

    let source = WordPressClient::new(&client_config)?;
    let mut orchestrator =
        MigrationOrchestrator::new(Arc::new(source), Arc::new(store.clone()), options)
            .with_identity_map(identities);
    if orchestrator.planned_kinds().contains(&ContentKind::Media) {
        orchestrator =
            orchestrator.with_media_fetcher(Arc::new(HttpMediaFetcher::new(&client_config)?));
    }

    let token = orchestrator.cancellation_token();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("interrupt received; finishing the current page");
            token.cancel();
        }
    });

    let outcome = orchestrator.run().await;
    let checkpointed = if args.checkpoint {
        Some(store.save_identity_checkpoint(orchestrator.identities())?)
    } else {
        None
    };

    if args.json {
        println!(
            "{}",
            serde_json::to_string_pretty(&outcome).context("failed to serialize outcome")?
        );
    } else {
        println!("migration run");
        println!("project_root: {}", normalize_for_display(&paths.project_root));
        println!("source.api_base: {}", client_config.api_base);
        println!("db_path: {}", normalize_for_display(&paths.db_path));
        print_outcome(&outcome);
        if let Some(saved) = checkpointed {
            println!("checkpoint.entries: {saved}");
        }
    }
    print_diagnostics(runtime, &paths);

    if !outcome.is_success() {
        bail!(
            "migration {}: {} failed, {} errors",
            outcome.status.as_str(),
            outcome.failed,
            outcome.errors.len()
        );
    }
    Ok(())
}

fn run_db_migrate(runtime: &RuntimeOptions) -> Result<()> {
    let paths = resolve_runtime_paths(runtime)?;
    let status = inspect_runtime(&paths)?;
    ensure_runtime_ready_for_migration(&paths, &status)?;
    let report = run_migrations(&paths)?;

    println!("db migrate");
    println!("db_path: {}", normalize_for_display(&paths.db_path));
    println!("applied.count: {}", report.applied.len());
    for migration in &report.applied {
        println!("applied.migration: v{:03} {}", migration.version, migration.name);
    }
    println!("current_version: {}", report.current_version);
    print_diagnostics(runtime, &paths);
    Ok(())
}

fn run_db_stats(runtime: &RuntimeOptions) -> Result<()> {
    let paths = resolve_runtime_paths(runtime)?;
    let status = inspect_runtime(&paths)?;

    println!("db stats");
    println!("db_path: {}", normalize_for_display(&paths.db_path));
    println!("db_exists: {}", format_flag(status.db_exists));
    if !status.db_exists {
        println!("store: <not created> (run `wpimport db migrate` or `wpimport run`)");
        print_diagnostics(runtime, &paths);
        return Ok(());
    }

    let stats = SqliteContentStore::open(&paths)?.stats()?;
    println!("schema_version: {}", stats.schema_version);
    for kind in ContentKind::ALL {
        println!(
            "items.{kind}: {}",
            stats.items_by_kind.get(&kind).copied().unwrap_or(0)
        );
    }
    println!("relations: {}", stats.relations);
    println!("media.files: {}", stats.media_files);
    println!("media.bytes: {}", stats.media_bytes);
    println!("checkpoint.entries: {}", stats.checkpoint_entries);
    print_diagnostics(runtime, &paths);
    Ok(())
}

fn run_schema(runtime: &RuntimeOptions, dry_run: bool) -> Result<()> {
    let paths = resolve_runtime_paths(runtime)?;
    let status = inspect_runtime(&paths)?;
    ensure_runtime_ready_for_migration(&paths, &status)?;
    let store = SqliteContentStore::open(&paths)?;
    let report = sync_schema(&store, dry_run)?;

    println!("schema {}", if dry_run { "plan" } else { "sync" });
    println!("db_path: {}", normalize_for_display(&paths.db_path));
    print_schema_report(&report);
    print_diagnostics(runtime, &paths);
    Ok(())
}

fn print_schema_report(report: &SchemaSyncReport) {
    println!("dry_run: {}", report.dry_run);
    println!("changes.count: {}", report.changes.len());
    if report.changes.is_empty() {
        println!("changes: <none>");
    } else {
        for change in &report.changes {
            println!("changes.item: {}", change.describe());
        }
    }
    println!("applied: {}", report.applied);
}

fn print_outcome(outcome: &MigrationOutcome) {
    println!("status: {}", outcome.status.as_str());
    println!("imported: {}", outcome.imported);
    println!("created: {}", outcome.created);
    println!("updated: {}", outcome.updated);
    println!("unchanged: {}", outcome.unchanged);
    println!("skipped: {}", outcome.skipped);
    println!("failed: {}", outcome.failed);
    println!("cancelled: {}", outcome.cancellation_requested);
    for (kind, progress) in &outcome.kinds {
        println!("kind.{kind}.state: {}", progress.state.as_str());
        println!("kind.{kind}.pages: {}", progress.pages_fetched);
        println!("kind.{kind}.imported: {}", progress.imported);
        println!("kind.{kind}.skipped: {}", progress.skipped);
        println!("kind.{kind}.failed: {}", progress.failed);
    }
    println!("errors.count: {}", outcome.errors.len());
    for entry in &outcome.errors {
        println!(
            "errors.item: [{}] {}: {}",
            entry.reason.as_str(),
            entry.description,
            entry.message
        );
    }
    println!("warnings.count: {}", outcome.warnings.len());
    for entry in &outcome.warnings {
        println!("warnings.item: {}: {}", entry.description, entry.message);
    }
}

fn parse_kinds(names: &[String]) -> Result<Vec<ContentKind>> {
    names
        .iter()
        .map(|name| match ContentKind::from_name(name) {
            Some(kind) => Ok(kind),
            None => bail!("unknown content kind `{name}` (expected authors, categories, tags, media or posts)"),
        })
        .collect()
}

fn print_warnings(warnings: &[String]) {
    if !warnings.is_empty() {
        println!("warnings:");
        for warning in warnings {
            println!("  - {warning}");
        }
    }
}

fn print_diagnostics(runtime: &RuntimeOptions, paths: &ResolvedPaths) {
    if runtime.diagnostics {
        println!("\n[diagnostics]\n{}", paths.diagnostics());
    }
}

fn resolve_runtime_paths(runtime: &RuntimeOptions) -> Result<ResolvedPaths> {
    dotenvy::dotenv().ok();

    let context = ResolutionContext::from_process()?;
    let overrides = PathOverrides {
        project_root: runtime.project_root.clone(),
        data_dir: runtime.data_dir.clone(),
        config: runtime.config.clone(),
    };

    let initial = resolve_paths(&context, &overrides)?;
    let project_env = initial.project_root.join(".env");
    if project_env.exists() {
        let _ = dotenvy::from_path_override(&project_env);
    }

    resolve_paths(&context, &overrides)
}

fn format_flag(value: bool) -> &'static str {
    if value { "yes" } else { "no" }
}
