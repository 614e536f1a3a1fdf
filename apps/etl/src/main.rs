//! Study intake ETL - command line entry point

use anyhow::Context;
use clap::{Args, Parser, Subcommand, ValueEnum};
use intake_etl::{
    assemble,
    config::Config,
    db::{PostgresStore, ReceivingStore},
    dedup::{deduplicate, DuplicatePolicy},
    engine::Reconciler,
    lims::LimsClient,
    logging, manifest,
    matching::{match_records, MatchManifest},
    routines::{ClinicalRoutine, PresenceAbsenceRoutine, RedcapDetRoutine, Routine},
    state,
};
use std::path::PathBuf;
use std::sync::Arc;

#[derive(Parser)]
#[command(
    name = "intake-etl",
    about = "Reconcile study intake data into the warehouse",
    version,
    arg_required_else_help = true
)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Apply receiving and warehouse schema migrations.
    Migrate,

    /// Run an ETL routine over its pending receiving records.
    Etl {
        #[command(subcommand)]
        routine: RoutineArg,
        /// Process everything, then roll back instead of committing.
        #[arg(long)]
        dry_run: bool,
    },

    /// Count records pending for a routine's current revision.
    Status {
        #[command(subcommand)]
        routine: RoutineArg,
    },

    /// Match parsed clinical rows to LIMS barcodes.
    Match(MatchArgs),

    /// Remove duplicate rows from a manifest.
    Deduplicate(DeduplicateArgs),
}

#[derive(Subcommand, Clone)]
enum RoutineArg {
    /// Clinical lab exports.
    Clinical {
        #[arg(long)]
        project: String,
    },
    /// REDCap data entry triggers.
    RedcapDet {
        #[arg(long)]
        project: String,
    },
    /// Presence/absence assay results.
    PresenceAbsence,
}

#[derive(Args)]
struct MatchArgs {
    /// Newly parsed rows (NDJSON).
    #[arg(long)]
    parsed: PathBuf,
    /// Directory holding matched.ndjson and unmatched.ndjson.
    #[arg(long)]
    manifest_dir: PathBuf,
    /// Fields to look up, in priority order.
    #[arg(long = "field", required = true)]
    fields: Vec<String>,
}

#[derive(Args)]
struct DeduplicateArgs {
    #[arg(long)]
    input: PathBuf,
    #[arg(long)]
    output: PathBuf,
    /// Rows removed for sharing an identifier are written here for review.
    #[arg(long)]
    skipped: Option<PathBuf>,
    /// Identifier columns; rows sharing a value in any of them conflict.
    #[arg(long = "id-column", required = true)]
    id_columns: Vec<String>,
    #[arg(long, value_enum, default_value = "drop-conflicts")]
    policy: PolicyArg,
}

#[derive(Clone, Copy, ValueEnum)]
enum PolicyArg {
    DropConflicts,
    KeepLatest,
}

impl From<PolicyArg> for DuplicatePolicy {
    fn from(policy: PolicyArg) -> Self {
        match policy {
            PolicyArg::DropConflicts => DuplicatePolicy::DropConflicts,
            PolicyArg::KeepLatest => DuplicatePolicy::KeepLatest,
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let mut config = Config::load().context("Failed to load configuration")?;
    config
        .validate()
        .map_err(|e| anyhow::anyhow!("Invalid configuration: {e}"))?;

    let _logging_guard =
        logging::init_logging(&config.logging).context("Failed to initialize logging")?;

    tracing::info!(version = env!("CARGO_PKG_VERSION"), "Starting intake ETL");

    match cli.command {
        Commands::Migrate => {
            let pool = state::create_db_pool(&config.database).await?;
            state::run_migrations(&pool)
                .await
                .context("Failed to run migrations")?;
        }
        Commands::Etl { routine, dry_run } => {
            config.etl.dry_run |= dry_run;
            let routine = build_routine(&routine, &config)?;
            let reconciler = reconciler(&config).await?;
            let summary = reconciler
                .run(routine.as_ref())
                .await
                .with_context(|| format!("Routine {} failed", routine.name()))?;
            println!("{}: {summary}", routine.name());
        }
        Commands::Status { routine } => {
            let routine = build_routine(&routine, &config)?;
            let reconciler = reconciler(&config).await?;
            let pending = reconciler.pending(routine.as_ref()).await?;
            println!(
                "{} revision {}: {pending} pending",
                routine.name(),
                routine.revision()
            );
        }
        Commands::Match(args) => run_match(args, &config).await?,
        Commands::Deduplicate(args) => run_deduplicate(args)?,
    }

    Ok(())
}

fn build_routine(routine: &RoutineArg, config: &Config) -> anyhow::Result<Box<dyn Routine>> {
    let hash_secret = || {
        config
            .identity
            .hash_secret
            .clone()
            .context("identity.hash_secret must be set for this routine")
    };

    Ok(match routine {
        RoutineArg::Clinical { project } => {
            let project = assemble::clinical::by_name(project)
                .with_context(|| format!("Unknown clinical project {project:?}"))?;
            Box::new(ClinicalRoutine::new(project, hash_secret()?))
        }
        RoutineArg::RedcapDet { project } => {
            let project = assemble::redcap::by_name(project)
                .with_context(|| format!("Unknown REDCap project {project:?}"))?;
            Box::new(RedcapDetRoutine::new(project, hash_secret()?))
        }
        RoutineArg::PresenceAbsence => Box::new(PresenceAbsenceRoutine),
    })
}

async fn reconciler(config: &Config) -> anyhow::Result<Reconciler> {
    let pool = state::create_db_pool(&config.database)
        .await
        .context("Failed to connect to database")?;
    let store: Arc<dyn ReceivingStore> =
        Arc::new(PostgresStore::new(pool).with_skip_locked(config.etl.skip_locked));
    Ok(Reconciler::new(store, &config.etl))
}

async fn run_match(args: MatchArgs, config: &Config) -> anyhow::Result<()> {
    let lims = LimsClient::new(&config.lims).context("Failed to configure LIMS client")?;

    let matched_path = args.manifest_dir.join("matched.ndjson");
    let unmatched_path = args.manifest_dir.join("unmatched.ndjson");
    let manifest = MatchManifest {
        matched: manifest::read_pool(&matched_path)?,
        unmatched: manifest::read_pool(&unmatched_path)?,
    };
    let parsed = manifest::read_ndjson(&args.parsed)
        .with_context(|| format!("Failed to read {}", args.parsed.display()))?;

    // Nothing is written unless every lookup succeeded.
    let (manifest, report) = match_records(manifest, parsed, &args.fields, &lims)
        .await
        .context("Identifier matching failed; manifests left unchanged")?;

    manifest::write_ndjson(&matched_path, &manifest.matched)?;
    manifest::write_ndjson(&unmatched_path, &manifest.unmatched)?;
    println!(
        "{} newly matched, {} superseded, {} purged, {} unmatched",
        report.newly_matched, report.superseded, report.purged, report.unmatched
    );
    Ok(())
}

fn run_deduplicate(args: DeduplicateArgs) -> anyhow::Result<()> {
    let rows = manifest::read_ndjson(&args.input)
        .with_context(|| format!("Failed to read {}", args.input.display()))?;
    let report = deduplicate(rows, &args.id_columns, args.policy.into())?;

    manifest::write_ndjson(&args.output, &report.rows)?;
    if let Some(skipped) = &args.skipped {
        manifest::write_ndjson(skipped, &report.conflicts)?;
    }
    println!(
        "{} kept, {} exact duplicates, {} conflicting rows from {:?}",
        report.rows.len(),
        report.exact_duplicates.len(),
        report.conflicts.len(),
        report.conflict_sources
    );
    Ok(())
}
