use std::{
    collections::HashSet, ffi::OsString, path::PathBuf, process::ExitCode, sync::Arc,
    time::Duration,
};

use anyhow::Context;
use clap::{Args, Parser, Subcommand};
use s3migrate::{
    config::{DEFAULT_EXCLUDED_NAMES, DEFAULT_PART_SIZE, DEFAULT_REGION, DEFAULT_STAGING_DIR},
    destination::{local::LocalStore, Allocation},
    source::s3::{S3Settings, S3Source},
    MigrationConfig, Migrator, StagingStrategy,
};
use tokio::signal;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

const DEFAULT_CONFIG_FILE: &str = ".env";

#[derive(Debug, Parser)]
#[command(name = "s3migrate", version, about = "Migrate S3 buckets into an allocation store")]
struct Cli {
    /// Config file path
    #[arg(short, long, default_value = DEFAULT_CONFIG_FILE, global = true)]
    config: PathBuf,

    /// Root directory of the destination allocation store
    #[arg(
        long,
        env = "S3MIGRATE_STORE_ROOT",
        default_value = "./allocations",
        global = true
    )]
    store_root: PathBuf,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Migrate user data from S3 to the allocation
    Migrate(MigrateArgs),
    /// List the files stored in an allocation
    Ls {
        #[arg(long, env = "S3MIGRATE_ALLOCATION")]
        allocation: String,
    },
    /// Provision a new, empty allocation
    CreateAllocation {
        #[arg(long, env = "S3MIGRATE_ALLOCATION")]
        allocation: String,
    },
}

#[derive(Debug, Args)]
struct MigrateArgs {
    /// S3 region
    #[arg(short, long, env = "AWS_REGION")]
    region: Option<String>,

    /// Bucket(s) to migrate; all visible buckets when omitted
    #[arg(short, long = "bucket", value_delimiter = ',')]
    buckets: Vec<String>,

    /// Allocation ID
    #[arg(long, env = "S3MIGRATE_ALLOCATION")]
    allocation: String,

    /// Encrypt files before they are stored
    #[arg(long)]
    encrypt: bool,

    /// Commit the metadata transaction after each upload
    #[arg(long)]
    commit: bool,

    /// Who pays for reads: owner or 3rd_party
    #[arg(long = "attr-who-pays-for-reads")]
    who_pays: Option<String>,

    /// Local scratch directory, removed when the run ends
    #[arg(long, default_value = DEFAULT_STAGING_DIR)]
    staging_dir: PathBuf,

    /// Destination directory the buckets are placed under
    #[arg(long, default_value = "/")]
    remote_path: String,

    /// Stream objects straight to the destination without local staging
    #[arg(long)]
    stream: bool,

    /// Part size in bytes for partitioned downloads
    #[arg(long, default_value_t = DEFAULT_PART_SIZE)]
    part_size: u64,

    /// Concurrent part downloads per object
    #[arg(long, default_value_t = 4)]
    download_workers: usize,

    /// Objects processed concurrently
    #[arg(long, default_value_t = 1)]
    workers: usize,

    /// Give up on a single object after this many seconds
    #[arg(long)]
    object_timeout_secs: Option<u64>,

    /// Custom S3 endpoint (MinIO, R2, ...)
    #[arg(long, env = "AWS_ENDPOINT_URL")]
    endpoint_url: Option<String>,

    /// Credentials file used instead of the default AWS profile files
    #[arg(long)]
    credentials_file: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> ExitCode {
    // required flags may come from the config file, so load it before clap
    let config_file = config_path(std::env::args_os());
    let loaded = dotenvy::from_path(&config_file);

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "s3migrate=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    if let Err(e) = loaded {
        info!(
            path = %config_file.display(),
            error = %e,
            "no config file loaded, assuming the necessary env variables are defined."
        );
    }

    let cli = Cli::parse();
    let store = LocalStore::new(&cli.store_root);
    let result = match cli.command {
        Command::Migrate(args) => migrate(args, store).await,
        Command::Ls { allocation } => list(&store, &allocation)
            .await
            .map(|()| ExitCode::SUCCESS),
        Command::CreateAllocation { allocation } => store
            .create_allocation(&allocation)
            .await
            .map(|_| ExitCode::SUCCESS)
            .with_context(|| format!("creating allocation {allocation}")),
    };

    match result {
        Ok(code) => code,
        Err(e) => {
            error!("{e:#}");
            ExitCode::FAILURE
        }
    }
}

async fn migrate(args: MigrateArgs, store: LocalStore) -> anyhow::Result<ExitCode> {
    let region = args.region.unwrap_or_else(|| {
        info!("no region defined. using \"{DEFAULT_REGION}\"");
        DEFAULT_REGION.to_string()
    });

    let config = MigrationConfig::builder(args.allocation)
        .region(region)
        .buckets(args.buckets)
        .commit(args.commit)
        .encrypt(args.encrypt)
        .read_payer(args.who_pays)
        .staging_dir(args.staging_dir)
        .remote_root(args.remote_path)
        .strategy(if args.stream {
            StagingStrategy::Stream
        } else {
            StagingStrategy::LocalDisk
        })
        .part_size(args.part_size)
        .download_workers(args.download_workers)
        .object_workers(args.workers)
        .object_timeout(args.object_timeout_secs.map(Duration::from_secs))
        .build()?;

    let source = S3Source::connect(&S3Settings {
        region: &config.region,
        endpoint_url: args.endpoint_url.as_deref(),
        credentials_file: args.credentials_file.as_deref(),
    })
    .await;

    let cancel = CancellationToken::new();
    tokio::spawn(cancel_on_signal(cancel.clone()));

    let report = Migrator::new(config, Arc::new(source), Arc::new(store))
        .with_cancellation(cancel)
        .run()
        .await?;

    for path in &report.commit_retry_paths {
        warn!(remote = path.as_str(), "needs commit retry.");
    }
    if report.cancelled {
        return Ok(ExitCode::from(130));
    }
    Ok(ExitCode::SUCCESS)
}

async fn list(store: &LocalStore, allocation: &str) -> anyhow::Result<()> {
    let allocation = store.open_allocation(allocation).await?;
    let excluded: HashSet<String> = DEFAULT_EXCLUDED_NAMES
        .iter()
        .map(ToString::to_string)
        .collect();

    let files = allocation.list_file_tree(&excluded).await?;
    for (path, size) in &files {
        println!("{size:>12}  {path}");
    }
    println!("{} file(s)", files.len());
    Ok(())
}

/// Picks `-c`/`--config` out of the raw arguments ahead of full parsing.
fn config_path(args: impl IntoIterator<Item = OsString>) -> PathBuf {
    let mut args = args.into_iter().skip(1);
    while let Some(arg) = args.next() {
        let Some(arg) = arg.to_str() else {
            continue;
        };
        if arg == "--" {
            break;
        }
        if arg == "-c" || arg == "--config" {
            if let Some(value) = args.next() {
                return PathBuf::from(value);
            }
        } else if let Some(value) = arg.strip_prefix("--config=") {
            return PathBuf::from(value);
        } else if let Some(value) = arg.strip_prefix("-c").filter(|v| !v.is_empty()) {
            return PathBuf::from(value.strip_prefix('=').unwrap_or(value));
        }
    }
    PathBuf::from(DEFAULT_CONFIG_FILE)
}

async fn cancel_on_signal(cancel: CancellationToken) {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            warn!(error = %e, "failed to install Ctrl+C handler.");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                warn!(error = %e, "failed to install SIGTERM handler.");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => info!("Ctrl+C received, finishing in-flight objects."),
        () = terminate => info!("SIGTERM received, finishing in-flight objects."),
    }
    cancel.cancel();
}
