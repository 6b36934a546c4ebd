//! Commit queue executable.
//!
//! Wires concrete collaborators from a project configuration file and runs
//! the pending manager's control loop. Dry-run is the default: mutations to
//! the review service and the checkout are swallowed until `--no-dry-run`.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context as _;
use clap::Parser;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use commit_queue::checkout::{Checkout, FakeCheckout, GitCheckout, ReadOnlyCheckout};
use commit_queue::config::ProjectConfig;
use commit_queue::context::Context;
use commit_queue::manager::{ManagerConfig, PendingManager};
use commit_queue::review::{CodeReview, HttpReview, ReadOnlyReview};

#[derive(Debug, Parser)]
#[command(name = "commit-queue", about = "Verify and land code-review patches")]
struct Args {
    /// Project configuration file (JSON).
    #[arg(long)]
    project: PathBuf,

    /// Run for real. Without this flag the queue observes but never mutates
    /// the review service or the repository.
    #[arg(long)]
    no_dry_run: bool,

    /// Use a fake checkout that never touches a working copy.
    #[arg(long)]
    fake: bool,

    /// Minimum delay between polling loops, in seconds.
    #[arg(long, default_value_t = 10)]
    poll_interval: u64,

    /// Print the queue state and exit.
    #[arg(long)]
    query_only: bool,

    /// Directory holding the queue snapshot.
    #[arg(long, default_value = "workdir")]
    work_dir: PathBuf,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "commit_queue=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let args = Args::parse();
    let config = ProjectConfig::load(&args.project)
        .with_context(|| format!("loading project config {}", args.project.display()))?;

    let real_checkout: Arc<dyn Checkout> = if args.fake {
        Arc::new(FakeCheckout::new(&config.checkout_path))
    } else {
        Arc::new(GitCheckout::new(&config.checkout_path, &config.branch))
    };
    let checkout: Arc<dyn Checkout> = if args.no_dry_run || args.fake {
        real_checkout.clone()
    } else {
        Arc::new(ReadOnlyCheckout::new(real_checkout.clone()))
    };

    let http_review: Arc<dyn CodeReview> =
        Arc::new(HttpReview::new(&config.review_url, &config.user));
    let review: Arc<dyn CodeReview> = if args.no_dry_run {
        http_review
    } else {
        Arc::new(ReadOnlyReview::new(http_review))
    };

    let status = config.build_status_sink()?;
    let (pre_patch_verifiers, verifiers) = config.build_verifiers(checkout.clone())?;

    let context = Context::new(review, checkout.clone(), status);
    let manager_config = ManagerConfig {
        poll_interval: std::time::Duration::from_secs(args.poll_interval),
        ..ManagerConfig::default()
    };
    let mut manager = PendingManager::new(context, pre_patch_verifiers, verifiers, manager_config)?;

    std::fs::create_dir_all(&args.work_dir)
        .with_context(|| format!("creating work dir {}", args.work_dir.display()))?;
    let db_path = args
        .work_dir
        .join(format!("{}.json", checkout.project_name()));
    manager
        .load(&db_path)
        .with_context(|| format!("loading queue snapshot {}", db_path.display()))?;

    if args.query_only {
        manager.look_for_new_pending_commits().await;
        manager.update_status().await;
        println!("{}", manager.queue);
        return Ok(());
    }

    let cancel = CancellationToken::new();
    let signal_cancel = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::info!("interrupt received, shutting down");
            signal_cancel.cancel();
        }
    });

    manager
        .run(&db_path, cancel)
        .await
        .context("control loop failed to save the queue")?;
    Ok(())
}
