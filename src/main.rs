mod clock;
mod entitlement;
mod global_opts;
mod notifier;
mod remote;
mod resource_store;
mod scheduler;
mod session;
mod store;
mod usage;

use std::{env, process::ExitCode, sync::Arc};

use anyhow::{Context as _, bail};
use clap::{Parser, command};
use tokio::{
    select,
    signal::{
        self,
        unix::{Signal, SignalKind, signal},
    },
};
use tracing::{info, warn};

use clock::{Clock, SystemClock};
use entitlement::{EntitlementReconciler, RefreshError};
use global_opts::GlobalOpts;
use notifier::{Notifier, TerminalNotifier};
use remote::{BillingFunctions, FunctionsClient};
use resource_store::RestResourceStore;
use session::Session;
use store::{FileStore, KeyValueStore};
use usage::{MonthlyResetter, UsageKind, UsageTracker};

#[derive(Debug, Parser)]
#[command(author, version, about, long_about = None)]
struct Cli {
    #[command(flatten)]
    opts: GlobalOpts,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, clap::Subcommand)]
enum Commands {
    /// Show the current plan and this month's usage
    Status,

    /// Re-check the subscription with the backend
    Refresh {
        /// Check even when the cooldown has not elapsed or the plan is locked
        #[arg(long)]
        force: bool,
    },

    /// Check whether an action is allowed under the current plan
    ///
    /// Exits with status 1 when the monthly limit has been reached.
    Check {
        #[arg(value_enum)]
        kind: UsageKind,
    },

    /// Count one download against this month's limit
    RecordDownload,

    /// Print the URL of a checkout session for upgrading
    Checkout,

    /// Print the URL of the billing portal
    Portal,

    /// Keep the plan and usage up to date until interrupted
    ///
    /// Send SIGUSR1 to re-check the subscription immediately.
    Watch,
}

/// Everything a command needs, wired for one signed-in account.
struct App {
    session: Session,
    functions: FunctionsClient,
    reconciler: Arc<EntitlementReconciler>,
    tracker: Arc<UsageTracker>,
    resetter: Arc<MonthlyResetter>,
}

impl App {
    fn new(opts: &GlobalOpts) -> anyhow::Result<Self> {
        let session = Session::parse(&opts.access_token)?;
        let subject_id = session.subject_id().to_owned();

        let store: Arc<dyn KeyValueStore> = Arc::new(FileStore::open(&opts.cache_dir)?);
        let clock: Arc<dyn Clock> = Arc::new(SystemClock);
        let notifier: Arc<dyn Notifier> = Arc::new(TerminalNotifier);

        let entitlement_settings = opts.entitlement_settings();

        let functions = FunctionsClient::new(
            &opts.backend_url,
            opts.anon_key.clone(),
            session.clone(),
            entitlement_settings.request_timeout,
        )?;

        let resources = Arc::new(RestResourceStore::new(
            &opts.backend_url,
            opts.anon_key.clone(),
            session.clone(),
        )?);

        let reconciler = Arc::new(EntitlementReconciler::new(
            &subject_id,
            store.clone(),
            Arc::new(functions.clone()),
            clock.clone(),
            notifier.clone(),
            entitlement_settings,
        ));

        let resetter = Arc::new(MonthlyResetter::new(
            &subject_id,
            store.clone(),
            clock.clone(),
        ));

        // Drop last month's cached usage before anything reads it
        if let Err(err) = resetter.check() {
            warn!(?err, "Failed to check usage period");
        }

        let tracker = Arc::new(UsageTracker::new(
            &subject_id,
            store,
            resources,
            clock,
            notifier,
            reconciler.subscribe(),
            opts.usage_settings(),
        ));

        Ok(Self {
            session,
            functions,
            reconciler,
            tracker,
            resetter,
        })
    }

    async fn status(&self) {
        if let Err(err) = self.reconciler.refresh(false).await {
            warn!(%err, "Showing last known plan");
        }

        let entitlement = self.reconciler.entitlement();
        println!("Account: {}", entitlement.subject_id);
        println!("{entitlement}");
        if self.reconciler.is_locked() {
            println!("Pro plan is confirmed on this device");
        }
        if let Some(expires_at) = self.session.expires_at() {
            println!("Session expires {}", expires_at.format("%Y-%m-%d %H:%M UTC"));
        }

        self.tracker.sync_limits();
        println!("{}", self.tracker.usage().await);
    }

    async fn refresh(&self, force: bool) -> anyhow::Result<()> {
        match self.reconciler.refresh(force).await {
            Ok(entitlement) => {
                println!("{entitlement}");
                Ok(())
            }
            Err(err @ RefreshError::Timeout(_)) => {
                bail!("{err}. The backend may be unreachable, try again later")
            }
            Err(err) => Err(err.into()),
        }
    }

    async fn check(&self, kind: UsageKind) -> bool {
        if let Err(err) = self.reconciler.refresh(false).await {
            warn!(%err, "Checking against last known plan");
        }
        self.tracker.sync_limits();

        let allowed = self.tracker.enforce(kind).await;
        if allowed {
            println!("{kind}: allowed");
        } else {
            println!("{kind}: monthly limit reached");
        }
        allowed
    }

    async fn record_download(&self) -> anyhow::Result<bool> {
        if !self.check(UsageKind::Downloads).await {
            return Ok(false);
        }

        let downloads = self.tracker.record_download()?;
        println!("Downloads this month: {downloads}");
        Ok(true)
    }

    async fn watch(&self, opts: &GlobalOpts) -> anyhow::Result<()> {
        let mut sigusr1 =
            signal(SignalKind::user_defined1()).context("Failed to install SIGUSR1 handler")?;
        let mut sigterm =
            signal(SignalKind::terminate()).context("Failed to install SIGTERM handler")?;

        let tasks = [
            scheduler::limit_sync(self.reconciler.subscribe(), self.tracker.clone()),
            scheduler::entitlement_poller(self.reconciler.clone(), opts.poll_interval()),
            scheduler::period_resetter(
                self.resetter.clone(),
                self.tracker.clone(),
                opts.reset_interval(),
            ),
        ];

        info!(
            subject_id = self.session.subject_id(),
            "Watching plan and usage, send SIGUSR1 to re-check the subscription"
        );

        while watch_trigger(&mut sigusr1, &mut sigterm).await {
            let entitlement = self.reconciler.check_now().await;
            println!("{entitlement}");
            println!("{}", self.tracker.recompute(true).await);
        }

        for task in tasks {
            task.cancel().await;
        }

        Ok(())
    }
}

/// Returns true for an explicit re-check request, false when asked to exit.
async fn watch_trigger(sigusr1: &mut Signal, sigterm: &mut Signal) -> bool {
    select! {
        _ = sigusr1.recv() => {
            info!("Received SIGUSR1, re-checking subscription");
            true
        },
        _ = signal::ctrl_c() => {
            info!("Received SIGINT, exiting");
            false
        },
        _ = sigterm.recv() => {
            info!("Received SIGTERM, exiting");
            false
        },
    }
}

fn setup_logging() {
    use std::io::IsTerminal;
    use tracing_subscriber::{
        filter::{EnvFilter, LevelFilter},
        fmt,
    };

    let color = std::io::stderr().is_terminal()
        && (match env::var("COLORTERM") {
            Ok(value) => value == "truecolor" || value == "24bit",
            _ => false,
        } || match env::var("TERM") {
            Ok(value) => value == "direct" || value == "truecolor",
            _ => false,
        });

    let env_filter = EnvFilter::builder()
        .with_default_directive(LevelFilter::INFO.into())
        .from_env_lossy();

    // stdout carries command output, logs go to stderr
    let fmt = fmt()
        .with_env_filter(env_filter)
        .with_writer(std::io::stderr);

    if color {
        fmt.event_format(fmt::format().pretty())
            .with_file(false)
            .with_line_number(false)
            .with_ansi(color)
            .init();
    } else {
        fmt.with_file(false)
            .with_line_number(false)
            .with_ansi(false)
            .init();
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<ExitCode> {
    let cli = Cli::parse();

    setup_logging();

    let app = App::new(&cli.opts)?;

    match cli.command {
        Commands::Status => app.status().await,
        Commands::Refresh { force } => app.refresh(force).await?,
        Commands::Check { kind } => {
            if !app.check(kind).await {
                return Ok(ExitCode::FAILURE);
            }
        }
        Commands::RecordDownload => {
            if !app.record_download().await? {
                return Ok(ExitCode::FAILURE);
            }
        }
        Commands::Checkout => println!("{}", app.functions.create_checkout().await?),
        Commands::Portal => println!("{}", app.functions.customer_portal().await?),
        Commands::Watch => app.watch(&cli.opts).await?,
    }

    Ok(ExitCode::SUCCESS)
}
