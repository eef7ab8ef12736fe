//! `wgkeeper`
//!
//! Runs the subscription reconciler as a service and exposes the
//! provisioning and administrator operations as one-shot subcommands.
//! User-facing output uses writeln! to stdout.

use std::io::{self, Write};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use clap::{Parser, Subcommand};
use tracing::{info, warn};

use wgkeeper_core::config::{Config, default_database_path, load_config};
use wgkeeper_daemon::admin::{ActionReport, AdminActions};
use wgkeeper_daemon::notify::{LogNotifier, Notifier, TelegramNotifier};
use wgkeeper_daemon::purchase::Fulfilment;
use wgkeeper_daemon::reconciler::Reconciler;
use wgkeeper_daemon::storage::{Database, NewServer, format_date};
use wgkeeper_provision::{OpenSshConnector, ProvisioningEngine};

#[derive(Parser, Debug)]
#[command(name = "wgkeeper")]
#[command(version, about = "WireGuard VPN provisioning and subscription lifecycle")]
struct Args {
    /// Config file (defaults to ~/.config/wgkeeper/config.toml when present)
    #[arg(long, global = true, env = "WGKEEPER_CONFIG")]
    config: Option<PathBuf>,

    /// Database file path (overrides the config file)
    #[arg(long, global = true)]
    db_path: Option<PathBuf>,

    /// Log level filter (e.g. "info", "debug", "warn").
    #[arg(long, global = true, default_value = "info", env = "WGKEEPER_LOG_LEVEL")]
    log_level: String,

    /// Output logs as JSON (for structured log aggregation).
    #[arg(long, global = true, env = "WGKEEPER_LOG_JSON")]
    log_json: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run the subscription reconciler until interrupted.
    Run,
    /// Run a single reconciliation sweep and exit.
    Sweep,
    /// Register a VPN server.
    AddServer {
        /// Address the server is reachable at.
        #[arg(long)]
        address: String,
        /// Remote shell port.
        #[arg(long, default_value_t = 22)]
        port: u16,
        /// Remote login user.
        #[arg(long, default_value = "root")]
        user: String,
        /// Login password.
        #[arg(long, env = "WGKEEPER_SSH_PASSWORD", hide_env_values = true)]
        password: Option<String>,
        /// Private key file used instead of a password.
        #[arg(long)]
        key_file: Option<PathBuf>,
        /// Maximum number of clients.
        #[arg(long, default_value_t = 10)]
        max_clients: i64,
    },
    /// List registered servers and their occupancy.
    Servers,
    /// Install and configure WireGuard on a registered server.
    SetupServer {
        /// Server ID.
        server_id: i64,
    },
    /// Create a subscription plan.
    AddPlan {
        #[arg(long)]
        name: String,
        #[arg(long, default_value = "")]
        description: String,
        #[arg(long)]
        price: f64,
        /// Duration in days.
        #[arg(long)]
        days: i64,
    },
    /// List plans on offer.
    Plans,
    /// Register a user by chat id.
    AddUser {
        /// Telegram chat id.
        telegram_id: i64,
        #[arg(long)]
        username: Option<String>,
        /// Grant administrator rights.
        #[arg(long)]
        admin: bool,
    },
    /// Fulfil a purchase: provision a peer and record the subscription.
    Provision {
        #[arg(long)]
        user_id: i64,
        #[arg(long)]
        plan_id: i64,
    },
    /// List a user's subscriptions.
    Subscriptions {
        #[arg(long)]
        user_id: i64,
    },
    /// Block a subscription's peer.
    Block { subscription_id: i64 },
    /// Unblock a subscription's peer.
    Unblock { subscription_id: i64 },
    /// Revoke a subscription and remove its peer.
    Revoke { subscription_id: i64 },
    /// Show whether a subscription's peer is blocked on its server.
    Status { subscription_id: i64 },
}

/// Shared services for every subcommand.
struct App {
    config: Config,
    db: Database,
    engine: Arc<ProvisioningEngine>,
    notifier: Arc<dyn Notifier>,
}

impl App {
    async fn open(args: &Args) -> anyhow::Result<Self> {
        let mut config =
            load_config(args.config.as_deref()).context("Failed to load configuration")?;
        if let Some(path) = &args.db_path {
            config.database.path = Some(path.clone());
        }

        let db_path = match &config.database.path {
            Some(path) => path.clone(),
            None => default_database_path()
                .ok_or_else(|| anyhow::anyhow!("Cannot determine home directory"))?,
        };
        info!(path = %db_path.display(), "Opening database");
        let db = Database::open(&db_path)
            .await
            .context("Failed to open database")?;

        let connector = Arc::new(OpenSshConnector::from_config(&config.provisioning));
        let engine = Arc::new(ProvisioningEngine::new(
            connector,
            config.provisioning.clone(),
        ));

        let notifier: Arc<dyn Notifier> = if config.bot.token.is_some() {
            Arc::new(TelegramNotifier::from_config(&config.bot)?)
        } else {
            warn!("No bot token configured; notifications will only be logged");
            Arc::new(LogNotifier)
        };

        Ok(Self {
            config,
            db,
            engine,
            notifier,
        })
    }

    fn reconciler(&self) -> Arc<Reconciler> {
        Arc::new(Reconciler::new(
            Arc::new(self.db.clone()),
            Arc::clone(&self.engine),
            Arc::clone(&self.notifier),
            self.config.reconciler.clone(),
        ))
    }

    fn admin(&self) -> AdminActions {
        AdminActions::new(
            Arc::new(self.db.clone()),
            Arc::clone(&self.engine),
            Arc::clone(&self.notifier),
            Duration::from_secs(self.config.reconciler.action_timeout_secs),
        )
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    wgkeeper_core::tracing_init::init_tracing(
        &wgkeeper_core::tracing_init::default_filter(&args.log_level),
        args.log_json,
    );

    let app = App::open(&args).await?;
    let mut out = io::stdout();

    match args.command {
        Command::Run => run(&app).await?,
        Command::Sweep => {
            if let Some(report) = app.reconciler().sweep().await {
                writeln!(
                    out,
                    "checked {}, expired {} ({} revoke failures), warnings {}, skipped {}",
                    report.checked,
                    report.expired.len(),
                    report.revoke_failures(),
                    report.warnings_sent,
                    report.skipped
                )?;
            }
        }
        Command::AddServer {
            address,
            port,
            user,
            password,
            key_file,
            max_clients,
        } => {
            let server = app
                .db
                .insert_server(&NewServer {
                    address,
                    port,
                    ssh_user: user,
                    ssh_password: password,
                    ssh_key_path: key_file.map(|p| p.to_string_lossy().into_owned()),
                    max_clients,
                })
                .await?;
            writeln!(out, "Server {} registered ({})", server.id, server.address)?;
        }
        Command::Servers => {
            for server in app.db.list_servers().await? {
                let state = match (server.is_active, server.has_capacity()) {
                    (false, _) => "inactive",
                    (true, true) => "open",
                    (true, false) => "full",
                };
                writeln!(
                    out,
                    "{:>4}  {}:{}  {}/{}  {state}",
                    server.id,
                    server.address,
                    server.port,
                    server.current_clients,
                    server.max_clients
                )?;
            }
        }
        Command::SetupServer { server_id } => {
            let host = app.db.get_server(server_id).await?.host_target()?;
            app.engine.setup_server(&host).await?;
            writeln!(out, "Server {server_id} is ready")?;
        }
        Command::AddPlan {
            name,
            description,
            price,
            days,
        } => {
            let plan = app.db.insert_plan(&name, &description, price, days).await?;
            writeln!(out, "Plan {} created ({} days)", plan.id, plan.duration_days)?;
        }
        Command::Plans => {
            for plan in app.db.list_active_plans().await? {
                writeln!(
                    out,
                    "{:>4}  {}  {} days  {:.2}",
                    plan.id, plan.name, plan.duration_days, plan.price
                )?;
            }
        }
        Command::AddUser {
            telegram_id,
            username,
            admin,
        } => {
            let user = app
                .db
                .upsert_user(telegram_id, username.as_deref(), None, None)
                .await?;
            if admin {
                app.db.set_user_admin(user.id, true).await?;
            }
            writeln!(out, "User {} registered ({})", user.id, user.display_name())?;
        }
        Command::Provision { user_id, plan_id } => {
            let fulfilment = Fulfilment::new(app.db.clone(), Arc::clone(&app.engine));
            let subscription = fulfilment.fulfil(user_id, plan_id).await?;
            writeln!(
                out,
                "Subscription {} active until {}; config at {}",
                subscription.id,
                format_date(subscription.end_date),
                subscription.config_path().display()
            )?;
        }
        Command::Subscriptions { user_id } => {
            for sub in app.db.list_user_subscriptions(user_id).await? {
                writeln!(
                    out,
                    "{:>4}  {}  {} - {}  server {}",
                    sub.id,
                    sub.status,
                    format_date(sub.start_date),
                    format_date(sub.end_date),
                    sub.server_id
                )?;
            }
        }
        Command::Block { subscription_id } => {
            print_report(&mut out, &app.admin().block(subscription_id).await?)?;
        }
        Command::Unblock { subscription_id } => {
            print_report(&mut out, &app.admin().unblock(subscription_id).await?)?;
        }
        Command::Revoke { subscription_id } => {
            print_report(&mut out, &app.admin().revoke(subscription_id).await?)?;
        }
        Command::Status { subscription_id } => {
            let blocked = app.admin().is_blocked(subscription_id).await?;
            let state = if blocked { "blocked" } else { "not blocked" };
            writeln!(out, "Subscription {subscription_id}: peer {state}")?;
        }
    }

    Ok(())
}

fn print_report(out: &mut impl Write, report: &ActionReport) -> io::Result<()> {
    writeln!(out, "{}", report.message)?;
    writeln!(out, "status: {}", report.status)
}

async fn run(app: &App) -> anyhow::Result<()> {
    info!(
        version = env!("CARGO_PKG_VERSION"),
        interval_secs = app.config.reconciler.interval_secs,
        "Starting wgkeeper"
    );

    let (shutdown_tx, shutdown_rx) = tokio::sync::watch::channel(false);
    let reconciler_handle = app.reconciler().spawn(shutdown_rx);

    #[cfg(unix)]
    let mut sigterm = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())?;

    // Notify systemd that the service is ready (unix only).
    #[cfg(unix)]
    sd_notify::notify(true, &[sd_notify::NotifyState::Ready])?;

    #[cfg(unix)]
    let sigterm_future = sigterm.recv();
    #[cfg(not(unix))]
    let sigterm_future = std::future::pending::<Option<()>>();

    tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            info!("Received Ctrl+C shutdown signal");
        }
        _ = sigterm_future => {
            info!("Received SIGTERM shutdown signal");
        }
    }

    // Stop ticking; an in-flight sweep finishes first.
    let _ = shutdown_tx.send(true);
    let _ = reconciler_handle.await;

    info!("wgkeeper stopped");
    Ok(())
}
