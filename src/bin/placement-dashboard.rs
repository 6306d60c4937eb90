use anyhow::Context;
use clap::Parser;
use placement_dashboards::backend::PlacementBackend;
use placement_dashboards::dashboard::{unread_notifications, Dashboard};
use placement_dashboards::prelude::*;
use std::sync::Arc;
use std::time::Duration;
use tracing::info;
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[clap(name = "placement-dashboard", version)]
#[clap(about = "Sign in and show the dashboard for your role", long_about = None)]
struct Cli {
    /// Account email. Falls back to PLACEMENT_EMAIL.
    #[clap(long, env = "PLACEMENT_EMAIL")]
    email: Option<String>,

    /// Account password. Falls back to PLACEMENT_PASSWORD.
    #[clap(long, env = "PLACEMENT_PASSWORD", hide_env_values = true)]
    password: Option<String>,

    /// Keep running and re-render whenever applications change
    #[clap(long)]
    watch: bool,

    /// refetch or incremental; overrides PLACEMENT_REFRESH_POLICY
    #[clap(long)]
    policy: Option<String>,

    /// Sign out before exiting
    #[clap(long)]
    sign_out: bool,
}

async fn show<D, F>(
    dashboard: D,
    backend: Arc<dyn PlacementBackend>,
    policy: RefreshPolicy,
    watch: bool,
    render: F,
) -> anyhow::Result<()>
where
    D: Dashboard,
    F: Fn(&D::Snapshot) -> String,
{
    if !watch {
        let snapshot = dashboard.load(backend.as_ref(), None).await;
        println!("{}", render(&snapshot));
        return Ok(());
    }

    let mounted = Mounted::mount(dashboard, backend, policy)
        .await
        .context("failed to subscribe to application changes")?;
    let mut updates = mounted.subscribe();
    println!("{}", render(&*updates.borrow_and_update()));

    loop {
        tokio::select! {
            changed = updates.changed() => {
                if changed.is_err() {
                    break;
                }
                println!("\n{}", render(&*updates.borrow_and_update()));
            }
            _ = tokio::signal::ctrl_c() => break,
        }
    }

    info!(refreshes = mounted.refresh_count(), "stopping");
    mounted.unmount();
    Ok(())
}

async fn run() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let mut config = AppConfig::from_env().context("failed to load configuration")?;
    if let Some(policy) = &cli.policy {
        config = config.with_refresh_policy(policy.parse()?);
    }

    let supabase = Arc::new(SupabaseBackend::new(&config)?);
    if let (Some(email), Some(password)) = (&cli.email, &cli.password) {
        supabase
            .auth()
            .sign_in_with_password(email, password)
            .await
            .context("sign-in failed")?;
    }
    // Watch mode outlives the access token; short runs refresh on demand
    let refresher = cli
        .watch
        .then(|| supabase.keep_session_fresh(Duration::from_secs(30)));
    let backend: Arc<dyn PlacementBackend> = supabase;

    let session = DashboardSession::new(backend.clone());
    let route = session.start().await?;
    let user_id = backend.current_user_id().await?.unwrap_or_default();

    match route {
        Route::Dashboard(DashboardKind::Student) => {
            let dashboard = StudentDashboard::new(user_id.clone());
            show(dashboard, backend.clone(), config.refresh_policy, cli.watch, render::student).await?
        }
        Route::Dashboard(DashboardKind::School) => {
            let dashboard = SchoolDashboard::new(user_id.clone());
            show(dashboard, backend.clone(), config.refresh_policy, cli.watch, render::school).await?
        }
        Route::Dashboard(DashboardKind::Officer) => {
            let dashboard = OfficerDashboard::new(user_id.clone());
            show(dashboard, backend.clone(), config.refresh_policy, cli.watch, render::officer).await?
        }
        Route::Dashboard(DashboardKind::Unavailable) => println!("{}", render::unavailable()),
        other => {
            println!("{}", render::route(other));
            return Ok(());
        }
    }

    if !cli.watch {
        match unread_notifications(backend.as_ref(), &user_id).await {
            Ok(rows) => println!("\n{}", render::notifications(&rows)),
            Err(e) => tracing::warn!("could not load notifications: {}", e),
        }
    }

    if let Some(refresher) = refresher {
        refresher.abort();
    }

    if cli.sign_out {
        let route = session.sign_out().await;
        println!("{}", render::route(route));
    }
    Ok(())
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();

    run().await
}
