use clap::{Parser, Subcommand};
use env_logger::Env;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use support_chat::api::events::RealtimeNotifier;
use support_chat::api::models::{Profile, Session, UserId};
use support_chat::app::AppState;
use support_chat::chat::{AdminConsole, ChatBackend, SurfaceKind, SyncConfig, TenantChat};
use support_chat::storage::SqliteStore;
use support_chat::{ChatError, Result, console};

#[derive(Parser)]
#[command(name = "support-chat", version, about = "Tenant and admin support chat")]
struct Cli {
    /// Config file (defaults to the platform config dir)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Use an embedded SQLite database instead of the hosted backend
    #[arg(long, global = true, value_name = "DB")]
    local: Option<PathBuf>,

    /// Act as this user id (local mode only)
    #[arg(long = "as", global = true, value_name = "USER_ID")]
    as_user: Option<String>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Sign in and remember the session
    Login {
        #[arg(long)]
        email: String,
        #[arg(long)]
        password: String,
        #[arg(long)]
        url: Option<String>,
        #[arg(long)]
        anon_key: Option<String>,
        #[arg(long)]
        admin_email: Option<String>,
    },
    /// Forget the stored session
    Logout,
    /// Chat with support as a tenant
    Tenant {
        /// Open the dashboard panel instead of the floating widget
        #[arg(long)]
        dashboard: bool,
    },
    /// Answer tenants from the admin console
    Admin,
    /// Add or update a profile in the local database
    Profile {
        #[arg(long)]
        id: String,
        #[arg(long)]
        email: Option<String>,
        #[arg(long)]
        name: Option<String>,
        #[arg(long)]
        admin: bool,
    },
}

fn local_store(path: &Path) -> Result<Arc<SqliteStore>> {
    Ok(Arc::new(SqliteStore::open(path)?))
}

/// The backend plus whoever is using it.
fn connect(
    local: Option<&Path>,
    as_user: Option<&str>,
    state: &AppState,
) -> Result<(ChatBackend, Option<Session>)> {
    if let Some(path) = local {
        let session = as_user.map(|id| Session {
            user_id: UserId::new(id),
            email: None,
            access_token: None,
        });
        return Ok((ChatBackend::from_shared(local_store(path)?), session));
    }

    let session = state.session.clone();
    let client = Arc::new(state.client()?);
    let token = session.as_ref().and_then(|s| s.access_token.clone());
    let notifier = Arc::new(RealtimeNotifier::new(client.base_url(), client.anon_key(), token)?);
    Ok((ChatBackend::new(client.clone(), client, notifier), session))
}

async fn run(cli: Cli) -> Result<()> {
    let Cli {
        config,
        local,
        as_user,
        command,
    } = cli;
    let config_path = config
        .or_else(AppState::default_path)
        .ok_or_else(|| ChatError::Config("no config directory".into()))?;
    let mut state = AppState::load_from(&config_path)?;

    match command {
        Command::Login {
            email,
            password,
            url,
            anon_key,
            admin_email,
        } => {
            if let Some(url) = url {
                state.base_url = url;
            }
            if let Some(key) = anon_key {
                state.anon_key = key;
            }
            if admin_email.is_some() {
                state.admin_email = admin_email;
            }
            state.session = None;
            let session = state.client()?.sign_in(&email, &password).await?;
            println!("signed in as {}", session.email.as_deref().unwrap_or(session.user_id.as_str()));
            state.session = Some(session);
            state.save_to(&config_path)?;
        }
        Command::Logout => {
            state.session = None;
            state.save_to(&config_path)?;
            println!("signed out");
        }
        Command::Profile {
            id,
            email,
            name,
            admin,
        } => {
            let path = local.ok_or_else(|| {
                ChatError::Config("profiles can only be edited with --local".into())
            })?;
            let store = local_store(&path)?;
            store
                .upsert_profile(&Profile {
                    id: UserId::new(id),
                    email,
                    full_name: name,
                    is_admin: admin,
                })
                .await?;
        }
        Command::Tenant { dashboard } => {
            let (backend, session) = connect(local.as_deref(), as_user.as_deref(), &state)?;
            let kind = if dashboard {
                SurfaceKind::Dashboard
            } else {
                SurfaceKind::Widget
            };
            let chat = TenantChat::open(
                kind,
                session,
                &backend,
                state.admin_email.as_deref(),
                SyncConfig::default(),
            )
            .await?;
            console::run_tenant(chat).await?;
        }
        Command::Admin => {
            let (backend, session) = connect(local.as_deref(), as_user.as_deref(), &state)?;
            let admin = AdminConsole::open(session, backend, SyncConfig::default()).await?;
            console::run_admin(admin).await?;
        }
    }
    Ok(())
}

#[tokio::main]
async fn main() {
    env_logger::Builder::from_env(Env::default().default_filter_or("warn")).init();
    if let Err(e) = run(Cli::parse()).await {
        match e {
            ChatError::NotSignedIn => eprintln!("Please sign in first: support-chat login --email … --password …"),
            e => eprintln!("error: {}", e),
        }
        std::process::exit(1);
    }
}
