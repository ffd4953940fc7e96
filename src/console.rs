//! Line-oriented terminal front end for the chat surfaces.

use log::debug;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::task::JoinHandle;

use crate::api::models::{Profile, Session, UserId};
use crate::chat::{AdminConsole, Availability, LocalView, SurfaceKind, SyncEngine, TenantChat};
use crate::error::{ChatError, Result};
use crate::utils::{clock_time, truncate};

/// How many of the latest messages are reprinted on each change.
const TAIL: usize = 20;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConsoleInput {
    Send(String),
    Retry,
    List,
    Open(usize),
    Refresh,
    Quit,
    Unknown(String),
    Blank,
}

impl ConsoleInput {
    pub fn parse(line: &str) -> Self {
        let trimmed = line.trim();
        if trimmed.is_empty() {
            return ConsoleInput::Blank;
        }
        let Some(command) = trimmed.strip_prefix('/') else {
            return ConsoleInput::Send(line.to_string());
        };
        let mut parts = command.split_whitespace();
        match (parts.next(), parts.next()) {
            (Some("quit" | "q"), _) => ConsoleInput::Quit,
            (Some("retry"), _) => ConsoleInput::Retry,
            (Some("list"), _) => ConsoleInput::List,
            (Some("refresh"), _) => ConsoleInput::Refresh,
            (Some("open"), Some(n)) => match n.parse::<usize>() {
                Ok(n) if n > 0 => ConsoleInput::Open(n),
                _ => ConsoleInput::Unknown(trimmed.to_string()),
            },
            _ => ConsoleInput::Unknown(trimmed.to_string()),
        }
    }
}

/// Renders the last `tail` messages, the newest at the bottom.
pub fn render(view: &LocalView, viewer: &UserId, tail: usize) -> String {
    if view.is_empty() {
        return "  (no messages yet)\n".to_string();
    }
    let skip = view.len().saturating_sub(tail);
    let mut out = String::new();
    for m in view.messages().iter().skip(skip) {
        let who = if &m.sender_id == viewer { "you" } else { "them" };
        let marker = if m.id.is_temporary() { " …" } else { "" };
        out.push_str(&format!(
            "  [{}] {:>4}: {}{}\n",
            clock_time(&m.created_at),
            who,
            m.content,
            marker
        ));
    }
    out
}

/// One line about the refresh state: the failure, or that it cleared.
pub fn status_line(last_error: Option<&str>) -> String {
    match last_error {
        Some(e) => format!("! last refresh failed: {} (showing cached messages)", e),
        None => "  (back in sync)".to_string(),
    }
}

/// Reprints the tail of the view when the chat opens and on every change,
/// and reports refresh failures as they start and stop.
fn spawn_renderer(engine: &SyncEngine) -> JoinHandle<()> {
    let mut views = engine.watch_view();
    let mut errors = engine.watch_last_error();
    let viewer = engine.key().viewer.clone();
    tokio::spawn(async move {
        let text = render(&views.borrow_and_update(), &viewer, TAIL);
        println!("----\n{}", text.trim_end());
        if let Some(e) = errors.borrow_and_update().as_deref() {
            println!("{}", status_line(Some(e)));
        }
        loop {
            tokio::select! {
                changed = views.changed() => {
                    if changed.is_err() {
                        break;
                    }
                    let text = render(&views.borrow_and_update(), &viewer, TAIL);
                    println!("----\n{}", text.trim_end());
                }
                changed = errors.changed() => {
                    if changed.is_err() {
                        break;
                    }
                    println!("{}", status_line(errors.borrow_and_update().as_deref()));
                }
            }
        }
    })
}

async fn send_line(engine: Option<&SyncEngine>, input: ConsoleInput) {
    let Some(engine) = engine else {
        println!("! support unavailable");
        return;
    };
    let result = match input {
        ConsoleInput::Send(text) => engine.send(&text).await,
        ConsoleInput::Retry => engine.send_draft().await,
        _ => return,
    };
    match result {
        Ok(sent) => debug!("sent {:?}", sent.id),
        Err(ChatError::EmptyMessage) => println!("! message is empty"),
        Err(e) => {
            println!("! send failed: {} (use /retry to resend)", e);
        }
    }
}

fn print_status(last_error: Option<String>) {
    if last_error.is_some() {
        println!("{}", status_line(last_error.as_deref()));
    }
}

fn tenant_banner(kind: SurfaceKind, session: &Session, admin: &Profile) -> String {
    let place = match kind {
        SurfaceKind::Dashboard => "Messages",
        _ => "Support chat",
    };
    let me = session.email.as_deref().unwrap_or(session.user_id.as_str());
    format!(
        "{} with {}, signed in as {} (/quit to leave)",
        place,
        admin.display_name(),
        me
    )
}

pub async fn run_tenant(mut chat: TenantChat) -> Result<()> {
    let renderer = match (chat.availability(), chat.engine()) {
        (Availability::Available(admin), Some(engine)) => {
            println!("{}", tenant_banner(chat.kind(), chat.session(), &admin));
            Some(spawn_renderer(engine))
        }
        _ => {
            println!("Support is temporarily unavailable. Please try later.");
            None
        }
    };

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    while let Some(line) = lines.next_line().await? {
        match ConsoleInput::parse(&line) {
            ConsoleInput::Quit => break,
            ConsoleInput::Blank => print_status(chat.last_error()),
            input @ (ConsoleInput::Send(_) | ConsoleInput::Retry) => {
                send_line(chat.engine(), input).await
            }
            other => println!("! not available here: {:?}", other),
        }
    }

    if let Some(renderer) = renderer {
        renderer.abort();
    }
    chat.close();
    Ok(())
}

fn print_inbox(console: &AdminConsole) {
    match console.inbox() {
        Availability::Pending => println!("  loading…"),
        Availability::Unavailable => println!("! inbox unavailable"),
        Availability::Available(list) if list.is_empty() => println!("  no conversations yet"),
        Availability::Available(list) => {
            for (n, c) in list.iter().enumerate() {
                let current = if console.selected() == Some(&c.profile.id) { "*" } else { " " };
                println!(
                    "{} {:>2}. {} (last {})",
                    current,
                    n + 1,
                    truncate(&c.profile.display_name(), 32),
                    clock_time(&c.last_message_at)
                );
            }
        }
    }
}

pub async fn run_admin(mut console: AdminConsole) -> Result<()> {
    println!("Admin console: /list, /open N, /refresh, /quit");
    print_inbox(&console);
    let mut renderer = console.engine().map(spawn_renderer);

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    while let Some(line) = lines.next_line().await? {
        match ConsoleInput::parse(&line) {
            ConsoleInput::Quit => break,
            ConsoleInput::Blank => print_status(console.last_error()),
            ConsoleInput::List => print_inbox(&console),
            ConsoleInput::Refresh => {
                console.refresh_inbox().await;
                print_inbox(&console);
            }
            ConsoleInput::Open(n) => {
                let Some(tenant) = console.conversations().get(n - 1).map(|c| c.profile.id.clone())
                else {
                    println!("! no conversation {}", n);
                    continue;
                };
                if let Some(previous) = renderer.take() {
                    previous.abort();
                }
                if let Err(e) = console.select(tenant).await {
                    println!("! opening conversation failed: {}", e);
                }
                renderer = console.engine().map(spawn_renderer);
            }
            input @ (ConsoleInput::Send(_) | ConsoleInput::Retry) => {
                send_line(console.engine(), input).await
            }
            ConsoleInput::Unknown(cmd) => println!("! unknown command {}", cmd),
        }
    }

    if let Some(renderer) = renderer {
        renderer.abort();
    }
    console.close();
    Ok(())
}
