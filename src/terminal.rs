//! terminal.rs
//!
//! Interactive browser: walk a connection's tree, check resources, index or
//! de-index them and watch the pollers resolve.

use std::fmt::{Display, Formatter};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result, bail};
use indicatif::{ProgressBar, ProgressStyle};
use inquire::{Select, Text};
use tokio::sync::broadcast;
use tracing::debug;

use crate::client::{AuthClient, IndexingApi, IndexingClient};
use crate::config::Config;
use crate::kb::{KnowledgeBaseCache, KnowledgeBaseService, MembershipUpdate};
use crate::model::{Connection, Resource};
use crate::session::PickerSession;
use crate::status::{IndexingStatus, ItemStatus, PollOutcome, StatusBoard};

/// One row of the folder menu.
#[derive(Debug, Clone)]
enum Entry {
    Item { resource: Resource, label: String },
    IndexSelected { files: usize, folders: usize },
    SelectAll,
    NextPage,
    FirstPage,
    Up,
    Root,
    Search,
    Wait(usize),
    Quit,
}

impl Display for Entry {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Entry::Item { label, .. } => f.write_str(label),
            Entry::IndexSelected { files, folders: 0 } => write!(f, "> index {files} selected file(s)"),
            Entry::IndexSelected { files, folders } => {
                write!(f, "> index {files} selected file(s), {folders} folder(s) left out")
            }
            Entry::SelectAll => f.write_str("> select all on this page"),
            Entry::NextPage => f.write_str("> next page"),
            Entry::FirstPage => f.write_str("> first page"),
            Entry::Up => f.write_str(".."),
            Entry::Root => f.write_str("> back to root"),
            Entry::Search => f.write_str("> search"),
            Entry::Wait(n) => write!(f, "> wait for {n} in progress"),
            Entry::Quit => f.write_str("> quit"),
        }
    }
}

/// What can be done to a single resource, given its status.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ResourceAction {
    Open,
    Toggle,
    Index,
    Deindex,
    Retry,
    Back,
}

impl Display for ResourceAction {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            ResourceAction::Open => "open folder",
            ResourceAction::Toggle => "select / unselect",
            ResourceAction::Index => "index now",
            ResourceAction::Deindex => "remove from knowledge base",
            ResourceAction::Retry => "retry indexing",
            ResourceAction::Back => "back",
        };
        f.write_str(s)
    }
}

fn actions_for(resource: &Resource, state: IndexingStatus) -> Vec<ResourceAction> {
    let mut actions = Vec::new();
    if resource.is_directory() {
        actions.push(ResourceAction::Open);
    }
    actions.push(ResourceAction::Toggle);
    match state {
        IndexingStatus::Pristine => actions.push(ResourceAction::Index),
        IndexingStatus::Failed => actions.push(ResourceAction::Retry),
        s if s.is_indexed() => actions.push(ResourceAction::Deindex),
        _ => {}
    }
    actions.push(ResourceAction::Back);
    actions
}

fn entry_label(resource: &Resource, status: &ItemStatus, selected: bool) -> String {
    let mark = if selected { "[x]" } else { "[ ]" };
    let name = if resource.is_directory() {
        format!("{}/", resource.name())
    } else {
        resource.name().to_string()
    };
    let modified = resource
        .modified()
        .map(|d| format!("  {}", d.format("%Y-%m-%d")))
        .unwrap_or_default();
    match status.state {
        IndexingStatus::Pristine => format!("{mark} {name}{modified}"),
        _ => format!("{mark} {name}{modified}  ({})", status.label()),
    }
}

pub async fn run_browser(config: &Config) -> Result<()> {
    let auth = Arc::new(AuthClient::new(&config.service)?);
    let api: Arc<dyn IndexingApi> = Arc::new(IndexingClient::new(&config.service, auth)?);

    let connections = api
        .list_connections(Some(&config.provider))
        .await
        .context("failed to list connections")?;
    let connection = pick_connection(connections, &config.provider)?;

    let kb = Arc::new(KnowledgeBaseService::new(
        api,
        Arc::new(KnowledgeBaseCache::new()),
        config.embedding_model.clone(),
    ));
    let mut session = PickerSession::new(
        kb,
        Arc::new(StatusBoard::new()),
        config.poll,
        connection.id.clone(),
        config.page_size,
    );
    session
        .open()
        .await
        .context("failed to open the connection's knowledge base")?;
    println!(
        "Connected to {} (knowledge base {}, {} indexed source(s))",
        connection.name,
        session.knowledge_base_id().unwrap_or("-"),
        session.members().len()
    );

    let result = browse(&mut session).await;
    session.shutdown().await;
    result
}

fn pick_connection(mut connections: Vec<Connection>, provider: &str) -> Result<Connection> {
    match connections.len() {
        0 => bail!("no {provider} connections found"),
        1 => Ok(connections.remove(0)),
        _ => {
            let names: Vec<String> = connections
                .iter()
                .map(|c| format!("{} ({})", c.name, c.id))
                .collect();
            let choice = Select::new("Select connection:", names.clone()).prompt()?;
            let idx = names.iter().position(|n| *n == choice).unwrap_or(0);
            Ok(connections.remove(idx))
        }
    }
}

fn breadcrumb_title(breadcrumb: &[Resource]) -> String {
    let names: Vec<&str> = breadcrumb.iter().map(Resource::name).collect();
    format!("/{}", names.join(" / "))
}

async fn browse(session: &mut PickerSession) -> Result<()> {
    let mut cursors: Vec<Option<String>> = vec![None];
    let mut search: Option<String> = None;

    loop {
        let cursor = cursors.last().cloned().flatten();
        let page = session.list(cursor, search.as_deref()).await?;
        if let Err(e) = session.refresh_statuses(&page.items).await {
            debug!(error = %e, "could not refresh statuses");
        }

        let mut entries: Vec<Entry> = Vec::new();
        if session.current_folder().is_some() || search.is_some() {
            entries.push(Entry::Up);
        }
        if session.breadcrumb().len() > 1 {
            entries.push(Entry::Root);
        }
        for resource in &page.items {
            let status = session.status(&resource.resource_id);
            let selected = session.selection().is_selected(&resource.resource_id);
            entries.push(Entry::Item {
                label: entry_label(resource, &status, selected),
                resource: resource.clone(),
            });
        }
        let selection = session.selection();
        let files = selection.selected_files().len();
        if files > 0 {
            entries.push(Entry::IndexSelected {
                files,
                folders: selection.len() - files,
            });
        }
        if !page.items.is_empty() {
            entries.push(Entry::SelectAll);
        }
        if page.has_more {
            entries.push(Entry::NextPage);
        }
        if cursors.len() > 1 {
            entries.push(Entry::FirstPage);
        }
        let in_progress = session.active_pollers();
        if in_progress > 0 {
            entries.push(Entry::Wait(in_progress));
        }
        entries.push(Entry::Search);
        entries.push(Entry::Quit);

        let title = match &search {
            Some(q) => format!("Search '{q}':"),
            None => format!("{}:", breadcrumb_title(session.breadcrumb())),
        };
        let choice = Select::new(&title, entries).with_page_size(20).prompt()?;

        match choice {
            Entry::Item { resource, .. } => {
                if handle_resource(session, &resource).await? {
                    search = None;
                    cursors = vec![None];
                }
            }
            Entry::IndexSelected { .. } => match session.index_selected().await {
                Ok(update) => report(&update),
                Err(e) => eprintln!("Indexing failed: {e}"),
            },
            Entry::SelectAll => session.selection_mut().select_multiple(&page.items),
            Entry::NextPage => cursors.push(page.next_cursor.clone()),
            Entry::FirstPage => cursors = vec![None],
            Entry::Up => {
                if search.take().is_none() {
                    session.leave();
                }
                cursors = vec![None];
            }
            Entry::Root => {
                search = None;
                session.go_to_depth(0);
                cursors = vec![None];
            }
            Entry::Search => {
                let q = Text::new("Search for:").prompt()?;
                search = Some(q).filter(|q| !q.trim().is_empty());
                cursors = vec![None];
            }
            Entry::Wait(_) => wait_with_spinner(session).await?,
            Entry::Quit => return Ok(()),
        }
    }
}

/// Returns true when the user navigated into a folder.
async fn handle_resource(session: &mut PickerSession, resource: &Resource) -> Result<bool> {
    let state = session.status(&resource.resource_id).state;
    let action = Select::new(resource.name(), actions_for(resource, state)).prompt()?;
    match action {
        ResourceAction::Open => {
            session.enter(resource);
            return Ok(true);
        }
        ResourceAction::Toggle => {
            session.selection_mut().toggle(resource);
        }
        ResourceAction::Index => {
            match session.index_resources(std::slice::from_ref(resource)).await {
                Ok(update) => report(&update),
                Err(e) => eprintln!("Indexing failed: {e}"),
            }
        }
        ResourceAction::Retry => match session.retry(resource).await {
            Ok(update) => report(&update),
            Err(e) => eprintln!("Retry failed: {e}"),
        },
        ResourceAction::Deindex => match session.deindex_resource(resource).await {
            Ok(update) => report(&update),
            Err(e) => eprintln!("Removal failed, status restored: {e}"),
        },
        ResourceAction::Back => {}
    }
    Ok(false)
}

fn report(update: &MembershipUpdate) {
    if update.is_partial() {
        eprintln!(
            "Knowledge base updated ({} members) but sync {}",
            update.knowledge_base.connection_source_ids.len(),
            update.sync
        );
    } else {
        println!(
            "Knowledge base updated ({} members), sync queued",
            update.knowledge_base.connection_source_ids.len()
        );
    }
}

async fn wait_with_spinner(session: &mut PickerSession) -> Result<()> {
    let pb = ProgressBar::new_spinner();
    pb.set_style(ProgressStyle::with_template("{prefix} {spinner} {wide_msg}")?);
    pb.set_prefix("[indexing]");
    pb.enable_steady_tick(Duration::from_millis(100));

    let mut events = session.board().subscribe();
    pb.set_message(format!("{} in progress", session.board().in_progress().len()));
    while session.active_pollers() > 0 {
        tokio::select! {
            event = events.recv() => match event {
                Ok(event) => pb.set_message(format!("{}: {}", event.resource_id, event.status.label())),
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    debug!(skipped, "status events lagged");
                }
                Err(broadcast::error::RecvError::Closed) => break,
            },
            // pollers can finish without a status write
            _ = tokio::time::sleep(Duration::from_millis(250)) => {}
        }
    }

    let outcomes = session.wait_for_pollers().await;
    let unresolved = outcomes
        .iter()
        .filter(|(_, outcome)| *outcome == PollOutcome::Unresolved)
        .count();
    pb.finish_with_message(format!(
        "{} resource(s) resolved, {unresolved} still pending",
        outcomes.len() - unresolved
    ));
    Ok(())
}
