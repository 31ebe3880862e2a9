//! Participant state: owns the registry → session → surface chain for one
//! document and turns typed lines into document edits.

use lectern_collab::{
    DocumentSession, EditorSurface, FileSnapshotStore, RelayClient, RelayConfig, RelayError,
    SessionConfig, SnapshotCache, SnapshotConfig, StoreError, TextEdit,
};
use lectern_core::{DocumentRegistry, ParseRoleError, Role, SessionContext};
use parking_lot::Mutex;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use thiserror::Error;

pub const USAGE: &str =
    "usage: lectern-term <server-url> <session-id> <participant-id> <role> [document-key] [name]";

#[derive(Debug, Error)]
pub enum AppError {
    #[error("missing argument <{0}>")]
    MissingArgument(&'static str),
    #[error(transparent)]
    Role(#[from] ParseRoleError),
    #[error("cannot open snapshot directory: {0}")]
    Store(#[from] StoreError),
    #[error(transparent)]
    Relay(#[from] RelayError),
}

/// Positional command-line arguments.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Args {
    pub server_url: String,
    pub session_id: String,
    pub participant_id: String,
    pub role: Role,
    pub document_key: Option<String>,
    pub name: Option<String>,
}

impl Args {
    pub fn parse<I: IntoIterator<Item = String>>(args: I) -> Result<Self, AppError> {
        let mut args = args.into_iter();
        let mut next = |name| args.next().ok_or(AppError::MissingArgument(name));
        let server_url = next("server-url")?;
        let session_id = next("session-id")?;
        let participant_id = next("participant-id")?;
        let role: Role = next("role")?.parse()?;
        Ok(Self {
            server_url,
            session_id,
            participant_id,
            role,
            document_key: args.next(),
            name: args.next(),
        })
    }

    pub fn context(&self) -> SessionContext {
        let name = self.name.clone().unwrap_or_else(|| self.participant_id.clone());
        SessionContext::new(self.participant_id.clone(), name, self.role)
    }
}

/// One line typed at the prompt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    Sync,
    Status,
    Quit,
    Append(String),
    Unknown(String),
}

impl Command {
    pub fn parse(line: &str) -> Command {
        match line.trim_end_matches(['\r', '\n']) {
            ":sync" => Command::Sync,
            ":status" => Command::Status,
            ":quit" | ":q" => Command::Quit,
            cmd if cmd.starts_with(':') && !cmd.starts_with("::") => {
                Command::Unknown(cmd.to_string())
            }
            // A leading "::" escapes a literal colon.
            text => Command::Append(text.strip_prefix(':').unwrap_or(text).to_string()),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Flow {
    Continue,
    Exit,
}

/// Editor surface that re-renders the whole document to stdout.
#[derive(Debug, Default)]
pub struct TermSurface {
    buffer: Mutex<String>,
    read_only: AtomicBool,
    quiet: bool,
}

impl TermSurface {
    pub fn new() -> Self {
        Self::default()
    }

    /// A surface that tracks content without printing.
    pub fn quiet() -> Self {
        Self {
            quiet: true,
            ..Self::default()
        }
    }

    pub fn is_read_only(&self) -> bool {
        self.read_only.load(Ordering::Acquire)
    }

    fn render(&self, content: &str) {
        if self.quiet {
            return;
        }
        let mode = if self.is_read_only() { "read-only" } else { "editing" };
        println!("──── {mode} ────");
        print!("{content}");
        if !content.ends_with('\n') {
            println!();
        }
        println!("────────────────");
    }
}

impl EditorSurface for TermSurface {
    fn content(&self) -> String {
        self.buffer.lock().clone()
    }

    fn apply_remote_edit(&self, edit: &TextEdit) {
        let content = {
            let mut buffer = self.buffer.lock();
            *buffer = edit.apply_to(&buffer);
            buffer.clone()
        };
        self.render(&content);
    }

    fn set_read_only(&self, read_only: bool) {
        let was = self.read_only.swap(read_only, Ordering::AcqRel);
        if was != read_only && !self.quiet {
            println!("[{}]", if read_only { "read-only" } else { "editable" });
        }
    }
}

pub struct AppState {
    args: Args,
    relay: RelayClient,
    cache: SnapshotCache,
    registry: DocumentRegistry,
    session: DocumentSession,
    surface: Arc<TermSurface>,
}

impl AppState {
    pub fn new(args: Args, data_dir: &Path, surface: TermSurface) -> Result<Self, AppError> {
        let store = Arc::new(FileSnapshotStore::open(data_dir)?);
        let cache = SnapshotCache::new(store, SnapshotConfig::default());
        let registry = DocumentRegistry::with_loader(Arc::new(cache.clone()));

        let context = args.context();
        let key = args
            .document_key
            .clone()
            .unwrap_or_else(|| context.default_document_key());
        let relay = RelayClient::new(context.participant_id.clone());
        let session =
            DocumentSession::open(&registry, relay.clone(), &context, &key, SessionConfig::default());

        let surface = Arc::new(surface);
        session.bind(surface.clone());

        Ok(Self {
            args,
            relay,
            cache,
            registry,
            session,
            surface,
        })
    }

    pub fn session(&self) -> &DocumentSession {
        &self.session
    }

    pub fn relay(&self) -> &RelayClient {
        &self.relay
    }

    pub fn surface(&self) -> &Arc<TermSurface> {
        &self.surface
    }

    pub async fn connect(&self) -> Result<(), AppError> {
        let config = RelayConfig::new(&self.args.server_url, &self.args.session_id);
        let url = config.session_url(&self.args.context())?;
        self.relay.connect(&url).await?;
        Ok(())
    }

    pub fn handle(&self, command: Command) -> Flow {
        match command {
            Command::Sync => {
                if let Err(e) = self.session.request_sync() {
                    println!("resync unavailable: {e}");
                }
            }
            Command::Status => println!("{}", self.status_line()),
            Command::Quit => return Flow::Exit,
            Command::Append(line) => {
                if !self.append_line(&line) {
                    println!("[read-only] edit refused");
                }
            }
            Command::Unknown(cmd) => println!("unknown command {cmd} (try :sync, :status, :quit)"),
        }
        Flow::Continue
    }

    /// Append `line` plus a newline at the end of the document.
    pub fn append_line(&self, line: &str) -> bool {
        let end = self.session.text().len();
        self.session.insert(end, &format!("{line}\n"))
    }

    pub fn status_line(&self) -> String {
        format!(
            "{} as {} ({}): connection {}, sync {}, {}",
            self.session.document_key(),
            self.args.participant_id,
            self.session.role(),
            self.session.connection_status(),
            self.session.sync_status(),
            if self.session.can_edit() { "editable" } else { "read-only" },
        )
    }

    /// Stop syncing and write any pending snapshots.
    pub fn shutdown(&self) -> usize {
        self.session.teardown();
        let flushed = self.cache.flush();
        self.cache.teardown();
        self.relay.close();
        self.registry.teardown();
        flushed
    }
}
