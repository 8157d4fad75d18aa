use std::path::PathBuf;

use clap::{Parser, Subcommand, ValueEnum};

/// Command-line options for clerk. Output is JSON so automated callers can
/// consume every result.
#[derive(Parser, Debug)]
#[command(name = "clerk", author, version, about)]
pub struct Cli {
    /// Alternate config file path.
    #[arg(long, global = true)]
    pub config: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// List recent inbox conversations.
    Inbox {
        #[arg(long)]
        account: Option<String>,
        #[arg(long, default_value = "INBOX")]
        folder: String,
        #[arg(long, default_value_t = 20)]
        limit: usize,
        /// Only conversations with unread messages.
        #[arg(long)]
        unread: bool,
        /// Bypass the cache and fetch from the server.
        #[arg(long)]
        fresh: bool,
    },

    /// Show a conversation by id or unique prefix.
    Read {
        conv_id: String,
        #[arg(long)]
        fresh: bool,
    },

    /// Re-thread cached messages over the full reference graph.
    Threads {
        #[arg(long)]
        account: Option<String>,
        #[arg(long, default_value = "INBOX")]
        folder: String,
        #[arg(long, default_value_t = 200)]
        limit: usize,
    },

    /// Search cached messages.
    Search {
        query: String,
        #[arg(long)]
        account: Option<String>,
        #[arg(long)]
        folder: Option<String>,
        #[arg(long, default_value_t = 20)]
        limit: usize,
        /// Operator-aware search (from:, is:, after:, ...) instead of a
        /// single phrase match.
        #[arg(long)]
        advanced: bool,
    },

    /// Run a raw read-only SQL query against the message cache.
    Sql {
        query: String,
        #[arg(long, default_value_t = 100)]
        limit: usize,
    },

    /// Create a draft.
    Compose {
        #[arg(long, required = true)]
        to: Vec<String>,
        #[arg(long)]
        cc: Vec<String>,
        #[arg(long, default_value = "")]
        subject: String,
        #[arg(long)]
        body: String,
        #[arg(long)]
        account: Option<String>,
    },

    /// Create a reply draft for a conversation.
    Reply {
        conv_id: String,
        #[arg(long)]
        body: String,
        /// Reply to all original recipients.
        #[arg(long)]
        all: bool,
        #[arg(long)]
        account: Option<String>,
    },

    /// Manage drafts.
    Drafts {
        #[command(subcommand)]
        command: DraftsCommand,
    },

    /// Send a draft. Without --confirm this previews and returns a one-time
    /// confirmation token.
    Send {
        draft_id: String,
        #[arg(long)]
        confirm: bool,
        #[arg(long)]
        token: Option<String>,
        #[arg(long)]
        account: Option<String>,
    },

    /// Change message flags.
    Mark {
        message_id: String,
        #[arg(long, value_enum)]
        state: MarkState,
        #[arg(long)]
        account: Option<String>,
    },

    /// Move a message to another folder.
    Move {
        message_id: String,
        to_folder: String,
        #[arg(long, default_value = "INBOX")]
        from_folder: String,
        #[arg(long)]
        account: Option<String>,
    },

    /// Archive a message.
    Archive {
        message_id: String,
        #[arg(long)]
        account: Option<String>,
    },

    /// List server folders.
    Folders {
        #[arg(long)]
        account: Option<String>,
    },

    /// Unread counts per folder.
    Unread {
        #[arg(long)]
        account: Option<String>,
    },

    /// List or download attachments of a message.
    Attachments {
        message_id: String,
        /// Download the named attachment instead of listing.
        #[arg(long)]
        download: Option<String>,
        /// Destination directory or file path for --download.
        #[arg(long)]
        dest: Option<PathBuf>,
    },

    /// Cache maintenance.
    Cache {
        #[command(subcommand)]
        command: CacheCommand,
    },

    /// Version and per-account connectivity.
    Status,
}

#[derive(Subcommand, Debug)]
pub enum DraftsCommand {
    List {
        #[arg(long)]
        account: Option<String>,
    },
    Show {
        draft_id: String,
    },
    Delete {
        draft_id: String,
    },
}

#[derive(Subcommand, Debug)]
pub enum CacheCommand {
    Stats,
    Clear,
    Refresh {
        #[arg(long)]
        account: Option<String>,
        #[arg(long, default_value = "INBOX")]
        folder: String,
        #[arg(long, default_value_t = 200)]
        limit: usize,
    },
}

#[derive(ValueEnum, Clone, Copy, Debug)]
pub enum MarkState {
    Read,
    Unread,
    Flag,
    Unflag,
}
