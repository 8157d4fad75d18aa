//! Unified operations surface consumed by the CLI and any other front end.
//!
//! Reads are cache-first: the store answers whenever its freshness predicate
//! holds, and the server is consulted otherwise. Writes go to the server
//! first and are then mirrored into the store; a failed mirror heals on the
//! next sync. Every IMAP session is scoped to a single operation.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use serde::Serialize;
use tracing::{info, warn};

use crate::config::secrets::{KeyringStore, SecretStore};
use crate::config::Config;
use crate::drafts::{DraftManager, NewDraft};
use crate::errors::{Error, Result};
use crate::imap::MailClient;
use crate::search;
use crate::send::{self, ConfirmationTokens, RateLimiters, SmtpSender, CONFIRMATION_TOKEN_TTL};
use crate::storage::Store;
use crate::threads;
use crate::types::{
    Address, Attachment, CacheStats, Conversation, ConversationSummary, Draft, FolderInfo,
    Message, MessageFlag, SendResult, UnreadCounts, now_utc,
};

pub fn version() -> &'static str {
    env!("CARGO_PKG_VERSION")
}

#[derive(Debug, Serialize)]
pub struct InboxResult {
    pub account: String,
    pub conversations: Vec<ConversationSummary>,
    pub count: usize,
    pub from_cache: bool,
}

#[derive(Debug, Serialize)]
pub struct SearchResultSet {
    pub query: String,
    pub messages: Vec<Message>,
    pub count: usize,
}

/// Structured result of a conversation id/prefix lookup. Exactly one field is
/// set: a unique match, the ambiguous candidates, or an error message.
#[derive(Debug, Serialize)]
pub struct ConversationLookup {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub conversation: Option<Conversation>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub matches: Option<Vec<ConversationSummary>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[derive(Debug, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum SendResponse {
    /// Step one of the two-step flow: the gate passed and a one-time token
    /// was issued; nothing was sent yet.
    PendingConfirmation {
        draft_id: String,
        preview: String,
        confirmation_token: String,
        expires_in_seconds: u64,
    },
    Sent {
        result: SendResult,
    },
}

#[derive(Debug, Serialize)]
pub struct AccountStatus {
    pub connected: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub folders: Option<usize>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct StatusReport {
    pub version: String,
    pub accounts: BTreeMap<String, AccountStatus>,
}

pub struct Api {
    config: Config,
    store: Store,
    drafts: DraftManager,
    limiters: RateLimiters,
    tokens: ConfirmationTokens,
    secrets: Arc<dyn SecretStore>,
}

impl Api {
    pub fn new(config: Config, store: Store) -> Self {
        Self::with_secret_store(config, store, Arc::new(KeyringStore))
    }

    /// Constructor with an injected secret backend, for tests.
    pub fn with_secret_store(
        config: Config,
        store: Store,
        secrets: Arc<dyn SecretStore>,
    ) -> Self {
        let limiters = RateLimiters::new(config.send.rate_limit);
        Self {
            drafts: DraftManager::new(store.clone()),
            limiters,
            tokens: ConfirmationTokens::new(),
            config,
            store,
            secrets,
        }
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn store(&self) -> &Store {
        &self.store
    }

    fn client_for(&self, account: Option<&str>) -> Result<(String, MailClient)> {
        let (name, account_config) = self.config.get_account(account)?;
        Ok((
            name.to_string(),
            MailClient::new(name, account_config.clone(), self.secrets.clone()),
        ))
    }

    // ------------------------------------------------------------------
    // Inbox & messages
    // ------------------------------------------------------------------

    /// List recent conversations. Served from the store when the inbox sync
    /// marker is fresh; otherwise headers are fetched from the server first.
    pub async fn list_inbox(
        &self,
        account: Option<&str>,
        folder: &str,
        limit: usize,
        unread_only: bool,
        fresh: bool,
    ) -> Result<InboxResult> {
        let (name, mut client) = self.client_for(account)?;

        if !fresh
            && self
                .store
                .is_inbox_fresh(&name, self.config.cache.inbox_freshness_min)
                .await?
        {
            let conversations = self
                .store
                .list_conversations(Some(&name), folder, unread_only, limit)
                .await?;
            return Ok(InboxResult {
                account: name,
                count: conversations.len(),
                conversations,
                from_cache: true,
            });
        }

        client.connect().await?;
        // Fetch at a margin so threading has enough context to group the
        // requested number of conversations.
        let fetched = client
            .fetch_messages(folder, limit * 3, None, unread_only, false)
            .await;
        client.disconnect().await;
        let messages = fetched?;

        for msg in &messages {
            self.store.put_message(msg).await?;
        }
        self.store.mark_inbox_synced(&name).await?;
        self.store
            .prune_old_messages(self.config.cache.window_days)
            .await?;

        let conversations = self
            .store
            .list_conversations(Some(&name), folder, unread_only, limit)
            .await?;
        info!(account = %name, folder, fetched = messages.len(), "Inbox refreshed from server");
        Ok(InboxResult {
            account: name,
            count: conversations.len(),
            conversations,
            from_cache: false,
        })
    }

    /// Get a conversation by id or unique prefix, filling in stale or missing
    /// bodies from the server as needed.
    pub async fn get_conversation(
        &self,
        conv_id: &str,
        fresh: bool,
    ) -> Result<Option<Conversation>> {
        let Some(mut conv) = self.store.get_conversation(conv_id).await? else {
            return Ok(None);
        };

        for msg in &mut conv.messages {
            if msg.body_text.is_none() {
                self.refill_body(msg, fresh).await?;
            }
        }
        Ok(Some(conv))
    }

    pub async fn get_message(&self, message_id: &str, fresh: bool) -> Result<Option<Message>> {
        let Some(mut msg) = self.store.get_message(message_id).await? else {
            return Ok(None);
        };
        if msg.body_text.is_none() {
            self.refill_body(&mut msg, fresh).await?;
        }
        Ok(Some(msg))
    }

    async fn refill_body(&self, msg: &mut Message, fresh: bool) -> Result<()> {
        let cache_ok = !fresh
            && self
                .store
                .is_fresh(&msg.message_id, self.config.cache.body_freshness_min, true)
                .await?;
        if cache_ok {
            return Ok(());
        }

        let (_, mut client) = self.client_for(Some(&msg.account))?;
        client.connect().await?;
        let fetched = client.fetch_message_body(&msg.folder, &msg.message_id).await;
        client.disconnect().await;
        let (body_text, body_html) = fetched?;

        self.store
            .update_body(&msg.message_id, body_text.as_deref(), body_html.as_deref())
            .await?;
        msg.body_text = body_text;
        msg.body_html = body_html;
        Ok(())
    }

    /// Re-thread cached messages with the full reference-chain algorithm.
    ///
    /// Listing normally groups rows by their ingest-time conversation id;
    /// this pass walks the complete reference graph instead, so threads whose
    /// members carry differing reference prefixes still come back merged.
    pub async fn thread_conversations(
        &self,
        account: Option<&str>,
        folder: &str,
        limit: usize,
    ) -> Result<Vec<Conversation>> {
        let (name, _) = self.config.get_account(account)?;
        let messages = self.store.list_messages(Some(name), folder, limit).await?;
        Ok(threads::thread_messages(messages))
    }

    /// Resolve a conversation id or prefix with structured disambiguation.
    pub async fn resolve_conversation_id(
        &self,
        conv_id: &str,
        fresh: bool,
    ) -> Result<ConversationLookup> {
        if let Some(conv) = self.get_conversation(conv_id, fresh).await? {
            return Ok(ConversationLookup {
                conversation: Some(conv),
                matches: None,
                error: None,
            });
        }

        let matches = self.store.find_conversations_by_prefix(conv_id).await?;
        if !matches.is_empty() {
            return Ok(ConversationLookup {
                conversation: None,
                matches: Some(matches),
                error: None,
            });
        }

        Ok(ConversationLookup {
            conversation: None,
            matches: None,
            error: Some(format!("No conversation matching '{conv_id}'")),
        })
    }

    // ------------------------------------------------------------------
    // Search
    // ------------------------------------------------------------------

    pub async fn search(
        &self,
        query: &str,
        account: Option<&str>,
        limit: usize,
    ) -> Result<SearchResultSet> {
        let messages = self.store.search(query, account, limit).await?;
        Ok(SearchResultSet {
            query: query.to_string(),
            count: messages.len(),
            messages,
        })
    }

    pub async fn search_advanced(
        &self,
        query: &str,
        account: Option<&str>,
        folder: Option<&str>,
        limit: usize,
    ) -> Result<SearchResultSet> {
        let parsed = search::parse_query(query);
        let messages = self
            .store
            .search_advanced(&parsed, account, folder, limit)
            .await?;
        Ok(SearchResultSet {
            query: query.to_string(),
            count: messages.len(),
            messages,
        })
    }

    /// Raw read-only SQL over the message table, for power users.
    pub async fn search_sql(
        &self,
        sql: &str,
        params: &[String],
        limit: usize,
    ) -> Result<Vec<Message>> {
        self.store.execute_raw_query(sql, params, limit).await
    }

    // ------------------------------------------------------------------
    // Message actions (server first, then store mirror)
    // ------------------------------------------------------------------

    pub async fn mark_read(&self, message_id: &str, account: Option<&str>) -> Result<()> {
        self.change_flag(message_id, account, MessageFlag::Seen, true).await
    }

    pub async fn mark_unread(&self, message_id: &str, account: Option<&str>) -> Result<()> {
        self.change_flag(message_id, account, MessageFlag::Seen, false).await
    }

    pub async fn flag_message(&self, message_id: &str, account: Option<&str>) -> Result<()> {
        self.change_flag(message_id, account, MessageFlag::Flagged, true).await
    }

    pub async fn unflag_message(&self, message_id: &str, account: Option<&str>) -> Result<()> {
        self.change_flag(message_id, account, MessageFlag::Flagged, false).await
    }

    async fn change_flag(
        &self,
        message_id: &str,
        account: Option<&str>,
        flag: MessageFlag,
        add: bool,
    ) -> Result<()> {
        let cached = self.store.get_message(message_id).await?;
        let folder = cached
            .as_ref()
            .map(|m| m.folder.clone())
            .unwrap_or_else(|| "INBOX".to_string());

        let (_, mut client) = self.client_for(account)?;
        client.connect().await?;
        let result = if add {
            client.add_flags(&folder, message_id, &[flag]).await
        } else {
            client.remove_flags(&folder, message_id, &[flag]).await
        };
        client.disconnect().await;
        result?;

        // Mirror into the store; skipped silently when the message is not
        // cached.
        if let Some(msg) = cached {
            let mut flags = msg.flags;
            if add {
                if !flags.contains(&flag) {
                    flags.push(flag);
                }
            } else {
                flags.retain(|f| *f != flag);
            }
            self.store.update_flags(message_id, &flags).await?;
        }
        Ok(())
    }

    pub async fn move_message(
        &self,
        message_id: &str,
        to_folder: &str,
        from_folder: &str,
        account: Option<&str>,
    ) -> Result<()> {
        let (_, mut client) = self.client_for(account)?;
        client.connect().await?;
        let result = client.move_message(message_id, from_folder, to_folder).await;
        client.disconnect().await;
        result?;

        self.store.move_message(message_id, to_folder).await
    }

    pub async fn archive_message(&self, message_id: &str, account: Option<&str>) -> Result<()> {
        let (_, mut client) = self.client_for(account)?;
        client.connect().await?;
        let result = client.archive_message(message_id, "INBOX").await;
        client.disconnect().await;
        result?;

        self.store.move_message(message_id, "Archive").await
    }

    // ------------------------------------------------------------------
    // Folders & attachments
    // ------------------------------------------------------------------

    pub async fn list_folders(&self, account: Option<&str>) -> Result<Vec<FolderInfo>> {
        let (_, mut client) = self.client_for(account)?;
        client.connect().await?;
        let result = client.list_folders().await;
        client.disconnect().await;
        result
    }

    pub async fn get_unread_counts(&self, account: Option<&str>) -> Result<UnreadCounts> {
        let (_, mut client) = self.client_for(account)?;
        client.connect().await?;
        let result = client.unread_counts().await;
        client.disconnect().await;
        result
    }

    pub async fn list_attachments(&self, message_id: &str) -> Result<Vec<Attachment>> {
        let msg = self
            .store
            .get_message(message_id)
            .await?
            .ok_or_else(|| Error::NotFound(format!("message not found: {message_id}")))?;
        Ok(msg.attachments)
    }

    /// Download one attachment. `destination` may be a directory (the file
    /// keeps its own name) or a full file path.
    pub async fn download_attachment(
        &self,
        message_id: &str,
        filename: &str,
        destination: &Path,
    ) -> Result<PathBuf> {
        let msg = self
            .store
            .get_message(message_id)
            .await?
            .ok_or_else(|| Error::NotFound(format!("message not found: {message_id}")))?;
        if !msg.attachments.iter().any(|a| a.filename == filename) {
            return Err(Error::NotFound(format!("attachment not found: {filename}")));
        }

        let (_, mut client) = self.client_for(Some(&msg.account))?;
        client.connect().await?;
        let fetched = client
            .fetch_attachment(&msg.folder, message_id, filename)
            .await;
        client.disconnect().await;
        let content = fetched?;

        let mut dest = destination.to_path_buf();
        if dest.is_dir() {
            dest = dest.join(filename);
        }
        if let Some(parent) = dest.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(&dest, content)?;
        Ok(dest)
    }

    // ------------------------------------------------------------------
    // Drafts
    // ------------------------------------------------------------------

    #[allow(clippy::too_many_arguments)]
    pub async fn create_draft(
        &self,
        account: Option<&str>,
        to: &[String],
        cc: &[String],
        subject: &str,
        body_text: &str,
        body_html: Option<&str>,
        reply_to_conv_id: Option<&str>,
    ) -> Result<Draft> {
        let (name, account_config) = self.config.get_account(account)?;

        if let Some(conv_id) = reply_to_conv_id {
            return self
                .drafts
                .create_reply(
                    name,
                    &account_config.from.address,
                    conv_id,
                    body_text.to_string(),
                    body_html.map(|h| h.to_string()),
                    false,
                )
                .await;
        }

        let to_addrs: Vec<Address> = to.iter().map(|a| Address::bare(a.trim())).collect();
        let cc_addrs: Vec<Address> = cc.iter().map(|a| Address::bare(a.trim())).collect();
        self.drafts
            .create(
                name,
                NewDraft {
                    to: to_addrs,
                    cc: cc_addrs,
                    subject: subject.to_string(),
                    body_text: body_text.to_string(),
                    body_html: body_html.map(|h| h.to_string()),
                    ..NewDraft::default()
                },
            )
            .await
    }

    pub async fn create_reply(
        &self,
        account: Option<&str>,
        conv_id: &str,
        body_text: &str,
        body_html: Option<&str>,
        reply_all: bool,
    ) -> Result<Draft> {
        let (name, account_config) = self.config.get_account(account)?;
        self.drafts
            .create_reply(
                name,
                &account_config.from.address,
                conv_id,
                body_text.to_string(),
                body_html.map(|h| h.to_string()),
                reply_all,
            )
            .await
    }

    pub async fn get_draft(&self, draft_id: &str) -> Result<Option<Draft>> {
        self.drafts.get(draft_id).await
    }

    pub async fn list_drafts(&self, account: Option<&str>) -> Result<Vec<Draft>> {
        self.drafts.list(account).await
    }

    pub async fn update_draft(&self, draft: &mut Draft) -> Result<()> {
        self.drafts.update(draft).await
    }

    pub async fn delete_draft(&self, draft_id: &str) -> Result<bool> {
        self.drafts.delete(draft_id).await
    }

    // ------------------------------------------------------------------
    // Send
    // ------------------------------------------------------------------

    /// Send a draft.
    ///
    /// With confirmation required (the default), the first call runs the
    /// safety gate and returns a preview plus one-time token; the second call
    /// presents the token and performs the send. The draft is deleted only
    /// after a successful dispatch.
    pub async fn send_draft(
        &self,
        draft_id: &str,
        account: Option<&str>,
        confirm: bool,
        token: Option<&str>,
    ) -> Result<SendResponse> {
        let draft = self
            .drafts
            .get(draft_id)
            .await?
            .ok_or_else(|| Error::NotFound(format!("draft not found: {draft_id}")))?;

        let target = account.unwrap_or(&draft.account);
        let (name, account_config) = self.config.get_account(Some(target))?;

        send::check_send_allowed(&draft, name, account_config, &self.config, &self.limiters)?;

        if self.config.send.require_confirmation {
            if !confirm {
                let token = self.tokens.issue(draft_id);
                return Ok(SendResponse::PendingConfirmation {
                    draft_id: draft_id.to_string(),
                    preview: send::format_draft_preview(&draft),
                    confirmation_token: token,
                    expires_in_seconds: CONFIRMATION_TOKEN_TTL.as_secs(),
                });
            }
            let token = token.ok_or_else(|| {
                Error::SendBlocked("missing confirmation token; call with confirm=false first".into())
            })?;
            self.tokens.validate(draft_id, token)?;
        }

        let message_id = send::generate_message_id(&account_config.from.address);
        let message = send::build_mime(&draft, &account_config.from, &message_id)?;

        SmtpSender::new(name, account_config)
            .send(message, self.secrets.as_ref())
            .await?;

        self.limiters.record_send(name);
        self.store
            .log_send(
                name,
                &draft.to,
                &draft.cc,
                &draft.bcc,
                &draft.subject,
                Some(&message_id),
            )
            .await?;
        if let Err(e) = self.drafts.delete(draft_id).await {
            warn!(draft_id, error = %e, "Sent but failed to delete draft");
        }

        info!(account = %name, message_id = %message_id, "Draft sent");
        Ok(SendResponse::Sent {
            result: SendResult {
                success: true,
                message_id: Some(message_id),
                timestamp: now_utc(),
            },
        })
    }

    // ------------------------------------------------------------------
    // Cache & status
    // ------------------------------------------------------------------

    pub async fn get_cache_stats(&self) -> Result<CacheStats> {
        self.store.get_stats().await
    }

    pub async fn clear_cache(&self) -> Result<()> {
        self.store.clear().await
    }

    /// Force a refresh from the server. Returns the number of messages
    /// fetched.
    pub async fn refresh_cache(
        &self,
        account: Option<&str>,
        folder: &str,
        limit: usize,
    ) -> Result<usize> {
        let (name, mut client) = self.client_for(account)?;
        client.connect().await?;
        let fetched = client.fetch_messages(folder, limit, None, false, true).await;
        client.disconnect().await;
        let messages = fetched?;

        for msg in &messages {
            self.store.put_message(msg).await?;
        }
        self.store.mark_inbox_synced(&name).await?;
        self.store
            .prune_old_messages(self.config.cache.window_days)
            .await?;
        Ok(messages.len())
    }

    /// Version plus per-account connectivity.
    pub async fn get_status(&self) -> StatusReport {
        let mut accounts = BTreeMap::new();
        let names: Vec<String> = self.config.accounts.keys().cloned().collect();

        for name in names {
            let status = match self.client_for(Some(&name)) {
                Ok((_, mut client)) => match client.connect().await {
                    Ok(()) => {
                        let folders = client.list_folders().await;
                        client.disconnect().await;
                        match folders {
                            Ok(folders) => AccountStatus {
                                connected: true,
                                folders: Some(folders.len()),
                                error: None,
                            },
                            Err(e) => AccountStatus {
                                connected: true,
                                folders: None,
                                error: Some(e.to_string()),
                            },
                        }
                    }
                    Err(e) => AccountStatus {
                        connected: false,
                        folders: None,
                        error: Some(e.to_string()),
                    },
                },
                Err(e) => AccountStatus {
                    connected: false,
                    folders: None,
                    error: Some(e.to_string()),
                },
            };
            accounts.insert(name, status);
        }

        StatusReport {
            version: version().to_string(),
            accounts,
        }
    }
}
