//! IMAP client bridging the wire protocol to the data model.
//!
//! Sessions are scoped: callers connect, perform their operation and
//! disconnect; no connection is reused across operations. A single session is
//! stateful (folder-selected) and never shared. Authentication is selected by
//! the account protocol: LOGIN with a password from the credential chain, or
//! Gmail XOAUTH2 with a freshly obtained access token.

use std::sync::Arc;
use std::time::Duration;

use async_imap::types::{Fetch, Flag, Name, NameAttribute};
use async_imap::{Authenticator, Client, Session};
use chrono::{DateTime, Utc};
use futures::TryStreamExt;
use once_cell::sync::Lazy;
use regex::Regex;
use rustls_native_certs::load_native_certs;
use tokio::net::TcpStream;
use tokio_rustls::rustls::{Certificate, ClientConfig, RootCertStore, ServerName};
use tokio_rustls::TlsConnector;
use tracing::{debug, warn};

use crate::config::secrets::{account_password, SecretStore};
use crate::config::{AccountConfig, Protocol};
use crate::errors::{Error, Result};
use crate::mime;
use crate::oauth;
use crate::threads;
use crate::types::{Address, FolderInfo, Message, MessageFlag, UnreadCounts, now_utc};

pub type ImapSession = Session<tokio_rustls::client::TlsStream<TcpStream>>;

const CONNECT_TIMEOUT: Duration = Duration::from_secs(30);
const OP_TIMEOUT: Duration = Duration::from_secs(120);

const HEADER_FETCH_ITEMS: &str = "(FLAGS ENVELOPE INTERNALDATE RFC822.SIZE BODY.PEEK[HEADER])";
const BODY_FETCH_ITEMS: &str = "(FLAGS ENVELOPE INTERNALDATE RFC822.SIZE BODY.PEEK[])";

/// Archive folder candidates, in preference order. The order encodes
/// compatibility with Gmail and common server layouts.
const ARCHIVE_FOLDERS: &[&str] = &["Archive", "[Gmail]/All Mail", "All Mail", "Archives"];

static SYNTHETIC_ID: Lazy<Regex> = Lazy::new(|| Regex::new(r"^<(\d+)@local>$").unwrap());

async fn deadline<F, T>(future: F) -> Result<T>
where
    F: std::future::Future<Output = std::result::Result<T, async_imap::error::Error>>,
{
    tokio::time::timeout(OP_TIMEOUT, future)
        .await
        .map_err(|_| Error::Connection("IMAP operation timed out".into()))?
        .map_err(Error::from)
}

pub struct MailClient {
    account: String,
    config: AccountConfig,
    secrets: Arc<dyn SecretStore>,
    session: Option<ImapSession>,
}

impl MailClient {
    pub fn new(account: &str, config: AccountConfig, secrets: Arc<dyn SecretStore>) -> Self {
        Self {
            account: account.to_string(),
            config,
            secrets,
            session: None,
        }
    }

    pub async fn connect(&mut self) -> Result<()> {
        if self.session.is_some() {
            return Ok(());
        }
        let session = match self.config.protocol {
            Protocol::Imap => self.connect_password().await?,
            Protocol::Gmail => self.connect_gmail().await?,
        };
        self.session = Some(session);
        Ok(())
    }

    pub async fn disconnect(&mut self) {
        if let Some(mut session) = self.session.take() {
            let _ = session.logout().await;
        }
    }

    fn session(&mut self) -> Result<&mut ImapSession> {
        self.session
            .as_mut()
            .ok_or_else(|| Error::Connection("not connected to IMAP server".into()))
    }

    async fn connect_password(&mut self) -> Result<ImapSession> {
        let imap = self
            .config
            .imap
            .clone()
            .ok_or_else(|| Error::InvalidInput("imap configuration required".into()))?;
        if !imap.ssl {
            return Err(Error::InvalidInput(
                "plaintext IMAP is not supported; set ssl: true".into(),
            ));
        }

        let password = account_password(&self.account, &self.config, self.secrets.as_ref()).await?;
        let client = tls_client(&imap.host, imap.port).await?;
        let session = tokio::time::timeout(CONNECT_TIMEOUT, client.login(&imap.username, &password))
            .await
            .map_err(|_| Error::Connection("IMAP login timed out".into()))?
            .map_err(|(e, _)| Error::Auth(format!("LOGIN failed: {e}")))?;
        Ok(session)
    }

    async fn connect_gmail(&mut self) -> Result<ImapSession> {
        let oauth_config = self
            .config
            .oauth
            .as_ref()
            .ok_or_else(|| Error::InvalidInput("oauth configuration required for gmail".into()))?;
        let token = oauth::access_token(&self.account, &oauth_config.client_id_file).await?;

        let client = tls_client("imap.gmail.com", 993).await?;
        let authenticator = Xoauth2 {
            user: self.config.from.address.clone(),
            access_token: token,
        };
        let session = tokio::time::timeout(
            CONNECT_TIMEOUT,
            client.authenticate("XOAUTH2", authenticator),
        )
        .await
        .map_err(|_| Error::Connection("XOAUTH2 authenticate timed out".into()))?
        .map_err(|(e, _)| Error::Auth(format!("XOAUTH2 authenticate failed: {e}")))?;
        Ok(session)
    }

    pub async fn list_folders(&mut self) -> Result<Vec<FolderInfo>> {
        let session = self.session()?;
        let stream = deadline(session.list(None, Some("*"))).await?;
        let names: Vec<Name> = tokio::time::timeout(OP_TIMEOUT, stream.try_collect())
            .await
            .map_err(|_| Error::Connection("LIST timed out".into()))?
            .map_err(Error::from)?;

        Ok(names
            .iter()
            .map(|name| FolderInfo {
                name: name.name().to_string(),
                flags: name.attributes().iter().map(attribute_str).collect(),
                delimiter: name.delimiter().unwrap_or("/").to_string(),
                message_count: None,
                unread_count: None,
            })
            .collect())
    }

    /// Message count and unread count for a folder.
    pub async fn folder_status(&mut self, folder: &str) -> Result<(u32, u32)> {
        let session = self.session()?;
        let mailbox = deadline(session.examine(folder)).await?;
        let count = mailbox.exists;
        let unread = deadline(session.uid_search("UNSEEN")).await?.len() as u32;
        Ok((count, unread))
    }

    /// Unread counts per selectable folder.
    pub async fn unread_counts(&mut self) -> Result<UnreadCounts> {
        let folders = self.list_folders().await?;
        let mut counts = UnreadCounts {
            account: self.account.clone(),
            folders: Default::default(),
            total: 0,
        };

        for folder in folders {
            if folder.flags.iter().any(|f| f == "\\Noselect") {
                continue;
            }
            match self.folder_status(&folder.name).await {
                Ok((_, unread)) if unread > 0 => {
                    counts.total += unread;
                    counts.folders.insert(folder.name, unread);
                }
                Ok(_) => {}
                Err(e) => {
                    // Some folders are advertised but not accessible.
                    debug!(folder = %folder.name, error = %e, "Skipping folder status");
                }
            }
        }
        Ok(counts)
    }

    /// Fetch the most recent messages in a folder.
    pub async fn fetch_messages(
        &mut self,
        folder: &str,
        limit: usize,
        since: Option<DateTime<Utc>>,
        unread_only: bool,
        fetch_bodies: bool,
    ) -> Result<Vec<Message>> {
        let account = self.account.clone();
        let session = self.session()?;
        deadline(session.examine(folder)).await?;

        let mut criteria: Vec<String> = Vec::new();
        if let Some(since) = since {
            criteria.push(format!("SINCE {}", since.format("%d-%b-%Y")));
        }
        if unread_only {
            criteria.push("UNSEEN".to_string());
        }
        if criteria.is_empty() {
            criteria.push("ALL".to_string());
        }
        let criteria = criteria.join(" ");

        let mut uids: Vec<u32> = deadline(session.uid_search(&criteria))
            .await?
            .into_iter()
            .collect();
        uids.sort_unstable_by(|a, b| b.cmp(a));
        uids.truncate(limit);
        if uids.is_empty() {
            return Ok(Vec::new());
        }

        let uid_seq = uids
            .iter()
            .map(|u| u.to_string())
            .collect::<Vec<_>>()
            .join(",");
        let items = if fetch_bodies {
            BODY_FETCH_ITEMS
        } else {
            HEADER_FETCH_ITEMS
        };

        let mut raw_fetches: Vec<RawFetch> = Vec::new();
        {
            let mut stream = deadline(session.uid_fetch(&uid_seq, items)).await?;
            loop {
                let next = tokio::time::timeout(OP_TIMEOUT, stream.try_next())
                    .await
                    .map_err(|_| Error::Connection("FETCH stream timed out".into()))?
                    .map_err(Error::from)?;
                let Some(fetch) = next else { break };

                let Some(uid) = fetch.uid else { continue };
                let Some(raw) = fetch.header().or_else(|| fetch.body()) else {
                    warn!(account = %account, folder, uid, "FETCH item without content; skipping");
                    continue;
                };
                raw_fetches.push(RawFetch {
                    uid,
                    raw: raw.to_vec(),
                    flags: flags_to_model(&fetch),
                    internal_date: fetch.internal_date().map(|d| d.with_timezone(&Utc)),
                });
            }
        }

        // MIME parsing is CPU work; run the batch off the reactor and in
        // parallel. Messages that fail to parse are logged and skipped.
        let folder_owned = folder.to_string();
        let fetched_at = now_utc();
        let parsed: Vec<Result<Message>> = tokio::task::spawn_blocking(move || {
            use rayon::prelude::*;
            raw_fetches
                .into_par_iter()
                .map(|raw| {
                    parse_fetched(
                        &raw.raw,
                        &FetchContext {
                            account: account.clone(),
                            folder: folder_owned.clone(),
                            uid: raw.uid,
                            flags: raw.flags,
                            internal_date: raw.internal_date,
                            has_body: fetch_bodies,
                            fetched_at,
                        },
                    )
                })
                .collect()
        })
        .await
        .map_err(|e| Error::Store(format!("parse task panicked: {e}")))?;

        let mut messages = Vec::new();
        for result in parsed {
            match result {
                Ok(msg) => messages.push(msg),
                Err(e) => warn!(error = %e, "Failed to parse fetched message; skipping"),
            }
        }
        Ok(messages)
    }

    /// Fetch just the body parts of one message.
    pub async fn fetch_message_body(
        &mut self,
        folder: &str,
        message_id: &str,
    ) -> Result<(Option<String>, Option<String>)> {
        let raw = self.fetch_raw(folder, message_id).await?;
        let parsed = mailparse::parse_mail(&raw)
            .map_err(|e| Error::Protocol(format!("parsing message: {e}")))?;
        Ok(mime::extract_bodies(&parsed))
    }

    /// Fetch the decoded bytes of a named attachment.
    pub async fn fetch_attachment(
        &mut self,
        folder: &str,
        message_id: &str,
        filename: &str,
    ) -> Result<Vec<u8>> {
        let raw = self.fetch_raw(folder, message_id).await?;
        let parsed = mailparse::parse_mail(&raw)
            .map_err(|e| Error::Protocol(format!("parsing message: {e}")))?;
        mime::find_attachment_bytes(&parsed, filename)
            .ok_or_else(|| Error::NotFound(format!("attachment not found: {filename}")))
    }

    async fn fetch_raw(&mut self, folder: &str, message_id: &str) -> Result<Vec<u8>> {
        let session = self.session()?;
        deadline(session.examine(folder)).await?;
        let uid = resolve_uid(session, message_id)
            .await?
            .ok_or_else(|| Error::NotFound(format!("message not found: {message_id}")))?;

        let fetches = collect_fetches(session, &uid.to_string(), "(UID BODY.PEEK[])").await?;
        let fetch = fetches
            .into_iter()
            .next()
            .ok_or_else(|| Error::NotFound(format!("message not found: {message_id}")))?;
        fetch
            .body()
            .map(|b| b.to_vec())
            .ok_or_else(|| Error::NotFound(format!("message body not found: {message_id}")))
    }

    pub async fn set_flags(
        &mut self,
        folder: &str,
        message_id: &str,
        flags: &[MessageFlag],
    ) -> Result<()> {
        self.store_flags(folder, message_id, flags, "FLAGS.SILENT").await
    }

    pub async fn add_flags(
        &mut self,
        folder: &str,
        message_id: &str,
        flags: &[MessageFlag],
    ) -> Result<()> {
        self.store_flags(folder, message_id, flags, "+FLAGS.SILENT").await
    }

    pub async fn remove_flags(
        &mut self,
        folder: &str,
        message_id: &str,
        flags: &[MessageFlag],
    ) -> Result<()> {
        self.store_flags(folder, message_id, flags, "-FLAGS.SILENT").await
    }

    async fn store_flags(
        &mut self,
        folder: &str,
        message_id: &str,
        flags: &[MessageFlag],
        verb: &str,
    ) -> Result<()> {
        let session = self.session()?;
        deadline(session.select(folder)).await?;
        let uid = resolve_uid(session, message_id)
            .await?
            .ok_or_else(|| Error::NotFound(format!("message not found: {message_id}")))?;

        let imap_flags = flags
            .iter()
            .map(|f| imap_flag_str(*f))
            .collect::<Vec<_>>()
            .join(" ");
        let query = format!("{verb} ({imap_flags})");
        collect_fetches(session, &uid.to_string(), &query).await?;
        Ok(())
    }

    /// Move a message: COPY to the destination, mark `\Deleted` on the
    /// source, then EXPUNGE.
    pub async fn move_message(
        &mut self,
        message_id: &str,
        from_folder: &str,
        to_folder: &str,
    ) -> Result<()> {
        let session = self.session()?;
        deadline(session.select(from_folder)).await?;
        let uid = resolve_uid(session, message_id)
            .await?
            .ok_or_else(|| Error::NotFound(format!("message not found: {message_id}")))?;

        deadline(session.uid_copy(uid.to_string(), to_folder)).await?;
        collect_fetches(session, &uid.to_string(), "+FLAGS.SILENT (\\Deleted)").await?;

        let stream = deadline(session.expunge()).await?;
        let _: Vec<u32> = tokio::time::timeout(OP_TIMEOUT, stream.try_collect())
            .await
            .map_err(|_| Error::Connection("EXPUNGE timed out".into()))?
            .map_err(Error::from)?;
        Ok(())
    }

    /// Move a message to the first archive folder the server has.
    pub async fn archive_message(&mut self, message_id: &str, from_folder: &str) -> Result<()> {
        let folders = self.list_folders().await?;
        let archive = ARCHIVE_FOLDERS
            .iter()
            .find(|candidate| folders.iter().any(|f| f.name == **candidate))
            .ok_or_else(|| Error::NotFound("could not find an archive folder".into()))?;
        self.move_message(message_id, from_folder, archive).await
    }
}

struct RawFetch {
    uid: u32,
    raw: Vec<u8>,
    flags: Vec<MessageFlag>,
    internal_date: Option<DateTime<Utc>>,
}

pub(crate) struct FetchContext {
    pub account: String,
    pub folder: String,
    pub uid: u32,
    pub flags: Vec<MessageFlag>,
    pub internal_date: Option<DateTime<Utc>>,
    pub has_body: bool,
    pub fetched_at: DateTime<Utc>,
}

/// Map one fetched wire message into the data model.
pub(crate) fn parse_fetched(raw: &[u8], ctx: &FetchContext) -> Result<Message> {
    use mailparse::MailHeaderMap;

    let parsed = mailparse::parse_mail(raw)
        .map_err(|e| Error::Protocol(format!("parsing MIME for uid {}: {e}", ctx.uid)))?;
    let headers = &parsed.headers;

    // A server envelope without a Message-ID gets a synthetic one keyed by
    // UID; later body fetches recognize the pattern and skip header search.
    let message_id = headers
        .get_first_value("Message-ID")
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
        .unwrap_or_else(|| format!("<{}@local>", ctx.uid));

    let in_reply_to = headers
        .get_first_value("In-Reply-To")
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty());
    let references = mime::parse_references(headers.get_first_value("References").as_deref());

    let from = mime::parse_address_list(headers.get_first_value("From").as_deref())
        .into_iter()
        .next()
        .unwrap_or_else(|| Address::bare("unknown@unknown"));
    let to = mime::parse_address_list(headers.get_first_value("To").as_deref());
    let cc = mime::parse_address_list(headers.get_first_value("Cc").as_deref());
    let reply_to = mime::parse_address_list(headers.get_first_value("Reply-To").as_deref());

    let subject = headers.get_first_value("Subject").unwrap_or_default();
    let date = mime::parse_date_header(
        headers.get_first_value("Date").as_deref(),
        ctx.internal_date.unwrap_or(ctx.fetched_at),
    );

    let (body_text, body_html, attachments) = if ctx.has_body {
        let (text, html) = mime::extract_bodies(&parsed);
        (text, html, mime::extract_attachments(&parsed))
    } else {
        (None, None, Vec::new())
    };

    let conv_id = threads::conv_id_for_message(&message_id, &references, in_reply_to.as_deref());

    Ok(Message {
        message_id,
        conv_id,
        account: ctx.account.clone(),
        folder: ctx.folder.clone(),
        from,
        to,
        cc,
        reply_to,
        date,
        subject,
        body_text,
        body_html,
        flags: ctx.flags.clone(),
        attachments,
        in_reply_to,
        references,
        headers_fetched_at: ctx.fetched_at,
        body_fetched_at: ctx.has_body.then_some(ctx.fetched_at),
    })
}

async fn tls_client(host: &str, port: u16) -> Result<Client<tokio_rustls::client::TlsStream<TcpStream>>> {
    let mut root_store = RootCertStore::empty();
    for cert in load_native_certs()
        .map_err(|e| Error::Connection(format!("loading native certs: {e}")))?
    {
        root_store
            .add(&Certificate(cert.0))
            .map_err(|e| Error::Connection(format!("adding root cert: {e}")))?;
    }

    let tls_config = ClientConfig::builder()
        .with_safe_defaults()
        .with_root_certificates(root_store)
        .with_no_client_auth();
    let connector = TlsConnector::from(Arc::new(tls_config));

    let tcp = tokio::time::timeout(CONNECT_TIMEOUT, TcpStream::connect((host, port)))
        .await
        .map_err(|_| Error::Connection(format!("connecting to {host}:{port} timed out")))?
        .map_err(|e| Error::Connection(format!("connecting to {host}:{port}: {e}")))?;

    let server_name = ServerName::try_from(host)
        .map_err(|_| Error::InvalidInput(format!("invalid IMAP host for TLS: {host}")))?;
    let tls_stream = tokio::time::timeout(CONNECT_TIMEOUT, connector.connect(server_name, tcp))
        .await
        .map_err(|_| Error::Connection("TLS handshake timed out".into()))?
        .map_err(|e| Error::Connection(format!("TLS handshake failed: {e}")))?;

    let mut client = Client::new(tls_stream);
    let greeting = tokio::time::timeout(CONNECT_TIMEOUT, client.read_response())
        .await
        .map_err(|_| Error::Connection("IMAP greeting timed out".into()))?
        .map_err(|e| Error::Connection(format!("reading IMAP greeting: {e}")))?;
    if greeting.is_none() {
        return Err(Error::Connection(
            "server closed connection before greeting".into(),
        ));
    }
    Ok(client)
}

/// Resolve a message id to a UID in the selected folder: synthetic
/// `<N@local>` ids map straight to the UID, everything else goes through a
/// header search.
async fn resolve_uid(session: &mut ImapSession, message_id: &str) -> Result<Option<u32>> {
    if let Some(caps) = SYNTHETIC_ID.captures(message_id) {
        let uid: u32 = caps[1]
            .parse()
            .map_err(|_| Error::InvalidInput(format!("bad synthetic id: {message_id}")))?;
        return Ok(Some(uid));
    }

    let query = format!("HEADER Message-ID \"{message_id}\"");
    let uids = deadline(session.uid_search(&query)).await?;
    Ok(uids.into_iter().max())
}

async fn collect_fetches(
    session: &mut ImapSession,
    uid_seq: &str,
    query: &str,
) -> Result<Vec<Fetch>> {
    let stream = deadline(session.uid_fetch(uid_seq, query)).await?;
    tokio::time::timeout(OP_TIMEOUT, stream.try_collect())
        .await
        .map_err(|_| Error::Connection("UID FETCH timed out".into()))?
        .map_err(Error::from)
}

fn flags_to_model(fetch: &Fetch) -> Vec<MessageFlag> {
    fetch
        .flags()
        .filter_map(|flag| match flag {
            Flag::Seen => Some(MessageFlag::Seen),
            Flag::Answered => Some(MessageFlag::Answered),
            Flag::Flagged => Some(MessageFlag::Flagged),
            Flag::Deleted => Some(MessageFlag::Deleted),
            Flag::Draft => Some(MessageFlag::Draft),
            _ => None,
        })
        .collect()
}

fn imap_flag_str(flag: MessageFlag) -> &'static str {
    match flag {
        MessageFlag::Seen => "\\Seen",
        MessageFlag::Answered => "\\Answered",
        MessageFlag::Flagged => "\\Flagged",
        MessageFlag::Deleted => "\\Deleted",
        MessageFlag::Draft => "\\Draft",
    }
}

fn attribute_str(attr: &NameAttribute) -> String {
    match attr {
        NameAttribute::NoInferiors => "\\Noinferiors".to_string(),
        NameAttribute::NoSelect => "\\Noselect".to_string(),
        NameAttribute::Marked => "\\Marked".to_string(),
        NameAttribute::Unmarked => "\\Unmarked".to_string(),
        NameAttribute::Extension(raw) => raw.to_string(),
        other => format!("{other:?}"),
    }
}

struct Xoauth2 {
    user: String,
    access_token: String,
}

impl Authenticator for Xoauth2 {
    type Response = String;

    fn process(&mut self, _challenge: &[u8]) -> String {
        format!(
            "user={}\x01auth=Bearer {}\x01\x01",
            self.user, self.access_token
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn context(uid: u32, has_body: bool) -> FetchContext {
        FetchContext {
            account: "test".into(),
            folder: "INBOX".into(),
            uid,
            flags: vec![MessageFlag::Seen],
            internal_date: None,
            has_body,
            fetched_at: now_utc(),
        }
    }

    const RAW: &[u8] = concat!(
        "From: Alice <alice@example.com>\r\n",
        "To: bob@example.com\r\n",
        "Subject: Quarterly review\r\n",
        "Date: Wed, 1 Jan 2025 10:00:00 +0000\r\n",
        "Message-ID: <m1@example.com>\r\n",
        "In-Reply-To: <m0@example.com>\r\n",
        "References: <root@example.com> <m0@example.com>\r\n",
        "\r\n",
        "Body here\r\n",
    )
    .as_bytes();

    #[test]
    fn parses_headers_into_model() {
        let msg = parse_fetched(RAW, &context(7, false)).unwrap();
        assert_eq!(msg.message_id, "<m1@example.com>");
        assert_eq!(msg.from.addr, "alice@example.com");
        assert_eq!(msg.subject, "Quarterly review");
        assert_eq!(msg.in_reply_to.as_deref(), Some("<m0@example.com>"));
        assert_eq!(msg.references.len(), 2);
        // conv id derives from the first reference.
        assert_eq!(msg.conv_id, threads::conv_id_for_root("<root@example.com>"));
        assert!(msg.body_text.is_none());
        assert!(msg.body_fetched_at.is_none());
    }

    #[test]
    fn body_fetch_sets_body_and_timestamp() {
        let msg = parse_fetched(RAW, &context(7, true)).unwrap();
        assert_eq!(msg.body_text.as_deref().map(str::trim), Some("Body here"));
        assert!(msg.body_fetched_at.is_some());
    }

    #[test]
    fn missing_message_id_becomes_synthetic() {
        let raw = b"From: x@example.com\r\nSubject: hi\r\n\r\nbody";
        let msg = parse_fetched(raw, &context(42, false)).unwrap();
        assert_eq!(msg.message_id, "<42@local>");
        assert!(SYNTHETIC_ID.is_match(&msg.message_id));
    }

    #[test]
    fn synthetic_id_pattern_extracts_uid() {
        let caps = SYNTHETIC_ID.captures("<123@local>").unwrap();
        assert_eq!(&caps[1], "123");
        assert!(SYNTHETIC_ID.captures("<abc@local>").is_none());
        assert!(SYNTHETIC_ID.captures("<123@example.com>").is_none());
    }
}
