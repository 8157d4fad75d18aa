//! Outbound mail: safety gates, confirmation tokens, MIME assembly and SMTP
//! dispatch.
//!
//! Every send passes the layered gate in order: rate limit, recipient
//! blocklist, account match, configuration sanity. Agent callers that cannot
//! prompt interactively use the two-step confirmation flow: a preview plus a
//! one-time token first, then the actual send with the token attached.

use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;
use std::time::{Duration, Instant};

use lettre::message::{Mailbox, MultiPart};
use lettre::transport::smtp::authentication::{Credentials, Mechanism};
use lettre::transport::smtp::client::{Tls, TlsParameters};
use lettre::{AsyncSmtpTransport, AsyncTransport, Tokio1Executor};
use rand::RngCore;
use tracing::info;

use crate::config::secrets::{account_password, SecretStore};
use crate::config::{AccountConfig, Config, Protocol};
use crate::errors::{Error, Result};
use crate::oauth;
use crate::types::{Draft, now_utc};

pub const CONFIRMATION_TOKEN_TTL: Duration = Duration::from_secs(300);

const RATE_WINDOW: Duration = Duration::from_secs(3600);

/// Sliding one-hour window counter for one account.
struct RateLimiter {
    max_per_hour: u32,
    sends: VecDeque<Instant>,
}

impl RateLimiter {
    fn new(max_per_hour: u32) -> Self {
        Self {
            max_per_hour,
            sends: VecDeque::new(),
        }
    }

    fn prune(&mut self, now: Instant) {
        while let Some(&front) = self.sends.front() {
            if now.duration_since(front) >= RATE_WINDOW {
                self.sends.pop_front();
            } else {
                break;
            }
        }
    }

    fn can_send_at(&mut self, now: Instant) -> bool {
        self.prune(now);
        (self.sends.len() as u32) < self.max_per_hour
    }

    fn record_at(&mut self, now: Instant) {
        self.sends.push_back(now);
    }

    fn remaining_at(&mut self, now: Instant) -> u32 {
        self.prune(now);
        self.max_per_hour.saturating_sub(self.sends.len() as u32)
    }
}

/// Per-account rate limiters. State is in-memory; resetting on restart is
/// acceptable.
pub struct RateLimiters {
    max_per_hour: u32,
    by_account: Mutex<HashMap<String, RateLimiter>>,
}

impl RateLimiters {
    pub fn new(max_per_hour: u32) -> Self {
        Self {
            max_per_hour,
            by_account: Mutex::new(HashMap::new()),
        }
    }

    pub fn can_send(&self, account: &str) -> bool {
        self.can_send_at(account, Instant::now())
    }

    pub fn can_send_at(&self, account: &str, now: Instant) -> bool {
        let mut map = self.by_account.lock().unwrap();
        map.entry(account.to_string())
            .or_insert_with(|| RateLimiter::new(self.max_per_hour))
            .can_send_at(now)
    }

    pub fn record_send(&self, account: &str) {
        self.record_send_at(account, Instant::now());
    }

    pub fn record_send_at(&self, account: &str, now: Instant) {
        let mut map = self.by_account.lock().unwrap();
        map.entry(account.to_string())
            .or_insert_with(|| RateLimiter::new(self.max_per_hour))
            .record_at(now);
    }

    pub fn remaining(&self, account: &str) -> u32 {
        let mut map = self.by_account.lock().unwrap();
        map.entry(account.to_string())
            .or_insert_with(|| RateLimiter::new(self.max_per_hour))
            .remaining_at(Instant::now())
    }
}

struct TokenEntry {
    token: String,
    expires_at: Instant,
}

/// One-time confirmation tokens keyed by draft id. Entries expire after five
/// minutes and are purged lazily on each access; losing the table on restart
/// only forces a sender to request a new token.
#[derive(Default)]
pub struct ConfirmationTokens {
    entries: Mutex<HashMap<String, TokenEntry>>,
}

impl ConfirmationTokens {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn issue(&self, draft_id: &str) -> String {
        self.issue_at(draft_id, Instant::now())
    }

    pub fn issue_at(&self, draft_id: &str, now: Instant) -> String {
        let mut bytes = [0u8; 16];
        rand::thread_rng().fill_bytes(&mut bytes);
        let token = hex::encode(bytes);

        let mut entries = self.entries.lock().unwrap();
        purge_expired(&mut entries, now);
        entries.insert(
            draft_id.to_string(),
            TokenEntry {
                token: token.clone(),
                expires_at: now + CONFIRMATION_TOKEN_TTL,
            },
        );
        token
    }

    /// Validate and consume a token. Consumption happens on success only.
    pub fn validate(&self, draft_id: &str, token: &str) -> Result<()> {
        self.validate_at(draft_id, token, Instant::now())
    }

    pub fn validate_at(&self, draft_id: &str, token: &str, now: Instant) -> Result<()> {
        let mut entries = self.entries.lock().unwrap();
        purge_expired(&mut entries, now);

        let entry = entries.get(draft_id).ok_or_else(|| {
            Error::SendBlocked("token consumed or expired; request a new confirmation".into())
        })?;
        if now >= entry.expires_at {
            entries.remove(draft_id);
            return Err(Error::SendBlocked(
                "token consumed or expired; request a new confirmation".into(),
            ));
        }
        if !constant_time_eq(&entry.token, token) {
            return Err(Error::SendBlocked("invalid confirmation token".into()));
        }

        entries.remove(draft_id);
        Ok(())
    }
}

fn purge_expired(entries: &mut HashMap<String, TokenEntry>, now: Instant) {
    entries.retain(|_, entry| now < entry.expires_at);
}

fn constant_time_eq(a: &str, b: &str) -> bool {
    if a.len() != b.len() {
        return false;
    }
    a.bytes()
        .zip(b.bytes())
        .fold(0u8, |acc, (x, y)| acc | (x ^ y))
        == 0
}

/// Apply the layered send gate, in order: rate limit, blocklist, account
/// match, configuration sanity.
pub fn check_send_allowed(
    draft: &Draft,
    account_name: &str,
    account: &AccountConfig,
    config: &Config,
    limiters: &RateLimiters,
) -> Result<()> {
    if !limiters.can_send(account_name) {
        return Err(Error::SendBlocked(format!(
            "rate limit exceeded; {} sends remaining this hour",
            limiters.remaining(account_name)
        )));
    }

    let blocked: Vec<String> = config
        .send
        .blocked_recipients
        .iter()
        .map(|a| a.to_lowercase())
        .collect();
    for addr in draft.to.iter().chain(&draft.cc).chain(&draft.bcc) {
        if blocked.contains(&addr.addr.to_lowercase()) {
            return Err(Error::SendBlocked(format!(
                "recipient {} is blocked",
                addr.addr
            )));
        }
    }

    if draft.account != account_name {
        return Err(Error::SendBlocked(format!(
            "draft account '{}' does not match '{account_name}'",
            draft.account
        )));
    }

    match account.protocol {
        Protocol::Imap => {
            if account.smtp.is_none() {
                return Err(Error::SendBlocked(format!(
                    "account '{account_name}' has no smtp configuration"
                )));
            }
        }
        Protocol::Gmail => {
            if account.oauth.is_none() {
                return Err(Error::SendBlocked(format!(
                    "account '{account_name}' has no oauth configuration"
                )));
            }
        }
    }

    Ok(())
}

/// Human-readable preview shown before a confirmed send.
pub fn format_draft_preview(draft: &Draft) -> String {
    let mut lines = Vec::new();
    lines.push(format!("From: {}", draft.account));
    lines.push(format!(
        "To: {}",
        draft.to.iter().map(ToString::to_string).collect::<Vec<_>>().join(", ")
    ));
    if !draft.cc.is_empty() {
        lines.push(format!(
            "Cc: {}",
            draft.cc.iter().map(ToString::to_string).collect::<Vec<_>>().join(", ")
        ));
    }
    if !draft.bcc.is_empty() {
        lines.push(format!(
            "Bcc: {}",
            draft.bcc.iter().map(ToString::to_string).collect::<Vec<_>>().join(", ")
        ));
    }
    lines.push(format!("Subject: {}", draft.subject));
    lines.push(String::new());
    lines.push(draft.body_text.clone());
    lines.join("\n")
}

/// Outgoing Message-ID with the domain taken from the sender address.
pub fn generate_message_id(from_address: &str) -> String {
    let domain = from_address.split('@').nth(1).unwrap_or("localhost");
    let mut bytes = [0u8; 8];
    rand::thread_rng().fill_bytes(&mut bytes);
    format!("<{}.{}@{}>", now_utc().timestamp(), hex::encode(bytes), domain)
}

fn to_mailbox(addr: &crate::types::Address) -> Result<Mailbox> {
    let parsed = addr
        .addr
        .parse()
        .map_err(|e| Error::InvalidInput(format!("invalid address '{}': {e}", addr.addr)))?;
    let name = (!addr.name.is_empty()).then(|| addr.name.clone());
    Ok(Mailbox::new(name, parsed))
}

/// Assemble the RFC 5322 message for a draft: required headers, threading
/// headers, plain part plus optional HTML alternative.
pub fn build_mime(
    draft: &Draft,
    from: &crate::config::FromAddress,
    message_id: &str,
) -> Result<lettre::Message> {
    let from_mailbox = Mailbox::new(
        (!from.name.is_empty()).then(|| from.name.clone()),
        from.address
            .parse()
            .map_err(|e| Error::InvalidInput(format!("invalid from address: {e}")))?,
    );

    let mut builder = lettre::Message::builder()
        .from(from_mailbox)
        .subject(draft.subject.clone())
        .date_now()
        .message_id(Some(message_id.to_string()));

    for addr in &draft.to {
        builder = builder.to(to_mailbox(addr)?);
    }
    for addr in &draft.cc {
        builder = builder.cc(to_mailbox(addr)?);
    }
    for addr in &draft.bcc {
        builder = builder.bcc(to_mailbox(addr)?);
    }

    if let Some(in_reply_to) = &draft.in_reply_to {
        builder = builder.in_reply_to(in_reply_to.clone());
    }
    if !draft.references.is_empty() {
        builder = builder.references(draft.references.join(" "));
    }

    let message = match &draft.body_html {
        Some(html) => builder
            .multipart(MultiPart::alternative_plain_html(
                draft.body_text.clone(),
                html.clone(),
            ))
            .map_err(|e| Error::InvalidInput(format!("building message: {e}")))?,
        None => builder
            .body(draft.body_text.clone())
            .map_err(|e| Error::InvalidInput(format!("building message: {e}")))?,
    };
    Ok(message)
}

/// SMTP dispatch for one account. Transports are built per send; nothing is
/// kept open between operations.
pub struct SmtpSender<'a> {
    account: &'a str,
    config: &'a AccountConfig,
}

impl<'a> SmtpSender<'a> {
    pub fn new(account: &'a str, config: &'a AccountConfig) -> Self {
        Self { account, config }
    }

    pub async fn send(&self, message: lettre::Message, secrets: &dyn SecretStore) -> Result<()> {
        match self.config.protocol {
            Protocol::Imap => self.send_password(message, secrets).await,
            Protocol::Gmail => self.send_gmail(message).await,
        }
    }

    async fn send_password(
        &self,
        message: lettre::Message,
        secrets: &dyn SecretStore,
    ) -> Result<()> {
        let smtp = self
            .config
            .smtp
            .as_ref()
            .ok_or_else(|| Error::InvalidInput("smtp not configured".into()))?;
        let password = account_password(self.account, self.config, secrets).await?;

        let tls = TlsParameters::new(smtp.host.clone()).map_err(map_smtp_error)?;
        let tls = if smtp.starttls {
            Tls::Required(tls)
        } else if smtp.port == 465 {
            Tls::Wrapper(tls)
        } else {
            Tls::Opportunistic(tls)
        };

        let mailer = AsyncSmtpTransport::<Tokio1Executor>::builder_dangerous(&smtp.host)
            .port(smtp.port)
            .tls(tls)
            .credentials(Credentials::new(smtp.username.clone(), password))
            .build();

        mailer.send(message).await.map_err(map_smtp_error)?;
        info!(account = %self.account, host = %smtp.host, "Message dispatched via SMTP");
        Ok(())
    }

    async fn send_gmail(&self, message: lettre::Message) -> Result<()> {
        let oauth_config = self
            .config
            .oauth
            .as_ref()
            .ok_or_else(|| Error::InvalidInput("oauth not configured".into()))?;
        let token = oauth::access_token(self.account, &oauth_config.client_id_file).await?;

        let tls =
            TlsParameters::new("smtp.gmail.com".to_string()).map_err(map_smtp_error)?;
        let mailer = AsyncSmtpTransport::<Tokio1Executor>::builder_dangerous("smtp.gmail.com")
            .port(587)
            .tls(Tls::Required(tls))
            .authentication(vec![Mechanism::Xoauth2])
            .credentials(Credentials::new(self.config.from.address.clone(), token))
            .build();

        mailer.send(message).await.map_err(map_smtp_error)?;
        info!(account = %self.account, "Message dispatched via Gmail SMTP");
        Ok(())
    }
}

fn map_smtp_error(e: lettre::transport::smtp::Error) -> Error {
    let message = e.to_string();
    let lower = message.to_lowercase();
    if lower.contains("auth") || lower.contains("credentials") {
        Error::Auth(message)
    } else if e.is_permanent() || e.is_transient() {
        Error::Protocol(message)
    } else {
        Error::Connection(message)
    }
}
