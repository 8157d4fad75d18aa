//! Draft management.
//!
//! Drafts are local-only rows in the store; they acquire a Message-ID only
//! when sent. Replies are built from the cached conversation so the threading
//! headers chain correctly without a network round-trip.

use rand::RngCore;

use crate::errors::{Error, Result};
use crate::storage::Store;
use crate::types::{Address, Draft, now_utc};

pub fn generate_draft_id() -> String {
    let mut bytes = [0u8; 8];
    rand::thread_rng().fill_bytes(&mut bytes);
    format!("draft_{}", hex::encode(bytes))
}

/// Inputs for a new draft. Reply-related fields are filled by
/// [`DraftManager::create_reply`].
#[derive(Clone, Debug, Default)]
pub struct NewDraft {
    pub to: Vec<Address>,
    pub cc: Vec<Address>,
    pub bcc: Vec<Address>,
    pub subject: String,
    pub body_text: String,
    pub body_html: Option<String>,
    pub reply_to_conv_id: Option<String>,
    pub in_reply_to: Option<String>,
    pub references: Vec<String>,
}

#[derive(Clone)]
pub struct DraftManager {
    store: Store,
}

impl DraftManager {
    pub fn new(store: Store) -> Self {
        Self { store }
    }

    pub async fn create(&self, account: &str, new: NewDraft) -> Result<Draft> {
        let now = now_utc();
        let draft = Draft {
            draft_id: generate_draft_id(),
            account: account.to_string(),
            to: new.to,
            cc: new.cc,
            bcc: new.bcc,
            subject: new.subject,
            body_text: new.body_text,
            body_html: new.body_html,
            reply_to_conv_id: new.reply_to_conv_id,
            in_reply_to: new.in_reply_to,
            references: new.references,
            created_at: now,
            updated_at: now,
        };
        self.store.put_draft(&draft).await?;
        Ok(draft)
    }

    pub async fn get(&self, draft_id: &str) -> Result<Option<Draft>> {
        self.store.get_draft(draft_id).await
    }

    pub async fn list(&self, account: Option<&str>) -> Result<Vec<Draft>> {
        self.store.list_drafts(account).await
    }

    /// Persist changes to an existing draft, bumping `updated_at`.
    pub async fn update(&self, draft: &mut Draft) -> Result<()> {
        draft.updated_at = now_utc();
        self.store.put_draft(draft).await
    }

    /// Delete a draft. Returns whether it existed.
    pub async fn delete(&self, draft_id: &str) -> Result<bool> {
        self.store.delete_draft(draft_id).await
    }

    /// Build a reply to the latest message of a conversation.
    ///
    /// `my_address` is the sending account's FROM address; on reply-all it is
    /// excluded from the recipient expansion.
    pub async fn create_reply(
        &self,
        account: &str,
        my_address: &str,
        conv_id: &str,
        body_text: String,
        body_html: Option<String>,
        reply_all: bool,
    ) -> Result<Draft> {
        let conv = self
            .store
            .get_conversation(conv_id)
            .await?
            .ok_or_else(|| Error::NotFound(format!("conversation not found: {conv_id}")))?;
        let latest = conv
            .messages
            .last()
            .ok_or_else(|| Error::NotFound(format!("conversation has no messages: {conv_id}")))?;

        let to = vec![latest.from.clone()];
        let mut cc: Vec<Address> = Vec::new();
        if reply_all {
            for addr in latest.to.iter().chain(latest.cc.iter()) {
                if !addr.addr.eq_ignore_ascii_case(my_address) && !to.contains(addr) {
                    cc.push(addr.clone());
                }
            }
        }

        let subject = if latest.subject.to_lowercase().starts_with("re:") {
            latest.subject.clone()
        } else {
            format!("Re: {}", latest.subject)
        };

        let mut references = latest.references.clone();
        if !references.contains(&latest.message_id) {
            references.push(latest.message_id.clone());
        }

        self.create(
            account,
            NewDraft {
                to,
                cc,
                bcc: Vec::new(),
                subject,
                body_text,
                body_html,
                reply_to_conv_id: Some(conv.conv_id.clone()),
                in_reply_to: Some(latest.message_id.clone()),
                references,
            },
        )
        .await
    }
}
