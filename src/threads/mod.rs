//! Conversation threading.
//!
//! A simplified JWZ algorithm (https://www.jwz.org/doc/threading.html) groups
//! messages into conversations via their In-Reply-To/References chains. Nodes
//! live in an arena and link to each other by index, so malformed reference
//! graphs cannot produce dangling pointers; a message referencing itself is
//! simply not linked.

use std::collections::{BTreeSet, HashMap};

use once_cell::sync::Lazy;
use regex::Regex;
use sha2::{Digest, Sha256};

use crate::types::{Conversation, Message, MessageFlag};

static SUBJECT_PREFIX: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)^(?:(?:Re|Fwd|Fw):\s*)+(.*)$").unwrap());

/// Root message id for a thread: the earliest reference, the direct parent,
/// or the message itself.
pub fn compute_root_id<'a>(
    message_id: &'a str,
    references: &'a [String],
    in_reply_to: Option<&'a str>,
) -> &'a str {
    if let Some(first) = references.first() {
        first
    } else if let Some(parent) = in_reply_to {
        parent
    } else {
        message_id
    }
}

/// Stable conversation id: first 12 hex chars of SHA-256 of the root id.
pub fn conv_id_for_root(root_id: &str) -> String {
    let digest = Sha256::digest(root_id.as_bytes());
    hex::encode(digest)[..12].to_string()
}

/// Ingest-time conversation id for a single message, derived from its own
/// reference chain. Agrees with the full threading pass whenever the message
/// carries its thread's reference prefix.
pub fn conv_id_for_message(
    message_id: &str,
    references: &[String],
    in_reply_to: Option<&str>,
) -> String {
    conv_id_for_root(compute_root_id(message_id, references, in_reply_to))
}

/// Strip `Re:`/`Fwd:`/`Fw:` prefix chains from a subject.
pub fn normalize_subject(subject: &str) -> String {
    match SUBJECT_PREFIX.captures(subject) {
        Some(caps) => caps[1].trim().to_string(),
        None => subject.trim().to_string(),
    }
}

struct ThreadNode {
    message_id: String,
    message: Option<usize>,
    parent: Option<usize>,
    children: Vec<usize>,
}

struct Arena {
    nodes: Vec<ThreadNode>,
    by_id: HashMap<String, usize>,
}

impl Arena {
    fn new() -> Self {
        Self {
            nodes: Vec::new(),
            by_id: HashMap::new(),
        }
    }

    fn node_for(&mut self, message_id: &str) -> usize {
        if let Some(&idx) = self.by_id.get(message_id) {
            return idx;
        }
        let idx = self.nodes.len();
        self.nodes.push(ThreadNode {
            message_id: message_id.to_string(),
            message: None,
            parent: None,
            children: Vec::new(),
        });
        self.by_id.insert(message_id.to_string(), idx);
        idx
    }

    fn link(&mut self, parent: usize, child: usize) {
        if parent == child {
            // Self-parenting reference; drop the link.
            return;
        }
        if self.nodes[child].parent.is_some() {
            return;
        }
        self.nodes[child].parent = Some(parent);
        if !self.nodes[parent].children.contains(&child) {
            self.nodes[parent].children.push(child);
        }
    }

    fn collect_messages(&self, idx: usize, out: &mut Vec<usize>) {
        if let Some(mi) = self.nodes[idx].message {
            out.push(mi);
        }
        for &child in &self.nodes[idx].children {
            self.collect_messages(child, out);
        }
    }
}

/// Thread messages into conversations, ordered by latest activity descending.
pub fn thread_messages(messages: Vec<Message>) -> Vec<Conversation> {
    if messages.is_empty() {
        return Vec::new();
    }

    let mut arena = Arena::new();

    for (mi, msg) in messages.iter().enumerate() {
        let node = arena.node_for(&msg.message_id);
        arena.nodes[node].message = Some(mi);

        let mut refs: Vec<&str> = msg.references.iter().map(String::as_str).collect();
        if let Some(parent) = msg.in_reply_to.as_deref() {
            if !refs.contains(&parent) {
                refs.push(parent);
            }
        }

        let mut previous: Option<usize> = None;
        for ref_id in refs {
            let ref_node = arena.node_for(ref_id);
            if let Some(prev) = previous {
                arena.link(prev, ref_node);
            }
            previous = Some(ref_node);
        }

        if let Some(parent) = previous {
            arena.link(parent, node);
        }
    }

    // Root set: nodes with no parent, with single-child dummies promoted.
    let roots: Vec<usize> = (0..arena.nodes.len())
        .filter(|&idx| arena.nodes[idx].parent.is_none())
        .collect();
    let mut promoted: Vec<usize> = Vec::with_capacity(roots.len());
    for root in roots {
        let node = &arena.nodes[root];
        if node.message.is_none() && node.children.len() == 1 {
            let child = node.children[0];
            arena.nodes[child].parent = None;
            promoted.push(child);
        } else {
            promoted.push(root);
        }
    }

    let mut conversations = Vec::new();
    for root in promoted {
        let mut member_indices = Vec::new();
        arena.collect_messages(root, &mut member_indices);
        if member_indices.is_empty() {
            continue;
        }

        let mut members: Vec<&Message> = member_indices.iter().map(|&i| &messages[i]).collect();
        members.sort_by_key(|m| m.date);

        let mut participants: BTreeSet<String> = BTreeSet::new();
        let mut unread_count = 0;
        for msg in &members {
            participants.insert(msg.from.addr.clone());
            for addr in msg.to.iter().chain(msg.cc.iter()) {
                participants.insert(addr.addr.clone());
            }
            if !msg.flags.contains(&MessageFlag::Seen) {
                unread_count += 1;
            }
        }

        let subject = members
            .iter()
            .find(|m| !m.subject.is_empty())
            .map(|m| normalize_subject(&m.subject))
            .unwrap_or_else(|| "(no subject)".to_string());

        let latest_date = members.iter().map(|m| m.date).max().expect("non-empty thread");
        let conv_id = conv_id_for_root(&arena.nodes[root].message_id);
        let account = members[0].account.clone();

        conversations.push(Conversation {
            conv_id,
            subject,
            participants: participants.into_iter().collect(),
            message_count: members.len(),
            unread_count,
            latest_date,
            messages: members.into_iter().cloned().collect(),
            account,
        });
    }

    conversations.sort_by(|a, b| b.latest_date.cmp(&a.latest_date));
    conversations
}

/// Fallback grouping by normalized subject, for mailboxes with unreliable
/// threading headers. Only used when explicitly requested; never supersedes
/// header-based threading.
pub fn group_by_subject(messages: &[Message]) -> HashMap<String, Vec<&Message>> {
    let mut groups: HashMap<String, Vec<&Message>> = HashMap::new();
    for msg in messages {
        let key = if msg.subject.is_empty() {
            "(no subject)".to_string()
        } else {
            normalize_subject(&msg.subject)
        };
        groups.entry(key).or_default().push(msg);
    }
    groups
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::Address;
    use chrono::{TimeZone, Utc};

    fn message(id: &str, refs: &[&str], reply_to: Option<&str>, day: u32) -> Message {
        let references: Vec<String> = refs.iter().map(|r| r.to_string()).collect();
        Message {
            message_id: id.to_string(),
            conv_id: conv_id_for_message(id, &references, reply_to),
            account: "test".into(),
            folder: "INBOX".into(),
            from: Address::bare(format!("sender{day}@example.com")),
            to: vec![Address::bare("me@example.com")],
            cc: vec![],
            reply_to: vec![],
            date: Utc.with_ymd_and_hms(2025, 1, day, 10, 0, 0).unwrap(),
            subject: "Topic".into(),
            body_text: None,
            body_html: None,
            flags: vec![],
            attachments: vec![],
            in_reply_to: reply_to.map(|r| r.to_string()),
            references,
            headers_fetched_at: Utc::now(),
            body_fetched_at: None,
        }
    }

    #[test]
    fn subject_normalization_strips_prefix_chains() {
        assert_eq!(normalize_subject("Re: RE: Fwd: Hello"), "Hello");
        assert_eq!(normalize_subject("Fw: status"), "status");
        assert_eq!(normalize_subject("Plain"), "Plain");
        assert_eq!(normalize_subject("  padded  "), "padded");
    }

    #[test]
    fn conv_id_is_first_12_of_sha256() {
        let digest = Sha256::digest("<root@example.com>".as_bytes());
        let expected = &hex::encode(digest)[..12];
        assert_eq!(conv_id_for_root("<root@example.com>"), expected);
        assert_eq!(expected.len(), 12);
    }

    #[test]
    fn root_id_prefers_references_then_in_reply_to() {
        let refs = vec!["<a@x>".to_string(), "<b@x>".to_string()];
        assert_eq!(compute_root_id("<c@x>", &refs, Some("<b@x>")), "<a@x>");
        assert_eq!(compute_root_id("<c@x>", &[], Some("<b@x>")), "<b@x>");
        assert_eq!(compute_root_id("<c@x>", &[], None), "<c@x>");
    }

    #[test]
    fn thread_of_replies_yields_single_conversation() {
        let m1 = message("<m1@x>", &[], None, 1);
        let m2 = message("<m2@x>", &["<m1@x>"], Some("<m1@x>"), 2);
        let m3 = message("<m3@x>", &["<m1@x>", "<m2@x>"], Some("<m2@x>"), 3);

        let convs = thread_messages(vec![m2, m3, m1]);
        assert_eq!(convs.len(), 1);
        let conv = &convs[0];
        assert_eq!(conv.message_count, 3);
        assert_eq!(conv.conv_id, conv_id_for_root("<m1@x>"));
        // Messages come back date-ascending.
        let ids: Vec<&str> = conv.messages.iter().map(|m| m.message_id.as_str()).collect();
        assert_eq!(ids, vec!["<m1@x>", "<m2@x>", "<m3@x>"]);
    }

    #[test]
    fn ingest_and_threading_conv_ids_agree() {
        let m2 = message("<m2@x>", &["<m1@x>"], Some("<m1@x>"), 2);
        let ingest_id = m2.conv_id.clone();
        let convs = thread_messages(vec![m2]);
        assert_eq!(convs[0].conv_id, ingest_id);
    }

    #[test]
    fn missing_root_becomes_dummy_and_is_promoted() {
        // Only the reply is present; the referenced root was never fetched.
        let reply = message("<reply@x>", &["<lost@x>"], Some("<lost@x>"), 2);
        let convs = thread_messages(vec![reply]);
        assert_eq!(convs.len(), 1);
        assert_eq!(convs[0].message_count, 1);
        // After promotion the surviving reply is the root, so the id derives
        // from it rather than from the never-seen ancestor.
        assert_eq!(convs[0].conv_id, conv_id_for_root("<reply@x>"));
    }

    #[test]
    fn self_referencing_message_does_not_loop() {
        let looped = message("<loop@x>", &["<loop@x>"], Some("<loop@x>"), 1);
        let convs = thread_messages(vec![looped]);
        assert_eq!(convs.len(), 1);
        assert_eq!(convs[0].message_count, 1);
    }

    #[test]
    fn unrelated_messages_make_separate_conversations_latest_first() {
        let old = message("<old@x>", &[], None, 1);
        let new = message("<new@x>", &[], None, 5);
        let convs = thread_messages(vec![old, new]);
        assert_eq!(convs.len(), 2);
        assert_eq!(convs[0].conv_id, conv_id_for_root("<new@x>"));
        assert_eq!(convs[1].conv_id, conv_id_for_root("<old@x>"));
    }

    #[test]
    fn participants_are_sorted_and_unique() {
        let mut m1 = message("<m1@x>", &[], None, 1);
        m1.cc = vec![Address::bare("me@example.com"), Address::bare("zed@example.com")];
        let convs = thread_messages(vec![m1]);
        assert_eq!(
            convs[0].participants,
            vec!["me@example.com", "sender1@example.com", "zed@example.com"]
        );
    }

    #[test]
    fn unread_count_ignores_seen_messages() {
        let mut m1 = message("<m1@x>", &[], None, 1);
        m1.flags = vec![MessageFlag::Seen];
        let m2 = message("<m2@x>", &["<m1@x>"], Some("<m1@x>"), 2);
        let convs = thread_messages(vec![m1, m2]);
        assert_eq!(convs[0].unread_count, 1);
    }

    #[test]
    fn subject_grouping_fallback() {
        let mut a = message("<a@x>", &[], None, 1);
        a.subject = "Re: Budget".into();
        let mut b = message("<b@x>", &[], None, 2);
        b.subject = "Budget".into();
        let items = [a, b];
        let groups = group_by_subject(&items);
        assert_eq!(groups.len(), 1);
        assert_eq!(groups["Budget"].len(), 2);
    }
}
