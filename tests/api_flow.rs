use std::sync::Arc;

use chrono::{TimeZone, Utc};

use clerk::api::Api;
use clerk::config::secrets::MemoryStore;
use clerk::config::Config;
use clerk::storage::Store;
use clerk::threads;
use clerk::types::{Address, Attachment, Message, now_utc};

const CONFIG: &str = r#"
default_account: test
accounts:
  test:
    protocol: imap
    imap: { host: mail.example.com, username: tester }
    smtp: { host: mail.example.com, username: tester }
    from: { address: me@example.com, name: Tester }
send:
  rate_limit: 3
  blocked_recipients: [spam@example.com]
"#;

async fn api() -> Api {
    let config = Config::parse(CONFIG).unwrap();
    let store = Store::open_in_memory().await.unwrap();
    Api::with_secret_store(config, store, Arc::new(MemoryStore::default()))
}

fn message(id: &str, from: &str, day: u32, references: &[&str]) -> Message {
    let references: Vec<String> = references.iter().map(|r| r.to_string()).collect();
    Message {
        message_id: id.to_string(),
        conv_id: threads::conv_id_for_message(id, &references, None),
        account: "test".into(),
        folder: "INBOX".into(),
        from: Address::bare(format!("{from}@example.com")),
        to: vec![Address::bare("me@example.com")],
        cc: vec![],
        reply_to: vec![],
        date: Utc.with_ymd_and_hms(2025, 1, day, 10, 0, 0).unwrap(),
        subject: format!("Message from {from}"),
        body_text: Some("cached body".into()),
        body_html: None,
        flags: vec![],
        attachments: vec![],
        in_reply_to: references.last().cloned(),
        references,
        headers_fetched_at: now_utc(),
        body_fetched_at: Some(now_utc()),
    }
}

#[tokio::test]
async fn fresh_inbox_lists_threaded_conversations_from_cache() {
    let api = api().await;

    // Three messages, two conversations: M2 replies to M1, M3 stands alone.
    api.store().put_message(&message("<m1@x>", "alice", 1, &[])).await.unwrap();
    api.store()
        .put_message(&message("<m2@x>", "bob", 2, &["<m1@x>"]))
        .await
        .unwrap();
    api.store().put_message(&message("<m3@x>", "carol", 3, &[])).await.unwrap();
    api.store().mark_inbox_synced("test").await.unwrap();

    let inbox = api.list_inbox(None, "INBOX", 20, false, false).await.unwrap();
    assert!(inbox.from_cache);
    assert_eq!(inbox.count, 2);
    assert_eq!(inbox.conversations[0].conv_id, threads::conv_id_for_root("<m3@x>"));
    assert_eq!(inbox.conversations[1].conv_id, threads::conv_id_for_root("<m1@x>"));
    assert_eq!(inbox.conversations[1].message_count, 2);
}

#[tokio::test]
async fn unread_only_inbox_filters_read_threads() {
    let api = api().await;

    let mut read = message("<r1@x>", "alice", 1, &[]);
    read.flags = vec![clerk::types::MessageFlag::Seen];
    api.store().put_message(&read).await.unwrap();
    api.store().put_message(&message("<u1@x>", "bob", 2, &[])).await.unwrap();
    api.store().mark_inbox_synced("test").await.unwrap();

    let inbox = api.list_inbox(None, "INBOX", 20, true, false).await.unwrap();
    assert_eq!(inbox.count, 1);
    assert_eq!(inbox.conversations[0].conv_id, threads::conv_id_for_root("<u1@x>"));
}

#[tokio::test]
async fn resolve_disambiguates_prefixes() {
    let api = api().await;

    let mut a = message("<a@x>", "alice", 1, &[]);
    a.conv_id = "abc123def456".into();
    let mut b = message("<b@x>", "bob", 2, &[]);
    b.conv_id = "abc789ghi000".into();
    api.store().put_message(&a).await.unwrap();
    api.store().put_message(&b).await.unwrap();

    // Ambiguous prefix: candidates ordered newest first.
    let lookup = api.resolve_conversation_id("abc", false).await.unwrap();
    assert!(lookup.conversation.is_none());
    let matches = lookup.matches.unwrap();
    assert_eq!(matches.len(), 2);
    assert_eq!(matches[0].conv_id, "abc789ghi000");
    assert_eq!(matches[1].conv_id, "abc123def456");

    // Unique prefix: the full conversation.
    let lookup = api.resolve_conversation_id("abc1", false).await.unwrap();
    let conv = lookup.conversation.unwrap();
    assert_eq!(conv.conv_id, "abc123def456");

    // No match: an error message.
    let lookup = api.resolve_conversation_id("zzz", false).await.unwrap();
    assert!(lookup.conversation.is_none());
    assert!(lookup.matches.is_none());
    assert!(lookup.error.unwrap().contains("zzz"));
}

#[tokio::test]
async fn advanced_search_combines_sender_attachment_and_date() {
    let api = api().await;

    for day in 1..=10u32 {
        let from = if day % 2 == 0 { "alice" } else { "bob" };
        let mut msg = message(&format!("<s{day}@x>"), from, day, &[]);
        // Half of alice's mail carries an attachment.
        if day % 4 == 0 {
            msg.attachments = vec![Attachment {
                filename: "doc.pdf".into(),
                size: 10,
                content_type: "application/pdf".into(),
            }];
        }
        // Push two messages before the date bound.
        if day <= 2 {
            msg.date = Utc.with_ymd_and_hms(2024, 12, day, 10, 0, 0).unwrap();
        }
        api.store().put_message(&msg).await.unwrap();
    }

    let result = api
        .search_advanced("from:alice has:attachment after:2025-01-01", None, None, 50)
        .await
        .unwrap();

    assert!(!result.messages.is_empty());
    for msg in &result.messages {
        assert!(msg.from.addr.contains("alice"));
        assert!(!msg.attachments.is_empty());
        assert!(msg.date >= Utc.with_ymd_and_hms(2025, 1, 1, 0, 0, 0).unwrap());
    }
    // Days 4 and 8 are alice's attachment-bearing messages in range.
    assert_eq!(result.messages.len(), 2);
}

#[tokio::test]
async fn phrase_search_goes_through_the_facade() {
    let api = api().await;
    let mut msg = message("<p@x>", "alice", 3, &[]);
    msg.subject = "Quarterly review".into();
    api.store().put_message(&msg).await.unwrap();

    let hits = api.search("quarterly", None, 10).await.unwrap();
    assert_eq!(hits.count, 1);
    let misses = api.search("nonexistent-token-xyz", None, 10).await.unwrap();
    assert_eq!(misses.count, 0);
}

#[tokio::test]
async fn list_attachments_reads_cached_metadata() {
    let api = api().await;
    let mut msg = message("<att@x>", "alice", 3, &[]);
    msg.attachments = vec![Attachment {
        filename: "numbers.xlsx".into(),
        size: 2048,
        content_type: "application/vnd.ms-excel".into(),
    }];
    api.store().put_message(&msg).await.unwrap();

    let attachments = api.list_attachments("<att@x>").await.unwrap();
    assert_eq!(attachments.len(), 1);
    assert_eq!(attachments[0].filename, "numbers.xlsx");

    assert!(api.list_attachments("<missing@x>").await.is_err());
}

#[tokio::test]
async fn full_rethreading_merges_partial_reference_chains() {
    let api = api().await;

    // M2 knows the whole chain (<m1@x> then <mx@x>); M3 only saw <mx@x>, so
    // its ingest-time conversation id differs. The full pass merges them.
    let m1 = message("<m1@x>", "alice", 1, &[]);
    let m2 = message("<m2@x>", "bob", 2, &["<m1@x>", "<mx@x>"]);
    let m3 = message("<m3@x>", "carol", 3, &["<mx@x>"]);
    assert_ne!(m2.conv_id, m3.conv_id);

    api.store().put_message(&m1).await.unwrap();
    api.store().put_message(&m2).await.unwrap();
    api.store().put_message(&m3).await.unwrap();

    let conversations = api.thread_conversations(None, "INBOX", 100).await.unwrap();
    assert_eq!(conversations.len(), 1);
    let conv = &conversations[0];
    assert_eq!(conv.message_count, 3);
    assert_eq!(conv.conv_id, threads::conv_id_for_root("<m1@x>"));
}

#[tokio::test]
async fn clear_cache_resets_listings() {
    let api = api().await;
    api.store().put_message(&message("<c@x>", "alice", 1, &[])).await.unwrap();
    api.store().mark_inbox_synced("test").await.unwrap();

    api.clear_cache().await.unwrap();
    let stats = api.get_cache_stats().await.unwrap();
    assert_eq!(stats.message_count, 0);
}
