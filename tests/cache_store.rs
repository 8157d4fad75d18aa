use chrono::{Duration, TimeZone, Utc};

use clerk::errors::Error;
use clerk::storage::Store;
use clerk::threads;
use clerk::types::{Address, Attachment, Draft, Message, MessageFlag, now_utc};

fn message(id: &str, subject: &str, day: u32) -> Message {
    Message {
        message_id: id.to_string(),
        conv_id: threads::conv_id_for_message(id, &[], None),
        account: "test".into(),
        folder: "INBOX".into(),
        from: Address::new(format!("sender{day}@example.com"), "Sender"),
        to: vec![Address::bare("me@example.com")],
        cc: vec![],
        reply_to: vec![],
        date: Utc.with_ymd_and_hms(2025, 1, day, 10, 0, 0).unwrap(),
        subject: subject.to_string(),
        body_text: Some(format!("body of {subject}")),
        body_html: None,
        flags: vec![],
        attachments: vec![],
        in_reply_to: None,
        references: vec![],
        headers_fetched_at: now_utc(),
        body_fetched_at: Some(now_utc()),
    }
}

#[tokio::test]
async fn message_round_trip_preserves_structure() {
    let store = Store::open_in_memory().await.unwrap();

    let mut msg = message("<rt@example.com>", "Round trip", 5);
    msg.cc = vec![Address::new("cc@example.com", "Cee")];
    msg.reply_to = vec![Address::bare("replies@example.com")];
    msg.flags = vec![MessageFlag::Seen, MessageFlag::Flagged];
    msg.attachments = vec![Attachment {
        filename: "a.pdf".into(),
        size: 1234,
        content_type: "application/pdf".into(),
    }];
    msg.in_reply_to = Some("<parent@example.com>".into());
    msg.references = vec!["<root@example.com>".into(), "<parent@example.com>".into()];

    store.put_message(&msg).await.unwrap();
    let got = store.get_message("<rt@example.com>").await.unwrap().unwrap();

    assert_eq!(got.message_id, msg.message_id);
    assert_eq!(got.conv_id, msg.conv_id);
    assert_eq!(got.from.addr, "sender5@example.com");
    assert_eq!(got.from.name, "Sender");
    assert_eq!(got.cc, msg.cc);
    assert_eq!(got.reply_to, msg.reply_to);
    assert_eq!(got.flags, msg.flags);
    assert!(got.is_read());
    assert!(got.is_flagged());
    assert_eq!(got.attachments, msg.attachments);
    assert_eq!(got.references, msg.references);
    assert_eq!(got.date, msg.date);
    assert_eq!(got.body_text, msg.body_text);
    assert_eq!(
        got.body_fetched_at.unwrap().timestamp(),
        msg.body_fetched_at.unwrap().timestamp()
    );
}

#[tokio::test]
async fn put_message_replaces_by_id() {
    let store = Store::open_in_memory().await.unwrap();
    let mut msg = message("<dup@example.com>", "First", 1);
    store.put_message(&msg).await.unwrap();
    msg.subject = "Second".into();
    store.put_message(&msg).await.unwrap();

    let got = store.get_message("<dup@example.com>").await.unwrap().unwrap();
    assert_eq!(got.subject, "Second");

    let stats = store.get_stats().await.unwrap();
    assert_eq!(stats.message_count, 1);
}

#[tokio::test]
async fn fts_finds_subject_terms_and_nothing_else() {
    let store = Store::open_in_memory().await.unwrap();
    store
        .put_message(&message("<q@example.com>", "Quarterly review", 3))
        .await
        .unwrap();

    let hits = store.search("quarterly", None, 20).await.unwrap();
    assert_eq!(hits.len(), 1);
    assert_eq!(hits[0].message_id, "<q@example.com>");

    let misses = store.search("nonexistent-token-xyz", None, 20).await.unwrap();
    assert!(misses.is_empty());
}

#[tokio::test]
async fn fts_index_follows_updates() {
    let store = Store::open_in_memory().await.unwrap();
    let mut msg = message("<u@example.com>", "Old words", 3);
    store.put_message(&msg).await.unwrap();

    msg.subject = "Fresh vocabulary".into();
    msg.body_text = Some("replacement body".into());
    store.put_message(&msg).await.unwrap();

    assert!(store.search("vocabulary", None, 20).await.unwrap().len() == 1);
    assert!(store.search("Old", None, 20).await.unwrap().is_empty());
}

#[tokio::test]
async fn prefix_lookup_unique_and_ambiguous() {
    let store = Store::open_in_memory().await.unwrap();

    let mut a = message("<a@example.com>", "Alpha", 1);
    a.conv_id = "abc123def456".into();
    let mut b = message("<b@example.com>", "Beta", 2);
    b.conv_id = "abc789ghi000".into();
    store.put_message(&a).await.unwrap();
    store.put_message(&b).await.unwrap();

    // Unique prefix resolves to the conversation.
    let conv = store.get_conversation("abc1").await.unwrap().unwrap();
    assert_eq!(conv.conv_id, "abc123def456");

    // Ambiguous prefix resolves to none; the finder lists both, newest first.
    assert!(store.get_conversation("abc").await.unwrap().is_none());
    let matches = store.find_conversations_by_prefix("abc").await.unwrap();
    assert_eq!(matches.len(), 2);
    assert_eq!(matches[0].conv_id, "abc789ghi000");
    assert_eq!(matches[1].conv_id, "abc123def456");

    // No match at all.
    assert!(store.get_conversation("zzz").await.unwrap().is_none());
    assert!(store
        .find_conversations_by_prefix("zzz")
        .await
        .unwrap()
        .is_empty());
}

#[tokio::test]
async fn unread_count_derives_from_seen_flag() {
    let store = Store::open_in_memory().await.unwrap();

    let mut m1 = message("<c1@example.com>", "Chat", 1);
    m1.conv_id = "conv00000001".into();
    m1.flags = vec![MessageFlag::Seen];
    let mut m2 = message("<c2@example.com>", "Chat", 2);
    m2.conv_id = "conv00000001".into();

    store.put_message(&m1).await.unwrap();
    store.put_message(&m2).await.unwrap();

    let conv = store.get_conversation("conv00000001").await.unwrap().unwrap();
    assert_eq!(conv.message_count, 2);
    assert_eq!(conv.unread_count, 1);
    assert!(conv.has_unread());

    let listing = store
        .list_conversations(Some("test"), "INBOX", false, 10)
        .await
        .unwrap();
    assert_eq!(listing[0].unread_count, 1);

    // unread_only hides fully read conversations.
    store
        .update_flags("<c2@example.com>", &[MessageFlag::Seen])
        .await
        .unwrap();
    let unread_only = store
        .list_conversations(Some("test"), "INBOX", true, 10)
        .await
        .unwrap();
    assert!(unread_only.is_empty());
}

#[tokio::test]
async fn snippet_comes_from_latest_message() {
    let store = Store::open_in_memory().await.unwrap();

    let mut m1 = message("<s1@example.com>", "Snip", 1);
    m1.conv_id = "convsnip0001".into();
    let mut m2 = message("<s2@example.com>", "Snip", 2);
    m2.conv_id = "convsnip0001".into();
    m2.body_text = Some("x".repeat(500));
    store.put_message(&m1).await.unwrap();
    store.put_message(&m2).await.unwrap();

    let listing = store
        .list_conversations(Some("test"), "INBOX", false, 10)
        .await
        .unwrap();
    assert_eq!(listing[0].snippet.chars().count(), 100);
}

#[tokio::test]
async fn update_flags_mirrors_into_reads() {
    let store = Store::open_in_memory().await.unwrap();
    store.put_message(&message("<f@example.com>", "Flags", 1)).await.unwrap();

    store
        .update_flags("<f@example.com>", &[MessageFlag::Seen])
        .await
        .unwrap();
    let got = store.get_message("<f@example.com>").await.unwrap().unwrap();
    assert!(got.flags.contains(&MessageFlag::Seen));
}

#[tokio::test]
async fn update_body_stamps_fetch_time() {
    let store = Store::open_in_memory().await.unwrap();
    let mut msg = message("<b@example.com>", "Bodies", 1);
    msg.body_text = None;
    msg.body_fetched_at = None;
    store.put_message(&msg).await.unwrap();

    assert!(!store.is_fresh("<b@example.com>", 60, true).await.unwrap());
    store
        .update_body("<b@example.com>", Some("text"), Some("<p>html</p>"))
        .await
        .unwrap();

    let got = store.get_message("<b@example.com>").await.unwrap().unwrap();
    assert_eq!(got.body_text.as_deref(), Some("text"));
    assert!(got.body_fetched_at.is_some());
    assert!(store.is_fresh("<b@example.com>", 60, true).await.unwrap());
}

#[tokio::test]
async fn delete_message_removes_the_row() {
    let store = Store::open_in_memory().await.unwrap();
    store.put_message(&message("<d@example.com>", "Doomed", 1)).await.unwrap();
    store.delete_message("<d@example.com>").await.unwrap();
    assert!(store.get_message("<d@example.com>").await.unwrap().is_none());
    assert!(store.search("Doomed", None, 10).await.unwrap().is_empty());
}

#[tokio::test]
async fn inbox_freshness_round_trip() {
    let store = Store::open_in_memory().await.unwrap();
    assert!(!store.is_inbox_fresh("test", 5).await.unwrap());
    store.mark_inbox_synced("test").await.unwrap();
    assert!(store.is_inbox_fresh("test", 5).await.unwrap());
}

#[tokio::test]
async fn prune_removes_only_rows_outside_window() {
    let store = Store::open_in_memory().await.unwrap();

    let mut old = message("<old@example.com>", "Old", 1);
    old.date = now_utc() - Duration::days(30);
    let mut recent = message("<new@example.com>", "New", 1);
    recent.date = now_utc() - Duration::days(2);
    store.put_message(&old).await.unwrap();
    store.put_message(&recent).await.unwrap();

    let removed = store.prune_old_messages(7).await.unwrap();
    assert_eq!(removed, 1);
    assert!(store.get_message("<old@example.com>").await.unwrap().is_none());
    assert!(store.get_message("<new@example.com>").await.unwrap().is_some());
}

#[tokio::test]
async fn clear_wipes_everything_but_the_send_log() {
    let store = Store::open_in_memory().await.unwrap();

    store.put_message(&message("<m@example.com>", "Hi", 1)).await.unwrap();
    store.mark_inbox_synced("test").await.unwrap();
    let draft = Draft {
        draft_id: "draft_00ff00ff00ff00ff".into(),
        account: "test".into(),
        to: vec![Address::bare("bob@example.com")],
        cc: vec![],
        bcc: vec![],
        subject: "Draft".into(),
        body_text: "text".into(),
        body_html: None,
        reply_to_conv_id: None,
        in_reply_to: None,
        references: vec![],
        created_at: now_utc(),
        updated_at: now_utc(),
    };
    store.put_draft(&draft).await.unwrap();
    store
        .log_send(
            "test",
            &[Address::bare("bob@example.com")],
            &[],
            &[],
            "Sent subject",
            Some("<out@example.com>"),
        )
        .await
        .unwrap();

    store.clear().await.unwrap();

    let stats = store.get_stats().await.unwrap();
    assert_eq!(stats.message_count, 0);
    assert!(store.list_drafts(None).await.unwrap().is_empty());
    assert!(!store.is_inbox_fresh("test", 5).await.unwrap());

    let log = store.list_send_log(10).await.unwrap();
    assert_eq!(log.len(), 1);
    assert_eq!(log[0].subject, "Sent subject");
    assert_eq!(log[0].message_id.as_deref(), Some("<out@example.com>"));
}

#[tokio::test]
async fn raw_query_rejects_writes_and_bounds_reads() {
    let store = Store::open_in_memory().await.unwrap();
    store.put_message(&message("<r@example.com>", "Raw", 1)).await.unwrap();

    for bad in [
        "DELETE FROM messages",
        "DROP TABLE messages",
        "SELECT * FROM messages; DELETE FROM messages",
        "UPDATE messages SET subject = 'x'",
    ] {
        let err = store.execute_raw_query(bad, &[], 10).await.unwrap_err();
        assert!(matches!(err, Error::InvalidInput(_)), "query: {bad}");
    }

    let rows = store
        .execute_raw_query("SELECT * FROM messages WHERE subject = ?1", &["Raw".into()], 10)
        .await
        .unwrap();
    assert_eq!(rows.len(), 1);

    // A LIMIT is appended when absent.
    let rows = store
        .execute_raw_query("SELECT * FROM messages", &[], 1)
        .await
        .unwrap();
    assert_eq!(rows.len(), 1);
}

#[tokio::test]
async fn draft_crud_round_trip() {
    let store = Store::open_in_memory().await.unwrap();

    let mut draft = Draft {
        draft_id: "draft_1122334455667788".into(),
        account: "test".into(),
        to: vec![Address::new("bob@example.com", "Bob")],
        cc: vec![Address::bare("cc@example.com")],
        bcc: vec![],
        subject: "Plans".into(),
        body_text: "Some text".into(),
        body_html: Some("<p>Some text</p>".into()),
        reply_to_conv_id: Some("abc123def456".into()),
        in_reply_to: Some("<m@example.com>".into()),
        references: vec!["<root@example.com>".into()],
        created_at: now_utc(),
        updated_at: now_utc(),
    };
    store.put_draft(&draft).await.unwrap();

    let got = store.get_draft(&draft.draft_id).await.unwrap().unwrap();
    assert_eq!(got.to, draft.to);
    assert_eq!(got.references, draft.references);
    assert_eq!(got.body_html, draft.body_html);

    draft.subject = "Updated plans".into();
    store.put_draft(&draft).await.unwrap();
    assert_eq!(store.list_drafts(Some("test")).await.unwrap().len(), 1);
    assert!(store.list_drafts(Some("other")).await.unwrap().is_empty());

    assert!(store.delete_draft(&draft.draft_id).await.unwrap());
    assert!(!store.delete_draft(&draft.draft_id).await.unwrap());
}

#[tokio::test]
async fn stats_report_counts_and_range() {
    let store = Store::open_in_memory().await.unwrap();
    store.put_message(&message("<s1@example.com>", "One", 1)).await.unwrap();
    store.put_message(&message("<s2@example.com>", "Two", 9)).await.unwrap();
    store.mark_inbox_synced("test").await.unwrap();

    let stats = store.get_stats().await.unwrap();
    assert_eq!(stats.message_count, 2);
    assert_eq!(stats.conversation_count, 2);
    assert_eq!(
        stats.oldest_message.unwrap(),
        Utc.with_ymd_and_hms(2025, 1, 1, 10, 0, 0).unwrap()
    );
    assert_eq!(
        stats.newest_message.unwrap(),
        Utc.with_ymd_and_hms(2025, 1, 9, 10, 0, 0).unwrap()
    );
    assert!(stats.last_sync.is_some());
}
