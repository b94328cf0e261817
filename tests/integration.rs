use std::sync::{Arc, LazyLock};
use std::time::Duration;

use chat_guard::storage::{CLIENT_ID_KEY, CURRENT_SESSION_KEY, HISTORY_KEY};
use chat_guard::{
    ChatGuardError, ChatHistoryManager, ContentGuard, ContentKind, FsStorage, HistoryBuilder,
    HistoryCipher, ManualClock, MemoryStorage, RenderingState, Role, SecurityConfig,
    SecurityEventKind, Severity, Storage,
};
use regex::Regex;
use tempfile::TempDir;

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

/// Storage that always fails -- for testing degraded paths.
#[derive(Clone)]
struct FailingStorage;

impl Storage for FailingStorage {
    async fn get(&self, _key: &str) -> chat_guard::Result<Option<String>> {
        Err(ChatGuardError::Storage("simulated read failure".into()))
    }

    async fn put(&self, _key: &str, _value: &str) -> chat_guard::Result<()> {
        Err(ChatGuardError::Storage("simulated write failure".into()))
    }

    async fn remove(&self, _key: &str) -> chat_guard::Result<()> {
        Err(ChatGuardError::Storage("simulated remove failure".into()))
    }
}

fn keyed_config() -> SecurityConfig {
    SecurityConfig::builder()
        .encryption_key("integration-test-passphrase")
        .build()
        .unwrap()
}

fn guard(config: SecurityConfig) -> (Arc<ContentGuard>, Arc<ManualClock>) {
    let clock = Arc::new(ManualClock::default());
    let guard = ContentGuard::builder(config).clock(clock.clone()).build();
    (Arc::new(guard), clock)
}

struct Harness {
    history: Arc<ChatHistoryManager<MemoryStorage, MemoryStorage>>,
    guard: Arc<ContentGuard>,
    clock: Arc<ManualClock>,
    local: MemoryStorage,
    tab: MemoryStorage,
}

fn harness(config: SecurityConfig, max_history_size: usize) -> Harness {
    let (guard, clock) = guard(config);
    let local = MemoryStorage::new();
    let tab = MemoryStorage::new();
    let history = HistoryBuilder::new(local.clone(), guard.clone())
        .session_storage(tab.clone())
        .max_history_size(max_history_size)
        .build();
    Harness {
        history,
        guard,
        clock,
        local,
        tab,
    }
}

const ADVERSARIAL: &[&str] = &[
    "<script>alert(document.cookie)</script>Réponse",
    "<scr<script>ipt>alert(1)</scr</script>ipt>",
    "<img src=x onerror=alert(1)>",
    r#"<a href="javascript:alert(1)" onclick="steal()">clique</a>"#,
    "<iframe src=\"https://evil.example\"></iframe>",
    "<object data=\"x.swf\"></object><embed src=\"x.swf\">",
    "<form action=\"https://evil.example\"><input name=\"pwd\"></form>",
    "<svg><script>alert(1)</script></svg>",
    "<div style=\"background:url(javascript:alert(1))\">x</div>",
];

/// Link syntax that only means something when rendered as markdown.
const ADVERSARIAL_MARKDOWN: &[&str] = &[
    "[clique](javascript:alert(1))",
    "[clique]( <vbscript:msgbox(1)> )",
    "[ref]: javascript:alert(1)",
    "<javascript:alert(1)>",
    "[x](javascript&colon;alert(1))",
    "[x](javascript&#58;alert(1))",
    "[x](javascript\\:alert(1))",
    "[r]: javascript&#x3A;alert(1)\n\n[x][r]",
];

/// Tags that never close. An HTML parser drops them, a markdown renderer
/// passes them through as raw HTML.
const UNCLOSED_TAGS: &[&str] = &[
    "<div onmouseover=alert(1)",
    "<div\nonmouseover=alert(1) x=\n\nsuite",
    "<img src=x onerror=alert(1)",
];

/// A tag that still carries an event handler.
static HANDLER_IN_TAG: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)<[a-z][^>]*\son[a-z]+\s*=").unwrap());

/// A markdown link destination using the `javascript` scheme, in any encoding.
static SCRIPT_LINK: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)(?:\]\(|\]:)[\s<]*javascript").unwrap());

fn assert_inert(content: &str) {
    let lower = content.to_ascii_lowercase();
    for needle in ["<script", "<iframe", "<object", "<embed", "<form", "javascript:"] {
        assert!(!lower.contains(needle), "{needle:?} survived in {content:?}");
    }
    assert!(!HANDLER_IN_TAG.is_match(content), "handler survived in {content:?}");
    assert!(!SCRIPT_LINK.is_match(content), "script link survived in {content:?}");
}

// ---------------------------------------------------------------------------
// Pipeline scenarios
// ---------------------------------------------------------------------------

#[tokio::test]
async fn onerror_payload_is_stored_without_handler() {
    let h = harness(keyed_config(), 100);

    let message = h
        .history
        .add_message("<img src=x onerror=alert(1)>Hello", Role::User)
        .await
        .unwrap();

    assert!(message.content.contains("Hello"));
    assert_inert(&message.content);
    assert!(message.metadata.sanitized);

    let stored = h.history.current_session().await;
    assert_eq!(stored.messages, vec![message]);
    assert!(h.guard.monitor().count_of(SecurityEventKind::XssAttempt) >= 1);
}

#[tokio::test]
async fn adversarial_assistant_payloads_are_neutralised() {
    let h = harness(keyed_config(), 100);

    for payload in ADVERSARIAL {
        let message = h.history.add_message(payload, Role::Assistant).await.unwrap();
        assert_inert(&message.content);

        let html = h
            .history
            .add_message_as(payload, Role::Assistant, ContentKind::Html)
            .await
            .unwrap();
        assert_inert(&html.content);
    }
    for payload in ADVERSARIAL_MARKDOWN {
        let message = h.history.add_message(payload, Role::Assistant).await.unwrap();
        assert_inert(&message.content);
        assert!(!message.content.to_ascii_lowercase().contains("vbscript:"));
    }

    let expected = 2 * ADVERSARIAL.len() + ADVERSARIAL_MARKDOWN.len();
    let events = h.guard.monitor().count_of(SecurityEventKind::UntrustedContent);
    assert_eq!(events, expected);
    assert_eq!(h.guard.monitor().count_of(SecurityEventKind::RateLimitExceeded), 0);
}

#[tokio::test]
async fn unclosed_tags_are_escaped_in_markdown() {
    let h = harness(keyed_config(), 100);

    for payload in UNCLOSED_TAGS {
        let message = h.history.add_message(payload, Role::Assistant).await.unwrap();
        assert_inert(&message.content);
        assert!(message.content.starts_with("&lt;"), "{:?}", message.content);
        assert!(message.metadata.sanitized);

        // The HTML parser already discards a tag cut off by the end of input,
        // so nothing renderable was removed.
        let html = h
            .history
            .add_message_as(payload, Role::Assistant, ContentKind::Html)
            .await
            .unwrap();
        assert_eq!(html.content, "");
        assert!(!html.metadata.sanitized);
    }

    let events = h.guard.monitor().count_of(SecurityEventKind::UntrustedContent);
    assert_eq!(events, UNCLOSED_TAGS.len());
}

#[tokio::test]
async fn re_escaped_html_is_not_counted_as_sanitized() {
    let h = harness(keyed_config(), 100);

    let message = h
        .history
        .add_message_as("Tom & Jerry", Role::Assistant, ContentKind::Html)
        .await
        .unwrap();
    assert_eq!(message.content, "Tom &amp; Jerry");
    assert!(!message.metadata.sanitized);

    let user = h
        .history
        .add_message_as("  Tom & Jerry <b>!</b>  ", Role::User, ContentKind::Html)
        .await
        .unwrap();
    assert_eq!(user.content, "Tom &amp; Jerry <b>!</b>");
    assert!(!user.metadata.sanitized);

    let session = h.history.current_session().await;
    assert_eq!(session.metadata.security_events, 0);
    assert_eq!(h.guard.monitor().count_of(SecurityEventKind::UntrustedContent), 0);
}

#[tokio::test]
async fn clean_assistant_content_is_not_flagged() {
    let h = harness(keyed_config(), 100);
    let message = h
        .history
        .add_message("Voici **trois** options :\n\n- une\n- deux\n- trois", Role::Assistant)
        .await
        .unwrap();
    assert!(!message.metadata.sanitized);
    assert_eq!(h.guard.monitor().count_of(SecurityEventKind::UntrustedContent), 0);
}

#[tokio::test]
async fn oversized_message_is_rejected_before_sanitizing() {
    let config = SecurityConfig::builder()
        .encryption_key("k")
        .max_content_length(20)
        .build()
        .unwrap();
    let h = harness(config, 100);

    let err = h
        .history
        .add_message(&"a".repeat(21), Role::Assistant)
        .await
        .unwrap_err();
    assert!(matches!(err, ChatGuardError::ContentTooLong { len: 21, max: 20 }));

    let err = h
        .history
        .add_message(&"a".repeat(21), Role::User)
        .await
        .unwrap_err();
    assert!(matches!(err, ChatGuardError::Validation(_)));
    assert!(h.history.current_session().await.messages.is_empty());
}

#[tokio::test]
async fn user_messages_are_rate_limited_per_client() {
    let config = SecurityConfig::builder()
        .encryption_key("k")
        .rate_limit(3, Duration::from_secs(60))
        .build()
        .unwrap();
    let h = harness(config, 100);

    for i in 0..3 {
        h.history
            .add_message(&format!("message {i}"), Role::User)
            .await
            .unwrap();
    }
    let err = h.history.add_message("one too many", Role::User).await.unwrap_err();
    assert!(matches!(err, ChatGuardError::RateLimited));
    assert_eq!(h.guard.monitor().count_of(SecurityEventKind::RateLimitExceeded), 1);

    // Assistant replies are not counted against the client.
    h.history.add_message("réponse", Role::Assistant).await.unwrap();

    h.clock.advance(Duration::from_secs(61));
    h.history.add_message("back again", Role::User).await.unwrap();

    let client_id = h.tab.snapshot(CLIENT_ID_KEY).unwrap();
    assert_eq!(client_id, h.history.client_id().await);
}

#[tokio::test]
async fn secure_links_marks_external_and_drops_rejected() {
    let (guard, _) = guard(keyed_config());
    let html = guard
        .process_content(
            "tab",
            r#"<p><a href="/contact">Contact</a> <a href="https://evil.example/x">ext</a></p>"#,
            ContentKind::Html,
        )
        .unwrap();
    let secured = guard.secure_links(&html);

    assert!(secured.contains(r#"<a href="/contact">Contact</a>"#));
    assert!(secured.contains(
        r#"<a data-external="true" href="https://evil.example/x" rel="noopener noreferrer" target="_blank">ext</a>"#
    ));
    assert_eq!(guard.monitor().count_of(SecurityEventKind::ExternalUrl), 1);
}

// ---------------------------------------------------------------------------
// Session lifecycle
// ---------------------------------------------------------------------------

#[tokio::test]
async fn trims_to_most_recent_messages() {
    let h = harness(keyed_config(), 5);

    for i in 0..8 {
        h.history
            .add_message(&format!("message {i}"), Role::Assistant)
            .await
            .unwrap();
    }

    let session = h.history.current_session().await;
    let contents: Vec<_> = session.messages.iter().map(|m| m.content.as_str()).collect();
    assert_eq!(
        contents,
        ["message 3", "message 4", "message 5", "message 6", "message 7"]
    );
    assert_eq!(session.metadata.total_messages, 8);
}

#[tokio::test]
async fn expired_session_is_replaced_and_pruned_from_storage() {
    let h = harness(keyed_config(), 100);
    h.history.add_message("hier", Role::Assistant).await.unwrap();
    let old = h.history.current_session().await.id;

    h.clock.advance(Duration::from_secs(24 * 60 * 60 + 1));
    let new = h.history.current_session().await;
    assert_ne!(new.id, old);
    assert!(new.messages.is_empty());
    assert_eq!(h.tab.snapshot(CURRENT_SESSION_KEY).as_deref(), Some(new.id.as_str()));

    // A fresh manager over the same storage no longer sees the old session.
    let reloaded = HistoryBuilder::new(h.local.clone(), h.guard.clone())
        .session_storage(h.tab.clone())
        .build();
    let ids: Vec<_> = reloaded
        .all_sessions()
        .await
        .into_iter()
        .map(|s| s.id)
        .collect();
    assert_eq!(ids, [new.id]);
}

#[tokio::test]
async fn rendering_state_survives_reload() {
    let h = harness(keyed_config(), 100);
    let message = h.history.add_message("Bonjour", Role::Assistant).await.unwrap();
    h.history
        .set_rendering_state(&message.id, RenderingState::Complete)
        .await
        .unwrap();

    let reloaded = HistoryBuilder::new(h.local.clone(), h.guard.clone())
        .session_storage(h.tab.clone())
        .build();
    let session = reloaded.current_session().await;
    assert_eq!(session.messages[0].rendering_state, RenderingState::Complete);
    assert!(matches!(
        reloaded
            .set_rendering_state(&message.id, RenderingState::Rendering)
            .await,
        Err(ChatGuardError::MessageFinalized(_))
    ));
}

#[tokio::test]
async fn delete_session_and_stats() {
    let h = harness(keyed_config(), 100);
    h.history.add_message("un", Role::Assistant).await.unwrap();
    h.history.add_message("deux", Role::Assistant).await.unwrap();

    let stats = h.history.stats().await;
    assert_eq!(stats.total_sessions, 1);
    assert_eq!(stats.total_messages, 2);
    assert_eq!(stats.current_session_messages, 2);
    assert!(stats.encryption_enabled);

    let id = h.history.current_session().await.id;
    h.history.delete_session(&id).await.unwrap();
    assert!(h.tab.snapshot(CURRENT_SESSION_KEY).is_none());
    assert_eq!(h.history.stats().await.total_messages, 0);
}

// ---------------------------------------------------------------------------
// Export / import
// ---------------------------------------------------------------------------

#[tokio::test]
async fn export_then_import_creates_a_new_current_session() {
    let h = harness(keyed_config(), 100);
    h.history.add_message("à garder", Role::Assistant).await.unwrap();
    let original = h.history.current_session().await;

    let blob = h.history.export_session(&original.id).await.unwrap();
    assert!(!blob.contains("à garder"));
    assert!(h.history.import_session(&blob).await);

    let imported = h.history.current_session().await;
    assert_ne!(imported.id, original.id);
    assert_eq!(imported.messages.len(), 1);
    assert_eq!(imported.messages[0].content, "à garder");
    assert_eq!(h.history.all_sessions().await.len(), 2);
    assert_eq!(h.guard.monitor().count_of(SecurityEventKind::SessionImported), 1);
}

#[tokio::test]
async fn malformed_import_is_rejected_and_history_untouched() {
    let h = harness(keyed_config(), 100);
    h.history.add_message("existant", Role::Assistant).await.unwrap();
    let before = h.history.current_session().await;
    let stored = h.local.snapshot(HISTORY_KEY);

    let cipher = HistoryCipher::new(h.guard.config(), h.guard.monitor().clone());
    let not_a_session = cipher
        .encrypt(&serde_json::json!({ "id": "x", "messages": "nope" }))
        .unwrap();
    let missing_fields = cipher
        .encrypt(&serde_json::json!({ "id": "x", "messages": [{ "content": "hi" }] }))
        .unwrap();

    for blob in ["", "garbage", "cg1:AAAA", not_a_session.as_str(), missing_fields.as_str()] {
        assert!(!h.history.import_session(blob).await, "{blob:?} was accepted");
    }

    assert_eq!(h.history.current_session().await, before);
    assert_eq!(h.history.all_sessions().await.len(), 1);
    assert_eq!(h.local.snapshot(HISTORY_KEY), stored);
    assert_eq!(h.guard.monitor().count_of(SecurityEventKind::ImportRejected), 5);
}

#[tokio::test]
async fn imported_messages_are_sanitized_again() {
    let h = harness(keyed_config(), 100);
    let cipher = HistoryCipher::new(h.guard.config(), h.guard.monitor().clone());
    let hostile = cipher
        .encrypt(&serde_json::json!({
            "id": "forged",
            "createdAt": "2026-01-01T00:00:00Z",
            "lastActivity": "2026-01-01T00:00:00Z",
            "messages": [{
                "id": "m1",
                "content": "<script>alert(1)</script>Salut",
                "role": "assistant",
                "timestamp": "2026-01-01T00:00:00Z",
                "isMarkdown": false
            }]
        }))
        .unwrap();

    assert!(h.history.import_session(&hostile).await);
    let session = h.history.current_session().await;
    assert_ne!(session.id, "forged");
    assert_eq!(session.messages[0].content, "Salut");
    assert!(session.messages[0].metadata.sanitized);
    assert_eq!(h.guard.monitor().count_of(SecurityEventKind::UntrustedContent), 1);
}

// ---------------------------------------------------------------------------
// Storage backends and degraded paths
// ---------------------------------------------------------------------------

#[tokio::test]
async fn failing_storage_degrades_to_memory() {
    let (guard, _) = guard(keyed_config());
    let history = HistoryBuilder::new(FailingStorage, guard.clone())
        .session_storage(FailingStorage)
        .build();

    let message = history.add_message("toujours là", Role::User).await.unwrap();
    assert_eq!(history.current_session().await.messages, vec![message]);

    let failures = guard.monitor().count_of(SecurityEventKind::StorageFailure);
    assert!(failures >= 2, "only {failures} storage failures logged");
    assert!(
        guard
            .monitor()
            .recent_events(100)
            .iter()
            .filter(|e| e.kind == SecurityEventKind::StorageFailure)
            .all(|e| e.severity == Severity::Medium)
    );
}

#[tokio::test]
async fn fs_storage_round_trip_and_missing_keys() {
    let tmp = TempDir::new().unwrap();
    let storage = FsStorage::new(tmp.path());

    assert_eq!(storage.get("absent").await.unwrap(), None);
    storage.put("nested/key", "valeur").await.unwrap();
    assert_eq!(storage.get("nested/key").await.unwrap().as_deref(), Some("valeur"));
    assert!(tmp.path().join("nested/key").exists());

    storage.remove("nested/key").await.unwrap();
    storage.remove("nested/key").await.unwrap();
    assert_eq!(storage.get("nested/key").await.unwrap(), None);
}

#[tokio::test]
async fn fs_history_persists_across_managers() {
    let tmp = TempDir::new().unwrap();
    let (guard, _) = guard(keyed_config());
    let tab = MemoryStorage::new();

    let first = HistoryBuilder::new(FsStorage::new(tmp.path()), guard.clone())
        .session_storage(tab.clone())
        .build();
    first.add_message("persisté", Role::User).await.unwrap();

    let on_disk = std::fs::read_to_string(tmp.path().join(HISTORY_KEY)).unwrap();
    assert!(on_disk.starts_with("cg1:"));
    assert!(!on_disk.contains("persisté"));

    let second = HistoryBuilder::new(FsStorage::new(tmp.path()), guard)
        .session_storage(tab)
        .build();
    let session = second.current_session().await;
    assert_eq!(session.messages.len(), 1);
    assert_eq!(session.messages[0].content, "persisté");
}

#[tokio::test]
async fn wrong_key_starts_with_empty_history() {
    let tmp = TempDir::new().unwrap();
    let (writer_guard, _) = guard(keyed_config());
    let writer = HistoryBuilder::new(FsStorage::new(tmp.path()), writer_guard).build();
    writer.add_message("secret", Role::Assistant).await.unwrap();

    let (reader_guard, _) = guard(
        SecurityConfig::builder()
            .encryption_key("another passphrase")
            .build()
            .unwrap(),
    );
    let reader = HistoryBuilder::new(FsStorage::new(tmp.path()), reader_guard.clone()).build();
    assert!(reader.all_sessions().await.is_empty());
    assert_eq!(
        reader_guard
            .monitor()
            .count_of(SecurityEventKind::DecryptionFailure),
        1
    );
}

#[tokio::test]
async fn disabled_encryption_stores_plain_json() {
    let config = SecurityConfig::builder()
        .history_encryption(false)
        .build()
        .unwrap();
    let h = harness(config, 100);
    h.history.add_message("en clair", Role::Assistant).await.unwrap();

    let raw = h.local.snapshot(HISTORY_KEY).unwrap();
    let sessions: serde_json::Value = serde_json::from_str(&raw).unwrap();
    assert_eq!(sessions[0]["messages"][0]["content"], "en clair");
    assert_eq!(sessions[0]["metadata"]["encryptionEnabled"], false);
}

// ---------------------------------------------------------------------------
// Background sweeper
// ---------------------------------------------------------------------------

#[tokio::test]
async fn sweeper_prunes_expired_sessions_and_shuts_down() {
    let (guard, clock) = guard(keyed_config());
    let local = MemoryStorage::new();
    let (history, sweeper) = HistoryBuilder::new(local.clone(), guard.clone())
        .max_session_age(Duration::from_secs(60))
        .sweep_interval(Duration::from_millis(20))
        .build_with_sweeper();

    history.add_message("bientôt expiré", Role::Assistant).await.unwrap();
    clock.advance(Duration::from_secs(61));

    tokio::time::sleep(Duration::from_millis(200)).await;
    assert_eq!(history.stats().await.total_sessions, 0);
    assert!(guard.monitor().count_of(SecurityEventKind::SessionExpired) >= 1);

    assert!(!sweeper.is_finished());
    sweeper.shutdown().await;
}

#[tokio::test]
async fn dropping_the_handle_stops_the_sweeper() {
    let (guard, _) = guard(keyed_config());
    let (history, sweeper) = HistoryBuilder::new(MemoryStorage::new(), guard)
        .sweep_interval(Duration::from_millis(10))
        .build_with_sweeper();
    drop(sweeper);
    tokio::time::sleep(Duration::from_millis(50)).await;
    // Only the test holds the manager once the task has exited.
    assert_eq!(Arc::strong_count(&history), 1);
}
