use clap::Parser;
use keepsake_core::models::{ConflictResolution, SyncConflict, SyncError, SyncErrorKind};
use keepsake_core::{EntityType, LocalStore, SyncResult};
use pretty_assertions::assert_eq;
use serde_json::json;

use crate::cli::{Cli, Commands, CompletionShell};
use crate::commands::common::{
    device_id_path, format_relative_time, format_sync_conflict_lines, load_or_create_device_id,
    parse_payload, payload_preview, resolve_entity, resolve_payload,
};
use crate::commands::completions::render_completions;
use crate::commands::resolve::resolve_conflict;
use crate::commands::status::{format_status_lines, local_status};
use crate::commands::sync::format_sync_result_lines;
use crate::error::CliError;

fn conflict(entity_id: &str) -> SyncConflict {
    SyncConflict {
        id: 0,
        entity_type: EntityType::Content,
        entity_id: entity_id.to_string(),
        local_version: Some(1),
        server_version: Some(2),
        server_payload: Some(json!({"text": "theirs"})),
        server_deleted: false,
        reason: "version_mismatch".to_string(),
        detected_at: 1_700_000_000_000,
    }
}

#[test]
fn parse_payload_requires_json_object() {
    assert_eq!(parse_payload(r#"{"text": "hi"}"#).unwrap(), json!({"text": "hi"}));
    assert!(matches!(
        parse_payload("[1, 2]"),
        Err(CliError::InvalidPayload(message)) if message.contains("an array")
    ));
    assert!(matches!(
        parse_payload("not json"),
        Err(CliError::InvalidPayload(_))
    ));
}

#[test]
fn resolve_payload_prefers_argument() {
    let payload = resolve_payload(Some(r#"  {"title": "walks"}  "#)).unwrap();
    assert_eq!(payload, json!({"title": "walks"}));
}

#[test]
fn device_id_is_generated_once_and_reused() {
    let dir = tempfile::tempdir().unwrap();
    let path = device_id_path(&dir.path().join("keepsake.db"));
    assert!(path.ends_with("keepsake.device-id"));

    let first = load_or_create_device_id(&path).unwrap();
    let second = load_or_create_device_id(&path).unwrap();
    assert_eq!(first, second);
    assert!(uuid::Uuid::parse_str(&first).is_ok());
}

#[test]
fn format_relative_time_units() {
    let now = 10_000_000_000;
    assert_eq!(format_relative_time(now - 30_000, now), "just now");
    assert_eq!(format_relative_time(now - 120_000, now), "2m ago");
    assert_eq!(format_relative_time(now - 2 * 60 * 60_000, now), "2h ago");
    assert_eq!(format_relative_time(now - 3 * 86_400_000, now), "3d ago");
}

#[test]
fn payload_preview_truncates_long_payloads() {
    let preview = payload_preview(&json!({"text": "x".repeat(100)}), 20);
    assert_eq!(preview.chars().count(), 20);
    assert!(preview.ends_with("..."));
}

#[test]
fn conflict_lines_name_reason_and_versions() {
    let lines = format_sync_conflict_lines(&[conflict("n1")]);
    assert_eq!(lines.len(), 1);
    assert!(lines[0].contains("version_mismatch"));
    assert!(lines[0].contains("content=n1"));
    assert!(lines[0].contains("local=v1 server=v2"));
}

#[test]
fn sync_result_lines_list_errors_and_conflict_hint() {
    let mut result = SyncResult::empty();
    result.uploaded_items = 2;
    result.push_error(SyncError::new(
        SyncErrorKind::Conflict,
        EntityType::Journal,
        Some("j1".to_string()),
        "UPDATE rejected",
    ));

    let lines = format_sync_result_lines(&result);
    assert_eq!(lines[0], "Sync incomplete: uploaded 2, downloaded 0");
    assert!(lines.iter().any(|line| line.contains("journal/j1")));
    assert!(lines.last().unwrap().contains("keepsake resolve"));
}

#[test]
fn resolve_requires_exactly_one_strategy() {
    let parsed = Cli::try_parse_from(["keepsake", "resolve", "content", "n1", "--keep-local"]);
    match parsed.unwrap().command {
        Commands::Resolve { resolution, .. } => {
            assert_eq!(resolution.resolution(), ConflictResolution::KeepLocal);
        }
        _ => panic!("expected resolve command"),
    }

    assert!(Cli::try_parse_from(["keepsake", "resolve", "content", "n1"]).is_err());
    assert!(Cli::try_parse_from([
        "keepsake",
        "resolve",
        "content",
        "n1",
        "--keep-local",
        "--take-server",
    ])
    .is_err());
}

#[test]
fn sync_accepts_type_filter() {
    let parsed = Cli::try_parse_from(["keepsake", "sync", "--type", "association"]).unwrap();
    assert!(matches!(
        parsed.command,
        Commands::Sync {
            entity_type: Some(crate::cli::EntityTypeArg::Association)
        }
    ));
}

#[test]
fn completions_mention_binary_name() {
    let script = String::from_utf8(render_completions(CompletionShell::Bash)).unwrap();
    assert!(script.contains("keepsake"));
}

#[tokio::test(flavor = "multi_thread")]
async fn resolve_entity_matches_unique_prefix() {
    let store = LocalStore::open_in_memory().await.unwrap();
    let entity = store
        .create_entity(EntityType::Journal, json!({"title": "garden"}))
        .await
        .unwrap();

    let exact = resolve_entity(&store, EntityType::Journal, &entity.id).await.unwrap();
    assert_eq!(exact.id, entity.id);

    let by_prefix = resolve_entity(&store, EntityType::Journal, &entity.id[..8])
        .await
        .unwrap();
    assert_eq!(by_prefix.id, entity.id);

    let missing = resolve_entity(&store, EntityType::Content, &entity.id).await;
    assert!(matches!(missing, Err(CliError::EntityNotFound(..))));
}

#[tokio::test(flavor = "multi_thread")]
async fn resolve_entity_rejects_ambiguous_prefix() {
    let store = LocalStore::open_in_memory().await.unwrap();
    for title in ["a", "b"] {
        store
            .create_entity(EntityType::Media, json!({"title": title}))
            .await
            .unwrap();
    }

    // UUID v7 ids lead with the current millisecond timestamp.
    let result = resolve_entity(&store, EntityType::Media, "0").await;
    assert!(matches!(result, Err(CliError::AmbiguousEntityId(_))));
}

#[tokio::test(flavor = "multi_thread")]
async fn take_server_resolution_closes_conflict() {
    let store = LocalStore::open_in_memory().await.unwrap();
    let entity = store
        .create_entity(EntityType::Content, json!({"text": "mine"}))
        .await
        .unwrap();
    store.record_conflict(&conflict(&entity.id)).await.unwrap();

    resolve_conflict(
        &store,
        EntityType::Content,
        &entity.id,
        ConflictResolution::TakeServer,
    )
    .await
    .unwrap();

    let settled = store
        .get_entity(EntityType::Content, &entity.id)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(settled.payload, json!({"text": "theirs"}));
    assert_eq!(store.open_conflict_count().await.unwrap(), 0);
    assert_eq!(store.pending_counts().total(), 0);

    let again = resolve_conflict(
        &store,
        EntityType::Content,
        &entity.id,
        ConflictResolution::TakeServer,
    )
    .await;
    assert!(matches!(again, Err(CliError::ConflictNotFound(..))));
}

#[tokio::test(flavor = "multi_thread")]
async fn status_reports_pending_and_conflicts() {
    let dir = tempfile::tempdir().unwrap();
    let db_path = dir.path().join("keepsake.db");
    let store = LocalStore::open_path(&db_path).await.unwrap();
    let entity = store
        .create_entity(EntityType::Content, json!({"text": "queued"}))
        .await
        .unwrap();
    store.record_conflict(&conflict(&entity.id)).await.unwrap();

    let status = local_status(&store, &db_path).await.unwrap();
    assert_eq!(status.pending.get(&EntityType::Content), Some(&1));
    assert_eq!(status.open_conflicts, 1);
    assert!(status.watermarks.is_empty());

    let lines = format_status_lines(&status);
    assert!(lines
        .iter()
        .any(|line| line.starts_with("content") && line.contains("pending=1")));
    assert!(lines.iter().any(|line| line.contains("last sync=never")));
    assert_eq!(lines.last().unwrap(), "Open conflicts: 1");
}
