#![allow(clippy::disallowed_methods)]

mod common;

use std::error::Error;

use queue_core::{DictionaryError, DictionaryProvider, ETag, PersistentDictionary, WriteCondition};
use serde_json::json;

#[tokio::test]
async fn test_conditional_writes() -> Result<(), Box<dyn Error>> {
    let provider = common::setup_provider().await?;
    let store = provider.open("workitems").await?;
    assert_eq!(store.table(), "store_workitems");

    // Absent: create once, then conflict
    let first = store
        .set("item-1", json!({"status": "queued"}), WriteCondition::Absent)
        .await?;
    let duplicate = store
        .set("item-1", json!({"status": "other"}), WriteCondition::Absent)
        .await;
    assert!(matches!(duplicate, Err(DictionaryError::Conflict { .. })));

    let loaded = store.get("item-1").await?.ok_or("missing item-1")?;
    assert_eq!(loaded.value, json!({"status": "queued"}));
    assert_eq!(loaded.etag, first);

    // Matches: stale tag rejected, current tag accepted
    let stale = store
        .set(
            "item-1",
            json!({"status": "in_progress"}),
            WriteCondition::Matches(ETag("stale".into())),
        )
        .await;
    assert!(stale.is_err_and(|e| e.is_conflict()));

    let second = store
        .set(
            "item-1",
            json!({"status": "in_progress"}),
            WriteCondition::Matches(first.clone()),
        )
        .await?;
    assert_ne!(first, second);

    // The old tag no longer matches after the write
    let lost = store
        .set(
            "item-1",
            json!({"status": "failed"}),
            WriteCondition::Matches(first),
        )
        .await;
    assert!(lost.is_err_and(|e| e.is_conflict()));

    // Matches on a missing key is a conflict, not an insert
    let missing = store
        .set("item-2", json!(1), WriteCondition::Matches(second.clone()))
        .await;
    assert!(missing.is_err_and(|e| e.is_conflict()));
    assert!(!store.contains_key("item-2").await?);

    // Any overwrites regardless of tag
    let third = store.set("item-1", json!("done"), WriteCondition::Any).await?;
    let loaded = store.get("item-1").await?.ok_or("missing item-1")?;
    assert_eq!(loaded.value, json!("done"));
    assert_eq!(loaded.etag, third);

    Ok(())
}

#[tokio::test]
async fn test_keys_remove_and_delete() -> Result<(), Box<dyn Error>> {
    let provider = common::setup_provider().await?;
    let store = provider.open("workitems").await?;
    let failed = provider.open("failedworkitems").await?;

    for key in ["b", "a", "c"] {
        store.set(key, json!({"k": key}), WriteCondition::Any).await?;
    }
    failed.set("z", json!(null), WriteCondition::Any).await?;

    assert_eq!(store.keys().await?, vec!["a", "b", "c"]);
    assert_eq!(failed.count().await?, 1);

    assert!(store.remove("b").await?);
    assert!(!store.remove("b").await?);
    assert_eq!(store.count().await?, 2);

    store.delete().await?;
    assert_eq!(store.count().await?, 0);
    // Other stores are untouched
    assert!(failed.contains_key("z").await?);

    // The store stays usable after being emptied
    store.set("a", json!(1), WriteCondition::Absent).await?;
    assert_eq!(store.count().await?, 1);

    Ok(())
}

#[tokio::test]
async fn test_reopen_and_invalid_names() -> Result<(), Box<dyn Error>> {
    let provider = common::setup_provider().await?;
    let store = provider.open("results").await?;
    store.set("k", json!([1, 2, 3]), WriteCondition::Any).await?;

    let reopened = provider.open("results").await?;
    let value = reopened.get("k").await?.ok_or("missing k")?;
    assert_eq!(value.value, json!([1, 2, 3]));

    let invalid = provider.open("bad name").await;
    assert!(matches!(invalid, Err(DictionaryError::InvalidKey(_))));

    Ok(())
}
