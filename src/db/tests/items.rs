use super::{insert_test_source, setup_db};
use crate::db::*;
use chrono::{Duration, TimeZone, Utc};

fn item<'a>(guid: &'a str, hash: &'a str) -> ItemUpsert<'a> {
    ItemUpsert {
        guid,
        title: "Title",
        link: Some("https://example.com/post"),
        published_at: None,
        content_hash: hash,
    }
}

#[tokio::test]
async fn test_upsert_classifies_writes() {
    let (db, _temp) = setup_db().await;
    let id = insert_test_source(&db, "items").await;
    let now = Utc::now();

    let created = db.upsert_item(id, &item("g1", "h1"), now).await.unwrap();
    assert!(matches!(created, ItemWrite::Created(_)));

    let unchanged = db.upsert_item(id, &item("g1", "h1"), now).await.unwrap();
    assert!(matches!(unchanged, ItemWrite::Unchanged(_)));

    let updated = db.upsert_item(id, &item("g1", "h2"), now).await.unwrap();
    assert!(matches!(updated, ItemWrite::Updated(_)));

    assert_eq!(db.count_items(id).await.unwrap(), 1);
}

#[tokio::test]
async fn test_same_guid_in_different_sources_is_distinct() {
    let (db, _temp) = setup_db().await;
    let a = insert_test_source(&db, "a").await;
    let b = insert_test_source(&db, "b").await;
    let now = Utc::now();

    db.upsert_item(a, &item("shared", "h"), now).await.unwrap();
    let write = db.upsert_item(b, &item("shared", "h"), now).await.unwrap();

    assert!(matches!(write, ItemWrite::Created(_)));
}

#[tokio::test]
async fn test_prune_keeps_most_recent() {
    let (db, _temp) = setup_db().await;
    let id = insert_test_source(&db, "prune").await;
    let base = Utc.timestamp_opt(1_700_000_000, 0).unwrap();

    for (i, guid) in ["old", "mid", "new"].iter().enumerate() {
        db.upsert_item(id, &item(guid, "h"), base + Duration::minutes(i as i64))
            .await
            .unwrap();
    }

    assert_eq!(db.prune_items(id, 2).await.unwrap(), 1);

    let guids: Vec<String> = db
        .list_items(id)
        .await
        .unwrap()
        .into_iter()
        .map(|row| row.guid)
        .collect();
    assert_eq!(guids, vec!["new".to_string(), "mid".to_string()]);
}
