use btc_import::destination::{Condition, RecordBackend, RecordFilter};
use btc_import::fallback::is_not_found;
use btc_import::model::Collection;
use btc_import::store::{DirectStore, StoreError};
use serde_json::json;
use sqlx::{Connection, SqliteConnection};
use std::collections::BTreeMap;

async fn setup_store(dir: &std::path::Path) -> String {
    let url = format!("sqlite://{}?mode=rwc", dir.join("tt.db").display());
    let mut conn = SqliteConnection::connect(&url).await.unwrap();
    for table in ["TtEvents", "Organizers", "venues"] {
        sqlx::query(&format!(
            "CREATE TABLE \"{table}\" (id TEXT PRIMARY KEY, app_id TEXT, data TEXT NOT NULL)"
        ))
        .execute(&mut conn)
        .await
        .unwrap();
    }
    let rows = [
        ("TtEvents", "e1", "tt-app", json!({ "title": "Jazz", "btcId": "b1", "startDate": "2024-05-01T19:00:00Z", "importSource": "btc" })),
        ("TtEvents", "e2", "tt-app", json!({ "title": "Blues", "btcId": "b2", "startDate": "2024-05-02T19:00:00Z", "importSource": "btc" })),
        ("Organizers", "o1", "legacy", json!({ "name": "Blue Note Collective", "email": "info@bluenote.org" })),
        ("venues", "v1", "tt-app", json!({ "name": "Main Hall" })),
    ];
    for (table, id, app, data) in rows {
        sqlx::query(&format!(
            "INSERT INTO \"{table}\" (id, app_id, data) VALUES (?, ?, ?)"
        ))
        .bind(id)
        .bind(app)
        .bind(data.to_string())
        .execute(&mut conn)
        .await
        .unwrap();
    }
    conn.close().await.unwrap();
    url
}

fn mapping() -> BTreeMap<Collection, String> {
    BTreeMap::from([
        (Collection::Events, "TtEvents".to_string()),
        (Collection::Organizers, "organizers".to_string()),
        (Collection::Users, "users".to_string()),
        (Collection::Venues, "venues".to_string()),
    ])
}

fn tenant() -> RecordFilter {
    RecordFilter::new(Some("tt-app".into()))
}

#[tokio::test]
async fn lists_through_configured_mapping_with_json_filters() {
    let td = tempfile::tempdir().unwrap();
    let store = DirectStore::new(&setup_store(td.path()).await, mapping(), true, "_id");

    let by_id = store
        .list(Collection::Events, &tenant().with(Condition::eq("btcId", "b2")))
        .await
        .unwrap();
    assert_eq!(by_id.len(), 1);
    assert_eq!(by_id[0]["_id"], "e2");
    assert_eq!(by_id[0]["title"], "Blues");

    let in_window = store
        .list(
            Collection::Events,
            &tenant().with(Condition::range(
                "startDate",
                "2024-05-01T00:00:00Z",
                "2024-05-01T23:59:59Z",
            )),
        )
        .await
        .unwrap();
    assert_eq!(in_window.len(), 1);
    assert_eq!(in_window[0]["btcId"], "b1");

    let fuzzy = store
        .list(Collection::Venues, &tenant().with(Condition::contains("name", "main")))
        .await
        .unwrap();
    assert_eq!(fuzzy.len(), 1);
}

#[tokio::test]
async fn mismatched_mapping_is_resolved_by_introspection() {
    let td = tempfile::tempdir().unwrap();
    let store = DirectStore::new(&setup_store(td.path()).await, mapping(), true, "_id");

    assert_eq!(store.resolve_table(Collection::Organizers).await.unwrap(), "Organizers");
    let tables = store.list_tables().await.unwrap();
    assert_eq!(tables, vec!["Organizers", "TtEvents", "venues"]);

    let err = store.resolve_table(Collection::Users).await.unwrap_err();
    assert!(matches!(
        err.downcast_ref::<StoreError>(),
        Some(StoreError::UnknownTable { collection: "users", .. })
    ));
}

#[tokio::test]
async fn empty_tenant_query_widens_only_when_enabled() {
    let td = tempfile::tempdir().unwrap();
    let url = setup_store(td.path()).await;
    let filter = tenant().with(Condition::eq("name", "Blue Note Collective"));

    let widening = DirectStore::new(&url, mapping(), true, "_id");
    let rows = widening.list(Collection::Organizers, &filter).await.unwrap();
    assert_eq!(rows.len(), 1);
    assert_eq!(rows[0]["_id"], "o1");

    let strict = DirectStore::new(&url, mapping(), false, "_id");
    assert!(strict
        .list(Collection::Organizers, &filter)
        .await
        .unwrap()
        .is_empty());
}

#[tokio::test]
async fn tenant_only_filters_never_widen() {
    let td = tempfile::tempdir().unwrap();
    let store = DirectStore::new(&setup_store(td.path()).await, mapping(), true, "_id");
    let filter = tenant()
        .tenant_only()
        .with(Condition::eq("name", "Blue Note Collective"));
    assert!(store
        .list(Collection::Organizers, &filter)
        .await
        .unwrap()
        .is_empty());
}

#[tokio::test]
async fn case_insensitive_equality_uses_lowercased_comparison() {
    let td = tempfile::tempdir().unwrap();
    let store = DirectStore::new(&setup_store(td.path()).await, mapping(), false, "_id");
    let filter = RecordFilter::new(Some("legacy".into()))
        .with(Condition::eq_ignore_case("email", "INFO@BlueNote.org"));
    let rows = store.list(Collection::Organizers, &filter).await.unwrap();
    assert_eq!(rows.len(), 1);
    assert_eq!(rows[0]["_id"], "o1");
}

#[tokio::test]
async fn delete_removes_row_and_reports_missing_ones() {
    let td = tempfile::tempdir().unwrap();
    let store = DirectStore::new(&setup_store(td.path()).await, mapping(), true, "_id");

    store.delete(Collection::Events, "e1").await.unwrap();
    let remaining = store.list(Collection::Events, &tenant()).await.unwrap();
    assert_eq!(remaining.len(), 1);

    let err = store.delete(Collection::Events, "e1").await.unwrap_err();
    assert!(is_not_found(&err));
}

#[tokio::test]
async fn unsafe_field_names_are_rejected() {
    let td = tempfile::tempdir().unwrap();
    let store = DirectStore::new(&setup_store(td.path()).await, mapping(), true, "_id");
    let err = store
        .list(
            Collection::Events,
            &tenant().with(Condition::eq("title') OR 1=1 --", "x")),
        )
        .await
        .unwrap_err();
    assert!(matches!(
        err.downcast_ref::<StoreError>(),
        Some(StoreError::InvalidIdentifier(_))
    ));
}
