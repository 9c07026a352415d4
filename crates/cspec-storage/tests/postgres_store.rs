// PostgreSQL record store checks. Skipped unless CSPEC_TEST_DATABASE_URL points at a scratch database.

use cspec_core::{CampaignEdit, CampaignUpsert, NewSpecVersion};
use cspec_storage::{DatabaseConfig, PgRecordStore, RecordStore, StoreError};
use futures::TryStreamExt;

async fn store() -> Option<PgRecordStore> {
    let url = std::env::var("CSPEC_TEST_DATABASE_URL").ok()?;
    let store = PgRecordStore::connect(&DatabaseConfig {
        url,
        ..DatabaseConfig::default()
    })
    .await
    .expect("connect to test database");
    store.ensure_schema().await.expect("schema");
    Some(store)
}

fn unique(label: &str) -> String {
    format!("{label} {}", uuid::Uuid::new_v4())
}

fn upsert(name: &str, client: &str, status: &str) -> CampaignUpsert {
    CampaignUpsert {
        name: name.into(),
        client: client.into(),
        status: status.into(),
        pdf_filename: None,
        notes: None,
        spec_url: Some("https://example.test/spec.pdf".into()),
    }
}

#[tokio::test]
async fn upsert_is_idempotent_per_name_and_client() {
    let Some(store) = store().await else { return };
    let name = unique("Acme Launch");

    let first = store.upsert(&upsert(&name, "Acme Co", "draft")).await.unwrap();
    let before = store.get(first.id).await.unwrap().unwrap();
    let second = store.upsert(&upsert(&name, "Acme Co", "active")).await.unwrap();

    assert!(first.created);
    assert!(!second.created);
    assert_eq!(first.id, second.id);

    let rows: Vec<_> = store.list_all().try_collect().await.unwrap();
    let matching = rows.iter().filter(|r| r.name == name).collect::<Vec<_>>();
    assert_eq!(matching.len(), 1);
    assert_eq!(matching[0].status, "active");
    assert!(matching[0].last_updated > before.last_updated);
    store.close().await;
}

#[tokio::test]
async fn ensure_schema_twice_keeps_rows() {
    let Some(store) = store().await else { return };
    let name = unique("Schema Check");
    let outcome = store.upsert(&upsert(&name, "Acme Co", "draft")).await.unwrap();

    store.ensure_schema().await.unwrap();
    store.ensure_schema().await.unwrap();

    let row = store.get(outcome.id).await.unwrap().expect("row survives");
    assert_eq!(row.name, name);
    store.close().await;
}

#[tokio::test]
async fn empty_name_is_rejected_before_touching_the_database() {
    let Some(store) = store().await else { return };
    let err = store.upsert(&upsert("  ", "Acme Co", "draft")).await.unwrap_err();
    assert!(matches!(err, StoreError::Validation(_)));
    store.close().await;
}

#[tokio::test]
async fn notes_edits_are_recorded_in_history() {
    let Some(store) = store().await else { return };
    let name = unique("Notes");
    let id = store.upsert(&upsert(&name, "Acme Co", "draft")).await.unwrap().id;

    assert!(store.save_notes(id, Some("first"), "alex").await.unwrap());
    assert!(store.save_notes(id, Some("second"), "sam").await.unwrap());

    let history = store.notes_history(id, 5).await.unwrap();
    assert_eq!(history.len(), 2);
    assert_eq!(history[0].notes.as_deref(), Some("second"));
    assert_eq!(history[0].edited_by, "sam");

    let found = store.find(&name, "Acme Co").await.unwrap().unwrap();
    assert_eq!(found.notes.as_deref(), Some("second"));
    store.close().await;
}

#[tokio::test]
async fn update_by_id_rewrites_key_and_refuses_clashes() {
    let Some(store) = store().await else { return };
    let taken = unique("Taken");
    let mine = unique("Mine");
    store.upsert(&upsert(&taken, "Acme Co", "draft")).await.unwrap();
    let id = store.upsert(&upsert(&mine, "Acme Co", "draft")).await.unwrap().id;

    let mut edit = CampaignEdit {
        name: taken.clone(),
        client: "Acme Co".into(),
        status: "Active".into(),
        spec_url: None,
        notes: Some("edited".into()),
        edited_by: "alex".into(),
    };
    let err = store.update(id, &edit).await.unwrap_err();
    assert!(matches!(err, StoreError::Conflict(_)));

    edit.name = format!("{mine} renamed");
    assert!(store.update(id, &edit).await.unwrap());
    let row = store.get(id).await.unwrap().unwrap();
    assert_eq!(row.name, edit.name);
    assert_eq!(row.notes.as_deref(), Some("edited"));
    assert_eq!(store.notes_history(id, 5).await.unwrap()[0].edited_by, "alex");
    store.close().await;
}

#[tokio::test]
async fn spec_versions_are_unique_per_campaign() {
    let Some(store) = store().await else { return };
    let id = store
        .upsert(&upsert(&unique("Versions"), "Acme Co", "draft"))
        .await
        .unwrap()
        .id;
    let version = |n: i32| NewSpecVersion {
        campaign_id: id,
        version: n,
        filename: format!("versions.{id}.v{n}.pdf"),
        uploaded_by: "sam".into(),
    };

    assert!(store.add_spec_version(&version(1)).await.unwrap());
    assert!(store.add_spec_version(&version(2)).await.unwrap());
    let err = store.add_spec_version(&version(2)).await.unwrap_err();
    assert!(matches!(err, StoreError::Conflict(_)));

    let versions = store.spec_versions(id).await.unwrap();
    assert_eq!(versions.iter().map(|v| v.version).collect::<Vec<_>>(), vec![2, 1]);
    let row = store.get(id).await.unwrap().unwrap();
    assert_eq!(row.pdf_filename, Some(format!("versions.{id}.v2.pdf")));
    store.close().await;
}
