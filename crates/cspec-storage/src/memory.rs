//! In-process record store with the same contract as the PostgreSQL store.

use async_trait::async_trait;
use chrono::{Duration as ChronoDuration, NaiveDateTime, Utc};
use cspec_core::{
    validate_key, CampaignEdit, CampaignRecord, CampaignUpsert, NewSpecVersion, NotesEdit,
    SpecVersion, UpsertOutcome,
};
use futures::stream::{self, BoxStream, StreamExt};
use tokio::sync::Mutex;

use crate::records::{RecordStore, StoreError};

#[derive(Debug, Default)]
pub struct MemoryRecordStore {
    state: Mutex<MemoryState>,
}

#[derive(Debug, Default)]
struct MemoryState {
    rows: Vec<CampaignRecord>,
    history: Vec<(i32, NotesEdit)>,
    versions: Vec<SpecVersion>,
    last_id: i32,
    last_stamp: Option<NaiveDateTime>,
    schema_calls: usize,
}

impl MemoryState {
    /// Strictly increasing timestamps, even when the clock has not advanced.
    fn next_stamp(&mut self) -> NaiveDateTime {
        let now = Utc::now().naive_utc();
        let stamp = match self.last_stamp {
            Some(prev) if now <= prev => prev + ChronoDuration::microseconds(1),
            _ => now,
        };
        self.last_stamp = Some(stamp);
        stamp
    }
}

impl MemoryRecordStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of `ensure_schema` calls seen so far.
    pub async fn schema_calls(&self) -> usize {
        self.state.lock().await.schema_calls
    }
}

#[async_trait]
impl RecordStore for MemoryRecordStore {
    async fn ensure_schema(&self) -> Result<(), StoreError> {
        self.state.lock().await.schema_calls += 1;
        Ok(())
    }

    async fn upsert(&self, record: &CampaignUpsert) -> Result<UpsertOutcome, StoreError> {
        validate_key(&record.name, &record.client)?;

        let mut state = self.state.lock().await;
        let stamp = state.next_stamp();
        if let Some(row) = state
            .rows
            .iter_mut()
            .find(|r| r.name == record.name && r.client == record.client)
        {
            row.status = record.status.clone();
            row.pdf_filename = record.pdf_filename.clone();
            row.notes = record.notes.clone();
            row.spec_url = record.spec_url.clone();
            row.last_updated = Some(stamp);
            return Ok(UpsertOutcome {
                id: row.id,
                created: false,
            });
        }

        state.last_id += 1;
        let id = state.last_id;
        state.rows.push(CampaignRecord {
            id,
            name: record.name.clone(),
            client: record.client.clone(),
            status: record.status.clone(),
            pdf_filename: record.pdf_filename.clone(),
            notes: record.notes.clone(),
            spec_url: record.spec_url.clone(),
            last_updated: Some(stamp),
        });
        Ok(UpsertOutcome { id, created: true })
    }

    fn list_all(&self) -> BoxStream<'_, Result<CampaignRecord, StoreError>> {
        stream::once(async move { self.state.lock().await.rows.clone() })
            .flat_map(|rows| stream::iter(rows.into_iter().map(Ok)))
            .boxed()
    }

    async fn get(&self, id: i32) -> Result<Option<CampaignRecord>, StoreError> {
        let state = self.state.lock().await;
        Ok(state.rows.iter().find(|r| r.id == id).cloned())
    }

    async fn find(&self, name: &str, client: &str) -> Result<Option<CampaignRecord>, StoreError> {
        let state = self.state.lock().await;
        Ok(state
            .rows
            .iter()
            .find(|r| r.name == name && r.client == client)
            .cloned())
    }

    async fn save_notes(
        &self,
        id: i32,
        notes: Option<&str>,
        edited_by: &str,
    ) -> Result<bool, StoreError> {
        let mut state = self.state.lock().await;
        let stamp = state.next_stamp();
        let Some(row) = state.rows.iter_mut().find(|r| r.id == id) else {
            return Ok(false);
        };
        row.notes = notes.map(ToString::to_string);
        row.last_updated = Some(stamp);
        state.history.push((
            id,
            NotesEdit {
                notes: notes.map(ToString::to_string),
                edited_by: edited_by.to_string(),
                edited_at: Some(stamp),
            },
        ));
        Ok(true)
    }

    async fn notes_history(&self, id: i32, limit: usize) -> Result<Vec<NotesEdit>, StoreError> {
        let state = self.state.lock().await;
        Ok(state
            .history
            .iter()
            .rev()
            .filter(|(campaign_id, _)| *campaign_id == id)
            .take(limit)
            .map(|(_, edit)| edit.clone())
            .collect())
    }

    async fn update(&self, id: i32, edit: &CampaignEdit) -> Result<bool, StoreError> {
        edit.validate()?;

        let mut state = self.state.lock().await;
        if !state.rows.iter().any(|r| r.id == id) {
            return Ok(false);
        }
        if let Some(other) = state
            .rows
            .iter()
            .find(|r| r.id != id && r.name == edit.name && r.client == edit.client)
        {
            return Err(StoreError::Conflict(format!(
                "campaign `{}` for client `{}` already exists (id {})",
                edit.name, edit.client, other.id
            )));
        }

        let stamp = state.next_stamp();
        let Some(row) = state.rows.iter_mut().find(|r| r.id == id) else {
            return Ok(false);
        };
        let notes_changed = row.notes != edit.notes;
        row.name = edit.name.clone();
        row.client = edit.client.clone();
        row.status = edit.status.clone();
        row.spec_url = edit.spec_url.clone();
        row.notes = edit.notes.clone();
        row.last_updated = Some(stamp);
        if notes_changed {
            state.history.push((
                id,
                NotesEdit {
                    notes: edit.notes.clone(),
                    edited_by: edit.edited_by.clone(),
                    edited_at: Some(stamp),
                },
            ));
        }
        Ok(true)
    }

    async fn add_spec_version(&self, version: &NewSpecVersion) -> Result<bool, StoreError> {
        let mut state = self.state.lock().await;
        if !state.rows.iter().any(|r| r.id == version.campaign_id) {
            return Ok(false);
        }
        if state
            .versions
            .iter()
            .any(|v| v.campaign_id == version.campaign_id && v.version == version.version)
        {
            return Err(StoreError::Conflict(format!(
                "version {} of campaign {} already exists",
                version.version, version.campaign_id
            )));
        }

        let stamp = state.next_stamp();
        state.versions.push(SpecVersion {
            campaign_id: version.campaign_id,
            version: version.version,
            filename: version.filename.clone(),
            uploaded_by: version.uploaded_by.clone(),
            uploaded_at: Some(stamp),
        });
        if let Some(row) = state.rows.iter_mut().find(|r| r.id == version.campaign_id) {
            row.pdf_filename = Some(version.filename.clone());
            row.last_updated = Some(stamp);
        }
        Ok(true)
    }

    async fn spec_versions(&self, id: i32) -> Result<Vec<SpecVersion>, StoreError> {
        let state = self.state.lock().await;
        let mut versions = state
            .versions
            .iter()
            .filter(|v| v.campaign_id == id)
            .cloned()
            .collect::<Vec<_>>();
        versions.sort_by(|a, b| b.version.cmp(&a.version));
        Ok(versions)
    }
}
