//! Core domain model for the campaign spec tracker.

use chrono::NaiveDateTime;
use serde::{Deserialize, Deserializer, Serialize};
use thiserror::Error;

pub const CRATE_NAME: &str = "cspec-core";

pub const DEFAULT_STATUS: &str = "draft";

/// A persisted row of the `campaign_specs` table.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CampaignRecord {
    pub id: i32,
    pub name: String,
    pub client: String,
    pub status: String,
    pub pdf_filename: Option<String>,
    pub notes: Option<String>,
    pub spec_url: Option<String>,
    /// UTC wall-clock time of the last create/modify, owned by the store.
    pub last_updated: Option<NaiveDateTime>,
}

/// One entry of a seed file: a campaign that should exist after seeding.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DesiredRecord {
    #[serde(default, deserialize_with = "null_as_empty")]
    pub name: String,
    #[serde(default, deserialize_with = "null_as_empty")]
    pub client: String,
    #[serde(default = "default_status")]
    pub status: String,
    #[serde(default)]
    pub notes: Option<String>,
    #[serde(default)]
    pub spec_url: Option<String>,
}

fn default_status() -> String {
    DEFAULT_STATUS.to_string()
}

// Missing or null key fields deserialize as empty so validation can skip the one entry.
fn null_as_empty<'de, D>(deserializer: D) -> Result<String, D::Error>
where
    D: Deserializer<'de>,
{
    Ok(Option::<String>::deserialize(deserializer)?.unwrap_or_default())
}

impl DesiredRecord {
    /// The spec URL, if one was supplied and is not blank.
    pub fn spec_url(&self) -> Option<&str> {
        self.spec_url
            .as_deref()
            .map(str::trim)
            .filter(|url| !url.is_empty())
    }
}

/// Insert-or-update request keyed on `(name, client)`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CampaignUpsert {
    pub name: String,
    pub client: String,
    pub status: String,
    pub pdf_filename: Option<String>,
    pub notes: Option<String>,
    pub spec_url: Option<String>,
}

impl CampaignUpsert {
    /// Builds an upsert from a seed entry with trimmed key fields and blank optionals dropped.
    pub fn from_desired(desired: &DesiredRecord, pdf_filename: Option<String>) -> Self {
        let status = desired.status.trim();
        Self {
            name: desired.name.trim().to_string(),
            client: desired.client.trim().to_string(),
            status: if status.is_empty() {
                DEFAULT_STATUS.to_string()
            } else {
                status.to_string()
            },
            pdf_filename,
            notes: non_blank(desired.notes.as_deref()),
            spec_url: desired.spec_url().map(ToString::to_string),
        }
    }

    pub fn validate(&self) -> Result<(), ValidationError> {
        validate_key(&self.name, &self.client)
    }
}

/// Rejects records whose natural key would be empty.
pub fn validate_key(name: &str, client: &str) -> Result<(), ValidationError> {
    if name.trim().is_empty() {
        return Err(ValidationError::EmptyName);
    }
    if client.trim().is_empty() {
        return Err(ValidationError::EmptyClient {
            name: name.trim().to_string(),
        });
    }
    Ok(())
}

pub fn non_blank(value: Option<&str>) -> Option<String> {
    value
        .map(str::trim)
        .filter(|v| !v.is_empty())
        .map(ToString::to_string)
}

/// Direct edit of an existing row, addressed by id.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CampaignEdit {
    pub name: String,
    pub client: String,
    pub status: String,
    pub spec_url: Option<String>,
    pub notes: Option<String>,
    /// Recorded in the notes history when the notes change.
    pub edited_by: String,
}

impl CampaignEdit {
    pub fn validate(&self) -> Result<(), ValidationError> {
        validate_key(&self.name, &self.client)
    }
}

/// An uploaded revision of a campaign's specification PDF.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SpecVersion {
    pub campaign_id: i32,
    pub version: i32,
    pub filename: String,
    pub uploaded_by: String,
    pub uploaded_at: Option<NaiveDateTime>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewSpecVersion {
    pub campaign_id: i32,
    pub version: i32,
    pub filename: String,
    pub uploaded_by: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct UpsertOutcome {
    pub id: i32,
    pub created: bool,
}

/// One entry of a campaign's notes edit history.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NotesEdit {
    pub notes: Option<String>,
    pub edited_by: String,
    pub edited_at: Option<NaiveDateTime>,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ValidationError {
    #[error("campaign name must not be empty")]
    EmptyName,
    #[error("client must not be empty (campaign `{name}`)")]
    EmptyClient { name: String },
    #[error("status `{status}` is not in the allowed set")]
    StatusNotAllowed { status: String },
}

/// Caller-side status policy. The store itself accepts any status text.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub enum StatusPolicy {
    #[default]
    Open,
    AllowList(Vec<String>),
}

impl StatusPolicy {
    /// Parses a comma-separated allow-list; a blank list means any status is accepted.
    pub fn from_list(list: &str) -> Self {
        let allowed = list
            .split(',')
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(ToString::to_string)
            .collect::<Vec<_>>();
        if allowed.is_empty() {
            Self::Open
        } else {
            Self::AllowList(allowed)
        }
    }

    pub fn check(&self, status: &str) -> Result<(), ValidationError> {
        match self {
            Self::Open => Ok(()),
            Self::AllowList(allowed) => {
                if allowed.iter().any(|a| a.eq_ignore_ascii_case(status.trim())) {
                    Ok(())
                } else {
                    Err(ValidationError::StatusNotAllowed {
                        status: status.to_string(),
                    })
                }
            }
        }
    }
}

/// Filesystem-safe slug for a campaign name.
pub fn spec_slug(name: &str) -> String {
    let mut slug = String::with_capacity(name.len());
    let mut pending_dash = false;
    for c in name.chars() {
        if c.is_ascii_alphanumeric() {
            if pending_dash && !slug.is_empty() {
                slug.push('-');
            }
            pending_dash = false;
            slug.push(c.to_ascii_lowercase());
        } else {
            pending_dash = true;
        }
    }
    if slug.is_empty() {
        "campaign".to_string()
    } else {
        slug
    }
}

/// Local PDF filename for a campaign name, before collision suffixing.
pub fn spec_filename(name: &str) -> String {
    format!("{}.pdf", spec_slug(name))
}

/// True for names of the form `spec_filename` produces, optionally with a `-N` suffix.
pub fn is_seed_filename(filename: &str) -> bool {
    filename.strip_suffix(".pdf").is_some_and(|stem| {
        !stem.is_empty()
            && stem
                .chars()
                .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '-')
    })
}

/// Filename for an uploaded revision. The embedded dots keep it apart from seed filenames.
pub fn spec_version_filename(name: &str, campaign_id: i32, version: i32) -> String {
    format!("{}.{campaign_id}.v{version}.pdf", spec_slug(name))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn slug_collapses_separators_and_lowercases() {
        assert_eq!(spec_slug("Acme Launch"), "acme-launch");
        assert_eq!(spec_slug("  Tort Experts LLC  "), "tort-experts-llc");
        assert_eq!(spec_slug("NIB -- Direct / 2024!"), "nib-direct-2024");
        assert_eq!(spec_filename("AffiMedia"), "affimedia.pdf");
    }

    #[test]
    fn slug_falls_back_for_names_without_ascii_alphanumerics() {
        assert_eq!(spec_slug("***"), "campaign");
        assert_eq!(spec_slug("Ünïcödé"), "n-c-d");
        assert_eq!(spec_filename(""), "campaign.pdf");
    }

    #[test]
    fn slug_is_deterministic() {
        assert_eq!(spec_filename("Acme Launch"), spec_filename("Acme Launch"));
    }

    #[test]
    fn empty_key_fields_are_rejected() {
        assert_eq!(validate_key("", "Acme Co"), Err(ValidationError::EmptyName));
        assert_eq!(
            validate_key("Acme Launch", "   "),
            Err(ValidationError::EmptyClient {
                name: "Acme Launch".into()
            })
        );
        assert!(validate_key("Acme Launch", "Acme Co").is_ok());
    }

    #[test]
    fn upsert_from_desired_trims_and_defaults() {
        let desired = DesiredRecord {
            name: " Acme Launch ".into(),
            client: "Acme Co".into(),
            status: "  ".into(),
            notes: Some("   ".into()),
            spec_url: Some(" https://example.test/spec.pdf ".into()),
        };
        let upsert = CampaignUpsert::from_desired(&desired, None);
        assert_eq!(upsert.name, "Acme Launch");
        assert_eq!(upsert.status, DEFAULT_STATUS);
        assert_eq!(upsert.notes, None);
        assert_eq!(upsert.spec_url.as_deref(), Some("https://example.test/spec.pdf"));
    }

    #[test]
    fn blank_spec_url_counts_as_absent() {
        let desired = DesiredRecord {
            name: "Acme Launch".into(),
            client: "Acme Co".into(),
            status: "draft".into(),
            notes: None,
            spec_url: Some("  ".into()),
        };
        assert_eq!(desired.spec_url(), None);
    }

    #[test]
    fn status_defaults_when_missing_from_seed_entry() {
        let desired: DesiredRecord =
            serde_yaml::from_str("name: Acme Launch\nclient: Acme Co\n").unwrap();
        assert_eq!(desired.status, DEFAULT_STATUS);
        assert_eq!(desired.spec_url, None);
    }

    #[test]
    fn missing_or_null_key_fields_deserialize_as_empty() {
        let desired: DesiredRecord = serde_yaml::from_str("name: Acme Launch\n").unwrap();
        assert_eq!(desired.client, "");
        let desired: DesiredRecord = serde_yaml::from_str("name: ~\nclient: Acme Co\n").unwrap();
        assert_eq!(desired.name, "");
        assert_eq!(
            CampaignUpsert::from_desired(&desired, None).validate(),
            Err(ValidationError::EmptyName)
        );
    }

    #[test]
    fn version_filenames_never_look_like_seed_filenames() {
        assert!(is_seed_filename("acme-launch.pdf"));
        assert!(is_seed_filename("acme-launch-2.pdf"));
        assert!(!is_seed_filename("Acme Launch.pdf"));
        let uploaded = spec_version_filename("Acme Launch", 7, 3);
        assert_eq!(uploaded, "acme-launch.7.v3.pdf");
        assert!(!is_seed_filename(&uploaded));
    }

    #[test]
    fn status_policy_allow_list_is_case_insensitive() {
        let policy = StatusPolicy::from_list("Active, draft ,");
        assert!(policy.check("active").is_ok());
        assert!(policy.check("Draft").is_ok());
        assert_eq!(
            policy.check("archived"),
            Err(ValidationError::StatusNotAllowed {
                status: "archived".into()
            })
        );
        assert_eq!(StatusPolicy::from_list(" , "), StatusPolicy::Open);
        assert!(StatusPolicy::Open.check("anything").is_ok());
    }
}
