//! Core domain model for LPI: raw court publications and the process/client
//! records derived from them.

pub mod normalize;

use std::collections::BTreeSet;
use std::fmt;

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use uuid::Uuid;

pub use normalize::{
    format_cnj, normalize_document, normalize_process_number, person_type_for,
    MIN_DOCUMENT_DIGITS,
};

pub const CRATE_NAME: &str = "lpi-core";

/// Status assigned to processes the first time they are derived.
pub const DEFAULT_PROCESS_STATUS: &str = "active";

pub fn sha256_hex(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    hex::encode(hasher.finalize())
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PublicationStatus {
    #[default]
    New,
    Read,
    Processed,
}

impl PublicationStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::New => "new",
            Self::Read => "read",
            Self::Processed => "processed",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "new" => Some(Self::New),
            "read" => Some(Self::Read),
            "processed" => Some(Self::Processed),
            _ => None,
        }
    }

    /// The pipeline only ever moves `New -> Processed`; a human `Read` sticks.
    pub fn can_mark_processed(self) -> bool {
        matches!(self, Self::New)
    }
}

/// Publication record as returned by the feed, before tenant scoping.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RawPublication {
    pub external_id: Option<String>,
    pub process_number_raw: String,
    pub tribunal: String,
    /// Issuing court division, when the feed reports it.
    #[serde(default)]
    pub organ: String,
    /// Procedural class name, when the feed reports it.
    #[serde(default)]
    pub class_name: String,
    pub publication_date: NaiveDate,
    pub content: String,
    #[serde(default)]
    pub movement_type: String,
    #[serde(default)]
    pub recipients: Vec<String>,
    #[serde(default)]
    pub mentioned_lawyers: Vec<String>,
    #[serde(default)]
    pub deadline_days: Option<u32>,
    #[serde(default)]
    pub urgent: bool,
    #[serde(default)]
    pub link: Option<String>,
}

impl RawPublication {
    pub fn identity(&self) -> PublicationIdentity {
        match self.external_id.as_deref().map(str::trim) {
            Some(id) if !id.is_empty() => PublicationIdentity::External(id.to_string()),
            _ => PublicationIdentity::Fingerprint {
                process_number: self.process_number_raw.trim().to_string(),
                publication_date: self.publication_date,
                content_sha256: sha256_hex(self.content.as_bytes()),
            },
        }
    }

    pub fn into_publication(self, owner_id: &str, fetched_at: DateTime<Utc>) -> Publication {
        let identity_key = self.identity().key();
        Publication {
            id: publication_id(owner_id, &identity_key),
            owner_id: owner_id.to_string(),
            identity_key,
            external_id: self.external_id.filter(|id| !id.trim().is_empty()),
            process_number_raw: self.process_number_raw,
            tribunal: self.tribunal,
            organ: self.organ,
            class_name: self.class_name,
            publication_date: self.publication_date,
            content: self.content,
            movement_type: self.movement_type,
            recipients: self.recipients,
            mentioned_lawyers: self.mentioned_lawyers,
            deadline_days: self.deadline_days,
            urgent: self.urgent,
            link: self.link,
            status: PublicationStatus::New,
            fetched_at,
        }
    }
}

/// Owner-scoped identity of a raw publication.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum PublicationIdentity {
    External(String),
    Fingerprint {
        process_number: String,
        publication_date: NaiveDate,
        content_sha256: String,
    },
}

impl PublicationIdentity {
    pub fn key(&self) -> String {
        match self {
            Self::External(id) => format!("ext:{id}"),
            Self::Fingerprint {
                process_number,
                publication_date,
                content_sha256,
            } => format!("fp:{process_number}:{publication_date}:{content_sha256}"),
        }
    }
}

/// Deterministic surrogate id, stable across re-fetches of the same record.
pub fn publication_id(owner_id: &str, identity_key: &str) -> Uuid {
    let source = format!("lpi:publication:{owner_id}:{identity_key}");
    Uuid::new_v5(&Uuid::NAMESPACE_URL, source.as_bytes())
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Publication {
    pub id: Uuid,
    pub owner_id: String,
    pub identity_key: String,
    pub external_id: Option<String>,
    pub process_number_raw: String,
    pub tribunal: String,
    pub organ: String,
    pub class_name: String,
    pub publication_date: NaiveDate,
    pub content: String,
    pub movement_type: String,
    pub recipients: Vec<String>,
    pub mentioned_lawyers: Vec<String>,
    pub deadline_days: Option<u32>,
    pub urgent: bool,
    pub link: Option<String>,
    pub status: PublicationStatus,
    pub fetched_at: DateTime<Utc>,
}

impl Publication {
    /// Hash over the feed-supplied payload; status and fetch time excluded.
    pub fn payload_hash(&self) -> String {
        let deadline = self
            .deadline_days
            .map(|d| d.to_string())
            .unwrap_or_default();
        let parts: [&str; 12] = [
            self.process_number_raw.as_str(),
            self.tribunal.as_str(),
            self.organ.as_str(),
            self.class_name.as_str(),
            &self.publication_date.to_string(),
            self.content.as_str(),
            self.movement_type.as_str(),
            &self.recipients.join("\u{1e}"),
            &self.mentioned_lawyers.join("\u{1e}"),
            &deadline,
            if self.urgent { "1" } else { "0" },
            self.link.as_deref().unwrap_or_default(),
        ];
        sha256_hex(parts.join("\u{1f}").as_bytes())
    }

    pub fn process_key(&self) -> String {
        normalize_process_number(&self.process_number_raw)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PersonType {
    Individual,
    Legal,
}

impl PersonType {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Individual => "individual",
            Self::Legal => "legal",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "individual" => Some(Self::Individual),
            "legal" => Some(Self::Legal),
            _ => None,
        }
    }
}

/// Process synthesized from one group of publications sharing a CNJ number.
///
/// Empty strings and `None` mean "not known from this batch".
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProcessDraft {
    pub owner_id: String,
    pub cnj_number: String,
    pub process_number_display: String,
    pub tribunal: String,
    pub classe: String,
    pub assunto: String,
    pub cause_value: Option<f64>,
    pub distribution_date: Option<NaiveDate>,
    pub vara: String,
    pub parties: String,
    pub last_movement: String,
    pub last_movement_date: Option<NaiveDate>,
    pub status: String,
    /// Publications this draft was derived from.
    pub source_publication_ids: Vec<Uuid>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Process {
    pub owner_id: String,
    pub cnj_number: String,
    pub process_number_display: String,
    pub tribunal: String,
    pub classe: String,
    pub assunto: String,
    pub cause_value: Option<f64>,
    pub distribution_date: Option<NaiveDate>,
    pub vara: String,
    pub parties: String,
    pub last_movement: String,
    pub last_movement_date: Option<NaiveDate>,
    pub status: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClientDraft {
    pub owner_id: String,
    pub document: String,
    pub name: String,
    pub person_type: PersonType,
    pub email: String,
    pub phone: String,
    pub address: String,
    pub related_process_ids: BTreeSet<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Client {
    pub owner_id: String,
    pub document: String,
    pub name: String,
    pub person_type: PersonType,
    pub email: String,
    pub phone: String,
    pub address: String,
    pub related_process_ids: BTreeSet<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntityKind {
    Process,
    Client,
}

/// Owner-scoped natural key of a derived entity.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct EntityKey {
    pub owner_id: String,
    pub kind: EntityKind,
    pub natural_key: String,
}

impl EntityKey {
    pub fn process(owner_id: &str, cnj_number: &str) -> Self {
        Self {
            owner_id: owner_id.to_string(),
            kind: EntityKind::Process,
            natural_key: cnj_number.to_string(),
        }
    }

    pub fn client(owner_id: &str, document: &str) -> Self {
        Self {
            owner_id: owner_id.to_string(),
            kind: EntityKind::Client,
            natural_key: document.to_string(),
        }
    }
}

impl fmt::Display for EntityKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let kind = match self.kind {
            EntityKind::Process => "process",
            EntityKind::Client => "client",
        };
        write!(f, "{kind}:{}", self.natural_key)
    }
}
