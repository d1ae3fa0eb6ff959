//! Owner-scoped natural-key lookups ahead of a merge.

use lpi_core::{Client, ClientDraft, Process, ProcessDraft};
use lpi_storage::{Store, StoreError};

/// Existing row for a draft's natural key, if any.
#[derive(Debug, Clone, PartialEq)]
pub enum Resolution<T> {
    NotFound,
    Existing(T),
}

impl<T> Resolution<T> {
    pub fn into_existing(self) -> Option<T> {
        match self {
            Self::NotFound => None,
            Self::Existing(row) => Some(row),
        }
    }
}

impl<T> From<Option<T>> for Resolution<T> {
    fn from(row: Option<T>) -> Self {
        row.map_or(Self::NotFound, Self::Existing)
    }
}

pub async fn resolve_process(
    store: &dyn Store,
    draft: &ProcessDraft,
) -> Result<Resolution<Process>, StoreError> {
    Ok(store
        .find_process(&draft.owner_id, &draft.cnj_number)
        .await?
        .into())
}

pub async fn resolve_client(
    store: &dyn Store,
    draft: &ClientDraft,
) -> Result<Resolution<Client>, StoreError> {
    Ok(store
        .find_client(&draft.owner_id, &draft.document)
        .await?
        .into())
}
