//! Next-state computation for derived entities.
//!
//! Merging only ever grows or fills in: a stored value is never blanked by
//! an emptier draft, and a client's related process set never shrinks.

use chrono::{DateTime, Utc};
use lpi_core::{Client, ClientDraft, Process, ProcessDraft, DEFAULT_PROCESS_STATUS};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MergeOutcome {
    Created,
    Updated,
    Unchanged,
}

impl MergeOutcome {
    /// Whether the next state has to be written.
    pub fn changed(self) -> bool {
        !matches!(self, Self::Unchanged)
    }
}

fn overwrite_text(slot: &mut String, value: &str) -> bool {
    let value = value.trim();
    if value.is_empty() || slot == value {
        return false;
    }
    *slot = value.to_string();
    true
}

fn overwrite_opt<T: PartialEq + Copy>(slot: &mut Option<T>, value: Option<T>) -> bool {
    match value {
        Some(v) if *slot != Some(v) => {
            *slot = Some(v);
            true
        }
        _ => false,
    }
}

fn fill_text(slot: &mut String, value: &str) -> bool {
    let value = value.trim();
    if !slot.trim().is_empty() || value.is_empty() {
        return false;
    }
    *slot = value.to_string();
    true
}

pub fn merge_process(
    existing: Option<Process>,
    draft: &ProcessDraft,
    now: DateTime<Utc>,
) -> (Process, MergeOutcome) {
    let Some(mut next) = existing else {
        let status = if draft.status.trim().is_empty() {
            DEFAULT_PROCESS_STATUS.to_string()
        } else {
            draft.status.trim().to_string()
        };
        let created = Process {
            owner_id: draft.owner_id.clone(),
            cnj_number: draft.cnj_number.clone(),
            process_number_display: draft.process_number_display.clone(),
            tribunal: draft.tribunal.clone(),
            classe: draft.classe.clone(),
            assunto: draft.assunto.clone(),
            cause_value: draft.cause_value,
            distribution_date: draft.distribution_date,
            vara: draft.vara.clone(),
            parties: draft.parties.clone(),
            last_movement: draft.last_movement.clone(),
            last_movement_date: draft.last_movement_date,
            status,
            created_at: now,
            updated_at: now,
        };
        return (created, MergeOutcome::Created);
    };

    // Non-short-circuiting `|` so every field is visited.
    let changed = overwrite_text(&mut next.process_number_display, &draft.process_number_display)
        | overwrite_text(&mut next.tribunal, &draft.tribunal)
        | overwrite_text(&mut next.classe, &draft.classe)
        | overwrite_text(&mut next.assunto, &draft.assunto)
        | overwrite_opt(&mut next.cause_value, draft.cause_value)
        | overwrite_opt(&mut next.distribution_date, draft.distribution_date)
        | overwrite_text(&mut next.vara, &draft.vara)
        | overwrite_text(&mut next.parties, &draft.parties)
        | overwrite_text(&mut next.last_movement, &draft.last_movement)
        | overwrite_opt(&mut next.last_movement_date, draft.last_movement_date)
        | overwrite_text(&mut next.status, &draft.status);

    if changed {
        next.updated_at = now;
        (next, MergeOutcome::Updated)
    } else {
        (next, MergeOutcome::Unchanged)
    }
}

pub fn merge_client(
    existing: Option<Client>,
    draft: &ClientDraft,
    now: DateTime<Utc>,
) -> (Client, MergeOutcome) {
    let Some(mut next) = existing else {
        let created = Client {
            owner_id: draft.owner_id.clone(),
            document: draft.document.clone(),
            name: draft.name.clone(),
            person_type: draft.person_type,
            email: draft.email.clone(),
            phone: draft.phone.clone(),
            address: draft.address.clone(),
            related_process_ids: draft.related_process_ids.clone(),
            created_at: now,
            updated_at: now,
        };
        return (created, MergeOutcome::Created);
    };

    let before = next.related_process_ids.len();
    next.related_process_ids
        .extend(draft.related_process_ids.iter().cloned());
    let grew = next.related_process_ids.len() > before;

    let filled = fill_text(&mut next.name, &draft.name)
        | fill_text(&mut next.email, &draft.email)
        | fill_text(&mut next.phone, &draft.phone)
        | fill_text(&mut next.address, &draft.address);

    if grew || filled {
        next.updated_at = now;
        (next, MergeOutcome::Updated)
    } else {
        (next, MergeOutcome::Unchanged)
    }
}
