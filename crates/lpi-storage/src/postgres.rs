//! Postgres-backed [`Store`].

use std::sync::Arc;

use async_trait::async_trait;
use lpi_core::{Client, EntityKey, PersonType, Process, Publication, PublicationStatus};
use sqlx::postgres::{PgPool, PgPoolOptions, PgRow};
use sqlx::types::Json;
use sqlx::Row;
use tracing::info;
use uuid::Uuid;

use crate::{KeyGuard, KeyLocks, Store, StoreError, UpsertOutcome};

const PUBLICATION_COLUMNS: &str = "id, owner_id, identity_key, external_id, process_number_raw, \
     tribunal, organ, class_name, publication_date, content, movement_type, recipients, \
     mentioned_lawyers, deadline_days, urgent, link, status, fetched_at";

const PROCESS_COLUMNS: &str = "owner_id, cnj_number, process_number_display, tribunal, classe, \
     assunto, cause_value, distribution_date, vara, parties, last_movement, last_movement_date, \
     status, created_at, updated_at";

const CLIENT_COLUMNS: &str = "owner_id, document, name, person_type, email, phone, address, \
     related_process_ids, created_at, updated_at";

/// Postgres store. Key locks are process-local and shared by every clone;
/// client writes stay monotonic across processes through the upsert itself.
#[derive(Debug, Clone)]
pub struct PgStore {
    pool: PgPool,
    locks: Arc<KeyLocks>,
}

impl PgStore {
    pub async fn connect(database_url: &str) -> Result<Self, StoreError> {
        let pool = PgPoolOptions::new()
            .max_connections(10)
            .connect(database_url)
            .await?;
        Ok(Self::from_pool(pool))
    }

    pub fn from_pool(pool: PgPool) -> Self {
        Self {
            pool,
            locks: Arc::new(KeyLocks::new()),
        }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    pub async fn migrate(&self) -> Result<(), StoreError> {
        sqlx::migrate!("../../migrations").run(&self.pool).await?;
        info!("database migrations applied");
        Ok(())
    }
}

fn corrupt(column: &'static str, value: impl Into<String>) -> StoreError {
    StoreError::Corrupt {
        column,
        value: value.into(),
    }
}

fn publication_from_row(row: &PgRow) -> Result<Publication, StoreError> {
    let status: String = row.try_get("status")?;
    let status =
        PublicationStatus::parse(&status).ok_or_else(|| corrupt("publications.status", &status))?;
    let Json(recipients): Json<Vec<String>> = row.try_get("recipients")?;
    let Json(mentioned_lawyers): Json<Vec<String>> = row.try_get("mentioned_lawyers")?;
    let deadline_days: Option<i64> = row.try_get("deadline_days")?;
    let deadline_days = deadline_days
        .map(|d| u32::try_from(d).map_err(|_| corrupt("publications.deadline_days", d.to_string())))
        .transpose()?;

    Ok(Publication {
        id: row.try_get("id")?,
        owner_id: row.try_get("owner_id")?,
        identity_key: row.try_get("identity_key")?,
        external_id: row.try_get("external_id")?,
        process_number_raw: row.try_get("process_number_raw")?,
        tribunal: row.try_get("tribunal")?,
        organ: row.try_get("organ")?,
        class_name: row.try_get("class_name")?,
        publication_date: row.try_get("publication_date")?,
        content: row.try_get("content")?,
        movement_type: row.try_get("movement_type")?,
        recipients,
        mentioned_lawyers,
        deadline_days,
        urgent: row.try_get("urgent")?,
        link: row.try_get("link")?,
        status,
        fetched_at: row.try_get("fetched_at")?,
    })
}

fn process_from_row(row: &PgRow) -> Result<Process, StoreError> {
    Ok(Process {
        owner_id: row.try_get("owner_id")?,
        cnj_number: row.try_get("cnj_number")?,
        process_number_display: row.try_get("process_number_display")?,
        tribunal: row.try_get("tribunal")?,
        classe: row.try_get("classe")?,
        assunto: row.try_get("assunto")?,
        cause_value: row.try_get("cause_value")?,
        distribution_date: row.try_get("distribution_date")?,
        vara: row.try_get("vara")?,
        parties: row.try_get("parties")?,
        last_movement: row.try_get("last_movement")?,
        last_movement_date: row.try_get("last_movement_date")?,
        status: row.try_get("status")?,
        created_at: row.try_get("created_at")?,
        updated_at: row.try_get("updated_at")?,
    })
}

fn client_from_row(row: &PgRow) -> Result<Client, StoreError> {
    let person_type: String = row.try_get("person_type")?;
    let person_type =
        PersonType::parse(&person_type).ok_or_else(|| corrupt("clients.person_type", &person_type))?;
    let related: Vec<String> = row.try_get("related_process_ids")?;
    Ok(Client {
        owner_id: row.try_get("owner_id")?,
        document: row.try_get("document")?,
        name: row.try_get("name")?,
        person_type,
        email: row.try_get("email")?,
        phone: row.try_get("phone")?,
        address: row.try_get("address")?,
        related_process_ids: related.into_iter().collect(),
        created_at: row.try_get("created_at")?,
        updated_at: row.try_get("updated_at")?,
    })
}

#[async_trait]
impl Store for PgStore {
    async fn upsert_publication(
        &self,
        publication: &Publication,
    ) -> Result<UpsertOutcome, StoreError> {
        // The WHERE on DO UPDATE turns an identical re-fetch into a no-op row;
        // xmax = 0 distinguishes a fresh insert from an overwrite.
        let row = sqlx::query(
            r#"
            INSERT INTO publications (
                id, owner_id, identity_key, external_id, process_number_raw, tribunal, organ,
                class_name, publication_date, content, movement_type, recipients,
                mentioned_lawyers, deadline_days, urgent, link, payload_hash, status, fetched_at
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15, $16, $17, $18, $19)
            ON CONFLICT (owner_id, identity_key) DO UPDATE SET
                external_id = EXCLUDED.external_id,
                process_number_raw = EXCLUDED.process_number_raw,
                tribunal = EXCLUDED.tribunal,
                organ = EXCLUDED.organ,
                class_name = EXCLUDED.class_name,
                publication_date = EXCLUDED.publication_date,
                content = EXCLUDED.content,
                movement_type = EXCLUDED.movement_type,
                recipients = EXCLUDED.recipients,
                mentioned_lawyers = EXCLUDED.mentioned_lawyers,
                deadline_days = EXCLUDED.deadline_days,
                urgent = EXCLUDED.urgent,
                link = EXCLUDED.link,
                payload_hash = EXCLUDED.payload_hash,
                fetched_at = EXCLUDED.fetched_at,
                status = CASE WHEN publications.status = 'read' THEN 'read' ELSE 'new' END
            WHERE publications.payload_hash <> EXCLUDED.payload_hash
            RETURNING (xmax = 0) AS inserted
            "#,
        )
        .bind(publication.id)
        .bind(&publication.owner_id)
        .bind(&publication.identity_key)
        .bind(&publication.external_id)
        .bind(&publication.process_number_raw)
        .bind(&publication.tribunal)
        .bind(&publication.organ)
        .bind(&publication.class_name)
        .bind(publication.publication_date)
        .bind(&publication.content)
        .bind(&publication.movement_type)
        .bind(Json(&publication.recipients))
        .bind(Json(&publication.mentioned_lawyers))
        .bind(publication.deadline_days.map(i64::from))
        .bind(publication.urgent)
        .bind(&publication.link)
        .bind(publication.payload_hash())
        .bind(publication.status.as_str())
        .bind(publication.fetched_at)
        .fetch_optional(&self.pool)
        .await?;

        let Some(row) = row else {
            return Ok(UpsertOutcome::Unchanged);
        };
        let inserted: bool = row.try_get("inserted")?;
        Ok(if inserted {
            UpsertOutcome::Inserted
        } else {
            UpsertOutcome::Updated
        })
    }

    async fn get_publications(
        &self,
        owner_id: &str,
        ids: &[Uuid],
    ) -> Result<Vec<Publication>, StoreError> {
        let sql = format!(
            "SELECT {PUBLICATION_COLUMNS} FROM publications WHERE owner_id = $1 AND id = ANY($2)"
        );
        let rows = sqlx::query(&sql)
            .bind(owner_id)
            .bind(ids)
            .fetch_all(&self.pool)
            .await?;
        rows.iter().map(publication_from_row).collect()
    }

    async fn list_publications(&self, owner_id: &str) -> Result<Vec<Publication>, StoreError> {
        let sql = format!(
            "SELECT {PUBLICATION_COLUMNS} FROM publications WHERE owner_id = $1 \
             ORDER BY publication_date DESC, identity_key"
        );
        let rows = sqlx::query(&sql)
            .bind(owner_id)
            .fetch_all(&self.pool)
            .await?;
        rows.iter().map(publication_from_row).collect()
    }

    async fn mark_publications_processed(
        &self,
        owner_id: &str,
        ids: &[Uuid],
    ) -> Result<usize, StoreError> {
        let result = sqlx::query(
            "UPDATE publications SET status = 'processed' \
             WHERE owner_id = $1 AND id = ANY($2) AND status = 'new'",
        )
        .bind(owner_id)
        .bind(ids)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() as usize)
    }

    async fn mark_publication_read(&self, owner_id: &str, id: Uuid) -> Result<bool, StoreError> {
        let result =
            sqlx::query("UPDATE publications SET status = 'read' WHERE owner_id = $1 AND id = $2")
                .bind(owner_id)
                .bind(id)
                .execute(&self.pool)
                .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn find_process(
        &self,
        owner_id: &str,
        cnj_number: &str,
    ) -> Result<Option<Process>, StoreError> {
        let sql = format!(
            "SELECT {PROCESS_COLUMNS} FROM processes WHERE owner_id = $1 AND cnj_number = $2"
        );
        let row = sqlx::query(&sql)
            .bind(owner_id)
            .bind(cnj_number)
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(process_from_row).transpose()
    }

    async fn save_process(&self, process: &Process) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            INSERT INTO processes (
                owner_id, cnj_number, process_number_display, tribunal, classe, assunto,
                cause_value, distribution_date, vara, parties, last_movement, last_movement_date,
                status, created_at, updated_at
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15)
            ON CONFLICT (owner_id, cnj_number) DO UPDATE SET
                process_number_display = EXCLUDED.process_number_display,
                tribunal = EXCLUDED.tribunal,
                classe = EXCLUDED.classe,
                assunto = EXCLUDED.assunto,
                cause_value = EXCLUDED.cause_value,
                distribution_date = EXCLUDED.distribution_date,
                vara = EXCLUDED.vara,
                parties = EXCLUDED.parties,
                last_movement = EXCLUDED.last_movement,
                last_movement_date = EXCLUDED.last_movement_date,
                status = EXCLUDED.status,
                updated_at = EXCLUDED.updated_at
            "#,
        )
        .bind(&process.owner_id)
        .bind(&process.cnj_number)
        .bind(&process.process_number_display)
        .bind(&process.tribunal)
        .bind(&process.classe)
        .bind(&process.assunto)
        .bind(process.cause_value)
        .bind(process.distribution_date)
        .bind(&process.vara)
        .bind(&process.parties)
        .bind(&process.last_movement)
        .bind(process.last_movement_date)
        .bind(&process.status)
        .bind(process.created_at)
        .bind(process.updated_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn list_processes(&self, owner_id: &str) -> Result<Vec<Process>, StoreError> {
        let sql =
            format!("SELECT {PROCESS_COLUMNS} FROM processes WHERE owner_id = $1 ORDER BY cnj_number");
        let rows = sqlx::query(&sql)
            .bind(owner_id)
            .fetch_all(&self.pool)
            .await?;
        rows.iter().map(process_from_row).collect()
    }

    async fn find_client(
        &self,
        owner_id: &str,
        document: &str,
    ) -> Result<Option<Client>, StoreError> {
        let sql =
            format!("SELECT {CLIENT_COLUMNS} FROM clients WHERE owner_id = $1 AND document = $2");
        let row = sqlx::query(&sql)
            .bind(owner_id)
            .bind(document)
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(client_from_row).transpose()
    }

    /// The conflict arm repeats the merge rules in SQL, so writers that do not
    /// share this process's key locks still only fill in and grow the row.
    async fn save_client(&self, client: &Client) -> Result<(), StoreError> {
        let related = client
            .related_process_ids
            .iter()
            .cloned()
            .collect::<Vec<_>>();
        sqlx::query(
            r#"
            INSERT INTO clients (
                owner_id, document, name, person_type, email, phone, address,
                related_process_ids, created_at, updated_at
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10)
            ON CONFLICT (owner_id, document) DO UPDATE SET
                name = COALESCE(NULLIF(clients.name, ''), EXCLUDED.name),
                email = COALESCE(NULLIF(clients.email, ''), EXCLUDED.email),
                phone = COALESCE(NULLIF(clients.phone, ''), EXCLUDED.phone),
                address = COALESCE(NULLIF(clients.address, ''), EXCLUDED.address),
                related_process_ids = ARRAY(
                    SELECT DISTINCT key
                    FROM unnest(clients.related_process_ids || EXCLUDED.related_process_ids) AS key
                    ORDER BY key
                ),
                updated_at = GREATEST(clients.updated_at, EXCLUDED.updated_at)
            "#,
        )
        .bind(&client.owner_id)
        .bind(&client.document)
        .bind(&client.name)
        .bind(client.person_type.as_str())
        .bind(&client.email)
        .bind(&client.phone)
        .bind(&client.address)
        .bind(&related)
        .bind(client.created_at)
        .bind(client.updated_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn list_clients(&self, owner_id: &str) -> Result<Vec<Client>, StoreError> {
        let sql =
            format!("SELECT {CLIENT_COLUMNS} FROM clients WHERE owner_id = $1 ORDER BY document");
        let rows = sqlx::query(&sql)
            .bind(owner_id)
            .fetch_all(&self.pool)
            .await?;
        rows.iter().map(client_from_row).collect()
    }

    async fn lock_key(&self, key: EntityKey) -> KeyGuard {
        self.locks.acquire(key).await
    }
}
