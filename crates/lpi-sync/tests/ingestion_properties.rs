use std::collections::BTreeSet;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::NaiveDate;
use lpi_adapters::{FeedError, PublicationFeed, StaticFeed};
use lpi_core::{Client, EntityKey, Process, Publication, PublicationStatus, RawPublication};
use lpi_storage::{InMemoryStore, KeyGuard, Store, StoreError, UpsertOutcome};
use lpi_sync::{IngestionError, IngestionRequest, IngestionRunner, RunOptions};
use uuid::Uuid;

const CNJ: &str = "1234567-89.2024.8.26.0001";
const CNJ_KEY: &str = "12345678920248260001";

fn raw(external_id: &str, number: &str, day: u32, content: &str) -> RawPublication {
    RawPublication {
        external_id: Some(external_id.to_string()),
        process_number_raw: number.to_string(),
        tribunal: "TJSP".into(),
        organ: String::new(),
        class_name: String::new(),
        publication_date: NaiveDate::from_ymd_opt(2024, 1, day).unwrap(),
        content: content.to_string(),
        movement_type: "Intimação".into(),
        recipients: vec![],
        mentioned_lawyers: vec![],
        deadline_days: None,
        urgent: false,
        link: None,
    }
}

fn request(owner_id: &str) -> IngestionRequest {
    IngestionRequest {
        owner_id: owner_id.to_string(),
        oab_number: "123456".into(),
        oab_state: "SP".into(),
        date_from: NaiveDate::from_ymd_opt(2024, 1, 1).unwrap(),
        date_to: NaiveDate::from_ymd_opt(2024, 1, 31).unwrap(),
    }
}

fn runner(publications: Vec<RawPublication>, store: Arc<dyn Store>) -> IngestionRunner {
    IngestionRunner::new(Arc::new(StaticFeed::new(publications)), store)
}

async fn publication_status(store: &dyn Store, owner_id: &str, id: Uuid) -> PublicationStatus {
    store.get_publications(owner_id, &[id]).await.unwrap()[0].status
}

/// Delegates to [`InMemoryStore`] with injectable failures and latency.
#[derive(Debug, Default)]
struct FlakyStore {
    inner: InMemoryStore,
    fail_process_save_call: Option<usize>,
    fail_upsert_identity: Option<String>,
    /// Widens the gap between reading a client and writing it back.
    find_client_delay: Option<Duration>,
    process_saves: AtomicUsize,
}

#[async_trait]
impl Store for FlakyStore {
    async fn upsert_publication(
        &self,
        publication: &Publication,
    ) -> Result<UpsertOutcome, StoreError> {
        if self.fail_upsert_identity.as_deref() == Some(publication.identity_key.as_str()) {
            return Err(StoreError::Backend("injected upsert failure".into()));
        }
        self.inner.upsert_publication(publication).await
    }

    async fn get_publications(
        &self,
        owner_id: &str,
        ids: &[Uuid],
    ) -> Result<Vec<Publication>, StoreError> {
        self.inner.get_publications(owner_id, ids).await
    }

    async fn list_publications(&self, owner_id: &str) -> Result<Vec<Publication>, StoreError> {
        self.inner.list_publications(owner_id).await
    }

    async fn mark_publications_processed(
        &self,
        owner_id: &str,
        ids: &[Uuid],
    ) -> Result<usize, StoreError> {
        self.inner.mark_publications_processed(owner_id, ids).await
    }

    async fn mark_publication_read(&self, owner_id: &str, id: Uuid) -> Result<bool, StoreError> {
        self.inner.mark_publication_read(owner_id, id).await
    }

    async fn find_process(
        &self,
        owner_id: &str,
        cnj_number: &str,
    ) -> Result<Option<Process>, StoreError> {
        self.inner.find_process(owner_id, cnj_number).await
    }

    async fn save_process(&self, process: &Process) -> Result<(), StoreError> {
        let call = self.process_saves.fetch_add(1, Ordering::SeqCst) + 1;
        if self.fail_process_save_call == Some(call) {
            return Err(StoreError::Backend(format!("injected failure on save #{call}")));
        }
        self.inner.save_process(process).await
    }

    async fn list_processes(&self, owner_id: &str) -> Result<Vec<Process>, StoreError> {
        self.inner.list_processes(owner_id).await
    }

    async fn find_client(
        &self,
        owner_id: &str,
        document: &str,
    ) -> Result<Option<Client>, StoreError> {
        let found = self.inner.find_client(owner_id, document).await;
        if let Some(delay) = self.find_client_delay {
            tokio::time::sleep(delay).await;
        }
        found
    }

    async fn save_client(&self, client: &Client) -> Result<(), StoreError> {
        self.inner.save_client(client).await
    }

    async fn list_clients(&self, owner_id: &str) -> Result<Vec<Client>, StoreError> {
        self.inner.list_clients(owner_id).await
    }

    async fn lock_key(&self, key: EntityKey) -> KeyGuard {
        self.inner.lock_key(key).await
    }
}

#[tokio::test]
async fn end_to_end_single_publication_yields_process_and_client() {
    let store: Arc<dyn Store> = Arc::new(InMemoryStore::new());
    let runner = runner(
        vec![raw("p1", CNJ, 10, "... CPF 123.456.789-01 ...")],
        store.clone(),
    );

    let report = runner.run_ingestion(&request("owner-a")).await.unwrap();
    assert!(report.is_clean(), "{:?}", report.errors);
    assert_eq!(report.publications_fetched, 1);
    assert_eq!(report.publications_inserted, 1);
    assert_eq!(report.processes_created, 1);
    assert_eq!(report.clients_created, 1);
    assert_eq!(report.publications_marked_processed, 1);

    let processes = store.list_processes("owner-a").await.unwrap();
    assert_eq!(processes.len(), 1);
    assert_eq!(processes[0].cnj_number, CNJ_KEY);
    assert_eq!(processes[0].process_number_display, CNJ);
    assert_eq!(processes[0].status, "active");

    let clients = store.list_clients("owner-a").await.unwrap();
    assert_eq!(clients.len(), 1);
    assert_eq!(clients[0].document, "12345678901");
    assert_eq!(
        clients[0].related_process_ids,
        BTreeSet::from([CNJ_KEY.to_string()])
    );

    let publications = store.list_publications("owner-a").await.unwrap();
    assert_eq!(publications[0].status, PublicationStatus::Processed);
}

#[tokio::test]
async fn repeated_identical_runs_create_nothing_new() {
    let store: Arc<dyn Store> = Arc::new(InMemoryStore::new());
    let feed = vec![
        raw("p1", CNJ, 10, "AUTOR: MARIA SOUZA, CPF 123.456.789-01"),
        raw("p2", "7654321-00.2023.8.26.0100", 11, "Réu: JOÃO LIMA, CPF 987.654.321-00"),
    ];
    let runner = runner(feed, store.clone());

    let first = runner.run_ingestion(&request("owner-a")).await.unwrap();
    assert_eq!((first.processes_created, first.clients_created), (2, 2));

    let second = runner.run_ingestion(&request("owner-a")).await.unwrap();
    assert!(second.is_clean());
    assert_eq!(second.publications_unchanged, 2);
    assert_eq!(second.processes_created, 0);
    assert_eq!(second.clients_created, 0);
    assert_eq!(second.processes_unchanged, 2);
    assert_eq!(second.clients_unchanged, 2);
    assert_eq!(second.publications_marked_processed, 0);
    assert_eq!(store.list_processes("owner-a").await.unwrap().len(), 2);
    assert_eq!(store.list_clients("owner-a").await.unwrap().len(), 2);
}

#[tokio::test]
async fn masked_and_unmasked_numbers_land_in_one_process() {
    let store: Arc<dyn Store> = Arc::new(InMemoryStore::new());
    let runner = runner(
        vec![
            raw("p1", CNJ, 10, "Classe: Monitória"),
            raw("p2", CNJ_KEY, 12, "Despacho."),
        ],
        store.clone(),
    );
    let report = runner.run_ingestion(&request("owner-a")).await.unwrap();
    assert_eq!(report.processes_created, 1);

    let processes = store.list_processes("owner-a").await.unwrap();
    assert_eq!(processes.len(), 1);
    assert_eq!(processes[0].classe, "Monitória");
    assert_eq!(processes[0].last_movement, "Despacho.");
}

#[tokio::test]
async fn short_documents_never_persist_clients() {
    let store: Arc<dyn Store> = Arc::new(InMemoryStore::new());
    let runner = runner(
        vec![raw("p1", CNJ, 10, "AUTOR: FULANO DE TAL, CPF 123")],
        store.clone(),
    );
    let report = runner.run_ingestion(&request("owner-a")).await.unwrap();
    assert!(report.is_clean());
    assert_eq!(report.clients_created, 0);
    assert!(store.list_clients("owner-a").await.unwrap().is_empty());
    assert_eq!(store.list_processes("owner-a").await.unwrap().len(), 1);
}

#[tokio::test]
async fn related_processes_accumulate_across_runs() {
    let store: Arc<dyn Store> = Arc::new(InMemoryStore::new());
    runner(
        vec![raw("p1", CNJ, 10, "AUTOR: MARIA SOUZA, CPF 123.456.789-01")],
        store.clone(),
    )
    .run_ingestion(&request("owner-a"))
    .await
    .unwrap();

    let report = runner(
        vec![raw(
            "p2",
            "7654321-00.2023.8.26.0100",
            15,
            "Requerente: MARIA SOUZA, CPF 123.456.789-01",
        )],
        store.clone(),
    )
    .run_ingestion(&request("owner-a"))
    .await
    .unwrap();
    assert_eq!(report.clients_updated, 1);

    let clients = store.list_clients("owner-a").await.unwrap();
    assert_eq!(
        clients[0].related_process_ids,
        BTreeSet::from([CNJ_KEY.to_string(), "76543210020238260100".to_string()])
    );
}

#[tokio::test]
async fn later_sparse_mentions_keep_known_contact_fields() {
    let store: Arc<dyn Store> = Arc::new(InMemoryStore::new());
    runner(
        vec![raw(
            "p1",
            CNJ,
            10,
            "AUTOR: MARIA SOUZA, CPF 123.456.789-01, e-mail x@y.com",
        )],
        store.clone(),
    )
    .run_ingestion(&request("owner-a"))
    .await
    .unwrap();

    runner(
        vec![raw("p2", CNJ, 20, "AUTOR: MARIA SOUZA, CPF 123.456.789-01")],
        store.clone(),
    )
    .run_ingestion(&request("owner-a"))
    .await
    .unwrap();

    let clients = store.list_clients("owner-a").await.unwrap();
    assert_eq!(clients.len(), 1);
    assert_eq!(clients[0].email, "x@y.com");
    assert_eq!(clients[0].name, "MARIA SOUZA");
}

#[tokio::test]
async fn one_failed_process_write_does_not_abort_the_run() {
    let store = Arc::new(FlakyStore {
        fail_process_save_call: Some(2),
        ..FlakyStore::default()
    });
    let feed = vec![
        raw("p1", "0000001-00.2024.8.26.0001", 10, "Despacho 1"),
        raw("p2", "0000002-00.2024.8.26.0001", 11, "Despacho 2"),
        raw("p3", "0000003-00.2024.8.26.0001", 12, "Despacho 3"),
    ];
    let runner = runner(feed, store.clone()).with_options(RunOptions {
        workers: 1,
        ..RunOptions::default()
    });

    let report = runner.run_ingestion(&request("owner-a")).await.unwrap();
    assert_eq!(report.processes_created, 2);
    assert_eq!(report.errors.len(), 1);
    assert_eq!(report.errors[0].item, "process:00000020020248260001");
    assert!(report.errors[0].message.contains("injected failure"));

    let keys = store
        .list_processes("owner-a")
        .await
        .unwrap()
        .into_iter()
        .map(|p| p.cnj_number)
        .collect::<BTreeSet<_>>();
    assert_eq!(
        keys,
        BTreeSet::from([
            "00000010020248260001".to_string(),
            "00000030020248260001".to_string()
        ])
    );

    // The failed group stays New so a later run retries it.
    let publications = store.list_publications("owner-a").await.unwrap();
    for publication in publications {
        let expected = if publication.external_id.as_deref() == Some("p2") {
            PublicationStatus::New
        } else {
            PublicationStatus::Processed
        };
        assert_eq!(publication.status, expected, "{}", publication.identity_key);
    }
}

#[tokio::test]
async fn failed_raw_upsert_is_reported_and_skipped() {
    let store = Arc::new(FlakyStore {
        fail_upsert_identity: Some("ext:p2".into()),
        ..FlakyStore::default()
    });
    let runner = runner(
        vec![
            raw("p1", CNJ, 10, "Despacho"),
            raw("p2", "7654321-00.2023.8.26.0100", 11, "Despacho"),
        ],
        store.clone(),
    );
    let report = runner.run_ingestion(&request("owner-a")).await.unwrap();
    assert_eq!(report.publications_fetched, 2);
    assert_eq!(report.publications_inserted, 1);
    assert_eq!(report.errors.len(), 1);
    assert_eq!(report.errors[0].item, "ext:p2");

    let processes = store.list_processes("owner-a").await.unwrap();
    assert_eq!(processes.len(), 1);
    assert_eq!(processes[0].cnj_number, CNJ_KEY);
}

#[tokio::test]
async fn owners_never_share_processes() {
    let store: Arc<dyn Store> = Arc::new(InMemoryStore::new());
    let feed = vec![raw("p1", CNJ, 10, "Despacho")];
    runner(feed.clone(), store.clone())
        .run_ingestion(&request("owner-a"))
        .await
        .unwrap();
    let report = runner(feed, store.clone())
        .run_ingestion(&request("owner-b"))
        .await
        .unwrap();
    assert_eq!(report.processes_created, 1);

    let a = store.list_processes("owner-a").await.unwrap();
    let b = store.list_processes("owner-b").await.unwrap();
    assert_eq!((a.len(), b.len()), (1, 1));
    assert_eq!(a[0].cnj_number, b[0].cnj_number);
    assert_eq!(a[0].owner_id, "owner-a");
    assert_eq!(b[0].owner_id, "owner-b");
}

#[tokio::test]
async fn feed_failure_aborts_without_writing() {
    let store: Arc<dyn Store> = Arc::new(InMemoryStore::new());
    let runner = IngestionRunner::new(Arc::new(StaticFeed::failing("503 upstream")), store.clone());

    let err = runner.run_ingestion(&request("owner-a")).await.unwrap_err();
    assert!(matches!(err, IngestionError::Feed(FeedError::Unavailable(_))));
    assert!(store.list_publications("owner-a").await.unwrap().is_empty());
}

#[tokio::test]
async fn slow_feed_hits_the_caller_timeout() {
    let store: Arc<dyn Store> = Arc::new(InMemoryStore::new());
    let feed = StaticFeed::new(vec![raw("p1", CNJ, 10, "Despacho")])
        .with_delay(Duration::from_millis(500));
    let runner = IngestionRunner::new(Arc::new(feed), store.clone()).with_options(RunOptions {
        fetch_timeout: Some(Duration::from_millis(20)),
        ..RunOptions::default()
    });

    let err = runner.run_ingestion(&request("owner-a")).await.unwrap_err();
    assert!(matches!(err, IngestionError::Feed(FeedError::Timeout(_))));
    assert!(store.list_publications("owner-a").await.unwrap().is_empty());
}

#[tokio::test]
async fn pagination_stops_at_short_page_or_page_limit() {
    let publications = (1..=5)
        .map(|n| raw(&format!("p{n}"), CNJ, n, "Despacho"))
        .collect::<Vec<_>>();

    let feed = Arc::new(StaticFeed::new(publications.clone()));
    let dyn_feed: Arc<dyn PublicationFeed> = feed.clone();
    let runner = IngestionRunner::new(dyn_feed, Arc::new(InMemoryStore::new())).with_options(
        RunOptions {
            page_size: 2,
            ..RunOptions::default()
        },
    );
    let report = runner.run_ingestion(&request("owner-a")).await.unwrap();
    assert_eq!(report.publications_fetched, 5);
    assert_eq!(feed.calls(), 3);

    let capped = Arc::new(StaticFeed::new(publications));
    let dyn_capped: Arc<dyn PublicationFeed> = capped.clone();
    let runner = IngestionRunner::new(dyn_capped, Arc::new(InMemoryStore::new())).with_options(
        RunOptions {
            page_size: 2,
            max_pages: 2,
            ..RunOptions::default()
        },
    );
    let report = runner.run_ingestion(&request("owner-a")).await.unwrap();
    assert_eq!(report.publications_fetched, 4);
    assert_eq!(capped.calls(), 2);
}

#[tokio::test]
async fn human_read_status_survives_reissue_and_processing() {
    let store: Arc<dyn Store> = Arc::new(InMemoryStore::new());
    runner(vec![raw("p1", CNJ, 10, "Despacho")], store.clone())
        .run_ingestion(&request("owner-a"))
        .await
        .unwrap();
    let id = store.list_publications("owner-a").await.unwrap()[0].id;
    assert!(store.mark_publication_read("owner-a", id).await.unwrap());

    let report = runner(vec![raw("p1", CNJ, 10, "Despacho retificado")], store.clone())
        .run_ingestion(&request("owner-a"))
        .await
        .unwrap();
    assert_eq!(report.publications_updated, 1);
    assert_eq!(report.processes_updated, 1);
    assert_eq!(
        publication_status(store.as_ref(), "owner-a", id).await,
        PublicationStatus::Read
    );
}

#[tokio::test]
async fn reissued_processed_publication_is_processed_again() {
    let store: Arc<dyn Store> = Arc::new(InMemoryStore::new());
    runner(vec![raw("p1", CNJ, 10, "Despacho")], store.clone())
        .run_ingestion(&request("owner-a"))
        .await
        .unwrap();

    let report = runner(vec![raw("p1", CNJ, 10, "Sentença")], store.clone())
        .run_ingestion(&request("owner-a"))
        .await
        .unwrap();
    assert_eq!(report.publications_updated, 1);
    assert_eq!(report.publications_marked_processed, 1);

    let process = store.find_process("owner-a", CNJ_KEY).await.unwrap().unwrap();
    assert_eq!(process.last_movement, "Sentença");
}

#[tokio::test]
async fn publications_without_process_number_are_settled() {
    let store: Arc<dyn Store> = Arc::new(InMemoryStore::new());
    let report = runner(vec![raw("p1", "", 10, "Edital genérico")], store.clone())
        .run_ingestion(&request("owner-a"))
        .await
        .unwrap();
    assert_eq!(report.processes_created, 0);
    assert_eq!(report.publications_marked_processed, 1);
}

#[tokio::test]
async fn reprocess_rederives_stored_publications_and_reports_missing_ids() {
    let store: Arc<dyn Store> = Arc::new(InMemoryStore::new());
    let runner = runner(
        vec![raw("p1", CNJ, 10, "AUTOR: MARIA SOUZA, CPF 123.456.789-01")],
        store.clone(),
    );
    runner.run_ingestion(&request("owner-a")).await.unwrap();
    let id = store.list_publications("owner-a").await.unwrap()[0].id;
    let missing = Uuid::new_v4();

    let report = runner.reprocess("owner-a", &[id, missing, id]).await;
    assert_eq!(report.publications_fetched, 0);
    assert_eq!(report.processes_unchanged, 1);
    assert_eq!(report.clients_unchanged, 1);
    assert_eq!(report.errors.len(), 1);
    assert_eq!(report.errors[0].item, missing.to_string());

    let foreign = runner.reprocess("owner-b", &[id]).await;
    assert_eq!(foreign.errors.len(), 1);
    assert!(store.list_processes("owner-b").await.unwrap().is_empty());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn concurrent_runs_merge_the_same_client_without_losing_updates() {
    let store: Arc<dyn Store> = Arc::new(FlakyStore {
        find_client_delay: Some(Duration::from_millis(50)),
        ..FlakyStore::default()
    });
    let first = runner(
        vec![raw("p1", CNJ, 10, "AUTOR: MARIA SOUZA, CPF 123.456.789-01")],
        store.clone(),
    );
    let second = runner(
        vec![raw(
            "p2",
            "7654321-00.2023.8.26.0100",
            11,
            "AUTOR: MARIA SOUZA, CPF 123.456.789-01",
        )],
        store.clone(),
    );

    let owner = request("owner-a");
    let (a, b) = tokio::join!(first.run_ingestion(&owner), second.run_ingestion(&owner));
    let (a, b) = (a.unwrap(), b.unwrap());
    assert!(a.is_clean());
    assert!(b.is_clean());
    // The second writer waited for the first and merged into its row.
    assert_eq!(a.clients_created + b.clients_created, 1);
    assert_eq!(a.clients_updated + b.clients_updated, 1);

    let clients = store.list_clients("owner-a").await.unwrap();
    assert_eq!(clients.len(), 1);
    assert_eq!(clients[0].related_process_ids.len(), 2);
}

#[tokio::test]
async fn reissue_within_one_fetch_derives_from_the_latest_copy() {
    let store: Arc<dyn Store> = Arc::new(InMemoryStore::new());
    let feed = vec![
        raw("p1", CNJ, 10, "Despacho antigo"),
        raw("p2", "7654321-00.2023.8.26.0100", 10, "Outro processo"),
        raw("p1", CNJ, 10, "Sentença nova"),
    ];

    let report = runner(feed, store.clone())
        .run_ingestion(&request("owner-a"))
        .await
        .unwrap();
    assert_eq!(report.publications_fetched, 3);
    assert_eq!(report.publications_inserted, 2);
    assert_eq!(report.publications_marked_processed, 2);

    let stored = store
        .list_publications("owner-a")
        .await
        .unwrap()
        .into_iter()
        .find(|p| p.external_id.as_deref() == Some("p1"))
        .unwrap();
    assert_eq!(stored.content, "Sentença nova");
    assert_eq!(stored.status, PublicationStatus::Processed);

    let process = store.find_process("owner-a", CNJ_KEY).await.unwrap().unwrap();
    assert_eq!(process.last_movement, "Sentença nova");
}

#[tokio::test]
async fn clients_never_link_a_process_whose_write_failed() {
    let store = Arc::new(FlakyStore {
        fail_process_save_call: Some(2),
        ..FlakyStore::default()
    });
    let feed = vec![
        raw(
            "p1",
            "0000001-00.2024.8.26.0001",
            10,
            "AUTOR: MARIA SOUZA, CPF 123.456.789-01",
        ),
        raw(
            "p2",
            "0000002-00.2024.8.26.0001",
            11,
            "AUTOR: MARIA SOUZA, CPF 123.456.789-01",
        ),
        raw(
            "p3",
            "0000002-00.2024.8.26.0001",
            12,
            "AUTOR: JOAO LIMA, CPF 987.654.321-00",
        ),
    ];
    let runner = runner(feed, store.clone()).with_options(RunOptions {
        workers: 1,
        ..RunOptions::default()
    });

    let report = runner.run_ingestion(&request("owner-a")).await.unwrap();
    assert_eq!(report.errors.len(), 1);
    assert_eq!(report.errors[0].item, "process:00000020020248260001");
    assert_eq!(report.clients_created, 1);

    let clients = store.list_clients("owner-a").await.unwrap();
    assert_eq!(clients.len(), 1);
    assert_eq!(clients[0].document, "12345678901");
    assert_eq!(
        clients[0].related_process_ids,
        BTreeSet::from(["00000010020248260001".to_string()])
    );

    // Once the write goes through, the relation and the second client follow.
    let report = runner.run_ingestion(&request("owner-a")).await.unwrap();
    assert!(report.is_clean());
    let clients = store.list_clients("owner-a").await.unwrap();
    assert_eq!(clients.len(), 2);
    assert_eq!(clients[0].related_process_ids.len(), 2);
}
