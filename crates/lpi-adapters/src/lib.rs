//! Publication feed contracts, feed implementations and the text extractor.

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::NaiveDate;
use lpi_core::RawPublication;
use lpi_storage::{FetchError, HttpFetcher};
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use serde_json::Value as JsonValue;
use thiserror::Error;
use tracing::debug;

mod extract;

pub use extract::{
    content_text, deadline_days_in, mentions_urgency, parse_brl_amount, Extraction,
    ExtractionRules, Extractor, PartyMention, RulesError, StatusRule,
};

pub const CRATE_NAME: &str = "lpi-adapters";
pub const COMUNICA_SOURCE: &str = "comunica";
pub const DEFAULT_COMUNICA_URL: &str = "https://comunicaapi.pje.jus.br";

/// Attorney identity plus the inclusive availability window to query.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FeedQuery {
    pub oab_number: String,
    pub oab_state: String,
    pub date_from: NaiveDate,
    pub date_to: NaiveDate,
}

#[derive(Debug, Error)]
pub enum FeedError {
    #[error(transparent)]
    Fetch(#[from] FetchError),
    #[error("malformed feed response: {0}")]
    Malformed(String),
    #[error("feed unavailable: {0}")]
    Unavailable(String),
    #[error("fixture feed: {0:#}")]
    Fixture(anyhow::Error),
    #[error("feed did not answer within {0:?}")]
    Timeout(Duration),
}

#[async_trait]
pub trait PublicationFeed: Send + Sync {
    fn name(&self) -> &str;

    /// One page of publications; `offset` counts records, not pages.
    async fn fetch(
        &self,
        query: &FeedQuery,
        limit: usize,
        offset: usize,
    ) -> Result<Vec<RawPublication>, FeedError>;
}

/// Response envelope of the court-communications API.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ComunicaPage {
    #[serde(default)]
    pub status: Option<String>,
    #[serde(default)]
    pub message: Option<String>,
    #[serde(default)]
    pub count: Option<u64>,
    #[serde(default)]
    pub items: Vec<ComunicaItem>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct ComunicaItem {
    #[serde(default)]
    pub id: Option<JsonValue>,
    #[serde(default)]
    pub data_disponibilizacao: Option<String>,
    #[serde(default)]
    pub datadisponibilizacao: Option<String>,
    #[serde(default, rename = "siglaTribunal")]
    pub sigla_tribunal: Option<String>,
    #[serde(default, rename = "tipoComunicacao")]
    pub tipo_comunicacao: Option<String>,
    #[serde(default, rename = "nomeOrgao")]
    pub nome_orgao: Option<String>,
    #[serde(default)]
    pub texto: Option<String>,
    #[serde(default)]
    pub numero_processo: Option<String>,
    #[serde(default)]
    pub numeroprocessocommascara: Option<String>,
    #[serde(default, rename = "nomeClasse")]
    pub nome_classe: Option<String>,
    #[serde(default)]
    pub link: Option<String>,
    #[serde(default)]
    pub destinatarios: Vec<ComunicaRecipient>,
    #[serde(default)]
    pub destinatarioadvogados: Vec<ComunicaLawyerLink>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct ComunicaRecipient {
    #[serde(default)]
    pub nome: String,
    #[serde(default)]
    pub polo: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct ComunicaLawyerLink {
    #[serde(default)]
    pub advogado: ComunicaLawyer,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct ComunicaLawyer {
    #[serde(default)]
    pub nome: String,
    #[serde(default)]
    pub numero_oab: Option<JsonValue>,
    #[serde(default)]
    pub uf_oab: Option<String>,
}

fn json_scalar(value: &JsonValue) -> Option<String> {
    match value {
        JsonValue::String(s) if !s.trim().is_empty() => Some(s.trim().to_string()),
        JsonValue::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

fn text_or_empty(value: Option<String>) -> String {
    value.map(|v| v.trim().to_string()).unwrap_or_default()
}

impl ComunicaItem {
    fn publication_date(&self) -> Option<NaiveDate> {
        let iso = self
            .data_disponibilizacao
            .as_deref()
            .and_then(|raw| NaiveDate::parse_from_str(raw.trim(), "%Y-%m-%d").ok());
        iso.or_else(|| {
            self.datadisponibilizacao
                .as_deref()
                .and_then(|raw| NaiveDate::parse_from_str(raw.trim(), "%d/%m/%Y").ok())
        })
    }

    pub fn into_raw(self) -> Result<RawPublication, FeedError> {
        let external_id = self.id.as_ref().and_then(json_scalar);
        let publication_date = self.publication_date().ok_or_else(|| {
            FeedError::Malformed(format!(
                "item {} has no parseable availability date",
                external_id.as_deref().unwrap_or("<without id>")
            ))
        })?;

        let masked = text_or_empty(self.numeroprocessocommascara);
        let process_number_raw = if masked.is_empty() {
            text_or_empty(self.numero_processo)
        } else {
            masked
        };

        let content = self.texto.unwrap_or_default();
        let plain = content_text(&content);
        let recipients = self
            .destinatarios
            .into_iter()
            .map(|r| r.nome.trim().to_string())
            .filter(|name| !name.is_empty())
            .collect();
        let mentioned_lawyers = self
            .destinatarioadvogados
            .into_iter()
            .map(|link| link.advogado)
            .filter(|lawyer| !lawyer.nome.trim().is_empty())
            .map(|lawyer| {
                let number = lawyer.numero_oab.as_ref().and_then(json_scalar);
                match (number, lawyer.uf_oab) {
                    (Some(number), Some(uf)) => {
                        format!("{} (OAB {number}/{})", lawyer.nome.trim(), uf.trim())
                    }
                    (Some(number), None) => format!("{} (OAB {number})", lawyer.nome.trim()),
                    _ => lawyer.nome.trim().to_string(),
                }
            })
            .collect();

        Ok(RawPublication {
            external_id,
            process_number_raw,
            tribunal: text_or_empty(self.sigla_tribunal),
            organ: text_or_empty(self.nome_orgao),
            class_name: text_or_empty(self.nome_classe),
            publication_date,
            deadline_days: deadline_days_in(&plain),
            urgent: mentions_urgency(&plain),
            content,
            movement_type: text_or_empty(self.tipo_comunicacao),
            recipients,
            mentioned_lawyers,
            link: self.link.filter(|l| !l.trim().is_empty()),
        })
    }
}

/// Decodes one API response body. A non-success envelope is a feed failure.
pub fn parse_comunica_page(body: &[u8]) -> Result<Vec<RawPublication>, FeedError> {
    let page: ComunicaPage =
        serde_json::from_slice(body).map_err(|e| FeedError::Malformed(e.to_string()))?;
    if let Some(status) = page.status.as_deref() {
        if !status.eq_ignore_ascii_case("success") {
            return Err(FeedError::Unavailable(
                page.message.unwrap_or_else(|| format!("status {status}")),
            ));
        }
    }
    page.items.into_iter().map(ComunicaItem::into_raw).collect()
}

/// HTTP feed against the court-communications API.
#[derive(Debug)]
pub struct ComunicaFeed {
    http: HttpFetcher,
    base_url: String,
}

impl ComunicaFeed {
    pub fn new(base_url: impl Into<String>, http: HttpFetcher) -> Self {
        Self {
            http,
            base_url: base_url.into(),
        }
    }

    fn endpoint(&self) -> String {
        format!("{}/api/v1/comunicacao", self.base_url.trim_end_matches('/'))
    }

    fn query_params(query: &FeedQuery, limit: usize, offset: usize) -> Vec<(&'static str, String)> {
        let limit = limit.max(1);
        vec![
            ("numeroOab", query.oab_number.trim().to_string()),
            ("ufOab", query.oab_state.trim().to_uppercase()),
            (
                "dataDisponibilizacaoInicio",
                query.date_from.format("%Y-%m-%d").to_string(),
            ),
            (
                "dataDisponibilizacaoFim",
                query.date_to.format("%Y-%m-%d").to_string(),
            ),
            ("itensPorPagina", limit.to_string()),
            ("pagina", (offset / limit + 1).to_string()),
        ]
    }
}

#[async_trait]
impl PublicationFeed for ComunicaFeed {
    fn name(&self) -> &str {
        COMUNICA_SOURCE
    }

    async fn fetch(
        &self,
        query: &FeedQuery,
        limit: usize,
        offset: usize,
    ) -> Result<Vec<RawPublication>, FeedError> {
        let params = Self::query_params(query, limit, offset);
        let response = self
            .http
            .get_json(COMUNICA_SOURCE, &self.endpoint(), &params)
            .await?;
        let publications = parse_comunica_page(&response.body)?;
        debug!(
            url = %response.url,
            count = publications.len(),
            "decoded comunica page"
        );
        Ok(publications)
    }
}

fn read_json_file<T: DeserializeOwned>(path: impl AsRef<Path>) -> Result<T> {
    let path = path.as_ref();
    let data = fs::read_to_string(path).with_context(|| format!("reading {}", path.display()))?;
    serde_json::from_str(&data).with_context(|| format!("parsing {}", path.display()))
}

/// Feed served from a checked-in API response, filtered by the query window.
#[derive(Debug, Clone)]
pub struct FixtureFeed {
    path: PathBuf,
    publications: Vec<RawPublication>,
}

impl FixtureFeed {
    pub fn load(path: impl AsRef<Path>) -> Result<Self, FeedError> {
        let path = path.as_ref();
        let page: ComunicaPage = read_json_file(path).map_err(FeedError::Fixture)?;
        let publications = page
            .items
            .into_iter()
            .map(ComunicaItem::into_raw)
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Self {
            path: path.to_path_buf(),
            publications,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn publications(&self) -> &[RawPublication] {
        &self.publications
    }
}

#[async_trait]
impl PublicationFeed for FixtureFeed {
    fn name(&self) -> &str {
        "fixture"
    }

    async fn fetch(
        &self,
        query: &FeedQuery,
        limit: usize,
        offset: usize,
    ) -> Result<Vec<RawPublication>, FeedError> {
        Ok(self
            .publications
            .iter()
            .filter(|p| p.publication_date >= query.date_from && p.publication_date <= query.date_to)
            .skip(offset)
            .take(limit)
            .cloned()
            .collect())
    }
}

/// In-memory feed for tests and local runs. Ignores the query window.
#[derive(Debug, Default)]
pub struct StaticFeed {
    publications: Vec<RawPublication>,
    failure: Option<String>,
    delay: Option<Duration>,
    calls: AtomicUsize,
}

impl StaticFeed {
    pub fn new(publications: Vec<RawPublication>) -> Self {
        Self {
            publications,
            ..Self::default()
        }
    }

    pub fn failing(message: impl Into<String>) -> Self {
        Self {
            failure: Some(message.into()),
            ..Self::default()
        }
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl PublicationFeed for StaticFeed {
    fn name(&self) -> &str {
        "static"
    }

    async fn fetch(
        &self,
        _query: &FeedQuery,
        limit: usize,
        offset: usize,
    ) -> Result<Vec<RawPublication>, FeedError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
        if let Some(message) = &self.failure {
            return Err(FeedError::Unavailable(message.clone()));
        }
        Ok(self
            .publications
            .iter()
            .skip(offset)
            .take(limit)
            .cloned()
            .collect())
    }
}
