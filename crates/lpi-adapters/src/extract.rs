//! Best-effort derivation of process and client drafts from publication text.
//!
//! Nothing here fails on bad input: unparseable content only yields drafts
//! with fewer fields filled in. The label vocabulary lives in
//! [`ExtractionRules`] so deployments can swap it without touching code.

use std::collections::{BTreeSet, HashMap, HashSet};
use std::path::Path;
use std::sync::LazyLock;

use chrono::NaiveDate;
use lpi_core::{
    format_cnj, normalize_document, person_type_for, ClientDraft, ProcessDraft, Publication,
};
use regex::Regex;
use scraper::{Html, Node};
use serde::Deserialize;
use thiserror::Error;
use tracing::debug;
use uuid::Uuid;

const MAX_FIELD_CHARS: usize = 200;
const MAX_NAME_CHARS: usize = 120;
const MAX_NAME_WORDS: usize = 12;
const CONTACT_WINDOW_BYTES: usize = 240;

const BLOCK_TAGS: &[&str] = &[
    "br", "p", "div", "li", "tr", "td", "th", "h1", "h2", "h3", "h4", "h5", "h6", "table", "ul",
    "ol", "section", "article",
];

const NAME_CONNECTORS: &[&str] = &["da", "de", "do", "das", "dos", "e", "d'"];

// Words trailing a name before its document ("..., inscrita no CNPJ sob o nº").
const NAME_STOP_WORDS: &[&str] = &[
    "inscrito", "inscrita", "portador", "portadora", "sob", "o", "a", "no", "na", "nº", "n°",
    "n", "número", "numero", "cpf", "cnpj", "mf", "cpf/mf", "cnpj/mf", "com", "de", "do", "da",
    "pelo", "pela", "e",
];

static DOCUMENT_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"(?i)\b(?:cpf|cnpj)(?:\s*/\s*mf)?\s*(?:n[º°o]?\.?\s*)?[:\-]?\s*(\d[\d.\-/]*\d|\d)|\b\d{3}\.\d{3}\.\d{3}-\d{2}\b|\b\d{2}\.\d{3}\.\d{3}/\d{4}-\d{2}\b",
    )
    .expect("valid regex")
});

static EMAIL_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"[A-Za-z0-9._%+\-]+@[A-Za-z0-9.\-]+\.[A-Za-z]{2,}").expect("valid regex")
});

static PHONE_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"\(\d{2}\)\s?9?\d{4}-?\d{4}|\b\d{2}\s9?\d{4}-\d{4}\b").expect("valid regex")
});

static DEADLINE_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)\bprazo\s+(?:legal\s+)?(?:de\s+)?(\d{1,3})\s*(?:\([^)]*\)\s*)?dias")
        .expect("valid regex")
});

#[derive(Debug, Error)]
pub enum RulesError {
    #[error("reading rules file {path}: {source}")]
    Io {
        path: String,
        source: std::io::Error,
    },
    #[error("parsing extraction rules: {0}")]
    Yaml(#[from] serde_yaml::Error),
    #[error("invalid rule pattern: {0}")]
    Pattern(#[from] regex::Error),
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct StatusRule {
    pub status: String,
    pub contains_any: Vec<String>,
}

/// Label vocabulary driving text extraction. Missing YAML keys keep defaults.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct ExtractionRules {
    pub classe_labels: Vec<String>,
    pub assunto_labels: Vec<String>,
    pub vara_labels: Vec<String>,
    pub cause_value_labels: Vec<String>,
    pub distribution_labels: Vec<String>,
    pub party_roles: Vec<String>,
    pub address_markers: Vec<String>,
    pub status_rules: Vec<StatusRule>,
}

fn strings(values: &[&str]) -> Vec<String> {
    values.iter().map(ToString::to_string).collect()
}

impl Default for ExtractionRules {
    fn default() -> Self {
        Self {
            classe_labels: strings(&["Classe", "Classe Processual", "Classe judicial"]),
            assunto_labels: strings(&["Assunto", "Assuntos"]),
            vara_labels: strings(&["Vara", "Órgão julgador", "Orgão julgador", "Juízo", "Juizo"]),
            cause_value_labels: strings(&["Valor da causa", "Valor da ação", "Valor da acao"]),
            distribution_labels: strings(&[
                "Data de distribuição",
                "Data da distribuição",
                "Data de distribuicao",
                "Distribuído em",
                "Distribuída em",
                "Distribuido em",
            ]),
            party_roles: strings(&[
                "Autor",
                "Autora",
                "Réu",
                "Ré",
                "Reu",
                "Requerente",
                "Requerido",
                "Requerida",
                "Exequente",
                "Executado",
                "Executada",
                "Apelante",
                "Apelado",
                "Apelada",
                "Agravante",
                "Agravado",
                "Reclamante",
                "Reclamado",
                "Reclamada",
                "Impetrante",
                "Impetrado",
                "Embargante",
                "Embargado",
                "Interessado",
                "Interessada",
                "Parte",
            ]),
            address_markers: strings(&[
                "residente e domiciliado na",
                "residente e domiciliada na",
                "residente e domiciliado no",
                "residente e domiciliada no",
                "residente e domiciliado em",
                "residente e domiciliada em",
                "residente na",
                "com endereço na",
                "com sede na",
                "sediada na",
                "estabelecida na",
            ]),
            status_rules: vec![
                StatusRule {
                    status: "archived".into(),
                    contains_any: strings(&[
                        "arquivem-se",
                        "arquivamento definitivo",
                        "baixa definitiva",
                    ]),
                },
                StatusRule {
                    status: "suspended".into(),
                    contains_any: strings(&["processo suspenso", "suspensão do processo"]),
                },
            ],
        }
    }
}

impl ExtractionRules {
    pub fn from_yaml_str(yaml: &str) -> Result<Self, RulesError> {
        Ok(serde_yaml::from_str(yaml)?)
    }

    pub fn from_path(path: impl AsRef<Path>) -> Result<Self, RulesError> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path).map_err(|source| RulesError::Io {
            path: path.display().to_string(),
            source,
        })?;
        Self::from_yaml_str(&text)
    }
}

/// One party sighting carrying a usable document.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PartyMention {
    pub name: String,
    pub document: String,
    pub email: String,
    pub phone: String,
    pub address: String,
}

/// Drafts derived from one batch, in first-seen order.
#[derive(Debug, Clone, Default)]
pub struct Extraction {
    pub processes: Vec<ProcessDraft>,
    pub clients: Vec<ClientDraft>,
    /// Publications whose process number had no digits at all.
    pub unkeyed_publications: Vec<Uuid>,
}

#[derive(Debug, Default)]
struct PublicationFacts {
    text: String,
    tribunal: String,
    vara: String,
    classe: String,
    assunto: String,
    cause_value: Option<f64>,
    distribution_date: Option<NaiveDate>,
    status: String,
    parties: Vec<String>,
    mentions: Vec<PartyMention>,
}

struct Group<'a> {
    owner_id: String,
    key: String,
    members: Vec<(&'a Publication, PublicationFacts)>,
}

#[derive(Debug, Clone)]
pub struct Extractor {
    rules: ExtractionRules,
    classe: Option<Regex>,
    assunto: Option<Regex>,
    vara: Option<Regex>,
    cause_value: Option<Regex>,
    distribution: Option<Regex>,
    party: Option<Regex>,
    address: Option<Regex>,
    any_label: Option<Regex>,
}

fn alternation(labels: &[String]) -> Option<String> {
    let alts = labels
        .iter()
        .map(|l| l.trim())
        .filter(|l| !l.is_empty())
        .map(regex::escape)
        .collect::<Vec<_>>();
    if alts.is_empty() {
        None
    } else {
        Some(alts.join("|"))
    }
}

fn compile(labels: &[String], build: impl Fn(&str) -> String) -> Result<Option<Regex>, RulesError> {
    alternation(labels)
        .map(|alts| Regex::new(&build(&alts)))
        .transpose()
        .map_err(RulesError::from)
}

impl Extractor {
    pub fn new(rules: ExtractionRules) -> Result<Self, RulesError> {
        let field = |alts: &str| format!(r"(?i)\b(?:{alts})\s*:\s*([^\n;|]+)");
        let all_labels = [
            rules.classe_labels.as_slice(),
            rules.assunto_labels.as_slice(),
            rules.vara_labels.as_slice(),
            rules.cause_value_labels.as_slice(),
            rules.distribution_labels.as_slice(),
            rules.party_roles.as_slice(),
        ]
        .concat();

        Ok(Self {
            classe: compile(&rules.classe_labels, field)?,
            assunto: compile(&rules.assunto_labels, field)?,
            vara: compile(&rules.vara_labels, field)?,
            cause_value: compile(&rules.cause_value_labels, |alts| {
                format!(r"(?i)\b(?:{alts})\s*:?\s*(?:R\$\s*)?(\d[\d.,]*)")
            })?,
            distribution: compile(&rules.distribution_labels, |alts| {
                format!(r"(?i)\b(?:{alts})\s*:?\s*(\d{{1,2}}/\d{{1,2}}/\d{{4}})")
            })?,
            party: compile(&rules.party_roles, |alts| format!(r"(?i)\b({alts})\s*:"))?,
            address: compile(&rules.address_markers, |alts| {
                format!(r"(?i)\b(?:{alts})\s+([^\n;|]+)")
            })?,
            any_label: compile(&all_labels, |alts| format!(r"(?i)\b(?:{alts})\s*:"))?,
            rules,
        })
    }

    pub fn with_default_rules() -> Self {
        Self::new(ExtractionRules::default()).expect("built-in extraction rules are valid")
    }

    pub fn rules(&self) -> &ExtractionRules {
        &self.rules
    }

    /// Groups the batch by canonical process number and synthesizes one
    /// process draft per group plus one client draft per distinct document.
    pub fn extract(&self, publications: &[Publication]) -> Extraction {
        let mut groups: Vec<Group<'_>> = Vec::new();
        let mut index: HashMap<(String, String), usize> = HashMap::new();
        let mut unkeyed_publications = Vec::new();

        for publication in publications {
            let key = publication.process_key();
            if key.is_empty() {
                unkeyed_publications.push(publication.id);
                continue;
            }
            let facts = self.publication_facts(publication);
            let slot = *index
                .entry((publication.owner_id.clone(), key.clone()))
                .or_insert_with(|| {
                    groups.push(Group {
                        owner_id: publication.owner_id.clone(),
                        key,
                        members: Vec::new(),
                    });
                    groups.len() - 1
                });
            groups[slot].members.push((publication, facts));
        }

        let mut processes = Vec::with_capacity(groups.len());
        let mut clients: Vec<ClientDraft> = Vec::new();
        let mut client_index: HashMap<(String, String), usize> = HashMap::new();

        for mut group in groups {
            // Stable: same-day publications keep feed order, later wins ties.
            group.members.sort_by_key(|(p, _)| p.publication_date);
            processes.push(synthesize_process(&group));

            for (_, facts) in &group.members {
                for mention in &facts.mentions {
                    let slot_key = (group.owner_id.clone(), mention.document.clone());
                    match client_index.get(&slot_key) {
                        Some(&slot) => fold_mention(&mut clients[slot], mention, &group.key),
                        None => {
                            client_index.insert(slot_key, clients.len());
                            clients.push(client_draft(&group.owner_id, mention, &group.key));
                        }
                    }
                }
            }
        }

        Extraction {
            processes,
            clients,
            unkeyed_publications,
        }
    }

    fn publication_facts(&self, publication: &Publication) -> PublicationFacts {
        let text = content_text(&publication.content);

        let vara = non_empty(clean_value(&publication.organ))
            .or_else(|| self.labelled(&self.vara, &text))
            .unwrap_or_default();
        let classe = non_empty(clean_value(&publication.class_name))
            .or_else(|| self.labelled(&self.classe, &text))
            .unwrap_or_default();
        let assunto = self.labelled(&self.assunto, &text).unwrap_or_default();
        let cause_value = self
            .cause_value
            .as_ref()
            .and_then(|re| re.captures(&text))
            .and_then(|caps| parse_brl_amount(&caps[1]));
        let distribution_date = self
            .distribution
            .as_ref()
            .and_then(|re| re.captures(&text))
            .and_then(|caps| NaiveDate::parse_from_str(&caps[1], "%d/%m/%Y").ok());

        let lowered = text.to_lowercase();
        let status = self
            .rules
            .status_rules
            .iter()
            .find(|rule| {
                rule.contains_any
                    .iter()
                    .any(|needle| lowered.contains(&needle.to_lowercase()))
            })
            .map(|rule| rule.status.clone())
            .unwrap_or_default();

        let mut parties = self.role_parties(&text);
        for recipient in &publication.recipients {
            if let Some(name) = strip_documents(recipient) {
                parties.push(name);
            }
        }

        let mut mentions = self.party_mentions(&text);
        for extra in publication
            .recipients
            .iter()
            .chain(publication.mentioned_lawyers.iter())
        {
            mentions.extend(self.party_mentions(extra));
        }

        PublicationFacts {
            tribunal: clean_value(&publication.tribunal),
            vara,
            classe,
            assunto,
            cause_value,
            distribution_date,
            status,
            parties,
            mentions,
            text,
        }
    }

    fn labelled(&self, re: &Option<Regex>, text: &str) -> Option<String> {
        let caps = re.as_ref()?.captures(text)?;
        non_empty(self.cut_at_next_label(&caps[1]))
    }

    fn cut_at_next_label(&self, value: &str) -> String {
        let end = self
            .any_label
            .as_ref()
            .and_then(|re| re.find(value))
            .map(|m| m.start())
            .unwrap_or(value.len());
        clean_value(&value[..end])
    }

    fn role_parties(&self, text: &str) -> Vec<String> {
        let Some(re) = &self.party else {
            return Vec::new();
        };
        let labels = re
            .captures_iter(text)
            .filter_map(|caps| caps.get(0).zip(caps.get(1)))
            .collect::<Vec<_>>();

        let mut parties = Vec::new();
        for (i, (label, role)) in labels.iter().enumerate() {
            let line_end = text[label.end()..]
                .find(['\n', ';', '|'])
                .map(|at| label.end() + at)
                .unwrap_or(text.len());
            let end = labels
                .get(i + 1)
                .map(|(next, _)| next.start())
                .unwrap_or(text.len())
                .min(line_end);
            let value = self.cut_at_next_label(&text[label.end()..end]);
            let Some(name) = strip_documents(&value) else {
                continue;
            };
            let name = first_clause(&name);
            if !name.is_empty() {
                parties.push(format!("{}: {name}", role.as_str().trim()));
            }
        }
        parties
    }

    /// Every CPF/CNPJ sighting in `text` that passes the document gate, with
    /// the name preceding it and contact details following it.
    pub fn party_mentions(&self, text: &str) -> Vec<PartyMention> {
        let matches = DOCUMENT_RE.captures_iter(text).collect::<Vec<_>>();
        let mut mentions = Vec::new();

        for (i, caps) in matches.iter().enumerate() {
            let Some(whole) = caps.get(0) else {
                continue;
            };
            let raw = caps.get(1).map(|m| m.as_str()).unwrap_or(whole.as_str());
            let Some(document) = normalize_document(raw) else {
                debug!(raw, "dropping party mention without a usable document");
                continue;
            };

            let window_end = matches
                .get(i + 1)
                .and_then(|next| next.get(0))
                .map(|next| next.start())
                .unwrap_or(text.len())
                .min(floor_char_boundary(text, whole.end() + CONTACT_WINDOW_BYTES));
            let window = &text[whole.end()..window_end];

            mentions.push(PartyMention {
                name: name_before(&text[..whole.start()]).unwrap_or_default(),
                document,
                email: EMAIL_RE
                    .find(window)
                    .map(|m| m.as_str().to_string())
                    .unwrap_or_default(),
                phone: PHONE_RE
                    .find(window)
                    .map(|m| m.as_str().to_string())
                    .unwrap_or_default(),
                address: self
                    .address
                    .as_ref()
                    .and_then(|re| re.captures(window))
                    .map(|c| clean_value(c[1].split(". ").next().unwrap_or_default()))
                    .unwrap_or_default(),
            });
        }
        mentions
    }
}

impl Default for Extractor {
    fn default() -> Self {
        Self::with_default_rules()
    }
}

fn synthesize_process(group: &Group<'_>) -> ProcessDraft {
    let facts = group.members.iter().map(|(_, f)| f).collect::<Vec<_>>();
    let latest_text = |pick: fn(&PublicationFacts) -> &str| -> String {
        facts
            .iter()
            .rev()
            .map(|f| pick(f))
            .find(|v| !v.is_empty())
            .unwrap_or_default()
            .to_string()
    };

    let latest = group.members.last();
    let display = latest
        .map(|(p, _)| p.process_number_raw.trim().to_string())
        .filter(|raw| raw.chars().any(|c| !c.is_ascii_digit()))
        .or_else(|| format_cnj(&group.key))
        .unwrap_or_else(|| group.key.clone());

    let mut seen = HashSet::new();
    let parties = facts
        .iter()
        .flat_map(|f| f.parties.iter())
        .filter(|p| seen.insert(p.to_lowercase()))
        .cloned()
        .collect::<Vec<_>>()
        .join("; ");

    ProcessDraft {
        owner_id: group.owner_id.clone(),
        cnj_number: group.key.clone(),
        process_number_display: display,
        tribunal: latest_text(|f| &f.tribunal),
        classe: latest_text(|f| &f.classe),
        assunto: latest_text(|f| &f.assunto),
        cause_value: facts.iter().rev().find_map(|f| f.cause_value),
        distribution_date: facts.iter().rev().find_map(|f| f.distribution_date),
        vara: latest_text(|f| &f.vara),
        parties,
        last_movement: latest.map(|(_, f)| f.text.clone()).unwrap_or_default(),
        last_movement_date: latest.map(|(p, _)| p.publication_date),
        status: latest_text(|f| &f.status),
        source_publication_ids: group.members.iter().map(|(p, _)| p.id).collect(),
    }
}

fn client_draft(owner_id: &str, mention: &PartyMention, process_key: &str) -> ClientDraft {
    ClientDraft {
        owner_id: owner_id.to_string(),
        document: mention.document.clone(),
        name: mention.name.clone(),
        person_type: person_type_for(&mention.document),
        email: mention.email.clone(),
        phone: mention.phone.clone(),
        address: mention.address.clone(),
        related_process_ids: BTreeSet::from([process_key.to_string()]),
    }
}

fn fold_mention(draft: &mut ClientDraft, mention: &PartyMention, process_key: &str) {
    draft.related_process_ids.insert(process_key.to_string());
    for (slot, value) in [
        (&mut draft.name, &mention.name),
        (&mut draft.email, &mention.email),
        (&mut draft.phone, &mention.phone),
        (&mut draft.address, &mention.address),
    ] {
        if slot.is_empty() && !value.is_empty() {
            slot.clone_from(value);
        }
    }
}

/// Plain text of publication content; HTML block elements become line breaks.
pub fn content_text(content: &str) -> String {
    let raw = if content.contains('<') {
        let fragment = Html::parse_fragment(content);
        let mut out = String::with_capacity(content.len());
        for node in fragment.tree.root().descendants() {
            match node.value() {
                Node::Text(text) => out.push_str(text),
                Node::Element(el) if BLOCK_TAGS.contains(&el.name()) => out.push('\n'),
                _ => {}
            }
        }
        out
    } else {
        content.to_string()
    };

    raw.lines()
        .map(|line| line.split_whitespace().collect::<Vec<_>>().join(" "))
        .filter(|line| !line.is_empty())
        .collect::<Vec<_>>()
        .join("\n")
}

/// Deadline in days announced by the text ("prazo de 15 dias"), if any.
pub fn deadline_days_in(text: &str) -> Option<u32> {
    DEADLINE_RE
        .captures(text)
        .and_then(|caps| caps[1].parse().ok())
}

pub fn mentions_urgency(text: &str) -> bool {
    let lowered = text.to_lowercase();
    lowered.contains("urgente") || lowered.contains("urgência") || lowered.contains("urgencia")
}

/// Parses Brazilian-formatted amounts such as `1.234,56` or `1.000`.
pub fn parse_brl_amount(raw: &str) -> Option<f64> {
    let raw = raw.trim().trim_end_matches(['.', ',']);
    let normalized = if raw.contains(',') {
        raw.replace('.', "").replace(',', ".")
    } else if raw.matches('.').count() > 1
        || raw
            .rsplit_once('.')
            .is_some_and(|(_, decimals)| decimals.len() == 3)
    {
        raw.replace('.', "")
    } else {
        raw.to_string()
    };
    normalized.parse().ok()
}

/// Text up to the first comma, parenthesis or sentence break.
fn first_clause(value: &str) -> String {
    let clause = value.split([',', '(']).next().unwrap_or_default();
    clean_value(clause.split(". ").next().unwrap_or_default())
}

fn non_empty(value: String) -> Option<String> {
    if value.is_empty() {
        None
    } else {
        Some(value)
    }
}

fn clean_value(raw: &str) -> String {
    let collapsed = raw.split_whitespace().collect::<Vec<_>>().join(" ");
    let trimmed = collapsed.trim_end_matches(['.', ',', '-', '–', ':']).trim();
    trimmed.chars().take(MAX_FIELD_CHARS).collect()
}

fn floor_char_boundary(text: &str, index: usize) -> usize {
    if index >= text.len() {
        return text.len();
    }
    let mut i = index;
    while !text.is_char_boundary(i) {
        i -= 1;
    }
    i
}

/// Text with any document mention and what follows it removed.
fn strip_documents(value: &str) -> Option<String> {
    let end = DOCUMENT_RE
        .find(value)
        .map(|m| m.start())
        .unwrap_or(value.len());
    let name = value[..end].trim().trim_end_matches(['-', '–', ',', '(', '/']);
    non_empty(clean_value(name))
}

fn is_all_caps(word: &str) -> bool {
    let mut letters = word.chars().filter(|c| c.is_alphabetic()).peekable();
    letters.peek().is_some() && letters.all(char::is_uppercase)
}

fn is_connector(word: &str) -> bool {
    NAME_CONNECTORS.contains(&word.to_lowercase().as_str())
}

/// Best-effort party name from the text immediately preceding a document.
fn name_before(prefix: &str) -> Option<String> {
    let prefix = prefix.trim_end();
    let prefix = prefix.strip_suffix('(').unwrap_or(prefix);
    let segment = prefix
        .rsplit(['\n', ';', ':', '|', '(', ')'])
        .next()
        .unwrap_or_default();
    let segment = segment.rsplit(". ").next().unwrap_or_default();
    let mut words = segment.split_whitespace().collect::<Vec<_>>();
    while let Some(last) = words.last() {
        let bare = last
            .trim_matches(|c: char| matches!(c, ',' | '.' | ':' | '-' | '–' | '/'))
            .to_lowercase();
        if bare.is_empty() || NAME_STOP_WORDS.contains(&bare.as_str()) {
            words.pop();
        } else {
            break;
        }
    }
    let last = words.pop()?.trim_end_matches([',', ';', '-', '–', '/']);
    words.push(last);

    // Legal texts usually print party names in capitals; prefer that run.
    let picked = if is_all_caps(last) {
        let mut start = words.len();
        while start > 0 {
            let word = words[start - 1];
            if is_all_caps(word) || is_connector(word) {
                start -= 1;
            } else {
                break;
            }
        }
        while start < words.len() && is_connector(words[start]) {
            start += 1;
        }
        &words[start..]
    } else {
        &words[..]
    };

    if picked.is_empty() || picked.len() > MAX_NAME_WORDS {
        return None;
    }
    let name = picked.join(" ");
    if name.chars().filter(|c| c.is_alphabetic()).count() < 2 || name.chars().count() > MAX_NAME_CHARS {
        return None;
    }
    Some(name)
}
