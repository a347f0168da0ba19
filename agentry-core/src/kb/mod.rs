//! Knowledge base — document ingestion and hybrid retrieval.
//!
//! Ingestion runs parse -> chunk -> summarize -> embed -> persist, recording
//! terminal state on the document row (`ready` with a chunk count, or
//! `failed` with a truncated error) so background failures stay observable.
//! Retrieval fuses dense cosine ranking with lexical term matching by
//! reciprocal rank; with no embeddings available it degrades to lexical
//! matching alone. Memories are embedded free-text notes with the same
//! search behaviour, returned as whole records.

pub mod chunk;
pub mod parse;
pub mod search;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use uuid::Uuid;

use crate::error::{EngineError, Result};
use crate::models::{ChatClient, EmbeddingClient, ModelConfig};
use crate::store::Store;
use crate::types::{ChatMessage, truncate_utf8};
use crate::vault::parse_store_time;

pub use chunk::{Chunk, chunk_text};
pub use parse::{DocFormat, MAX_FILE_SIZE, extract_text};
pub use search::{cosine_similarity, rrf_fuse};

/// Characters of source text fed to the L0 summary.
const L0_INPUT_CHARS: usize = 8_000;
/// Characters of source text fed to the L1 overview.
const L1_INPUT_CHARS: usize = 16_000;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DocStatus {
    Pending,
    Processing,
    Ready,
    Failed,
}

impl std::fmt::Display for DocStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            DocStatus::Pending => "pending",
            DocStatus::Processing => "processing",
            DocStatus::Ready => "ready",
            DocStatus::Failed => "failed",
        };
        write!(f, "{s}")
    }
}

impl std::str::FromStr for DocStatus {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "pending" => Ok(DocStatus::Pending),
            "processing" => Ok(DocStatus::Processing),
            "ready" => Ok(DocStatus::Ready),
            "failed" => Ok(DocStatus::Failed),
            other => Err(format!("unknown document status: {other}")),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Document {
    pub id: Uuid,
    pub team_id: Uuid,
    pub filename: String,
    pub format: String,
    pub status: DocStatus,
    /// Short L0 summary (~100 tokens).
    pub summary: String,
    /// Long L1 overview (300-500 words).
    pub overview: String,
    pub chunk_count: u32,
    pub error: Option<String>,
    pub created_at: DateTime<Utc>,
}

/// One retrieval hit.
#[derive(Debug, Clone, Serialize)]
pub struct SearchHit {
    pub chunk_id: i64,
    pub document_id: Uuid,
    pub content: String,
    pub score: f64,
}

/// An agent-authored memory note.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Memory {
    pub id: Uuid,
    pub team_id: Uuid,
    pub agent_id: Uuid,
    pub content: String,
    pub created_at: DateTime<Utc>,
}

struct ChunkRow {
    id: i64,
    document_id: Uuid,
    content: String,
    embedding: Option<Vec<f32>>,
}

/// The knowledge base.
pub struct KnowledgeBase {
    store: Arc<Store>,
    embeddings: EmbeddingClient,
    chat: ChatClient,
}

impl KnowledgeBase {
    pub fn new(store: Arc<Store>) -> Self {
        Self {
            store,
            embeddings: EmbeddingClient::new(),
            chat: ChatClient::new(),
        }
    }

    /// Create a `pending` document row for an upload.
    pub fn create_document(&self, team_id: &Uuid, filename: &str) -> Result<Document> {
        let format = DocFormat::from_filename(filename).map_err(EngineError::Ingest)?;
        let id = Uuid::new_v4();
        self.store.with_conn(|conn| {
            conn.execute(
                "INSERT INTO kb_documents (id, team_id, filename, format) VALUES (?1, ?2, ?3, ?4)",
                rusqlite::params![
                    id.to_string(),
                    team_id.to_string(),
                    filename,
                    format.as_str()
                ],
            )?;
            Ok(())
        })?;
        self.get_document(team_id, &id)
    }

    /// Run the full ingest pipeline for a document. Pipeline failures are
    /// recorded on the row and returned as the `failed` document, not as an
    /// error, so supervised background ingestion can simply log the outcome.
    pub async fn process(
        &self,
        team_id: &Uuid,
        doc_id: &Uuid,
        bytes: &[u8],
        embed_config: Option<&ModelConfig>,
        summary_config: Option<&ModelConfig>,
        cancel: &CancellationToken,
    ) -> Result<Document> {
        let document = self.get_document(team_id, doc_id)?;
        self.set_status(team_id, doc_id, DocStatus::Processing, None, 0)?;

        match self
            .run_pipeline(team_id, doc_id, &document, bytes, embed_config, summary_config, cancel)
            .await
        {
            Ok(chunk_count) => {
                self.set_status(team_id, doc_id, DocStatus::Ready, None, chunk_count)?;
                info!(doc_id = %doc_id, chunks = chunk_count, "Document ingested");
            }
            Err(e) => {
                let message = truncate_utf8(&e.to_string(), 500).to_string();
                warn!(doc_id = %doc_id, error = %message, "Document ingestion failed");
                self.set_status(team_id, doc_id, DocStatus::Failed, Some(&message), 0)?;
            }
        }
        self.get_document(team_id, doc_id)
    }

    async fn run_pipeline(
        &self,
        team_id: &Uuid,
        doc_id: &Uuid,
        document: &Document,
        bytes: &[u8],
        embed_config: Option<&ModelConfig>,
        summary_config: Option<&ModelConfig>,
        cancel: &CancellationToken,
    ) -> Result<u32> {
        let format = DocFormat::from_filename(&document.filename).map_err(EngineError::Ingest)?;
        let text = extract_text(format, bytes).map_err(EngineError::Ingest)?;
        let chunks = chunk_text(&text);
        if chunks.is_empty() {
            return Err(EngineError::Ingest(crate::error::IngestError::Parse {
                message: "document contains no extractable text".into(),
            }));
        }

        let (summary, overview) = self.summarize(&text, summary_config, cancel).await;

        let vectors = match embed_config {
            Some(config) => {
                let texts: Vec<String> = chunks.iter().map(|c| c.content.clone()).collect();
                let vectors = self
                    .embeddings
                    .embed(config, &texts, cancel)
                    .await
                    .map_err(EngineError::Model)?;
                Some(vectors)
            }
            None => None,
        };

        self.store.with_tx(|tx| {
            tx.execute(
                "DELETE FROM kb_chunks WHERE document_id = ?1",
                [doc_id.to_string()],
            )?;
            for (seq, chunk) in chunks.iter().enumerate() {
                let embedding = vectors
                    .as_ref()
                    .and_then(|v| v.get(seq))
                    .map(|v| search::encode_embedding(v));
                tx.execute(
                    "INSERT INTO kb_chunks (document_id, team_id, seq, content, token_count, embedding)
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                    rusqlite::params![
                        doc_id.to_string(),
                        team_id.to_string(),
                        seq as i64,
                        chunk.content,
                        chunk.token_count as i64,
                        embedding
                    ],
                )?;
            }
            tx.execute(
                "UPDATE kb_documents SET summary = ?2, overview = ?3, updated_at = datetime('now')
                 WHERE id = ?1",
                rusqlite::params![doc_id.to_string(), summary, overview],
            )?;
            Ok(())
        })?;

        Ok(chunks.len() as u32)
    }

    /// Generate the tiered summaries with the cheap model, falling back to
    /// prefix-truncation stubs when no model is available or the call fails.
    async fn summarize(
        &self,
        text: &str,
        summary_config: Option<&ModelConfig>,
        cancel: &CancellationToken,
    ) -> (String, String) {
        let l0_input = truncate_utf8(text, L0_INPUT_CHARS);
        let l1_input = truncate_utf8(text, L1_INPUT_CHARS);

        let stub_l0 = truncate_utf8(text, 400).trim().to_string();
        let stub_l1 = truncate_utf8(text, 2_500).trim().to_string();

        let Some(config) = summary_config else {
            return (stub_l0, stub_l1);
        };

        let l0 = self
            .summary_call(
                config,
                "Summarize the following document in one to two sentences (about 100 tokens).",
                l0_input,
                cancel,
            )
            .await;
        let l1 = self
            .summary_call(
                config,
                "Write a 300-500 word overview of the following document.",
                l1_input,
                cancel,
            )
            .await;

        (l0.unwrap_or(stub_l0), l1.unwrap_or(stub_l1))
    }

    async fn summary_call(
        &self,
        config: &ModelConfig,
        instruction: &str,
        input: &str,
        cancel: &CancellationToken,
    ) -> Option<String> {
        let messages = vec![
            ChatMessage::system(instruction),
            ChatMessage::user(input),
        ];
        match self
            .chat
            .chat_completion_with_retry(config, &messages, None, cancel, 1)
            .await
        {
            Ok(completion) if !completion.content.trim().is_empty() => {
                Some(completion.content.trim().to_string())
            }
            Ok(_) => None,
            Err(e) => {
                warn!(error = %e, "Summary generation failed, using stub");
                None
            }
        }
    }

    pub fn get_document(&self, team_id: &Uuid, id: &Uuid) -> Result<Document> {
        let found = self.store.with_conn(|conn| {
            conn.query_row(
                "SELECT filename, format, status, summary, overview, chunk_count, error, created_at
                 FROM kb_documents WHERE id = ?1 AND team_id = ?2",
                rusqlite::params![id.to_string(), team_id.to_string()],
                |row| {
                    let status: String = row.get(2)?;
                    let created: String = row.get(7)?;
                    Ok(Document {
                        id: *id,
                        team_id: *team_id,
                        filename: row.get(0)?,
                        format: row.get(1)?,
                        status: status.parse().unwrap_or(DocStatus::Pending),
                        summary: row.get(3)?,
                        overview: row.get(4)?,
                        chunk_count: row.get::<_, i64>(5)? as u32,
                        error: row.get(6)?,
                        created_at: parse_store_time(&created),
                    })
                },
            )
            .map(Some)
            .or_else(|e| match e {
                rusqlite::Error::QueryReturnedNoRows => Ok(None),
                other => Err(other),
            })
        })?;
        found.ok_or_else(|| EngineError::not_found("document"))
    }

    pub fn list_documents(&self, team_id: &Uuid) -> Result<Vec<Document>> {
        let ids: Vec<String> = self.store.with_conn(|conn| {
            let mut stmt = conn.prepare_cached(
                "SELECT id FROM kb_documents WHERE team_id = ?1 ORDER BY created_at, id",
            )?;
            let rows = stmt.query_map([team_id.to_string()], |row| row.get(0))?;
            rows.collect()
        })?;
        ids.iter()
            .filter_map(|id| Uuid::parse_str(id).ok())
            .map(|id| self.get_document(team_id, &id))
            .collect()
    }

    pub fn delete_document(&self, team_id: &Uuid, id: &Uuid) -> Result<()> {
        let deleted = self.store.with_conn(|conn| {
            conn.execute(
                "DELETE FROM kb_documents WHERE id = ?1 AND team_id = ?2",
                rusqlite::params![id.to_string(), team_id.to_string()],
            )
        })?;
        if deleted == 0 {
            return Err(EngineError::not_found("document"));
        }
        Ok(())
    }

    /// Ordered chunk contents of a document.
    pub fn document_chunks(&self, team_id: &Uuid, doc_id: &Uuid) -> Result<Vec<String>> {
        self.get_document(team_id, doc_id)?;
        self.store.with_conn(|conn| {
            let mut stmt = conn.prepare_cached(
                "SELECT content FROM kb_chunks WHERE document_id = ?1 ORDER BY seq",
            )?;
            let rows = stmt.query_map([doc_id.to_string()], |row| row.get(0))?;
            rows.collect()
        })
    }

    fn set_status(
        &self,
        team_id: &Uuid,
        id: &Uuid,
        status: DocStatus,
        error: Option<&str>,
        chunk_count: u32,
    ) -> Result<()> {
        self.store.with_conn(|conn| {
            conn.execute(
                "UPDATE kb_documents SET status = ?3, error = ?4, chunk_count = ?5,
                        updated_at = datetime('now')
                 WHERE id = ?1 AND team_id = ?2",
                rusqlite::params![
                    id.to_string(),
                    team_id.to_string(),
                    status.to_string(),
                    error,
                    chunk_count as i64
                ],
            )?;
            Ok(())
        })
    }

    /// Hybrid search over ready chunks.
    pub async fn search(
        &self,
        team_id: &Uuid,
        query: &str,
        top_k: usize,
        doc_filter: Option<&[Uuid]>,
        embed_config: Option<&ModelConfig>,
        cancel: &CancellationToken,
    ) -> Result<Vec<SearchHit>> {
        let query_embedding = match embed_config {
            Some(config) => {
                match self
                    .embeddings
                    .embed(config, &[query.to_string()], cancel)
                    .await
                {
                    Ok(mut vectors) => vectors.pop(),
                    Err(e) => {
                        // Degrade to lexical-only rather than failing search.
                        warn!(error = %e, "Query embedding failed, lexical fallback");
                        None
                    }
                }
            }
            None => None,
        };
        self.search_with_query_embedding(team_id, query, top_k, doc_filter, query_embedding)
    }

    /// The fusion core, separated from the embedding call for testability.
    pub(crate) fn search_with_query_embedding(
        &self,
        team_id: &Uuid,
        query: &str,
        top_k: usize,
        doc_filter: Option<&[Uuid]>,
        query_embedding: Option<Vec<f32>>,
    ) -> Result<Vec<SearchHit>> {
        if top_k == 0 {
            return Ok(Vec::new());
        }
        let rows = self.chunk_rows(team_id, doc_filter)?;
        let terms = search::query_terms(query);

        // Lexical arm: term-match count over lower-cased content.
        let mut lexical: Vec<(i64, usize)> = rows
            .iter()
            .filter_map(|row| {
                let count = search::term_match_count(&row.content.to_lowercase(), &terms);
                (count > 0).then_some((row.id, count))
            })
            .collect();
        lexical.sort_by(|a, b| b.1.cmp(&a.1).then_with(|| a.0.cmp(&b.0)));
        lexical.truncate(2 * top_k);
        let lexical_ids: Vec<i64> = lexical.iter().map(|(id, _)| *id).collect();

        let Some(query_embedding) = query_embedding else {
            // Lexical-only fallback.
            return Ok(self.hits_for(
                &rows,
                lexical
                    .into_iter()
                    .take(top_k)
                    .map(|(id, count)| (id, count as f64))
                    .collect(),
            ));
        };

        // Dense arm: brute-force cosine over stored vectors.
        let mut dense: Vec<(i64, f32)> = rows
            .iter()
            .filter_map(|row| {
                row.embedding
                    .as_ref()
                    .map(|v| (row.id, cosine_similarity(&query_embedding, v)))
            })
            .collect();
        dense.sort_by(|a, b| {
            b.1.partial_cmp(&a.1)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then_with(|| a.0.cmp(&b.0))
        });
        dense.truncate(2 * top_k);
        let dense_ids: Vec<i64> = dense.iter().map(|(id, _)| *id).collect();

        let fused = rrf_fuse(&[dense_ids, lexical_ids], top_k);
        Ok(self.hits_for(&rows, fused))
    }

    fn hits_for(&self, rows: &[ChunkRow], scored: Vec<(i64, f64)>) -> Vec<SearchHit> {
        scored
            .into_iter()
            .filter_map(|(id, score)| {
                rows.iter().find(|r| r.id == id).map(|row| SearchHit {
                    chunk_id: row.id,
                    document_id: row.document_id,
                    content: row.content.clone(),
                    score,
                })
            })
            .collect()
    }

    fn chunk_rows(&self, team_id: &Uuid, doc_filter: Option<&[Uuid]>) -> Result<Vec<ChunkRow>> {
        let rows: Vec<(i64, String, String, Option<String>)> = self.store.with_conn(|conn| {
            let mut stmt = conn.prepare_cached(
                "SELECT c.id, c.document_id, c.content, c.embedding
                 FROM kb_chunks c JOIN kb_documents d ON d.id = c.document_id
                 WHERE c.team_id = ?1 AND d.status = 'ready'
                 ORDER BY c.id",
            )?;
            let mapped = stmt.query_map([team_id.to_string()], |row| {
                Ok((row.get(0)?, row.get(1)?, row.get(2)?, row.get(3)?))
            })?;
            mapped.collect()
        })?;

        Ok(rows
            .into_iter()
            .filter_map(|(id, doc, content, embedding)| {
                let document_id = Uuid::parse_str(&doc).ok()?;
                if let Some(filter) = doc_filter {
                    if !filter.contains(&document_id) {
                        return None;
                    }
                }
                Some(ChunkRow {
                    id,
                    document_id,
                    content,
                    embedding: embedding.as_deref().and_then(search::decode_embedding),
                })
            })
            .collect())
    }

    /// Store an agent memory, embedding it when a config is available.
    pub async fn add_memory(
        &self,
        team_id: &Uuid,
        agent_id: &Uuid,
        content: &str,
        embed_config: Option<&ModelConfig>,
        cancel: &CancellationToken,
    ) -> Result<Memory> {
        let content = content.trim();
        if content.is_empty() {
            return Err(EngineError::invalid("memory content must not be empty"));
        }
        let embedding = match embed_config {
            Some(config) => self
                .embeddings
                .embed(config, &[content.to_string()], cancel)
                .await
                .ok()
                .and_then(|mut v| v.pop())
                .map(|v| search::encode_embedding(&v)),
            None => None,
        };

        let id = Uuid::new_v4();
        self.store.with_conn(|conn| {
            conn.execute(
                "INSERT INTO kb_memories (id, team_id, agent_id, content, embedding)
                 VALUES (?1, ?2, ?3, ?4, ?5)",
                rusqlite::params![
                    id.to_string(),
                    team_id.to_string(),
                    agent_id.to_string(),
                    content,
                    embedding
                ],
            )?;
            Ok(())
        })?;
        Ok(Memory {
            id,
            team_id: *team_id,
            agent_id: *agent_id,
            content: content.to_string(),
            created_at: Utc::now(),
        })
    }

    /// Hybrid search over memories, returned as whole records.
    pub async fn search_memories(
        &self,
        team_id: &Uuid,
        query: &str,
        top_k: usize,
        embed_config: Option<&ModelConfig>,
        cancel: &CancellationToken,
    ) -> Result<Vec<Memory>> {
        let query_embedding = match embed_config {
            Some(config) => self
                .embeddings
                .embed(config, &[query.to_string()], cancel)
                .await
                .ok()
                .and_then(|mut v| v.pop()),
            None => None,
        };
        self.search_memories_with_embedding(team_id, query, top_k, query_embedding)
    }

    pub(crate) fn search_memories_with_embedding(
        &self,
        team_id: &Uuid,
        query: &str,
        top_k: usize,
        query_embedding: Option<Vec<f32>>,
    ) -> Result<Vec<Memory>> {
        let rows: Vec<(String, String, String, Option<String>, String)> =
            self.store.with_conn(|conn| {
                let mut stmt = conn.prepare_cached(
                    "SELECT id, agent_id, content, embedding, created_at
                     FROM kb_memories WHERE team_id = ?1 ORDER BY created_at, id",
                )?;
                let mapped = stmt.query_map([team_id.to_string()], |row| {
                    Ok((
                        row.get(0)?,
                        row.get(1)?,
                        row.get(2)?,
                        row.get(3)?,
                        row.get(4)?,
                    ))
                })?;
                mapped.collect()
            })?;

        let terms = search::query_terms(query);
        let mut lexical: Vec<(usize, usize)> = rows
            .iter()
            .enumerate()
            .filter_map(|(i, row)| {
                let count = search::term_match_count(&row.2.to_lowercase(), &terms);
                (count > 0).then_some((i, count))
            })
            .collect();
        lexical.sort_by(|a, b| b.1.cmp(&a.1).then_with(|| a.0.cmp(&b.0)));
        lexical.truncate(2 * top_k);
        let lexical_ids: Vec<usize> = lexical.iter().map(|(i, _)| *i).collect();

        let ranked: Vec<usize> = match query_embedding {
            Some(query_embedding) => {
                let mut dense: Vec<(usize, f32)> = rows
                    .iter()
                    .enumerate()
                    .filter_map(|(i, row)| {
                        row.3
                            .as_deref()
                            .and_then(search::decode_embedding)
                            .map(|v| (i, cosine_similarity(&query_embedding, &v)))
                    })
                    .collect();
                dense.sort_by(|a, b| {
                    b.1.partial_cmp(&a.1)
                        .unwrap_or(std::cmp::Ordering::Equal)
                        .then_with(|| a.0.cmp(&b.0))
                });
                dense.truncate(2 * top_k);
                let dense_ids: Vec<usize> = dense.iter().map(|(i, _)| *i).collect();
                rrf_fuse(&[dense_ids, lexical_ids], top_k)
                    .into_iter()
                    .map(|(i, _)| i)
                    .collect()
            }
            None => lexical_ids.into_iter().take(top_k).collect(),
        };

        Ok(ranked
            .into_iter()
            .filter_map(|i| {
                let row = rows.get(i)?;
                Some(Memory {
                    id: Uuid::parse_str(&row.0).ok()?,
                    team_id: *team_id,
                    agent_id: Uuid::parse_str(&row.1).unwrap_or_default(),
                    content: row.2.clone(),
                    created_at: parse_store_time(&row.4),
                })
            })
            .collect())
    }
}
