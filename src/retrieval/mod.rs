//! Per-query answer synthesis: rewrite, vector search, grounded generation,
//! citation resolution and audit logging.

pub mod audit;
pub mod chat;
pub mod citations;


use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use itertools::Itertools;
use serde::Serialize;
use tracing::{debug, info, warn};

use crate::LibrarianError;
use crate::config::Config;
use crate::database::{Catalog, LoadedDatabase};
use crate::embeddings::EmbedderHandle;

pub use audit::{QueryLogEntry, write_query_log};
pub use chat::{ChatService, OpenAiChat, RetryPolicy};
pub use citations::{UNRESOLVED_CITATION, cited_ranks, resolve_citations};

/// Answer text returned when the answer model fails on every attempt
pub const GENERATION_FAILED: &str = "❌ Error generating answer. Try again.";

/// Instruction asking the rewrite model to sharpen a query without answering it
#[inline]
pub fn rewrite_prompt(query: &str) -> String {
    format!(
        "You are assisting with analytical research across any subject area. \
         Given an initial query, produce a more precise and detailed version that highlights \
         the key entities, relationships, methods, metrics, or timeframes that would lead to \
         the most relevant evidence in a knowledge base. Keep the tone neutral, avoid \
         assumptions, and do not answer the question\u{2014}only rewrite it.\n\n\
         User query:\n{}",
        query
    )
}

/// Grounding instruction plus the numbered context block
#[inline]
pub fn answer_prompt(context: &str, question: &str) -> String {
    format!(
        "You are an analytical assistant who must respond using only the supplied context.\n\
         Deliver concise, well-structured reasoning and highlight implications or comparisons \
         when helpful. Use bracketed citations like [1], [2, 5] to support your answer, and \
         only cite chunks provided.\n\n\
         Context:\n{}\n\n\
         User question: {}",
        context, question
    )
}

/// A search hit resolved to its metadata, numbered for citation
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RetrievedChunk {
    /// 1-based position in the search results
    pub rank: u64,
    pub id: i64,
    pub score: f32,
    pub source_file: String,
    pub doi: String,
    pub text: String,
}

impl RetrievedChunk {
    /// The line this chunk contributes to the context block
    #[inline]
    pub fn context_line(&self) -> String {
        format!("[{}] {}", self.rank, self.text)
    }
}

/// Answer text with its citation map (rank to source id)
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Answer {
    pub text: String,
    pub citations: BTreeMap<u64, String>,
}

impl Answer {
    #[inline]
    pub fn degraded(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            citations: BTreeMap::new(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetrieverSettings {
    pub rewrite_model: String,
    pub answer_model: String,
    pub top_k: usize,
    pub retry: RetryPolicy,
    /// Where query logs go; `None` disables logging
    pub log_dir: Option<PathBuf>,
}

impl RetrieverSettings {
    #[inline]
    pub fn from_config(config: &Config) -> Self {
        Self {
            rewrite_model: config.openai.rewrite_model.clone(),
            answer_model: config.openai.answer_model.clone(),
            top_k: config.query.top_k,
            retry: RetryPolicy::from_config(&config.openai),
            log_dir: Some(config.log_dir()),
        }
    }
}

/// Answers queries against a loaded database
pub struct Retriever {
    embedder: Arc<EmbedderHandle>,
    chat: Arc<dyn ChatService>,
    settings: RetrieverSettings,
}

impl Retriever {
    #[inline]
    pub fn new(
        embedder: Arc<EmbedderHandle>,
        chat: Arc<dyn ChatService>,
        settings: RetrieverSettings,
    ) -> Self {
        Self {
            embedder,
            chat,
            settings,
        }
    }

    /// Reformulate `query` for retrieval, falling back to it unchanged on failure
    #[inline]
    pub fn rewrite(&self, query: &str) -> String {
        let prompt = rewrite_prompt(query);
        match self.settings.retry.run("Query rewrite", || {
            self.chat.complete(&self.settings.rewrite_model, &prompt)
        }) {
            Ok(refined) => {
                debug!("Rewrote query to: {}", refined);
                refined
            }
            Err(e) => {
                warn!("Query rewrite failed, using the original query: {:#}", e);
                query.to_string()
            }
        }
    }

    /// Top-K chunks for `query`, numbered by result position
    #[inline]
    pub fn retrieve(&self, database: &LoadedDatabase, query: &str) -> Result<Vec<RetrievedChunk>> {
        let vector = self
            .embedder
            .embed_query(query)
            .context("Failed to embed query")?;
        let hits = database
            .index
            .search(&vector, self.settings.top_k)
            .with_context(|| format!("Failed to search database '{}'", database.name))?;

        let mut chunks = Vec::new();
        for (position, hit) in hits.iter().enumerate() {
            let Some(record) = database.metadata.get(hit.id) else {
                continue;
            };
            chunks.push(RetrievedChunk {
                rank: u64::try_from(position + 1).unwrap_or(u64::MAX),
                id: hit.id,
                score: hit.score,
                source_file: record.source_file.clone(),
                doi: record.doi.clone(),
                text: record.text.clone(),
            });
        }

        debug!("Retrieved {} chunks from '{}'", chunks.len(), database.name);
        Ok(chunks)
    }

    /// Grounded answer to `question` from `chunks`, or `None` once every attempt failed
    #[inline]
    pub fn generate(&self, question: &str, chunks: &[RetrievedChunk]) -> Option<String> {
        let context = chunks.iter().map(RetrievedChunk::context_line).join("\n\n");
        let prompt = answer_prompt(&context, question);

        self.settings
            .retry
            .run("Answer generation", || {
                self.chat.complete(&self.settings.answer_model, &prompt)
            })
            .map_err(|e| warn!("Answer generation failed: {:#}", e))
            .ok()
    }

    /// Run the full query pipeline against `database`
    #[inline]
    pub fn answer(&self, database: &LoadedDatabase, query: &str) -> Result<Answer> {
        if query.trim().is_empty() {
            return Err(LibrarianError::Validation("query is empty".to_string()).into());
        }

        let refined = self.rewrite(query);
        let chunks = self.retrieve(database, &refined)?;

        let Some(reply) = self.generate(&refined, &chunks) else {
            return Ok(Answer::degraded(GENERATION_FAILED));
        };

        let citations = resolve_citations(&reply, |rank| {
            chunks
                .iter()
                .find(|chunk| chunk.rank == rank)
                .map(|chunk| chunk.doi.clone())
        });

        if let Some(dir) = &self.settings.log_dir {
            let now = chrono::Local::now();
            let entry = QueryLogEntry::new(
                now,
                query,
                &refined,
                chunks.iter().map(RetrievedChunk::context_line).collect(),
                &reply,
                citations.clone(),
            );
            if let Err(e) = write_query_log(dir, now, &entry) {
                warn!("Failed to write query log: {:#}", e);
            }
        }

        info!(
            "Answered query against '{}' with {} citations",
            database.name,
            citations.len()
        );
        Ok(Answer {
            text: reply,
            citations,
        })
    }

    /// Drop cached service clients after a credential or configuration change
    #[inline]
    pub fn reset(&self) {
        self.chat.reset();
        self.embedder.reset();
    }
}

/// Query front end over a catalog. Every failure becomes a readable answer.
pub struct QueryEngine {
    catalog: Arc<Catalog>,
    retriever: Retriever,
}

impl QueryEngine {
    #[inline]
    pub fn new(catalog: Arc<Catalog>, retriever: Retriever) -> Self {
        Self { catalog, retriever }
    }

    #[inline]
    pub fn ask(&self, database: &str, query: &str) -> Answer {
        let loaded = match self.catalog.load(database) {
            Ok(loaded) => loaded,
            Err(e) => {
                warn!("Database '{}' unavailable: {:#}", database, e);
                return Answer::degraded(format!(
                    "⚠️ Selected database '{}' is not available.",
                    database
                ));
            }
        };

        match self.retriever.answer(&loaded, query) {
            Ok(answer) => answer,
            Err(e) => {
                warn!("Query against '{}' failed: {:#}", database, e);
                Answer::degraded(format!("⚠️ Unable to answer the question: {:#}", e))
            }
        }
    }

    #[inline]
    pub fn list_databases(&self) -> Result<Vec<String>> {
        self.catalog.list()
    }

    #[inline]
    pub fn reset_clients(&self) {
        self.retriever.reset();
    }
}
