//! Tantivy-backed document store.

use crate::extraction::Metadata;
use crate::index::schema::{DocumentFields, build_schema};
use serde::Serialize;
use std::collections::BTreeMap;
use std::path::Path;
use std::sync::{Arc, Mutex};
use tantivy::collector::{Count, TopDocs};
use tantivy::directory::MmapDirectory;
use tantivy::query::QueryParser;
use tantivy::schema::Value;
use tantivy::snippet::SnippetGenerator;
use tantivy::{
    DateTime, Index, IndexReader, IndexSettings, IndexWriter, ReloadPolicy, TantivyDocument,
    TantivyError, Term,
};
use thiserror::Error;

const WRITER_HEAP_BYTES: usize = 50_000_000;

/// Errors returned by the index store.
#[derive(Debug, Error)]
pub enum IndexError {
    /// Tantivy rejected an operation.
    #[error("Index operation failed: {0}")]
    Tantivy(#[from] TantivyError),
    /// The index directory could not be prepared.
    #[error("Index directory error: {0}")]
    Io(#[from] std::io::Error),
    /// The query string could not be parsed.
    #[error("Invalid query {query:?}: {source}")]
    Query {
        /// Query as received.
        query: String,
        /// Parser diagnostic.
        #[source]
        source: tantivy::query::QueryParserError,
    },
    /// Stored metadata could not be encoded or decoded.
    #[error("Failed to encode document data: {0}")]
    Serialization(#[from] serde_json::Error),
    /// A previous writer panicked while holding the lock.
    #[error("Index writer lock poisoned")]
    WriterPoisoned,
    /// A blocking index task was cancelled or panicked.
    #[error("Index task failed: {0}")]
    Task(#[from] tokio::task::JoinError),
}

/// A ranked match returned by [`IndexStore::search`].
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SearchHit {
    /// Document identifier.
    pub id: String,
    /// Relevance score (higher is better).
    pub score: f32,
    /// Stored title.
    pub title: String,
    /// Stored author.
    pub author: String,
    /// Stored content type.
    #[serde(rename = "content-type")]
    pub content_type: String,
    /// Stored open-ended metadata.
    pub data: BTreeMap<String, String>,
    /// HTML snippet of the extracted text around the matched terms.
    pub snippet: String,
}

/// Result set for a query.
#[derive(Debug, Clone, Default, Serialize)]
pub struct SearchResults {
    /// Total number of matching documents.
    pub total: usize,
    /// Best matches, highest score first.
    pub hits: Vec<SearchHit>,
}

/// Search index holding one document per id.
///
/// Cloning is cheap; clones share the same index, reader, and writer.
#[derive(Clone)]
pub struct IndexStore {
    index: Index,
    reader: IndexReader,
    writer: Arc<Mutex<IndexWriter>>,
    fields: DocumentFields,
}

impl IndexStore {
    /// Open the index at `path`, creating it with the fixed schema when none exists yet.
    pub fn open_or_create(path: &Path) -> Result<Self, IndexError> {
        std::fs::create_dir_all(path)?;
        let directory = MmapDirectory::open(path).map_err(TantivyError::from)?;
        let index = if Index::exists(&directory).map_err(TantivyError::from)? {
            tracing::info!(path = %path.display(), "Opening search index");
            Index::open(directory)?
        } else {
            tracing::info!(path = %path.display(), "Creating search index");
            Index::create(directory, build_schema(), IndexSettings::default())?
        };
        Self::from_index(index)
    }

    /// In-memory index, mostly useful for tests.
    pub fn in_memory() -> Result<Self, IndexError> {
        Self::from_index(Index::create_in_ram(build_schema()))
    }

    fn from_index(index: Index) -> Result<Self, IndexError> {
        let fields = DocumentFields::resolve(&index.schema())?;
        let writer = index.writer(WRITER_HEAP_BYTES)?;
        let reader = index
            .reader_builder()
            .reload_policy(ReloadPolicy::Manual)
            .try_into()?;
        Ok(Self {
            index,
            reader,
            writer: Arc::new(Mutex::new(writer)),
            fields,
        })
    }

    /// Index `text` and `metadata` under `id`, replacing any previous document with that id.
    pub async fn store(&self, id: &str, metadata: &Metadata, text: &str) -> Result<(), IndexError> {
        let document = self.build_document(id, metadata, text)?;
        let store = self.clone();
        let id = id.to_string();
        tokio::task::spawn_blocking(move || store.upsert_blocking(&id, document)).await?
    }

    /// Run a free-text query and return at most `limit` hits ordered by relevance.
    pub async fn search(&self, query: &str, limit: usize) -> Result<SearchResults, IndexError> {
        let store = self.clone();
        let query = query.to_string();
        tokio::task::spawn_blocking(move || store.search_blocking(&query, limit)).await?
    }

    fn build_document(
        &self,
        id: &str,
        metadata: &Metadata,
        text: &str,
    ) -> Result<TantivyDocument, IndexError> {
        let fields = &self.fields;
        let mut document = TantivyDocument::default();
        document.add_text(fields.id, id);
        document.add_text(fields.author, &metadata.author);
        document.add_text(fields.content_type, &metadata.content_type);
        document.add_text(fields.title, &metadata.title);
        if let Some(micros) = metadata
            .created
            .and_then(|created| i64::try_from(created.unix_timestamp_nanos() / 1_000).ok())
        {
            document.add_date(fields.created, DateTime::from_timestamp_micros(micros));
        }
        document.add_text(fields.data, serde_json::to_string(&metadata.data)?);
        document.add_text(fields.text, text);
        Ok(document)
    }

    fn upsert_blocking(&self, id: &str, document: TantivyDocument) -> Result<(), IndexError> {
        let mut writer = self.writer.lock().map_err(|_| IndexError::WriterPoisoned)?;
        writer.delete_term(Term::from_field_text(self.fields.id, id));
        let mut committed = writer.add_document(document).map(|_| ());
        if committed.is_ok() {
            committed = writer.commit().map(|_| ());
        }
        if let Err(err) = committed {
            tracing::error!(id, error = %err, "Index commit failed; rolling back");
            if let Err(rollback) = writer.rollback() {
                tracing::warn!(id, error = %rollback, "Rollback failed");
            }
            return Err(err.into());
        }
        drop(writer);

        self.reader.reload()?;
        tracing::debug!(id, "Document indexed");
        Ok(())
    }

    fn search_blocking(&self, query_text: &str, limit: usize) -> Result<SearchResults, IndexError> {
        let searcher = self.reader.searcher();
        let parser = QueryParser::for_index(&self.index, self.fields.default_search_fields());
        let query = parser
            .parse_query(query_text)
            .map_err(|source| IndexError::Query {
                query: query_text.to_string(),
                source,
            })?;

        let (top_docs, total) =
            searcher.search(&query, &(TopDocs::with_limit(limit.max(1)), Count))?;
        let snippets = SnippetGenerator::create(&searcher, &*query, self.fields.text)?;

        let mut hits = Vec::with_capacity(top_docs.len());
        for (score, address) in top_docs {
            let doc: TantivyDocument = searcher.doc(address)?;
            let data = match self.stored_text(&doc, self.fields.data) {
                raw if raw.is_empty() => BTreeMap::new(),
                raw => serde_json::from_str(&raw)?,
            };
            hits.push(SearchHit {
                id: self.stored_text(&doc, self.fields.id),
                score,
                title: self.stored_text(&doc, self.fields.title),
                author: self.stored_text(&doc, self.fields.author),
                content_type: self.stored_text(&doc, self.fields.content_type),
                data,
                snippet: snippets.snippet_from_doc(&doc).to_html(),
            });
        }

        Ok(SearchResults { total, hits })
    }

    fn stored_text(&self, doc: &TantivyDocument, field: tantivy::schema::Field) -> String {
        doc.get_first(field)
            .and_then(|value| value.as_str())
            .unwrap_or_default()
            .to_string()
    }
}
