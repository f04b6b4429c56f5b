use async_trait::async_trait;
use chrono::{DateTime, Datelike, TimeZone, Utc};
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use tantivy::collector::{Count, TopDocs};
use tantivy::directory::MmapDirectory;
use tantivy::query::{Query, QueryParser, TermQuery};
use tantivy::schema::{
    Field, IndexRecordOption, NumericOptions, Schema, TextFieldIndexing, TextOptions, Value,
    STORED, STRING,
};
use tantivy::tokenizer::{Language, LowerCaser, SimpleTokenizer, Stemmer, StopWordFilter, TextAnalyzer};
use tantivy::{Index, IndexReader, IndexWriter, Order, ReloadPolicy, TantivyDocument, Term};
use tracing::{debug, warn};

use crate::error::{CrawlerError, CrawlerResult};
use crate::models::{Court, DocumentStatus, LegalDocument};
use crate::storage::{ArchiveStore, DocumentStore, StorageStats};

/// Name of the registered German analyzer chain.
const GERMAN_TOKENIZER: &str = "de_text";

/// Writer heap, generous enough for bulk reindexing.
const WRITER_BUDGET_BYTES: usize = 50_000_000;

/// Stop words removed before stemming. Tantivy's `SimpleTokenizer` splits
/// on non-alphanumerics, so these cover the high-frequency function words
/// of German legal prose.
const GERMAN_STOP_WORDS: &[&str] = &[
    "aber", "als", "am", "an", "auch", "auf", "aus", "bei", "bis", "das", "dass", "dem", "den",
    "der", "des", "die", "durch", "ein", "eine", "einem", "einen", "einer", "eines", "er", "es",
    "für", "gegen", "hat", "im", "in", "ist", "mit", "nach", "nicht", "noch", "nur", "oder",
    "sich", "sie", "sind", "über", "um", "und", "unter", "vom", "von", "vor", "war", "wird",
    "wurde", "zu", "zum", "zur",
];

/// Indexed/stored fields of the document collection.
struct SearchFields {
    document_id: Field,
    court: Field,
    ecli: Field,
    source_url: Field,
    status: Field,
    title: Field,
    subject: Field,
    summary: Field,
    case_number: Field,
    document_type: Field,
    norms: Field,
    leitsatz: Field,
    tenor: Field,
    gruende: Field,
    full_text: Field,
    file_path: Field,
    decision_date: Field,
    crawled_at: Field,
    created_at: Field,
    updated_at: Field,
    indexed_at: Field,
    year: Field,
    month: Field,
    all_text: Field,
}

fn build_schema() -> (Schema, SearchFields) {
    let mut builder = Schema::builder();

    let german_text = TextOptions::default().set_stored().set_indexing_options(
        TextFieldIndexing::default()
            .set_tokenizer(GERMAN_TOKENIZER)
            .set_index_option(IndexRecordOption::WithFreqsAndPositions),
    );
    let german_copy = TextOptions::default().set_indexing_options(
        TextFieldIndexing::default()
            .set_tokenizer(GERMAN_TOKENIZER)
            .set_index_option(IndexRecordOption::WithFreqsAndPositions),
    );
    let stored_ts = NumericOptions::default().set_stored();
    let indexed_ts = NumericOptions::default().set_stored().set_indexed().set_fast();

    let fields = SearchFields {
        document_id: builder.add_text_field("document_id", STRING | STORED),
        court: builder.add_text_field("court", STRING | STORED),
        ecli: builder.add_text_field("ecli_identifier", STRING | STORED),
        source_url: builder.add_text_field("source_url", STRING | STORED),
        status: builder.add_text_field("status", STRING | STORED),
        title: builder.add_text_field("title", german_text.clone()),
        subject: builder.add_text_field("subject", german_text.clone()),
        summary: builder.add_text_field("summary", german_text.clone()),
        case_number: builder.add_text_field("case_number", german_text.clone()),
        document_type: builder.add_text_field("document_type", STRING | STORED),
        norms: builder.add_text_field("norms", german_text.clone()),
        leitsatz: builder.add_text_field("leitsatz", german_text.clone()),
        tenor: builder.add_text_field("tenor", german_text.clone()),
        gruende: builder.add_text_field("gruende", german_text.clone()),
        full_text: builder.add_text_field("full_text", german_text),
        file_path: builder.add_text_field("file_path", TextOptions::default().set_stored()),
        decision_date: builder.add_i64_field("decision_date", indexed_ts.clone()),
        crawled_at: builder.add_i64_field("crawled_at", indexed_ts.clone()),
        created_at: builder.add_i64_field("created_at", stored_ts.clone()),
        updated_at: builder.add_i64_field("updated_at", stored_ts.clone()),
        indexed_at: builder.add_i64_field("indexed_at", stored_ts),
        year: builder.add_i64_field("year", indexed_ts.clone()),
        month: builder.add_i64_field("month", indexed_ts),
        // Unified copy field backing default queries; indexed, never stored.
        all_text: builder.add_text_field("all_text", german_copy),
    };
    (builder.build(), fields)
}

fn german_analyzer() -> TextAnalyzer {
    TextAnalyzer::builder(SimpleTokenizer::default())
        .filter(LowerCaser)
        .filter(StopWordFilter::remove(
            GERMAN_STOP_WORDS.iter().map(|s| s.to_string()).collect::<Vec<_>>(),
        ))
        .filter(Stemmer::new(Language::German))
        .build()
}

/// **Search Index Store**
///
/// Tantivy-backed document store with a German analyzer chain (lower-casing,
/// stop words, light stemming) and a unified `all_text` copy field behind
/// default queries. Upserts delete-then-add by `document_id` and commit
/// immediately, so a write is visible to the next query. Multi-valued reads
/// degrade to the first value.
pub struct SearchStore {
    index: Index,
    reader: IndexReader,
    writer: Mutex<IndexWriter>,
    fields: SearchFields,
}

impl SearchStore {
    /// Open (or create) the index at `path`.
    pub fn open(path: &Path) -> CrawlerResult<Self> {
        std::fs::create_dir_all(path)?;
        let (schema, fields) = build_schema();
        let dir = MmapDirectory::open(path).map_err(|e| CrawlerError::Index(e.to_string()))?;
        let index = Index::open_or_create(dir, schema)?;
        index.tokenizers().register(GERMAN_TOKENIZER, german_analyzer());

        let writer: IndexWriter = index.writer(WRITER_BUDGET_BYTES)?;
        let reader = index
            .reader_builder()
            .reload_policy(ReloadPolicy::Manual)
            .try_into()?;

        debug!("Search index opened at {}", path.display());
        Ok(Self {
            index,
            reader,
            writer: Mutex::new(writer),
            fields,
        })
    }

    /// Rebuild the index from the archive, the source of truth in dual mode.
    pub async fn reindex_from(&self, archive: &ArchiveStore) -> CrawlerResult<u64> {
        let docs = archive.all().await;
        let count = docs.len() as u64;
        {
            let mut writer = self.lock_writer()?;
            writer.delete_all_documents()?;
            for doc in &docs {
                writer.add_document(self.to_tantivy(doc))?;
            }
            writer.commit()?;
        }
        self.reader.reload()?;
        Ok(count)
    }

    fn lock_writer(&self) -> CrawlerResult<std::sync::MutexGuard<'_, IndexWriter>> {
        self.writer
            .lock()
            .map_err(|_| CrawlerError::Index("index writer lock poisoned".to_string()))
    }

    fn to_tantivy(&self, doc: &LegalDocument) -> TantivyDocument {
        let mut tdoc = TantivyDocument::default();
        let f = &self.fields;
        tdoc.add_text(f.document_id, &doc.document_id);
        tdoc.add_text(f.court, doc.court.as_str());
        tdoc.add_text(f.source_url, &doc.source_url);
        tdoc.add_text(f.status, doc.status.as_str());
        if let Some(ecli) = &doc.ecli {
            tdoc.add_text(f.ecli, ecli);
        }
        let mut all_text = String::new();
        let mut add_text = |field: Field, value: &Option<String>| {
            if let Some(value) = value {
                tdoc.add_text(field, value);
                all_text.push_str(value);
                all_text.push(' ');
            }
        };
        add_text(f.title, &doc.title);
        add_text(f.subject, &doc.subject);
        add_text(f.summary, &doc.summary);
        add_text(f.case_number, &doc.case_number);
        add_text(f.norms, &doc.norms);
        add_text(f.leitsatz, &doc.leitsatz);
        add_text(f.tenor, &doc.tenor);
        add_text(f.gruende, &doc.gruende);
        add_text(f.full_text, &doc.full_text);
        if let Some(document_type) = &doc.document_type {
            tdoc.add_text(f.document_type, document_type);
        }
        if let Some(file_path) = &doc.file_path {
            tdoc.add_text(f.file_path, file_path.to_string_lossy());
        }
        tdoc.add_text(f.all_text, all_text.trim_end());

        tdoc.add_i64(f.decision_date, doc.decision_date.timestamp());
        if let Some(crawled_at) = doc.crawled_at {
            tdoc.add_i64(f.crawled_at, crawled_at.timestamp());
        }
        tdoc.add_i64(f.created_at, doc.created_at.timestamp());
        tdoc.add_i64(f.updated_at, doc.updated_at.timestamp());
        tdoc.add_i64(f.indexed_at, Utc::now().timestamp());
        tdoc.add_i64(f.year, doc.decision_date.year() as i64);
        tdoc.add_i64(f.month, doc.decision_date.month() as i64);
        tdoc
    }

    /// Reconstruct a document from stored fields; multi-valued fields
    /// degrade to their first value.
    fn from_tantivy(&self, tdoc: &TantivyDocument) -> Option<LegalDocument> {
        let f = &self.fields;
        let text = |field: Field| -> Option<String> {
            tdoc.get_first(field)
                .and_then(|v| v.as_str())
                .map(|s| s.to_string())
        };
        let int = |field: Field| -> Option<i64> { tdoc.get_first(field).and_then(|v| v.as_i64()) };
        let ts = |field: Field| -> Option<DateTime<Utc>> {
            int(field).and_then(|secs| Utc.timestamp_opt(secs, 0).single())
        };

        let document_id = text(f.document_id)?;
        Some(LegalDocument {
            document_id,
            ecli: text(f.ecli),
            court: text(f.court)
                .and_then(|c| Court::parse(&c))
                .unwrap_or(Court::Unknown),
            source_url: text(f.source_url).unwrap_or_default(),
            decision_date: ts(f.decision_date).unwrap_or_else(Utc::now),
            crawled_at: ts(f.crawled_at),
            title: text(f.title),
            subject: text(f.subject),
            summary: text(f.summary),
            case_number: text(f.case_number),
            document_type: text(f.document_type),
            norms: text(f.norms),
            leitsatz: text(f.leitsatz),
            tenor: text(f.tenor),
            gruende: text(f.gruende),
            full_text: text(f.full_text),
            file_path: text(f.file_path).map(PathBuf::from),
            status: text(f.status)
                .and_then(|s| DocumentStatus::parse(&s))
                .unwrap_or(DocumentStatus::Pending),
            created_at: ts(f.created_at).unwrap_or_else(Utc::now),
            updated_at: ts(f.updated_at).unwrap_or_else(Utc::now),
        })
    }

    fn collect(&self, query: &dyn Query, limit: usize, offset: usize) -> CrawlerResult<Vec<LegalDocument>> {
        let searcher = self.reader.searcher();
        let top = searcher.search(query, &TopDocs::with_limit(limit.max(1)).and_offset(offset))?;
        let mut docs = Vec::with_capacity(top.len());
        for (_score, address) in top {
            let tdoc: TantivyDocument = searcher.doc(address)?;
            if let Some(doc) = self.from_tantivy(&tdoc) {
                docs.push(doc);
            }
        }
        Ok(docs)
    }

    fn collect_ordered_desc(
        &self,
        query: &dyn Query,
        order_field: &str,
        limit: usize,
        offset: usize,
    ) -> CrawlerResult<Vec<LegalDocument>> {
        let searcher = self.reader.searcher();
        let collector = TopDocs::with_limit(limit.max(1))
            .and_offset(offset)
            .order_by_fast_field::<i64>(order_field, Order::Desc);
        let top = searcher.search(query, &collector)?;
        let mut docs = Vec::with_capacity(top.len());
        for (_value, address) in top {
            let tdoc: TantivyDocument = searcher.doc(address)?;
            if let Some(doc) = self.from_tantivy(&tdoc) {
                docs.push(doc);
            }
        }
        Ok(docs)
    }

    fn term_query(&self, field: Field, value: &str) -> TermQuery {
        TermQuery::new(Term::from_field_text(field, value), IndexRecordOption::Basic)
    }

    fn range_query(&self, field_name: &str, low: i64, high: i64) -> CrawlerResult<Box<dyn Query>> {
        let parser = QueryParser::for_index(&self.index, vec![]);
        parser
            .parse_query(&format!("{field_name}:[{low} TO {high}]"))
            .map_err(|e| CrawlerError::Index(e.to_string()))
    }

    fn count_query(&self, query: &dyn Query) -> CrawlerResult<u64> {
        let searcher = self.reader.searcher();
        Ok(searcher.search(query, &Count)? as u64)
    }
}

#[async_trait]
impl DocumentStore for SearchStore {
    async fn upsert(&self, doc: &LegalDocument) -> CrawlerResult<()> {
        {
            let mut writer = self.lock_writer()?;
            writer.delete_term(Term::from_field_text(
                self.fields.document_id,
                &doc.document_id,
            ));
            writer.add_document(self.to_tantivy(doc))?;
            writer.commit()?;
        }
        self.reader.reload()?;
        Ok(())
    }

    async fn find_by_document_id(
        &self,
        document_id: &str,
    ) -> CrawlerResult<Option<LegalDocument>> {
        let query = self.term_query(self.fields.document_id, document_id);
        Ok(self.collect(&query, 1, 0)?.into_iter().next())
    }

    async fn exists_by_source_url(&self, url: &str) -> CrawlerResult<bool> {
        let query = self.term_query(self.fields.source_url, url);
        Ok(self.count_query(&query)? > 0)
    }

    async fn find_by_court(
        &self,
        court: Court,
        limit: usize,
        offset: usize,
    ) -> CrawlerResult<Vec<LegalDocument>> {
        let query = self.term_query(self.fields.court, court.as_str());
        self.collect_ordered_desc(&query, "decision_date", limit, offset)
    }

    async fn find_by_status(&self, status: DocumentStatus) -> CrawlerResult<Vec<LegalDocument>> {
        let query = self.term_query(self.fields.status, status.as_str());
        let total = self.count_query(&query)?;
        self.collect(&query, total as usize, 0)
    }

    async fn find_by_date_range(
        &self,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> CrawlerResult<Vec<LegalDocument>> {
        let query = self.range_query("decision_date", start.timestamp(), end.timestamp())?;
        let total = self.count_query(query.as_ref())?;
        let mut docs = self.collect(query.as_ref(), total as usize, 0)?;
        docs.sort_by_key(|d| d.decision_date);
        Ok(docs)
    }

    async fn find_by_ecli(&self, ecli: &str) -> CrawlerResult<Option<LegalDocument>> {
        let query = self.term_query(self.fields.ecli, ecli);
        Ok(self.collect(&query, 1, 0)?.into_iter().next())
    }

    async fn find_by_crawled_after(
        &self,
        after: DateTime<Utc>,
    ) -> CrawlerResult<Vec<LegalDocument>> {
        let query = self.range_query("crawled_at", after.timestamp() + 1, i64::MAX)?;
        let total = self.count_query(query.as_ref())?;
        self.collect(query.as_ref(), total as usize, 0)
    }

    async fn find_recent(&self, limit: usize) -> CrawlerResult<Vec<LegalDocument>> {
        let query = self.range_query("crawled_at", 0, i64::MAX)?;
        self.collect_ordered_desc(query.as_ref(), "crawled_at", limit, 0)
    }

    async fn search_text(&self, term: &str, limit: usize) -> CrawlerResult<Vec<LegalDocument>> {
        let parser = QueryParser::for_index(&self.index, vec![self.fields.all_text]);
        let query = match parser.parse_query(term) {
            Ok(query) => query,
            Err(e) => {
                debug!("Unparsable search query {term:?}: {e}");
                return Ok(Vec::new());
            }
        };
        self.collect(query.as_ref(), limit, 0)
    }

    async fn count(&self) -> CrawlerResult<u64> {
        Ok(self.reader.searcher().num_docs())
    }

    async fn count_by_status(&self, status: DocumentStatus) -> CrawlerResult<u64> {
        let query = self.term_query(self.fields.status, status.as_str());
        self.count_query(&query)
    }

    async fn count_by_court(&self, court: Court) -> CrawlerResult<u64> {
        let query = self.term_query(self.fields.court, court.as_str());
        self.count_query(&query)
    }

    async fn find_failed_for_retry(
        &self,
        older_than: chrono::Duration,
    ) -> CrawlerResult<Vec<LegalDocument>> {
        let cutoff = Utc::now() - older_than;
        let failed = self.find_by_status(DocumentStatus::Failed).await?;
        Ok(failed
            .into_iter()
            .filter(|doc| doc.updated_at < cutoff)
            .collect())
    }

    async fn delete(&self, document_id: &str) -> CrawlerResult<bool> {
        let existed = self.find_by_document_id(document_id).await?.is_some();
        if existed {
            let mut writer = self.lock_writer()?;
            writer.delete_term(Term::from_field_text(self.fields.document_id, document_id));
            writer.commit()?;
            drop(writer);
            self.reader.reload()?;
        }
        Ok(existed)
    }

    async fn delete_all(&self) -> CrawlerResult<()> {
        {
            let mut writer = self.lock_writer()?;
            writer.delete_all_documents()?;
            writer.commit()?;
        }
        self.reader.reload()?;
        Ok(())
    }

    async fn write_raw(&self, doc: &LegalDocument, _body: &str) -> CrawlerResult<Option<PathBuf>> {
        // The index holds extracted fields only; raw bodies live in the
        // archive backend.
        if doc.file_path.is_none() {
            warn!(
                "No archive path for {}; raw body not persisted by the search backend",
                doc.document_id
            );
        }
        Ok(None)
    }

    async fn stats(&self) -> CrawlerResult<StorageStats> {
        let mut stats = StorageStats {
            total_documents: self.count().await?,
            ..Default::default()
        };
        for status in [
            DocumentStatus::Pending,
            DocumentStatus::Downloaded,
            DocumentStatus::Processed,
            DocumentStatus::Failed,
        ] {
            let count = self.count_by_status(status).await?;
            if count > 0 {
                stats.by_status.insert(status.as_str().to_string(), count);
            }
        }
        for court in Court::all() {
            let count = self.count_by_court(court).await?;
            if count > 0 {
                stats.by_court.insert(court.as_str().to_string(), count);
            }
        }
        Ok(stats)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn doc(id: &str, court: Court, full_text: &str) -> LegalDocument {
        let mut doc = LegalDocument::new(
            id.to_string(),
            format!("https://portal.example/doc?docid={id}"),
        );
        doc.court = court;
        doc.decision_date = Utc.with_ymd_and_hms(2024, 5, 2, 0, 0, 0).unwrap();
        doc.full_text = Some(full_text.to_string());
        doc.crawled_at = Some(Utc::now());
        doc.status = DocumentStatus::Processed;
        doc
    }

    fn store() -> (tempfile::TempDir, SearchStore) {
        let dir = tempfile::tempdir().unwrap();
        let store = SearchStore::open(&dir.path().join("idx")).unwrap();
        (dir, store)
    }

    #[tokio::test]
    async fn upsert_is_visible_and_idempotent() {
        let (_dir, store) = store();
        let mut document = doc("KARE1", Court::Bag, "Die Revision wird zurückgewiesen.");

        store.upsert(&document).await.unwrap();
        document.title = Some("Zweitfassung".to_string());
        store.upsert(&document).await.unwrap();

        assert_eq!(store.count().await.unwrap(), 1);
        let found = store.find_by_document_id("KARE1").await.unwrap().unwrap();
        assert_eq!(found.title.as_deref(), Some("Zweitfassung"));
        assert_eq!(found.court, Court::Bag);
        assert_eq!(found.status, DocumentStatus::Processed);
    }

    #[tokio::test]
    async fn german_stemming_matches_inflections() {
        let (_dir, store) = store();
        store
            .upsert(&doc("KORE1", Court::Bgh, "Der Beklagte hat die Kosten zu tragen."))
            .await
            .unwrap();

        // "Beklagten" stems to the same root as "Beklagte".
        let hits = store.search_text("Beklagten", 10).await.unwrap();
        assert_eq!(hits.len(), 1);
        // Stop words alone match nothing.
        assert!(store.search_text("der", 10).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn term_lookups() {
        let (_dir, store) = store();
        let mut document = doc("KSRE1", Court::Bsg, "Rentenversicherung");
        document.ecli = Some("ECLI:DE:BSG:2024:42".to_string());
        store.upsert(&document).await.unwrap();

        assert!(store
            .exists_by_source_url("https://portal.example/doc?docid=KSRE1")
            .await
            .unwrap());
        assert!(!store
            .exists_by_source_url("https://portal.example/doc?docid=OTHER")
            .await
            .unwrap());
        let by_ecli = store
            .find_by_ecli("ECLI:DE:BSG:2024:42")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(by_ecli.document_id, "KSRE1");
    }

    #[tokio::test]
    async fn court_listing_pages_newest_first() {
        let (_dir, store) = store();
        for (id, day) in [("KARE1", 1), ("KARE2", 15), ("KARE3", 28)] {
            let mut document = doc(id, Court::Bag, "text");
            document.decision_date = Utc.with_ymd_and_hms(2024, 5, day, 0, 0, 0).unwrap();
            store.upsert(&document).await.unwrap();
        }

        let page = store.find_by_court(Court::Bag, 2, 0).await.unwrap();
        assert_eq!(page.len(), 2);
        assert_eq!(page[0].document_id, "KARE3");
        assert_eq!(page[1].document_id, "KARE2");
        let page = store.find_by_court(Court::Bag, 2, 2).await.unwrap();
        assert_eq!(page.len(), 1);
        assert_eq!(page[0].document_id, "KARE1");
    }

    #[tokio::test]
    async fn date_range_and_counts() {
        let (_dir, store) = store();
        for (id, month) in [("A1", 1), ("A2", 5), ("A3", 9)] {
            let mut document = doc(id, Court::Bgh, "text");
            document.decision_date = Utc.with_ymd_and_hms(2024, month, 10, 0, 0, 0).unwrap();
            store.upsert(&document).await.unwrap();
        }

        let spring = store
            .find_by_date_range(
                Utc.with_ymd_and_hms(2024, 3, 1, 0, 0, 0).unwrap(),
                Utc.with_ymd_and_hms(2024, 6, 30, 0, 0, 0).unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(spring.len(), 1);
        assert_eq!(spring[0].document_id, "A2");

        assert_eq!(store.count_by_court(Court::Bgh).await.unwrap(), 3);
        assert_eq!(
            store
                .count_by_status(DocumentStatus::Processed)
                .await
                .unwrap(),
            3
        );
    }

    #[tokio::test]
    async fn delete_and_delete_all() {
        let (_dir, store) = store();
        store.upsert(&doc("D1", Court::Bag, "x")).await.unwrap();
        store.upsert(&doc("D2", Court::Bag, "y")).await.unwrap();

        assert!(store.delete("D1").await.unwrap());
        assert!(!store.delete("D1").await.unwrap());
        assert_eq!(store.count().await.unwrap(), 1);

        store.delete_all().await.unwrap();
        assert_eq!(store.count().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn recent_ordering() {
        let (_dir, store) = store();
        for (id, minutes_ago) in [("R1", 30), ("R2", 10), ("R3", 20)] {
            let mut document = doc(id, Court::Bag, "x");
            document.crawled_at = Some(Utc::now() - chrono::Duration::minutes(minutes_ago));
            store.upsert(&document).await.unwrap();
        }
        let recent = store.find_recent(2).await.unwrap();
        assert_eq!(recent.len(), 2);
        assert_eq!(recent[0].document_id, "R2");
        assert_eq!(recent[1].document_id, "R3");
    }
}
