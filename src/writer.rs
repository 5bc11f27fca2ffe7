//! Multi-store writer: one parsed document into the relational store and
//! the search index.
//!
//! Write order per document is tracking row, article row, statistics row,
//! then the index upserts, then the reference rows. Any error before the
//! references fails the whole document; the caller counts it and moves on.

use regex::Regex;
use serde_json::{json, Value};
use tracing::{debug, warn};

use crate::config::LoaderConfig;
use crate::error::{Error, Result};
use crate::extract::ParsedDocument;
use crate::index::{Core, IndexDocument, IndexQuery, SearchIndex, SECTION_START_FIELD};
use crate::models::{format_timestamp, ArticleMetadata, FileDescriptor, SectionKey};
use crate::relational::RelationalStore;

/// Outcome of a successful write.
#[derive(Debug, Clone, PartialEq)]
pub struct WriteResult {
    /// The tracking insert created a new row.
    pub is_new: bool,
    pub core: Core,
    pub references_written: usize,
    /// Section the document claims to open, if any.
    pub section: Option<SectionKey>,
    /// Whether the section-start field survived the first-in-section check.
    pub first_in_section: bool,
}

pub struct MultiStoreWriter<'a> {
    relational: &'a RelationalStore,
    index: &'a dyn SearchIndex,
    glossary: Regex,
    include_paras: bool,
    purge_references: bool,
}

impl<'a> MultiStoreWriter<'a> {
    pub fn new(
        relational: &'a RelationalStore,
        index: &'a dyn SearchIndex,
        loader: &LoaderConfig,
        include_paras: bool,
    ) -> Result<Self> {
        let glossary = Regex::new(&loader.glossary_pattern).map_err(|e| {
            Error::Config(format!("bad glossary pattern '{}': {}", loader.glossary_pattern, e))
        })?;
        Ok(Self {
            relational,
            index,
            glossary,
            include_paras,
            purge_references: loader.purge_references,
        })
    }

    /// Index core a file belongs to, decided by its basename.
    pub fn core_for(&self, file: &FileDescriptor) -> Core {
        if self.glossary.is_match(&file.basename) {
            Core::Glossary
        } else {
            Core::Docs
        }
    }

    pub async fn write(
        &self,
        file: &FileDescriptor,
        parsed: &ParsedDocument,
        compiled: &[u8],
    ) -> Result<WriteResult> {
        let meta = &parsed.metadata;
        let id = meta.art_id.as_str();

        let is_new = self.relational.track_document(id).await?;
        self.relational.upsert_article(meta).await?;
        self.relational
            .upsert_artstat(
                id,
                parsed.word_count,
                parsed.paragraphs.len(),
                parsed.references.len(),
                compiled,
            )
            .await?;

        let core = self.core_for(file);
        let mut first_in_section = false;
        match core {
            Core::Glossary => {
                self.index
                    .upsert(Core::Glossary, self.glossary_document(file, parsed))
                    .await?;
            }
            _ => {
                first_in_section = meta.is_first_in_section() && self.confirmed_first(id).await;
                let mut doc = self.primary_document(file, parsed);
                if first_in_section {
                    if let Some(name) = &meta.start_sectname {
                        doc.fields
                            .insert(SECTION_START_FIELD.to_string(), Value::from(name.as_str()));
                    }
                } else if meta.is_first_in_section() {
                    debug!(id, "not first in section; section start cleared");
                }
                self.index.upsert(Core::Docs, doc).await?;
                self.write_authors(meta, file).await?;
            }
        }

        let references_written = self
            .relational
            .insert_references(id, &parsed.references, self.purge_references)
            .await?;

        Ok(WriteResult {
            is_new,
            core,
            references_written,
            section: meta.section_key(),
            first_in_section,
        })
    }

    /// Re-read the first-in-section view. A failed read counts as "not
    /// first"; end-of-run reconciliation restores the marker if needed.
    async fn confirmed_first(&self, id: &str) -> bool {
        match self.relational.is_first_in_section(id).await {
            Ok(first) => first,
            Err(e) => {
                warn!(id, error = %e, "first-in-section lookup failed");
                false
            }
        }
    }

    fn primary_document(&self, file: &FileDescriptor, parsed: &ParsedDocument) -> IndexDocument {
        let meta = &parsed.metadata;
        let authors: Vec<String> = meta.authors.iter().map(|a| a.display_name()).collect();

        let mut text = vec![meta.title.clone().unwrap_or_default(), authors.join(" ")];
        text.extend(parsed.paragraphs.iter().cloned());

        let mut doc = IndexDocument::new(meta.art_id.clone())
            .with_field("art_id", meta.art_id.as_str())
            .with_field("art_sourcecode", meta.src_code.as_str())
            .with_field("art_sourcetitleabbr", meta.src_title_abbr.clone())
            .with_field("art_type", meta.art_type.clone())
            .with_field("art_year", meta.year)
            .with_field("art_vol", meta.vol.clone())
            .with_field("art_iss", meta.issue.clone())
            .with_field("art_pgrg", meta.page_range.clone())
            .with_field("title", meta.title.clone())
            .with_field("art_authors", json!(authors))
            .with_field("art_citeas_xml", meta.citeas_xml.as_str())
            .with_field("art_citeas_text", meta.citeas_text.as_str())
            .with_field("bib_count", meta.ref_count)
            .with_field("file_classification", meta.file_classification.map(|c| c.as_str()))
            .with_field("file_name", file.basename.as_str())
            .with_field("file_size", meta.file_size);
        if self.include_paras {
            doc = doc.with_field("paras", json!(parsed.paragraphs));
        }
        doc.file_last_modified = Some(file.timestamp_str());
        doc.text = text.join("\n").trim().to_string();
        doc
    }

    fn glossary_document(&self, file: &FileDescriptor, parsed: &ParsedDocument) -> IndexDocument {
        let meta = &parsed.metadata;
        let mut doc = IndexDocument::new(meta.art_id.clone())
            .with_field("art_id", meta.art_id.as_str())
            .with_field("term", meta.title.clone())
            .with_field("art_citeas_xml", meta.citeas_xml.as_str())
            .with_field("file_name", file.basename.as_str());
        doc.file_last_modified = Some(file.timestamp_str());
        doc.text = parsed.paragraphs.join("\n");
        doc
    }

    /// Replace the document's author entries (`{id}.1`, `{id}.2`, ...).
    async fn write_authors(&self, meta: &ArticleMetadata, file: &FileDescriptor) -> Result<()> {
        self.index
            .delete(Core::Authors, &IndexQuery::by_prefix(format!("{}.", meta.art_id)))
            .await?;
        for (n, author) in meta.authors.iter().enumerate() {
            let mut doc = IndexDocument::new(format!("{}.{}", meta.art_id, n + 1))
                .with_field("art_id", meta.art_id.as_str())
                .with_field("art_author_id", author.display_name())
                .with_field("art_author_listed", author.citation_name())
                .with_field("authfirst", author.first.clone())
                .with_field("authlast", author.last.as_str())
                .with_field("art_year", meta.year);
            doc.file_last_modified = Some(format_timestamp(&file.timestamp));
            doc.text = author.display_name();
            self.index.upsert(Core::Authors, doc).await?;
        }
        Ok(())
    }
}
