//! Field extraction from compiled (canonical) XML.
//!
//! Pulls the article header out of `<artinfo>`, paragraph text out of
//! `<body>//p`, and one [`ReferenceEntry`] per `<bib>//be`. The reference
//! markup is sliced verbatim from the input so it round-trips into the
//! relational store unchanged.

use quick_xml::escape::escape;
use quick_xml::events::{BytesStart, Event};
use quick_xml::Reader;
use std::collections::HashSet;

use crate::error::{Error, Result};
use crate::models::{ArticleMetadata, Author, FileClassification, FileDescriptor, ReferenceEntry};

/// Everything the writer needs from one compiled document.
#[derive(Debug, Clone)]
pub struct ParsedDocument {
    pub metadata: ArticleMetadata,
    pub references: Vec<ReferenceEntry>,
    pub paragraphs: Vec<String>,
    pub word_count: usize,
}

#[derive(Default)]
struct Header {
    found: bool,
    id: Option<String>,
    src_code: Option<String>,
    src_title: Option<String>,
    art_type: Option<String>,
    sectname: Option<String>,
    year: String,
    vol: String,
    issue: String,
    pgrg: String,
    title: String,
}

#[derive(Default)]
struct AuthorBuf {
    first: String,
    last: String,
}

#[derive(Default)]
struct RefBuf {
    start: usize,
    local_id: String,
    rx: Option<String>,
    text: String,
}

fn attr(e: &BytesStart<'_>, name: &[u8]) -> Option<String> {
    e.attributes()
        .flatten()
        .find(|a| a.key.as_ref() == name)
        .and_then(|a| a.unescape_value().ok().map(|v| v.trim().to_string()))
        .filter(|v| !v.is_empty())
}

fn non_empty(s: &str) -> Option<String> {
    let t = collapse_ws(s);
    (!t.is_empty()).then_some(t)
}

fn collapse_ws(s: &str) -> String {
    s.split_whitespace().collect::<Vec<_>>().join(" ")
}

fn within(stack: &[Vec<u8>], name: &[u8]) -> bool {
    stack.iter().any(|n| n.as_slice() == name)
}

/// Parse a compiled document. `file` supplies the logical id fallback and
/// the file-level attributes (timestamp, size, classification).
pub fn parse_document(xml: &[u8], file: &FileDescriptor) -> Result<ParsedDocument> {
    let mut reader = Reader::from_reader(xml);
    let mut buf = Vec::new();
    let mut stack: Vec<Vec<u8>> = Vec::new();

    let mut header = Header::default();
    let mut authors: Vec<Author> = Vec::new();
    let mut author = AuthorBuf::default();
    let mut paragraphs: Vec<String> = Vec::new();
    let mut para = String::new();
    let mut references: Vec<ReferenceEntry> = Vec::new();
    let mut reference: Option<RefBuf> = None;
    let mut word_count = 0usize;

    loop {
        let before = reader.buffer_position() as usize;
        let event = reader
            .read_event_into(&mut buf)
            .map_err(|e| Error::content(&file.logical_id, e))?;
        match event {
            Event::Start(e) => {
                let name = e.local_name().as_ref().to_vec();
                match name.as_slice() {
                    b"artinfo" => read_artinfo(&e, &mut header),
                    b"aut" => author = AuthorBuf::default(),
                    b"p" if within(&stack, b"body") => para.clear(),
                    b"be" => {
                        reference = Some(RefBuf {
                            start: before,
                            local_id: attr(&e, b"id").unwrap_or_default(),
                            rx: attr(&e, b"rx"),
                            text: String::new(),
                        })
                    }
                    _ => {}
                }
                stack.push(name);
            }
            Event::Empty(e) => match e.local_name().as_ref() {
                b"artinfo" => read_artinfo(&e, &mut header),
                b"be" => {
                    let end = reader.buffer_position() as usize;
                    references.push(ReferenceEntry {
                        local_id: attr(&e, b"id").unwrap_or_default(),
                        xml: String::from_utf8_lossy(&xml[before..end]).trim().to_string(),
                        text: String::new(),
                        rx: attr(&e, b"rx"),
                    });
                }
                _ => {}
            },
            Event::Text(t) => {
                let text = match t.unescape() {
                    Ok(s) => s.into_owned(),
                    Err(_) => String::from_utf8_lossy(&t).into_owned(),
                };
                route_text(
                    &stack,
                    &text,
                    &mut header,
                    &mut author,
                    &mut para,
                    reference.as_mut(),
                );
                if within(&stack, b"body") {
                    word_count += text.split_whitespace().count();
                }
            }
            Event::CData(t) => {
                let text = String::from_utf8_lossy(&t).into_owned();
                route_text(
                    &stack,
                    &text,
                    &mut header,
                    &mut author,
                    &mut para,
                    reference.as_mut(),
                );
            }
            Event::End(e) => {
                stack.pop();
                match e.local_name().as_ref() {
                    b"aut" => {
                        if let Some(last) = non_empty(&author.last) {
                            authors.push(Author {
                                first: non_empty(&author.first),
                                last,
                            });
                        }
                    }
                    b"p" if within(&stack, b"body") => {
                        if let Some(p) = non_empty(&para) {
                            paragraphs.push(p);
                        }
                        para.clear();
                    }
                    b"be" => {
                        if let Some(r) = reference.take() {
                            let end = reader.buffer_position() as usize;
                            references.push(ReferenceEntry {
                                local_id: r.local_id,
                                xml: String::from_utf8_lossy(&xml[r.start..end])
                                    .trim()
                                    .to_string(),
                                text: collapse_ws(&r.text),
                                rx: r.rx,
                            });
                        }
                    }
                    _ => {}
                }
            }
            Event::Eof => break,
            _ => {}
        }
        buf.clear();
    }

    if !header.found {
        return Err(Error::content(&file.logical_id, "no <artinfo> header"));
    }

    assign_local_ids(&mut references);

    let metadata = build_metadata(header, authors, references.len(), file);
    Ok(ParsedDocument {
        metadata,
        references,
        paragraphs,
        word_count,
    })
}

fn read_artinfo(e: &BytesStart<'_>, header: &mut Header) {
    header.found = true;
    header.id = attr(e, b"id");
    header.src_code = attr(e, b"j");
    header.src_title = attr(e, b"srctitle");
    header.art_type = attr(e, b"arttype");
    header.sectname = attr(e, b"newsecnm");
}

fn route_text(
    stack: &[Vec<u8>],
    text: &str,
    header: &mut Header,
    author: &mut AuthorBuf,
    para: &mut String,
    reference: Option<&mut RefBuf>,
) {
    if let Some(r) = reference {
        r.text.push_str(text);
        return;
    }
    if within(stack, b"body") {
        if within(stack, b"p") {
            para.push_str(text);
        }
        return;
    }
    if !within(stack, b"artinfo") {
        return;
    }
    if within(stack, b"aut") {
        if within(stack, b"nfirst") {
            author.first.push_str(text);
        } else if within(stack, b"nlast") {
            author.last.push_str(text);
        }
        return;
    }
    let target = if within(stack, b"artyear") {
        &mut header.year
    } else if within(stack, b"artvol") {
        &mut header.vol
    } else if within(stack, b"artiss") {
        &mut header.issue
    } else if within(stack, b"artpgrg") {
        &mut header.pgrg
    } else if within(stack, b"arttitle") {
        &mut header.title
    } else {
        return;
    };
    target.push_str(text);
}

fn build_metadata(
    header: Header,
    authors: Vec<Author>,
    ref_count: usize,
    file: &FileDescriptor,
) -> ArticleMetadata {
    let art_id = header
        .id
        .map(|id| id.to_uppercase())
        .unwrap_or_else(|| file.logical_id.clone());
    let src_code = header.src_code.unwrap_or_else(|| {
        art_id
            .split('.')
            .next()
            .unwrap_or_default()
            .to_string()
    });

    let mut meta = ArticleMetadata {
        art_id,
        src_code,
        src_title_abbr: header.src_title,
        art_type: header.art_type,
        year: header.year.trim().parse().ok(),
        vol: non_empty(&header.vol),
        issue: non_empty(&header.issue),
        page_range: non_empty(&header.pgrg),
        title: non_empty(&header.title),
        authors,
        citeas_xml: String::new(),
        citeas_text: String::new(),
        start_sectname: header.sectname,
        ref_count,
        file_classification: FileClassification::from_path(&file.path.to_string_lossy()),
        filename: file.basename.clone(),
        file_timestamp: file.timestamp,
        file_size: file.size,
    };
    let (xml, text) = citations(&meta);
    meta.citeas_xml = xml;
    meta.citeas_text = text;
    meta
}

/// Machine (XML) and human forms of the document's citation.
pub fn citations(meta: &ArticleMetadata) -> (String, String) {
    let authors = meta.author_citation();
    let year = meta.year.map(|y| y.to_string()).unwrap_or_default();
    let title = meta.title.clone().unwrap_or_default();
    let source = meta
        .src_title_abbr
        .clone()
        .unwrap_or_else(|| meta.src_code.clone());
    let vol = meta.vol.clone().unwrap_or_default();
    let pgrg = meta.page_range.clone().unwrap_or_default();

    let text = format!(
        "{} ({}) {}. {} {}:{}",
        authors, year, title, source, vol, pgrg
    )
    .trim()
    .to_string();

    let xml = format!(
        concat!(
            r#"<p class="citeas"><span class="authors">{}</span> "#,
            r#"(<span class="pubyear">{}</span>) <span class="title">{}</span>. "#,
            r#"<span class="sourcetitle">{}</span> <span class="vol">{}</span>:"#,
            r#"<span class="pgrg">{}</span></p>"#
        ),
        escape(authors.as_str()),
        year,
        escape(title.as_str()),
        escape(source.as_str()),
        escape(vol.as_str()),
        escape(pgrg.as_str())
    );
    (xml, text)
}

/// Make reference ids unique within the document. The first holder of an
/// explicit id keeps it; missing ids get a positional `Bnnn` and any
/// collision gets a `.n` suffix.
fn assign_local_ids(references: &mut [ReferenceEntry]) {
    let mut used = HashSet::new();
    let keep: Vec<bool> = references
        .iter()
        .map(|r| !r.local_id.is_empty() && used.insert(r.local_id.clone()))
        .collect();

    for (n, r) in references.iter_mut().enumerate() {
        if keep[n] {
            continue;
        }
        let base = if r.local_id.is_empty() {
            format!("B{:03}", n + 1)
        } else {
            r.local_id.clone()
        };
        let mut candidate = base.clone();
        let mut suffix = 1;
        while !used.insert(candidate.clone()) {
            candidate = format!("{base}.{suffix}");
            suffix += 1;
        }
        r.local_id = candidate;
    }
}
