//! # docsync
//!
//! Incremental loader that keeps a relational metadata store and a
//! full-text search index in step with a tree of XML documents, plus the
//! ranked "most viewed" / "most cited" reports over the loaded data.
//!
//! ## Architecture
//!
//! ```text
//! ┌────────────┐   ┌────────────┐   ┌─────────────┐   ┌──────────────┐
//! │ FileStore  │──▶│ freshness  │──▶│  compiler   │──▶│ MultiStore   │
//! │ (XML tree) │   │  check     │   │  adapter    │   │   writer     │
//! └────────────┘   └────────────┘   └─────────────┘   └──────┬───────┘
//!                                                            │
//!                                  ┌─────────────────────────┤
//!                                  ▼                         ▼
//!                            ┌──────────┐             ┌─────────────┐
//!                            │  SQLite  │             │ SearchIndex │
//!                            │ (store)  │             │ docs/authors│
//!                            └────┬─────┘             │  /glossary  │
//!                                 │                   └─────────────┘
//!                   ┌─────────────┴──────┐
//!                   ▼                    ▼
//!             ┌───────────┐       ┌─────────────┐
//!             │ whatsnew  │       │ ranked query│
//!             │  report   │       │  composer   │
//!             └───────────┘       └─────────────┘
//! ```
//!
//! ## Quick Start
//!
//! ```bash
//! docsync init                          # create schema
//! docsync load --no-check               # compile and load changed files
//! docsync load --reverse --halfway      # second loader from the other end
//! docsync whatsnew --days 7             # issue-update report from history
//! docsync most-viewed --title 'Freud*'  # ranked report
//! ```
//!
//! ## Modules
//!
//! | Module | Purpose |
//! |--------|---------|
//! | [`config`] | TOML configuration parsing |
//! | [`error`] | Library error type |
//! | [`logging`] | `tracing` subscriber setup |
//! | [`db`] | SQLite connection pools |
//! | [`migrate`] | Relational schema and report views |
//! | [`models`] | File descriptors, article metadata, keys |
//! | [`file_store`] | Listing, reading and writing the XML tree |
//! | [`extract`] | Metadata and reference extraction from compiled XML |
//! | [`compiler`] | Raw-to-compiled transformation with telemetry |
//! | [`freshness`] | Index-timestamp comparison |
//! | [`index`] | Search index cores (SQLite FTS5 and in-memory) |
//! | [`relational`] | Relational store operations |
//! | [`writer`] | One document into every store |
//! | [`ingest`] | Batch sync controller |
//! | [`progress`] | Load progress on stderr |
//! | [`whatsnew`] | Issue-update report |
//! | [`query`] | Ranked report query composer |
//! | [`ranked`] | Ranked report execution and rendering |
//! | [`stats`] | Store statistics |

pub mod compiler;
pub mod config;
pub mod db;
pub mod error;
pub mod extract;
pub mod file_store;
pub mod freshness;
pub mod index;
pub mod ingest;
pub mod logging;
pub mod migrate;
pub mod models;
pub mod progress;
pub mod query;
pub mod ranked;
pub mod relational;
pub mod stats;
pub mod whatsnew;
pub mod writer;
