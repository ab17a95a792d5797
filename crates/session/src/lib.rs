//! Session and context store.
//!
//! - [`store`]: the [`SessionStore`] façade the orchestrator talks to
//! - [`payload`]: token-budgeted request payloads, pure over `&Session`
//! - [`compaction`]: folding old history into a summary message
//! - [`strategy`]: post-run reflection and strategy rendering
//! - [`persistence`]: file and in-memory backends
//! - [`token`]: token estimation heuristics

pub mod compaction;
pub mod payload;
pub mod persistence;
pub mod store;
pub mod strategy;
pub mod token;

pub use compaction::{CompactionReport, FallbackSummarizer, ProviderSummarizer, Summarizer};
pub use payload::{Payload, PayloadExtras, build_payload};
pub use persistence::{FilePersistence, InMemoryPersistence, SessionPersistence, SessionSummary};
pub use store::SessionStore;
pub use strategy::{reflect, render_strategies};
