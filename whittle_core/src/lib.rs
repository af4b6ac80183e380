//! whittle_core: a delta-debugging (ddmin) test-case minimizer.
//!
//! Given a byte input that makes an external command fail, the engine
//! searches for a 1-minimal subsequence that still fails. The pieces:
//! [`chunkset::ChunkSet`] represents candidates as byte ranges over the
//! fixed input, [`materialize::Materializer`] writes them to temp files,
//! [`template::CommandTemplate`] builds the subject's argv,
//! [`predicate::FailurePredicate`] defines "fail",
//! [`oracle::CommandOracle`] runs and classifies the subject, and
//! [`engine::DdminEngine`] drives the search with memoized verdicts.

pub mod cache;
pub mod chunkset;
pub mod config;
pub mod engine;
pub mod materialize;
pub mod oracle;
pub mod predicate;
pub mod source;
pub mod template;

pub use cache::QueryCache;
pub use chunkset::{Chunk, ChunkSet};
pub use config::{ConfigError, MinimizerConfig};
pub use engine::{DdminEngine, EngineError, Minimization, MinimizeStats};
pub use materialize::Materializer;
pub use oracle::{CommandOracle, FnOracle, Oracle, OracleError, QueryOutcome, Verdict};
pub use predicate::{FailurePredicate, PredicateError, PredicateSpec, WriteWatch};
pub use source::{Source, SourceError};
pub use template::{CommandTemplate, TemplateError};
