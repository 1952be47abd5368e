//! Config-schema retrieval

pub mod retrieval;

pub use retrieval::SchemaRetrievalHandler;
