//! Ports: interfaces to external systems, implemented by adapters.

pub mod embedder;
pub mod store;

pub use embedder::{Embedder, NullEmbedder};
pub use store::{
    BulkOp, ConcurrencyToken, EsqlParam, EsqlResult, Query, Refresh, SearchHit, SearchRequest,
    Sort, SortOrder, Store, Versioned,
};
