//! Store port: document read/write with optimistic concurrency.
//!
//! The persistent store is an external document database. Every versioned
//! read returns `(seq_no, primary_term)` tokens; every update must supply
//! the tokens from the matching read, so racing writers are detected rather
//! than silently overwritten.

use async_trait::async_trait;
use serde_json::Value;

use crate::domain::errors::StoreResult;

/// Concurrency tokens captured on read and required on update.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConcurrencyToken {
    pub seq_no: u64,
    pub primary_term: u64,
}

/// A document together with the tokens from the read that produced it.
#[derive(Debug, Clone)]
pub struct Versioned<T> {
    pub doc: T,
    pub seq_no: u64,
    pub primary_term: u64,
}

impl<T> Versioned<T> {
    pub fn token(&self) -> ConcurrencyToken {
        ConcurrencyToken {
            seq_no: self.seq_no,
            primary_term: self.primary_term,
        }
    }

    /// Map the document while carrying the tokens.
    pub fn map<U>(self, f: impl FnOnce(T) -> U) -> Versioned<U> {
        Versioned {
            doc: f(self.doc),
            seq_no: self.seq_no,
            primary_term: self.primary_term,
        }
    }
}

/// Refresh behavior for writes. `WaitFor` blocks until the write is visible
/// to subsequent reads; used whenever a follow-up read must observe it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Refresh {
    #[default]
    None,
    WaitFor,
}

/// Sort direction for search.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SortOrder {
    Asc,
    Desc,
}

/// Sort specification on one field.
#[derive(Debug, Clone)]
pub struct Sort {
    pub field: String,
    pub order: SortOrder,
}

impl Sort {
    pub fn desc(field: impl Into<String>) -> Self {
        Self {
            field: field.into(),
            order: SortOrder::Desc,
        }
    }

    pub fn asc(field: impl Into<String>) -> Self {
        Self {
            field: field.into(),
            order: SortOrder::Asc,
        }
    }
}

/// Query AST understood by the store. Deliberately small: only the shapes
/// the core actually issues.
#[derive(Debug, Clone)]
pub enum Query {
    MatchAll,
    /// Exact value on one field.
    Term { field: String, value: Value },
    /// All subqueries must match.
    And(Vec<Query>),
    /// Negation.
    Not(Box<Query>),
    /// Keyword relevance across several fields.
    MultiMatch { fields: Vec<String>, text: String },
    /// Numeric/date range, inclusive bounds.
    Range {
        field: String,
        gte: Option<Value>,
        lte: Option<Value>,
    },
    /// Pure vector search.
    Knn {
        field: String,
        vector: Vec<f32>,
        k: usize,
        num_candidates: usize,
    },
    /// Keyword + vector combined with reciprocal-rank fusion.
    Rrf {
        keyword: Box<Query>,
        knn: Box<Query>,
        rank_window: usize,
        rank_constant: f64,
    },
}

/// A search request against one index.
#[derive(Debug, Clone)]
pub struct SearchRequest {
    pub index: String,
    pub query: Query,
    pub size: usize,
    pub sort: Option<Sort>,
}

impl SearchRequest {
    pub fn new(index: impl Into<String>, query: Query) -> Self {
        Self {
            index: index.into(),
            query,
            size: 10,
            sort: None,
        }
    }

    pub fn with_size(mut self, size: usize) -> Self {
        self.size = size;
        self
    }

    pub fn with_sort(mut self, sort: Sort) -> Self {
        self.sort = Some(sort);
        self
    }
}

/// One search result.
#[derive(Debug, Clone)]
pub struct SearchHit {
    pub id: String,
    pub score: f64,
    pub source: Value,
}

/// A named ES|QL parameter. Values travel separately from query text.
#[derive(Debug, Clone, PartialEq)]
pub struct EsqlParam {
    pub name: String,
    pub value: Value,
}

impl EsqlParam {
    pub fn new(name: impl Into<String>, value: Value) -> Self {
        Self {
            name: name.into(),
            value,
        }
    }
}

/// Columnar ES|QL result.
#[derive(Debug, Clone, Default)]
pub struct EsqlResult {
    pub columns: Vec<String>,
    pub rows: Vec<Vec<Value>>,
}

impl EsqlResult {
    pub fn new(columns: Vec<String>, rows: Vec<Vec<Value>>) -> Self {
        Self { columns, rows }
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    /// Index of a column by name. Callers extract values by column name,
    /// never by position.
    pub fn column_index(&self, name: &str) -> Option<usize> {
        self.columns.iter().position(|c| c == name)
    }

    /// Value of `column` in row `row_idx`.
    pub fn value(&self, row_idx: usize, column: &str) -> Option<&Value> {
        let col = self.column_index(column)?;
        self.rows.get(row_idx)?.get(col)
    }

    /// All values of one column, in row order.
    pub fn column_values(&self, column: &str) -> Vec<&Value> {
        match self.column_index(column) {
            Some(col) => self.rows.iter().filter_map(|r| r.get(col)).collect(),
            None => Vec::new(),
        }
    }

    /// Rows as JSON objects keyed by column name.
    pub fn as_objects(&self) -> Vec<serde_json::Map<String, Value>> {
        self.rows
            .iter()
            .map(|row| {
                self.columns
                    .iter()
                    .cloned()
                    .zip(row.iter().cloned())
                    .collect()
            })
            .collect()
    }
}

/// One operation of a bulk write.
#[derive(Debug, Clone)]
pub enum BulkOp {
    Index {
        index: String,
        id: Option<String>,
        doc: Value,
    },
    Create {
        index: String,
        id: String,
        doc: Value,
    },
}

/// The store port. All incident mutation flows through `update` with tokens
/// from a matching `get`.
#[async_trait]
pub trait Store: Send + Sync {
    /// Versioned read.
    async fn get(&self, index: &str, id: &str) -> StoreResult<Versioned<Value>>;

    /// Create-only write; fails with `AlreadyExists` when the id is taken.
    async fn create(&self, index: &str, id: &str, doc: Value, refresh: Refresh) -> StoreResult<()>;

    /// Token-guarded partial update (shallow merge of `patch`); fails with
    /// `ConcurrencyConflict` when the tokens are stale.
    async fn update(
        &self,
        index: &str,
        id: &str,
        patch: Value,
        token: ConcurrencyToken,
        refresh: Refresh,
    ) -> StoreResult<()>;

    /// Unversioned index write; generates an id when none is given.
    async fn index(
        &self,
        index: &str,
        id: Option<&str>,
        doc: Value,
        refresh: Refresh,
    ) -> StoreResult<String>;

    async fn search(&self, request: SearchRequest) -> StoreResult<Vec<SearchHit>>;

    /// Merge `patch` into every document matching `query`; returns the
    /// number of documents updated.
    async fn update_by_query(&self, index: &str, query: Query, patch: Value) -> StoreResult<u64>;

    async fn bulk(&self, ops: Vec<BulkOp>) -> StoreResult<()>;

    /// Parameterized ES|QL query. Parameter values are bound by name and
    /// never interpolated into the query text.
    async fn esql(&self, query: &str, params: Vec<EsqlParam>) -> StoreResult<EsqlResult>;
}
