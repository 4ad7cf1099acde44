//! In-memory store adapter.
//!
//! Implements the full Store port against process memory: versioned
//! documents with seq_no/primary_term tokens, the query subset the core
//! issues, and registrable ES|QL fixtures. Serves as the test double and
//! as the backend for local demo runs; production deployments plug a real
//! document database into the same port.

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};

use async_trait::async_trait;
use serde_json::{Map, Value};
use tokio::sync::RwLock;
use uuid::Uuid;

use crate::domain::errors::{StoreError, StoreResult};
use crate::domain::ports::store::{
    BulkOp, ConcurrencyToken, EsqlParam, EsqlResult, Query, Refresh, SearchHit, SearchRequest,
    SortOrder, Store, Versioned,
};

#[derive(Debug, Clone)]
struct StoredDoc {
    doc: Value,
    seq_no: u64,
    primary_term: u64,
}

/// A canned ES|QL response matched by query substring.
#[derive(Debug, Clone)]
pub struct EsqlFixture {
    pub query_contains: String,
    pub result: EsqlResult,
}

#[derive(Debug)]
struct FailureRule {
    query_contains: String,
    error: StoreError,
    remaining: u32,
}

#[derive(Debug)]
struct ConflictRule {
    index: String,
    id: String,
    remaining: u32,
}

/// The in-memory document store.
#[derive(Default)]
pub struct MemoryStore {
    indices: RwLock<HashMap<String, BTreeMap<String, StoredDoc>>>,
    seq_counter: AtomicU64,
    esql_fixtures: RwLock<Vec<EsqlFixture>>,
    esql_failures: RwLock<Vec<FailureRule>>,
    update_conflicts: RwLock<Vec<ConflictRule>>,
    esql_log: RwLock<Vec<String>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn next_seq(&self) -> u64 {
        self.seq_counter.fetch_add(1, Ordering::SeqCst) + 1
    }

    /// Register a canned ES|QL result for queries containing `fragment`.
    /// Earlier registrations win when several match.
    pub async fn register_esql(&self, fragment: impl Into<String>, result: EsqlResult) {
        self.esql_fixtures.write().await.push(EsqlFixture {
            query_contains: fragment.into(),
            result,
        });
    }

    /// Fail the next `times` ES|QL queries containing `fragment`.
    pub async fn fail_esql(&self, fragment: impl Into<String>, error: StoreError, times: u32) {
        self.esql_failures.write().await.push(FailureRule {
            query_contains: fragment.into(),
            error,
            remaining: times,
        });
    }

    /// Report a concurrency conflict on the next `times` updates of a doc,
    /// simulating a racing writer.
    pub async fn inject_update_conflict(
        &self,
        index: impl Into<String>,
        id: impl Into<String>,
        times: u32,
    ) {
        self.update_conflicts.write().await.push(ConflictRule {
            index: index.into(),
            id: id.into(),
            remaining: times,
        });
    }

    /// Every ES|QL query text seen so far, oldest first.
    pub async fn esql_queries(&self) -> Vec<String> {
        self.esql_log.read().await.clone()
    }

    /// Number of documents in an index.
    pub async fn count(&self, index: &str) -> usize {
        self.indices
            .read()
            .await
            .get(index)
            .map_or(0, BTreeMap::len)
    }

    /// All documents of an index in id order. Test helper.
    pub async fn all_docs(&self, index: &str) -> Vec<Value> {
        self.indices
            .read()
            .await
            .get(index)
            .map(|docs| docs.values().map(|d| d.doc.clone()).collect())
            .unwrap_or_default()
    }

    fn shallow_merge(doc: &mut Value, patch: &Value) {
        if let (Some(target), Some(source)) = (doc.as_object_mut(), patch.as_object()) {
            for (k, v) in source {
                target.insert(k.clone(), v.clone());
            }
        }
    }
}

/// Resolve a possibly-dotted field path inside a document.
fn field<'a>(doc: &'a Value, path: &str) -> Option<&'a Value> {
    if let Some(v) = doc.get(path) {
        return Some(v);
    }
    let mut current = doc;
    for part in path.split('.') {
        current = current.get(part)?;
    }
    Some(current)
}

fn cosine(a: &[f32], b: &[f32]) -> f64 {
    let dot: f32 = a.iter().zip(b).map(|(x, y)| x * y).sum();
    let na: f32 = a.iter().map(|x| x * x).sum::<f32>().sqrt();
    let nb: f32 = b.iter().map(|x| x * x).sum::<f32>().sqrt();
    if na == 0.0 || nb == 0.0 {
        0.0
    } else {
        f64::from(dot / (na * nb))
    }
}

fn doc_vector(doc: &Value, path: &str) -> Option<Vec<f32>> {
    field(doc, path)?
        .as_array()?
        .iter()
        .map(|v| v.as_f64().map(|f| f as f32))
        .collect()
}

fn range_cmp(value: &Value, bound: &Value) -> Option<std::cmp::Ordering> {
    match (value.as_f64(), bound.as_f64()) {
        (Some(a), Some(b)) => a.partial_cmp(&b),
        // ISO-8601 timestamps compare lexicographically.
        _ => Some(value.as_str()?.cmp(bound.as_str()?)),
    }
}

/// Score a document against a query. `None` means no match.
fn score(doc: &Value, query: &Query) -> Option<f64> {
    match query {
        Query::MatchAll => Some(1.0),
        Query::Term { field: f, value } => {
            if field(doc, f) == Some(value) {
                Some(1.0)
            } else {
                None
            }
        }
        Query::And(parts) => {
            let mut total = 0.0;
            for part in parts {
                total += score(doc, part)?;
            }
            Some(total)
        }
        Query::Not(inner) => {
            if score(doc, inner).is_none() {
                Some(1.0)
            } else {
                None
            }
        }
        Query::MultiMatch { fields, text } => {
            let needle = text.to_lowercase();
            let tokens: Vec<&str> = needle.split_whitespace().collect();
            let mut hits = 0usize;
            for f in fields {
                if let Some(v) = field(doc, f) {
                    let haystack = match v {
                        Value::String(s) => s.to_lowercase(),
                        other => other.to_string().to_lowercase(),
                    };
                    hits += tokens.iter().filter(|t| haystack.contains(**t)).count();
                }
            }
            if hits > 0 {
                Some(hits as f64)
            } else {
                None
            }
        }
        Query::Range { field: f, gte, lte } => {
            let value = field(doc, f)?;
            if let Some(bound) = gte {
                if range_cmp(value, bound)? == std::cmp::Ordering::Less {
                    return None;
                }
            }
            if let Some(bound) = lte {
                if range_cmp(value, bound)? == std::cmp::Ordering::Greater {
                    return None;
                }
            }
            Some(1.0)
        }
        Query::Knn { field: f, vector, .. } => {
            let doc_vec = doc_vector(doc, f)?;
            Some(cosine(&doc_vec, vector))
        }
        // RRF is handled at search level; as a per-doc score fall back to
        // the max of the two branches.
        Query::Rrf { keyword, knn, .. } => {
            let a = score(doc, keyword);
            let b = score(doc, knn);
            match (a, b) {
                (None, None) => None,
                (x, y) => Some(x.unwrap_or(0.0).max(y.unwrap_or(0.0))),
            }
        }
    }
}

impl MemoryStore {
    async fn ranked_hits(&self, index: &str, query: &Query, size: usize) -> Vec<SearchHit> {
        let indices = self.indices.read().await;
        let Some(docs) = indices.get(index) else {
            return Vec::new();
        };
        let mut hits: Vec<SearchHit> = docs
            .iter()
            .filter_map(|(id, stored)| {
                score(&stored.doc, query).map(|s| SearchHit {
                    id: id.clone(),
                    score: s,
                    source: stored.doc.clone(),
                })
            })
            .collect();
        hits.sort_by(|a, b| b.score.partial_cmp(&a.score).unwrap_or(std::cmp::Ordering::Equal));
        hits.truncate(size);
        hits
    }
}

#[async_trait]
impl Store for MemoryStore {
    async fn get(&self, index: &str, id: &str) -> StoreResult<Versioned<Value>> {
        let indices = self.indices.read().await;
        indices
            .get(index)
            .and_then(|docs| docs.get(id))
            .map(|stored| Versioned {
                doc: stored.doc.clone(),
                seq_no: stored.seq_no,
                primary_term: stored.primary_term,
            })
            .ok_or_else(|| StoreError::NotFound {
                index: index.to_string(),
                id: id.to_string(),
            })
    }

    async fn create(&self, index: &str, id: &str, doc: Value, _refresh: Refresh) -> StoreResult<()> {
        let mut indices = self.indices.write().await;
        let docs = indices.entry(index.to_string()).or_default();
        if docs.contains_key(id) {
            return Err(StoreError::AlreadyExists {
                index: index.to_string(),
                id: id.to_string(),
            });
        }
        docs.insert(
            id.to_string(),
            StoredDoc {
                doc,
                seq_no: self.next_seq(),
                primary_term: 1,
            },
        );
        Ok(())
    }

    async fn update(
        &self,
        index: &str,
        id: &str,
        patch: Value,
        token: ConcurrencyToken,
        _refresh: Refresh,
    ) -> StoreResult<()> {
        {
            let mut conflicts = self.update_conflicts.write().await;
            if let Some(rule) = conflicts
                .iter_mut()
                .find(|r| r.index == index && r.id == id && r.remaining > 0)
            {
                rule.remaining -= 1;
                return Err(StoreError::ConcurrencyConflict {
                    index: index.to_string(),
                    id: id.to_string(),
                });
            }
        }

        let mut indices = self.indices.write().await;
        let stored = indices
            .get_mut(index)
            .and_then(|docs| docs.get_mut(id))
            .ok_or_else(|| StoreError::NotFound {
                index: index.to_string(),
                id: id.to_string(),
            })?;
        if stored.seq_no != token.seq_no || stored.primary_term != token.primary_term {
            return Err(StoreError::ConcurrencyConflict {
                index: index.to_string(),
                id: id.to_string(),
            });
        }
        Self::shallow_merge(&mut stored.doc, &patch);
        stored.seq_no = self.next_seq();
        Ok(())
    }

    async fn index(
        &self,
        index: &str,
        id: Option<&str>,
        doc: Value,
        _refresh: Refresh,
    ) -> StoreResult<String> {
        let id = id.map_or_else(|| Uuid::new_v4().to_string(), ToString::to_string);
        let mut indices = self.indices.write().await;
        let docs = indices.entry(index.to_string()).or_default();
        docs.insert(
            id.clone(),
            StoredDoc {
                doc,
                seq_no: self.next_seq(),
                primary_term: 1,
            },
        );
        Ok(id)
    }

    async fn search(&self, request: SearchRequest) -> StoreResult<Vec<SearchHit>> {
        let mut hits = match &request.query {
            Query::Rrf {
                keyword,
                knn,
                rank_window,
                rank_constant,
            } => {
                // Reciprocal-rank fusion over the two branch rankings.
                let kw = self.ranked_hits(&request.index, keyword, *rank_window).await;
                let kn = self.ranked_hits(&request.index, knn, *rank_window).await;
                let mut fused: Map<String, Value> = Map::new();
                let mut sources: HashMap<String, Value> = HashMap::new();
                for ranking in [&kw, &kn] {
                    for (rank, hit) in ranking.iter().enumerate() {
                        let contribution = 1.0 / (rank_constant + rank as f64 + 1.0);
                        let entry = fused
                            .entry(hit.id.clone())
                            .or_insert(Value::from(0.0));
                        let updated = entry.as_f64().unwrap_or(0.0) + contribution;
                        *entry = Value::from(updated);
                        sources.entry(hit.id.clone()).or_insert_with(|| hit.source.clone());
                    }
                }
                let mut combined: Vec<SearchHit> = fused
                    .into_iter()
                    .filter_map(|(id, s)| {
                        sources.remove(&id).map(|source| SearchHit {
                            id,
                            score: s.as_f64().unwrap_or(0.0),
                            source,
                        })
                    })
                    .collect();
                combined.sort_by(|a, b| {
                    b.score.partial_cmp(&a.score).unwrap_or(std::cmp::Ordering::Equal)
                });
                combined
            }
            other => {
                self.ranked_hits(&request.index, other, usize::MAX).await
            }
        };

        if let Some(sort) = &request.sort {
            hits.sort_by(|a, b| {
                let av = field(&a.source, &sort.field).cloned().unwrap_or(Value::Null);
                let bv = field(&b.source, &sort.field).cloned().unwrap_or(Value::Null);
                let ord = range_cmp(&av, &bv).unwrap_or(std::cmp::Ordering::Equal);
                match sort.order {
                    SortOrder::Asc => ord,
                    SortOrder::Desc => ord.reverse(),
                }
            });
        }
        hits.truncate(request.size);
        Ok(hits)
    }

    async fn update_by_query(&self, index: &str, query: Query, patch: Value) -> StoreResult<u64> {
        let mut indices = self.indices.write().await;
        let Some(docs) = indices.get_mut(index) else {
            return Ok(0);
        };
        let mut updated = 0u64;
        let matching: Vec<String> = docs
            .iter()
            .filter(|(_, stored)| score(&stored.doc, &query).is_some())
            .map(|(id, _)| id.clone())
            .collect();
        for id in matching {
            if let Some(stored) = docs.get_mut(&id) {
                Self::shallow_merge(&mut stored.doc, &patch);
                stored.seq_no = self.next_seq();
                updated += 1;
            }
        }
        Ok(updated)
    }

    async fn bulk(&self, ops: Vec<BulkOp>) -> StoreResult<()> {
        for op in ops {
            match op {
                BulkOp::Index { index, id, doc } => {
                    self.index(&index, id.as_deref(), doc, Refresh::None).await?;
                }
                BulkOp::Create { index, id, doc } => {
                    self.create(&index, &id, doc, Refresh::None).await?;
                }
            }
        }
        Ok(())
    }

    async fn esql(&self, query: &str, _params: Vec<EsqlParam>) -> StoreResult<EsqlResult> {
        self.esql_log.write().await.push(query.to_string());

        {
            let mut failures = self.esql_failures.write().await;
            if let Some(rule) = failures
                .iter_mut()
                .find(|r| query.contains(&r.query_contains) && r.remaining > 0)
            {
                rule.remaining -= 1;
                return Err(rule.error.clone());
            }
        }

        let fixtures = self.esql_fixtures.read().await;
        for fixture in fixtures.iter() {
            if query.contains(&fixture.query_contains) {
                return Ok(fixture.result.clone());
            }
        }
        Ok(EsqlResult::default())
    }
}
