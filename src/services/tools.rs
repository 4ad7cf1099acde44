//! Tool registry: loads JSON tool definitions and executes them.
//!
//! ES|QL tools validate and coerce parameters against the declared schema
//! and pass values in a separate parameter array, never concatenated into
//! query text. Array parameters referenced as `?name` are expanded to
//! `?name_0, ?name_1, ...` because the query engine rejects array-valued
//! parameters in `IN` clauses. Search tools route to keyword, hybrid
//! (reciprocal-rank fusion), or pure-knn retrieval.

use std::collections::{BTreeMap, HashMap};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use chrono::DateTime;
use serde_json::{json, Map, Value};

use crate::domain::errors::{StoreError, ToolError};
use crate::domain::models::tool::{ParamSpec, ParamType, RetrievalStrategy, ToolDefinition};
use crate::domain::ports::store::{EsqlParam, EsqlResult, Query, SearchRequest, Store};
use crate::domain::ports::Embedder;
use crate::services::concurrency::{retry_with_backoff, with_deadline, RetryPolicy};

/// Registry configuration.
#[derive(Debug, Clone)]
pub struct ToolRegistryConfig {
    /// Per-execution timeout.
    pub timeout: Duration,
    pub retry: RetryPolicy,
}

impl Default for ToolRegistryConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(10),
            retry: RetryPolicy::default(),
        }
    }
}

/// Output of a tool execution.
#[derive(Debug, Clone)]
pub enum ToolOutput {
    Esql(EsqlResult),
    /// Search hits projected to the declared result fields plus `_id` and
    /// `_score`.
    Hits(Vec<Value>),
}

impl ToolOutput {
    pub fn esql(&self) -> Option<&EsqlResult> {
        match self {
            Self::Esql(r) => Some(r),
            Self::Hits(_) => None,
        }
    }

    pub fn hits(&self) -> Option<&[Value]> {
        match self {
            Self::Hits(h) => Some(h),
            Self::Esql(_) => None,
        }
    }
}

/// The shared tool registry.
pub struct ToolRegistry {
    defs: HashMap<String, ToolDefinition>,
    store: Arc<dyn Store>,
    embedder: Arc<dyn Embedder>,
    config: ToolRegistryConfig,
}

impl ToolRegistry {
    pub fn new(
        store: Arc<dyn Store>,
        embedder: Arc<dyn Embedder>,
        defs: Vec<ToolDefinition>,
        config: ToolRegistryConfig,
    ) -> Self {
        let defs = defs.into_iter().map(|d| (d.id.clone(), d)).collect();
        Self {
            defs,
            store,
            embedder,
            config,
        }
    }

    /// Load every `*.json` definition from a directory and build the
    /// registry.
    pub fn from_dir(
        store: Arc<dyn Store>,
        embedder: Arc<dyn Embedder>,
        dir: impl AsRef<Path>,
        config: ToolRegistryConfig,
    ) -> Result<Self, ToolError> {
        let defs = load_definitions(dir.as_ref())?;
        tracing::info!(count = defs.len(), dir = %dir.as_ref().display(), "loaded tool definitions");
        Ok(Self::new(store, embedder, defs, config))
    }

    pub fn get(&self, id: &str) -> Option<&ToolDefinition> {
        self.defs.get(id)
    }

    pub fn ids(&self) -> Vec<&str> {
        let mut ids: Vec<&str> = self.defs.keys().map(String::as_str).collect();
        ids.sort_unstable();
        ids
    }

    /// Execute a tool by id with named parameters.
    pub async fn execute(
        &self,
        id: &str,
        params: &Map<String, Value>,
    ) -> Result<ToolOutput, ToolError> {
        let def = self
            .defs
            .get(id)
            .ok_or_else(|| ToolError::UnknownTool(id.to_string()))?;
        match def.retrieval_strategy {
            RetrievalStrategy::Esql => self.execute_esql(def, params).await.map(ToolOutput::Esql),
            RetrievalStrategy::Keyword | RetrievalStrategy::Hybrid | RetrievalStrategy::Knn => {
                self.execute_search(def, params).await.map(ToolOutput::Hits)
            }
        }
    }

    /// Execute a caller-composed ES|QL query with the registry's timeout,
    /// retry, and array-expansion plumbing. Used by agents whose clause set
    /// is dynamic (e.g. the IoC sweep); parameter values still travel
    /// separately from query text.
    pub async fn execute_dynamic_esql(
        &self,
        label: &str,
        query: &str,
        params: Vec<EsqlParam>,
    ) -> Result<EsqlResult, ToolError> {
        let (expanded_query, expanded_params) = expand_array_params(query, params);
        self.run_esql(label, &expanded_query, expanded_params).await
    }

    async fn execute_esql(
        &self,
        def: &ToolDefinition,
        params: &Map<String, Value>,
    ) -> Result<EsqlResult, ToolError> {
        let query = def.configuration.query.as_deref().ok_or_else(|| {
            ToolError::Definition(format!("tool {} has no query configured", def.id))
        })?;
        let coerced = coerce_params(&def.id, &def.configuration.params, params)?;
        let esql_params: Vec<EsqlParam> = coerced
            .into_iter()
            .map(|(name, value)| EsqlParam::new(name, value))
            .collect();
        let (expanded_query, expanded_params) = expand_array_params(query, esql_params);

        match self.run_esql(&def.id, &expanded_query, expanded_params).await {
            Ok(result) => Ok(result),
            Err(ToolError::Query { source, .. })
                if def.lookup_join_tech_preview && is_lookup_join_error(&source) =>
            {
                tracing::warn!(tool = %def.id, "lookup-join rejected, using client-side fallback");
                self.lookup_join_fallback(def, params).await
            }
            Err(other) => Err(other),
        }
    }

    async fn run_esql(
        &self,
        tool: &str,
        query: &str,
        params: Vec<EsqlParam>,
    ) -> Result<EsqlResult, ToolError> {
        let attempt = || {
            let params = params.clone();
            async move { self.store.esql(query, params).await }
        };
        with_deadline(
            self.config.timeout,
            retry_with_backoff(self.config.retry, StoreError::is_transient, attempt),
        )
        .await
        .map_err(|_| ToolError::DeadlineExceeded {
            tool: tool.to_string(),
            timeout_ms: self.config.timeout.as_millis() as u64,
        })?
        .map_err(|source| ToolError::Query {
            tool: tool.to_string(),
            source,
        })
    }

    /// Client-side two-query fallback, keyed by tool id. Only the change
    /// correlation tool carries one.
    async fn lookup_join_fallback(
        &self,
        def: &ToolDefinition,
        params: &Map<String, Value>,
    ) -> Result<EsqlResult, ToolError> {
        match def.id.as_str() {
            "operational-change-correlation" => {
                self.change_correlation_fallback(params).await
            }
            other => Err(ToolError::Definition(format!(
                "tool {other} has no lookup-join fallback"
            ))),
        }
    }

    /// Fetch change events and error events separately, then join on
    /// service name client-side, producing the same columns as the primary
    /// query.
    async fn change_correlation_fallback(
        &self,
        params: &Map<String, Value>,
    ) -> Result<EsqlResult, ToolError> {
        let service = params
            .get("service")
            .cloned()
            .ok_or_else(|| ToolError::MissingParam {
                tool: "operational-change-correlation".to_string(),
                param: "service".to_string(),
            })?;

        let changes = self
            .run_esql(
                "operational-change-correlation",
                "FROM vigil-alerts-operational \
                 | WHERE event.kind == \"change\" AND service.name == ?service \
                 | KEEP change_type, change_ref, service.name, @timestamp \
                 | SORT @timestamp DESC | LIMIT 20",
                vec![EsqlParam::new("service", service.clone())],
            )
            .await?;
        let errors = self
            .run_esql(
                "operational-change-correlation",
                "FROM vigil-alerts-operational \
                 | WHERE event.kind == \"error\" AND service.name == ?service \
                 | KEEP service.name, @timestamp \
                 | SORT @timestamp ASC | LIMIT 100",
                vec![EsqlParam::new("service", service)],
            )
            .await?;

        let error_times: Vec<DateTime<chrono::Utc>> = errors
            .column_values("@timestamp")
            .into_iter()
            .filter_map(parse_timestamp)
            .collect();

        let mut rows = Vec::new();
        for i in 0..changes.len() {
            let change_at = changes.value(i, "@timestamp").and_then(parse_timestamp);
            let Some(change_at) = change_at else { continue };
            let first_error_after = error_times.iter().find(|t| **t >= change_at);
            let Some(first_error) = first_error_after else { continue };
            let gap = (*first_error - change_at).num_seconds();
            rows.push(vec![
                changes.value(i, "change_type").cloned().unwrap_or(Value::Null),
                changes.value(i, "change_ref").cloned().unwrap_or(Value::Null),
                changes.value(i, "service.name").cloned().unwrap_or(Value::Null),
                json!(change_at),
                json!(first_error),
                json!(gap),
            ]);
        }
        Ok(EsqlResult::new(
            vec![
                "change_type".to_string(),
                "change_ref".to_string(),
                "service.name".to_string(),
                "change_at".to_string(),
                "first_error_at".to_string(),
                "gap_seconds".to_string(),
            ],
            rows,
        ))
    }

    async fn execute_search(
        &self,
        def: &ToolDefinition,
        params: &Map<String, Value>,
    ) -> Result<Vec<Value>, ToolError> {
        let index = def.index.as_deref().ok_or_else(|| {
            ToolError::Definition(format!("search tool {} has no index", def.id))
        })?;
        let text = params
            .get("query")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string();
        let k = def.size();

        let query = match def.retrieval_strategy {
            RetrievalStrategy::Keyword => self.keyword_query(def, &text),
            RetrievalStrategy::Knn => self.knn_query(def, &text, k).await?,
            RetrievalStrategy::Hybrid => Query::Rrf {
                keyword: Box::new(self.keyword_query(def, &text)),
                knn: Box::new(self.knn_query(def, &text, k).await?),
                rank_window: def.configuration.rank_window.unwrap_or(50),
                rank_constant: def.configuration.rank_constant.unwrap_or(60.0),
            },
            RetrievalStrategy::Esql => unreachable!("esql routed separately"),
        };

        let hits = match self.run_search(def, index, query, k).await {
            Ok(hits) => hits,
            Err(ToolError::Query { source, .. })
                if def.retrieval_strategy == RetrievalStrategy::Hybrid
                    && is_rrf_error(&source) =>
            {
                tracing::warn!(tool = %def.id, "RRF rejected, falling back to pure knn");
                let knn = self.knn_query(def, &text, k).await?;
                self.run_search(def, index, knn, k).await?
            }
            Err(other) => return Err(other),
        };
        Ok(hits)
    }

    fn keyword_query(&self, def: &ToolDefinition, text: &str) -> Query {
        let base = Query::MultiMatch {
            fields: def.query_fields.clone(),
            text: text.to_string(),
        };
        match filter_query(def.filter.as_ref()) {
            Some(filter) => Query::And(vec![base, filter]),
            None => base,
        }
    }

    async fn knn_query(&self, def: &ToolDefinition, text: &str, k: usize) -> Result<Query, ToolError> {
        let field = def.vector_field.clone().ok_or_else(|| {
            ToolError::Definition(format!("tool {} has no vector_field", def.id))
        })?;
        let vector = self
            .embedder
            .embed(text)
            .await
            .map_err(|source| ToolError::Query {
                tool: def.id.clone(),
                source,
            })?;
        Ok(Query::Knn {
            field,
            vector,
            k,
            num_candidates: (10 * k).min(100),
        })
    }

    async fn run_search(
        &self,
        def: &ToolDefinition,
        index: &str,
        query: Query,
        size: usize,
    ) -> Result<Vec<Value>, ToolError> {
        let request = SearchRequest::new(index, query).with_size(size);
        let attempt = || {
            let request = request.clone();
            async move { self.store.search(request).await }
        };
        let hits = with_deadline(
            self.config.timeout,
            retry_with_backoff(self.config.retry, StoreError::is_transient, attempt),
        )
        .await
        .map_err(|_| ToolError::DeadlineExceeded {
            tool: def.id.clone(),
            timeout_ms: self.config.timeout.as_millis() as u64,
        })?
        .map_err(|source| ToolError::Query {
            tool: def.id.clone(),
            source,
        })?;

        Ok(hits
            .into_iter()
            .map(|hit| {
                let mut projected = Map::new();
                projected.insert("_id".to_string(), json!(hit.id));
                projected.insert("_score".to_string(), json!(hit.score));
                if def.result_fields.is_empty() {
                    if let Some(source) = hit.source.as_object() {
                        for (k, v) in source {
                            projected.insert(k.clone(), v.clone());
                        }
                    }
                } else {
                    for field in &def.result_fields {
                        if let Some(v) = hit.source.get(field) {
                            projected.insert(field.clone(), v.clone());
                        }
                    }
                }
                Value::Object(projected)
            })
            .collect())
    }
}

/// Read every `*.json` tool definition in `dir`.
pub fn load_definitions(dir: &Path) -> Result<Vec<ToolDefinition>, ToolError> {
    let entries = std::fs::read_dir(dir)
        .map_err(|e| ToolError::Definition(format!("cannot read {}: {e}", dir.display())))?;
    let mut defs = Vec::new();
    for entry in entries {
        let entry =
            entry.map_err(|e| ToolError::Definition(format!("cannot read entry: {e}")))?;
        let path = entry.path();
        if path.extension().and_then(|e| e.to_str()) != Some("json") {
            continue;
        }
        let raw = std::fs::read_to_string(&path)
            .map_err(|e| ToolError::Definition(format!("cannot read {}: {e}", path.display())))?;
        let def: ToolDefinition = serde_json::from_str(&raw)
            .map_err(|e| ToolError::Definition(format!("invalid tool {}: {e}", path.display())))?;
        defs.push(def);
    }
    defs.sort_by(|a, b| a.id.cmp(&b.id));
    Ok(defs)
}

/// Validate and coerce provided params against the declared schema.
fn coerce_params(
    tool: &str,
    specs: &BTreeMap<String, ParamSpec>,
    provided: &Map<String, Value>,
) -> Result<BTreeMap<String, Value>, ToolError> {
    let mut out = BTreeMap::new();
    for (name, spec) in specs {
        let raw = provided.get(name).filter(|v| !v.is_null());
        let value = match (raw, &spec.default, spec.required) {
            (Some(v), _, _) => coerce_value(tool, name, spec.param_type, v)?,
            (None, Some(default), _) => default.clone(),
            (None, None, true) => {
                return Err(ToolError::MissingParam {
                    tool: tool.to_string(),
                    param: name.clone(),
                })
            }
            (None, None, false) => continue,
        };
        out.insert(name.clone(), value);
    }
    Ok(out)
}

fn coerce_value(
    tool: &str,
    name: &str,
    param_type: ParamType,
    raw: &Value,
) -> Result<Value, ToolError> {
    let invalid = |expected: &'static str| ToolError::InvalidParam {
        tool: tool.to_string(),
        param: name.to_string(),
        expected,
    };
    match param_type {
        ParamType::Integer => match raw {
            Value::Number(n) if n.as_i64().is_some() => Ok(raw.clone()),
            Value::Number(n) if n.as_f64().is_some_and(|f| f.fract() == 0.0) => {
                Ok(json!(n.as_f64().unwrap_or(0.0) as i64))
            }
            _ => Err(invalid("an integer-valued number")),
        },
        ParamType::Double => match raw {
            Value::Number(_) => Ok(raw.clone()),
            _ => Err(invalid("a number")),
        },
        ParamType::Date => match raw.as_str() {
            Some(s) if DateTime::parse_from_rfc3339(s).is_ok() => Ok(raw.clone()),
            _ => Err(invalid("an ISO-8601 date string")),
        },
        ParamType::Ip => match raw.as_str() {
            Some(s) if s.parse::<std::net::IpAddr>().is_ok() => Ok(raw.clone()),
            _ => Err(invalid("an IP address literal")),
        },
        ParamType::Keyword => match raw {
            Value::String(_) => Ok(raw.clone()),
            Value::Array(items) if items.iter().all(Value::is_string) => Ok(raw.clone()),
            _ => Err(invalid("a string or array of strings")),
        },
    }
}

/// Rewrite `?name` references to array parameters into
/// `?name_0, ?name_1, ...` and split the array into individual params.
pub fn expand_array_params(
    query: &str,
    params: Vec<EsqlParam>,
) -> (String, Vec<EsqlParam>) {
    let mut expanded_query = query.to_string();
    let mut expanded_params = Vec::with_capacity(params.len());
    for param in params {
        match &param.value {
            Value::Array(items) if query_references(&expanded_query, &param.name) => {
                let placeholders: Vec<String> = (0..items.len())
                    .map(|i| format!("?{}_{i}", param.name))
                    .collect();
                expanded_query = replace_param_token(
                    &expanded_query,
                    &param.name,
                    &placeholders.join(", "),
                );
                for (i, item) in items.iter().enumerate() {
                    expanded_params.push(EsqlParam::new(
                        format!("{}_{i}", param.name),
                        item.clone(),
                    ));
                }
            }
            _ => expanded_params.push(param),
        }
    }
    (expanded_query, expanded_params)
}

fn query_references(query: &str, name: &str) -> bool {
    find_param_token(query, name).is_some()
}

fn is_ident_char(c: char) -> bool {
    c.is_ascii_alphanumeric() || c == '_'
}

fn find_param_token(query: &str, name: &str) -> Option<usize> {
    let token = format!("?{name}");
    let mut from = 0;
    while let Some(pos) = query[from..].find(&token) {
        let start = from + pos;
        let end = start + token.len();
        let boundary = query[end..].chars().next().is_none_or(|c| !is_ident_char(c));
        if boundary {
            return Some(start);
        }
        from = end;
    }
    None
}

fn replace_param_token(query: &str, name: &str, replacement: &str) -> String {
    let token_len = name.len() + 1;
    let mut out = query.to_string();
    while let Some(start) = find_param_token(&out, name) {
        out.replace_range(start..start + token_len, replacement);
    }
    out
}

/// Static filter clause from a definition: each entry becomes an exact
/// term requirement.
fn filter_query(filter: Option<&Value>) -> Option<Query> {
    let obj = filter?.as_object()?;
    let terms: Vec<Query> = obj
        .iter()
        .map(|(field, value)| Query::Term {
            field: field.clone(),
            value: value.clone(),
        })
        .collect();
    match terms.len() {
        0 => None,
        1 => terms.into_iter().next(),
        _ => Some(Query::And(terms)),
    }
}

fn parse_timestamp(value: &Value) -> Option<DateTime<chrono::Utc>> {
    DateTime::parse_from_rfc3339(value.as_str()?)
        .ok()
        .map(|t| t.with_timezone(&chrono::Utc))
}

/// Lookup-join preview rejection signature.
fn is_lookup_join_error(error: &StoreError) -> bool {
    let message = error.to_string().to_lowercase();
    message.contains("lookup join") || message.contains("lookup_join")
}

/// RRF license/parse rejection signature.
fn is_rrf_error(error: &StoreError) -> bool {
    let message = error.to_string().to_lowercase();
    message.contains("rrf") && (message.contains("license") || message.contains("parse"))
}
