//! Tool definitions loaded from JSON at startup.
//!
//! A tool is a parameterized query (ES|QL or search) executable by any
//! agent through the registry. Parameter values never enter query text;
//! they travel in a separate parameter array.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// How a tool retrieves its results.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RetrievalStrategy {
    /// Parameterized ES|QL query.
    Esql,
    /// Keyword multi-match with an optional filter.
    Keyword,
    /// Keyword + vector combined with reciprocal-rank fusion.
    Hybrid,
    /// Pure vector search.
    Knn,
}

impl RetrievalStrategy {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Esql => "esql",
            Self::Keyword => "keyword",
            Self::Hybrid => "hybrid",
            Self::Knn => "knn",
        }
    }
}

/// Declared parameter type for coercion.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ParamType {
    /// Strings or arrays of strings.
    Keyword,
    /// Integer-valued numbers only.
    Integer,
    Double,
    /// IPv4/IPv6 literal as a string.
    Ip,
    /// ISO-8601 string.
    Date,
}

impl ParamType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Keyword => "keyword",
            Self::Integer => "integer",
            Self::Double => "double",
            Self::Ip => "ip",
            Self::Date => "date",
        }
    }
}

/// Schema for one declared parameter.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ParamSpec {
    #[serde(rename = "type")]
    pub param_type: ParamType,
    #[serde(default)]
    pub required: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default: Option<Value>,
}

/// Strategy-specific configuration block.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ToolConfiguration {
    /// ES|QL query text with `?name` placeholders.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub query: Option<String>,
    /// Declared parameter schemas, keyed by name. BTreeMap keeps expansion
    /// order deterministic.
    #[serde(default)]
    pub params: BTreeMap<String, ParamSpec>,
    /// Hybrid: RRF rank window size.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rank_window: Option<usize>,
    /// Hybrid: RRF rank constant.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rank_constant: Option<f64>,
}

/// A tool definition as loaded from its JSON file.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolDefinition {
    pub id: String,
    pub retrieval_strategy: RetrievalStrategy,
    /// Target index for search tools; ES|QL queries name their own sources.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub index: Option<String>,
    /// Fields queried by keyword/hybrid search.
    #[serde(default)]
    pub query_fields: Vec<String>,
    /// Dense-vector field for hybrid/knn search.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub vector_field: Option<String>,
    #[serde(default)]
    pub configuration: ToolConfiguration,
    /// Fields projected into search results; `_id` and `_score` are always
    /// included.
    #[serde(default)]
    pub result_fields: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_results: Option<usize>,
    /// Static filter clause merged into search queries.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub filter: Option<Value>,
    /// Tool uses the LOOKUP JOIN preview and has a client-side fallback.
    #[serde(default, rename = "lookupJoinTechPreview")]
    pub lookup_join_tech_preview: bool,
}

impl ToolDefinition {
    /// Result size, defaulting to 10.
    pub fn size(&self) -> usize {
        self.max_results.unwrap_or(10)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_esql_definition_from_json() {
        let raw = json!({
            "id": "alert-enrichment",
            "retrieval_strategy": "esql",
            "configuration": {
                "query": "FROM vigil-alerts-* | WHERE alert_id == ?alert_id | LIMIT 1",
                "params": {
                    "alert_id": {"type": "keyword", "required": true}
                }
            },
            "max_results": 1
        });
        let def: ToolDefinition = serde_json::from_value(raw).unwrap();
        assert_eq!(def.id, "alert-enrichment");
        assert_eq!(def.retrieval_strategy, RetrievalStrategy::Esql);
        assert!(def.configuration.params["alert_id"].required);
        assert!(!def.lookup_join_tech_preview);
        assert_eq!(def.size(), 1);
    }

    #[test]
    fn test_hybrid_definition_from_json() {
        let raw = json!({
            "id": "runbook-search",
            "retrieval_strategy": "hybrid",
            "index": "vigil-runbooks",
            "query_fields": ["title", "description", "tags"],
            "vector_field": "content_vector",
            "configuration": {"rank_window": 50, "rank_constant": 60.0},
            "result_fields": ["title", "steps", "success_rate"],
            "max_results": 5
        });
        let def: ToolDefinition = serde_json::from_value(raw).unwrap();
        assert_eq!(def.retrieval_strategy, RetrievalStrategy::Hybrid);
        assert_eq!(def.configuration.rank_window, Some(50));
        assert_eq!(def.vector_field.as_deref(), Some("content_vector"));
    }

    #[test]
    fn test_lookup_join_flag_rename() {
        let raw = json!({
            "id": "operational-change-correlation",
            "retrieval_strategy": "esql",
            "configuration": {"query": "FROM vigil-alerts-operational"},
            "lookupJoinTechPreview": true
        });
        let def: ToolDefinition = serde_json::from_value(raw).unwrap();
        assert!(def.lookup_join_tech_preview);
    }

    #[test]
    fn test_default_size() {
        let raw = json!({
            "id": "t",
            "retrieval_strategy": "keyword",
            "index": "vigil-assets"
        });
        let def: ToolDefinition = serde_json::from_value(raw).unwrap();
        assert_eq!(def.size(), 10);
    }
}
