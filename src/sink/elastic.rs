//! Elasticsearch search sink over the REST API

use super::{AuditDocument, SearchSink};
use crate::error::{AuditError, IndexError, Result};
use crate::types::{AuditFilter, AuditRecord};
use async_trait::async_trait;
use reqwest::{StatusCode, Url};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::time::Duration;

/// Elasticsearch connection settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ElasticsearchConfig {
    /// Cluster base URL
    #[serde(default = "default_url")]
    pub url: String,

    /// Index holding audit documents
    #[serde(default = "default_index")]
    pub index: String,

    /// Per-request timeout in milliseconds
    #[serde(default = "default_timeout_ms")]
    pub timeout_ms: u64,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub username: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub password: Option<String>,
}

fn default_url() -> String {
    "http://127.0.0.1:9200".to_string()
}

fn default_index() -> String {
    "audit_log_search".to_string()
}

fn default_timeout_ms() -> u64 {
    3000
}

impl Default for ElasticsearchConfig {
    fn default() -> Self {
        Self {
            url: default_url(),
            index: default_index(),
            timeout_ms: default_timeout_ms(),
            username: None,
            password: None,
        }
    }
}

/// Search sink backed by an Elasticsearch index
pub struct ElasticsearchSink {
    client: reqwest::Client,
    base_url: Url,
    config: ElasticsearchConfig,
}

impl ElasticsearchSink {
    pub fn new(config: ElasticsearchConfig) -> Result<Self> {
        let base_url = Url::parse(&config.url)
            .map_err(|e| AuditError::Config(format!("elasticsearch url '{}': {}", config.url, e)))?;
        if base_url.cannot_be_a_base() {
            return Err(AuditError::Config(format!(
                "elasticsearch url '{}' cannot be a base",
                config.url
            )));
        }

        let client = reqwest::Client::builder()
            .timeout(Duration::from_millis(config.timeout_ms))
            .build()
            .map_err(|e| AuditError::Config(format!("http client: {}", e)))?;

        Ok(Self {
            client,
            base_url,
            config,
        })
    }

    pub fn index(&self) -> &str {
        &self.config.index
    }

    /// `{base}/{index}/{segments...}` with each segment percent-encoded
    fn endpoint(&self, segments: &[&str]) -> Url {
        let mut url = self.base_url.clone();
        if let Ok(mut path) = url.path_segments_mut() {
            path.pop_if_empty().push(&self.config.index);
            for segment in segments {
                path.push(segment);
            }
        }
        url
    }

    fn authorize(&self, request: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        match self.config.username {
            Some(ref username) => request.basic_auth(username, self.config.password.as_ref()),
            None => request,
        }
    }
}

/// Index mapping for audit documents
pub fn index_mapping() -> Value {
    json!({
        "mappings": {
            "properties": {
                "id": { "type": "long" },
                "traceId": { "type": "keyword" },
                "username": { "type": "keyword" },
                "operation": { "type": "text" },
                "description": { "type": "text" },
                "className": { "type": "keyword" },
                "methodName": { "type": "keyword" },
                "args": { "type": "text" },
                "elapsedTime": { "type": "long" },
                "createTime": { "type": "date", "format": "epoch_millis" },
                "uri": { "type": "keyword" },
                "httpMethod": { "type": "keyword" },
                "ip": { "type": "keyword" }
            }
        }
    })
}

/// `_search` body: keyword over username/operation, inclusive createTime
/// range, newest first
pub fn search_body(filter: &AuditFilter, limit: usize) -> Value {
    let mut must = Vec::new();

    if let Some(ref keyword) = filter.keyword {
        must.push(json!({
            "multi_match": {
                "query": keyword,
                "fields": ["username", "operation"]
            }
        }));
    }

    if filter.start_time.is_some() || filter.end_time.is_some() {
        let mut range = serde_json::Map::new();
        if let Some(start) = filter.start_time {
            range.insert("gte".to_string(), json!(start.timestamp_millis()));
        }
        if let Some(end) = filter.end_time {
            range.insert("lte".to_string(), json!(end.timestamp_millis()));
        }
        range.insert("format".to_string(), json!("epoch_millis"));
        must.push(json!({ "range": { "createTime": range } }));
    }

    let query = if must.is_empty() {
        json!({ "match_all": {} })
    } else {
        json!({ "bool": { "must": must } })
    };

    json!({
        "query": query,
        "sort": [{ "createTime": { "order": "desc" } }],
        "size": limit
    })
}

/// Status codes worth retrying are reported as unavailability
fn is_transient_status(status: StatusCode) -> bool {
    matches!(
        status,
        StatusCode::TOO_MANY_REQUESTS
            | StatusCode::BAD_GATEWAY
            | StatusCode::SERVICE_UNAVAILABLE
            | StatusCode::GATEWAY_TIMEOUT
    )
}

#[derive(Deserialize)]
struct SearchResponse {
    hits: Hits,
}

#[derive(Deserialize)]
struct Hits {
    #[serde(default)]
    hits: Vec<Hit>,
}

#[derive(Deserialize)]
struct Hit {
    #[serde(rename = "_source")]
    source: AuditDocument,
}

#[async_trait]
impl SearchSink for ElasticsearchSink {
    async fn ensure_index(&self) -> Result<()> {
        let url = self.endpoint(&[]);
        let response = self
            .authorize(self.client.head(url.clone()))
            .send()
            .await
            .map_err(|e| AuditError::Connection(format!("{}: {}", url, e)))?;

        match response.status() {
            status if status.is_success() => {
                tracing::debug!(index = %self.config.index, "Search index exists");
                return Ok(());
            }
            StatusCode::NOT_FOUND => {}
            status => {
                return Err(AuditError::Search(format!(
                    "checking index '{}' returned {}",
                    self.config.index, status
                )))
            }
        }

        let response = self
            .authorize(self.client.put(url.clone()))
            .json(&index_mapping())
            .send()
            .await
            .map_err(|e| AuditError::Connection(format!("{}: {}", url, e)))?;

        let status = response.status();
        if status.is_success() {
            tracing::info!(index = %self.config.index, "Search index created");
            return Ok(());
        }

        let body = response.text().await.unwrap_or_default();
        // Another instance created it between our HEAD and PUT
        if status == StatusCode::BAD_REQUEST && body.contains("resource_already_exists_exception") {
            return Ok(());
        }

        Err(AuditError::Search(format!(
            "creating index '{}' returned {}: {}",
            self.config.index, status, body
        )))
    }

    async fn upsert(
        &self,
        doc_id: &str,
        document: &AuditDocument,
    ) -> std::result::Result<(), IndexError> {
        let url = self.endpoint(&["_doc", doc_id]);
        let body = serde_json::to_vec(document)?;

        let response = self
            .authorize(self.client.put(url))
            .header(reqwest::header::CONTENT_TYPE, "application/json")
            .body(body)
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    IndexError::Timeout(self.config.timeout_ms)
                } else {
                    IndexError::Unavailable(e.to_string())
                }
            })?;

        let status = response.status();
        if status.is_success() {
            return Ok(());
        }

        let reason = response.text().await.unwrap_or_default();
        if is_transient_status(status) {
            return Err(IndexError::Unavailable(format!("{}: {}", status, reason)));
        }
        Err(IndexError::Rejected {
            doc_id: doc_id.to_string(),
            status: status.as_u16(),
            reason,
        })
    }

    async fn search(&self, filter: &AuditFilter, limit: usize) -> Result<Vec<AuditRecord>> {
        let url = self.endpoint(&["_search"]);
        let response = self
            .authorize(self.client.post(url.clone()))
            .json(&search_body(filter, limit))
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    AuditError::Timeout(format!("search {}", url))
                } else {
                    AuditError::Connection(format!("{}: {}", url, e))
                }
            })?;

        let status = response.status();
        if status == StatusCode::NOT_FOUND {
            tracing::debug!(index = %self.config.index, "Search index missing, no hits");
            return Ok(Vec::new());
        }
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(AuditError::Search(format!("{}: {}", status, body)));
        }

        let parsed: SearchResponse = response
            .json()
            .await
            .map_err(|e| AuditError::Search(format!("invalid search response: {}", e)))?;

        parsed
            .hits
            .hits
            .into_iter()
            .map(|hit| hit.source.into_record())
            .collect()
    }

    fn name(&self) -> &str {
        "elasticsearch"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Utc};

    fn sink(url: &str) -> ElasticsearchSink {
        ElasticsearchSink::new(ElasticsearchConfig {
            url: url.to_string(),
            ..Default::default()
        })
        .unwrap()
    }

    #[test]
    fn test_endpoint_encodes_doc_id() {
        let sink = sink("http://es:9200");
        let url = sink.endpoint(&["_doc", "a/b c"]);
        assert_eq!(url.as_str(), "http://es:9200/audit_log_search/_doc/a%2Fb%20c");
    }

    #[test]
    fn test_endpoint_keeps_base_path() {
        let sink = sink("http://proxy/es/");
        let url = sink.endpoint(&["_search"]);
        assert_eq!(url.as_str(), "http://proxy/es/audit_log_search/_search");
    }

    #[test]
    fn test_rejects_invalid_url() {
        let result = ElasticsearchSink::new(ElasticsearchConfig {
            url: "not a url".to_string(),
            ..Default::default()
        });
        assert!(matches!(result, Err(AuditError::Config(_))));
    }

    #[test]
    fn test_search_body_empty_filter() {
        let body = search_body(&AuditFilter::default(), 100);
        assert!(body["query"]["match_all"].is_object());
        assert_eq!(body["size"], 100);
        assert_eq!(body["sort"][0]["createTime"]["order"], "desc");
    }

    #[test]
    fn test_search_body_keyword_and_range() {
        let start = Utc.timestamp_millis_opt(1_000).unwrap();
        let end = Utc.timestamp_millis_opt(2_000).unwrap();
        let filter = AuditFilter::new(Some("alice"), Some(start), Some(end));
        let body = search_body(&filter, 5);

        let must = body["query"]["bool"]["must"].as_array().unwrap();
        assert_eq!(must.len(), 2);
        assert_eq!(must[0]["multi_match"]["query"], "alice");
        assert_eq!(must[0]["multi_match"]["fields"][1], "operation");
        assert_eq!(must[1]["range"]["createTime"]["gte"], 1_000);
        assert_eq!(must[1]["range"]["createTime"]["lte"], 2_000);
    }

    #[test]
    fn test_search_body_open_ended_range() {
        let start = Utc.timestamp_millis_opt(1_000).unwrap();
        let filter = AuditFilter::new(None, Some(start), None);
        let body = search_body(&filter, 5);
        let range = &body["query"]["bool"]["must"][0]["range"]["createTime"];
        assert_eq!(range["gte"], 1_000);
        assert!(range.get("lte").is_none());
    }

    #[test]
    fn test_mapping_uses_epoch_millis() {
        let mapping = index_mapping();
        let props = &mapping["mappings"]["properties"];
        assert_eq!(props["createTime"]["format"], "epoch_millis");
        assert_eq!(props["elapsedTime"]["type"], "long");
        assert_eq!(props["username"]["type"], "keyword");
    }

    #[test]
    fn test_transient_statuses() {
        assert!(is_transient_status(StatusCode::SERVICE_UNAVAILABLE));
        assert!(is_transient_status(StatusCode::TOO_MANY_REQUESTS));
        assert!(!is_transient_status(StatusCode::BAD_REQUEST));
    }
}
