//! GraphQL-over-HTTP upstream for subgraph style APIs.
//!
//! Records are paged with an `id_gt` cursor; incremental fetches add a
//! `_change_block: {number_gte}` filter and pin the answer to a block hash.

use crate::block::Block;
use crate::record::{Record, Value};
use crate::source::{BlockQuery, BlockSource, FetchRequest, RecordSource, SourceError};
use serde_json::json;
use std::collections::BTreeMap;
use std::time::Duration;
use tracing::debug;

pub const SUBGRAPH_URL_TEMPLATE: &str =
    "https://gateway-arbitrum.network.thegraph.com/api/{api_key}/subgraphs/id/{id}";
pub const DEPLOYMENT_URL_TEMPLATE: &str =
    "https://gateway-arbitrum.network.thegraph.com/api/{api_key}/deployments/id/{id}";

const REQUEST_TIMEOUT: Duration = Duration::from_secs(120);

/// Endpoint URL for a subgraph id. Literal URLs are used as they are and need
/// no key.
pub fn graph_url(subgraph_id: &str, api_key: &str) -> String {
    if subgraph_id.starts_with("http") {
        return subgraph_id.to_string();
    }

    let template = if subgraph_id.starts_with("Qm") {
        DEPLOYMENT_URL_TEMPLATE
    } else {
        SUBGRAPH_URL_TEMPLATE
    };
    template.replace("{api_key}", api_key).replace("{id}", subgraph_id)
}

pub struct GraphQlClient {
    http: reqwest::blocking::Client,
    endpoint: String,
    has_key: bool,
}

impl GraphQlClient {
    pub fn new(subgraph_id: &str, api_key: Option<&str>) -> Result<Self, SourceError> {
        let key = api_key.unwrap_or_default();
        let http = reqwest::blocking::Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .build()
            .map_err(|e| SourceError::Transport(e.to_string()))?;

        Ok(Self {
            http,
            endpoint: graph_url(subgraph_id, key),
            has_key: subgraph_id.starts_with("http") || !key.is_empty(),
        })
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    pub fn has_key(&self) -> bool {
        self.has_key
    }

    /// Send a query and return its `data` member
    pub fn request(&self, query: &str) -> Result<serde_json::Value, SourceError> {
        debug!(endpoint = %self.endpoint, query, "GraphQL request");
        let body = serde_json::to_vec(&json!({ "query": query }))
            .map_err(|e| SourceError::Decode(e.to_string()))?;

        let response = self
            .http
            .post(&self.endpoint)
            .header(reqwest::header::CONTENT_TYPE, "application/json")
            .body(body)
            .send()
            .map_err(|e| SourceError::Transport(e.to_string()))?;

        let status = response.status();
        let bytes = response.bytes().map_err(|e| SourceError::Transport(e.to_string()))?;
        if !status.is_success() {
            return Err(SourceError::Transport(format!(
                "HTTP {}: {}",
                status,
                String::from_utf8_lossy(&bytes)
            )));
        }

        parse_response(&bytes)
    }
}

/// Split a GraphQL answer into data or a query error
pub fn parse_response(bytes: &[u8]) -> Result<serde_json::Value, SourceError> {
    let mut body: serde_json::Value =
        serde_json::from_slice(bytes).map_err(|e| SourceError::Decode(e.to_string()))?;

    if let Some(errors) = body.get("errors").and_then(|e| e.as_array()) {
        if !errors.is_empty() {
            let messages: Vec<String> = errors
                .iter()
                .map(|e| e.get("message").and_then(|m| m.as_str()).unwrap_or("unknown error").to_string())
                .collect();
            return Err(SourceError::Query(messages.join("; ")));
        }
    }

    body.get_mut("data")
        .map(serde_json::Value::take)
        .ok_or_else(|| SourceError::Decode("response has no data".to_string()))
}

/// Render a filter object; keys come out in name order
fn object_literal(entries: &BTreeMap<String, serde_json::Value>, out: &mut String) {
    out.push('{');
    for (i, (k, v)) in entries.iter().enumerate() {
        if i > 0 {
            out.push_str(", ");
        }
        out.push_str(&format!("{}: ", k));
        literal(v, out);
    }
    out.push('}');
}

/// Render a JSON value as a GraphQL input literal
fn literal(value: &serde_json::Value, out: &mut String) {
    match value {
        serde_json::Value::Object(map) => {
            out.push('{');
            for (i, (k, v)) in map.iter().enumerate() {
                if i > 0 {
                    out.push_str(", ");
                }
                out.push_str(&format!("{}: ", k));
                literal(v, out);
            }
            out.push('}');
        }
        serde_json::Value::Array(items) => {
            out.push('[');
            for (i, v) in items.iter().enumerate() {
                if i > 0 {
                    out.push_str(", ");
                }
                literal(v, out);
            }
            out.push(']');
        }
        other => out.push_str(&other.to_string()),
    }
}

#[derive(Default)]
struct Selection(BTreeMap<String, Selection>);

impl Selection {
    fn from_fields(fields: &[String]) -> Self {
        let mut root = Selection::default();
        for field in fields {
            let mut node = &mut root;
            for part in field.split('.') {
                node = node.0.entry(part.to_string()).or_default();
            }
        }
        root
    }

    fn render(&self, out: &mut String) {
        for (i, (name, child)) in self.0.iter().enumerate() {
            if i > 0 {
                out.push(' ');
            }
            out.push_str(name);
            if !child.0.is_empty() {
                out.push_str(" { ");
                child.render(out);
                out.push_str(" }");
            }
        }
    }
}

/// Query text for one page of a dataset
pub fn page_query(request: &FetchRequest<'_>, cursor: &str, page_size: usize) -> String {
    let mut filter = request.query.filters.clone();
    filter.insert("id_gt".to_string(), json!(cursor));
    if let Some(since) = request.changed_since {
        filter.insert("_change_block".to_string(), json!({ "number_gte": since.number }));
    }

    let mut out = format!(
        "{{ {}(first: {}, orderBy: id, orderDirection: asc, where: ",
        request.query.entity, page_size
    );
    object_literal(&filter, &mut out);
    if let Some(block) = request.at_block {
        out.push_str(&format!(", block: {{hash: {}}}", json!(block.id)));
    }
    out.push_str(") { ");
    Selection::from_fields(&request.query.fields).render(&mut out);
    out.push_str(" } }");
    out
}

/// Query text for a block lookup
pub fn blocks_query(query: &BlockQuery) -> String {
    let mut filter = BTreeMap::new();
    if let Some(gte) = query.number_gte {
        filter.insert("number_gte".to_string(), json!(gte));
    }
    if let Some(until) = query.timestamp_lte {
        filter.insert("timestamp_lte".to_string(), json!(until.timestamp()));
    }

    let mut out = format!("{{ blocks(first: {}", query.first);
    if let Some(skip) = query.skip {
        out.push_str(&format!(", skip: {}", skip));
    }
    out.push_str(", orderBy: number, orderDirection: desc, where: ");
    object_literal(&filter, &mut out);
    out.push_str(") { id number timestamp } }");
    out
}

fn camel_join(prefix: &str, key: &str) -> String {
    if prefix.is_empty() {
        return key.to_string();
    }
    let mut chars = key.chars();
    match chars.next() {
        Some(first) => format!("{}{}{}", prefix, first.to_uppercase(), chars.as_str()),
        None => prefix.to_string(),
    }
}

fn flatten_into(prefix: &str, value: &serde_json::Value, out: &mut BTreeMap<String, Value>) {
    match value {
        serde_json::Value::Object(map) => {
            for (k, v) in map {
                flatten_into(&camel_join(prefix, k), v, out);
            }
        }
        other => {
            out.insert(prefix.to_string(), Value::from_json(other));
        }
    }
}

/// Turn one entity into a record; nested objects become `parentChild`
/// columns (`dao.id` -> `daoId`)
pub fn record_from_json(partition: &str, entity: &serde_json::Value) -> Result<Record, SourceError> {
    let id = entity
        .get("id")
        .and_then(|v| v.as_str())
        .ok_or_else(|| SourceError::Decode(format!("entity without string id: {}", entity)))?;

    let mut fields = BTreeMap::new();
    if let Some(map) = entity.as_object() {
        for (k, v) in map.iter().filter(|(k, _)| k.as_str() != "id") {
            flatten_into(k, v, &mut fields);
        }
    }

    Ok(Record {
        partition: partition.to_string(),
        id: id.to_string(),
        fields,
    })
}

fn as_u64(value: Option<&serde_json::Value>) -> Option<u64> {
    match value? {
        serde_json::Value::Number(n) => n.as_u64(),
        serde_json::Value::String(s) => s.parse().ok(),
        _ => None,
    }
}

pub fn block_from_json(value: &serde_json::Value) -> Result<Block, SourceError> {
    let id = value
        .get("id")
        .and_then(|v| v.as_str())
        .ok_or_else(|| SourceError::Decode(format!("block without id: {}", value)))?;
    let number = as_u64(value.get("number"))
        .ok_or_else(|| SourceError::Decode(format!("block without number: {}", value)))?;
    let timestamp = as_u64(value.get("timestamp"))
        .ok_or_else(|| SourceError::Decode(format!("block without timestamp: {}", value)))?;
    Ok(Block::at_unix(id, number, timestamp as i64))
}

/// Dataset source over one GraphQL endpoint
pub struct GraphQlSource {
    client: GraphQlClient,
    page_size: usize,
}

impl GraphQlSource {
    pub fn new(client: GraphQlClient, page_size: usize) -> Self {
        Self {
            client,
            page_size: page_size.max(1),
        }
    }
}

impl RecordSource for GraphQlSource {
    fn fetch(&self, request: &FetchRequest<'_>) -> Result<Vec<Record>, SourceError> {
        let mut records = Vec::new();
        let mut cursor = String::new();

        loop {
            let data = self.client.request(&page_query(request, &cursor, self.page_size))?;
            let page = data
                .get(&request.query.entity)
                .and_then(|v| v.as_array())
                .ok_or_else(|| SourceError::Decode(format!("missing {} in response", request.query.entity)))?;

            for entity in page {
                records.push(record_from_json(request.partition, entity)?);
            }

            match records.last() {
                Some(last) if page.len() >= self.page_size => cursor = last.id.clone(),
                _ => break,
            }
        }

        debug!(entity = %request.query.entity, partition = request.partition, rows = records.len(), "Fetched records");
        Ok(records)
    }

    fn has_credentials(&self) -> bool {
        self.client.has_key()
    }
}

/// Block lookups, one blocks subgraph per partition
#[derive(Default)]
pub struct GraphQlBlocks {
    clients: BTreeMap<String, GraphQlClient>,
}

impl GraphQlBlocks {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, partition: &str, client: GraphQlClient) {
        self.clients.insert(partition.to_string(), client);
    }
}

impl BlockSource for GraphQlBlocks {
    fn query_blocks(&self, partition: &str, query: &BlockQuery) -> Result<Vec<Block>, SourceError> {
        let client = self
            .clients
            .get(partition)
            .ok_or_else(|| SourceError::Transport(format!("no blocks endpoint for {}", partition)))?;

        let data = client.request(&blocks_query(query))?;
        data.get("blocks")
            .and_then(|v| v.as_array())
            .ok_or_else(|| SourceError::Decode("missing blocks in response".to_string()))?
            .iter()
            .map(block_from_json)
            .collect()
    }
}
