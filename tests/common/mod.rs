//! Shared test fixture: an in-process record store that interprets the
//! engine's fetch XML, enforces the 50,000-row aggregate cap, pages results
//! and applies DML batches, plus dataset and engine builders.

#![allow(dead_code)]

use std::collections::HashMap;
use std::str::FromStr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Duration, TimeZone, Utc};
use parking_lot::Mutex;
use quick_xml::events::Event;
use quick_xml::Reader;
use uuid::Uuid;

use marlinsql::{
    AttributeMetadata, AttributeType, DmlOperation, DmlOutcome, DmlRequest, EntityMetadata,
    Error, FetchPage, FetchRequest, MetadataCache, PlanOptions, QueryEngine, QueryValue,
    RemoteStore, Result, Row,
};

pub const AGGREGATE_CAP: usize = 50_000;
const PAGE_SIZE_DEFAULT: usize = 5_000;

#[derive(Default)]
struct StoreState {
    tables: HashMap<String, Vec<Row>>,
    dml_log: Vec<DmlRequest>,
}

pub struct MockRemote {
    state: Mutex<StoreState>,
    pub fetch_count: AtomicUsize,
    pub aggregate_failures: AtomicUsize,
    pool_capacity: usize,
    /// Optional artificial delay per fetch, for cancellation tests.
    pub fetch_delay_ms: u64,
}

impl MockRemote {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(StoreState::default()),
            fetch_count: AtomicUsize::new(0),
            aggregate_failures: AtomicUsize::new(0),
            pool_capacity: 4,
            fetch_delay_ms: 0,
        }
    }

    pub fn with_pool_capacity(mut self, capacity: usize) -> Self {
        self.pool_capacity = capacity;
        self
    }

    pub fn with_fetch_delay_ms(mut self, delay: u64) -> Self {
        self.fetch_delay_ms = delay;
        self
    }

    pub fn insert_rows(&self, entity: &str, rows: Vec<Row>) {
        self.state
            .lock()
            .tables
            .entry(entity.to_lowercase())
            .or_default()
            .extend(rows);
    }

    pub fn rows(&self, entity: &str) -> Vec<Row> {
        self.state
            .lock()
            .tables
            .get(&entity.to_lowercase())
            .cloned()
            .unwrap_or_default()
    }

    pub fn dml_log(&self) -> Vec<DmlRequest> {
        self.state.lock().dml_log.clone()
    }

    pub fn fetches(&self) -> usize {
        self.fetch_count.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl RemoteStore for MockRemote {
    async fn execute_fetch(&self, xml: &str, request: &FetchRequest) -> Result<FetchPage> {
        self.fetch_count.fetch_add(1, Ordering::SeqCst);
        if self.fetch_delay_ms > 0 {
            tokio::time::sleep(std::time::Duration::from_millis(self.fetch_delay_ms)).await;
        }
        let fetch = ParsedFetch::parse(xml)?;
        let rows = self
            .state
            .lock()
            .tables
            .get(&fetch.entity)
            .cloned()
            .ok_or_else(|| Error::not_found(format!("entity {}", fetch.entity)))?;

        let mut selected: Vec<Row> = rows
            .into_iter()
            .filter(|row| fetch.filter.as_ref().map_or(true, |f| f.matches(row)))
            .collect();

        if fetch.aggregate {
            if selected.len() > AGGREGATE_CAP {
                self.aggregate_failures.fetch_add(1, Ordering::SeqCst);
                return Err(Error::bad_query(format!(
                    "AggregateQueryRecordLimit exceeded: the aggregate operation exceeded \
                     the maximum record limit of 50000 ({} records matched)",
                    selected.len()
                )));
            }
            let out = aggregate_rows(&fetch, selected);
            return Ok(FetchPage {
                columns: out.first().map(column_names).unwrap_or_default(),
                rows: out,
                more: false,
                paging_cookie: None,
                total_count: None,
            });
        }

        for order in fetch.orders.iter().rev() {
            selected.sort_by(|a, b| {
                let x = a.get(&order.attribute).cloned().unwrap_or(QueryValue::Null);
                let y = b.get(&order.attribute).cloned().unwrap_or(QueryValue::Null);
                let ord = x.cmp_for_sort(&y);
                if order.descending {
                    ord.reverse()
                } else {
                    ord
                }
            });
        }

        let mut selected = if fetch.all_attributes {
            selected
        } else {
            selected
                .into_iter()
                .map(|row| {
                    fetch
                        .attributes
                        .iter()
                        .filter_map(|attr| {
                            row.get(attr).map(|v| (attr.clone(), v.clone()))
                        })
                        .collect::<Row>()
                })
                .collect()
        };

        if fetch.distinct {
            let mut seen = std::collections::HashSet::new();
            selected.retain(|row| {
                seen.insert(
                    row.iter()
                        .map(|(k, v)| format!("{}={}", k.to_lowercase(), v))
                        .collect::<Vec<_>>()
                        .join("|"),
                )
            });
        }

        if let Some(top) = fetch.top {
            selected.truncate(top);
            return Ok(FetchPage {
                columns: selected.first().map(column_names).unwrap_or_default(),
                rows: selected,
                more: false,
                paging_cookie: None,
                total_count: None,
            });
        }

        // Paging: the cookie is the absolute row offset.
        let page_size = fetch
            .count
            .or(request.max_rows.map(|m| m as usize))
            .unwrap_or(PAGE_SIZE_DEFAULT);
        let start = request
            .paging_cookie
            .as_deref()
            .or(fetch.paging_cookie.as_deref())
            .and_then(|c| c.parse::<usize>().ok())
            .unwrap_or_else(|| {
                fetch
                    .page
                    .map(|p| (p.saturating_sub(1) as usize) * page_size)
                    .unwrap_or(0)
            });
        let total = selected.len();
        let end = (start + page_size).min(total);
        let page_rows: Vec<Row> = selected[start.min(total)..end].to_vec();
        let more = end < total;

        Ok(FetchPage {
            columns: page_rows.first().map(column_names).unwrap_or_default(),
            rows: page_rows,
            more,
            paging_cookie: more.then(|| end.to_string()),
            total_count: None,
        })
    }

    async fn execute_tabular(&self, sql: &str) -> Result<Vec<Row>> {
        // The pass-through endpoint is opaque; tests only check routing.
        let _ = sql;
        Ok(vec![Row::from_pairs([(
            "source".to_string(),
            QueryValue::Text("tabular".into()),
        )])])
    }

    async fn total_record_count(&self, entity: &str) -> Result<i64> {
        Ok(self
            .state
            .lock()
            .tables
            .get(&entity.to_lowercase())
            .map(|rows| rows.len() as i64)
            .unwrap_or(0))
    }

    async fn min_max_timestamp(
        &self,
        entity: &str,
        column: &str,
    ) -> Result<(Option<DateTime<Utc>>, Option<DateTime<Utc>>)> {
        let state = self.state.lock();
        let rows = match state.tables.get(&entity.to_lowercase()) {
            Some(rows) => rows,
            None => return Ok((None, None)),
        };
        let mut min = None;
        let mut max = None;
        for row in rows {
            if let Some(QueryValue::Timestamp(ts)) = row.get(column) {
                min = Some(min.map_or(*ts, |m: DateTime<Utc>| m.min(*ts)));
                max = Some(max.map_or(*ts, |m: DateTime<Utc>| m.max(*ts)));
            }
        }
        Ok((min, max))
    }

    async fn execute_dml(&self, request: DmlRequest) -> Result<Vec<DmlOutcome>> {
        let mut state = self.state.lock();
        state.dml_log.push(request.clone());
        let table = state
            .tables
            .entry(request.entity.to_lowercase())
            .or_default();
        let pk = format!("{}id", request.entity.to_lowercase());
        let mut outcomes = Vec::with_capacity(request.rows.len());
        for (index, row) in request.rows.iter().enumerate() {
            match request.operation {
                DmlOperation::Insert => {
                    let mut inserted = row.clone();
                    if !inserted.contains(&pk) {
                        inserted.set(pk.clone(), QueryValue::Uuid(Uuid::new_v4()));
                    }
                    table.push(inserted);
                }
                DmlOperation::Update => {
                    let key = row.get(&pk).cloned().unwrap_or(QueryValue::Null);
                    if let Some(target) = table
                        .iter_mut()
                        .find(|r| r.get(&pk).is_some_and(|v| v.group_eq(&key)))
                    {
                        for (name, value) in row.iter() {
                            if !name.eq_ignore_ascii_case(&pk) {
                                target.set(name.to_string(), value.clone());
                            }
                        }
                    } else {
                        outcomes.push(DmlOutcome {
                            index,
                            success: false,
                            error: Some("record not found".into()),
                        });
                        continue;
                    }
                }
                DmlOperation::Delete => {
                    let key = row.get(&pk).cloned().unwrap_or(QueryValue::Null);
                    let before = table.len();
                    table.retain(|r| !r.get(&pk).is_some_and(|v| v.group_eq(&key)));
                    if table.len() == before {
                        outcomes.push(DmlOutcome {
                            index,
                            success: false,
                            error: Some("record not found".into()),
                        });
                        continue;
                    }
                }
            }
            outcomes.push(DmlOutcome {
                index,
                success: true,
                error: None,
            });
        }
        Ok(outcomes)
    }

    fn pool_capacity(&self) -> usize {
        self.pool_capacity
    }
}

fn column_names(row: &Row) -> Vec<String> {
    row.column_names().map(str::to_string).collect()
}

// ---------------------------------------------------------------------------
// Fetch XML interpretation
// ---------------------------------------------------------------------------

struct ParsedAttr {
    name: String,
    alias: Option<String>,
    aggregate: Option<String>,
    group_by: bool,
    distinct: bool,
}

struct ParsedOrder {
    attribute: String,
    descending: bool,
}

struct ParsedCondition {
    attribute: String,
    operator: String,
    values: Vec<String>,
}

struct ParsedFilter {
    any: bool,
    conditions: Vec<ParsedCondition>,
    filters: Vec<ParsedFilter>,
}

impl ParsedFilter {
    fn matches(&self, row: &Row) -> bool {
        let conditions = self.conditions.iter().map(|c| c.matches(row));
        let nested = self.filters.iter().map(|f| f.matches(row));
        if self.any {
            conditions.chain(nested).any(|m| m)
        } else {
            conditions.chain(nested).all(|m| m)
        }
    }
}

impl ParsedCondition {
    fn matches(&self, row: &Row) -> bool {
        let value = row.get(&self.attribute).cloned().unwrap_or(QueryValue::Null);
        match self.operator.as_str() {
            "null" => value.is_null(),
            "not-null" => !value.is_null(),
            "like" | "not-like" => {
                let matched = match &value {
                    QueryValue::Null => false,
                    other => like_matches(&self.values[0], &other.display_text()),
                };
                (self.operator == "like") == matched
            }
            "in" | "not-in" => {
                let matched = self
                    .values
                    .iter()
                    .any(|v| compare(&value, v).is_some_and(|o| o.is_eq()));
                (self.operator == "in") == matched && !value.is_null()
            }
            "between" | "not-between" => {
                let inside = compare(&value, &self.values[0]).is_some_and(|o| !o.is_lt())
                    && compare(&value, &self.values[1]).is_some_and(|o| !o.is_gt());
                (self.operator == "between") == inside && !value.is_null()
            }
            op => {
                let ord = match compare(&value, &self.values[0]) {
                    Some(ord) => ord,
                    None => return false,
                };
                match op {
                    "eq" => ord.is_eq(),
                    "ne" => ord.is_ne(),
                    "lt" => ord.is_lt(),
                    "le" => ord.is_le(),
                    "gt" => ord.is_gt(),
                    "ge" => ord.is_ge(),
                    _ => false,
                }
            }
        }
    }
}

fn compare(value: &QueryValue, text: &str) -> Option<std::cmp::Ordering> {
    if value.is_null() {
        return None;
    }
    if let Ok(ts) = DateTime::parse_from_rfc3339(text) {
        return value.compare(&QueryValue::Timestamp(ts.with_timezone(&Utc)));
    }
    // Date-only condition values against timestamp attributes.
    if matches!(value, QueryValue::Timestamp(_)) {
        if let Ok(date) = chrono::NaiveDate::parse_from_str(text, "%Y-%m-%d") {
            let midnight = date.and_hms_opt(0, 0, 0).expect("valid time");
            return value.compare(&QueryValue::Timestamp(Utc.from_utc_datetime(&midnight)));
        }
    }
    if let Ok(i) = i64::from_str(text) {
        return value.compare(&QueryValue::Int(i));
    }
    if let Ok(f) = f64::from_str(text) {
        return value.compare(&QueryValue::Float(f));
    }
    if let Ok(id) = Uuid::parse_str(text) {
        return value.compare(&QueryValue::Uuid(id));
    }
    value.compare(&QueryValue::Text(text.to_string()))
}

fn like_matches(pattern: &str, text: &str) -> bool {
    let mut regex = String::from("(?is)^");
    for c in pattern.chars() {
        match c {
            '%' => regex.push_str(".*"),
            '_' => regex.push('.'),
            other => regex.push_str(&regex::escape(&other.to_string())),
        }
    }
    regex.push('$');
    regex::Regex::new(&regex)
        .map(|re| re.is_match(text))
        .unwrap_or(false)
}

struct ParsedFetch {
    entity: String,
    all_attributes: bool,
    attributes: Vec<String>,
    parsed_attrs: Vec<ParsedAttr>,
    orders: Vec<ParsedOrder>,
    filter: Option<ParsedFilter>,
    aggregate: bool,
    distinct: bool,
    top: Option<usize>,
    page: Option<u32>,
    count: Option<usize>,
    paging_cookie: Option<String>,
}

impl ParsedFetch {
    fn parse(xml: &str) -> Result<ParsedFetch> {
        let mut reader = Reader::from_str(xml);
        let mut fetch = ParsedFetch {
            entity: String::new(),
            all_attributes: false,
            attributes: Vec::new(),
            parsed_attrs: Vec::new(),
            orders: Vec::new(),
            filter: None,
            aggregate: false,
            distinct: false,
            top: None,
            page: None,
            count: None,
            paging_cookie: None,
        };
        let mut filter_stack: Vec<ParsedFilter> = Vec::new();
        let mut condition_values: Option<ParsedCondition> = None;
        let mut text_buffer = String::new();

        loop {
            let event = reader
                .read_event()
                .map_err(|e| Error::bad_query(format!("unparseable fetch xml: {}", e)))?;
            match event {
                Event::Eof => break,
                Event::Start(ref e) | Event::Empty(ref e) => {
                    let self_closing = matches!(event, Event::Empty(_));
                    let name = String::from_utf8_lossy(e.name().as_ref()).to_string();
                    let attrs: HashMap<String, String> = e
                        .attributes()
                        .flatten()
                        .map(|a| {
                            (
                                String::from_utf8_lossy(a.key.as_ref()).to_string(),
                                a.unescape_value()
                                    .map(|v| v.to_string())
                                    .unwrap_or_default(),
                            )
                        })
                        .collect();
                    match name.as_str() {
                        "fetch" => {
                            fetch.aggregate =
                                attrs.get("aggregate").is_some_and(|v| v == "true");
                            fetch.distinct =
                                attrs.get("distinct").is_some_and(|v| v == "true");
                            fetch.top = attrs.get("top").and_then(|v| v.parse().ok());
                            fetch.page = attrs.get("page").and_then(|v| v.parse().ok());
                            fetch.count = attrs.get("count").and_then(|v| v.parse().ok());
                            fetch.paging_cookie = attrs.get("paging-cookie").cloned();
                        }
                        "entity" => {
                            fetch.entity =
                                attrs.get("name").cloned().unwrap_or_default().to_lowercase();
                        }
                        "all-attributes" => fetch.all_attributes = true,
                        "attribute" => {
                            let attr_name =
                                attrs.get("name").cloned().unwrap_or_default().to_lowercase();
                            fetch.attributes.push(
                                attrs
                                    .get("alias")
                                    .cloned()
                                    .unwrap_or_else(|| attr_name.clone()),
                            );
                            fetch.parsed_attrs.push(ParsedAttr {
                                name: attr_name,
                                alias: attrs.get("alias").cloned(),
                                aggregate: attrs.get("aggregate").cloned(),
                                group_by: attrs.get("groupby").is_some_and(|v| v == "true"),
                                distinct: attrs.get("distinct").is_some_and(|v| v == "true"),
                            });
                        }
                        "order" => fetch.orders.push(ParsedOrder {
                            attribute: attrs
                                .get("attribute")
                                .or(attrs.get("alias"))
                                .cloned()
                                .unwrap_or_default()
                                .to_lowercase(),
                            descending: attrs
                                .get("descending")
                                .is_some_and(|v| v == "true"),
                        }),
                        "filter" => filter_stack.push(ParsedFilter {
                            any: attrs.get("type").is_some_and(|v| v == "or"),
                            conditions: Vec::new(),
                            filters: Vec::new(),
                        }),
                        "condition" => {
                            let condition = ParsedCondition {
                                attribute: attrs
                                    .get("attribute")
                                    .cloned()
                                    .unwrap_or_default()
                                    .to_lowercase(),
                                operator: attrs
                                    .get("operator")
                                    .cloned()
                                    .unwrap_or_default(),
                                values: attrs
                                    .get("value")
                                    .cloned()
                                    .map(|v| vec![v])
                                    .unwrap_or_default(),
                            };
                            if self_closing {
                                if let Some(filter) = filter_stack.last_mut() {
                                    filter.conditions.push(condition);
                                }
                            } else {
                                // <condition operator="in"> with nested
                                // <value> children; closed by End.
                                condition_values = Some(condition);
                            }
                        }
                        "value" => text_buffer.clear(),
                        _ => {}
                    }
                }
                Event::Text(t) => {
                    text_buffer = t
                        .unescape()
                        .map(|v| v.to_string())
                        .unwrap_or_default();
                }
                Event::End(e) => {
                    let name = String::from_utf8_lossy(e.name().as_ref()).to_string();
                    match name.as_str() {
                        "value" => {
                            if let Some(condition) = &mut condition_values {
                                condition.values.push(text_buffer.clone());
                            }
                        }
                        "condition" => {
                            if let (Some(condition), Some(filter)) =
                                (condition_values.take(), filter_stack.last_mut())
                            {
                                filter.conditions.push(condition);
                            }
                        }
                        "filter" => {
                            let finished = filter_stack.pop().expect("balanced filters");
                            match filter_stack.last_mut() {
                                Some(parent) => parent.filters.push(finished),
                                None => fetch.filter = Some(finished),
                            }
                        }
                        _ => {}
                    }
                }
                _ => {}
            }
        }
        Ok(fetch)
    }
}

fn aggregate_rows(fetch: &ParsedFetch, rows: Vec<Row>) -> Vec<Row> {
    let group_attrs: Vec<&ParsedAttr> =
        fetch.parsed_attrs.iter().filter(|a| a.group_by).collect();
    let agg_attrs: Vec<&ParsedAttr> = fetch
        .parsed_attrs
        .iter()
        .filter(|a| a.aggregate.is_some())
        .collect();

    let mut groups: Vec<(Vec<String>, Vec<Row>)> = Vec::new();
    for row in &rows {
        let key: Vec<String> = group_attrs
            .iter()
            .map(|attr| {
                row.get(&attr.name)
                    .map(|v| v.to_string())
                    .unwrap_or_default()
            })
            .collect();
        match groups.iter_mut().find(|(k, _)| *k == key) {
            Some((_, members)) => members.push(row.clone()),
            None => groups.push((key, vec![row.clone()])),
        }
    }
    if groups.is_empty() && group_attrs.is_empty() {
        groups.push((Vec::new(), Vec::new()));
    }

    groups
        .into_iter()
        .map(|(_, members)| {
            let mut out = Row::new();
            for attr in &group_attrs {
                let value = members
                    .first()
                    .and_then(|r| r.get(&attr.name).cloned())
                    .unwrap_or(QueryValue::Null);
                out.set(attr.alias.clone().unwrap_or_else(|| attr.name.clone()), value);
            }
            for attr in &agg_attrs {
                let alias = attr.alias.clone().unwrap_or_else(|| attr.name.clone());
                let values: Vec<QueryValue> = members
                    .iter()
                    .filter_map(|r| r.get(&attr.name))
                    .filter(|v| !v.is_null())
                    .cloned()
                    .collect();
                let value = match attr.aggregate.as_deref().unwrap_or_default() {
                    "count" => QueryValue::Int(members.len() as i64),
                    "countcolumn" if attr.distinct => {
                        let mut texts: Vec<String> =
                            values.iter().map(|v| v.to_string()).collect();
                        texts.sort();
                        texts.dedup();
                        QueryValue::Int(texts.len() as i64)
                    }
                    "countcolumn" => QueryValue::Int(values.len() as i64),
                    "sum" => fold_sum(&values),
                    "avg" => match fold_sum(&values) {
                        QueryValue::Null => QueryValue::Null,
                        sum => sum
                            .as_float()
                            .map(|f| QueryValue::Float(f / values.len() as f64))
                            .unwrap_or(QueryValue::Null),
                    },
                    "min" => values
                        .iter()
                        .cloned()
                        .min_by(|a, b| a.cmp_for_sort(b))
                        .unwrap_or(QueryValue::Null),
                    "max" => values
                        .iter()
                        .cloned()
                        .max_by(|a, b| a.cmp_for_sort(b))
                        .unwrap_or(QueryValue::Null),
                    _ => QueryValue::Null,
                };
                out.set(alias, value);
            }
            out
        })
        .collect()
}

fn fold_sum(values: &[QueryValue]) -> QueryValue {
    let mut acc: Option<f64> = None;
    for value in values {
        if let Some(f) = value.as_float() {
            acc = Some(acc.unwrap_or(0.0) + f);
        }
    }
    match acc {
        Some(f) if f.fract() == 0.0 && f.abs() < 9e15 => QueryValue::Int(f as i64),
        Some(f) => QueryValue::Float(f),
        None => QueryValue::Null,
    }
}

// ---------------------------------------------------------------------------
// Dataset and engine builders
// ---------------------------------------------------------------------------

pub fn account_metadata() -> EntityMetadata {
    EntityMetadata {
        logical_name: "account".into(),
        display_name: Some("Account".into()),
        primary_key: "accountid".into(),
        created_on_attribute: Some("createdon".into()),
        attributes: vec![
            AttributeMetadata::new("accountid", AttributeType::Uuid),
            AttributeMetadata::new("name", AttributeType::Text),
            AttributeMetadata::new("revenue", AttributeType::Decimal),
            AttributeMetadata::new("statecode", AttributeType::Integer),
            AttributeMetadata::new("industrycode", AttributeType::Integer),
            AttributeMetadata::new("createdon", AttributeType::Timestamp),
        ],
        relationships: Vec::new(),
    }
}

pub fn contact_metadata() -> EntityMetadata {
    EntityMetadata {
        logical_name: "contact".into(),
        display_name: Some("Contact".into()),
        primary_key: "contactid".into(),
        created_on_attribute: Some("createdon".into()),
        attributes: vec![
            AttributeMetadata::new("contactid", AttributeType::Uuid),
            AttributeMetadata::new("fullname", AttributeType::Text),
            AttributeMetadata::new("parentaccountid", AttributeType::Uuid),
            AttributeMetadata::new("statecode", AttributeType::Integer),
            AttributeMetadata::new("createdon", AttributeType::Timestamp),
        ],
        relationships: Vec::new(),
    }
}

pub fn metadata_cache() -> Arc<MetadataCache> {
    let cache = MetadataCache::new();
    cache.insert(account_metadata());
    cache.insert(contact_metadata());
    Arc::new(cache)
}

pub fn engine(remote: Arc<MockRemote>) -> QueryEngine {
    QueryEngine::new(remote, metadata_cache())
}

pub fn account_row(id: Uuid, name: &str, revenue: i64, state: i64) -> Row {
    Row::from_pairs([
        ("accountid".to_string(), QueryValue::Uuid(id)),
        ("name".to_string(), QueryValue::Text(name.into())),
        ("revenue".to_string(), QueryValue::Int(revenue)),
        ("statecode".to_string(), QueryValue::Int(state)),
        (
            "createdon".to_string(),
            QueryValue::Timestamp(Utc.with_ymd_and_hms(2023, 1, 1, 0, 0, 0).unwrap()),
        ),
    ])
}

/// `count` accounts spread uniformly over `[start, end)`.
pub fn uniform_accounts(count: usize, start: DateTime<Utc>, end: DateTime<Utc>) -> Vec<Row> {
    let span_ms = (end - start).num_milliseconds().max(1);
    (0..count)
        .map(|i| {
            let offset = span_ms * i as i64 / count as i64;
            let mut row = account_row(Uuid::new_v4(), &format!("acct {}", i), i as i64, 0);
            row.set(
                "createdon",
                QueryValue::Timestamp(start + Duration::milliseconds(offset)),
            );
            row
        })
        .collect()
}

/// `count` accounts spread over a single day inside a wider range.
pub fn skewed_accounts(count: usize, hot_day: DateTime<Utc>) -> Vec<Row> {
    const DAY_MS: i64 = 86_400_000;
    (0..count)
        .map(|i| {
            let mut row = account_row(Uuid::new_v4(), &format!("hot {}", i), i as i64, 0);
            row.set(
                "createdon",
                QueryValue::Timestamp(
                    hot_day + Duration::milliseconds(i as i64 * DAY_MS / count as i64),
                ),
            );
            row
        })
        .collect()
}

pub fn default_options() -> PlanOptions {
    PlanOptions::default()
}

pub fn int_value(result: &marlinsql::QueryResult, row: usize, column: &str) -> i64 {
    result
        .get(row, column)
        .and_then(QueryValue::as_int)
        .unwrap_or_else(|| panic!("no int at row {} column {}", row, column))
}
