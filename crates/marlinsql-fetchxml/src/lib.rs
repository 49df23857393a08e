//! Fetch-query XML documents: the remote store's request format for record
//! queries, aggregates and paging. The plan builder assembles [`FetchQuery`]
//! values; [`FetchQuery::to_xml`] renders the wire document.
//!
//! Wire requirements honored here: date/time values render as ISO-8601
//! `yyyy-MM-ddTHH:mm:ss.fffZ` in UTC, identifiers and values are escaped to
//! XML attribute-safe form, and paging inputs are injected verbatim.

use chrono::{DateTime, Utc};
use quick_xml::events::{BytesEnd, BytesStart, BytesText, Event};
use quick_xml::Writer;

use marlinsql_common::error::{Error, Result};
use marlinsql_common::types::QueryValue;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FetchAggregate {
    /// COUNT(*): counts records.
    Count,
    /// COUNT(column): counts non-null values of one attribute.
    CountColumn,
    Sum,
    Avg,
    Min,
    Max,
}

impl FetchAggregate {
    fn wire_name(&self) -> &'static str {
        match self {
            FetchAggregate::Count => "count",
            FetchAggregate::CountColumn => "countcolumn",
            FetchAggregate::Sum => "sum",
            FetchAggregate::Avg => "avg",
            FetchAggregate::Min => "min",
            FetchAggregate::Max => "max",
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct FetchAttribute {
    pub name: String,
    pub alias: Option<String>,
    pub aggregate: Option<FetchAggregate>,
    pub distinct: bool,
    pub group_by: bool,
}

impl FetchAttribute {
    pub fn plain(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            alias: None,
            aggregate: None,
            distinct: false,
            group_by: false,
        }
    }

    pub fn aggregated(
        name: impl Into<String>,
        aggregate: FetchAggregate,
        alias: impl Into<String>,
    ) -> Self {
        Self {
            name: name.into(),
            alias: Some(alias.into()),
            aggregate: Some(aggregate),
            distinct: false,
            group_by: false,
        }
    }

    pub fn grouped(name: impl Into<String>, alias: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            alias: Some(alias.into()),
            aggregate: None,
            distinct: false,
            group_by: true,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FetchOperator {
    Eq,
    Neq,
    Lt,
    Le,
    Gt,
    Ge,
    Like,
    NotLike,
    In,
    NotIn,
    Null,
    NotNull,
    Between,
    NotBetween,
}

impl FetchOperator {
    fn wire_name(&self) -> &'static str {
        match self {
            FetchOperator::Eq => "eq",
            FetchOperator::Neq => "ne",
            FetchOperator::Lt => "lt",
            FetchOperator::Le => "le",
            FetchOperator::Gt => "gt",
            FetchOperator::Ge => "ge",
            FetchOperator::Like => "like",
            FetchOperator::NotLike => "not-like",
            FetchOperator::In => "in",
            FetchOperator::NotIn => "not-in",
            FetchOperator::Null => "null",
            FetchOperator::NotNull => "not-null",
            FetchOperator::Between => "between",
            FetchOperator::NotBetween => "not-between",
        }
    }

    pub fn expected_values(&self) -> usize {
        match self {
            FetchOperator::Null | FetchOperator::NotNull => 0,
            FetchOperator::Between | FetchOperator::NotBetween => 2,
            FetchOperator::In | FetchOperator::NotIn => usize::MAX,
            _ => 1,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct FetchCondition {
    pub attribute: String,
    /// Condition against a link-entity's attribute.
    pub entity_alias: Option<String>,
    pub operator: FetchOperator,
    pub values: Vec<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FilterKind {
    And,
    Or,
}

#[derive(Debug, Clone, PartialEq)]
pub struct FetchFilter {
    pub kind: FilterKind,
    pub conditions: Vec<FetchCondition>,
    pub filters: Vec<FetchFilter>,
}

impl FetchFilter {
    pub fn all() -> Self {
        Self {
            kind: FilterKind::And,
            conditions: Vec::new(),
            filters: Vec::new(),
        }
    }

    pub fn any() -> Self {
        Self {
            kind: FilterKind::Or,
            conditions: Vec::new(),
            filters: Vec::new(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.conditions.is_empty() && self.filters.is_empty()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkKind {
    Inner,
    Outer,
}

#[derive(Debug, Clone, PartialEq)]
pub struct FetchLink {
    pub name: String,
    pub from: String,
    pub to: String,
    pub alias: Option<String>,
    pub kind: LinkKind,
    pub all_attributes: bool,
    pub attributes: Vec<FetchAttribute>,
    pub filter: Option<FetchFilter>,
    pub links: Vec<FetchLink>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct FetchOrder {
    pub attribute: String,
    /// Orders over aggregate/grouped attributes address the alias instead.
    pub alias: Option<String>,
    pub descending: bool,
}

#[derive(Debug, Clone, PartialEq)]
pub struct FetchEntity {
    pub name: String,
    pub all_attributes: bool,
    pub attributes: Vec<FetchAttribute>,
    pub orders: Vec<FetchOrder>,
    pub filter: Option<FetchFilter>,
    pub links: Vec<FetchLink>,
}

impl FetchEntity {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            all_attributes: false,
            attributes: Vec::new(),
            orders: Vec::new(),
            filter: None,
            links: Vec::new(),
        }
    }
}

/// A complete fetch-query document.
#[derive(Debug, Clone, PartialEq)]
pub struct FetchQuery {
    pub entity: FetchEntity,
    pub distinct: bool,
    pub aggregate: bool,
    pub top: Option<u64>,
    pub page: Option<u32>,
    pub page_size: Option<u32>,
    pub paging_cookie: Option<String>,
    pub return_total_count: bool,
}

impl FetchQuery {
    pub fn new(entity: FetchEntity) -> Self {
        Self {
            entity,
            distinct: false,
            aggregate: false,
            top: None,
            page: None,
            page_size: None,
            paging_cookie: None,
            return_total_count: false,
        }
    }

    /// Render the wire XML. Paging inputs are injected verbatim; everything
    /// else is escaped by the writer.
    pub fn to_xml(&self) -> Result<String> {
        let mut writer = Writer::new(Vec::new());

        let mut fetch = BytesStart::new("fetch");
        fetch.push_attribute(("version", "1.0"));
        fetch.push_attribute(("output-format", "xml-platform"));
        fetch.push_attribute(("mapping", "logical"));
        if self.distinct {
            fetch.push_attribute(("distinct", "true"));
        }
        if self.aggregate {
            fetch.push_attribute(("aggregate", "true"));
        }
        if let Some(top) = self.top {
            fetch.push_attribute(("top", top.to_string().as_str()));
        }
        if let Some(page) = self.page {
            fetch.push_attribute(("page", page.to_string().as_str()));
        }
        if let Some(size) = self.page_size {
            fetch.push_attribute(("count", size.to_string().as_str()));
        }
        if let Some(cookie) = &self.paging_cookie {
            fetch.push_attribute(("paging-cookie", cookie.as_str()));
        }
        if self.return_total_count {
            fetch.push_attribute(("returntotalrecordcount", "true"));
        }
        write_event(&mut writer, Event::Start(fetch))?;

        let mut entity = BytesStart::new("entity");
        entity.push_attribute(("name", self.entity.name.as_str()));
        write_event(&mut writer, Event::Start(entity))?;
        write_entity_body(
            &mut writer,
            self.entity.all_attributes,
            &self.entity.attributes,
            &self.entity.orders,
            self.entity.filter.as_ref(),
            &self.entity.links,
        )?;
        write_event(&mut writer, Event::End(BytesEnd::new("entity")))?;

        write_event(&mut writer, Event::End(BytesEnd::new("fetch")))?;

        String::from_utf8(writer.into_inner())
            .map_err(|e| Error::execution(format!("fetch xml is not utf-8: {}", e)))
    }
}

fn write_event(writer: &mut Writer<Vec<u8>>, event: Event<'_>) -> Result<()> {
    writer
        .write_event(event)
        .map_err(|e| Error::execution(format!("failed to render fetch xml: {}", e)))
}

fn write_entity_body(
    writer: &mut Writer<Vec<u8>>,
    all_attributes: bool,
    attributes: &[FetchAttribute],
    orders: &[FetchOrder],
    filter: Option<&FetchFilter>,
    links: &[FetchLink],
) -> Result<()> {
    if all_attributes {
        write_event(writer, Event::Empty(BytesStart::new("all-attributes")))?;
    }
    for attr in attributes {
        let mut elem = BytesStart::new("attribute");
        elem.push_attribute(("name", attr.name.as_str()));
        if let Some(agg) = attr.aggregate {
            elem.push_attribute(("aggregate", agg.wire_name()));
        }
        if attr.distinct {
            elem.push_attribute(("distinct", "true"));
        }
        if attr.group_by {
            elem.push_attribute(("groupby", "true"));
        }
        if let Some(alias) = &attr.alias {
            elem.push_attribute(("alias", alias.as_str()));
        }
        write_event(writer, Event::Empty(elem))?;
    }
    for order in orders {
        let mut elem = BytesStart::new("order");
        match &order.alias {
            Some(alias) => elem.push_attribute(("alias", alias.as_str())),
            None => elem.push_attribute(("attribute", order.attribute.as_str())),
        }
        if order.descending {
            elem.push_attribute(("descending", "true"));
        }
        write_event(writer, Event::Empty(elem))?;
    }
    if let Some(filter) = filter {
        if !filter.is_empty() {
            write_filter(writer, filter)?;
        }
    }
    for link in links {
        write_link(writer, link)?;
    }
    Ok(())
}

fn write_filter(writer: &mut Writer<Vec<u8>>, filter: &FetchFilter) -> Result<()> {
    let mut elem = BytesStart::new("filter");
    elem.push_attribute((
        "type",
        match filter.kind {
            FilterKind::And => "and",
            FilterKind::Or => "or",
        },
    ));
    write_event(writer, Event::Start(elem))?;
    for cond in &filter.conditions {
        write_condition(writer, cond)?;
    }
    for nested in &filter.filters {
        write_filter(writer, nested)?;
    }
    write_event(writer, Event::End(BytesEnd::new("filter")))
}

fn write_condition(writer: &mut Writer<Vec<u8>>, cond: &FetchCondition) -> Result<()> {
    let mut elem = BytesStart::new("condition");
    if let Some(alias) = &cond.entity_alias {
        elem.push_attribute(("entityname", alias.as_str()));
    }
    elem.push_attribute(("attribute", cond.attribute.as_str()));
    elem.push_attribute(("operator", cond.operator.wire_name()));

    // Multi-value operators emit nested <value> elements; single-value
    // operators use the value attribute.
    let multi = matches!(
        cond.operator,
        FetchOperator::In
            | FetchOperator::NotIn
            | FetchOperator::Between
            | FetchOperator::NotBetween
    );
    if multi {
        write_event(writer, Event::Start(elem))?;
        for value in &cond.values {
            write_event(writer, Event::Start(BytesStart::new("value")))?;
            write_event(writer, Event::Text(BytesText::new(value)))?;
            write_event(writer, Event::End(BytesEnd::new("value")))?;
        }
        write_event(writer, Event::End(BytesEnd::new("condition")))
    } else {
        if let Some(value) = cond.values.first() {
            elem.push_attribute(("value", value.as_str()));
        }
        write_event(writer, Event::Empty(elem))
    }
}

fn write_link(writer: &mut Writer<Vec<u8>>, link: &FetchLink) -> Result<()> {
    let mut elem = BytesStart::new("link-entity");
    elem.push_attribute(("name", link.name.as_str()));
    elem.push_attribute(("from", link.from.as_str()));
    elem.push_attribute(("to", link.to.as_str()));
    if let Some(alias) = &link.alias {
        elem.push_attribute(("alias", alias.as_str()));
    }
    elem.push_attribute((
        "link-type",
        match link.kind {
            LinkKind::Inner => "inner",
            LinkKind::Outer => "outer",
        },
    ));
    write_event(writer, Event::Start(elem))?;
    write_entity_body(
        writer,
        link.all_attributes,
        &link.attributes,
        &[],
        link.filter.as_ref(),
        &link.links,
    )?;
    write_event(writer, Event::End(BytesEnd::new("link-entity")))
}

/// Render a timestamp the way the wire requires: ISO-8601 with millisecond
/// precision, UTC, trailing `Z`.
pub fn format_timestamp(ts: DateTime<Utc>) -> String {
    ts.format("%Y-%m-%dT%H:%M:%S%.3fZ").to_string()
}

/// Render a value for a condition's value slot.
pub fn format_value(value: &QueryValue) -> String {
    match value {
        QueryValue::Timestamp(ts) => format_timestamp(*ts),
        QueryValue::Bool(b) => if *b { "1" } else { "0" }.to_string(),
        other => other.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use chrono::TimeZone;

    use super::*;

    #[test]
    fn test_simple_fetch() {
        let mut entity = FetchEntity::new("account");
        entity.attributes.push(FetchAttribute::plain("name"));
        entity.orders.push(FetchOrder {
            attribute: "name".into(),
            alias: None,
            descending: false,
        });
        let xml = FetchQuery::new(entity).to_xml().unwrap();
        assert_eq!(
            xml,
            "<fetch version=\"1.0\" output-format=\"xml-platform\" mapping=\"logical\">\
             <entity name=\"account\">\
             <attribute name=\"name\"/>\
             <order attribute=\"name\"/>\
             </entity></fetch>"
        );
    }

    #[test]
    fn test_filter_and_in_values() {
        let mut filter = FetchFilter::all();
        filter.conditions.push(FetchCondition {
            attribute: "statecode".into(),
            entity_alias: None,
            operator: FetchOperator::Eq,
            values: vec!["0".into()],
        });
        filter.conditions.push(FetchCondition {
            attribute: "industrycode".into(),
            entity_alias: None,
            operator: FetchOperator::In,
            values: vec!["1".into(), "2".into()],
        });
        let mut entity = FetchEntity::new("account");
        entity.all_attributes = true;
        entity.filter = Some(filter);
        let xml = FetchQuery::new(entity).to_xml().unwrap();
        assert!(xml.contains("<all-attributes/>"));
        assert!(xml.contains("<condition attribute=\"statecode\" operator=\"eq\" value=\"0\"/>"));
        assert!(xml.contains(
            "<condition attribute=\"industrycode\" operator=\"in\"><value>1</value><value>2</value></condition>"
        ));
    }

    #[test]
    fn test_aggregate_document() {
        let mut entity = FetchEntity::new("account");
        entity.attributes.push(FetchAttribute::aggregated(
            "accountid",
            FetchAggregate::Count,
            "row_count",
        ));
        let mut query = FetchQuery::new(entity);
        query.aggregate = true;
        let xml = query.to_xml().unwrap();
        assert!(xml.contains("aggregate=\"true\""));
        assert!(xml.contains(
            "<attribute name=\"accountid\" aggregate=\"count\" alias=\"row_count\"/>"
        ));
    }

    #[test]
    fn test_paging_injected_verbatim() {
        let mut query = FetchQuery::new(FetchEntity::new("contact"));
        query.page = Some(3);
        query.page_size = Some(500);
        query.paging_cookie = Some("{cookie&more}".into());
        let xml = query.to_xml().unwrap();
        assert!(xml.contains("page=\"3\""));
        assert!(xml.contains("count=\"500\""));
        // The writer escapes the ampersand; the cookie is otherwise verbatim.
        assert!(xml.contains("paging-cookie=\"{cookie&amp;more}\""));
    }

    #[test]
    fn test_identifier_escaping() {
        let mut entity = FetchEntity::new("acc\"ount");
        entity.attributes.push(FetchAttribute::plain("na<me"));
        let xml = FetchQuery::new(entity).to_xml().unwrap();
        assert!(xml.contains("name=\"acc&quot;ount\""));
        assert!(xml.contains("name=\"na&lt;me\""));
    }

    #[test]
    fn test_timestamp_wire_format() {
        let ts = Utc.with_ymd_and_hms(2023, 7, 4, 16, 30, 5).unwrap();
        assert_eq!(format_timestamp(ts), "2023-07-04T16:30:05.000Z");
        assert_eq!(
            format_value(&QueryValue::Timestamp(ts)),
            "2023-07-04T16:30:05.000Z"
        );
    }

    #[test]
    fn test_link_entity_nesting() {
        let link = FetchLink {
            name: "contact".into(),
            from: "parentcustomerid".into(),
            to: "accountid".into(),
            alias: Some("c".into()),
            kind: LinkKind::Inner,
            all_attributes: false,
            attributes: vec![FetchAttribute::plain("fullname")],
            filter: None,
            links: Vec::new(),
        };
        let mut entity = FetchEntity::new("account");
        entity.links.push(link);
        let xml = FetchQuery::new(entity).to_xml().unwrap();
        assert!(xml.contains(
            "<link-entity name=\"contact\" from=\"parentcustomerid\" to=\"accountid\" \
             alias=\"c\" link-type=\"inner\"><attribute name=\"fullname\"/></link-entity>"
        ));
    }
}
