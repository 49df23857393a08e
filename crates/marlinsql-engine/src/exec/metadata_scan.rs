use std::sync::Arc;

use marlinsql_common::error::Error;
use marlinsql_common::types::{QueryValue, Row};

use crate::context::ExecutionContext;
use crate::exec::{error_stream, rows_stream, QueryPlanNode, RowStream};

/// The reserved `metadata` schema's virtual tables, served from the schema
/// cache. Filtering and projection stay client-side.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MetadataTable {
    Entity,
    Attribute,
    Relationship,
    OptionSet,
}

impl MetadataTable {
    pub fn from_name(name: &str) -> Option<Self> {
        match name.to_lowercase().as_str() {
            "entity" => Some(MetadataTable::Entity),
            "attribute" => Some(MetadataTable::Attribute),
            "relationship" => Some(MetadataTable::Relationship),
            "optionset" => Some(MetadataTable::OptionSet),
            _ => None,
        }
    }

    fn name(&self) -> &'static str {
        match self {
            MetadataTable::Entity => "entity",
            MetadataTable::Attribute => "attribute",
            MetadataTable::Relationship => "relationship",
            MetadataTable::OptionSet => "optionset",
        }
    }
}

pub struct MetadataScan {
    pub table: MetadataTable,
}

impl QueryPlanNode for MetadataScan {
    fn describe(&self) -> String {
        format!("MetadataScan(metadata.{})", self.table.name())
    }

    fn execute(self: Arc<Self>, ctx: ExecutionContext) -> RowStream {
        let entities = ctx.metadata.entities();
        if entities.is_empty() {
            return error_stream(Error::execution(
                "metadata cache is empty; load entity metadata before querying metadata tables",
            ));
        }

        let mut rows = Vec::new();
        match self.table {
            MetadataTable::Entity => {
                for entity in entities {
                    rows.push(Row::from_pairs([
                        (
                            "logicalname".to_string(),
                            QueryValue::Text(entity.logical_name.clone()),
                        ),
                        (
                            "displayname".to_string(),
                            text_or_null(entity.display_name.clone()),
                        ),
                        (
                            "primaryidattribute".to_string(),
                            QueryValue::Text(entity.primary_key.clone()),
                        ),
                    ]));
                }
            }
            MetadataTable::Attribute => {
                for entity in entities {
                    for attr in &entity.attributes {
                        rows.push(Row::from_pairs([
                            (
                                "entitylogicalname".to_string(),
                                QueryValue::Text(entity.logical_name.clone()),
                            ),
                            (
                                "logicalname".to_string(),
                                QueryValue::Text(attr.logical_name.clone()),
                            ),
                            (
                                "attributetype".to_string(),
                                QueryValue::Text(attr.attribute_type.type_name().to_string()),
                            ),
                            (
                                "displayname".to_string(),
                                text_or_null(attr.display_name.clone()),
                            ),
                            ("isrequired".to_string(), QueryValue::Bool(attr.required)),
                            (
                                "targets".to_string(),
                                text_or_null(if attr.lookup_targets.is_empty() {
                                    None
                                } else {
                                    Some(attr.lookup_targets.join(","))
                                }),
                            ),
                        ]));
                    }
                }
            }
            MetadataTable::Relationship => {
                for entity in entities {
                    for rel in &entity.relationships {
                        rows.push(Row::from_pairs([
                            (
                                "schemaname".to_string(),
                                QueryValue::Text(rel.schema_name.clone()),
                            ),
                            (
                                "referencingentity".to_string(),
                                QueryValue::Text(rel.referencing_entity.clone()),
                            ),
                            (
                                "referencingattribute".to_string(),
                                QueryValue::Text(rel.referencing_attribute.clone()),
                            ),
                            (
                                "referencedentity".to_string(),
                                QueryValue::Text(rel.referenced_entity.clone()),
                            ),
                            (
                                "referencedattribute".to_string(),
                                QueryValue::Text(rel.referenced_attribute.clone()),
                            ),
                        ]));
                    }
                }
            }
            MetadataTable::OptionSet => {
                for entity in entities {
                    for attr in &entity.attributes {
                        for option in &attr.options {
                            rows.push(Row::from_pairs([
                                (
                                    "entitylogicalname".to_string(),
                                    QueryValue::Text(entity.logical_name.clone()),
                                ),
                                (
                                    "attributelogicalname".to_string(),
                                    QueryValue::Text(attr.logical_name.clone()),
                                ),
                                ("value".to_string(), QueryValue::Int(option.code)),
                                (
                                    "label".to_string(),
                                    QueryValue::Text(option.label.clone()),
                                ),
                            ]));
                        }
                    }
                }
            }
        }

        rows_stream(rows, ctx)
    }
}

fn text_or_null(value: Option<String>) -> QueryValue {
    match value {
        Some(s) => QueryValue::Text(s),
        None => QueryValue::Null,
    }
}

#[cfg(test)]
mod tests {
    use marlinsql_common::metadata::{
        AttributeMetadata, AttributeType, EntityMetadata, MetadataCache, OptionSetValue,
    };

    use crate::exec::collect;
    use crate::options::PlanOptions;
    use crate::remote::tests_support::NullRemote;
    use crate::session::SessionHandle;

    use super::*;

    fn ctx_with_metadata() -> ExecutionContext {
        let cache = MetadataCache::new();
        let mut state = AttributeMetadata::new("statecode", AttributeType::OptionSet);
        state.options.push(OptionSetValue {
            code: 0,
            label: "Active".into(),
        });
        cache.insert(EntityMetadata {
            logical_name: "account".into(),
            display_name: Some("Account".into()),
            primary_key: "accountid".into(),
            created_on_attribute: Some("createdon".into()),
            attributes: vec![
                AttributeMetadata::new("accountid", AttributeType::Uuid),
                state,
            ],
            relationships: Vec::new(),
        });
        ExecutionContext::new(
            Arc::new(NullRemote),
            Arc::new(cache),
            SessionHandle::new(),
            Arc::new(PlanOptions::default()),
        )
    }

    #[tokio::test]
    async fn test_entity_table() {
        let rows = collect(
            Arc::new(MetadataScan {
                table: MetadataTable::Entity,
            }),
            &ctx_with_metadata(),
        )
        .await
        .unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(
            rows[0].get("logicalname"),
            Some(&QueryValue::Text("account".into()))
        );
    }

    #[tokio::test]
    async fn test_attribute_and_optionset_tables() {
        let ctx = ctx_with_metadata();
        let attrs = collect(
            Arc::new(MetadataScan {
                table: MetadataTable::Attribute,
            }),
            &ctx,
        )
        .await
        .unwrap();
        assert_eq!(attrs.len(), 2);

        let options = collect(
            Arc::new(MetadataScan {
                table: MetadataTable::OptionSet,
            }),
            &ctx,
        )
        .await
        .unwrap();
        assert_eq!(options.len(), 1);
        assert_eq!(options[0].get("label"), Some(&QueryValue::Text("Active".into())));
    }
}
