//! Declared sources
//!
//! Every source the deployment ingests is declared here and registered at
//! startup. New sources are compile-time additions: declare the
//! configuration, add it to [`registered_sources`].

use super::{
    AuditPredicate, FieldRule, FieldSpec, FileType, NotificationPolicy, SemanticType, SourceConfig,
};
use fileloader_common::LoadResult;

fn financial_transactions() -> LoadResult<SourceConfig> {
    SourceConfig::builder("financial_transactions")
        .pattern(r"^financial_transactions.*\.parquet(\.gz)?$")
        .file_type(FileType::Parquet)
        .target_table("financial_transactions")
        .field(FieldSpec::new("transaction_id", SemanticType::Integer))
        .field(FieldSpec::new("account_id", SemanticType::Integer))
        .field(
            FieldSpec::new("amount", SemanticType::Float)
                .rule(FieldRule::MinFloat(-1_000_000_000.0)),
        )
        .field(FieldSpec::new("currency", SemanticType::Text).rule(FieldRule::MaxLen(3)))
        .field(FieldSpec::new("booked_at", SemanticType::Timestamp))
        .field(FieldSpec::new("memo", SemanticType::Text).nullable())
        .grain(&["transaction_id"])
        .audit(
            "stage_not_empty",
            "SELECT COUNT(*) FROM {table}",
            AuditPredicate::Gt(0.0),
        )
        .notify(NotificationPolicy {
            recipients: vec!["finance-data@example.com".to_string()],
            cc: vec![],
            kinds: vec![],
        })
        .build()
}

fn customers() -> LoadResult<SourceConfig> {
    SourceConfig::builder("customers")
        .pattern(r"^customers.*\.csv(\.gz)?$")
        .file_type(FileType::csv())
        .target_table("customers")
        .field(FieldSpec::new("id", SemanticType::Integer))
        .field(FieldSpec::new("name", SemanticType::Text))
        .field(
            FieldSpec::new("age", SemanticType::Integer)
                .nullable()
                .rule(FieldRule::MinInt(0)),
        )
        .grain(&["id"])
        .notify(NotificationPolicy {
            recipients: vec!["crm-ops@example.com".to_string()],
            cc: vec![],
            kinds: vec![],
        })
        .build()
}

/// All sources this deployment ingests, in match order.
pub fn registered_sources() -> LoadResult<Vec<SourceConfig>> {
    Ok(vec![financial_transactions()?, customers()?])
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn catalog_sources_are_valid() {
        let sources = registered_sources().unwrap();
        assert!(!sources.is_empty());
        for source in &sources {
            source.validate().unwrap();
        }
    }
}
