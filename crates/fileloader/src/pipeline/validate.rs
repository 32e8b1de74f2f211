//! Per-row validation
//!
//! Coerces raw values into the declared semantic types, applies nullability
//! and field/cross-field rules, and performs the streaming grain pre-check.
//! Valid records come out typed with a content hash; invalid records become
//! DLQ rows carrying the failing fields, human-readable reasons and the
//! serialized original row.
//!
//! Crossing the error threshold does not stop the stream: the whole file is
//! still read so the DLQ holds the complete error set, and the pipeline
//! fails after end of stream.

use crate::db::DlqRow;
use crate::pipeline::batch::{Batch, Record, Value};
use crate::sources::{SemanticType, SourceConfig};
use chrono::{DateTime, NaiveDate, NaiveDateTime, Utc};
use fileloader_common::{LoadError, LoadResult};
use sha2::{Digest, Sha256};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tracing::{debug, warn};

/// How many failure summaries are kept in memory for log context.
const SAMPLE_FAILURES: usize = 5;

/// A record that passed validation, with typed values.
#[derive(Debug, Clone)]
pub struct TypedRecord {
    pub row_number: u64,
    pub values: HashMap<String, Value>,
    pub grain_key: String,
    pub row_hash: String,
}

/// A batch split into its valid and invalid parts.
#[derive(Debug, Default)]
pub struct ValidatedBatch {
    pub valid: Vec<TypedRecord>,
    pub invalid: Vec<DlqRow>,
}

pub struct Validator {
    source: Arc<SourceConfig>,
    filename: String,
    file_load_id: i64,
    seen_grains: HashSet<String>,
    grain_duplicate_examples: Vec<String>,
    records_validated: u64,
    invalid_count: u64,
    sample_failures: Vec<String>,
}

/// Coerce a raw value into the declared semantic type.
fn coerce(raw: &Value, ty: SemanticType) -> Result<Value, String> {
    match (raw, ty) {
        (Value::Null, _) => Ok(Value::Null),

        (Value::Text(s), SemanticType::Text) => Ok(Value::Text(s.clone())),
        (other, SemanticType::Text) => Ok(Value::Text(other.render())),

        (Value::Integer(i), SemanticType::Integer) => Ok(Value::Integer(*i)),
        (Value::Float(f), SemanticType::Integer) if f.fract() == 0.0 => {
            Ok(Value::Integer(*f as i64))
        },
        (Value::Text(s), SemanticType::Integer) => {
            let trimmed = s.trim();
            trimmed
                .parse::<i64>()
                .map(Value::Integer)
                .map_err(|_| format!("'{trimmed}' is not an integer"))
        },
        (other, SemanticType::Integer) => {
            Err(format!("cannot read {} as integer", other.type_name()))
        },

        (Value::Float(f), SemanticType::Float) => Ok(Value::Float(*f)),
        (Value::Integer(i), SemanticType::Float) => Ok(Value::Float(*i as f64)),
        (Value::Text(s), SemanticType::Float) => {
            let trimmed = s.trim();
            trimmed
                .parse::<f64>()
                .map(Value::Float)
                .map_err(|_| format!("'{trimmed}' is not a number"))
        },
        (other, SemanticType::Float) => Err(format!("cannot read {} as float", other.type_name())),

        (Value::Boolean(b), SemanticType::Boolean) => Ok(Value::Boolean(*b)),
        (Value::Integer(0), SemanticType::Boolean) => Ok(Value::Boolean(false)),
        (Value::Integer(1), SemanticType::Boolean) => Ok(Value::Boolean(true)),
        (Value::Text(s), SemanticType::Boolean) => {
            match s.trim().to_lowercase().as_str() {
                "true" | "t" | "yes" | "y" | "1" => Ok(Value::Boolean(true)),
                "false" | "f" | "no" | "n" | "0" => Ok(Value::Boolean(false)),
                other => Err(format!("'{other}' is not a boolean")),
            }
        },
        (other, SemanticType::Boolean) => {
            Err(format!("cannot read {} as boolean", other.type_name()))
        },

        (Value::Date(d), SemanticType::Date) => Ok(Value::Date(*d)),
        (Value::Timestamp(ts), SemanticType::Date) => Ok(Value::Date(ts.date_naive())),
        (Value::Text(s), SemanticType::Date) => parse_date(s.trim()),
        (other, SemanticType::Date) => Err(format!("cannot read {} as date", other.type_name())),

        (Value::Timestamp(ts), SemanticType::Timestamp) => Ok(Value::Timestamp(*ts)),
        (Value::Date(d), SemanticType::Timestamp) => {
            let naive = d.and_hms_opt(0, 0, 0).unwrap_or_default();
            Ok(Value::Timestamp(DateTime::from_naive_utc_and_offset(
                naive, Utc,
            )))
        },
        (Value::Text(s), SemanticType::Timestamp) => parse_timestamp(s.trim()),
        (other, SemanticType::Timestamp) => {
            Err(format!("cannot read {} as timestamp", other.type_name()))
        },

        (Value::Json(v), SemanticType::Json) => Ok(Value::Json(v.clone())),
        (Value::Text(s), SemanticType::Json) => serde_json::from_str(s)
            .map(Value::Json)
            .map_err(|e| format!("invalid JSON: {e}")),
        (other, SemanticType::Json) => Ok(Value::Json(other.to_json())),
    }
}

fn parse_date(s: &str) -> Result<Value, String> {
    if let Ok(date) = NaiveDate::parse_from_str(s, "%Y-%m-%d") {
        return Ok(Value::Date(date));
    }
    if let Ok(ts) = DateTime::parse_from_rfc3339(s) {
        return Ok(Value::Date(ts.date_naive()));
    }
    Err(format!("'{s}' is not a date (expected YYYY-MM-DD)"))
}

fn parse_timestamp(s: &str) -> Result<Value, String> {
    if let Ok(ts) = DateTime::parse_from_rfc3339(s) {
        return Ok(Value::Timestamp(ts.with_timezone(&Utc)));
    }
    for format in ["%Y-%m-%d %H:%M:%S", "%Y-%m-%dT%H:%M:%S"] {
        if let Ok(naive) = NaiveDateTime::parse_from_str(s, format) {
            return Ok(Value::Timestamp(DateTime::from_naive_utc_and_offset(
                naive, Utc,
            )));
        }
    }
    if let Ok(date) = NaiveDate::parse_from_str(s, "%Y-%m-%d") {
        let naive = date.and_hms_opt(0, 0, 0).unwrap_or_default();
        return Ok(Value::Timestamp(DateTime::from_naive_utc_and_offset(
            naive, Utc,
        )));
    }
    Err(format!("'{s}' is not a timestamp"))
}

/// Content hash over field values sorted by field name; drives merge change
/// detection.
pub fn row_hash(values: &HashMap<String, Value>) -> String {
    let mut keys: Vec<&String> = values.keys().collect();
    keys.sort();
    let mut hasher = Sha256::new();
    for key in keys {
        hasher.update(key.as_bytes());
        hasher.update(b"=");
        hasher.update(values.get(key).map(|v| v.render()).unwrap_or_default());
        hasher.update(b"\n");
    }
    hex::encode(hasher.finalize())
}

impl Validator {
    pub fn new(source: Arc<SourceConfig>, filename: &str, file_load_id: i64) -> Self {
        Self {
            source,
            filename: filename.to_string(),
            file_load_id,
            seen_grains: HashSet::new(),
            grain_duplicate_examples: Vec::new(),
            records_validated: 0,
            invalid_count: 0,
            sample_failures: Vec::new(),
        }
    }

    pub fn records_validated(&self) -> u64 {
        self.records_validated
    }

    pub fn invalid_count(&self) -> u64 {
        self.invalid_count
    }

    /// Refine one batch into its valid and invalid parts.
    pub fn process(&mut self, batch: Batch) -> ValidatedBatch {
        let mut result = ValidatedBatch::default();
        for record in batch.records {
            self.records_validated += 1;
            match self.validate_record(&record) {
                Ok(typed) => result.valid.push(typed),
                Err((failed_fields, reasons)) => {
                    self.invalid_count += 1;
                    if self.sample_failures.len() < SAMPLE_FAILURES {
                        self.sample_failures
                            .push(format!("row {}: {}", record.row_number, reasons.join("; ")));
                    }
                    result.invalid.push(self.dlq_row(&record, failed_fields, reasons));
                },
            }
        }
        debug!(
            file = %self.filename,
            validated = self.records_validated,
            invalid = self.invalid_count,
            "Validated batch"
        );
        result
    }

    /// After end of stream: a file with any repeated grain tuple fails
    /// holistically, even though the repeats were suppressed from the
    /// stage. Checked before the threshold verdict.
    pub fn check_grain(&self) -> LoadResult<()> {
        if !self.grain_duplicate_examples.is_empty() {
            warn!(
                file = %self.filename,
                grain = ?self.source.grain,
                examples = ?self.grain_duplicate_examples,
                "File contains duplicate grain tuples"
            );
            return Err(LoadError::GrainValidation {
                file: self.filename.clone(),
                examples: self.grain_duplicate_examples.clone(),
            });
        }
        Ok(())
    }

    /// After end of stream: fail the file if the threshold was crossed.
    pub fn check_threshold(&self) -> LoadResult<()> {
        if self.invalid_count > self.source.error_threshold {
            warn!(
                file = %self.filename,
                invalid = self.invalid_count,
                threshold = self.source.error_threshold,
                samples = ?self.sample_failures,
                "Validation threshold exceeded"
            );
            return Err(LoadError::ValidationThresholdExceeded {
                file: self.filename.clone(),
                invalid: self.invalid_count,
                threshold: self.source.error_threshold,
            });
        }
        Ok(())
    }

    #[allow(clippy::type_complexity)]
    fn validate_record(
        &mut self,
        record: &Record,
    ) -> Result<TypedRecord, (Vec<String>, Vec<String>)> {
        let mut typed: HashMap<String, Value> = HashMap::with_capacity(self.source.fields.len());
        let mut failed_fields: Vec<String> = Vec::new();
        let mut reasons: Vec<String> = Vec::new();

        for field in &self.source.fields {
            let raw = record.get(&field.file_key());
            match coerce(raw, field.semantic_type) {
                Err(reason) => {
                    failed_fields.push(field.name.clone());
                    reasons.push(format!("{}: {reason}", field.name));
                },
                Ok(Value::Null) if !field.nullable => {
                    failed_fields.push(field.name.clone());
                    reasons.push(format!("{}: must not be null", field.name));
                },
                Ok(value) => {
                    if !value.is_null() {
                        for rule in &field.rules {
                            if let Err(reason) = rule.check(&field.name, &value) {
                                failed_fields.push(field.name.clone());
                                reasons.push(reason);
                            }
                        }
                    }
                    typed.insert(field.name.clone(), value);
                },
            }
        }

        if failed_fields.is_empty() {
            for rule in &self.source.cross_field_rules {
                if let Err(reason) = (rule.check)(&typed) {
                    failed_fields.push(rule.name.clone());
                    reasons.push(format!("rule '{}': {reason}", rule.name));
                }
            }
        }

        if !failed_fields.is_empty() {
            failed_fields.sort();
            failed_fields.dedup();
            return Err((failed_fields, reasons));
        }

        // streaming grain pre-check: first occurrence wins, repeats go to
        // the DLQ instead of producing duplicate stage rows
        let grain_key = self.grain_key_of(&typed);
        if !self.seen_grains.insert(grain_key.clone()) {
            if self.grain_duplicate_examples.len() < SAMPLE_FAILURES {
                self.grain_duplicate_examples.push(grain_key.clone());
            }
            return Err((
                self.source.grain.clone(),
                vec![format!(
                    "DuplicateGrain: grain ({}) = '{}' already seen in this file",
                    self.source.grain.join(", "),
                    grain_key
                )],
            ));
        }

        let row_hash = row_hash(&typed);
        Ok(TypedRecord {
            row_number: record.row_number,
            values: typed,
            grain_key,
            row_hash,
        })
    }

    fn grain_key_of(&self, typed: &HashMap<String, Value>) -> String {
        self.source
            .grain
            .iter()
            .map(|g| typed.get(g).map(|v| v.render()).unwrap_or_default())
            .collect::<Vec<_>>()
            .join("|")
    }

    fn dlq_row(
        &self,
        record: &Record,
        failed_fields: Vec<String>,
        reasons: Vec<String>,
    ) -> DlqRow {
        // best-effort grain key from the raw record so self-healing can
        // match a later successful publish
        let grain_key = self
            .source
            .grain
            .iter()
            .map(|g| {
                let field = self.source.field(g);
                let raw = field
                    .map(|f| record.get(&f.file_key()))
                    .unwrap_or(&Value::Null);
                field
                    .and_then(|f| coerce(raw, f.semantic_type).ok())
                    .unwrap_or_else(|| raw.clone())
                    .render()
            })
            .collect::<Vec<_>>()
            .join("|");

        DlqRow {
            file_load_id: self.file_load_id,
            source_name: self.source.name.clone(),
            source_row_number: record.row_number,
            grain_key,
            failed_fields,
            reasons,
            original_row_json: record.to_json(),
            created_at: Utc::now(),
        }
    }
}
