//! Source configurations
//!
//! A `SourceConfig` binds a filename pattern to a destination table, a row
//! schema with per-field validation, a grain (the natural key that must be
//! unique within a file and in the target), optional audit queries and a
//! notification policy. Configurations are immutable for the process
//! lifetime and owned by the [`registry::SourceRegistry`].

pub mod catalog;
pub mod registry;

use crate::pipeline::batch::Value;
use fileloader_common::{ErrorKind, LoadError, LoadResult};
use regex::Regex;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

/// Semantic type a field is coerced into during validation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SemanticType {
    Integer,
    Float,
    Boolean,
    Text,
    Date,
    Timestamp,
    Json,
}

impl SemanticType {
    pub fn as_str(&self) -> &'static str {
        match self {
            SemanticType::Integer => "integer",
            SemanticType::Float => "float",
            SemanticType::Boolean => "boolean",
            SemanticType::Text => "text",
            SemanticType::Date => "date",
            SemanticType::Timestamp => "timestamp",
            SemanticType::Json => "json",
        }
    }
}

/// Per-field constraint checked after type coercion.
#[derive(Clone)]
pub enum FieldRule {
    MinInt(i64),
    MaxInt(i64),
    MinFloat(f64),
    MaxFloat(f64),
    MaxLen(usize),
    Matches(Regex),
    OneOf(Vec<String>),
    /// Arbitrary predicate declared at registration time.
    Custom {
        name: String,
        check: Arc<dyn Fn(&Value) -> Result<(), String> + Send + Sync>,
    },
}

impl fmt::Debug for FieldRule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FieldRule::MinInt(n) => write!(f, "MinInt({n})"),
            FieldRule::MaxInt(n) => write!(f, "MaxInt({n})"),
            FieldRule::MinFloat(n) => write!(f, "MinFloat({n})"),
            FieldRule::MaxFloat(n) => write!(f, "MaxFloat({n})"),
            FieldRule::MaxLen(n) => write!(f, "MaxLen({n})"),
            FieldRule::Matches(re) => write!(f, "Matches({})", re.as_str()),
            FieldRule::OneOf(vs) => write!(f, "OneOf({vs:?})"),
            FieldRule::Custom { name, .. } => write!(f, "Custom({name})"),
        }
    }
}

impl FieldRule {
    /// Apply the rule to a coerced, non-null value.
    pub fn check(&self, field: &str, value: &Value) -> Result<(), String> {
        match self {
            FieldRule::MinInt(min) => match value {
                Value::Integer(i) if i < min => Err(format!("{field} must be >= {min}, got {i}")),
                _ => Ok(()),
            },
            FieldRule::MaxInt(max) => match value {
                Value::Integer(i) if i > max => Err(format!("{field} must be <= {max}, got {i}")),
                _ => Ok(()),
            },
            FieldRule::MinFloat(min) => match value {
                Value::Float(v) if v < min => Err(format!("{field} must be >= {min}, got {v}")),
                _ => Ok(()),
            },
            FieldRule::MaxFloat(max) => match value {
                Value::Float(v) if v > max => Err(format!("{field} must be <= {max}, got {v}")),
                _ => Ok(()),
            },
            FieldRule::MaxLen(max) => match value {
                Value::Text(s) if s.chars().count() > *max => {
                    Err(format!("{field} longer than {max} characters"))
                },
                _ => Ok(()),
            },
            FieldRule::Matches(re) => match value {
                Value::Text(s) if !re.is_match(s) => {
                    Err(format!("{field} does not match pattern {}", re.as_str()))
                },
                _ => Ok(()),
            },
            FieldRule::OneOf(allowed) => match value {
                Value::Text(s) if !allowed.iter().any(|a| a == s) => {
                    Err(format!("{field} must be one of {allowed:?}, got '{s}'"))
                },
                _ => Ok(()),
            },
            FieldRule::Custom { name, check } => {
                check(value).map_err(|reason| format!("{field} failed rule '{name}': {reason}"))
            },
        }
    }
}

/// Rule evaluated over a whole coerced record.
#[derive(Clone)]
pub struct CrossFieldRule {
    pub name: String,
    pub check: Arc<dyn Fn(&HashMap<String, Value>) -> Result<(), String> + Send + Sync>,
}

impl fmt::Debug for CrossFieldRule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "CrossFieldRule({})", self.name)
    }
}

/// One field of the row schema.
#[derive(Debug, Clone)]
pub struct FieldSpec {
    /// Target column name.
    pub name: String,
    /// Column name in the file when it differs from `name` (matched
    /// case-insensitively).
    pub file_column: Option<String>,
    pub semantic_type: SemanticType,
    pub nullable: bool,
    pub rules: Vec<FieldRule>,
}

impl FieldSpec {
    pub fn new(name: impl Into<String>, semantic_type: SemanticType) -> Self {
        Self {
            name: name.into(),
            file_column: None,
            semantic_type,
            nullable: false,
            rules: Vec::new(),
        }
    }

    pub fn nullable(mut self) -> Self {
        self.nullable = true;
        self
    }

    pub fn from_column(mut self, column: impl Into<String>) -> Self {
        self.file_column = Some(column.into());
        self
    }

    pub fn rule(mut self, rule: FieldRule) -> Self {
        self.rules.push(rule);
        self
    }

    /// The header name expected in the file, lowercased.
    pub fn file_key(&self) -> String {
        self.file_column
            .as_deref()
            .unwrap_or(&self.name)
            .to_lowercase()
    }
}

/// File type tag with type-specific read options.
#[derive(Debug, Clone)]
pub enum FileType {
    Csv {
        delimiter: u8,
        encoding: String,
        skip_rows: u64,
    },
    Excel {
        sheet: String,
        skip_rows: u64,
    },
    Json {
        /// Dot-separated path to the record array, e.g. `data.orders`.
        record_path: Option<String>,
    },
    Parquet,
}

impl FileType {
    pub fn csv() -> Self {
        FileType::Csv {
            delimiter: b',',
            encoding: "utf-8".to_string(),
            skip_rows: 0,
        }
    }

    pub fn tag(&self) -> &'static str {
        match self {
            FileType::Csv { .. } => "csv",
            FileType::Excel { .. } => "excel",
            FileType::Json { .. } => "json",
            FileType::Parquet => "parquet",
        }
    }
}

/// Comparison applied to an audit's observed scalar.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum AuditPredicate {
    Eq(f64),
    Ne(f64),
    Gt(f64),
    Ge(f64),
    Lt(f64),
    Le(f64),
}

impl AuditPredicate {
    pub fn holds(&self, observed: f64) -> bool {
        match self {
            AuditPredicate::Eq(e) => observed == *e,
            AuditPredicate::Ne(e) => observed != *e,
            AuditPredicate::Gt(e) => observed > *e,
            AuditPredicate::Ge(e) => observed >= *e,
            AuditPredicate::Lt(e) => observed < *e,
            AuditPredicate::Le(e) => observed <= *e,
        }
    }
}

impl fmt::Display for AuditPredicate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AuditPredicate::Eq(e) => write!(f, "= {e}"),
            AuditPredicate::Ne(e) => write!(f, "!= {e}"),
            AuditPredicate::Gt(e) => write!(f, "> {e}"),
            AuditPredicate::Ge(e) => write!(f, ">= {e}"),
            AuditPredicate::Lt(e) => write!(f, "< {e}"),
            AuditPredicate::Le(e) => write!(f, "<= {e}"),
        }
    }
}

/// User-declared scalar check run against the stage table after writing.
#[derive(Debug, Clone)]
pub struct AuditCheck {
    pub name: String,
    /// SQL template; `{table}` is replaced with the stage table name.
    pub sql: String,
    pub predicate: AuditPredicate,
}

/// Which stakeholders hear about which failures.
#[derive(Debug, Clone, Default)]
pub struct NotificationPolicy {
    pub recipients: Vec<String>,
    pub cc: Vec<String>,
    /// Error kinds that trigger an email; empty means all stakeholder kinds.
    pub kinds: Vec<ErrorKind>,
}

impl NotificationPolicy {
    pub fn enabled_for(&self, kind: ErrorKind) -> bool {
        !self.recipients.is_empty() && (self.kinds.is_empty() || self.kinds.contains(&kind))
    }
}

/// Immutable, process-lifetime description of one ingestable source.
#[derive(Debug, Clone)]
pub struct SourceConfig {
    pub name: String,
    /// Matched against the base filename.
    pub pattern: Regex,
    pub file_type: FileType,
    /// Force gzip decoding even without a `.gz` extension.
    pub gzip: bool,
    pub target_table: String,
    pub fields: Vec<FieldSpec>,
    /// Ordered subset of `fields` that must be unique within a file.
    pub grain: Vec<String>,
    /// Absolute number of invalid rows tolerated before the file fails.
    pub error_threshold: u64,
    pub audits: Vec<AuditCheck>,
    pub cross_field_rules: Vec<CrossFieldRule>,
    pub notify: NotificationPolicy,
}

impl SourceConfig {
    pub fn builder(name: impl Into<String>) -> SourceConfigBuilder {
        SourceConfigBuilder::new(name)
    }

    pub fn matches(&self, filename: &str) -> bool {
        self.pattern.is_match(filename)
    }

    pub fn field(&self, name: &str) -> Option<&FieldSpec> {
        self.fields.iter().find(|f| f.name == name)
    }

    /// Target column names in declaration order.
    pub fn column_names(&self) -> Vec<String> {
        self.fields.iter().map(|f| f.name.clone()).collect()
    }

    /// Stage/target columns: schema fields plus the bookkeeping columns
    /// stamped on every row.
    pub fn stage_columns(&self) -> Vec<String> {
        let mut columns = self.column_names();
        columns.push("source_filename".to_string());
        columns.push("file_load_id".to_string());
        columns.push("etl_row_hash".to_string());
        columns
    }

    /// Registration-time invariants: grain non-empty, grain ⊆ schema, grain
    /// fields non-nullable, field names unique.
    pub fn validate(&self) -> LoadResult<()> {
        if self.fields.is_empty() {
            return Err(LoadError::config(format!(
                "source '{}' declares no fields",
                self.name
            )));
        }
        let mut seen = std::collections::HashSet::new();
        for field in &self.fields {
            if !seen.insert(field.name.to_lowercase()) {
                return Err(LoadError::config(format!(
                    "source '{}' declares field '{}' more than once",
                    self.name, field.name
                )));
            }
        }
        if self.grain.is_empty() {
            return Err(LoadError::config(format!(
                "source '{}' declares an empty grain",
                self.name
            )));
        }
        for grain_field in &self.grain {
            match self.field(grain_field) {
                None => {
                    return Err(LoadError::config(format!(
                        "source '{}' grain field '{}' is not in the schema",
                        self.name, grain_field
                    )));
                },
                Some(spec) if spec.nullable => {
                    return Err(LoadError::config(format!(
                        "source '{}' grain field '{}' must not be nullable",
                        self.name, grain_field
                    )));
                },
                Some(_) => {},
            }
        }
        if self.target_table.trim().is_empty() {
            return Err(LoadError::config(format!(
                "source '{}' has an empty target table",
                self.name
            )));
        }
        Ok(())
    }
}

/// Fluent construction for source declarations.
pub struct SourceConfigBuilder {
    name: String,
    pattern: Option<Regex>,
    file_type: FileType,
    gzip: bool,
    target_table: String,
    fields: Vec<FieldSpec>,
    grain: Vec<String>,
    error_threshold: u64,
    audits: Vec<AuditCheck>,
    cross_field_rules: Vec<CrossFieldRule>,
    notify: NotificationPolicy,
}

impl SourceConfigBuilder {
    fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            pattern: None,
            file_type: FileType::csv(),
            gzip: false,
            target_table: String::new(),
            fields: Vec::new(),
            grain: Vec::new(),
            error_threshold: 0,
            audits: Vec::new(),
            cross_field_rules: Vec::new(),
            notify: NotificationPolicy::default(),
        }
    }

    pub fn pattern(mut self, pattern: &str) -> Self {
        self.pattern = Regex::new(pattern).ok();
        self
    }

    pub fn file_type(mut self, file_type: FileType) -> Self {
        self.file_type = file_type;
        self
    }

    pub fn gzip(mut self, gzip: bool) -> Self {
        self.gzip = gzip;
        self
    }

    pub fn target_table(mut self, table: impl Into<String>) -> Self {
        self.target_table = table.into();
        self
    }

    pub fn field(mut self, field: FieldSpec) -> Self {
        self.fields.push(field);
        self
    }

    pub fn grain(mut self, fields: &[&str]) -> Self {
        self.grain = fields.iter().map(|f| f.to_string()).collect();
        self
    }

    pub fn error_threshold(mut self, threshold: u64) -> Self {
        self.error_threshold = threshold;
        self
    }

    pub fn audit(mut self, name: &str, sql: &str, predicate: AuditPredicate) -> Self {
        self.audits.push(AuditCheck {
            name: name.to_string(),
            sql: sql.to_string(),
            predicate,
        });
        self
    }

    pub fn cross_field_rule(
        mut self,
        name: &str,
        check: impl Fn(&HashMap<String, Value>) -> Result<(), String> + Send + Sync + 'static,
    ) -> Self {
        self.cross_field_rules.push(CrossFieldRule {
            name: name.to_string(),
            check: Arc::new(check),
        });
        self
    }

    pub fn notify(mut self, policy: NotificationPolicy) -> Self {
        self.notify = policy;
        self
    }

    pub fn build(self) -> LoadResult<SourceConfig> {
        let pattern = self.pattern.ok_or_else(|| {
            LoadError::config(format!(
                "source '{}' has a missing or invalid filename pattern",
                self.name
            ))
        })?;
        let config = SourceConfig {
            name: self.name,
            pattern,
            file_type: self.file_type,
            gzip: self.gzip,
            target_table: self.target_table,
            fields: self.fields,
            grain: self.grain,
            error_threshold: self.error_threshold,
            audits: self.audits,
            cross_field_rules: self.cross_field_rules,
            notify: self.notify,
        };
        config.validate()?;
        Ok(config)
    }
}
