#![forbid(unsafe_code)]

use std::collections::BTreeMap;
use std::fmt::{Display, Formatter};
use std::str::FromStr;

use anyhow::Result;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use time::OffsetDateTime;
use ulid::Ulid;

mod serial;
mod table;

pub use serial::{
    canonical_json, decode_json, from_unix_seconds, json_str_of_obj, obj_id_of_obj, unix_seconds,
    unwrap_calls, unwrap_calls_value, wrap_calls,
};
pub use table::{is_missing, Row, Table};

#[derive(Debug, Clone, thiserror::Error, Eq, PartialEq)]
pub enum TruError {
    #[error("unsupported filter value for {field}: {value}")]
    UnsupportedFilterValue { field: &'static str, value: String },
    #[error("invalid {column} payload: {message}")]
    Decode {
        column: &'static str,
        message: String,
    },
    #[error("validation error: {0}")]
    Validation(String),
}

macro_rules! string_id {
    ($name:ident) => {
        #[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
        #[serde(transparent)]
        pub struct $name(pub String);

        impl $name {
            #[must_use]
            pub fn as_str(&self) -> &str {
                &self.0
            }
        }

        impl Display for $name {
            fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
                f.write_str(&self.0)
            }
        }

        impl From<&str> for $name {
            fn from(value: &str) -> Self {
                Self(value.to_string())
            }
        }

        impl From<String> for $name {
            fn from(value: String) -> Self {
                Self(value)
            }
        }
    };
}

string_id!(RecordId);
string_id!(AppId);
string_id!(FeedbackDefinitionId);
string_id!(FeedbackResultId);

impl FeedbackResultId {
    #[must_use]
    pub fn generate() -> Self {
        Self(format!("feedback_result_{}", Ulid::new()))
    }
}

/// Token and dollar accounting attached to records and feedback results.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct Cost {
    #[serde(default)]
    pub n_tokens: i64,
    #[serde(default, deserialize_with = "serial::nan_from_null")]
    pub cost: f64,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct Perf {
    #[serde(default, with = "time::serde::rfc3339::option")]
    pub start_time: Option<OffsetDateTime>,
    #[serde(default, with = "time::serde::rfc3339::option")]
    pub end_time: Option<OffsetDateTime>,
    #[serde(default, deserialize_with = "serial::nan_from_null")]
    pub latency: f64,
}

impl Perf {
    /// Timing for a call that started at `start_time` and ended at `end_time`.
    #[must_use]
    pub fn between(start_time: OffsetDateTime, end_time: OffsetDateTime) -> Self {
        Self {
            start_time: Some(start_time),
            end_time: Some(end_time),
            latency: (end_time - start_time).as_seconds_f64(),
        }
    }
}

/// One instrumented call captured inside a record trace.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RecordAppCall {
    pub path: String,
    #[serde(default)]
    pub args: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rets: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub perf: Option<Perf>,
}

/// One captured execution of an instrumented application.
///
/// `main_input`, `main_output`, `tags`, `ts`, `cost` and `perf` are also
/// projected into their own columns on write; the serialized record remains
/// the source of truth.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Record {
    pub record_id: RecordId,
    pub app_id: AppId,
    #[serde(default)]
    pub main_input: Option<String>,
    #[serde(default)]
    pub main_output: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub main_error: Option<String>,
    #[serde(default)]
    pub tags: String,
    #[serde(with = "time::serde::rfc3339")]
    pub ts: OffsetDateTime,
    #[serde(default)]
    pub cost: Cost,
    #[serde(default)]
    pub perf: Perf,
    #[serde(default)]
    pub calls: Vec<RecordAppCall>,
}

/// A registered application graph.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct App {
    pub app_id: AppId,
    /// Class of the wrapped application's root component; labels records by
    /// application type.
    pub root_class: String,
    #[serde(default)]
    pub app: Value,
    #[serde(default)]
    pub feedback_definitions: Vec<FeedbackDefinitionId>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct FeedbackDefinition {
    pub feedback_definition_id: FeedbackDefinitionId,
    pub name: String,
    #[serde(default)]
    pub implementation: Value,
    #[serde(default)]
    pub selectors: BTreeMap<String, String>,
}

#[derive(Serialize)]
struct FeedbackDefinitionContent<'a> {
    name: &'a str,
    implementation: &'a Value,
    selectors: &'a BTreeMap<String, String>,
}

impl FeedbackDefinition {
    /// Builds a definition whose id is derived from its content, so two
    /// identical definitions share one id.
    ///
    /// # Errors
    /// Returns an error when the implementation cannot be serialized.
    pub fn new(
        name: impl Into<String>,
        implementation: Value,
        selectors: BTreeMap<String, String>,
    ) -> Result<Self, serde_json::Error> {
        let name = name.into();
        let content = FeedbackDefinitionContent {
            name: &name,
            implementation: &implementation,
            selectors: &selectors,
        };
        let feedback_definition_id =
            FeedbackDefinitionId(obj_id_of_obj(&content, "feedback_definition")?);
        Ok(Self {
            feedback_definition_id,
            name,
            implementation,
            selectors,
        })
    }
}

/// A single invocation of a feedback function.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct FeedbackCall {
    #[serde(default)]
    pub args: BTreeMap<String, Value>,
    /// A non-finite return is stored as `null` and reads back as NaN.
    #[serde(deserialize_with = "serial::nan_from_null")]
    pub ret: f64,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
#[serde(rename_all = "snake_case")]
pub enum FeedbackResultStatus {
    Running,
    Done,
    Failed,
}

impl FeedbackResultStatus {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Running => "running",
            Self::Done => "done",
            Self::Failed => "failed",
        }
    }

    #[must_use]
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "running" => Some(Self::Running),
            "done" => Some(Self::Done),
            "failed" => Some(Self::Failed),
            _ => None,
        }
    }
}

impl Display for FeedbackResultStatus {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for FeedbackResultStatus {
    type Err = TruError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        Self::parse(value).ok_or_else(|| TruError::UnsupportedFilterValue {
            field: "status",
            value: value.to_string(),
        })
    }
}

/// Outcome, or pending state, of one feedback definition applied to one
/// record. Re-inserting under the same id replaces the stored state.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct FeedbackResult {
    pub feedback_result_id: FeedbackResultId,
    pub record_id: RecordId,
    pub feedback_definition_id: FeedbackDefinitionId,
    #[serde(with = "time::serde::rfc3339")]
    pub last_ts: OffsetDateTime,
    pub status: FeedbackResultStatus,
    #[serde(default)]
    pub error: Option<String>,
    #[serde(default)]
    pub calls: Vec<FeedbackCall>,
    #[serde(default)]
    pub result: Option<f64>,
    pub name: String,
    #[serde(default)]
    pub cost: Cost,
}

impl FeedbackResult {
    /// A freshly dispatched, not yet completed evaluation.
    #[must_use]
    pub fn pending(record_id: RecordId, definition: &FeedbackDefinition) -> Self {
        Self {
            feedback_result_id: FeedbackResultId::generate(),
            record_id,
            feedback_definition_id: definition.feedback_definition_id.clone(),
            last_ts: OffsetDateTime::now_utc(),
            status: FeedbackResultStatus::Running,
            error: None,
            calls: Vec::new(),
            result: None,
            name: definition.name.clone(),
            cost: Cost::default(),
        }
    }

    #[must_use]
    pub fn done(mut self, result: f64, calls: Vec<FeedbackCall>) -> Self {
        self.status = FeedbackResultStatus::Done;
        self.result = Some(result);
        self.calls = calls;
        self.error = None;
        self.last_ts = OffsetDateTime::now_utc();
        self
    }

    #[must_use]
    pub fn failed(mut self, error: impl Into<String>) -> Self {
        self.status = FeedbackResultStatus::Failed;
        self.error = Some(error.into());
        self.last_ts = OffsetDateTime::now_utc();
        self
    }
}

/// Database metadata used to recognise pre-versioned files.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct DbMeta {
    pub trulens_version: Option<String>,
    pub attributes: BTreeMap<String, String>,
}

/// Conjunction of optional predicates over stored feedback results. Filters
/// left unset impose no constraint.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct FeedbackFilter {
    pub record_id: Option<RecordId>,
    pub feedback_result_id: Option<FeedbackResultId>,
    pub feedback_definition_id: Option<FeedbackDefinitionId>,
    pub status: Option<StatusFilter>,
    pub last_ts_before: Option<OffsetDateTime>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StatusFilter {
    One(FeedbackResultStatus),
    AnyOf(Vec<FeedbackResultStatus>),
}

impl FeedbackFilter {
    #[must_use]
    pub fn record_id(mut self, record_id: RecordId) -> Self {
        self.record_id = Some(record_id);
        self
    }

    #[must_use]
    pub fn feedback_result_id(mut self, feedback_result_id: FeedbackResultId) -> Self {
        self.feedback_result_id = Some(feedback_result_id);
        self
    }

    #[must_use]
    pub fn feedback_definition_id(mut self, feedback_definition_id: FeedbackDefinitionId) -> Self {
        self.feedback_definition_id = Some(feedback_definition_id);
        self
    }

    #[must_use]
    pub fn status(mut self, status: FeedbackResultStatus) -> Self {
        self.status = Some(StatusFilter::One(status));
        self
    }

    #[must_use]
    pub fn statuses(mut self, statuses: impl IntoIterator<Item = FeedbackResultStatus>) -> Self {
        self.status = Some(StatusFilter::AnyOf(statuses.into_iter().collect()));
        self
    }

    /// Status set given as text, validated before any query runs.
    ///
    /// # Errors
    /// Returns [`TruError::UnsupportedFilterValue`] for an unknown status.
    pub fn statuses_from_names<S: AsRef<str>>(self, names: &[S]) -> Result<Self, TruError> {
        let parsed = names
            .iter()
            .map(|name| name.as_ref().parse::<FeedbackResultStatus>())
            .collect::<Result<Vec<_>, _>>()?;
        Ok(self.statuses(parsed))
    }

    #[must_use]
    pub fn last_ts_before(mut self, bound: OffsetDateTime) -> Self {
        self.last_ts_before = Some(bound);
        self
    }
}

/// One stored feedback result joined with its record, definition and app.
#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct FeedbackRow {
    pub record_id: RecordId,
    pub feedback_result_id: FeedbackResultId,
    pub feedback_definition_id: FeedbackDefinitionId,
    #[serde(with = "time::serde::rfc3339")]
    pub last_ts: OffsetDateTime,
    pub status: FeedbackResultStatus,
    pub error: Option<String>,
    pub name: String,
    pub result: Option<f64>,
    pub cost: Cost,
    pub perf: Perf,
    pub calls: Vec<FeedbackCall>,
    pub feedback_definition: FeedbackDefinition,
    pub record: Record,
    pub app: App,
    pub latency: f64,
    pub total_tokens: i64,
    pub total_cost: f64,
    #[serde(rename = "type")]
    pub app_type: String,
}

/// Persistence contract for records, apps, feedback definitions and feedback
/// results.
pub trait TruDb {
    /// Deletes all stored data while keeping the schema usable.
    #[allow(clippy::missing_errors_doc)]
    fn reset_database(&self) -> Result<()>;

    #[allow(clippy::missing_errors_doc)]
    fn insert_record(&self, record: &Record) -> Result<RecordId>;

    #[allow(clippy::missing_errors_doc)]
    fn insert_app(&self, app: &App) -> Result<AppId>;

    #[allow(clippy::missing_errors_doc)]
    fn insert_feedback_definition(
        &self,
        feedback_definition: &FeedbackDefinition,
    ) -> Result<FeedbackDefinitionId>;

    #[allow(clippy::missing_errors_doc)]
    fn insert_feedback(&self, feedback_result: &FeedbackResult) -> Result<FeedbackResultId>;

    #[allow(clippy::missing_errors_doc)]
    fn get_feedback_defs(
        &self,
        feedback_definition_id: Option<&FeedbackDefinitionId>,
    ) -> Result<Vec<FeedbackDefinition>>;

    #[allow(clippy::missing_errors_doc)]
    fn get_feedback(&self, filter: &FeedbackFilter) -> Result<Vec<FeedbackRow>>;

    #[allow(clippy::missing_errors_doc)]
    fn get_app(&self, app_id: &AppId) -> Result<Option<Value>>;

    /// Records for `app_ids` (all apps when empty) with one column per
    /// feedback function, alongside the names of those columns.
    #[allow(clippy::missing_errors_doc)]
    fn get_records_and_feedback(&self, app_ids: &[AppId]) -> Result<(Table, Vec<String>)>;

    #[allow(clippy::missing_errors_doc)]
    fn get_meta(&self) -> Result<DbMeta>;
}
