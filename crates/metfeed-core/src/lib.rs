//! Core domain model for metfeed: datasets, their fixed schemas, canonical records
//! and the run audit rows shared by the storage, adapter and sync crates.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

pub const CRATE_NAME: &str = "metfeed-core";

/// Publisher name stamped on every alert.
pub const ALERT_ISSUER: &str = "Trinidad and Tobago Meteorological Service";

/// One of the two independent record streams pulled from the provider.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum Dataset {
    #[serde(rename = "rss_alerts")]
    Alerts,
    #[serde(rename = "forecasts")]
    Forecasts,
}

impl Dataset {
    /// Run order used by the orchestrator when several datasets are selected.
    pub const ALL: [Dataset; 2] = [Dataset::Alerts, Dataset::Forecasts];

    /// Identifier written to the `run_type` audit column.
    pub fn run_type(self) -> &'static str {
        match self {
            Dataset::Alerts => "rss_alerts",
            Dataset::Forecasts => "forecasts",
        }
    }

    pub fn from_run_type(value: &str) -> Option<Self> {
        match value {
            "rss_alerts" => Some(Dataset::Alerts),
            "forecasts" => Some(Dataset::Forecasts),
            _ => None,
        }
    }

    pub fn schema(self) -> &'static DatasetSchema {
        match self {
            Dataset::Alerts => &ALERTS_SCHEMA,
            Dataset::Forecasts => &FORECASTS_SCHEMA,
        }
    }

    /// Human label used in log lines and run error messages.
    pub fn label(self) -> &'static str {
        match self {
            Dataset::Alerts => "alert",
            Dataset::Forecasts => "forecast",
        }
    }
}

impl fmt::Display for Dataset {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.run_type())
    }
}

/// What happens when an incoming record's id is already stored.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ConflictPolicy {
    /// Latest write wins; the stored row is overwritten in place.
    Replace,
    /// First write wins; later records with the same id are skipped.
    Ignore,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum IdKind {
    Text,
    Integer,
}

/// Table layout agreed between the normalizer and the store.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DatasetSchema {
    pub dataset: Dataset,
    pub table: &'static str,
    pub id_column: &'static str,
    pub id_kind: IdKind,
    /// Payload columns in storage order, excluding the id and `ingested_at_column`.
    pub columns: &'static [&'static str],
    pub ingested_at_column: &'static str,
    /// Column reported as the "latest" date by the status query.
    pub latest_column: &'static str,
    pub conflict: ConflictPolicy,
}

impl DatasetSchema {
    pub fn has_column(&self, name: &str) -> bool {
        self.columns.contains(&name)
    }
}

pub const ALERT_COLUMNS: &[&str] = &[
    "title",
    "description",
    "link",
    "pub_date",
    "alert_level",
    "alert_type",
    "issued_by",
];

pub const FORECAST_COLUMNS: &[&str] = &[
    "amended",
    "IssuedAt",
    "forecastTime",
    "forecaster",
    "forecastPeriod",
    "forecastArea1",
    "forecastArea2",
    "forecastArea3",
    "textArea1",
    "textArea2",
    "textArea3",
    "addMarine",
    "imageTrin",
    "imagebago",
    "seas",
    "waves1",
    "waves2",
    "PiarcoMnTemp",
    "CrownMnTemp",
    "TmPiarcoMnTemp",
    "TmCrownMnTemp",
    "TmWeatherPiarcoMn",
    "TmWeatherCpMn",
    "TmPiarcoMxTemp",
    "TmCrownMxTemp",
    "TmWeatherPiarcoMx",
    "TmWeatherCpMx",
    "outlook1",
    "minTrin24look",
    "maxTrin24look",
    "minTob24look",
    "maxTob24look",
    "outlook2",
    "minTrin48look",
    "maxTrin48look",
    "minTob48look",
    "maxTob48look",
    "outlook24WeatherPiarco",
    "outlook48WeatherPiarco",
    "outlook24WeatherCrown",
    "outlook48WeatherCrown",
    "PiarcoFcstMxTemp",
    "CrownFcstMxTemp",
    "PiarcoActMxTemp",
    "CrownActMxTemp",
    "PiarcoFcstMnTemp",
    "CrownFcstMnTemp",
    "PiarcoRainfall",
    "CrownPointRinfall",
    "cumlativeRain",
    "cumlativeCpRain",
    "PiarcoheatIndex",
    "CPointheatIndex",
    "sunrise",
    "sunset",
    "gustywinds",
    "gustywinds2",
    "tideDate",
    "tideTime",
    "tideTime2",
    "trinAmHigh",
    "trinPmHigh",
    "trinAmLow",
    "trinPmLow",
    "tobAmHigh",
    "tobPmHigh",
    "tobAmLow",
    "tobPmLow",
    "precipitation",
    "timePeriod",
    "probrainfall",
    "uvrate",
    "jsonObject",
    "wx24",
    "wx24cp",
    "wx48",
    "wx48cp",
    "synopsis",
    "TmPiarco",
    "TmCrown",
    "insertionDate",
];

pub static ALERTS_SCHEMA: DatasetSchema = DatasetSchema {
    dataset: Dataset::Alerts,
    table: "weather_alerts",
    id_column: "alert_id",
    id_kind: IdKind::Text,
    columns: ALERT_COLUMNS,
    ingested_at_column: "insertion_date",
    latest_column: "pub_date",
    conflict: ConflictPolicy::Replace,
};

pub static FORECASTS_SCHEMA: DatasetSchema = DatasetSchema {
    dataset: Dataset::Forecasts,
    table: "detailed_forecasts",
    id_column: "forecastid",
    id_kind: IdKind::Integer,
    columns: FORECAST_COLUMNS,
    ingested_at_column: "ingested_at",
    latest_column: "insertionDate",
    conflict: ConflictPolicy::Ignore,
};

/// Stable key of a canonical record within its dataset.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(untagged)]
pub enum RecordId {
    Numeric(i64),
    Text(String),
}

impl fmt::Display for RecordId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RecordId::Numeric(id) => write!(f, "{id}"),
            RecordId::Text(id) => f.write_str(id),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FieldValue {
    pub name: &'static str,
    pub value: Option<String>,
}

/// Normalized, stably keyed representation of one ingested item.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CanonicalRecord {
    pub dataset: Dataset,
    pub id: RecordId,
    /// One entry per schema column, in schema order.
    pub fields: Vec<FieldValue>,
    pub ingested_at: DateTime<Utc>,
}

impl CanonicalRecord {
    /// Build a record whose fields follow the dataset schema, pulling each value from `lookup`.
    pub fn from_schema(
        dataset: Dataset,
        id: RecordId,
        ingested_at: DateTime<Utc>,
        mut lookup: impl FnMut(&'static str) -> Option<String>,
    ) -> Self {
        let fields = dataset
            .schema()
            .columns
            .iter()
            .map(|&name| FieldValue {
                name,
                value: lookup(name),
            })
            .collect();
        Self {
            dataset,
            id,
            fields,
            ingested_at,
        }
    }

    pub fn get(&self, name: &str) -> Option<&str> {
        self.fields
            .iter()
            .find(|f| f.name == name)
            .and_then(|f| f.value.as_deref())
    }
}

/// Aggregate volume of a single run.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunCounts {
    pub fetched: u64,
    pub inserted: u64,
    pub dropped: u64,
}

/// Input handed to the run logger at the end of a started run.
///
/// `error` doubles as the outcome flag, so a failed run always carries a message
/// and a successful one never does.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RunReport {
    pub dataset: Dataset,
    pub started_at: DateTime<Utc>,
    pub ended_at: DateTime<Utc>,
    pub counts: RunCounts,
    pub error: Option<String>,
    pub fetch_seconds: Option<f64>,
}

impl RunReport {
    pub fn success(&self) -> bool {
        self.error.is_none()
    }

    pub fn duration_seconds(&self) -> f64 {
        let millis = (self.ended_at - self.started_at).num_milliseconds().max(0);
        millis as f64 / 1000.0
    }
}

/// One persisted audit row.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RunRecord {
    pub run_id: i64,
    pub run_timestamp: DateTime<Utc>,
    pub run_type: Dataset,
    pub started_at: DateTime<Utc>,
    pub ended_at: DateTime<Utc>,
    pub duration_seconds: f64,
    pub fetched_count: u64,
    pub inserted_count: u64,
    pub dropped_count: u64,
    pub success: bool,
    pub error_message: Option<String>,
    pub fetch_seconds: Option<f64>,
    pub total_rows_after: Option<u64>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct LastRunSummary {
    pub run_type: String,
    pub run_timestamp: String,
    pub success: bool,
}

/// Read-only snapshot answered by the status query.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct StoreStats {
    pub alerts_total: u64,
    pub forecasts_total: u64,
    pub latest_alert_date: Option<String>,
    pub latest_forecast_date: Option<String>,
    pub total_runs: u64,
    pub last_run: Option<LastRunSummary>,
}

impl StoreStats {
    pub fn total_for(&self, dataset: Dataset) -> u64 {
        match dataset {
            Dataset::Alerts => self.alerts_total,
            Dataset::Forecasts => self.forecasts_total,
        }
    }
}
