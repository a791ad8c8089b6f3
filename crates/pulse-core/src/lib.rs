//! Core domain model for the client-portal metrics sync subsystem.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use thiserror::Error;
use uuid::Uuid;

pub const CRATE_NAME: &str = "pulse-core";

/// Note stamped on Metric rows created by the aggregator.
pub const AUTO_AGGREGATED_NOTE: &str = "Auto-aggregated from platform metrics";

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ParseEnumError {
    #[error("unknown {kind} value `{value}`")]
    Unknown { kind: &'static str, value: String },
}

macro_rules! text_enum {
    ($name:ident, $kind:literal, { $($variant:ident => $text:literal),+ $(,)? }) => {
        impl $name {
            pub fn as_str(&self) -> &'static str {
                match self {
                    $(Self::$variant => $text,)+
                }
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(self.as_str())
            }
        }

        impl FromStr for $name {
            type Err = ParseEnumError;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                match s {
                    $($text => Ok(Self::$variant),)+
                    other => Err(ParseEnumError::Unknown {
                        kind: $kind,
                        value: other.to_string(),
                    }),
                }
            }
        }
    };
}

/// Upstream advertising / analytics platforms with a registered adapter.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Platform {
    Naver,
    Meta,
    GoogleAds,
    Ga4,
}

impl Platform {
    pub const ALL: [Platform; 4] = [
        Platform::Naver,
        Platform::Meta,
        Platform::GoogleAds,
        Platform::Ga4,
    ];
}

text_enum!(Platform, "platform", {
    Naver => "naver",
    Meta => "meta",
    GoogleAds => "google_ads",
    Ga4 => "ga4",
});

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IntegrationStatus {
    Active,
    Inactive,
    Error,
}

text_enum!(IntegrationStatus, "integration status", {
    Active => "active",
    Inactive => "inactive",
    Error => "error",
});

impl IntegrationStatus {
    /// Statuses picked up by the batch "sync all active" run. Errored
    /// integrations are retried on every batch.
    pub const BATCH_ELIGIBLE: [IntegrationStatus; 2] =
        [IntegrationStatus::Active, IntegrationStatus::Error];
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncKind {
    Full,
    Incremental,
}

text_enum!(SyncKind, "sync kind", {
    Full => "full",
    Incremental => "incremental",
});

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncStatus {
    Running,
    Success,
    Error,
}

text_enum!(SyncStatus, "sync status", {
    Running => "running",
    Success => "success",
    Error => "error",
});

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PeriodType {
    Weekly,
    Monthly,
}

text_enum!(PeriodType, "period type", {
    Weekly => "weekly",
    Monthly => "monthly",
});

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum RangeError {
    #[error("date range start {from} is after end {to}")]
    Inverted { from: NaiveDate, to: NaiveDate },
}

/// Inclusive `[from, to]` day range supplied by the caller of every trigger.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct DateRange {
    from: NaiveDate,
    to: NaiveDate,
}

impl DateRange {
    pub fn new(from: NaiveDate, to: NaiveDate) -> Result<Self, RangeError> {
        if from > to {
            return Err(RangeError::Inverted { from, to });
        }
        Ok(Self { from, to })
    }

    pub fn from(&self) -> NaiveDate {
        self.from
    }

    pub fn to(&self) -> NaiveDate {
        self.to
    }

    pub fn contains(&self, date: NaiveDate) -> bool {
        self.from <= date && date <= self.to
    }

    pub fn days(&self) -> i64 {
        (self.to - self.from).num_days() + 1
    }
}

impl fmt::Display for DateRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}..{}", self.from, self.to)
    }
}

/// One configured connection between a client and an upstream platform.
#[derive(Clone, PartialEq, Serialize, Deserialize)]
pub struct Integration {
    pub id: Uuid,
    pub client_id: Uuid,
    pub platform: Platform,
    pub display_name: String,
    /// Opaque credential blob, interpreted only by the platform's adapter.
    pub credentials: JsonValue,
    pub status: IntegrationStatus,
    pub last_synced_at: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
}

impl fmt::Debug for Integration {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Integration")
            .field("id", &self.id)
            .field("client_id", &self.client_id)
            .field("platform", &self.platform)
            .field("display_name", &self.display_name)
            .field("credentials", &"<redacted>")
            .field("status", &self.status)
            .field("last_synced_at", &self.last_synced_at)
            .field("last_error", &self.last_error)
            .finish()
    }
}

impl Integration {
    pub fn sync_kind(&self) -> SyncKind {
        if self.last_synced_at.is_none() {
            SyncKind::Full
        } else {
            SyncKind::Incremental
        }
    }
}

/// Append-only audit row, one per sync attempt.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SyncLog {
    pub id: Uuid,
    pub integration_id: Uuid,
    pub sync_kind: SyncKind,
    pub status: SyncStatus,
    pub records_synced: i64,
    pub error_message: Option<String>,
    pub started_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
}

/// Narrow per-day, per-metric fact produced by an adapter fan-out.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MetricFact {
    pub metric_date: NaiveDate,
    pub metric_key: String,
    pub metric_value: f64,
    pub dimensions: JsonValue,
    /// The wide upstream row this fact was split out of.
    pub raw_row: JsonValue,
}

/// Persisted daily fact. Natural key: `(integration_id, metric_date, metric_key)`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MetricRow {
    pub id: Uuid,
    pub client_id: Uuid,
    pub integration_id: Uuid,
    pub platform: Platform,
    pub metric_date: NaiveDate,
    pub metric_key: String,
    pub metric_value: f64,
    pub dimensions: JsonValue,
    pub raw_row: JsonValue,
}

impl MetricRow {
    pub fn from_fact(integration: &Integration, fact: MetricFact) -> Self {
        Self {
            id: Uuid::new_v4(),
            client_id: integration.client_id,
            integration_id: integration.id,
            platform: integration.platform,
            metric_date: fact.metric_date,
            metric_key: fact.metric_key,
            metric_value: fact.metric_value,
            dimensions: fact.dimensions,
            raw_row: fact.raw_row,
        }
    }
}

/// Client-scoped allow-list entry for a canonical KPI key.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct KpiDefinition {
    pub id: Uuid,
    pub client_id: Uuid,
    pub metric_key: String,
    pub label: String,
    pub unit: Option<String>,
    pub is_visible: bool,
    pub display_order: i32,
}

/// Calendar bucket used by aggregation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Period {
    pub start: NaiveDate,
    pub end: NaiveDate,
}

impl Period {
    /// The full bucket as an inclusive day range.
    pub fn as_range(&self) -> DateRange {
        DateRange {
            from: self.start.min(self.end),
            to: self.start.max(self.end),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct MetricNaturalKey {
    pub client_id: Uuid,
    pub period_type: PeriodType,
    pub period_start: NaiveDate,
    pub period_end: NaiveDate,
    pub metric_key: String,
}

/// Aggregated KPI value for one client, period and canonical key.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Metric {
    pub id: Uuid,
    pub client_id: Uuid,
    pub period_type: PeriodType,
    pub period_start: NaiveDate,
    pub period_end: NaiveDate,
    pub metric_key: String,
    pub value: f64,
    pub notes: Option<String>,
    pub created_by: Uuid,
}

impl Metric {
    pub fn natural_key(&self) -> MetricNaturalKey {
        MetricNaturalKey {
            client_id: self.client_id,
            period_type: self.period_type,
            period_start: self.period_start,
            period_end: self.period_end,
            metric_key: self.metric_key.clone(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "scope", content = "client_id")]
pub enum ClientScope {
    Client(Uuid),
    /// Every client with at least one MetricRow in the requested range.
    AllWithFacts,
}

/// Round half away from zero to two decimal places.
pub fn round2(value: f64) -> f64 {
    (value * 100.0).round() / 100.0
}
