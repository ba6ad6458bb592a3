use chrono::{Datelike, Months, NaiveDate};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

pub const DATE_FORMAT: &str = "%Y-%m-%d";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CostRecord {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<i64>,
    pub account_id: String,
    pub resource_group: Option<String>,
    pub service_name: String,
    pub cost: f64,
    pub currency: String,
    pub date: NaiveDate,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MonthlyCost {
    pub month: String,
    pub total_cost: f64,
    pub currency: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Confidence {
    Low,
    Medium,
    High,
}

impl Confidence {
    pub fn as_str(self) -> &'static str {
        match self {
            Confidence::Low => "low",
            Confidence::Medium => "medium",
            Confidence::High => "high",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Forecast {
    pub next_month: f64,
    pub confidence: Confidence,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Trend {
    Increasing,
    Decreasing,
    Stable,
    NoData,
}

impl Trend {
    pub fn as_str(self) -> &'static str {
        match self {
            Trend::Increasing => "increasing",
            Trend::Decreasing => "decreasing",
            Trend::Stable => "stable",
            Trend::NoData => "no_data",
        }
    }
}

impl fmt::Display for Trend {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrendAnalysis {
    pub current_month: f64,
    pub previous_month: f64,
    pub change_percent: f64,
    pub trend: Trend,
    pub average_monthly: f64,
    pub projection: f64,
}

impl TrendAnalysis {
    pub fn no_data() -> Self {
        Self {
            current_month: 0.0,
            previous_month: 0.0,
            change_percent: 0.0,
            trend: Trend::NoData,
            average_monthly: 0.0,
            projection: 0.0,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CostSummary {
    pub period: String,
    pub total_cost: f64,
    pub currency: String,
    pub by_service: BTreeMap<String, f64>,
    pub by_resource_group: BTreeMap<String, f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub forecast: Option<Forecast>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub monthly_breakdown: Option<Vec<MonthlyCost>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub trend: Option<TrendAnalysis>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Alert {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<i64>,
    pub name: String,
    pub threshold: f64,
    pub account_id: String,
    pub enabled: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Report {
    pub generated_at: String,
    pub period: String,
    pub total_cost: f64,
    pub currency: String,
    pub forecast: f64,
    pub monthly_data: Vec<MonthlyCost>,
    pub top_services: Vec<ServiceCost>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServiceCost {
    pub service: String,
    pub cost: f64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Dimension {
    Service,
    ResourceGroup,
}

impl Dimension {
    pub fn column(self) -> &'static str {
        match self {
            Dimension::Service => "service_name",
            Dimension::ResourceGroup => "resource_group",
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CostFilter {
    pub start_date: Option<NaiveDate>,
    pub end_date: Option<NaiveDate>,
    pub service_name: Option<String>,
}

impl CostFilter {
    pub fn between(start: NaiveDate, end: NaiveDate) -> Self {
        Self {
            start_date: Some(start),
            end_date: Some(end),
            service_name: None,
        }
    }

    pub fn period_label(&self) -> String {
        let start = self
            .start_date
            .map(|d| d.format(DATE_FORMAT).to_string())
            .unwrap_or_else(|| "beginning".into());
        let end = self
            .end_date
            .map(|d| d.format(DATE_FORMAT).to_string())
            .unwrap_or_else(|| "today".into());
        format!("{start} to {end}")
    }
}

/// First day of `today`'s month and first day of the following month.
pub fn current_month_range(today: NaiveDate) -> (NaiveDate, NaiveDate) {
    let start = today.with_day(1).unwrap_or(today);
    let end = start.checked_add_months(Months::new(1)).unwrap_or(start);
    (start, end)
}

pub fn last_n_months(today: NaiveDate, months: u32) -> (NaiveDate, NaiveDate) {
    let start = today
        .checked_sub_months(Months::new(months))
        .unwrap_or(NaiveDate::MIN);
    (start, today)
}

pub fn parse_date(raw: &str) -> Option<NaiveDate> {
    NaiveDate::parse_from_str(raw.trim(), DATE_FORMAT).ok()
}
