use crate::config::{get_credential, normalize_provider_name};
use crate::error::AppError;
use crate::models::CostRecord;
use async_trait::async_trait;
use chrono::NaiveDate;
use reqwest::{Client, Response};
use serde_json::Value;
use std::future::Future;

pub mod aws;
pub mod azure;
pub mod gcp;

/// Upper bound on result pages followed for a single range.
pub(crate) const MAX_PAGES: usize = 50;

#[derive(Debug, Clone)]
pub struct ProviderContext {
    pub account_id: String,
    pub credential: String,
    pub region: Option<String>,
    pub base_url: Option<String>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct RawCostRow {
    pub service_name: String,
    pub resource_group: Option<String>,
    pub cost: f64,
    pub currency: String,
    pub date: NaiveDate,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ProviderCosts {
    pub rows: Vec<RawCostRow>,
    pub total: f64,
    pub currency: String,
}

impl ProviderCosts {
    pub fn from_rows(rows: Vec<RawCostRow>, fallback_currency: &str) -> Self {
        let total = rows.iter().map(|r| r.cost).sum();
        let currency = rows
            .first()
            .map(|r| r.currency.clone())
            .unwrap_or_else(|| fallback_currency.to_string());
        Self {
            rows,
            total,
            currency,
        }
    }

    pub fn into_records(self, account_id: &str) -> Vec<CostRecord> {
        self.rows
            .into_iter()
            .map(|r| CostRecord {
                id: None,
                account_id: account_id.to_string(),
                resource_group: r.resource_group.filter(|g| !g.is_empty()),
                service_name: r.service_name,
                cost: r.cost,
                currency: r.currency,
                date: r.date,
            })
            .collect()
    }
}

#[async_trait]
pub trait CostProvider: Send + Sync {
    fn name(&self) -> &'static str;

    /// Environment variable holding the account, subscription or project identifier.
    fn account_env(&self) -> &'static str;

    fn credential_env(&self) -> &'static str;

    fn load_credential(&self) -> Result<String, AppError> {
        get_credential(self.name(), self.credential_env())
    }

    async fn query_costs(
        &self,
        client: &Client,
        ctx: &ProviderContext,
        start: NaiveDate,
        end: NaiveDate,
    ) -> Result<ProviderCosts, AppError>;

    /// Provider-side estimate of next month's total spend.
    async fn forecast(&self, client: &Client, ctx: &ProviderContext) -> Result<f64, AppError>;
}

pub fn adapter_for(provider: &str) -> Result<Box<dyn CostProvider>, AppError> {
    match normalize_provider_name(provider).as_str() {
        "azure" => Ok(Box::new(azure::AzureAdapter)),
        "aws" => Ok(Box::new(aws::AwsAdapter)),
        "gcp" => Ok(Box::new(gcp::GcpAdapter)),
        other => Err(AppError::Config(format!(
            "Unsupported provider '{other}'. Use azure, aws or gcp."
        ))),
    }
}

/// Turns a non-success response into a transport error carrying the status and body.
pub(crate) async fn ensure_success(
    provider: &'static str,
    response: Response,
) -> Result<Response, AppError> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    let body = response.text().await.unwrap_or_default();
    Err(AppError::Transport {
        provider,
        status: Some(status.as_u16()),
        message: truncate(&body, 300),
    })
}

fn truncate(raw: &str, max_chars: usize) -> String {
    let trimmed = raw.trim();
    match trimmed.char_indices().nth(max_chars) {
        Some((idx, _)) => format!("{}...", &trimmed[..idx]),
        None => trimmed.to_string(),
    }
}

/// Follows a paged listing until `fetch` reports no further cursor.
///
/// Hitting [`MAX_PAGES`] with a cursor still pending is an error, so a truncated range is
/// never handed to the store as if it were complete.
pub(crate) async fn collect_pages<C, F, Fut>(
    provider: &'static str,
    first: C,
    mut fetch: F,
) -> Result<Vec<RawCostRow>, AppError>
where
    F: FnMut(C) -> Fut,
    Fut: Future<Output = Result<(Vec<RawCostRow>, Option<C>), AppError>>,
{
    let mut rows = Vec::new();
    let mut cursor = first;
    for _ in 0..MAX_PAGES {
        let (page, next) = fetch(cursor).await?;
        rows.extend(page);
        match next {
            Some(next) => cursor = next,
            None => return Ok(rows),
        }
    }
    Err(AppError::Transport {
        provider,
        status: None,
        message: format!("result still paginated after {MAX_PAGES} pages; range not stored"),
    })
}

/// Reads a number that providers send either as JSON number or decimal string.
pub(crate) fn as_amount(value: &Value) -> Option<f64> {
    value
        .as_f64()
        .or_else(|| value.as_str().and_then(|s| s.trim().parse().ok()))
}
