use crate::error::AppError;
use crate::providers::{
    as_amount, ensure_success, CostProvider, ProviderContext, ProviderCosts, RawCostRow,
};
use async_trait::async_trait;
use chrono::NaiveDate;
use reqwest::Client;
use serde_json::{json, Value};
use tracing::debug;

const DEFAULT_BASE_URL: &str = "https://cloudbilling.googleapis.com";

pub struct GcpAdapter;

impl GcpAdapter {
    fn endpoint(ctx: &ProviderContext) -> Result<String, AppError> {
        let base = ctx.base_url.as_deref().unwrap_or(DEFAULT_BASE_URL);
        let mut url = url::Url::parse(base)
            .map_err(|e| AppError::Config(format!("Invalid GCP base URL '{base}': {e}")))?;
        url.set_path(&format!("/v1/projects/{}:getCostInfo", ctx.account_id));
        Ok(url.to_string())
    }

    fn request_body(start: NaiveDate, end: NaiveDate) -> Value {
        json!({
            "reportConfig": {
                "timePeriod": {
                    "startTime": format!("{}T00:00:00Z", start.format("%Y-%m-%d")),
                    "endTime": format!("{}T23:59:59Z", end.format("%Y-%m-%d")),
                },
                "metrics": ["cost"]
            }
        })
    }

    /// The cost-info endpoint returns one project-wide total, not a per-service breakdown.
    fn parse_cost_info(body: &Value, start: NaiveDate) -> ProviderCosts {
        let currency = body
            .get("currencyCode")
            .and_then(Value::as_str)
            .filter(|c| !c.is_empty())
            .unwrap_or("USD")
            .to_string();
        let total = body
            .get("costAmountSum")
            .and_then(as_amount)
            .unwrap_or(0.0);
        let date = body
            .get("usageStartTime")
            .and_then(Value::as_str)
            .and_then(|s| s.get(..10))
            .and_then(|s| NaiveDate::parse_from_str(s, "%Y-%m-%d").ok())
            .unwrap_or(start);

        let rows = vec![RawCostRow {
            service_name: "All Services".into(),
            resource_group: None,
            cost: total,
            currency: currency.clone(),
            date,
        }];
        ProviderCosts::from_rows(rows, &currency)
    }
}

#[async_trait]
impl CostProvider for GcpAdapter {
    fn name(&self) -> &'static str {
        "gcp"
    }

    fn account_env(&self) -> &'static str {
        "GCP_PROJECT_ID"
    }

    fn credential_env(&self) -> &'static str {
        "GOOGLE_AUTH_TOKEN"
    }

    async fn query_costs(
        &self,
        client: &Client,
        ctx: &ProviderContext,
        start: NaiveDate,
        end: NaiveDate,
    ) -> Result<ProviderCosts, AppError> {
        let url = Self::endpoint(ctx)?;
        debug!(%url, "querying gcp cost info");
        let response = client
            .post(url)
            .bearer_auth(&ctx.credential)
            .json(&Self::request_body(start, end))
            .send()
            .await?;
        let body: Value = ensure_success(self.name(), response).await?.json().await?;
        Ok(Self::parse_cost_info(&body, start))
    }

    async fn forecast(&self, _client: &Client, _ctx: &ProviderContext) -> Result<f64, AppError> {
        Err(AppError::Transport {
            provider: self.name(),
            status: None,
            message: "billing API does not provide a spend forecast".into(),
        })
    }
}
