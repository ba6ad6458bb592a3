use crate::error::AppError;
use crate::models::current_month_range;
use crate::providers::{
    as_amount, collect_pages, ensure_success, CostProvider, ProviderContext, ProviderCosts,
    RawCostRow,
};
use async_trait::async_trait;
use chrono::{Datelike, Months, NaiveDate, Utc};
use reqwest::Client;
use serde_json::{json, Value};
use tracing::debug;

const DEFAULT_BASE_URL: &str = "https://management.azure.com";
const API_VERSION: &str = "2023-03-01";

pub struct AzureAdapter;

/// Column positions in a Cost Management query result.
#[derive(Debug, Default)]
struct Columns {
    cost: Option<usize>,
    date: Option<usize>,
    service: Option<usize>,
    resource_group: Option<usize>,
    currency: Option<usize>,
}

impl Columns {
    fn from_properties(properties: &Value) -> Self {
        let mut cols = Columns::default();
        let Some(defs) = properties.get("columns").and_then(Value::as_array) else {
            return cols;
        };
        for (idx, def) in defs.iter().enumerate() {
            match def.get("name").and_then(Value::as_str).unwrap_or_default() {
                "Cost" | "PreTaxCost" | "CostUSD" => cols.cost = Some(idx),
                "UsageDate" | "BillingMonth" => cols.date = Some(idx),
                "ServiceName" => cols.service = Some(idx),
                "ResourceGroup" | "ResourceGroupName" => cols.resource_group = Some(idx),
                "Currency" => cols.currency = Some(idx),
                _ => {}
            }
        }
        cols
    }
}

impl AzureAdapter {
    fn endpoint(ctx: &ProviderContext, action: &str) -> Result<String, AppError> {
        let base = ctx.base_url.as_deref().unwrap_or(DEFAULT_BASE_URL);
        let mut url = url::Url::parse(base)
            .map_err(|e| AppError::Config(format!("Invalid Azure base URL '{base}': {e}")))?;
        url.set_path(&format!(
            "/subscriptions/{}/providers/Microsoft.CostManagement/{action}",
            ctx.account_id
        ));
        url.set_query(Some(&format!("api-version={API_VERSION}")));
        Ok(url.to_string())
    }

    fn query_body(start: NaiveDate, end: NaiveDate) -> Value {
        json!({
            "type": "ActualCost",
            "timeframe": "Custom",
            "timePeriod": {
                "from": format!("{}T00:00:00Z", start.format("%Y-%m-%d")),
                "to": format!("{}T23:59:59Z", end.format("%Y-%m-%d")),
            },
            "dataset": {
                "granularity": "Daily",
                "aggregation": { "totalCost": { "name": "Cost", "function": "Sum" } },
                "grouping": [
                    { "type": "Dimension", "name": "ServiceName" },
                    { "type": "Dimension", "name": "ResourceGroup" }
                ]
            }
        })
    }

    fn forecast_body(today: NaiveDate) -> Value {
        let (this_month, _) = current_month_range(today);
        let from = this_month
            .checked_add_months(Months::new(1))
            .unwrap_or(this_month);
        let to = from
            .checked_add_months(Months::new(1))
            .and_then(|d| d.pred_opt())
            .unwrap_or(from);
        json!({
            "type": "ActualCost",
            "timeframe": "Custom",
            "timePeriod": {
                "from": format!("{}T00:00:00Z", from.format("%Y-%m-%d")),
                "to": format!("{}T23:59:59Z", to.format("%Y-%m-%d")),
            },
            "dataset": {
                "granularity": "Monthly",
                "aggregation": { "totalCost": { "name": "Cost", "function": "Sum" } }
            },
            "includeActualCost": false,
            "includeFreshPartialCost": false
        })
    }

    /// `UsageDate` arrives as a yyyymmdd number; monthly results use an ISO timestamp.
    fn parse_usage_date(value: &Value) -> Option<NaiveDate> {
        if let Some(n) = value.as_i64() {
            let (y, md) = (n / 10_000, n % 10_000);
            return NaiveDate::from_ymd_opt(y as i32, (md / 100) as u32, (md % 100) as u32);
        }
        let raw = value.as_str()?;
        if raw.len() == 8 && raw.chars().all(|c| c.is_ascii_digit()) {
            return NaiveDate::parse_from_str(raw, "%Y%m%d").ok();
        }
        raw.get(..10)
            .and_then(|d| NaiveDate::parse_from_str(d, "%Y-%m-%d").ok())
    }

    fn parse_rows(body: &Value, fallback_date: NaiveDate) -> Vec<RawCostRow> {
        let Some(properties) = body.get("properties") else {
            return vec![];
        };
        let cols = Columns::from_properties(properties);
        let Some(cost_idx) = cols.cost else {
            return vec![];
        };

        let rows = properties
            .get("rows")
            .and_then(Value::as_array)
            .cloned()
            .unwrap_or_default();

        let text_at = |row: &Value, idx: Option<usize>| -> Option<String> {
            idx.and_then(|i| row.get(i))
                .and_then(Value::as_str)
                .map(ToString::to_string)
        };

        rows.iter()
            .filter_map(|row| {
                let cost = row.get(cost_idx).and_then(as_amount)?;
                let service_name = text_at(row, cols.service)
                    .filter(|s| !s.is_empty())
                    .unwrap_or_else(|| "Unknown".into());
                Some(RawCostRow {
                    service_name,
                    resource_group: text_at(row, cols.resource_group).filter(|g| !g.is_empty()),
                    cost,
                    currency: text_at(row, cols.currency).unwrap_or_else(|| "USD".into()),
                    date: cols
                        .date
                        .and_then(|i| row.get(i))
                        .and_then(Self::parse_usage_date)
                        .unwrap_or(fallback_date),
                })
            })
            .collect()
    }

    /// Sums the forecast rows. A response without any cost value is not a zero estimate.
    fn forecast_total(body: &Value, today: NaiveDate) -> Result<f64, AppError> {
        let fallback = today.with_day(1).unwrap_or(today);
        let rows = Self::parse_rows(body, fallback);
        if rows.is_empty() {
            return Err(AppError::Transport {
                provider: "azure",
                status: None,
                message: "forecast response did not contain any cost rows".into(),
            });
        }
        Ok(rows.iter().map(|r| r.cost).sum())
    }

    fn next_link(body: &Value) -> Option<String> {
        body.get("properties")
            .and_then(|p| p.get("nextLink"))
            .and_then(Value::as_str)
            .filter(|s| !s.is_empty())
            .map(ToString::to_string)
    }
}

#[async_trait]
impl CostProvider for AzureAdapter {
    fn name(&self) -> &'static str {
        "azure"
    }

    fn account_env(&self) -> &'static str {
        "AZURE_SUBSCRIPTION_ID"
    }

    fn credential_env(&self) -> &'static str {
        "AZURE_ACCESS_TOKEN"
    }

    async fn query_costs(
        &self,
        client: &Client,
        ctx: &ProviderContext,
        start: NaiveDate,
        end: NaiveDate,
    ) -> Result<ProviderCosts, AppError> {
        let body = Self::query_body(start, end);
        let first = Self::endpoint(ctx, "query")?;
        let rows = collect_pages(self.name(), first, |url: String| {
            let body = &body;
            async move {
                debug!(%url, "querying azure cost management");
                let response = client
                    .post(&url)
                    .bearer_auth(&ctx.credential)
                    .json(body)
                    .send()
                    .await?;
                let page: Value = ensure_success(self.name(), response).await?.json().await?;
                Ok::<_, AppError>((Self::parse_rows(&page, start), Self::next_link(&page)))
            }
        })
        .await?;

        Ok(ProviderCosts::from_rows(rows, "USD"))
    }

    async fn forecast(&self, client: &Client, ctx: &ProviderContext) -> Result<f64, AppError> {
        let today = Utc::now().date_naive();
        let response = client
            .post(Self::endpoint(ctx, "forecast")?)
            .bearer_auth(&ctx.credential)
            .json(&Self::forecast_body(today))
            .send()
            .await?;
        let body: Value = ensure_success(self.name(), response).await?.json().await?;
        Self::forecast_total(&body, today)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn day(y: i32, m: u32, d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, d).expect("valid date")
    }

    fn ctx(base_url: Option<&str>) -> ProviderContext {
        ProviderContext {
            account_id: "sub-123".into(),
            credential: "token".into(),
            region: None,
            base_url: base_url.map(ToString::to_string),
        }
    }

    #[test]
    fn endpoint_targets_subscription_scope() {
        assert_eq!(
            AzureAdapter::endpoint(&ctx(None), "query").expect("url"),
            concat!(
                "https://management.azure.com/subscriptions/sub-123",
                "/providers/Microsoft.CostManagement/query?api-version=2023-03-01"
            )
        );
        let custom = AzureAdapter::endpoint(&ctx(Some("http://localhost:8080/")), "forecast")
            .expect("url");
        assert!(custom.starts_with("http://localhost:8080/subscriptions/sub-123/"));
        assert!(AzureAdapter::endpoint(&ctx(Some("not a url")), "query").is_err());
    }

    #[test]
    fn parse_rows_maps_columns_by_name() {
        let body = json!({
            "properties": {
                "columns": [
                    { "name": "Cost", "type": "Number" },
                    { "name": "UsageDate", "type": "Number" },
                    { "name": "ServiceName", "type": "String" },
                    { "name": "ResourceGroup", "type": "String" },
                    { "name": "Currency", "type": "String" }
                ],
                "rows": [
                    [1.25, 20240115, "Storage", "rg-data", "EUR"],
                    [0.5, 20240116, "Virtual Machines", "", "EUR"],
                    ["bad", 20240116, "Bandwidth", "rg", "EUR"]
                ]
            }
        });

        let rows = AzureAdapter::parse_rows(&body, day(2024, 1, 1));
        assert_eq!(rows.len(), 2);
        assert_eq!(
            rows[0],
            RawCostRow {
                service_name: "Storage".into(),
                resource_group: Some("rg-data".into()),
                cost: 1.25,
                currency: "EUR".into(),
                date: day(2024, 1, 15),
            }
        );
        assert!(rows[1].resource_group.is_none());
    }

    #[test]
    fn parse_rows_without_cost_column_is_empty() {
        let body = json!({
            "properties": { "columns": [{ "name": "ServiceName" }], "rows": [["x"]] }
        });
        assert!(AzureAdapter::parse_rows(&body, day(2024, 1, 1)).is_empty());
        assert!(AzureAdapter::parse_rows(&json!({}), day(2024, 1, 1)).is_empty());
    }

    #[test]
    fn parse_usage_date_supports_numeric_and_iso_forms() {
        assert_eq!(
            AzureAdapter::parse_usage_date(&json!(20241231)),
            Some(day(2024, 12, 31))
        );
        assert_eq!(
            AzureAdapter::parse_usage_date(&json!("20240201")),
            Some(day(2024, 2, 1))
        );
        assert_eq!(
            AzureAdapter::parse_usage_date(&json!("2024-03-01T00:00:00")),
            Some(day(2024, 3, 1))
        );
        assert_eq!(AzureAdapter::parse_usage_date(&json!("nope")), None);
    }

    #[test]
    fn forecast_body_covers_next_calendar_month() {
        let body = AzureAdapter::forecast_body(day(2024, 12, 10));
        assert_eq!(body["timePeriod"]["from"], "2025-01-01T00:00:00Z");
        assert_eq!(body["timePeriod"]["to"], "2025-01-31T23:59:59Z");
    }

    #[test]
    fn forecast_total_sums_rows() {
        let body = json!({
            "properties": {
                "columns": [{ "name": "Cost" }, { "name": "UsageDate" }],
                "rows": [[12.5, 20250101], [0.25, 20250102]]
            }
        });
        let total = AzureAdapter::forecast_total(&body, day(2024, 12, 10)).expect("total");
        assert_eq!(total, 12.75);
    }

    #[test]
    fn forecast_total_without_rows_is_transport_error() {
        let err = AzureAdapter::forecast_total(&json!({}), day(2024, 12, 10))
            .expect_err("empty forecast");
        assert!(err.is_transport());

        let no_rows = json!({ "properties": { "columns": [{ "name": "Cost" }], "rows": [] } });
        assert!(AzureAdapter::forecast_total(&no_rows, day(2024, 12, 10)).is_err());
    }

    #[test]
    fn next_link_is_read_from_properties() {
        assert_eq!(
            AzureAdapter::next_link(&json!({ "properties": { "nextLink": "https://next" } })),
            Some("https://next".to_string())
        );
        assert_eq!(
            AzureAdapter::next_link(&json!({ "properties": { "nextLink": null } })),
            None
        );
    }
}
