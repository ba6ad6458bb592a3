use crate::config::get_credential;
use crate::error::AppError;
use crate::models::current_month_range;
use crate::providers::{
    as_amount, collect_pages, ensure_success, CostProvider, ProviderContext, ProviderCosts,
    RawCostRow,
};
use async_trait::async_trait;
use aws_credential_types::Credentials;
use aws_sigv4::{
    http_request::{SignableBody, SignableRequest, SigningSettings},
    sign::v4::SigningParams,
};
use chrono::{Months, NaiveDate, Utc};
use reqwest::Client;
use serde_json::{json, Value};
use std::time::SystemTime;
use tracing::debug;

const DEFAULT_REGION: &str = "us-east-1";
const SERVICE: &str = "ce";
const CONTENT_TYPE: &str = "application/x-amz-json-1.1";

pub struct AwsAdapter;

#[derive(Debug, Clone, PartialEq, Eq)]
struct AwsKeys {
    access_key_id: String,
    secret_access_key: String,
    session_token: Option<String>,
}

impl AwsKeys {
    /// Credentials are stored as `ACCESS_KEY_ID:SECRET_ACCESS_KEY[:SESSION_TOKEN]`.
    fn parse(raw: &str) -> Result<Self, AppError> {
        let mut parts = raw.splitn(3, ':');
        let access_key_id = parts.next().unwrap_or_default().trim().to_string();
        let secret_access_key = parts.next().unwrap_or_default().trim().to_string();
        if access_key_id.is_empty() || secret_access_key.is_empty() {
            return Err(AppError::Config(
                "AWS credentials not configured. Set AWS_ACCESS_KEY_ID and AWS_SECRET_ACCESS_KEY."
                    .into(),
            ));
        }
        Ok(Self {
            access_key_id,
            secret_access_key,
            session_token: parts
                .next()
                .map(|t| t.trim().to_string())
                .filter(|t| !t.is_empty()),
        })
    }

    fn credentials(&self) -> Credentials {
        Credentials::new(
            self.access_key_id.clone(),
            self.secret_access_key.clone(),
            self.session_token.clone(),
            None,
            "cloudspend",
        )
    }
}

fn signing_error(message: String) -> AppError {
    AppError::Transport {
        provider: "aws",
        status: None,
        message: format!("request signing failed: {message}"),
    }
}

/// SigV4 headers to add to a JSON-RPC `POST` against Cost Explorer.
fn sign_request(
    keys: &AwsKeys,
    region: &str,
    url: &str,
    headers: &[(&str, &str)],
    body: &[u8],
    time: SystemTime,
) -> Result<Vec<(String, String)>, AppError> {
    let identity = keys.credentials().into();
    let signing_params = SigningParams::builder()
        .identity(&identity)
        .region(region)
        .name(SERVICE)
        .time(time)
        .settings(SigningSettings::default())
        .build()
        .map_err(|e| signing_error(e.to_string()))?;

    let signable_request = SignableRequest::new(
        "POST",
        url,
        headers.iter().copied(),
        SignableBody::Bytes(body),
    )
    .map_err(|e| signing_error(e.to_string()))?;

    let (instructions, _signature) =
        aws_sigv4::http_request::sign(signable_request, &signing_params.into())
            .map_err(|e| signing_error(e.to_string()))?
            .into_parts();

    Ok(instructions
        .headers()
        .map(|(name, value)| (name.to_string(), value.to_string()))
        .collect())
}

impl AwsAdapter {
    fn region(ctx: &ProviderContext) -> String {
        ctx.region
            .clone()
            .filter(|r| !r.is_empty())
            .unwrap_or_else(|| DEFAULT_REGION.to_string())
    }

    fn endpoint(ctx: &ProviderContext) -> Result<url::Url, AppError> {
        let raw = ctx
            .base_url
            .clone()
            .unwrap_or_else(|| format!("https://ce.{}.amazonaws.com/", Self::region(ctx)));
        url::Url::parse(&raw)
            .map_err(|e| AppError::Config(format!("Invalid AWS endpoint '{raw}': {e}")))
    }

    async fn call(
        &self,
        client: &Client,
        ctx: &ProviderContext,
        target: &str,
        payload: &Value,
    ) -> Result<Value, AppError> {
        let keys = AwsKeys::parse(&ctx.credential)?;
        let url = Self::endpoint(ctx)?;
        let body = serde_json::to_vec(payload)?;
        let base_headers = [("content-type", CONTENT_TYPE), ("x-amz-target", target)];
        let signed = sign_request(
            &keys,
            &Self::region(ctx),
            url.as_str(),
            &base_headers,
            &body,
            SystemTime::now(),
        )?;

        debug!(%url, target, "calling aws cost explorer");
        let mut req = client.post(url).body(body);
        for (name, value) in base_headers {
            req = req.header(name, value);
        }
        for (name, value) in signed {
            req = req.header(name, value);
        }
        let response = ensure_success(self.name(), req.send().await?).await?;
        Ok(response.json().await?)
    }

    /// `end` is inclusive here; Cost Explorer's `TimePeriod.End` is exclusive.
    fn cost_and_usage_payload(start: NaiveDate, end: NaiveDate, token: Option<&str>) -> Value {
        let end_exclusive = end.succ_opt().unwrap_or(end);
        let mut payload = json!({
            "TimePeriod": {
                "Start": start.format("%Y-%m-%d").to_string(),
                "End": end_exclusive.format("%Y-%m-%d").to_string(),
            },
            "Granularity": "DAILY",
            "Metrics": ["UnblendedCost"],
            "GroupBy": [{ "Type": "DIMENSION", "Key": "SERVICE" }],
        });
        if let Some(token) = token {
            payload["NextPageToken"] = json!(token);
        }
        payload
    }

    fn parse_cost_and_usage(body: &Value) -> Vec<RawCostRow> {
        let results = body
            .get("ResultsByTime")
            .and_then(Value::as_array)
            .cloned()
            .unwrap_or_default();

        let mut out = Vec::new();
        for result in &results {
            let Some(date) = result
                .pointer("/TimePeriod/Start")
                .and_then(Value::as_str)
                .and_then(|s| NaiveDate::parse_from_str(s, "%Y-%m-%d").ok())
            else {
                continue;
            };
            let groups = result
                .get("Groups")
                .and_then(Value::as_array)
                .cloned()
                .unwrap_or_default();
            for group in groups {
                let service_name = group
                    .pointer("/Keys/0")
                    .and_then(Value::as_str)
                    .unwrap_or("Unknown")
                    .to_string();
                let metric = group.pointer("/Metrics/UnblendedCost");
                let cost = metric
                    .and_then(|m| m.get("Amount"))
                    .and_then(as_amount)
                    .unwrap_or(0.0);
                let currency = metric
                    .and_then(|m| m.get("Unit"))
                    .and_then(Value::as_str)
                    .unwrap_or("USD")
                    .to_string();
                out.push(RawCostRow {
                    service_name,
                    resource_group: None,
                    cost,
                    currency,
                    date,
                });
            }
        }
        out
    }

    fn parse_forecast(body: &Value) -> Option<f64> {
        body.pointer("/Total/Amount")
            .and_then(as_amount)
            .or_else(|| body.pointer("/ForecastResultsByTime/0/MeanValue").and_then(as_amount))
    }
}

#[async_trait]
impl CostProvider for AwsAdapter {
    fn name(&self) -> &'static str {
        "aws"
    }

    fn account_env(&self) -> &'static str {
        "AWS_ACCOUNT_ID"
    }

    fn credential_env(&self) -> &'static str {
        "AWS_CREDENTIALS"
    }

    fn load_credential(&self) -> Result<String, AppError> {
        if let (Ok(id), Ok(secret)) = (
            std::env::var("AWS_ACCESS_KEY_ID"),
            std::env::var("AWS_SECRET_ACCESS_KEY"),
        ) {
            if !id.is_empty() && !secret.is_empty() {
                let token = std::env::var("AWS_SESSION_TOKEN").unwrap_or_default();
                return Ok(format!("{id}:{secret}:{token}"));
            }
        }
        get_credential(self.name(), self.credential_env())
    }

    async fn query_costs(
        &self,
        client: &Client,
        ctx: &ProviderContext,
        start: NaiveDate,
        end: NaiveDate,
    ) -> Result<ProviderCosts, AppError> {
        let rows = collect_pages(self.name(), None, |token: Option<String>| async move {
            let payload = Self::cost_and_usage_payload(start, end, token.as_deref());
            let body = self
                .call(client, ctx, "AWSInsightsIndexService.GetCostAndUsage", &payload)
                .await?;
            let next = body
                .get("NextPageToken")
                .and_then(Value::as_str)
                .filter(|t| !t.is_empty())
                .map(|t| Some(t.to_string()));
            Ok::<_, AppError>((Self::parse_cost_and_usage(&body), next))
        })
        .await?;

        Ok(ProviderCosts::from_rows(rows, "USD"))
    }

    async fn forecast(&self, client: &Client, ctx: &ProviderContext) -> Result<f64, AppError> {
        let today = Utc::now().date_naive();
        let (_, next_month) = current_month_range(today);
        let end = next_month
            .checked_add_months(Months::new(1))
            .unwrap_or(next_month);
        let payload = json!({
            "TimePeriod": {
                "Start": next_month.format("%Y-%m-%d").to_string(),
                "End": end.format("%Y-%m-%d").to_string(),
            },
            "Metric": "UNBLENDED_COST",
            "Granularity": "MONTHLY",
        });

        let body = self
            .call(client, ctx, "AWSInsightsIndexService.GetCostForecast", &payload)
            .await?;
        Self::parse_forecast(&body).ok_or_else(|| AppError::Transport {
            provider: self.name(),
            status: None,
            message: "forecast response did not contain a total".into(),
        })
    }
}
