use crate::aggregator::build_summary;
use crate::alerts::{evaluate, AlertEvaluation};
use crate::config::{db_path, AppConfig, SETTING_ACCOUNT_ID};
use crate::error::AppError;
use crate::forecast::{analyze_trend, local_forecast, resolve_forecast, HISTORY_MONTHS};
use crate::free_tier::{classify, FreeTierConfig, ServiceUsage};
use crate::models::{
    current_month_range, last_n_months, Alert, CostFilter, CostSummary, Forecast, Report,
    ServiceCost, TrendAnalysis,
};
use crate::providers::{adapter_for, CostProvider, ProviderContext};
use crate::storage::Storage;
use chrono::{NaiveDate, Utc};
use reqwest::Client;
use std::time::Duration;
use tracing::{info, warn};

pub const REPORT_MONTHS: u32 = 12;

pub struct CostService {
    client: Client,
    storage: Storage,
    provider: Box<dyn CostProvider>,
    cfg: AppConfig,
}

impl CostService {
    pub fn new(
        storage: Storage,
        provider: Box<dyn CostProvider>,
        cfg: AppConfig,
    ) -> Result<Self, AppError> {
        let client = Client::builder()
            .connect_timeout(Duration::from_secs(10))
            .timeout(Duration::from_secs(60))
            .build()?;
        Ok(Self {
            client,
            storage,
            provider,
            cfg,
        })
    }

    /// Opens the configured database and resolves the configured provider adapter.
    pub fn from_config(cfg: AppConfig) -> Result<Self, AppError> {
        let storage = Storage::open(&db_path(&cfg)?)?;
        let provider = adapter_for(&cfg.provider)?;
        Self::new(storage, provider, cfg)
    }

    pub fn storage(&self) -> &Storage {
        &self.storage
    }

    pub fn provider_name(&self) -> &'static str {
        self.provider.name()
    }

    /// Stored setting first, then the config file, then the provider's environment variable.
    pub fn account_id(&self) -> Result<String, AppError> {
        if let Some(id) = self.storage.get_setting(SETTING_ACCOUNT_ID)? {
            if !id.trim().is_empty() {
                return Ok(id);
            }
        }
        if let Some(id) = self.cfg.account_id.as_ref().filter(|id| !id.trim().is_empty()) {
            return Ok(id.clone());
        }
        let env_var = self.provider.account_env();
        match std::env::var(env_var) {
            Ok(id) if !id.trim().is_empty() => Ok(id),
            _ => Err(AppError::Config(format!(
                "No account id configured for '{}'. \
                 Run `cloudspend config set account_id <id>` or set {env_var}.",
                self.provider.name()
            ))),
        }
    }

    fn provider_context(&self, account_id: String) -> Result<ProviderContext, AppError> {
        Ok(ProviderContext {
            account_id,
            credential: self.provider.load_credential()?,
            region: self.cfg.region.clone(),
            base_url: self.cfg.base_url.clone(),
        })
    }

    /// Pulls provider costs for `start..=end` and appends them to the store.
    pub async fn fetch_and_store(
        &mut self,
        start: NaiveDate,
        end: NaiveDate,
    ) -> Result<usize, AppError> {
        let account_id = self.account_id()?;
        let ctx = self.provider_context(account_id.clone())?;

        let existing = self.storage.count_in_range(&account_id, start, end)?;
        if existing > 0 {
            warn!(
                account_id = %account_id,
                existing,
                %start,
                %end,
                "range already has stored costs; new rows are appended"
            );
        }

        let costs = self
            .provider
            .query_costs(&self.client, &ctx, start, end)
            .await?;
        let total = costs.total;
        let currency = costs.currency.clone();
        let records = costs.into_records(&account_id);
        let inserted = self.storage.insert_batch(&records)?;
        info!(
            provider = self.provider.name(),
            rows = inserted,
            total,
            currency = %currency,
            "ingested cost records"
        );
        Ok(inserted)
    }

    pub fn cost_summary(&self, filter: &CostFilter) -> Result<CostSummary, AppError> {
        build_summary(&self.storage, filter, &self.cfg.currency)
    }

    fn local_forecast(&self) -> Option<Forecast> {
        match self.storage.monthly_totals(HISTORY_MONTHS) {
            Ok(months) => Some(local_forecast(&months)),
            Err(err) => {
                warn!(error = %err, "could not read monthly history for local forecast");
                None
            }
        }
    }

    /// Local projection when it is at least medium confidence, otherwise the provider estimate.
    pub async fn forecast(&self) -> Result<Forecast, AppError> {
        let local = self.local_forecast();
        let remote = async {
            let ctx = self.provider_context(self.account_id()?)?;
            self.provider.forecast(&self.client, &ctx).await
        };
        resolve_forecast(local, remote).await
    }

    pub fn trend_analysis(&self) -> Result<TrendAnalysis, AppError> {
        let months = self.storage.monthly_totals(HISTORY_MONTHS)?;
        Ok(analyze_trend(&months))
    }

    pub fn generate_report(&self) -> Result<Report, AppError> {
        let monthly_data = self.storage.monthly_totals(REPORT_MONTHS)?;
        let summary = self.cost_summary(&CostFilter::default())?;

        let mut top_services: Vec<ServiceCost> = summary
            .by_service
            .into_iter()
            .map(|(service, cost)| ServiceCost { service, cost })
            .collect();
        top_services.sort_by(|a, b| b.cost.total_cmp(&a.cost));

        let period = match (monthly_data.last(), monthly_data.first()) {
            (Some(oldest), Some(newest)) => format!("{} to {}", oldest.month, newest.month),
            _ => format!("Last {REPORT_MONTHS} months"),
        };

        Ok(Report {
            generated_at: Utc::now().format("%Y-%m-%d %H:%M:%S").to_string(),
            period,
            total_cost: summary.total_cost,
            currency: summary.currency,
            forecast: self.local_forecast().map(|f| f.next_month).unwrap_or(0.0),
            monthly_data,
            top_services,
        })
    }

    /// Refreshes the current month from the provider and summarizes it.
    /// A failing forecast leaves `forecast` unset rather than failing the call.
    pub async fn current_costs(&mut self) -> Result<CostSummary, AppError> {
        let (start, next_month) = current_month_range(Utc::now().date_naive());
        let end = next_month.pred_opt().unwrap_or(start);
        self.fetch_and_store(start, end).await?;

        let mut summary = self.cost_summary(&CostFilter::between(start, end))?;
        match self.forecast().await {
            Ok(forecast) => summary.forecast = Some(forecast),
            Err(err) => warn!(error = %err, "forecast unavailable"),
        }
        Ok(summary)
    }

    pub fn cost_history(&self, months: u32) -> Result<CostSummary, AppError> {
        let (start, end) = last_n_months(Utc::now().date_naive(), months);
        let mut summary = self.cost_summary(&CostFilter::between(start, end))?;

        let monthly = self.storage.monthly_totals(REPORT_MONTHS)?;
        if !monthly.is_empty() {
            summary.monthly_breakdown = Some(monthly);
        }
        summary.trend = Some(self.trend_analysis()?);
        Ok(summary)
    }

    pub fn list_alerts(&self) -> Result<Vec<Alert>, AppError> {
        self.storage.list_alerts()
    }

    pub fn create_alert(&self, name: &str, threshold: f64) -> Result<Alert, AppError> {
        let name = name.trim();
        if name.is_empty() {
            return Err(AppError::Config("Alert name cannot be empty.".into()));
        }
        if !threshold.is_finite() || threshold <= 0.0 {
            return Err(AppError::Config(format!(
                "Alert threshold must be greater than zero, got {threshold}."
            )));
        }
        if self.storage.alert_by_name(name)?.is_some() {
            return Err(AppError::Config(format!("Alert '{name}' already exists.")));
        }

        let account_id = self
            .account_id()
            .unwrap_or_else(|_| self.provider.name().to_string());
        let mut alert = Alert {
            id: None,
            name: name.to_string(),
            threshold,
            account_id,
            enabled: true,
        };
        alert.id = Some(self.storage.save_alert(&alert)?);
        info!(name = %alert.name, threshold, "alert created");
        Ok(alert)
    }

    /// Returns false when no alert had that name.
    pub fn delete_alert(&self, name: &str) -> Result<bool, AppError> {
        Ok(self.storage.delete_alert(name.trim())? > 0)
    }

    /// Compares the stored current-month spend with every enabled alert.
    pub fn check_alerts(&self) -> Result<AlertEvaluation, AppError> {
        self.check_alerts_as_of(Utc::now().date_naive())
    }

    fn check_alerts_as_of(&self, today: NaiveDate) -> Result<AlertEvaluation, AppError> {
        let (start, next_month) = current_month_range(today);
        let end = next_month.pred_opt().unwrap_or(start);
        let summary = self.cost_summary(&CostFilter::between(start, end))?;
        let alerts = self.storage.list_alerts()?;
        let evaluation = evaluate(summary.total_cost, &alerts);
        if evaluation.any_triggered() {
            warn!(
                total = evaluation.total,
                triggered = %evaluation.triggered.join(","),
                "budget alerts triggered"
            );
        }
        Ok(evaluation)
    }

    pub fn free_tier_status(
        &self,
        service_name: &str,
        usage: f64,
        limits: &FreeTierConfig,
    ) -> ServiceUsage {
        classify(service_name, usage, limits.limit_for(service_name))
    }

    pub fn get_setting(&self, key: &str) -> Result<Option<String>, AppError> {
        self.storage.get_setting(key)
    }

    pub fn set_setting(&self, key: &str, value: &str) -> Result<(), AppError> {
        self.storage.set_setting(key, value)
    }

    pub fn list_settings(&self) -> Result<Vec<(String, String)>, AppError> {
        self.storage.list_settings()
    }
}
