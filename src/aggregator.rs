use crate::error::AppError;
use crate::models::{CostFilter, CostSummary, Dimension};
use crate::storage::Storage;
use tracing::{debug, warn};

/// Builds the service and resource-group breakdown for the filter's date range.
///
/// `service_name` on the filter is not applied here; the summary always covers every service.
pub fn build_summary(
    storage: &Storage,
    filter: &CostFilter,
    currency: &str,
) -> Result<CostSummary, AppError> {
    let (start, end) = (filter.start_date, filter.end_date);

    let currencies = storage.currencies_in_range(start, end)?;
    if currencies.len() > 1 {
        warn!(
            currencies = %currencies.join(","),
            "summing costs recorded in more than one currency"
        );
    }

    let by_service = storage.aggregate_by(Dimension::Service, start, end)?;
    let by_resource_group = storage.aggregate_by(Dimension::ResourceGroup, start, end)?;
    let total_cost = by_service.values().sum();
    debug!(services = by_service.len(), total_cost, "summary built");

    Ok(CostSummary {
        period: filter.period_label(),
        total_cost,
        currency: currency.to_string(),
        by_service,
        by_resource_group,
        forecast: None,
        monthly_breakdown: None,
        trend: None,
    })
}
