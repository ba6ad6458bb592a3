use crate::error::AppError;
use crate::models::{Confidence, Forecast, MonthlyCost, Trend, TrendAnalysis};
use tracing::warn;

/// Months of history read for trend analysis and the local forecast.
pub const HISTORY_MONTHS: u32 = 6;

const TREND_THRESHOLD_PERCENT: f64 = 5.0;

pub fn round2(value: f64) -> f64 {
    (value * 100.0).round() / 100.0
}

pub fn confidence_for(points: usize) -> Confidence {
    match points {
        0..=3 => Confidence::Low,
        4 | 5 => Confidence::Medium,
        _ => Confidence::High,
    }
}

/// Ordinary least squares over `x = 0..n` in the given order (newest month first),
/// evaluated at `x = n`. Fewer than two points project to zero.
pub fn linear_projection(months: &[MonthlyCost]) -> f64 {
    if months.len() < 2 {
        return 0.0;
    }

    let n = months.len() as f64;
    let (mut sum_x, mut sum_y, mut sum_xy, mut sum_x2) = (0.0, 0.0, 0.0, 0.0);
    for (i, m) in months.iter().enumerate() {
        let x = i as f64;
        let y = m.total_cost;
        sum_x += x;
        sum_y += y;
        sum_xy += x * y;
        sum_x2 += x * x;
    }

    let slope = (n * sum_xy - sum_x * sum_y) / (n * sum_x2 - sum_x * sum_x);
    let intercept = (sum_y - slope * sum_x) / n;
    slope * n + intercept
}

pub fn analyze_trend(months: &[MonthlyCost]) -> TrendAnalysis {
    let Some(current) = months.first().map(|m| m.total_cost) else {
        return TrendAnalysis::no_data();
    };
    let previous = months.get(1).map(|m| m.total_cost).unwrap_or(0.0);

    let change_percent = if previous > 0.0 {
        (current - previous) / previous * 100.0
    } else {
        0.0
    };

    let trend = if change_percent > TREND_THRESHOLD_PERCENT {
        Trend::Increasing
    } else if change_percent < -TREND_THRESHOLD_PERCENT {
        Trend::Decreasing
    } else {
        Trend::Stable
    };

    let average = months.iter().map(|m| m.total_cost).sum::<f64>() / months.len() as f64;

    TrendAnalysis {
        current_month: round2(current),
        previous_month: round2(previous),
        change_percent: round2(change_percent),
        trend,
        average_monthly: round2(average),
        projection: round2(linear_projection(months).max(0.0)),
    }
}

pub fn local_forecast(months: &[MonthlyCost]) -> Forecast {
    Forecast {
        next_month: round2(linear_projection(months).max(0.0)),
        confidence: confidence_for(months.len()),
    }
}

/// Picks between the local forecast and a remote provider estimate.
///
/// `local` is `None` when the history could not be read at all. The remote call is only
/// made when the local forecast is missing or low confidence.
pub async fn resolve_forecast<F>(local: Option<Forecast>, remote: F) -> Result<Forecast, AppError>
where
    F: std::future::Future<Output = Result<f64, AppError>>,
{
    if let Some(forecast) = local {
        if forecast.confidence != Confidence::Low {
            return Ok(forecast);
        }
    }

    match remote.await {
        Ok(estimate) => Ok(Forecast {
            next_month: round2(estimate),
            confidence: Confidence::Medium,
        }),
        Err(err) => match local {
            Some(forecast) => {
                warn!(
                    error = %err,
                    transport = err.is_transport(),
                    "remote forecast failed, using low-confidence local forecast"
                );
                Ok(forecast)
            }
            None => Err(AppError::Forecast(format!(
                "no local history and remote forecast failed: {err}"
            ))),
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::Cell;

    fn newest_first(oldest_to_newest: &[f64]) -> Vec<MonthlyCost> {
        oldest_to_newest
            .iter()
            .rev()
            .enumerate()
            .map(|(i, cost)| MonthlyCost {
                month: format!("2024-{:02}", 12 - i),
                total_cost: *cost,
                currency: "USD".into(),
            })
            .collect()
    }

    fn transport_failure() -> AppError {
        AppError::Transport {
            provider: "azure",
            status: Some(500),
            message: "boom".into(),
        }
    }

    #[test]
    fn projection_matches_closed_form_for_six_months() {
        let months = newest_first(&[130.0, 120.0, 95.0, 90.0, 110.0, 100.0]);
        // slope = 37/7, intercept = 660/7, projection = 882/7
        let projection = linear_projection(&months);
        assert!((projection - 126.0).abs() < 1e-9);

        let forecast = local_forecast(&months);
        assert_eq!(forecast.confidence, Confidence::High);
        assert_eq!(forecast.next_month, 126.0);
    }

    #[test]
    fn projection_is_deterministic_for_fixed_order() {
        let months = newest_first(&[10.0, 40.0, 25.0]);
        assert_eq!(linear_projection(&months), linear_projection(&months));
        // x/y in retrieval order: (0,25) (1,40) (2,10); slope -7.5, intercept 32.5
        assert!((linear_projection(&months) - 10.0).abs() < 1e-9);
    }

    #[test]
    fn projection_needs_two_points() {
        assert_eq!(linear_projection(&[]), 0.0);
        assert_eq!(linear_projection(&newest_first(&[42.0])), 0.0);
    }

    #[test]
    fn negative_projection_clamps_to_zero() {
        // newest first: 100, 50, 0 -> next point would be -50
        let falling = newest_first(&[0.0, 50.0, 100.0]);
        assert!((linear_projection(&falling) + 50.0).abs() < 1e-9);
        assert_eq!(local_forecast(&falling).next_month, 0.0);
        assert_eq!(analyze_trend(&falling).projection, 0.0);
    }

    #[test]
    fn confidence_grows_with_sample_count() {
        let expected = [
            Confidence::Low,
            Confidence::Low,
            Confidence::Low,
            Confidence::Low,
            Confidence::Medium,
            Confidence::Medium,
            Confidence::High,
            Confidence::High,
            Confidence::High,
        ];
        for (n, want) in expected.iter().enumerate() {
            assert_eq!(confidence_for(n), *want, "n = {n}");
        }
    }

    #[test]
    fn empty_history_is_no_data() {
        assert_eq!(analyze_trend(&[]), TrendAnalysis::no_data());
    }

    #[test]
    fn trend_boundaries_are_stable() {
        let up = analyze_trend(&newest_first(&[100.0, 105.0]));
        assert_eq!(up.change_percent, 5.0);
        assert_eq!(up.trend, Trend::Stable);

        let down = analyze_trend(&newest_first(&[100.0, 95.0]));
        assert_eq!(down.change_percent, -5.0);
        assert_eq!(down.trend, Trend::Stable);

        assert_eq!(
            analyze_trend(&newest_first(&[100.0, 105.5])).trend,
            Trend::Increasing
        );
        assert_eq!(
            analyze_trend(&newest_first(&[100.0, 94.0])).trend,
            Trend::Decreasing
        );
    }

    #[test]
    fn trend_with_single_month_has_no_change() {
        let analysis = analyze_trend(&newest_first(&[12.346]));
        assert_eq!(analysis.current_month, 12.35);
        assert_eq!(analysis.previous_month, 0.0);
        assert_eq!(analysis.change_percent, 0.0);
        assert_eq!(analysis.trend, Trend::Stable);
        assert_eq!(analysis.average_monthly, 12.35);
        assert_eq!(analysis.projection, 0.0);
    }

    #[test]
    fn trend_rounds_outputs() {
        let analysis = analyze_trend(&newest_first(&[30.0, 10.0, 20.0]));
        assert_eq!(analysis.current_month, 20.0);
        assert_eq!(analysis.previous_month, 10.0);
        assert_eq!(analysis.change_percent, 100.0);
        assert_eq!(analysis.trend, Trend::Increasing);
        assert_eq!(analysis.average_monthly, 20.0);
    }

    #[tokio::test]
    async fn confident_local_forecast_skips_remote() {
        let called = Cell::new(false);
        let local = local_forecast(&newest_first(&[1.0, 2.0, 3.0, 4.0]));
        let result = resolve_forecast(Some(local), async {
            called.set(true);
            Ok(999.0)
        })
        .await
        .expect("forecast");
        assert_eq!(result, local);
        assert_eq!(result.confidence, Confidence::Medium);
        assert!(!called.get());
    }

    #[tokio::test]
    async fn low_local_forecast_prefers_remote() {
        let local = local_forecast(&newest_first(&[1.0, 2.0]));
        let result = resolve_forecast(Some(local), async { Ok(41.999) })
            .await
            .expect("forecast");
        assert_eq!(result.next_month, 42.0);
        assert_eq!(result.confidence, Confidence::Medium);
    }

    #[tokio::test]
    async fn remote_failure_falls_back_to_low_local() {
        let local = local_forecast(&newest_first(&[1.0, 2.0]));
        let result = resolve_forecast(Some(local), async { Err(transport_failure()) })
            .await
            .expect("forecast");
        assert_eq!(result, local);
        assert_eq!(result.confidence, Confidence::Low);
    }

    #[tokio::test]
    async fn missing_local_and_remote_failure_is_an_error() {
        let err = resolve_forecast(None, async { Err(transport_failure()) })
            .await
            .expect_err("should fail");
        assert!(matches!(err, AppError::Forecast(_)));
    }
}
