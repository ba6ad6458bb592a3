use crate::models::Alert;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AlertStatus {
    pub name: String,
    pub threshold: f64,
    pub percent: f64,
    pub triggered: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AlertEvaluation {
    pub total: f64,
    pub triggered: Vec<String>,
    pub statuses: Vec<AlertStatus>,
}

impl AlertEvaluation {
    pub fn any_triggered(&self) -> bool {
        !self.triggered.is_empty()
    }
}

/// Checks `total` against every enabled alert. Disabled alerts are left out of the result.
pub fn evaluate(total: f64, alerts: &[Alert]) -> AlertEvaluation {
    let statuses: Vec<AlertStatus> = alerts
        .iter()
        .filter(|a| a.enabled)
        .map(|a| AlertStatus {
            name: a.name.clone(),
            threshold: a.threshold,
            percent: total / a.threshold * 100.0,
            triggered: total >= a.threshold,
        })
        .collect();

    let triggered = statuses
        .iter()
        .filter(|s| s.triggered)
        .map(|s| s.name.clone())
        .collect();

    AlertEvaluation {
        total,
        triggered,
        statuses,
    }
}
