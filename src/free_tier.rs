use crate::error::AppError;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::path::Path;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServiceLimit {
    pub description: String,
    pub limit: f64,
    pub unit: String,
    pub duration: String,
    #[serde(default)]
    pub warning_threshold: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BudgetPreset {
    pub amount: f64,
    pub description: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FreeTierConfig {
    #[serde(default)]
    pub services: BTreeMap<String, ServiceLimit>,
    #[serde(default)]
    pub budgets: BTreeMap<String, BudgetPreset>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum UsageStatus {
    Free,
    Warning,
    Overage,
    Unknown,
}

impl UsageStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            UsageStatus::Free => "free",
            UsageStatus::Warning => "warning",
            UsageStatus::Overage => "overage",
            UsageStatus::Unknown => "unknown",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServiceUsage {
    pub service_name: String,
    pub used: f64,
    pub limit: f64,
    pub unit: String,
    pub status: UsageStatus,
    pub percent_used: Option<f64>,
}

fn limit(description: &str, limit: f64, unit: &str, duration: &str) -> ServiceLimit {
    ServiceLimit {
        description: description.into(),
        limit,
        unit: unit.into(),
        duration: duration.into(),
        warning_threshold: 0.8,
    }
}

fn preset(amount: f64, description: &str) -> BudgetPreset {
    BudgetPreset {
        amount,
        description: description.into(),
    }
}

impl Default for FreeTierConfig {
    fn default() -> Self {
        Self {
            services: BTreeMap::from([
                (
                    "virtual_machines".into(),
                    limit("B1s VM hours", 750.0, "hours", "12 months"),
                ),
                (
                    "blob_storage".into(),
                    limit("Hot Blob Storage", 5.0, "GB", "always free"),
                ),
                (
                    "functions".into(),
                    limit("Azure Functions", 1_000_000.0, "executions", "always free"),
                ),
            ]),
            budgets: BTreeMap::from([
                ("tiny".into(), preset(1.0, "Strict budget")),
                ("small".into(), preset(5.0, "Small budget")),
                ("medium".into(), preset(10.0, "Medium budget")),
                ("moderate".into(), preset(20.0, "Higher budget")),
            ]),
        }
    }
}

impl FreeTierConfig {
    /// Reads limits from `path`, falling back to the built-in table when the file is absent.
    /// Sections present in the file replace the defaults; missing sections keep them.
    pub fn load(path: &Path) -> Result<Self, AppError> {
        if !path.exists() {
            return Ok(Self::default());
        }
        let raw = fs::read_to_string(path)?;
        let parsed: FreeTierConfig = toml::from_str(&raw)?;
        parsed.validate(path)?;
        let defaults = Self::default();
        Ok(Self {
            services: if parsed.services.is_empty() {
                defaults.services
            } else {
                parsed.services
            },
            budgets: if parsed.budgets.is_empty() {
                defaults.budgets
            } else {
                parsed.budgets
            },
        })
    }

    fn validate(&self, path: &Path) -> Result<(), AppError> {
        let positive = |v: f64| v.is_finite() && v > 0.0;
        if let Some((name, _)) = self.services.iter().find(|(_, s)| !positive(s.limit)) {
            return Err(AppError::Config(format!(
                "Free-tier limit for '{name}' in {} must be greater than zero.",
                path.display()
            )));
        }
        if let Some((name, _)) = self.budgets.iter().find(|(_, b)| !positive(b.amount)) {
            return Err(AppError::Config(format!(
                "Budget preset '{name}' in {} must be greater than zero.",
                path.display()
            )));
        }
        Ok(())
    }

    /// Finds the limit for a provider-reported service name, or a limit key given directly.
    pub fn limit_for(&self, service_name: &str) -> Option<&ServiceLimit> {
        self.services
            .get(service_name)
            .or_else(|| limit_key_for_service(service_name).and_then(|k| self.services.get(k)))
    }

    pub fn budget(&self, name: &str) -> Option<&BudgetPreset> {
        self.budgets.get(&name.trim().to_ascii_lowercase())
    }
}

/// Best-effort mapping of billing service names to free-tier keys. Advisory only.
pub fn limit_key_for_service(service_name: &str) -> Option<&'static str> {
    let name = service_name.to_ascii_lowercase();
    const PATTERNS: &[(&str, &str)] = &[
        ("virtual machines", "virtual_machines"),
        ("elastic compute cloud", "virtual_machines"),
        ("compute engine", "virtual_machines"),
        ("storage", "blob_storage"),
        ("functions", "functions"),
        ("lambda", "functions"),
    ];
    PATTERNS
        .iter()
        .find(|(pattern, _)| name.contains(pattern))
        .map(|(_, key)| *key)
}

pub fn classify(service_name: &str, usage: f64, limit: Option<&ServiceLimit>) -> ServiceUsage {
    let Some(limit) = limit else {
        return ServiceUsage {
            service_name: service_name.to_string(),
            used: usage,
            limit: 0.0,
            unit: String::new(),
            status: UsageStatus::Unknown,
            percent_used: None,
        };
    };

    let ratio = usage / limit.limit;
    let status = if ratio >= 1.0 {
        UsageStatus::Overage
    } else if limit.warning_threshold > 0.0 && ratio >= limit.warning_threshold {
        UsageStatus::Warning
    } else {
        UsageStatus::Free
    };

    ServiceUsage {
        service_name: service_name.to_string(),
        used: usage,
        limit: limit.limit,
        unit: limit.unit.clone(),
        status,
        percent_used: Some(ratio * 100.0),
    }
}
