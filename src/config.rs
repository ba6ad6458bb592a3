use crate::error::AppError;
use directories::ProjectDirs;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

pub const SERVICE_NAME: &str = "cloudspend";

pub const SETTING_ACCOUNT_ID: &str = "account_id";

pub fn normalize_provider_name(provider: &str) -> String {
    provider.trim().to_ascii_lowercase()
}

fn app_home_dir() -> Result<PathBuf, AppError> {
    if let Ok(custom) = std::env::var("CLOUDSPEND_HOME") {
        return Ok(PathBuf::from(custom));
    }

    if let Some(dirs) = ProjectDirs::from("com", "cloudspend", SERVICE_NAME) {
        let candidate = dirs.data_local_dir().to_path_buf();
        if fs::create_dir_all(&candidate).is_ok() {
            return Ok(candidate);
        }
    }

    let cwd = std::env::current_dir()?;
    Ok(cwd.join(".cloudspend"))
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub provider: String,
    pub account_id: Option<String>,
    pub region: Option<String>,
    pub currency: String,
    pub base_url: Option<String>,
    pub db_path: Option<PathBuf>,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            provider: "azure".into(),
            account_id: None,
            region: None,
            currency: "USD".into(),
            base_url: None,
            db_path: None,
        }
    }
}

impl AppConfig {
    pub fn get(&self, key: &str) -> Option<String> {
        match key {
            "provider" => Some(self.provider.clone()),
            "account_id" => self.account_id.clone(),
            "region" => self.region.clone(),
            "currency" => Some(self.currency.clone()),
            "base_url" => self.base_url.clone(),
            "db_path" => self.db_path.as_ref().map(|p| p.display().to_string()),
            _ => None,
        }
    }

    pub fn entries(&self) -> Vec<(&'static str, String)> {
        [
            "provider",
            "account_id",
            "region",
            "currency",
            "base_url",
            "db_path",
        ]
        .into_iter()
        .map(|k| (k, self.get(k).unwrap_or_default()))
        .collect()
    }
}

pub fn config_dir() -> Result<PathBuf, AppError> {
    Ok(app_home_dir()?.join("config"))
}

pub fn data_dir() -> Result<PathBuf, AppError> {
    Ok(app_home_dir()?.join("data"))
}

pub fn config_path() -> Result<PathBuf, AppError> {
    Ok(config_dir()?.join("config.toml"))
}

pub fn free_tier_path() -> Result<PathBuf, AppError> {
    Ok(config_dir()?.join("free_tier_limits.toml"))
}

pub fn db_path(cfg: &AppConfig) -> Result<PathBuf, AppError> {
    match &cfg.db_path {
        Some(path) => Ok(path.clone()),
        None => Ok(data_dir()?.join("costs.sqlite")),
    }
}

pub fn ensure_dirs() -> Result<(), AppError> {
    fs::create_dir_all(config_dir()?)?;
    fs::create_dir_all(data_dir()?)?;
    Ok(())
}

fn normalize_config(config: &mut AppConfig) -> bool {
    let mut changed = false;

    let provider = normalize_provider_name(&config.provider);
    if provider != config.provider {
        config.provider = provider;
        changed = true;
    }

    let currency = config.currency.trim().to_ascii_uppercase();
    if currency != config.currency {
        config.currency = currency;
        changed = true;
    }

    if config
        .account_id
        .as_deref()
        .is_some_and(|id| id.trim().is_empty())
    {
        config.account_id = None;
        changed = true;
    }

    changed
}

pub fn load_config() -> Result<AppConfig, AppError> {
    load_config_from(&config_path()?)
}

fn load_config_from(path: &Path) -> Result<AppConfig, AppError> {
    if !path.exists() {
        return Ok(AppConfig::default());
    }

    let raw = fs::read_to_string(path)?;
    let mut parsed: AppConfig = toml::from_str(&raw)?;
    if normalize_config(&mut parsed) {
        fs::write(path, toml::to_string_pretty(&parsed)?)?;
    }
    Ok(parsed)
}

pub fn save_config(config: &AppConfig) -> Result<(), AppError> {
    ensure_dirs()?;
    let path = config_path()?;
    let raw = toml::to_string_pretty(config)?;
    fs::write(path, raw)?;
    Ok(())
}

fn credential_entry(provider: &str) -> Result<keyring::Entry, AppError> {
    let normalized = normalize_provider_name(provider);
    Ok(keyring::Entry::new(
        SERVICE_NAME,
        &format!("provider:{normalized}"),
    )?)
}

pub fn set_credential(provider: &str, secret: &str) -> Result<(), AppError> {
    credential_entry(provider)?.set_password(secret)?;
    Ok(())
}

pub fn delete_credential(provider: &str) -> Result<(), AppError> {
    match credential_entry(provider)?.delete_credential() {
        Ok(()) => Ok(()),
        Err(keyring::Error::NoEntry) => Ok(()),
        Err(e) => Err(AppError::Keyring(e)),
    }
}

/// Looks up a provider secret in the OS keyring, then in `env_var`.
pub fn get_credential(provider: &str, env_var: &str) -> Result<String, AppError> {
    if let Ok(entry) = credential_entry(provider) {
        if let Ok(value) = entry.get_password() {
            if !value.is_empty() {
                return Ok(value);
            }
        }
    }

    if let Ok(value) = std::env::var(env_var) {
        if !value.is_empty() {
            return Ok(value);
        }
    }

    Err(AppError::Config(format!(
        "No credential found for provider '{}'. Run `cloudspend set-credential` or set {env_var}.",
        normalize_provider_name(provider)
    )))
}

pub fn ensure_initialized() -> Result<(), AppError> {
    ensure_dirs()?;
    let cfg_path = config_path()?;
    if !Path::new(&cfg_path).exists() {
        save_config(&AppConfig::default())?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn normalize_provider_name_trims_and_lowercases() {
        assert_eq!(normalize_provider_name(" Azure "), "azure");
        assert_eq!(normalize_provider_name("GCP"), "gcp");
    }

    #[test]
    fn normalize_config_cleans_fields() {
        let mut cfg = AppConfig {
            provider: " AWS ".into(),
            account_id: Some("  ".into()),
            currency: "eur".into(),
            ..AppConfig::default()
        };

        assert!(normalize_config(&mut cfg));
        assert_eq!(cfg.provider, "aws");
        assert_eq!(cfg.currency, "EUR");
        assert!(cfg.account_id.is_none());
        assert!(!normalize_config(&mut cfg));
    }

    #[test]
    fn load_config_from_fills_defaults_and_rewrites_normalized_file() {
        let tmp = TempDir::new().expect("tempdir");
        let path = tmp.path().join("config.toml");
        fs::write(&path, "provider = \"GCP\"\naccount_id = \"proj-1\"\n").expect("write");

        let cfg = load_config_from(&path).expect("load");
        assert_eq!(cfg.provider, "gcp");
        assert_eq!(cfg.account_id.as_deref(), Some("proj-1"));
        assert_eq!(cfg.currency, "USD");

        let rewritten = fs::read_to_string(&path).expect("read back");
        assert!(rewritten.contains("provider = \"gcp\""));
    }

    #[test]
    fn load_config_from_missing_file_is_default() {
        let tmp = TempDir::new().expect("tempdir");
        let cfg = load_config_from(&tmp.path().join("nope.toml")).expect("load");
        assert_eq!(cfg, AppConfig::default());
    }

    #[test]
    fn entries_list_every_key() {
        let cfg = AppConfig {
            account_id: Some("sub-1".into()),
            ..AppConfig::default()
        };
        let entries = cfg.entries();
        assert_eq!(entries.len(), 6);
        assert!(entries.contains(&("account_id", "sub-1".to_string())));
        assert!(entries.contains(&("region", String::new())));
        assert!(cfg.get("unknown").is_none());
        assert!(cfg.get("auth_mode").is_none());
    }

    #[test]
    fn load_config_from_ignores_retired_keys() {
        let tmp = TempDir::new().expect("tempdir");
        let path = tmp.path().join("config.toml");
        fs::write(&path, "provider = \"aws\"\nauth_mode = \"token\"\n").expect("write");

        let cfg = load_config_from(&path).expect("load");
        assert_eq!(cfg.provider, "aws");
        assert!(!cfg.entries().iter().any(|(k, _)| *k == "auth_mode"));
    }
}
