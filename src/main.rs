mod aggregator;
mod alerts;
mod config;
mod error;
mod forecast;
mod free_tier;
mod logging;
mod models;
mod providers;
mod service;
mod storage;

use alerts::AlertEvaluation;
use clap::{Parser, Subcommand, ValueEnum};
use config::{
    delete_credential, ensure_initialized, free_tier_path, load_config, normalize_provider_name,
    save_config, set_credential, AppConfig, SETTING_ACCOUNT_ID,
};
use error::AppError;
use free_tier::{FreeTierConfig, ServiceUsage};
use models::{
    current_month_range, parse_date, Alert, CostFilter, CostRecord, CostSummary, Forecast, Report,
    TrendAnalysis,
};
use serde::Serialize;
use service::CostService;
use std::path::PathBuf;

#[derive(Debug, Parser)]
#[command(name = "cloudspend")]
#[command(about = "Cloud billing costs, forecasts and budget alerts")]
struct Cli {
    #[arg(long, global = true, value_enum, default_value_t = OutputFormat::Table)]
    output: OutputFormat,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum OutputFormat {
    Table,
    Json,
    Csv,
}

#[derive(Debug, Subcommand)]
enum Commands {
    Init,
    Config {
        #[command(subcommand)]
        action: ConfigCommand,
    },
    SetCredential {
        #[arg(long)]
        provider: Option<String>,
        #[arg(long)]
        secret: String,
    },
    DeleteCredential {
        #[arg(long)]
        provider: Option<String>,
    },
    Cost {
        #[command(subcommand)]
        action: CostCommand,
    },
    Alert {
        #[command(subcommand)]
        action: AlertCommand,
    },
    FreeTier {
        service: String,
        usage: f64,
    },
    Export {
        #[arg(long, default_value = "json")]
        format: String,
    },
}

#[derive(Debug, Subcommand)]
enum ConfigCommand {
    Get { key: String },
    Set { key: String, value: String },
    List,
}

#[derive(Debug, Subcommand)]
enum CostCommand {
    /// Pull costs from the provider into the local store (defaults to the current month).
    Fetch {
        #[arg(long)]
        start: Option<String>,
        #[arg(long)]
        end: Option<String>,
    },
    Summary {
        #[arg(long)]
        start: Option<String>,
        #[arg(long)]
        end: Option<String>,
        #[arg(long)]
        service: Option<String>,
    },
    Current,
    History {
        #[arg(long, default_value_t = 3)]
        months: u32,
    },
    Forecast,
    Trend,
    Report,
}

#[derive(Debug, Subcommand)]
enum AlertCommand {
    List,
    Add {
        name: String,
        threshold: Option<f64>,
        #[arg(long, conflicts_with = "threshold")]
        preset: Option<String>,
    },
    Delete {
        name: String,
    },
    Check,
}

fn parse_date_arg(flag: &str, raw: Option<&str>) -> Result<Option<chrono::NaiveDate>, AppError> {
    match raw {
        None => Ok(None),
        Some(raw) => parse_date(raw).map(Some).ok_or_else(|| {
            AppError::Config(format!("Invalid --{flag} date '{raw}'. Use YYYY-MM-DD."))
        }),
    }
}

fn validate_export_format(input: &str) -> Result<OutputFormat, AppError> {
    match input.to_ascii_lowercase().as_str() {
        "json" => Ok(OutputFormat::Json),
        "csv" => Ok(OutputFormat::Csv),
        _ => Err(AppError::Config(
            "Unsupported export format. Use json or csv".into(),
        )),
    }
}

fn csv_field(raw: &str) -> String {
    if raw.contains([',', '"', '\n', '\r']) {
        format!("\"{}\"", raw.replace('"', "\"\""))
    } else {
        raw.to_string()
    }
}

fn print_json<T: Serialize>(value: &T) -> Result<(), AppError> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

fn print_summary(summary: &CostSummary, output: OutputFormat) -> Result<(), AppError> {
    match output {
        OutputFormat::Json => return print_json(summary),
        OutputFormat::Csv => {
            println!("dimension,name,cost,currency");
            for (name, cost) in &summary.by_service {
                println!("service,{},{:.2},{}", csv_field(name), cost, summary.currency);
            }
            for (name, cost) in &summary.by_resource_group {
                println!(
                    "resource_group,{},{:.2},{}",
                    csv_field(name),
                    cost,
                    summary.currency
                );
            }
            return Ok(());
        }
        OutputFormat::Table => {}
    }

    println!("Period: {}", summary.period);
    println!("Total:  {:.2} {}", summary.total_cost, summary.currency);
    if !summary.by_service.is_empty() {
        println!("\nBy service:");
        for (name, cost) in &summary.by_service {
            println!("  {name:<40} {cost:>12.2}");
        }
    }
    if !summary.by_resource_group.is_empty() {
        println!("\nBy resource group:");
        for (name, cost) in &summary.by_resource_group {
            let name = if name.is_empty() { "(none)" } else { name };
            println!("  {name:<40} {cost:>12.2}");
        }
    }
    if let Some(breakdown) = &summary.monthly_breakdown {
        println!("\nMonthly:");
        for m in breakdown {
            println!("  {} {:>12.2} {}", m.month, m.total_cost, m.currency);
        }
    }
    if let Some(trend) = &summary.trend {
        println!("\nTrend: {} ({:+.2}%)", trend.trend, trend.change_percent);
    }
    if let Some(forecast) = &summary.forecast {
        println!(
            "\nForecast next month: {:.2} {} ({})",
            forecast.next_month,
            summary.currency,
            forecast.confidence.as_str()
        );
    }
    Ok(())
}

fn print_forecast(
    forecast: &Forecast,
    currency: &str,
    output: OutputFormat,
) -> Result<(), AppError> {
    match output {
        OutputFormat::Json => print_json(forecast)?,
        OutputFormat::Csv => {
            println!("next_month,confidence");
            println!("{:.2},{}", forecast.next_month, forecast.confidence.as_str());
        }
        OutputFormat::Table => println!(
            "Forecast for next month: {:.2} {} (confidence: {})",
            forecast.next_month,
            currency,
            forecast.confidence.as_str()
        ),
    }
    Ok(())
}

fn print_trend(trend: &TrendAnalysis, output: OutputFormat) -> Result<(), AppError> {
    match output {
        OutputFormat::Json => print_json(trend)?,
        OutputFormat::Csv => {
            println!(
                "current_month,previous_month,change_percent,\
                 trend,average_monthly,projection"
            );
            println!(
                "{:.2},{:.2},{:.2},{},{:.2},{:.2}",
                trend.current_month,
                trend.previous_month,
                trend.change_percent,
                trend.trend,
                trend.average_monthly,
                trend.projection
            );
        }
        OutputFormat::Table => {
            println!("Current month:   {:.2}", trend.current_month);
            println!("Previous month:  {:.2}", trend.previous_month);
            println!("Change:          {:+.2}%", trend.change_percent);
            println!("Trend:           {}", trend.trend);
            println!("Monthly average: {:.2}", trend.average_monthly);
            println!("Projection:      {:.2}", trend.projection);
        }
    }
    Ok(())
}

fn print_report(report: &Report, output: OutputFormat) -> Result<(), AppError> {
    match output {
        OutputFormat::Json => print_json(report)?,
        OutputFormat::Csv => {
            println!("month,total_cost,currency");
            for m in &report.monthly_data {
                println!("{},{:.2},{}", m.month, m.total_cost, csv_field(&m.currency));
            }
        }
        OutputFormat::Table => {
            println!("Report generated {}", report.generated_at);
            println!("Period:   {}", report.period);
            println!("Total:    {:.2} {}", report.total_cost, report.currency);
            println!("Forecast: {:.2} {}", report.forecast, report.currency);
            if !report.monthly_data.is_empty() {
                println!("\nMonthly:");
                for m in &report.monthly_data {
                    println!("  {} {:>12.2} {}", m.month, m.total_cost, m.currency);
                }
            }
            if !report.top_services.is_empty() {
                println!("\nTop services:");
                for s in &report.top_services {
                    println!("  {:<40} {:>12.2}", s.service, s.cost);
                }
            }
        }
    }
    Ok(())
}

fn print_alerts(alerts: &[Alert], output: OutputFormat) -> Result<(), AppError> {
    match output {
        OutputFormat::Json => print_json(&alerts)?,
        OutputFormat::Csv => {
            println!("name,threshold,account_id,enabled");
            for a in alerts {
                println!(
                    "{},{:.2},{},{}",
                    csv_field(&a.name),
                    a.threshold,
                    csv_field(&a.account_id),
                    a.enabled
                );
            }
        }
        OutputFormat::Table => {
            if alerts.is_empty() {
                println!("No alerts configured.");
            }
            for a in alerts {
                let state = if a.enabled { "" } else { " (disabled)" };
                println!("{:<24} {:>10.2}{state}", a.name, a.threshold);
            }
        }
    }
    Ok(())
}

fn print_evaluation(evaluation: &AlertEvaluation, output: OutputFormat) -> Result<(), AppError> {
    match output {
        OutputFormat::Json => print_json(evaluation)?,
        OutputFormat::Csv => {
            println!("name,threshold,percent,triggered");
            for s in &evaluation.statuses {
                println!(
                    "{},{:.2},{:.1},{}",
                    csv_field(&s.name),
                    s.threshold,
                    s.percent,
                    s.triggered
                );
            }
        }
        OutputFormat::Table => {
            println!("Current month spend: {:.2}", evaluation.total);
            for s in &evaluation.statuses {
                let flag = if s.triggered { "TRIGGERED" } else { "ok" };
                println!(
                    "  {:<24} {:>10.2} {:>7.1}%  {flag}",
                    s.name, s.threshold, s.percent
                );
            }
        }
    }
    Ok(())
}

fn print_usage(usage: &ServiceUsage, output: OutputFormat) -> Result<(), AppError> {
    let percent = usage
        .percent_used
        .map(|p| format!("{p:.1}"))
        .unwrap_or_default();
    match output {
        OutputFormat::Json => print_json(usage)?,
        OutputFormat::Csv => {
            println!("service,used,limit,unit,status,percent_used");
            println!(
                "{},{},{},{},{},{percent}",
                csv_field(&usage.service_name),
                usage.used,
                usage.limit,
                usage.unit,
                usage.status.as_str()
            );
        }
        OutputFormat::Table => {
            if usage.percent_used.is_none() {
                println!("{}: no free-tier limit known", usage.service_name);
            } else {
                println!(
                    "{}: {} of {} {} ({percent}%) - {}",
                    usage.service_name,
                    usage.used,
                    usage.limit,
                    usage.unit,
                    usage.status.as_str()
                );
            }
        }
    }
    Ok(())
}

fn print_records(records: &[CostRecord], format: OutputFormat) -> Result<(), AppError> {
    if format == OutputFormat::Json {
        return print_json(&records);
    }
    println!("id,account_id,resource_group,service_name,cost,currency,date");
    for r in records {
        println!(
            "{},{},{},{},{:.8},{},{}",
            r.id.unwrap_or_default(),
            csv_field(&r.account_id),
            csv_field(r.resource_group.as_deref().unwrap_or_default()),
            csv_field(&r.service_name),
            r.cost,
            csv_field(&r.currency),
            r.date.format(models::DATE_FORMAT),
        );
    }
    Ok(())
}

/// Keys that live in the store's settings table and override the config file.
fn is_setting_key(key: &str) -> bool {
    key == SETTING_ACCOUNT_ID
}

fn apply_config_value(cfg: &mut AppConfig, key: &str, value: &str) -> Result<(), AppError> {
    let optional = |v: &str| Some(v.to_string()).filter(|v| !v.trim().is_empty());
    match key {
        "provider" => {
            let provider = normalize_provider_name(value);
            providers::adapter_for(&provider)?;
            cfg.provider = provider;
        }
        "region" => cfg.region = optional(value),
        "currency" => cfg.currency = value.trim().to_ascii_uppercase(),
        "base_url" => cfg.base_url = optional(value),
        "db_path" => cfg.db_path = optional(value).map(PathBuf::from),
        other => {
            return Err(AppError::Config(format!(
                "Unknown config key '{other}'."
            )))
        }
    }
    Ok(())
}

#[tokio::main]
async fn main() -> Result<(), AppError> {
    let cli = Cli::parse();
    logging::init_logging()?;
    let output = cli.output;

    match cli.command {
        Commands::Init => {
            ensure_initialized()?;
            println!("Initialized cloudspend config and data directories.");
        }
        Commands::Config { action } => {
            ensure_initialized()?;
            let mut cfg = load_config()?;
            match action {
                ConfigCommand::Get { key } => {
                    let service = CostService::from_config(cfg.clone())?;
                    let value = if is_setting_key(&key) {
                        service.get_setting(&key)?.or_else(|| cfg.get(&key))
                    } else if cfg.entries().iter().any(|(k, _)| *k == key) {
                        cfg.get(&key)
                    } else {
                        return Err(AppError::Config(format!("Unknown config key '{key}'.")));
                    };
                    println!("{}", value.unwrap_or_default());
                }
                ConfigCommand::Set { key, value } => {
                    if is_setting_key(&key) {
                        let service = CostService::from_config(cfg)?;
                        service.set_setting(&key, value.trim())?;
                    } else {
                        apply_config_value(&mut cfg, &key, &value)?;
                        save_config(&cfg)?;
                    }
                    println!("Set {key}.");
                }
                ConfigCommand::List => {
                    let service = CostService::from_config(cfg.clone())?;
                    let settings = service.list_settings()?;
                    let entries: Vec<(String, String)> = cfg
                        .entries()
                        .into_iter()
                        .map(|(k, v)| {
                            let stored = settings
                                .iter()
                                .find(|(sk, _)| sk == k)
                                .map(|(_, sv)| sv.clone());
                            (k.to_string(), stored.unwrap_or(v))
                        })
                        .collect();
                    match output {
                        OutputFormat::Json => {
                            let map: std::collections::BTreeMap<_, _> =
                                entries.into_iter().collect();
                            print_json(&map)?;
                        }
                        OutputFormat::Csv => {
                            println!("key,value");
                            for (k, v) in entries {
                                println!("{k},{}", csv_field(&v));
                            }
                        }
                        OutputFormat::Table => {
                            for (k, v) in entries {
                                println!("{k:<12} {v}");
                            }
                        }
                    }
                }
            }
        }
        Commands::SetCredential { provider, secret } => {
            ensure_initialized()?;
            let cfg = load_config()?;
            let provider = normalize_provider_name(provider.as_deref().unwrap_or(&cfg.provider));
            providers::adapter_for(&provider)?;
            set_credential(&provider, &secret)?;
            println!("Credential for '{provider}' stored.");
        }
        Commands::DeleteCredential { provider } => {
            let cfg = load_config()?;
            let provider = normalize_provider_name(provider.as_deref().unwrap_or(&cfg.provider));
            delete_credential(&provider)?;
            println!("Credential for '{provider}' removed.");
        }
        Commands::Cost { action } => {
            ensure_initialized()?;
            let cfg = load_config()?;
            let currency = cfg.currency.clone();
            let mut service = CostService::from_config(cfg)?;
            match action {
                CostCommand::Fetch { start, end } => {
                    let (month_start, next_month) =
                        current_month_range(chrono::Utc::now().date_naive());
                    let start = parse_date_arg("start", start.as_deref())?.unwrap_or(month_start);
                    let end = parse_date_arg("end", end.as_deref())?
                        .unwrap_or_else(|| next_month.pred_opt().unwrap_or(month_start));
                    if start > end {
                        return Err(AppError::Config(
                            "--start must not be after --end.".into(),
                        ));
                    }
                    let inserted = service.fetch_and_store(start, end).await?;
                    println!(
                        "Stored {inserted} cost records from {} for {start} to {end}.",
                        service.provider_name()
                    );
                }
                CostCommand::Summary {
                    start,
                    end,
                    service: service_name,
                } => {
                    let filter = CostFilter {
                        start_date: parse_date_arg("start", start.as_deref())?,
                        end_date: parse_date_arg("end", end.as_deref())?,
                        service_name,
                    };
                    if let Some(name) = &filter.service_name {
                        let records = service.storage().query_records(&filter)?;
                        let total: f64 = records.iter().map(|r| r.cost).sum();
                        match output {
                            OutputFormat::Table => println!(
                                "{name}: {total:.2} {currency} across {} records ({})",
                                records.len(),
                                filter.period_label()
                            ),
                            other => print_records(&records, other)?,
                        }
                    } else {
                        print_summary(&service.cost_summary(&filter)?, output)?;
                    }
                }
                CostCommand::Current => print_summary(&service.current_costs().await?, output)?,
                CostCommand::History { months } => {
                    print_summary(&service.cost_history(months)?, output)?
                }
                CostCommand::Forecast => {
                    print_forecast(&service.forecast().await?, &currency, output)?
                }
                CostCommand::Trend => print_trend(&service.trend_analysis()?, output)?,
                CostCommand::Report => print_report(&service.generate_report()?, output)?,
            }
        }
        Commands::Alert { action } => {
            ensure_initialized()?;
            let service = CostService::from_config(load_config()?)?;
            match action {
                AlertCommand::List => print_alerts(&service.list_alerts()?, output)?,
                AlertCommand::Add {
                    name,
                    threshold,
                    preset,
                } => {
                    let threshold = match (threshold, preset) {
                        (Some(t), _) => t,
                        (None, Some(preset)) => {
                            let limits = FreeTierConfig::load(&free_tier_path()?)?;
                            limits.budget(&preset).map(|b| b.amount).ok_or_else(|| {
                                AppError::Config(format!("Unknown budget preset '{preset}'."))
                            })?
                        }
                        (None, None) => {
                            return Err(AppError::Config(
                                "Provide a threshold or --preset.".into(),
                            ))
                        }
                    };
                    let alert = service.create_alert(&name, threshold)?;
                    println!("Alert '{}' created at {:.2}.", alert.name, alert.threshold);
                }
                AlertCommand::Delete { name } => {
                    if service.delete_alert(&name)? {
                        println!("Alert '{name}' deleted.");
                    } else {
                        return Err(AppError::Config(format!("No alert named '{name}'.")));
                    }
                }
                AlertCommand::Check => print_evaluation(&service.check_alerts()?, output)?,
            }
        }
        Commands::FreeTier { service: name, usage } => {
            ensure_initialized()?;
            let limits = FreeTierConfig::load(&free_tier_path()?)?;
            let service = CostService::from_config(load_config()?)?;
            print_usage(&service.free_tier_status(&name, usage, &limits), output)?;
        }
        Commands::Export { format } => {
            ensure_initialized()?;
            let format = validate_export_format(&format)?;
            let service = CostService::from_config(load_config()?)?;
            print_records(&service.storage().export_records()?, format)?;
        }
    }

    Ok(())
}
