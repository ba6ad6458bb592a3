use crate::error::{AppError, PersistenceContext};
use crate::models::{Alert, CostFilter, CostRecord, Dimension, MonthlyCost, DATE_FORMAT};
use chrono::{Months, NaiveDate, Utc};
use rusqlite::{params, params_from_iter, types::Type, Connection, OptionalExtension, Row};
use std::collections::BTreeMap;
use std::path::Path;
use tracing::debug;

pub struct Storage {
    conn: Connection,
}

const RECORD_COLUMNS: &str =
    "id, account_id, resource_group, service_name, cost, currency, date";

impl Storage {
    pub fn open(path: &Path) -> Result<Self, AppError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let conn = Connection::open(path).persist_ctx("opening database")?;
        let this = Self { conn };
        this.init()?;
        Ok(this)
    }

    #[cfg(test)]
    pub fn open_in_memory() -> Result<Self, AppError> {
        let conn = Connection::open_in_memory().persist_ctx("opening database")?;
        let this = Self { conn };
        this.init()?;
        Ok(this)
    }

    fn init(&self) -> Result<(), AppError> {
        self.conn
            .execute_batch(
                r#"
            CREATE TABLE IF NOT EXISTS settings (
                key TEXT PRIMARY KEY,
                value TEXT NOT NULL,
                updated_at TEXT NOT NULL
            );

            CREATE TABLE IF NOT EXISTS cost_records (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                account_id TEXT NOT NULL CHECK (account_id <> ''),
                resource_group TEXT,
                service_name TEXT NOT NULL CHECK (service_name <> ''),
                cost REAL NOT NULL,
                currency TEXT NOT NULL DEFAULT 'USD' CHECK (currency <> ''),
                date TEXT NOT NULL,
                created_at TEXT NOT NULL DEFAULT CURRENT_TIMESTAMP
            );

            CREATE TABLE IF NOT EXISTS alerts (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                name TEXT NOT NULL,
                threshold REAL NOT NULL CHECK (threshold > 0),
                account_id TEXT NOT NULL,
                enabled INTEGER NOT NULL DEFAULT 1,
                created_at TEXT NOT NULL DEFAULT CURRENT_TIMESTAMP
            );

            CREATE INDEX IF NOT EXISTS idx_cost_date ON cost_records(date);
            CREATE INDEX IF NOT EXISTS idx_cost_account ON cost_records(account_id);
            CREATE INDEX IF NOT EXISTS idx_cost_service ON cost_records(service_name);
            "#,
            )
            .persist_ctx("migrating schema")?;
        Ok(())
    }

    /// Appends every record in one transaction. Nothing is written unless all rows succeed.
    pub fn insert_batch(&mut self, records: &[CostRecord]) -> Result<usize, AppError> {
        let tx = self.conn.transaction().persist_ctx("starting batch")?;
        {
            let mut insert = tx
                .prepare(
                    "INSERT INTO cost_records
                         (account_id, resource_group, service_name, cost, currency, date)
                     VALUES (?, ?, ?, ?, ?, ?)",
                )
                .persist_ctx("preparing batch insert")?;
            for r in records {
                insert
                    .execute(params![
                        r.account_id,
                        r.resource_group,
                        r.service_name,
                        r.cost,
                        r.currency,
                        r.date.format(DATE_FORMAT).to_string(),
                    ])
                    .persist_ctx("inserting cost batch")?;
            }
        }
        tx.commit().persist_ctx("committing cost batch")?;
        debug!(rows = records.len(), "cost batch committed");
        Ok(records.len())
    }

    pub fn query_records(&self, filter: &CostFilter) -> Result<Vec<CostRecord>, AppError> {
        let (clause, mut args) = date_clause(filter.start_date, filter.end_date);
        let mut sql = format!("SELECT {RECORD_COLUMNS} FROM cost_records WHERE 1=1{clause}");
        if let Some(service) = &filter.service_name {
            sql.push_str(" AND service_name = ?");
            args.push(service.clone());
        }
        sql.push_str(" ORDER BY date DESC, id DESC");

        let mut stmt = self.conn.prepare(&sql).persist_ctx("querying cost records")?;
        let rows = stmt
            .query_map(params_from_iter(args.iter()), record_from_row)
            .persist_ctx("querying cost records")?
            .collect::<Result<Vec<_>, _>>()
            .persist_ctx("reading cost records")?;
        Ok(rows)
    }

    /// Sums cost per dimension value. Currencies are not separated.
    pub fn aggregate_by(
        &self,
        dimension: Dimension,
        start: Option<NaiveDate>,
        end: Option<NaiveDate>,
    ) -> Result<BTreeMap<String, f64>, AppError> {
        let column = dimension.column();
        let (clause, args) = date_clause(start, end);
        let sql = format!(
            "SELECT COALESCE({column}, ''), SUM(cost) FROM cost_records WHERE 1=1{clause}
             GROUP BY COALESCE({column}, '')"
        );
        debug!(dimension = column, "aggregating costs");

        let mut stmt = self.conn.prepare(&sql).persist_ctx("aggregating costs")?;
        let rows = stmt
            .query_map(params_from_iter(args.iter()), |r| {
                Ok((r.get::<_, String>(0)?, r.get::<_, f64>(1)?))
            })
            .persist_ctx("aggregating costs")?
            .collect::<Result<BTreeMap<_, _>, _>>()
            .persist_ctx("reading aggregated costs")?;
        Ok(rows)
    }

    pub fn monthly_totals(&self, lookback_months: u32) -> Result<Vec<MonthlyCost>, AppError> {
        self.monthly_totals_as_of(Utc::now().date_naive(), lookback_months)
    }

    /// Month buckets (newest first) for records dated on or after `today - lookback_months`.
    pub fn monthly_totals_as_of(
        &self,
        today: NaiveDate,
        lookback_months: u32,
    ) -> Result<Vec<MonthlyCost>, AppError> {
        let cutoff = today
            .checked_sub_months(Months::new(lookback_months))
            .unwrap_or(NaiveDate::MIN);
        let mut stmt = self
            .conn
            .prepare(
                "SELECT substr(date, 1, 7) AS month, SUM(cost), currency
                 FROM cost_records
                 WHERE date >= ?
                 GROUP BY month, currency
                 ORDER BY month DESC, currency",
            )
            .persist_ctx("computing monthly totals")?;
        let rows = stmt
            .query_map([cutoff.format(DATE_FORMAT).to_string()], |r| {
                Ok(MonthlyCost {
                    month: r.get(0)?,
                    total_cost: r.get(1)?,
                    currency: r.get(2)?,
                })
            })
            .persist_ctx("computing monthly totals")?
            .collect::<Result<Vec<_>, _>>()
            .persist_ctx("reading monthly totals")?;
        Ok(rows)
    }

    pub fn count_in_range(
        &self,
        account_id: &str,
        start: NaiveDate,
        end: NaiveDate,
    ) -> Result<u64, AppError> {
        let count: i64 = self
            .conn
            .query_row(
                "SELECT COUNT(*) FROM cost_records
                 WHERE account_id = ? AND date >= ? AND date <= ?",
                params![
                    account_id,
                    start.format(DATE_FORMAT).to_string(),
                    end.format(DATE_FORMAT).to_string()
                ],
                |r| r.get(0),
            )
            .persist_ctx("counting cost records")?;
        Ok(count.max(0) as u64)
    }

    pub fn currencies_in_range(
        &self,
        start: Option<NaiveDate>,
        end: Option<NaiveDate>,
    ) -> Result<Vec<String>, AppError> {
        let (clause, args) = date_clause(start, end);
        let sql = format!(
            "SELECT DISTINCT currency FROM cost_records WHERE 1=1{clause} ORDER BY currency"
        );
        let mut stmt = self.conn.prepare(&sql).persist_ctx("listing currencies")?;
        let rows = stmt
            .query_map(params_from_iter(args.iter()), |r| r.get(0))
            .persist_ctx("listing currencies")?
            .collect::<Result<Vec<String>, _>>()
            .persist_ctx("listing currencies")?;
        Ok(rows)
    }

    pub fn export_records(&self) -> Result<Vec<CostRecord>, AppError> {
        self.query_records(&CostFilter::default())
    }

    pub fn save_alert(&self, alert: &Alert) -> Result<i64, AppError> {
        self.conn
            .execute(
                "INSERT INTO alerts (name, threshold, account_id, enabled) VALUES (?, ?, ?, ?)",
                params![alert.name, alert.threshold, alert.account_id, alert.enabled],
            )
            .persist_ctx("saving alert")?;
        Ok(self.conn.last_insert_rowid())
    }

    pub fn list_alerts(&self) -> Result<Vec<Alert>, AppError> {
        let mut stmt = self
            .conn
            .prepare(
                "SELECT id, name, threshold, account_id, enabled FROM alerts
                 ORDER BY name, id",
            )
            .persist_ctx("listing alerts")?;
        let rows = stmt
            .query_map([], alert_from_row)
            .persist_ctx("listing alerts")?
            .collect::<Result<Vec<_>, _>>()
            .persist_ctx("reading alerts")?;
        Ok(rows)
    }

    pub fn delete_alert(&self, name: &str) -> Result<usize, AppError> {
        self.conn
            .execute("DELETE FROM alerts WHERE name = ?", [name])
            .persist_ctx("deleting alert")
    }

    pub fn alert_by_name(&self, name: &str) -> Result<Option<Alert>, AppError> {
        self.conn
            .query_row(
                "SELECT id, name, threshold, account_id, enabled FROM alerts
                 WHERE name = ? ORDER BY id LIMIT 1",
                [name],
                alert_from_row,
            )
            .optional()
            .persist_ctx("loading alert")
    }

    pub fn get_setting(&self, key: &str) -> Result<Option<String>, AppError> {
        self.conn
            .query_row("SELECT value FROM settings WHERE key = ?", [key], |r| {
                r.get(0)
            })
            .optional()
            .persist_ctx("reading setting")
    }

    pub fn set_setting(&self, key: &str, value: &str) -> Result<(), AppError> {
        self.conn
            .execute(
                "INSERT INTO settings (key, value, updated_at) VALUES (?, ?, ?)
                 ON CONFLICT(key)
                 DO UPDATE SET value = excluded.value, updated_at = excluded.updated_at",
                params![key, value, Utc::now().to_rfc3339()],
            )
            .persist_ctx("writing setting")?;
        Ok(())
    }

    pub fn list_settings(&self) -> Result<Vec<(String, String)>, AppError> {
        let mut stmt = self
            .conn
            .prepare("SELECT key, value FROM settings ORDER BY key")
            .persist_ctx("listing settings")?;
        let rows = stmt
            .query_map([], |r| Ok((r.get(0)?, r.get(1)?)))
            .persist_ctx("listing settings")?
            .collect::<Result<Vec<_>, _>>()
            .persist_ctx("reading settings")?;
        Ok(rows)
    }
}

fn date_clause(start: Option<NaiveDate>, end: Option<NaiveDate>) -> (String, Vec<String>) {
    let mut clause = String::new();
    let mut args = Vec::new();
    if let Some(start) = start {
        clause.push_str(" AND date >= ?");
        args.push(start.format(DATE_FORMAT).to_string());
    }
    if let Some(end) = end {
        clause.push_str(" AND date <= ?");
        args.push(end.format(DATE_FORMAT).to_string());
    }
    (clause, args)
}

fn record_from_row(r: &Row<'_>) -> rusqlite::Result<CostRecord> {
    let raw_date: String = r.get(6)?;
    Ok(CostRecord {
        id: Some(r.get(0)?),
        account_id: r.get(1)?,
        resource_group: r.get(2)?,
        service_name: r.get(3)?,
        cost: r.get(4)?,
        currency: r.get(5)?,
        date: NaiveDate::parse_from_str(&raw_date, DATE_FORMAT)
            .map_err(|e| rusqlite::Error::FromSqlConversionFailure(6, Type::Text, Box::new(e)))?,
    })
}

fn alert_from_row(r: &Row<'_>) -> rusqlite::Result<Alert> {
    Ok(Alert {
        id: Some(r.get(0)?),
        name: r.get(1)?,
        threshold: r.get(2)?,
        account_id: r.get(3)?,
        enabled: r.get(4)?,
    })
}
