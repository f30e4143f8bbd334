//! Connection factory, schema migrations and the `Warehouse` seam that
//! importers and aggregation jobs read and write through.

use std::str::FromStr;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{NaiveDate, NaiveDateTime, NaiveTime};
use fox_core::{
    DailyTpyRow, FixturePerformanceRow, PackingDailyRow, PchartDailyRow, SnfnAggregateRow,
    SnfnRecord, SortTestDailyRow, StationHourlyRow, StationPerformanceRow, TestboardRecord,
    WeeklyTpyModelRow, WeeklyTpyRow, WorkstationRecord,
};
use serde::Serialize;
use sqlx::postgres::{PgConnectOptions, PgPool, PgPoolOptions};
use thiserror::Error;

pub mod memory;
pub mod postgres;

pub use memory::MemoryWarehouse;
pub use postgres::PgWarehouse;

pub const CRATE_NAME: &str = "fox-storage";

/// Table names are part of the contract with downstream dashboards.
pub mod tables {
    pub const WORKSTATION_LOG: &str = "workstation_master_log";
    pub const TESTBOARD_LOG: &str = "testboard_master_log";
    pub const SNFN_LOG: &str = "snfn_master_log";

    pub const STATION_PERFORMANCE: &str = "testboard_station_performance_daily";
    pub const FIXTURE_PERFORMANCE: &str = "fixture_performance_daily";
    pub const SNFN_AGGREGATE: &str = "snfn_aggregate_daily";
    pub const PACKING_DAILY: &str = "packing_daily_summary";
    pub const PCHART_DAILY: &str = "workstation_pchart_daily";
    pub const STATION_HOURLY: &str = "station_hourly_summary";
    pub const SORT_TEST_DAILY: &str = "sort_test_daily";
    pub const DAILY_TPY: &str = "daily_tpy_metrics";
    pub const WEEKLY_TPY: &str = "weekly_tpy_metrics";
    pub const WEEKLY_TPY_MODEL: &str = "weekly_tpy_model_metrics";
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorClass {
    /// Connection refused, pool exhausted, I/O. The next cycle is the retry.
    Transient,
    /// Bad value or constraint violation. Retrying the same input fails again.
    Data,
}

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error("migration failed: {0}")]
    Migrate(#[from] sqlx::migrate::MigrateError),
    #[error("invalid connection settings: {0}")]
    Config(String),
    #[error("{table} is unavailable: {reason}")]
    Unavailable { table: String, reason: String },
    #[error("encoding {table} row: {source}")]
    Encode {
        table: &'static str,
        #[source]
        source: serde_json::Error,
    },
}

impl StoreError {
    pub fn class(&self) -> ErrorClass {
        match self {
            StoreError::Database(err) => classify_sqlx(err),
            StoreError::Migrate(sqlx::migrate::MigrateError::Execute(err)) => classify_sqlx(err),
            StoreError::Unavailable { .. } => ErrorClass::Transient,
            StoreError::Migrate(_) | StoreError::Config(_) | StoreError::Encode { .. } => {
                ErrorClass::Data
            }
        }
    }
}

/// SQLSTATE classes 08 (connection) and 57P (operator intervention), plus
/// serialization failures and deadlocks, are worth retrying next cycle.
fn classify_sqlx(err: &sqlx::Error) -> ErrorClass {
    match err {
        sqlx::Error::Io(_)
        | sqlx::Error::Tls(_)
        | sqlx::Error::Protocol(_)
        | sqlx::Error::PoolTimedOut
        | sqlx::Error::PoolClosed
        | sqlx::Error::WorkerCrashed => ErrorClass::Transient,
        sqlx::Error::Database(db) => match db.code() {
            Some(code)
                if code.starts_with("08")
                    || code.starts_with("57P")
                    || code == "40001"
                    || code == "40P01" =>
            {
                ErrorClass::Transient
            }
            _ => ErrorClass::Data,
        },
        _ => ErrorClass::Data,
    }
}

#[derive(Debug, Clone)]
pub struct DbConfig {
    pub host: String,
    pub port: u16,
    pub database: String,
    pub user: String,
    pub password: String,
    /// `DATABASE_URL`, when set, wins over the individual fields.
    pub url: Option<String>,
    pub max_connections: u32,
    pub acquire_timeout: Duration,
}

impl Default for DbConfig {
    fn default() -> Self {
        Self {
            host: "localhost".to_string(),
            port: 5432,
            database: "fox_db".to_string(),
            user: "gpu_user".to_string(),
            password: String::new(),
            url: None,
            max_connections: 5,
            acquire_timeout: Duration::from_secs(10),
        }
    }
}

impl DbConfig {
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            host: std::env::var("FOX_DB_HOST").unwrap_or(defaults.host),
            port: std::env::var("FOX_DB_PORT")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(defaults.port),
            database: std::env::var("FOX_DB_NAME").unwrap_or(defaults.database),
            user: std::env::var("FOX_DB_USER").unwrap_or(defaults.user),
            password: std::env::var("FOX_DB_PASSWORD").unwrap_or(defaults.password),
            url: std::env::var("DATABASE_URL").ok().filter(|v| !v.trim().is_empty()),
            max_connections: std::env::var("FOX_DB_MAX_CONNECTIONS")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(defaults.max_connections),
            acquire_timeout: defaults.acquire_timeout,
        }
    }

    pub fn connect_options(&self) -> Result<PgConnectOptions, StoreError> {
        if let Some(url) = &self.url {
            return PgConnectOptions::from_str(url)
                .map_err(|err| StoreError::Config(format!("DATABASE_URL: {err}")));
        }
        let mut options = PgConnectOptions::new()
            .host(&self.host)
            .port(self.port)
            .database(&self.database)
            .username(&self.user);
        // Trust-auth deployments run without a password.
        if !self.password.is_empty() {
            options = options.password(&self.password);
        }
        Ok(options)
    }

    /// Connection target without credentials, for logs.
    pub fn describe(&self) -> String {
        match &self.url {
            Some(_) => "DATABASE_URL".to_string(),
            None => format!("{}@{}:{}/{}", self.user, self.host, self.port, self.database),
        }
    }

    fn pool_options(&self) -> PgPoolOptions {
        PgPoolOptions::new()
            .max_connections(self.max_connections.max(1))
            .acquire_timeout(self.acquire_timeout)
    }
}

/// One pool per process, shared by every job.
#[derive(Debug, Clone)]
pub struct Database {
    pool: PgPool,
}

impl Database {
    pub async fn connect(config: &DbConfig) -> Result<Self, StoreError> {
        let pool = config
            .pool_options()
            .connect_with(config.connect_options()?)
            .await?;
        Ok(Self { pool })
    }

    /// Defers the first connection to the first query, so a long-running loop
    /// can start while the database is still down.
    pub fn connect_lazy(config: &DbConfig) -> Result<Self, StoreError> {
        let pool = config.pool_options().connect_lazy_with(config.connect_options()?);
        Ok(Self { pool })
    }

    pub async fn migrate(&self) -> Result<(), StoreError> {
        sqlx::migrate!("../../migrations").run(&self.pool).await?;
        Ok(())
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    pub fn warehouse(&self) -> PgWarehouse {
        PgWarehouse::new(self.pool.clone())
    }
}

/// Half-open `[start, end)` range over `history_station_end_time`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimeWindow {
    AllTime,
    Range {
        start: NaiveDateTime,
        end: NaiveDateTime,
    },
}

impl TimeWindow {
    /// Midnight of `from` up to midnight of `until` (exclusive).
    pub fn days(from: NaiveDate, until: NaiveDate) -> Self {
        TimeWindow::Range {
            start: from.and_time(NaiveTime::MIN),
            end: until.and_time(NaiveTime::MIN),
        }
    }

    pub fn contains(&self, ts: NaiveDateTime) -> bool {
        match self {
            TimeWindow::AllTime => true,
            TimeWindow::Range { start, end } => ts >= *start && ts < *end,
        }
    }
}

/// One file's worth of mapped rows for a raw table.
#[derive(Debug, Clone)]
pub enum RawBatch {
    Workstation(Vec<WorkstationRecord>),
    Testboard(Vec<TestboardRecord>),
    Snfn(Vec<SnfnRecord>),
}

impl RawBatch {
    pub fn table(&self) -> &'static str {
        match self {
            RawBatch::Workstation(_) => tables::WORKSTATION_LOG,
            RawBatch::Testboard(_) => tables::TESTBOARD_LOG,
            RawBatch::Snfn(_) => tables::SNFN_LOG,
        }
    }

    pub fn len(&self) -> usize {
        match self {
            RawBatch::Workstation(rows) => rows.len(),
            RawBatch::Testboard(rows) => rows.len(),
            RawBatch::Snfn(rows) => rows.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct InsertOutcome {
    pub inserted: u64,
    pub duplicates: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteMode {
    /// Truncate the table inside the write transaction, then insert.
    Replace,
    /// Overwrite measures at existing keys and leave other keys untouched.
    Upsert,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct WriteOutcome {
    pub written: u64,
    pub skipped: u64,
}

#[derive(Debug, Clone)]
pub enum SummaryBatch {
    StationPerformance(Vec<StationPerformanceRow>),
    FixturePerformance(Vec<FixturePerformanceRow>),
    SnfnAggregate(Vec<SnfnAggregateRow>),
    PackingDaily(Vec<PackingDailyRow>),
    PchartDaily(Vec<PchartDailyRow>),
    StationHourly(Vec<StationHourlyRow>),
    SortTestDaily(Vec<SortTestDailyRow>),
    DailyTpy(Vec<DailyTpyRow>),
    WeeklyTpy(Vec<WeeklyTpyRow>),
    WeeklyTpyModel(Vec<WeeklyTpyModelRow>),
}

impl SummaryBatch {
    pub fn table(&self) -> &'static str {
        match self {
            SummaryBatch::StationPerformance(_) => tables::STATION_PERFORMANCE,
            SummaryBatch::FixturePerformance(_) => tables::FIXTURE_PERFORMANCE,
            SummaryBatch::SnfnAggregate(_) => tables::SNFN_AGGREGATE,
            SummaryBatch::PackingDaily(_) => tables::PACKING_DAILY,
            SummaryBatch::PchartDaily(_) => tables::PCHART_DAILY,
            SummaryBatch::StationHourly(_) => tables::STATION_HOURLY,
            SummaryBatch::SortTestDaily(_) => tables::SORT_TEST_DAILY,
            SummaryBatch::DailyTpy(_) => tables::DAILY_TPY,
            SummaryBatch::WeeklyTpy(_) => tables::WEEKLY_TPY,
            SummaryBatch::WeeklyTpyModel(_) => tables::WEEKLY_TPY_MODEL,
        }
    }

    pub fn len(&self) -> usize {
        match self {
            SummaryBatch::StationPerformance(rows) => rows.len(),
            SummaryBatch::FixturePerformance(rows) => rows.len(),
            SummaryBatch::SnfnAggregate(rows) => rows.len(),
            SummaryBatch::PackingDaily(rows) => rows.len(),
            SummaryBatch::PchartDaily(rows) => rows.len(),
            SummaryBatch::StationHourly(rows) => rows.len(),
            SummaryBatch::SortTestDaily(rows) => rows.len(),
            SummaryBatch::DailyTpy(rows) => rows.len(),
            SummaryBatch::WeeklyTpy(rows) => rows.len(),
            SummaryBatch::WeeklyTpyModel(rows) => rows.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DailyTpyTotals {
    pub total_parts: i64,
    pub passed_parts: i64,
}

pub type WorkstationSink<'a> = dyn FnMut(WorkstationRecord) + Send + 'a;
pub type TestboardSink<'a> = dyn FnMut(TestboardRecord) + Send + 'a;

/// Storage seam for raw imports, raw scans and summary writes.
///
/// Scans stream rows in insertion order into `sink` and return how many were
/// delivered. Summary writes run in one transaction per batch; a row that the
/// store rejects is skipped and counted, a transient failure aborts the batch.
#[async_trait]
pub trait Warehouse: Send + Sync {
    /// Inserts rows not already present under their natural key. All rows of
    /// the batch land or none do.
    async fn insert_raw(&self, batch: RawBatch) -> Result<InsertOutcome, StoreError>;

    async fn scan_workstation(
        &self,
        window: TimeWindow,
        sink: &mut WorkstationSink<'_>,
    ) -> Result<u64, StoreError>;

    async fn scan_testboard(
        &self,
        window: TimeWindow,
        sink: &mut TestboardSink<'_>,
    ) -> Result<u64, StoreError>;

    async fn write_summaries(
        &self,
        batch: SummaryBatch,
        mode: WriteMode,
    ) -> Result<WriteOutcome, StoreError>;

    /// Sums of `total_parts` and `passed_parts` over `daily_tpy_metrics` for
    /// `from..=to`.
    async fn daily_tpy_totals(
        &self,
        from: NaiveDate,
        to: NaiveDate,
    ) -> Result<DailyTpyTotals, StoreError>;
}
