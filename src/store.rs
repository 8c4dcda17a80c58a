// ============================================================================
// Relational Store
// ============================================================================
//
// train_data      one row per reconciled stop
// processed_dates one row per date whose rows are committed

use std::thread;
use std::time::Duration;

use chrono::{NaiveDate, NaiveDateTime};
use postgres::types::ToSql;
use postgres::{Client, NoTls};

use crate::config::DatabaseConfig;
use crate::error::Result;
use crate::models::{ArrivalRecord, LastImport, TrainArrival};

const CONNECT_ATTEMPTS: u32 = 5;
const CONNECT_RETRY_DELAY: Duration = Duration::from_secs(1);
const CONNECT_TIMEOUT: Duration = Duration::from_secs(5);
const INSERT_PAGE_SIZE: usize = 1000;

pub const INITIAL_SCHEMA: &str = include_str!("../migrations/001_initial_schema.sql");

const TRAIN_DATA_COLUMNS: [&str; 13] = [
    "station",
    "train_name",
    "final_destination_station",
    "delay_in_min",
    "time",
    "is_canceled",
    "train_type",
    "train_line_ride_id",
    "train_line_station_num",
    "arrival_planned_time",
    "arrival_change_time",
    "departure_planned_time",
    "departure_change_time",
];

/// Persistence seam used by the importer.
pub trait ArrivalStore {
    fn is_date_processed(&mut self, date: NaiveDate) -> Result<bool>;

    /// Inserts `rows` and marks `date` processed as one atomic unit.
    fn commit_date(&mut self, date: NaiveDate, rows: &[ArrivalRecord]) -> Result<()>;
}

pub struct PgStore {
    client: Client,
}

impl PgStore {
    pub fn connect(config: &DatabaseConfig) -> Result<Self> {
        Self::connect_with_attempts(config, CONNECT_ATTEMPTS)
    }

    /// Tries up to `attempts` times with a fixed delay in between.
    pub fn connect_with_attempts(config: &DatabaseConfig, attempts: u32) -> Result<Self> {
        let mut pg = postgres::Config::new();
        pg.host(&config.host)
            .port(config.port)
            .dbname(&config.name)
            .user(&config.user)
            .password(&config.password)
            .connect_timeout(CONNECT_TIMEOUT);

        let mut attempt = 1;
        loop {
            match pg.connect(NoTls) {
                Ok(client) => return Ok(PgStore { client }),
                Err(e) if attempt < attempts => {
                    tracing::warn!("Database connection attempt {}/{} failed: {}", attempt, attempts, e);
                    thread::sleep(CONNECT_RETRY_DELAY);
                    attempt += 1;
                }
                Err(e) => {
                    tracing::error!("Failed to connect to database after {} attempts", attempt);
                    return Err(e.into());
                }
            }
        }
    }

    pub fn init_schema(&mut self) -> Result<()> {
        tracing::info!("Applying migration: 001_initial_schema.sql");
        self.client.batch_execute(INITIAL_SCHEMA)?;
        Ok(())
    }

    // ------------------------------------------------------------------------
    // Read projections
    // ------------------------------------------------------------------------

    pub fn stations(&mut self) -> Result<Vec<String>> {
        let rows = self
            .client
            .query("SELECT DISTINCT station FROM train_data ORDER BY station", &[])?;
        Ok(rows.iter().map(|row| row.get(0)).collect())
    }

    pub fn station_exists(&mut self, station: &str) -> Result<bool> {
        let row = self.client.query_one(
            "SELECT EXISTS(SELECT 1 FROM train_data WHERE station = $1)",
            &[&station],
        )?;
        Ok(row.get(0))
    }

    pub fn train_exists(&mut self, station: &str, train_name: &str) -> Result<bool> {
        let row = self.client.query_one(
            "SELECT EXISTS(SELECT 1 FROM train_data WHERE station = $1 AND train_name = $2)",
            &[&station, &train_name],
        )?;
        Ok(row.get(0))
    }

    pub fn trains_for_station(&mut self, station: &str, days_cutoff: i32) -> Result<Vec<String>> {
        let rows = self.client.query(
            "SELECT DISTINCT train_name FROM train_data \
             WHERE station = $1 AND time >= CURRENT_DATE - make_interval(days => $2) \
             ORDER BY train_name",
            &[&station, &days_cutoff],
        )?;
        Ok(rows.iter().map(|row| row.get(0)).collect())
    }

    pub fn train_arrivals(&mut self, station: &str, train_name: &str, days_cutoff: i32) -> Result<Vec<TrainArrival>> {
        let rows = self.client.query(
            "SELECT delay_in_min, time, final_destination_station, is_canceled FROM train_data \
             WHERE station = $1 AND train_name = $2 AND time >= CURRENT_DATE - make_interval(days => $3) \
             ORDER BY time DESC",
            &[&station, &train_name, &days_cutoff],
        )?;
        Ok(rows
            .iter()
            .map(|row| TrainArrival {
                delay_in_min: row.get(0),
                time: row.get(1),
                final_destination_station: row.get(2),
                is_canceled: row.get(3),
            })
            .collect())
    }

    /// Processed dates, newest first.
    pub fn processed_dates(&mut self) -> Result<Vec<NaiveDate>> {
        let rows = self
            .client
            .query("SELECT date FROM processed_dates ORDER BY date DESC", &[])?;
        Ok(rows.iter().map(|row| row.get(0)).collect())
    }

    pub fn last_import(&mut self) -> Result<LastImport> {
        let row = self
            .client
            .query_one("SELECT MAX(created_at), COUNT(*) FROM train_data", &[])?;
        let last_import: Option<NaiveDateTime> = row.get(0);
        Ok(LastImport {
            last_import,
            records_imported: row.get(1),
        })
    }
}

impl ArrivalStore for PgStore {
    fn is_date_processed(&mut self, date: NaiveDate) -> Result<bool> {
        let row = self.client.query_one(
            "SELECT EXISTS(SELECT 1 FROM processed_dates WHERE date = $1)",
            &[&date],
        )?;
        Ok(row.get(0))
    }

    fn commit_date(&mut self, date: NaiveDate, rows: &[ArrivalRecord]) -> Result<()> {
        let mut transaction = self.client.transaction()?;

        for page in rows.chunks(INSERT_PAGE_SIZE) {
            let sql = insert_statement(page.len());
            let mut params: Vec<&(dyn ToSql + Sync)> = Vec::with_capacity(page.len() * TRAIN_DATA_COLUMNS.len());
            for row in page {
                params.push(&row.station);
                params.push(&row.train_name);
                params.push(&row.final_destination_station);
                params.push(&row.delay_in_min);
                params.push(&row.time);
                params.push(&row.is_canceled);
                params.push(&row.train_type);
                params.push(&row.ride_id);
                params.push(&row.station_sequence_num);
                params.push(&row.arrival_planned_time);
                params.push(&row.arrival_change_time);
                params.push(&row.departure_planned_time);
                params.push(&row.departure_change_time);
            }
            transaction.execute(sql.as_str(), &params)?;
        }

        transaction.execute(
            "INSERT INTO processed_dates (date) VALUES ($1) ON CONFLICT (date) DO NOTHING",
            &[&date],
        )?;
        transaction.commit()?;

        tracing::info!("Inserted {} rows for {}", rows.len(), date);
        Ok(())
    }
}

/// Multi-row `INSERT` for `row_count` rows with numbered placeholders.
fn insert_statement(row_count: usize) -> String {
    let width = TRAIN_DATA_COLUMNS.len();
    let values: Vec<String> = (0..row_count)
        .map(|row| {
            let placeholders: Vec<String> = (1..=width).map(|col| format!("${}", row * width + col)).collect();
            format!("({})", placeholders.join(", "))
        })
        .collect();
    format!(
        "INSERT INTO train_data ({}) VALUES {}",
        TRAIN_DATA_COLUMNS.join(", "),
        values.join(", ")
    )
}
