// Per-date import: snapshot folder -> reconciled rows -> one committed transaction.

use chrono::NaiveDate;

use crate::config::Config;
use crate::error::{Error, Result};
use crate::parser;
use crate::reconcile;
use crate::snapshot::{SnapshotKind, SnapshotStore};
use crate::stations::{self, StationAliases};
use crate::store::{ArrivalStore, PgStore};

/// Lifecycle of one date. A failed run leaves the date `Unprocessed`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DateState {
    Unprocessed,
    Reconciling,
    Persisting,
    Processed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DateOutcome {
    AlreadyProcessed,
    Imported { arrivals: usize },
}

pub struct Importer<S: ArrivalStore> {
    store: S,
    snapshots: SnapshotStore,
    aliases: StationAliases,
    delete_after_import: bool,
}

impl<S: ArrivalStore> Importer<S> {
    pub fn new(store: S, snapshots: SnapshotStore, aliases: StationAliases, delete_after_import: bool) -> Self {
        Importer {
            store,
            snapshots,
            aliases,
            delete_after_import,
        }
    }

    /// Imports one date folder, or only cleans it up when the date is already marked.
    pub fn process_date(&mut self, date: NaiveDate) -> Result<DateOutcome> {
        if self.store.is_date_processed(date)? {
            tracing::info!("Date {} has already been processed, skipping...", date);
            self.cleanup(date);
            return Ok(DateOutcome::AlreadyProcessed);
        }

        let mut state = DateState::Unprocessed;
        advance(date, &mut state, DateState::Reconciling);
        let plan_files = self.snapshots.snapshot_files(date, SnapshotKind::Plan)?;
        let change_files = self.snapshots.snapshot_files(date, SnapshotKind::Change)?;

        let plan = parser::collect_plan_records(&plan_files, &self.aliases);
        if plan.is_empty() {
            return Err(Error::Parse(format!(
                "no plan records for {} in {} plan files",
                date,
                plan_files.len()
            )));
        }
        let changes = parser::collect_change_records(&change_files);
        if changes.is_empty() {
            tracing::warn!("No change records for {}, every stop is reported on time", date);
        }
        tracing::info!(
            "Reconciling {}: {} planned stops, {} changed stops",
            date,
            plan.len(),
            changes.len()
        );
        let arrivals = reconcile::reconcile(plan, &changes);

        advance(date, &mut state, DateState::Persisting);
        self.store.commit_date(date, &arrivals)?;
        advance(date, &mut state, DateState::Processed);
        tracing::info!("Successfully processed and stored data for {}", date);

        self.cleanup(date);
        Ok(DateOutcome::Imported {
            arrivals: arrivals.len(),
        })
    }

    /// Single-date mode: the folder must exist.
    pub fn import_date(&mut self, date: NaiveDate) -> Result<DateOutcome> {
        let folder = self.snapshots.date_folder(date);
        if !folder.is_dir() {
            return Err(Error::MissingSnapshotFolder(folder));
        }
        self.process_date(date)
    }

    /// Batch mode: every date folder in calendar order. A failing date is logged
    /// and does not stop later dates. Returns the dates that ended up processed.
    pub fn import_all(&mut self) -> Result<Vec<NaiveDate>> {
        let root = self.snapshots.root();
        if !root.is_dir() {
            return Err(Error::MissingSnapshotFolder(root.to_path_buf()));
        }

        let mut processed = Vec::new();
        for date in self.snapshots.date_folders()? {
            match self.process_date(date) {
                Ok(_) => processed.push(date),
                Err(e) => tracing::error!("Error processing {}: {}", date, e),
            }
        }
        Ok(processed)
    }

    fn cleanup(&self, date: NaiveDate) {
        if !self.delete_after_import {
            tracing::debug!("Keeping snapshot folder for {} (deletion disabled)", date);
            return;
        }
        match self.snapshots.remove_date_folder(date) {
            Ok(()) => tracing::info!("Deleted snapshot folder for {}", date),
            Err(e) => tracing::warn!("Error deleting snapshot folder for {}: {}", date, e),
        }
    }
}

fn advance(date: NaiveDate, state: &mut DateState, next: DateState) {
    tracing::debug!("{}: {:?} -> {:?}", date, state, next);
    *state = next;
}

fn open_importer(config: &Config) -> Result<Importer<PgStore>> {
    let aliases = stations::load_station_aliases(config.alt_station_names_file.as_deref())?;
    let snapshots = SnapshotStore::new(&config.snapshot_dir);
    if !snapshots.root().is_dir() {
        return Err(Error::MissingSnapshotFolder(config.snapshot_dir.clone()));
    }
    let store = PgStore::connect(&config.database)?;
    Ok(Importer::new(store, snapshots, aliases, config.delete_xml_after_import))
}

pub fn run_import_cycle(config: &Config) -> Result<Vec<NaiveDate>> {
    open_importer(config)?.import_all()
}

pub fn run_import_for_date(config: &Config, date: NaiveDate) -> Result<DateOutcome> {
    open_importer(config)?.import_date(date)
}
