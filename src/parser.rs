// Timetable XML snapshots -> typed stop records.
//
// Plan snapshot:   <timetable station="..."><s id="..."><tl c="ICE" n="123"/><ar pt="2401010958" l="..."/><dp pt="..." ppth="A|B|C"/></s></timetable>
// Change snapshot: <timetable><s id="..."><ar ct="..." clt="..."/><dp ct="..."/></s></timetable>

use std::collections::HashSet;
use std::fs;
use std::path::{Path, PathBuf};

use chrono::NaiveDateTime;
use serde::Deserialize;

use crate::error::{Error, Result};
use crate::models::{StopChangeRecord, StopPlanRecord};
use crate::reconcile::ChangeAccumulator;
use crate::stations::StationAliases;

const TIMESTAMP_FORMAT: &str = "%y%m%d%H%M";

/// Categories named by train number rather than line.
const PREMIUM_TRAIN_TYPES: [&str; 3] = ["IC", "ICE", "EC"];

// ============================================================================
// XML Shapes
// ============================================================================

#[derive(Debug, Deserialize)]
struct Timetable {
    #[serde(rename = "@station")]
    station: Option<String>,
    #[serde(rename = "s", default)]
    stops: Vec<XmlStop>,
}

#[derive(Debug, Deserialize)]
struct XmlStop {
    #[serde(rename = "@id")]
    id: String,
    #[serde(rename = "tl")]
    train_label: Option<TrainLabel>,
    #[serde(rename = "ar")]
    arrival: Option<StopEvent>,
    #[serde(rename = "dp")]
    departure: Option<StopEvent>,
}

#[derive(Debug, Deserialize)]
struct TrainLabel {
    #[serde(rename = "@c")]
    category: Option<String>,
    #[serde(rename = "@n")]
    number: Option<String>,
}

#[derive(Debug, Deserialize)]
struct StopEvent {
    #[serde(rename = "@pt")]
    planned_time: Option<String>,
    #[serde(rename = "@ct")]
    changed_time: Option<String>,
    #[serde(rename = "@clt")]
    cancellation_time: Option<String>,
    #[serde(rename = "@l")]
    line: Option<String>,
    #[serde(rename = "@ppth")]
    planned_path: Option<String>,
}

fn parse_timetable(xml: &str) -> Result<Timetable> {
    quick_xml::de::from_str(xml).map_err(|e| Error::Parse(format!("Invalid timetable XML: {}", e)))
}

// ============================================================================
// Field Rules
// ============================================================================

/// `YYMMDDHHmm`; anything else is treated as missing.
pub fn parse_timestamp(raw: &str) -> Option<NaiveDateTime> {
    NaiveDateTime::parse_from_str(raw.trim(), TIMESTAMP_FORMAT).ok()
}

pub fn train_name(
    train_type: Option<&str>,
    train_number: Option<&str>,
    arrival_line: Option<&str>,
    departure_line: Option<&str>,
) -> String {
    let category = train_type.unwrap_or_default();
    let suffix = if PREMIUM_TRAIN_TYPES.contains(&category) {
        train_number
    } else {
        arrival_line.or(departure_line)
    };
    match suffix {
        Some(suffix) if category.is_empty() => suffix.to_string(),
        Some(suffix) => format!("{} {}", category, suffix),
        None => category.to_string(),
    }
}

/// Last station of the planned departure path; a stop without departure is its own destination.
fn final_destination(station: &str, departure: Option<&StopEvent>) -> String {
    departure
        .and_then(|dp| dp.planned_path.as_deref())
        .and_then(|path| path.rsplit('|').next())
        .unwrap_or(station)
        .to_string()
}

fn split_stop_id(stop_id: &str) -> Option<(String, i32)> {
    let (ride_id, sequence) = stop_id.rsplit_once('-').unwrap_or(("", stop_id));
    let sequence = sequence.trim().parse().ok()?;
    Some((ride_id.to_string(), sequence))
}

// ============================================================================
// Plan Snapshots
// ============================================================================

pub fn parse_plan_str(xml: &str, aliases: &StationAliases) -> Result<Vec<StopPlanRecord>> {
    let timetable = parse_timetable(xml)?;
    let station = timetable.station.unwrap_or_default();
    let station = aliases.get(&station).cloned().unwrap_or(station);

    let mut records = Vec::with_capacity(timetable.stops.len());
    for stop in timetable.stops {
        let Some((ride_id, station_sequence_num)) = split_stop_id(&stop.id) else {
            tracing::warn!("Skipping stop with malformed id {:?} at {}", stop.id, station);
            continue;
        };

        let train_type = stop.train_label.as_ref().and_then(|tl| tl.category.clone());
        let train_number = stop.train_label.as_ref().and_then(|tl| tl.number.as_deref());
        let arrival_line = stop.arrival.as_ref().and_then(|ar| ar.line.as_deref());
        let departure_line = stop.departure.as_ref().and_then(|dp| dp.line.as_deref());

        records.push(StopPlanRecord {
            train_name: train_name(train_type.as_deref(), train_number, arrival_line, departure_line),
            final_destination_station: final_destination(&station, stop.departure.as_ref()),
            arrival_planned_time: stop
                .arrival
                .as_ref()
                .and_then(|ar| ar.planned_time.as_deref())
                .and_then(parse_timestamp),
            departure_planned_time: stop
                .departure
                .as_ref()
                .and_then(|dp| dp.planned_time.as_deref())
                .and_then(parse_timestamp),
            station: station.clone(),
            train_type,
            ride_id,
            station_sequence_num,
            stop_id: stop.id,
        });
    }
    Ok(records)
}

pub fn parse_plan_snapshot(path: &Path, aliases: &StationAliases) -> Result<Vec<StopPlanRecord>> {
    parse_plan_str(&fs::read_to_string(path)?, aliases)
}

/// Parses every plan file of a date. A file that fails is logged and skipped;
/// rows delivered more than once are kept only once.
pub fn collect_plan_records(files: &[PathBuf], aliases: &StationAliases) -> Vec<StopPlanRecord> {
    let mut seen = HashSet::new();
    let mut records = Vec::new();
    for path in files {
        match parse_plan_snapshot(path, aliases) {
            Ok(rows) => {
                for row in rows {
                    if seen.insert(row.clone()) {
                        records.push(row);
                    }
                }
            }
            Err(e) => tracing::error!("Failed to parse plan snapshot {:?}: {}", path, e),
        }
    }
    records
}

// ============================================================================
// Change Snapshots
// ============================================================================

/// Folds one change snapshot into `accumulator`. Stops carrying neither a change
/// time nor a cancellation marker are skipped so they cannot erase a known change.
/// A file that fails to parse leaves the accumulator untouched.
pub fn parse_change_str(xml: &str, accumulator: &mut ChangeAccumulator) -> Result<()> {
    let timetable = parse_timetable(xml)?;
    for stop in timetable.stops {
        let ar = stop.arrival.as_ref();
        let dp = stop.departure.as_ref();
        let arrival_ct = ar.and_then(|e| e.changed_time.as_deref());
        let departure_ct = dp.and_then(|e| e.changed_time.as_deref());
        let is_canceled = ar.is_some_and(|e| e.cancellation_time.is_some())
            || dp.is_some_and(|e| e.cancellation_time.is_some());

        if arrival_ct.is_none() && departure_ct.is_none() && !is_canceled {
            continue;
        }

        accumulator.record(StopChangeRecord {
            arrival_change_time: arrival_ct.and_then(parse_timestamp),
            departure_change_time: departure_ct.and_then(parse_timestamp),
            is_canceled,
            stop_id: stop.id,
        });
    }
    Ok(())
}

pub fn parse_change_snapshot(path: &Path, accumulator: &mut ChangeAccumulator) -> Result<()> {
    parse_change_str(&fs::read_to_string(path)?, accumulator)
}

/// Folds change files in the given order; later files win.
pub fn collect_change_records(files: &[PathBuf]) -> ChangeAccumulator {
    let mut accumulator = ChangeAccumulator::new();
    for path in files {
        if let Err(e) = parse_change_snapshot(path, &mut accumulator) {
            tracing::error!("Failed to parse change snapshot {:?}: {}", path, e);
        }
    }
    accumulator
}
