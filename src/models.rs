// Record types flowing through the pipeline: plan and change snapshots are parsed
// into `StopPlanRecord` / `StopChangeRecord`, reconciled into `ArrivalRecord`.

use chrono::NaiveDateTime;
use serde::Serialize;

// ============================================================================
// Snapshot Records
// ============================================================================

/// One scheduled stop from a plan snapshot.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct StopPlanRecord {
    /// `<ride_id>-<station_sequence_num>`, unique per date.
    pub stop_id: String,
    pub station: String,
    pub train_name: String,
    pub final_destination_station: String,
    pub train_type: Option<String>,
    pub arrival_planned_time: Option<NaiveDateTime>,
    pub departure_planned_time: Option<NaiveDateTime>,
    pub ride_id: String,
    pub station_sequence_num: i32,
}

/// A real-time delta against a stop, keyed by the same `stop_id`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StopChangeRecord {
    pub stop_id: String,
    pub arrival_change_time: Option<NaiveDateTime>,
    pub departure_change_time: Option<NaiveDateTime>,
    pub is_canceled: bool,
}

// ============================================================================
// Persisted Rows
// ============================================================================

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ArrivalRecord {
    pub station: String,
    pub train_name: String,
    pub final_destination_station: String,
    pub delay_in_min: i32,
    pub time: Option<NaiveDateTime>,
    pub is_canceled: bool,
    pub train_type: Option<String>,
    pub ride_id: String,
    pub station_sequence_num: i32,
    pub arrival_planned_time: Option<NaiveDateTime>,
    pub arrival_change_time: Option<NaiveDateTime>,
    pub departure_planned_time: Option<NaiveDateTime>,
    pub departure_change_time: Option<NaiveDateTime>,
}

/// Projection served to the dashboard for one train at one station.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TrainArrival {
    pub delay_in_min: i32,
    pub time: Option<NaiveDateTime>,
    pub final_destination_station: String,
    pub is_canceled: bool,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct LastImport {
    pub last_import: Option<NaiveDateTime>,
    pub records_imported: i64,
}
