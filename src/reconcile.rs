// Joins plan and change records for one date into arrival rows.

use std::collections::HashMap;

use chrono::NaiveDateTime;

use crate::models::{ArrivalRecord, StopChangeRecord, StopPlanRecord};

/// Change records for one date, keyed by `stop_id`.
///
/// Recording a change replaces whatever was known for that stop, so the last
/// snapshot folded in wins entirely. Build one per date and drop it after reconciling.
#[derive(Debug, Default)]
pub struct ChangeAccumulator {
    changes: HashMap<String, StopChangeRecord>,
}

impl ChangeAccumulator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(&mut self, change: StopChangeRecord) {
        self.changes.insert(change.stop_id.clone(), change);
    }

    pub fn get(&self, stop_id: &str) -> Option<&StopChangeRecord> {
        self.changes.get(stop_id)
    }

    pub fn len(&self) -> usize {
        self.changes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.changes.is_empty()
    }
}

/// Left join of plan records onto change records by `stop_id`.
///
/// Every plan record yields one row; changes without a plan record are dropped.
pub fn reconcile(plan: Vec<StopPlanRecord>, changes: &ChangeAccumulator) -> Vec<ArrivalRecord> {
    plan.into_iter()
        .map(|stop| {
            let change = changes.get(&stop.stop_id);
            let is_canceled = change.is_some_and(|c| c.is_canceled);
            let departure_change_time = change
                .and_then(|c| c.departure_change_time)
                .or(stop.departure_planned_time);
            let arrival_change_time = change
                .and_then(|c| c.arrival_change_time)
                .or(stop.arrival_planned_time);

            let delay_in_min = minutes_between(stop.departure_planned_time, departure_change_time)
                .or_else(|| minutes_between(stop.arrival_planned_time, arrival_change_time))
                .unwrap_or(0);

            ArrivalRecord {
                station: stop.station,
                train_name: stop.train_name,
                final_destination_station: stop.final_destination_station,
                delay_in_min,
                time: departure_change_time.or(arrival_change_time),
                is_canceled,
                train_type: stop.train_type,
                ride_id: stop.ride_id,
                station_sequence_num: stop.station_sequence_num,
                arrival_planned_time: stop.arrival_planned_time,
                arrival_change_time,
                departure_planned_time: stop.departure_planned_time,
                departure_change_time,
            }
        })
        .collect()
}

fn minutes_between(planned: Option<NaiveDateTime>, changed: Option<NaiveDateTime>) -> Option<i32> {
    let minutes = (changed? - planned?).num_minutes();
    i32::try_from(minutes).ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDate;

    fn at(hour: u32, minute: u32) -> NaiveDateTime {
        NaiveDate::from_ymd_opt(2024, 1, 1)
            .and_then(|d| d.and_hms_opt(hour, minute, 0))
            .expect("valid datetime")
    }

    fn plan(stop_id: &str, arrival: Option<NaiveDateTime>, departure: Option<NaiveDateTime>) -> StopPlanRecord {
        let (ride_id, seq) = stop_id.rsplit_once('-').expect("composite id");
        StopPlanRecord {
            stop_id: stop_id.to_string(),
            station: "Frankfurt Hbf".to_string(),
            train_name: "ICE 123".to_string(),
            final_destination_station: "Berlin Hbf".to_string(),
            train_type: Some("ICE".to_string()),
            arrival_planned_time: arrival,
            departure_planned_time: departure,
            ride_id: ride_id.to_string(),
            station_sequence_num: seq.parse().expect("sequence"),
        }
    }

    fn change(
        stop_id: &str,
        arrival: Option<NaiveDateTime>,
        departure: Option<NaiveDateTime>,
        is_canceled: bool,
    ) -> StopChangeRecord {
        StopChangeRecord {
            stop_id: stop_id.to_string(),
            arrival_change_time: arrival,
            departure_change_time: departure,
            is_canceled,
        }
    }

    #[test]
    fn departure_change_sets_delay_and_time() {
        let mut changes = ChangeAccumulator::new();
        changes.record(change("8000105-1", None, Some(at(10, 7)), false));

        let rows = reconcile(vec![plan("8000105-1", None, Some(at(10, 0)))], &changes);

        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].train_name, "ICE 123");
        assert_eq!(rows[0].delay_in_min, 7);
        assert_eq!(rows[0].time, Some(at(10, 7)));
        assert!(!rows[0].is_canceled);
        assert_eq!(rows[0].ride_id, "8000105");
        assert_eq!(rows[0].station_sequence_num, 1);
    }

    #[test]
    fn plan_without_change_is_on_time() {
        let rows = reconcile(
            vec![plan("r-3", Some(at(9, 58)), Some(at(10, 0)))],
            &ChangeAccumulator::new(),
        );

        assert_eq!(rows[0].delay_in_min, 0);
        assert!(!rows[0].is_canceled);
        assert_eq!(rows[0].departure_change_time, Some(at(10, 0)));
        assert_eq!(rows[0].arrival_change_time, Some(at(9, 58)));
        assert_eq!(rows[0].time, Some(at(10, 0)));
    }

    #[test]
    fn departure_delay_wins_over_arrival_delay() {
        let mut changes = ChangeAccumulator::new();
        changes.record(change("r-2", Some(at(10, 20)), Some(at(10, 12)), false));

        let rows = reconcile(vec![plan("r-2", Some(at(9, 58)), Some(at(10, 0)))], &changes);

        assert_eq!(rows[0].delay_in_min, 12);
        assert_eq!(rows[0].time, Some(at(10, 12)));
    }

    #[test]
    fn terminus_falls_back_to_arrival() {
        let mut changes = ChangeAccumulator::new();
        changes.record(change("r-9", Some(at(11, 4)), None, false));

        let rows = reconcile(vec![plan("r-9", Some(at(11, 0)), None)], &changes);

        assert_eq!(rows[0].delay_in_min, 4);
        assert_eq!(rows[0].time, Some(at(11, 4)));
        assert_eq!(rows[0].departure_change_time, None);
    }

    #[test]
    fn cancellation_without_times_keeps_row_with_zero_delay() {
        let mut changes = ChangeAccumulator::new();
        changes.record(change("r-4", None, None, true));

        let rows = reconcile(vec![plan("r-4", None, None)], &changes);

        assert_eq!(rows.len(), 1);
        assert!(rows[0].is_canceled);
        assert_eq!(rows[0].delay_in_min, 0);
        assert_eq!(rows[0].time, None);
    }

    #[test]
    fn orphan_changes_are_dropped() {
        let mut changes = ChangeAccumulator::new();
        assert!(changes.is_empty());
        changes.record(change("ghost-1", None, Some(at(12, 0)), true));
        assert!(!changes.is_empty());

        let rows = reconcile(vec![plan("r-1", None, Some(at(10, 0)))], &changes);

        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].ride_id, "r");
        assert!(!rows[0].is_canceled);
    }

    #[test]
    fn later_change_replaces_earlier_one_entirely() {
        let mut changes = ChangeAccumulator::new();
        changes.record(change("r-1", Some(at(9, 59)), Some(at(10, 5)), false));
        changes.record(change("r-1", None, None, true));

        let rows = reconcile(vec![plan("r-1", Some(at(9, 58)), Some(at(10, 0)))], &changes);

        assert_eq!(changes.len(), 1);
        assert!(rows[0].is_canceled);
        assert_eq!(rows[0].delay_in_min, 0);
        assert_eq!(rows[0].arrival_change_time, Some(at(9, 58)));
    }

    #[test]
    fn result_does_not_depend_on_input_order() {
        let mut changes = ChangeAccumulator::new();
        changes.record(change("b-2", None, Some(at(10, 3)), false));
        changes.record(change("a-1", Some(at(8, 9)), None, false));

        let forward = vec![plan("a-1", Some(at(8, 0)), None), plan("b-2", None, Some(at(10, 0)))];
        let mut backward = forward.clone();
        backward.reverse();

        let mut left = reconcile(forward, &changes);
        let mut right = reconcile(backward, &changes);
        left.sort_by(|x, y| x.ride_id.cmp(&y.ride_id));
        right.sort_by(|x, y| x.ride_id.cmp(&y.ride_id));

        assert_eq!(left, right);
        assert_eq!(left[0].delay_in_min, 9);
        assert_eq!(left[1].delay_in_min, 3);
    }
}
