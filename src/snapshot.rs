// On-disk hand-off between fetch and import:
// <root>/<YYYY-MM-DD>/<eva>_plan_<HH>.xml and <root>/<YYYY-MM-DD>/<eva>_fchg_<HH>.xml

use std::fs;
use std::path::{Path, PathBuf};

use chrono::NaiveDate;

use crate::error::Result;

const DATE_FOLDER_FORMAT: &str = "%Y-%m-%d";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SnapshotKind {
    Plan,
    Change,
}

impl SnapshotKind {
    fn marker(self) -> &'static str {
        match self {
            SnapshotKind::Plan => "plan",
            SnapshotKind::Change => "fchg",
        }
    }

    pub fn of_file(path: &Path) -> Option<Self> {
        let name = path.file_name()?.to_str()?;
        if name.contains(SnapshotKind::Plan.marker()) {
            Some(SnapshotKind::Plan)
        } else if name.contains(SnapshotKind::Change.marker()) {
            Some(SnapshotKind::Change)
        } else {
            None
        }
    }
}

#[derive(Debug, Clone)]
pub struct SnapshotStore {
    root: PathBuf,
}

impl SnapshotStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        SnapshotStore { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn date_folder(&self, date: NaiveDate) -> PathBuf {
        self.root.join(date.format(DATE_FOLDER_FORMAT).to_string())
    }

    pub fn snapshot_path(&self, date: NaiveDate, eva: &str, kind: SnapshotKind, hour: u32) -> PathBuf {
        self.date_folder(date)
            .join(format!("{}_{}_{:02}.xml", eva, kind.marker(), hour))
    }

    /// Date folders in ascending calendar order; entries that are not `YYYY-MM-DD` are skipped.
    pub fn date_folders(&self) -> Result<Vec<NaiveDate>> {
        let mut dates = Vec::new();
        for entry in fs::read_dir(&self.root)? {
            let entry = entry?;
            if !entry.file_type()?.is_dir() {
                continue;
            }
            let name = entry.file_name();
            let name = name.to_string_lossy();
            match NaiveDate::parse_from_str(&name, DATE_FOLDER_FORMAT) {
                Ok(date) => dates.push(date),
                Err(_) => tracing::warn!("Ignoring non-date folder {:?}", entry.path()),
            }
        }
        dates.sort();
        Ok(dates)
    }

    pub fn count_date_folders(&self) -> usize {
        fs::read_dir(&self.root)
            .map(|entries| {
                entries
                    .filter_map(|entry| entry.ok())
                    .filter(|entry| entry.file_type().is_ok_and(|t| t.is_dir()))
                    .count()
            })
            .unwrap_or(0)
    }

    /// Snapshot files of one kind in a date folder, sorted by file name.
    pub fn snapshot_files(&self, date: NaiveDate, kind: SnapshotKind) -> Result<Vec<PathBuf>> {
        let mut files: Vec<PathBuf> = fs::read_dir(self.date_folder(date))?
            .filter_map(|entry| entry.ok())
            .map(|entry| entry.path())
            .filter(|path| path.is_file() && SnapshotKind::of_file(path) == Some(kind))
            .collect();
        files.sort();
        Ok(files)
    }

    pub fn remove_date_folder(&self, date: NaiveDate) -> Result<()> {
        fs::remove_dir_all(self.date_folder(date))?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::{SystemTime, UNIX_EPOCH};

    fn temp_dir(prefix: &str) -> PathBuf {
        let nanos = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .expect("time")
            .as_nanos();
        std::env::temp_dir().join(format!("{}_{}_{}", prefix, std::process::id(), nanos))
    }

    fn date(d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(2024, 1, d).expect("date")
    }

    #[test]
    fn builds_snapshot_paths() {
        let store = SnapshotStore::new("/data/xml");
        assert_eq!(
            store.snapshot_path(date(1), "8000105", SnapshotKind::Plan, 7),
            PathBuf::from("/data/xml/2024-01-01/8000105_plan_07.xml")
        );
        assert_eq!(
            store.snapshot_path(date(1), "8000105", SnapshotKind::Change, 13),
            PathBuf::from("/data/xml/2024-01-01/8000105_fchg_13.xml")
        );
    }

    #[test]
    fn lists_date_folders_in_calendar_order() {
        let root = temp_dir("snapshot_dates");
        for name in ["2024-01-10", "2024-01-02", "not-a-date"] {
            fs::create_dir_all(root.join(name)).expect("create dir");
        }
        fs::write(root.join("2024-01-03"), "stray file").expect("write");

        let store = SnapshotStore::new(&root);
        assert_eq!(store.date_folders().expect("dates"), vec![date(2), date(10)]);
        assert_eq!(store.count_date_folders(), 3);

        fs::remove_dir_all(&root).ok();
    }

    #[test]
    fn classifies_files_by_name() {
        let root = temp_dir("snapshot_kinds");
        let store = SnapshotStore::new(&root);
        let folder = store.date_folder(date(1));
        fs::create_dir_all(&folder).expect("create dir");
        for name in ["2_plan_10.xml", "1_plan_09.xml", "1_fchg_09.xml", "notes.txt"] {
            fs::write(folder.join(name), "<timetable/>").expect("write");
        }

        let plans = store.snapshot_files(date(1), SnapshotKind::Plan).expect("plans");
        assert_eq!(plans, vec![folder.join("1_plan_09.xml"), folder.join("2_plan_10.xml")]);
        let changes = store.snapshot_files(date(1), SnapshotKind::Change).expect("changes");
        assert_eq!(changes, vec![folder.join("1_fchg_09.xml")]);

        store.remove_date_folder(date(1)).expect("remove");
        assert!(!folder.exists());

        fs::remove_dir_all(&root).ok();
    }
}
