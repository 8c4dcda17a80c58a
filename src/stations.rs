// Station inputs: the EVA list that drives fetching and the alias map applied during parsing.

use std::collections::HashMap;
use std::fs;
use std::path::Path;

use serde::Deserialize;

use crate::error::{Error, Result};

/// Alternative station name -> canonical station name.
pub type StationAliases = HashMap<String, String>;

#[derive(Debug, Deserialize)]
struct EvaRow {
    evas: String,
}

/// Reads the `evas` column; a cell may hold several comma-separated EVA numbers.
pub fn load_eva_list(path: &Path) -> Result<Vec<String>> {
    let mut reader = csv::Reader::from_path(path)
        .map_err(|e| Error::Config(format!("Failed to open EVA list {:?}: {}", path, e)))?;

    let mut evas = Vec::new();
    for row in reader.deserialize::<EvaRow>() {
        let row = row.map_err(|e| Error::Parse(format!("Invalid EVA list row in {:?}: {}", path, e)))?;
        evas.extend(
            row.evas
                .split(',')
                .map(str::trim)
                .filter(|eva| !eva.is_empty())
                .map(String::from),
        );
    }
    Ok(evas)
}

pub fn load_station_aliases(path: Option<&Path>) -> Result<StationAliases> {
    let Some(path) = path else {
        return Ok(StationAliases::new());
    };
    let contents = fs::read_to_string(path)
        .map_err(|e| Error::Config(format!("Alternative station names file {:?}: {}", path, e)))?;
    serde_json::from_str(&contents)
        .map_err(|e| Error::Config(format!("Invalid alternative station names in {:?}: {}", path, e)))
}
