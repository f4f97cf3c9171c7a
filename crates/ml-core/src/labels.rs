use std::{fs, path::Path};

use crate::engine::EngineInitError;

/// Read a newline separated label file, skipping blank lines.
pub fn load_labels(path: &Path) -> Result<Vec<String>, EngineInitError> {
    let contents = fs::read_to_string(path).map_err(|source| EngineInitError::MissingAsset {
        path: path.to_path_buf(),
        source,
    })?;

    let labels: Vec<String> = contents
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty())
        .map(str::to_string)
        .collect();

    if labels.is_empty() {
        return Err(EngineInitError::EmptyLabels {
            path: path.to_path_buf(),
        });
    }
    Ok(labels)
}
