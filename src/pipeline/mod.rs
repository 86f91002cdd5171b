//! Pipeline module - inference and judge runs over JSONL files.

mod inference;
mod judge;

pub use inference::*;
pub use judge::*;

use crate::models::{EvalError, Result};
use serde::Serialize;
use serde::de::DeserializeOwned;
use std::fs::File;
use std::io::{BufRead, BufReader, BufWriter, Write};
use std::path::Path;

/// Read up to `limit` records from a JSONL file, skipping blank lines.
pub fn read_jsonl<T: DeserializeOwned>(path: &Path, limit: Option<usize>) -> Result<Vec<T>> {
    let file = File::open(path)
        .map_err(|e| EvalError::io(format!("opening {}", path.display()), e))?;
    let reader = BufReader::new(file);
    let mut items = Vec::new();

    for (line_num, line) in reader.lines().enumerate() {
        if limit.is_some_and(|n| items.len() >= n) {
            break;
        }
        let line = line.map_err(|e| EvalError::io(format!("reading {}", path.display()), e))?;
        if line.trim().is_empty() {
            continue;
        }
        let item = serde_json::from_str(&line)
            .map_err(|e| EvalError::Parse(format!("Line {}: {}", line_num + 1, e)))?;
        items.push(item);
    }

    Ok(items)
}

/// Write one JSON object per line, creating parent directories.
pub fn write_jsonl<T: Serialize>(path: &Path, items: &[T]) -> Result<()> {
    if let Some(dir) = path.parent() {
        std::fs::create_dir_all(dir)
            .map_err(|e| EvalError::io(format!("creating {}", dir.display()), e))?;
    }

    let file = File::create(path).map_err(|e| EvalError::io("creating output file", e))?;
    let mut writer = BufWriter::new(file);

    for item in items {
        let json = serde_json::to_string(item)
            .map_err(|e| EvalError::Internal(format!("Failed to serialize record: {}", e)))?;
        writeln!(writer, "{}", json).map_err(|e| EvalError::io("writing output", e))?;
    }

    writer
        .flush()
        .map_err(|e| EvalError::io("flushing output", e))?;
    Ok(())
}

/// File stem of `path`, without a trailing `.jsonl`.
pub(crate) fn file_stem(path: &Path) -> String {
    path.file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_else(|| "output".to_string())
}
