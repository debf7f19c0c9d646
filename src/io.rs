//! Flat-file interchange helpers: numeric grids, delimited tables, and the
//! per-stage metrics documents merged into `reports/metrics.json` at the end
//! of a pipeline.

use ndarray::Array2;
use serde_json::{Map, Value};
use std::error::Error;
use std::fs::{self, File};
use std::io::{BufRead, BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};

use crate::error::PipelineError;

/// Fail fast with the offending path when an upstream artifact is absent.
pub fn require_input(path: &str) -> Result<(), PipelineError> {
    if !Path::new(path).exists() {
        return Err(PipelineError::MissingInput {
            path: PathBuf::from(path),
        });
    }
    Ok(())
}

pub fn ensure_parent_dir(path: &str) -> std::io::Result<()> {
    if let Some(parent) = Path::new(path).parent() {
        if !parent.as_os_str().is_empty() {
            fs::create_dir_all(parent)?;
        }
    }
    Ok(())
}

/// Write a 2-D float grid as comma-separated rows, one image row per line.
pub fn save_grid_f64(path: &str, grid: &Array2<f64>) -> Result<(), Box<dyn Error>> {
    ensure_parent_dir(path)?;
    let mut out = BufWriter::new(File::create(path)?);
    for row in grid.rows() {
        let line: Vec<String> = row.iter().map(|v| format!("{:.6}", v)).collect();
        writeln!(out, "{}", line.join(","))?;
    }
    out.flush()?;
    Ok(())
}

pub fn load_grid_f64(path: &str) -> Result<Array2<f64>, Box<dyn Error>> {
    require_input(path)?;
    let reader = BufReader::new(File::open(path)?);
    let mut data: Vec<f64> = Vec::new();
    let mut width = 0usize;
    let mut height = 0usize;
    for (lineno, line) in reader.lines().enumerate() {
        let line = line?;
        if line.trim().is_empty() {
            continue;
        }
        let mut count = 0usize;
        for field in line.split(',') {
            let v = field.trim().parse::<f64>().map_err(|e| {
                PipelineError::MalformedTable {
                    path: PathBuf::from(path),
                    line: lineno + 1,
                    reason: e.to_string(),
                }
            })?;
            data.push(v);
            count += 1;
        }
        if height == 0 {
            width = count;
        } else if count != width {
            return Err(PipelineError::RaggedGrid {
                path: PathBuf::from(path),
                expected: width,
                found: count,
            }
            .into());
        }
        height += 1;
    }
    Ok(Array2::from_shape_vec((height, width), data)?)
}

/// Write a 2-D integer grid (label mask) as comma-separated rows.
pub fn save_grid_i32(path: &str, grid: &Array2<i32>) -> Result<(), Box<dyn Error>> {
    ensure_parent_dir(path)?;
    let mut out = BufWriter::new(File::create(path)?);
    for row in grid.rows() {
        let line: Vec<String> = row.iter().map(|v| v.to_string()).collect();
        writeln!(out, "{}", line.join(","))?;
    }
    out.flush()?;
    Ok(())
}

pub fn load_grid_i32(path: &str) -> Result<Array2<i32>, Box<dyn Error>> {
    require_input(path)?;
    let reader = BufReader::new(File::open(path)?);
    let mut data: Vec<i32> = Vec::new();
    let mut width = 0usize;
    let mut height = 0usize;
    for (lineno, line) in reader.lines().enumerate() {
        let line = line?;
        if line.trim().is_empty() {
            continue;
        }
        let mut count = 0usize;
        for field in line.split(',') {
            let v = field.trim().parse::<i32>().map_err(|e| {
                PipelineError::MalformedTable {
                    path: PathBuf::from(path),
                    line: lineno + 1,
                    reason: e.to_string(),
                }
            })?;
            data.push(v);
            count += 1;
        }
        if height == 0 {
            width = count;
        } else if count != width {
            return Err(PipelineError::RaggedGrid {
                path: PathBuf::from(path),
                expected: width,
                found: count,
            }
            .into());
        }
        height += 1;
    }
    Ok(Array2::from_shape_vec((height, width), data)?)
}

/// A delimited table held as a header plus string rows, in the order read.
#[derive(Debug)]
pub struct Table {
    pub path: String,
    pub header: Vec<String>,
    pub rows: Vec<Vec<String>>,
}

impl Table {
    pub fn read(path: &str) -> Result<Table, Box<dyn Error>> {
        require_input(path)?;
        let reader = BufReader::new(File::open(path)?);
        let mut lines = reader.lines();
        let header_line = lines.next().ok_or_else(|| PipelineError::MalformedTable {
            path: PathBuf::from(path),
            line: 1,
            reason: "file is empty, expected a header row".to_string(),
        })??;
        let header: Vec<String> = header_line.split(',').map(|s| s.trim().to_string()).collect();
        let mut rows = Vec::new();
        for (lineno, line) in lines.enumerate() {
            let line = line?;
            if line.trim().is_empty() {
                continue;
            }
            let fields: Vec<String> = line.split(',').map(|s| s.trim().to_string()).collect();
            if fields.len() != header.len() {
                return Err(PipelineError::MalformedTable {
                    path: PathBuf::from(path),
                    line: lineno + 2,
                    reason: format!(
                        "expected {} columns, found {}",
                        header.len(),
                        fields.len()
                    ),
                }
                .into());
            }
            rows.push(fields);
        }
        Ok(Table {
            path: path.to_string(),
            header,
            rows,
        })
    }

    /// Column index by name, or a malformed-table error naming the column.
    pub fn col(&self, name: &str) -> Result<usize, Box<dyn Error>> {
        self.header
            .iter()
            .position(|h| h == name)
            .ok_or_else(|| -> Box<dyn Error> {
                PipelineError::MalformedTable {
                    path: PathBuf::from(&self.path),
                    line: 1,
                    reason: format!("missing required column '{}'", name),
                }
                .into()
            })
    }

    pub fn f64_at(&self, row: usize, col: usize) -> Result<f64, Box<dyn Error>> {
        self.rows[row][col]
            .parse::<f64>()
            .map_err(|e| -> Box<dyn Error> {
                PipelineError::MalformedTable {
                    path: PathBuf::from(&self.path),
                    line: row + 2,
                    reason: e.to_string(),
                }
                .into()
            })
    }

    pub fn i64_at(&self, row: usize, col: usize) -> Result<i64, Box<dyn Error>> {
        self.rows[row][col]
            .parse::<i64>()
            .map_err(|e| -> Box<dyn Error> {
                PipelineError::MalformedTable {
                    path: PathBuf::from(&self.path),
                    line: row + 2,
                    reason: e.to_string(),
                }
                .into()
            })
    }
}

pub fn write_table(
    path: &str,
    header: &[String],
    rows: &[Vec<String>],
) -> Result<(), Box<dyn Error>> {
    ensure_parent_dir(path)?;
    let mut out = BufWriter::new(File::create(path)?);
    writeln!(out, "{}", header.join(","))?;
    for row in rows {
        writeln!(out, "{}", row.join(","))?;
    }
    out.flush()?;
    Ok(())
}

/// Per-stage metrics accumulator. Each stage owns a namespaced document under
/// `reports/metrics/<stage>.json`; a pipeline ends by merging all stage
/// documents into `reports/metrics.json`, so no stage ever rewrites another
/// stage's keys.
pub struct StageMetrics {
    stage: String,
    values: Map<String, Value>,
}

impl StageMetrics {
    pub fn new(stage: &str) -> Self {
        Self {
            stage: stage.to_string(),
            values: Map::new(),
        }
    }

    pub fn set<V: Into<Value>>(&mut self, key: &str, value: V) {
        self.values.insert(key.to_string(), value.into());
    }

    pub fn set_json(&mut self, key: &str, value: Value) {
        self.values.insert(key.to_string(), value);
    }

    pub fn write(&self) -> Result<(), Box<dyn Error>> {
        let path = format!("reports/metrics/{}.json", self.stage);
        ensure_parent_dir(&path)?;
        let doc = Value::Object(self.values.clone());
        let mut out = BufWriter::new(File::create(&path)?);
        serde_json::to_writer_pretty(&mut out, &doc)?;
        out.flush()?;
        Ok(())
    }
}

/// Merge every `reports/metrics/<stage>.json` into one document keyed by stage
/// name, in sorted order. Returns the merged document for display.
pub fn merge_metrics() -> Result<Value, Box<dyn Error>> {
    let dir = Path::new("reports/metrics");
    let mut merged = Map::new();
    if dir.exists() {
        let mut entries: Vec<PathBuf> = fs::read_dir(dir)?
            .filter_map(|e| e.ok())
            .map(|e| e.path())
            .filter(|p| p.extension().map_or(false, |ext| ext == "json"))
            .collect();
        entries.sort();
        for path in entries {
            let stage = path
                .file_stem()
                .map(|s| s.to_string_lossy().to_string())
                .unwrap_or_default();
            let contents = fs::read_to_string(&path)?;
            let doc: Value = serde_json::from_str(&contents)?;
            merged.insert(stage, doc);
        }
    }
    let merged = Value::Object(merged);
    ensure_parent_dir("reports/metrics.json")?;
    let mut out = BufWriter::new(File::create("reports/metrics.json")?);
    serde_json::to_writer_pretty(&mut out, &merged)?;
    out.flush()?;
    Ok(merged)
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::array;

    #[test]
    fn grid_f64_round_trip_preserves_shape_and_values() {
        let grid = array![[0.0, 0.25, 0.5], [1.0, 0.75, 0.125]];
        let path = std::env::temp_dir().join("synthlab_grid_f64.csv");
        let path = path.to_string_lossy().to_string();
        save_grid_f64(&path, &grid).unwrap();
        let back = load_grid_f64(&path).unwrap();
        assert_eq!(back.dim(), (2, 3));
        for (a, b) in grid.iter().zip(back.iter()) {
            assert!((a - b).abs() < 1e-6);
        }
        std::fs::remove_file(&path).ok();
    }

    #[test]
    fn grid_i32_round_trip_is_exact() {
        let grid = array![[0, 1, 2], [3, 0, 5]];
        let path = std::env::temp_dir().join("synthlab_grid_i32.csv");
        let path = path.to_string_lossy().to_string();
        save_grid_i32(&path, &grid).unwrap();
        let back = load_grid_i32(&path).unwrap();
        assert_eq!(grid, back);
        std::fs::remove_file(&path).ok();
    }

    #[test]
    fn missing_input_is_reported_with_path() {
        let err = require_input("data/raw/does_not_exist.csv").unwrap_err();
        let msg = err.to_string();
        assert!(msg.contains("does_not_exist.csv"));
    }

    #[test]
    fn table_rejects_ragged_rows() {
        let path = std::env::temp_dir().join("synthlab_ragged.csv");
        std::fs::write(&path, "a,b\n1,2\n3\n").unwrap();
        let err = Table::read(&path.to_string_lossy()).unwrap_err();
        assert!(err.to_string().contains("expected 2 columns"));
        std::fs::remove_file(&path).ok();
    }
}
