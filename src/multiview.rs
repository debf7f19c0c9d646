//! Assembly of the fused two-view cell table: the morphology/intensity view
//! next to the barcode/projection view, one row per mapped region.

use clap::Args;
use std::error::Error;
use std::time::Instant;

use crate::io::{self, StageMetrics, Table};
use crate::progress;

const MORPH_COLS: [&str; 6] = [
    "area",
    "eccentricity",
    "perimeter",
    "solidity",
    "mean_intensity",
    "max_intensity",
];

#[derive(Args, Debug, Clone)]
pub struct MultiviewArgs {
    /// Input mapped cell table
    #[arg(short = 'i', long = "input", default_value = "data/processed/mapped_cells.csv")]
    pub mapped_in: String,
    /// Output fused cell table
    #[arg(short = 'o', long = "output", default_value = "reports/cell_table.csv")]
    pub table_out: String,
    /// Log file path (optional)
    #[arg(short = 'l', long = "log")]
    pub log: Option<String>,
}

impl Default for MultiviewArgs {
    fn default() -> Self {
        Self {
            mapped_in: "data/processed/mapped_cells.csv".to_string(),
            table_out: "reports/cell_table.csv".to_string(),
            log: None,
        }
    }
}

/// Column projection for the fused table: identifiers first, then the
/// morphology view, then every barcode/projection column in input order.
pub fn project_columns(mapped: &Table) -> Result<(Vec<String>, Vec<Vec<String>>), Box<dyn Error>> {
    let mut keep: Vec<usize> = Vec::new();
    for name in ["seg_id", "gt_cell_id", "true_type"] {
        keep.push(mapped.col(name)?);
    }
    for name in MORPH_COLS {
        keep.push(mapped.col(name)?);
    }
    let view2: Vec<usize> = mapped
        .header
        .iter()
        .enumerate()
        .filter(|(_, name)| name.starts_with("bar_") || name.starts_with("prj_"))
        .map(|(idx, _)| idx)
        .collect();
    keep.extend(view2.iter().copied());

    let header: Vec<String> = keep.iter().map(|&c| mapped.header[c].clone()).collect();
    let rows: Vec<Vec<String>> = mapped
        .rows
        .iter()
        .map(|row| keep.iter().map(|&c| row[c].clone()).collect())
        .collect();
    Ok((header, rows))
}

pub fn run(args: &MultiviewArgs) -> Result<(), Box<dyn Error>> {
    let start_time = Instant::now();

    let log_file = match &args.log {
        Some(path) => std::fs::File::create(path)?,
        None => std::fs::File::create("multiview.log")?,
    };
    let mut logger = crate::Logger::new(log_file);
    logger.log("=== SynthLab Multiview Stage Log ===")?;
    logger.log(&format!("Software Version: v{}", crate::VERSION))?;
    logger.log(&format!("Input: {}", args.mapped_in))?;

    println!("[Loading data]");
    println!("    Mapped cells: {}", args.mapped_in);
    println!();

    let mapped = Table::read(&args.mapped_in)?;
    let (header, rows) = project_columns(&mapped)?;
    io::write_table(&args.table_out, &header, &rows)?;

    let n_view2 = header
        .iter()
        .filter(|name| name.starts_with("bar_") || name.starts_with("prj_"))
        .count();

    let mut metrics = StageMetrics::new("multiview");
    metrics.set("n_cells", rows.len());
    metrics.set("view1_columns", MORPH_COLS.len());
    metrics.set("view2_columns", n_view2);
    metrics.write()?;

    let elapsed = start_time.elapsed();
    println!("[Output]");
    println!(
        "    Fused table: {} ({} x {})",
        args.table_out,
        rows.len(),
        header.len()
    );
    println!(
        "    View1 cols: {} | View2 cols: {}",
        MORPH_COLS.len(),
        n_view2
    );
    println!("{}", progress::format_time_used(elapsed));

    logger.log(&format!(
        "Fused table written: {} rows, {} columns",
        rows.len(),
        header.len()
    ))?;
    logger.log(&format!("Total time: {:.2}s", elapsed.as_secs_f64()))?;

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_table() -> Table {
        Table {
            path: "mapped.csv".to_string(),
            header: [
                "seg_id",
                "area",
                "eccentricity",
                "perimeter",
                "solidity",
                "mean_intensity",
                "max_intensity",
                "gt_cell_id",
                "true_type",
                "bar_1",
                "prj_1",
            ]
            .iter()
            .map(|s| s.to_string())
            .collect(),
            rows: vec![[
                "1", "40.0", "0.2", "24.0", "0.95", "0.6", "0.9", "3", "1", "0.12", "-0.5",
            ]
            .iter()
            .map(|s| s.to_string())
            .collect()],
        }
    }

    #[test]
    fn projects_identifier_morphology_and_view_columns() {
        let (header, rows) = project_columns(&sample_table()).unwrap();
        assert_eq!(
            header,
            vec![
                "seg_id",
                "gt_cell_id",
                "true_type",
                "area",
                "eccentricity",
                "perimeter",
                "solidity",
                "mean_intensity",
                "max_intensity",
                "bar_1",
                "prj_1"
            ]
        );
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0][0], "1");
        assert_eq!(rows[0][1], "3");
        assert_eq!(rows[0][10], "-0.5");
    }

    #[test]
    fn missing_identifier_column_is_an_error() {
        let mut table = sample_table();
        table.header[0] = "region".to_string();
        let err = project_columns(&table).unwrap_err();
        assert!(err.to_string().contains("seg_id"));
    }
}
