//! Cohort-level pathway structure: the global event transition matrix as a
//! heatmap, and the heaviest flows as a self-contained Sankey HTML document.

use chrono::NaiveDateTime;
use clap::Args;
use plotters::prelude::*;
use std::collections::BTreeMap;
use std::error::Error;
use std::fmt::Write as _;
use std::io::Write as _;
use std::time::Instant;

use crate::ehr::{event_index, EVENTS, TIMESTAMP_FORMAT};
use crate::io::{self, StageMetrics, Table};
use crate::progress;

#[derive(Args, Debug, Clone)]
pub struct PathwayArgs {
    /// Input event log
    #[arg(short = 'i', long = "input", default_value = "data/raw/event_log.csv")]
    pub log_in: String,
    /// Heatmap figure path
    #[arg(long = "heatmap", default_value = "figures/transition_heatmap.png")]
    pub heatmap_out: String,
    /// Sankey HTML path
    #[arg(long = "sankey", default_value = "reports/sankey_pathways.html")]
    pub sankey_out: String,
    /// Number of flows kept in the Sankey diagram
    #[arg(long = "top-flows", default_value_t = 30)]
    pub top_flows: usize,
    /// Log file path (optional)
    #[arg(short = 'l', long = "log")]
    pub log: Option<String>,
}

impl Default for PathwayArgs {
    fn default() -> Self {
        Self {
            log_in: "data/raw/event_log.csv".to_string(),
            heatmap_out: "figures/transition_heatmap.png".to_string(),
            sankey_out: "reports/sankey_pathways.html".to_string(),
            top_flows: 30,
            log: None,
        }
    }
}

/// Transition counts pooled over every patient, events ordered by timestamp
/// within each patient.
pub fn global_transition_matrix(table: &Table) -> Result<[[u64; 10]; 10], Box<dyn Error>> {
    let c_pid = table.col("patient_id")?;
    let c_ts = table.col("timestamp")?;
    let c_event = table.col("event")?;

    let mut grouped: BTreeMap<String, Vec<(NaiveDateTime, usize)>> = BTreeMap::new();
    for row in 0..table.rows.len() {
        let ts = NaiveDateTime::parse_from_str(&table.rows[row][c_ts], TIMESTAMP_FORMAT)
            .map_err(|e| format!("Error: bad timestamp on line {}: {}", row + 2, e))?;
        grouped
            .entry(table.rows[row][c_pid].clone())
            .or_default()
            .push((ts, row));
    }

    let mut counts = [[0u64; 10]; 10];
    for (_, mut stamped) in grouped {
        stamped.sort_by_key(|&(ts, _)| ts);
        for pair in stamped.windows(2) {
            let a = &table.rows[pair[0].1][c_event];
            let b = &table.rows[pair[1].1][c_event];
            if let (Some(i), Some(j)) = (event_index(a), event_index(b)) {
                counts[i][j] += 1;
            }
        }
    }
    Ok(counts)
}

/// Flows sorted heaviest first, zero-count pairs excluded.
pub fn ranked_flows(counts: &[[u64; 10]; 10]) -> Vec<(usize, usize, u64)> {
    let mut flows: Vec<(usize, usize, u64)> = Vec::new();
    for (i, row) in counts.iter().enumerate() {
        for (j, &v) in row.iter().enumerate() {
            if v > 0 {
                flows.push((i, j, v));
            }
        }
    }
    flows.sort_by(|a, b| b.2.cmp(&a.2).then_with(|| (a.0, a.1).cmp(&(b.0, b.1))));
    flows
}

fn plot_heatmap(path: &str, counts: &[[u64; 10]; 10]) -> Result<(), Box<dyn Error>> {
    io::ensure_parent_dir(path)?;
    let n = EVENTS.len();
    let max_count = counts
        .iter()
        .flat_map(|row| row.iter())
        .copied()
        .max()
        .unwrap_or(1)
        .max(1);

    let root = BitMapBackend::new(path, (1200, 800)).into_drawing_area();
    root.fill(&WHITE)?;
    let root = root.margin(10, 10, 10, 10);

    let mut chart = ChartBuilder::on(&root)
        .caption("Transition heatmap (synthetic journeys)", ("sans-serif", 30))
        .x_label_area_size(120)
        .y_label_area_size(140)
        .build_cartesian_2d(0..n as i32, 0..n as i32)?;

    chart
        .configure_mesh()
        .disable_mesh()
        .x_labels(n)
        .y_labels(n)
        .x_label_formatter(&|x| {
            EVENTS
                .get(*x as usize)
                .map(|s| s.to_string())
                .unwrap_or_default()
        })
        .y_label_formatter(&|y| {
            let idx = n as i32 - 1 - *y;
            EVENTS
                .get(idx as usize)
                .map(|s| s.to_string())
                .unwrap_or_default()
        })
        .x_desc("To event")
        .y_desc("From event")
        .draw()?;

    for (i, row) in counts.iter().enumerate() {
        for (j, &count) in row.iter().enumerate() {
            let level = (count as f64 / max_count as f64 * 255.0) as u8;
            let color = RGBColor(255 - level, 255 - level, 255);
            let y = (n - 1 - i) as i32;
            chart.draw_series(std::iter::once(Rectangle::new(
                [(j as i32, y), (j as i32 + 1, y + 1)],
                color.filled(),
            )))?;
        }
    }

    root.present()?;
    Ok(())
}

fn write_sankey_html(
    path: &str,
    flows: &[(usize, usize, u64)],
) -> Result<(), Box<dyn Error>> {
    io::ensure_parent_dir(path)?;
    let labels: Vec<String> = EVENTS.iter().map(|e| format!("\"{}\"", e)).collect();
    let mut src = String::new();
    let mut tgt = String::new();
    let mut val = String::new();
    for (k, &(i, j, v)) in flows.iter().enumerate() {
        if k > 0 {
            src.push(',');
            tgt.push(',');
            val.push(',');
        }
        write!(src, "{}", i)?;
        write!(tgt, "{}", j)?;
        write!(val, "{}", v)?;
    }

    let html = format!(
        "<!DOCTYPE html>\n<html>\n<head>\n<meta charset=\"utf-8\"/>\n\
         <title>Pathway flows</title>\n\
         <script src=\"https://cdn.plot.ly/plotly-2.32.0.min.js\"></script>\n\
         </head>\n<body>\n<div id=\"sankey\"></div>\n<script>\n\
         var data = [{{\n  type: \"sankey\",\n\
         \x20 node: {{pad: 15, thickness: 20, line: {{width: 0.5}}, label: [{labels}]}},\n\
         \x20 link: {{source: [{src}], target: [{tgt}], value: [{val}]}}\n}}];\n\
         var layout = {{title: \"Top unscheduled-care pathway flows (synthetic)\", font: {{size: 11}}}};\n\
         Plotly.newPlot(\"sankey\", data, layout);\n\
         </script>\n</body>\n</html>\n",
        labels = labels.join(","),
        src = src,
        tgt = tgt,
        val = val,
    );
    let mut out = std::io::BufWriter::new(std::fs::File::create(path)?);
    out.write_all(html.as_bytes())?;
    out.flush()?;
    Ok(())
}

pub fn run(args: &PathwayArgs) -> Result<(), Box<dyn Error>> {
    let start_time = Instant::now();

    let log_file = match &args.log {
        Some(path) => std::fs::File::create(path)?,
        None => std::fs::File::create("pathways.log")?,
    };
    let mut logger = crate::Logger::new(log_file);
    logger.log("=== SynthLab Pathways Stage Log ===")?;
    logger.log(&format!("Software Version: v{}", crate::VERSION))?;
    logger.log(&format!("Input: {}", args.log_in))?;

    println!("[Loading data]");
    println!("    Event log: {}", args.log_in);
    println!();

    let table = Table::read(&args.log_in)?;
    println!("[Processing] Pooling transitions over the cohort...");
    let counts = global_transition_matrix(&table)?;
    let flows = ranked_flows(&counts);
    let top: Vec<(usize, usize, u64)> = flows.iter().take(args.top_flows).copied().collect();

    plot_heatmap(&args.heatmap_out, &counts)?;
    write_sankey_html(&args.sankey_out, &top)?;

    let total_transitions: u64 = counts.iter().flat_map(|r| r.iter()).sum();
    let mut metrics = StageMetrics::new("pathways");
    metrics.set("total_transitions", total_transitions);
    metrics.set("distinct_transitions", flows.len());
    metrics.set("sankey_flows", top.len());
    metrics.write()?;

    let elapsed = start_time.elapsed();
    println!("[Output]");
    println!("    Heatmap: {}", args.heatmap_out);
    println!("    Sankey: {} ({} flows)", args.sankey_out, top.len());
    println!("{}", progress::format_time_used(elapsed));

    logger.log(&format!(
        "{} transitions pooled, {} distinct, {} kept for Sankey",
        total_transitions,
        flows.len(),
        top.len()
    ))?;
    logger.log(&format!("Total time: {:.2}s", elapsed.as_secs_f64()))?;

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn log_table(rows: &[(&str, &str, &str)]) -> Table {
        Table {
            path: "event_log.csv".to_string(),
            header: ["patient_id", "timestamp", "event"]
                .iter()
                .map(|s| s.to_string())
                .collect(),
            rows: rows
                .iter()
                .map(|&(p, t, e)| vec![p.to_string(), t.to_string(), e.to_string()])
                .collect(),
        }
    }

    #[test]
    fn transitions_never_cross_patients() {
        let table = log_table(&[
            ("P1", "2024-01-01 08:00:00", "ED_ARRIVAL"),
            ("P1", "2024-01-01 08:20:00", "TRIAGE"),
            ("P2", "2024-01-01 09:00:00", "ED_ARRIVAL"),
            ("P2", "2024-01-01 09:15:00", "TRIAGE"),
        ]);
        let counts = global_transition_matrix(&table).unwrap();
        let total: u64 = counts.iter().flat_map(|r| r.iter()).sum();
        assert_eq!(total, 2);
        assert_eq!(counts[0][1], 2);
    }

    #[test]
    fn out_of_order_rows_are_sorted_by_timestamp() {
        let table = log_table(&[
            ("P1", "2024-01-01 08:20:00", "TRIAGE"),
            ("P1", "2024-01-01 08:00:00", "ED_ARRIVAL"),
        ]);
        let counts = global_transition_matrix(&table).unwrap();
        assert_eq!(counts[0][1], 1);
        assert_eq!(counts[1][0], 0);
    }

    #[test]
    fn flows_rank_heaviest_first() {
        let mut counts = [[0u64; 10]; 10];
        counts[0][1] = 5;
        counts[1][2] = 9;
        counts[2][5] = 1;
        let flows = ranked_flows(&counts);
        assert_eq!(flows[0], (1, 2, 9));
        assert_eq!(flows[1], (0, 1, 5));
        assert_eq!(flows.len(), 3);
    }
}
