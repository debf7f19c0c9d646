//! Per-patient journey sequences and the fixed-schema feature table derived
//! from them. Every run emits the same columns in the same order: five early
//! event slots one-hot over the vocabulary plus NONE, and the complete
//! transition-count grid with absent transitions at zero.

use chrono::NaiveDateTime;
use clap::Args;
use std::collections::BTreeMap;
use std::error::Error;
use std::time::Instant;

use crate::ehr::{event_index, EVENTS, TIMESTAMP_FORMAT};
use crate::io::{self, StageMetrics, Table};
use crate::progress;

pub const EARLY_SLOTS: usize = 5;
pub const NONE_TOKEN: &str = "NONE";

#[derive(Args, Debug, Clone)]
pub struct SequenceArgs {
    /// Input event log
    #[arg(short = 'i', long = "input", default_value = "data/raw/event_log.csv")]
    pub log_in: String,
    /// Output journey sequence table
    #[arg(long = "journeys", default_value = "data/processed/journeys.csv")]
    pub journeys_out: String,
    /// Output journey feature table
    #[arg(short = 'o', long = "features", default_value = "reports/journey_features.csv")]
    pub features_out: String,
    /// Log file path (optional)
    #[arg(short = 'l', long = "log")]
    pub log: Option<String>,
}

impl Default for SequenceArgs {
    fn default() -> Self {
        Self {
            log_in: "data/raw/event_log.csv".to_string(),
            journeys_out: "data/processed/journeys.csv".to_string(),
            features_out: "reports/journey_features.csv".to_string(),
            log: None,
        }
    }
}

/// Counts of each directed transition over the vocabulary. Unknown event
/// names contribute nothing.
pub fn transition_grid(events: &[String]) -> [[u32; 10]; 10] {
    let mut grid = [[0u32; 10]; 10];
    for pair in events.windows(2) {
        if let (Some(a), Some(b)) = (event_index(&pair[0]), event_index(&pair[1])) {
            grid[a][b] += 1;
        }
    }
    grid
}

/// The first `EARLY_SLOTS` events, padded with NONE for short journeys.
pub fn early_tokens(events: &[String]) -> Vec<String> {
    (0..EARLY_SLOTS)
        .map(|i| {
            events
                .get(i)
                .cloned()
                .unwrap_or_else(|| NONE_TOKEN.to_string())
        })
        .collect()
}

/// The fixed feature header shared by this stage and its consumers.
pub fn feature_header() -> Vec<String> {
    let mut header: Vec<String> = [
        "patient_id",
        "admitted",
        "age",
        "sex_M",
        "deprivation",
        "n_events",
        "wait_time_min",
        "los_min",
    ]
    .iter()
    .map(|s| s.to_string())
    .collect();
    for i in 1..=EARLY_SLOTS {
        header.push(format!("early_event_{}", i));
    }
    for i in 1..=EARLY_SLOTS {
        for token in EVENTS.iter().chain(std::iter::once(&NONE_TOKEN)) {
            header.push(format!("early{}_{}", i, token));
        }
    }
    for a in EVENTS {
        for b in EVENTS {
            header.push(format!("trans_{}->{}", a, b));
        }
    }
    header
}

struct PatientGroup {
    events: Vec<String>,
    admitted: i64,
    age: i64,
    sex: String,
    deprivation: i64,
    wait_time_min: i64,
    los_min: i64,
}

pub fn run(args: &SequenceArgs) -> Result<(), Box<dyn Error>> {
    let start_time = Instant::now();

    let log_file = match &args.log {
        Some(path) => std::fs::File::create(path)?,
        None => std::fs::File::create("sequences.log")?,
    };
    let mut logger = crate::Logger::new(log_file);
    logger.log("=== SynthLab Sequences Stage Log ===")?;
    logger.log(&format!("Software Version: v{}", crate::VERSION))?;
    logger.log(&format!("Input: {}", args.log_in))?;

    println!("[Loading data]");
    println!("    Event log: {}", args.log_in);
    println!();

    let table = Table::read(&args.log_in)?;
    let c_pid = table.col("patient_id")?;
    let c_ts = table.col("timestamp")?;
    let c_event = table.col("event")?;
    let c_age = table.col("age")?;
    let c_sex = table.col("sex")?;
    let c_dep = table.col("deprivation")?;
    let c_adm = table.col("admitted")?;
    let c_wait = table.col("wait_time_min")?;

    // Group by patient, ordering events by timestamp within each group.
    let mut grouped: BTreeMap<String, Vec<(NaiveDateTime, usize)>> = BTreeMap::new();
    for row in 0..table.rows.len() {
        let ts = NaiveDateTime::parse_from_str(&table.rows[row][c_ts], TIMESTAMP_FORMAT)
            .map_err(|e| format!("Error: bad timestamp on line {}: {}", row + 2, e))?;
        grouped
            .entry(table.rows[row][c_pid].clone())
            .or_default()
            .push((ts, row));
    }

    let mut patients: Vec<(String, PatientGroup)> = Vec::with_capacity(grouped.len());
    for (pid, mut stamped) in grouped {
        stamped.sort_by_key(|&(ts, _)| ts);
        let first = stamped[0].1;
        let t0 = stamped[0].0;
        let t_end = stamped[stamped.len() - 1].0;
        let events: Vec<String> = stamped
            .iter()
            .map(|&(_, row)| table.rows[row][c_event].clone())
            .collect();
        patients.push((
            pid,
            PatientGroup {
                events,
                admitted: table.i64_at(first, c_adm)?,
                age: table.i64_at(first, c_age)?,
                sex: table.rows[first][c_sex].clone(),
                deprivation: table.i64_at(first, c_dep)?,
                wait_time_min: table.i64_at(first, c_wait)?,
                los_min: (t_end - t0).num_minutes(),
            },
        ));
    }

    println!("[Processing] Building sequences for {} patients...", patients.len());

    let journey_header: Vec<String> = [
        "patient_id",
        "events",
        "n_events",
        "admitted",
        "age",
        "sex",
        "deprivation",
        "wait_time_min",
        "los_min",
    ]
    .iter()
    .map(|s| s.to_string())
    .collect();
    let journey_rows: Vec<Vec<String>> = patients
        .iter()
        .map(|(pid, g)| {
            vec![
                pid.clone(),
                g.events.join(" | "),
                g.events.len().to_string(),
                g.admitted.to_string(),
                g.age.to_string(),
                g.sex.clone(),
                g.deprivation.to_string(),
                g.wait_time_min.to_string(),
                g.los_min.to_string(),
            ]
        })
        .collect();
    io::write_table(&args.journeys_out, &journey_header, &journey_rows)?;

    let header = feature_header();
    let mut feature_rows: Vec<Vec<String>> = Vec::with_capacity(patients.len());
    for (pid, g) in &patients {
        let mut row: Vec<String> = vec![
            pid.clone(),
            g.admitted.to_string(),
            g.age.to_string(),
            if g.sex == "M" { "1" } else { "0" }.to_string(),
            g.deprivation.to_string(),
            g.events.len().to_string(),
            g.wait_time_min.to_string(),
            g.los_min.to_string(),
        ];
        let early = early_tokens(&g.events);
        for token in &early {
            row.push(token.clone());
        }
        for token in &early {
            for vocab in EVENTS.iter().chain(std::iter::once(&NONE_TOKEN)) {
                row.push(if token == vocab { "1" } else { "0" }.to_string());
            }
        }
        let grid = transition_grid(&g.events);
        for grid_row in &grid {
            for &count in grid_row {
                row.push(count.to_string());
            }
        }
        feature_rows.push(row);
    }
    io::write_table(&args.features_out, &header, &feature_rows)?;

    let mut metrics = StageMetrics::new("sequences");
    metrics.set("n_patients", patients.len());
    metrics.set("n_feature_columns", header.len());
    metrics.write()?;

    let elapsed = start_time.elapsed();
    println!("[Output]");
    println!("    Journeys: {} ({})", args.journeys_out, journey_rows.len());
    println!(
        "    Features: {} ({} x {})",
        args.features_out,
        feature_rows.len(),
        header.len()
    );
    println!("{}", progress::format_time_used(elapsed));

    logger.log(&format!(
        "Sequences written: {} patients, {} feature columns",
        patients.len(),
        header.len()
    ))?;
    logger.log(&format!("Total time: {:.2}s", elapsed.as_secs_f64()))?;

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ev(names: &[&str]) -> Vec<String> {
        names.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn transition_counts_cover_every_adjacent_pair() {
        let events = ev(&["ED_ARRIVAL", "TRIAGE", "VITALS", "TREATMENT", "DISCHARGE"]);
        let grid = transition_grid(&events);
        let total: u32 = grid.iter().flat_map(|r| r.iter()).sum();
        assert_eq!(total as usize, events.len() - 1);
        assert_eq!(grid[0][1], 1); // ED_ARRIVAL -> TRIAGE
        assert_eq!(grid[1][2], 1); // TRIAGE -> VITALS
    }

    #[test]
    fn repeated_transitions_accumulate() {
        let events = ev(&["VITALS", "LABS", "VITALS", "LABS"]);
        let grid = transition_grid(&events);
        assert_eq!(grid[2][3], 2);
        assert_eq!(grid[3][2], 1);
    }

    #[test]
    fn short_journeys_pad_early_slots_with_none() {
        let events = ev(&["ED_ARRIVAL", "TRIAGE", "VITALS"]);
        let early = early_tokens(&events);
        assert_eq!(early.len(), EARLY_SLOTS);
        assert_eq!(early[2], "VITALS");
        assert_eq!(early[3], NONE_TOKEN);
        assert_eq!(early[4], NONE_TOKEN);
    }

    #[test]
    fn feature_header_has_the_fixed_width() {
        let header = feature_header();
        // 8 base + 5 early tokens + 5*11 one-hots + 10*10 transitions.
        assert_eq!(header.len(), 8 + 5 + 55 + 100);
        assert_eq!(header[0], "patient_id");
        assert!(header.contains(&"early1_ED_ARRIVAL".to_string()));
        assert!(header.contains(&"early5_NONE".to_string()));
        assert!(header.contains(&"trans_ED_ARRIVAL->TRIAGE".to_string()));
        assert_eq!(header.last().unwrap(), "trans_ADMIT->ADMIT");
    }
}
