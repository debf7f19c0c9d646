//! Synthetic unscheduled-care event log. A latent severity score per patient
//! drives which optional steps the journey takes, how long the gaps between
//! events run, and the admission outcome at the end.

use chrono::{Duration, NaiveDate, NaiveDateTime};
use clap::Args;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use rand_distr::{Distribution, Normal};
use std::error::Error;
use std::time::Instant;

use crate::io::{self, StageMetrics};
use crate::progress;

/// Event vocabulary, in canonical service order.
pub const EVENTS: [&str; 10] = [
    "ED_ARRIVAL",
    "TRIAGE",
    "VITALS",
    "LABS",
    "IMAGING",
    "TREATMENT",
    "OBSERVATION",
    "SPECIALIST_REVIEW",
    "DISCHARGE",
    "ADMIT",
];

pub const TIMESTAMP_FORMAT: &str = "%Y-%m-%d %H:%M:%S";

/// Canonical index of an event name, if it belongs to the vocabulary.
pub fn event_index(name: &str) -> Option<usize> {
    EVENTS.iter().position(|&e| e == name)
}

#[derive(Args, Debug, Clone)]
pub struct EhrArgs {
    /// Number of synthetic patients
    #[arg(short = 'n', long = "patients", default_value_t = 1200)]
    pub n_patients: usize,
    /// Random seed
    #[arg(long = "seed", default_value_t = 42)]
    pub seed: u64,
    /// Output event log path
    #[arg(short = 'o', long = "output", default_value = "data/raw/event_log.csv")]
    pub log_out: String,
    /// Log file path (optional)
    #[arg(short = 'l', long = "log")]
    pub log: Option<String>,
}

impl Default for EhrArgs {
    fn default() -> Self {
        Self {
            n_patients: 1200,
            seed: 42,
            log_out: "data/raw/event_log.csv".to_string(),
            log: None,
        }
    }
}

fn validate_ehr_args(args: &EhrArgs) -> Result<(), Box<dyn Error>> {
    if args.n_patients == 0 {
        return Err("Error: patient count must be at least 1".into());
    }
    Ok(())
}

#[derive(Debug, Clone)]
pub struct PatientJourney {
    pub patient_id: String,
    pub age: i64,
    pub sex: char,
    pub deprivation: i64,
    pub severity: f64,
    pub admitted: bool,
    pub events: Vec<(&'static str, NaiveDateTime)>,
    pub wait_time_min: i64,
    pub los_min: i64,
}

fn sigmoid(x: f64) -> f64 {
    1.0 / (1.0 + (-x).exp())
}

fn sample_journey(
    rng: &mut StdRng,
    severity_dist: &Normal<f64>,
    patient_id: String,
    base_time: NaiveDateTime,
    age: i64,
    sex: char,
    deprivation: i64,
) -> PatientJourney {
    let mut severity = severity_dist.sample(rng).clamp(-2.5, 2.5);
    severity += 0.015 * (age - 50) as f64 + 0.12 * (deprivation - 3) as f64;

    let mut names: Vec<&'static str> = vec!["ED_ARRIVAL", "TRIAGE", "VITALS"];
    if rng.gen::<f64>() < sigmoid(severity - 0.1) {
        names.push("LABS");
    }
    if rng.gen::<f64>() < sigmoid(severity - 0.3) {
        names.push("IMAGING");
    }
    names.push("TREATMENT");
    if rng.gen::<f64>() < sigmoid(severity - 0.2) {
        names.push("OBSERVATION");
    }
    if rng.gen::<f64>() < sigmoid(severity - 0.6) {
        names.push("SPECIALIST_REVIEW");
    }
    let admitted = rng.gen::<f64>() < sigmoid(severity - 0.4);
    names.push(if admitted { "ADMIT" } else { "DISCHARGE" });

    // Severity stretches every gap, never shrinks one.
    let complexity = 1.0 + 0.25 * severity.max(0.0);
    let mut t = base_time;
    let mut events: Vec<(&'static str, NaiveDateTime)> = Vec::with_capacity(names.len());
    for (i, &name) in names.iter().enumerate() {
        if i > 0 {
            let base_gap = rng.gen_range(8..35) as f64;
            t += Duration::minutes((base_gap * complexity) as i64);
        }
        events.push((name, t));
    }

    let wait_time_min = (events[1].1 - events[0].1).num_minutes();
    let los_min = (events[events.len() - 1].1 - events[0].1).num_minutes();

    PatientJourney {
        patient_id,
        age,
        sex,
        deprivation,
        severity,
        admitted,
        events,
        wait_time_min,
        los_min,
    }
}

/// All patient journeys for one seeded run, ordered by patient id.
pub fn synthesize_journeys(args: &EhrArgs) -> Result<Vec<PatientJourney>, Box<dyn Error>> {
    let mut rng = StdRng::seed_from_u64(args.seed);
    let severity_dist = Normal::new(0.0, 1.0)?;
    let start = NaiveDate::from_ymd_opt(2024, 1, 1)
        .and_then(|d| d.and_hms_opt(8, 0, 0))
        .ok_or("Error: invalid base timestamp")?;

    // Demographics are drawn for the whole cohort before any journey, so the
    // cohort composition does not depend on journey lengths.
    let mut demographics: Vec<(i64, char, i64)> = Vec::with_capacity(args.n_patients);
    for _ in 0..args.n_patients {
        let age = rng.gen_range(18..92);
        let sex = if rng.gen::<f64>() < 0.52 { 'F' } else { 'M' };
        let deprivation = rng.gen_range(1..6);
        demographics.push((age, sex, deprivation));
    }

    let mut progress = progress::SimpleProgress::new(args.n_patients);
    let mut journeys = Vec::with_capacity(args.n_patients);
    for (i, &(age, sex, deprivation)) in demographics.iter().enumerate() {
        let base_time = start
            + Duration::days(rng.gen_range(0..180))
            + Duration::minutes(rng.gen_range(0..24 * 60));
        journeys.push(sample_journey(
            &mut rng,
            &severity_dist,
            format!("P{:05}", i),
            base_time,
            age,
            sex,
            deprivation,
        ));
        progress.update(i + 1)?;
    }
    progress.finish()?;
    Ok(journeys)
}

pub fn run(args: &EhrArgs) -> Result<(), Box<dyn Error>> {
    validate_ehr_args(args)?;
    let start_time = Instant::now();

    let log_file = match &args.log {
        Some(path) => std::fs::File::create(path)?,
        None => std::fs::File::create("generate_ehr.log")?,
    };
    let mut logger = crate::Logger::new(log_file);
    logger.log("=== SynthLab EHR Generation Log ===")?;
    logger.log(&format!("Software Version: v{}", crate::VERSION))?;
    logger.log(&format!(
        "Patients: {}, seed: {}",
        args.n_patients, args.seed
    ))?;

    println!("[Params]");
    println!("    Patients: {}.", args.n_patients);
    println!("    Seed: {}.", args.seed);
    println!();

    println!("[Processing] Sampling {} patient journeys...", args.n_patients);
    let mut journeys = synthesize_journeys(args)?;
    journeys.sort_by(|a, b| a.patient_id.cmp(&b.patient_id));

    let header: Vec<String> = [
        "patient_id",
        "timestamp",
        "event",
        "age",
        "sex",
        "deprivation",
        "latent_severity",
        "admitted",
        "wait_time_min",
        "los_min",
    ]
    .iter()
    .map(|s| s.to_string())
    .collect();

    let mut rows: Vec<Vec<String>> = Vec::new();
    let mut n_admitted = 0usize;
    for journey in &journeys {
        if journey.admitted {
            n_admitted += 1;
        }
        for &(event, t) in &journey.events {
            rows.push(vec![
                journey.patient_id.clone(),
                t.format(TIMESTAMP_FORMAT).to_string(),
                event.to_string(),
                journey.age.to_string(),
                journey.sex.to_string(),
                journey.deprivation.to_string(),
                format!("{:.6}", journey.severity),
                (journey.admitted as i64).to_string(),
                journey.wait_time_min.to_string(),
                journey.los_min.to_string(),
            ]);
        }
    }
    io::write_table(&args.log_out, &header, &rows)?;

    let mut metrics = StageMetrics::new("generate_ehr");
    metrics.set("n_patients", journeys.len());
    metrics.set("n_events", rows.len());
    metrics.set("n_admitted", n_admitted);
    metrics.set(
        "admission_rate",
        n_admitted as f64 / journeys.len() as f64,
    );
    metrics.write()?;

    let elapsed = start_time.elapsed();
    println!("[Output]");
    println!(
        "    Event log: {} ({} rows, {} patients)",
        args.log_out,
        rows.len(),
        journeys.len()
    );
    println!(
        "    Admission rate: {:.3}",
        n_admitted as f64 / journeys.len() as f64
    );
    println!("{}", progress::format_time_used(elapsed));

    logger.log(&format!(
        "Event log written: {} rows, {} admitted",
        rows.len(),
        n_admitted
    ))?;
    logger.log(&format!("Total time: {:.2}s", elapsed.as_secs_f64()))?;

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn small_cohort() -> Vec<PatientJourney> {
        let args = EhrArgs {
            n_patients: 50,
            ..EhrArgs::default()
        };
        synthesize_journeys(&args).unwrap()
    }

    #[test]
    fn every_journey_follows_the_mandatory_spine() {
        for journey in small_cohort() {
            let names: Vec<&str> = journey.events.iter().map(|&(e, _)| e).collect();
            assert_eq!(&names[..3], &["ED_ARRIVAL", "TRIAGE", "VITALS"]);
            assert!(names.contains(&"TREATMENT"));
            let last = *names.last().unwrap();
            assert!(last == "ADMIT" || last == "DISCHARGE");
            assert_eq!(last == "ADMIT", journey.admitted);
            assert!(names.len() >= 5 && names.len() <= 9);
        }
    }

    #[test]
    fn timestamps_are_strictly_increasing_after_arrival() {
        for journey in small_cohort() {
            for pair in journey.events.windows(2) {
                assert!(pair[1].1 > pair[0].1);
            }
        }
    }

    #[test]
    fn wait_and_los_match_the_timeline() {
        for journey in small_cohort() {
            let first = journey.events[0].1;
            let second = journey.events[1].1;
            let last = journey.events[journey.events.len() - 1].1;
            assert_eq!(journey.wait_time_min, (second - first).num_minutes());
            assert_eq!(journey.los_min, (last - first).num_minutes());
            assert!(journey.wait_time_min >= 8);
            assert!(journey.los_min >= journey.wait_time_min);
        }
    }

    #[test]
    fn same_seed_reproduces_the_cohort() {
        let a = small_cohort();
        let b = small_cohort();
        assert_eq!(a.len(), b.len());
        for (x, y) in a.iter().zip(b.iter()) {
            assert_eq!(x.patient_id, y.patient_id);
            assert_eq!(x.admitted, y.admitted);
            assert_eq!(x.events, y.events);
            assert!((x.severity - y.severity).abs() < 1e-12);
        }
    }

    #[test]
    fn all_event_names_belong_to_the_vocabulary() {
        for journey in small_cohort() {
            for &(event, _) in &journey.events {
                assert!(event_index(event).is_some(), "unknown event {}", event);
            }
        }
    }
}
