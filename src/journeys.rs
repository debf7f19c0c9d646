//! Journey typologies: k-means over scaled transition counts, early-event
//! indicators and selected demographics, with per-cluster admission and
//! waiting-time profiles.

use aprender::prelude::*;
use clap::Args;
use plotters::prelude::*;
use std::error::Error;
use std::time::Instant;

use crate::io::{self, StageMetrics, Table};
use crate::progress;

#[derive(Args, Debug, Clone)]
pub struct JourneyArgs {
    /// Input journey feature table
    #[arg(short = 'i', long = "input", default_value = "reports/journey_features.csv")]
    pub features_in: String,
    /// Output per-patient assignment table
    #[arg(short = 'o', long = "output", default_value = "reports/journey_clusters.csv")]
    pub assign_out: String,
    /// Output per-cluster summary table
    #[arg(long = "summary", default_value = "reports/journey_cluster_summary.csv")]
    pub summary_out: String,
    /// Cluster profile figure
    #[arg(long = "figure", default_value = "figures/cluster_profiles.png")]
    pub fig_out: String,
    /// Number of clusters
    #[arg(short = 'k', long = "clusters", default_value_t = 5)]
    pub k: usize,
    /// Random seed for the k-means fit
    #[arg(long = "seed", default_value_t = 42)]
    pub seed: u64,
    /// Log file path (optional)
    #[arg(short = 'l', long = "log")]
    pub log: Option<String>,
}

impl Default for JourneyArgs {
    fn default() -> Self {
        Self {
            features_in: "reports/journey_features.csv".to_string(),
            assign_out: "reports/journey_clusters.csv".to_string(),
            summary_out: "reports/journey_cluster_summary.csv".to_string(),
            fig_out: "figures/cluster_profiles.png".to_string(),
            k: 5,
            seed: 42,
            log: None,
        }
    }
}

fn validate_journey_args(args: &JourneyArgs) -> Result<(), Box<dyn Error>> {
    if args.k == 0 {
        return Err("Error: cluster count must be at least 1".into());
    }
    Ok(())
}

/// Scale-only standardization: each column is divided by its spread, means are
/// left alone so the sparse indicator columns keep their zeros.
pub fn scale_columns(data: &mut [Vec<f64>]) {
    if data.is_empty() {
        return;
    }
    let n = data.len() as f64;
    let d = data[0].len();
    for col in 0..d {
        let mean = data.iter().map(|row| row[col]).sum::<f64>() / n;
        let var = data
            .iter()
            .map(|row| (row[col] - mean).powi(2))
            .sum::<f64>()
            / n;
        let std = var.sqrt();
        if std > 0.0 {
            for row in data.iter_mut() {
                row[col] /= std;
            }
        }
    }
}

/// Whether a feature column participates in the clustering.
pub fn is_clustering_column(name: &str) -> bool {
    name.starts_with("trans_")
        || (name.starts_with("early") && !name.starts_with("early_event_"))
        || matches!(name, "age" | "deprivation" | "n_events" | "wait_time_min")
}

#[derive(Debug, Clone)]
pub struct JourneyRecord {
    pub patient_id: String,
    pub admitted: i64,
    pub age: i64,
    pub deprivation: i64,
    pub n_events: i64,
    pub wait_time_min: i64,
    pub los_min: i64,
}

#[derive(Debug, Clone)]
pub struct ClusterProfile {
    pub cluster: usize,
    pub n: usize,
    pub admit_rate: f64,
    pub avg_events: f64,
    pub avg_wait: f64,
    pub avg_los: f64,
    pub avg_age: f64,
    pub avg_deprivation: f64,
}

/// Per-cluster aggregates in cluster order; empty clusters are skipped.
pub fn summarize_clusters(
    records: &[JourneyRecord],
    labels: &[usize],
    k: usize,
) -> Vec<ClusterProfile> {
    let mut profiles = Vec::new();
    for c in 0..k {
        let members: Vec<usize> = (0..records.len()).filter(|&i| labels[i] == c).collect();
        if members.is_empty() {
            continue;
        }
        let n = members.len() as f64;
        let mean = |f: &dyn Fn(&JourneyRecord) -> f64| -> f64 {
            members.iter().map(|&i| f(&records[i])).sum::<f64>() / n
        };
        profiles.push(ClusterProfile {
            cluster: c,
            n: members.len(),
            admit_rate: mean(&|r| r.admitted as f64),
            avg_events: mean(&|r| r.n_events as f64),
            avg_wait: mean(&|r| r.wait_time_min as f64),
            avg_los: mean(&|r| r.los_min as f64),
            avg_age: mean(&|r| r.age as f64),
            avg_deprivation: mean(&|r| r.deprivation as f64),
        });
    }
    profiles
}

fn plot_profiles(path: &str, profiles: &[ClusterProfile]) -> Result<(), Box<dyn Error>> {
    io::ensure_parent_dir(path)?;
    let root = BitMapBackend::new(path, (1200, 800)).into_drawing_area();
    root.fill(&WHITE)?;
    let root = root.margin(10, 10, 10, 10);

    let max_wait = profiles
        .iter()
        .map(|p| p.avg_wait)
        .fold(0.0f64, f64::max)
        .max(1e-12);
    let n = profiles.len();

    let mut chart = ChartBuilder::on(&root)
        .caption(
            "Journey typologies: admission vs wait time (normalised)",
            ("sans-serif", 30),
        )
        .x_label_area_size(40)
        .y_label_area_size(60)
        .build_cartesian_2d(-0.5f64..n as f64 - 0.5, 0.0f64..1.05f64)?;

    chart
        .configure_mesh()
        .x_labels(n)
        .x_label_formatter(&|x| {
            let idx = x.round() as usize;
            profiles
                .get(idx)
                .map(|p| format!("C{}", p.cluster))
                .unwrap_or_default()
        })
        .y_desc("Rate / normalised wait")
        .draw()?;

    chart
        .draw_series(profiles.iter().enumerate().map(|(i, p)| {
            Rectangle::new(
                [(i as f64 - 0.4, 0.0), (i as f64, p.admit_rate)],
                BLUE.mix(0.7).filled(),
            )
        }))?
        .label("admission rate")
        .legend(|(x, y)| Rectangle::new([(x, y - 5), (x + 10, y + 5)], BLUE.filled()));

    chart
        .draw_series(profiles.iter().enumerate().map(|(i, p)| {
            Rectangle::new(
                [(i as f64, 0.0), (i as f64 + 0.4, p.avg_wait / max_wait)],
                RED.mix(0.7).filled(),
            )
        }))?
        .label("avg wait (norm)")
        .legend(|(x, y)| Rectangle::new([(x, y - 5), (x + 10, y + 5)], RED.filled()));

    chart
        .configure_series_labels()
        .background_style(WHITE.mix(0.8))
        .border_style(BLACK)
        .draw()?;

    root.present()?;
    Ok(())
}

pub fn run(args: &JourneyArgs) -> Result<(), Box<dyn Error>> {
    validate_journey_args(args)?;
    let start_time = Instant::now();

    let log_file = match &args.log {
        Some(path) => std::fs::File::create(path)?,
        None => std::fs::File::create("journeys.log")?,
    };
    let mut logger = crate::Logger::new(log_file);
    logger.log("=== SynthLab Journey Clustering Log ===")?;
    logger.log(&format!("Software Version: v{}", crate::VERSION))?;
    logger.log(&format!("Input: {}", args.features_in))?;
    logger.log(&format!("Clusters: {}, seed: {}", args.k, args.seed))?;

    println!("[Loading data]");
    println!("    Features: {}", args.features_in);
    println!();

    let table = Table::read(&args.features_in)?;
    if table.rows.is_empty() {
        return Err("Error: journey feature table has no rows".into());
    }

    let feature_cols: Vec<usize> = table
        .header
        .iter()
        .enumerate()
        .filter(|(_, name)| is_clustering_column(name))
        .map(|(idx, _)| idx)
        .collect();

    let c_pid = table.col("patient_id")?;
    let c_adm = table.col("admitted")?;
    let c_age = table.col("age")?;
    let c_dep = table.col("deprivation")?;
    let c_nev = table.col("n_events")?;
    let c_wait = table.col("wait_time_min")?;
    let c_los = table.col("los_min")?;

    let n = table.rows.len();
    let d = feature_cols.len();
    let mut records: Vec<JourneyRecord> = Vec::with_capacity(n);
    let mut features: Vec<Vec<f64>> = Vec::with_capacity(n);
    for row in 0..n {
        records.push(JourneyRecord {
            patient_id: table.rows[row][c_pid].clone(),
            admitted: table.i64_at(row, c_adm)?,
            age: table.i64_at(row, c_age)?,
            deprivation: table.i64_at(row, c_dep)?,
            n_events: table.i64_at(row, c_nev)?,
            wait_time_min: table.i64_at(row, c_wait)?,
            los_min: table.i64_at(row, c_los)?,
        });
        let mut rec = Vec::with_capacity(d);
        for &c in &feature_cols {
            rec.push(table.f64_at(row, c)?);
        }
        features.push(rec);
    }

    println!("[Params]");
    println!("    Clusters: {}.", args.k);
    println!("    Features: {} columns over {} patients.", d, n);
    println!();

    scale_columns(&mut features);

    println!("[Processing] Fitting k-means...");
    let flat: Vec<f32> = features.iter().flatten().map(|&v| v as f32).collect();
    let x = Matrix::from_vec(n, d, flat)?;
    let mut kmeans = KMeans::new(args.k)
        .with_max_iter(300)
        .with_random_state(args.seed);
    kmeans.fit(&x)?;
    let labels = kmeans.predict(&x);
    let inertia = kmeans.inertia();
    let silhouette = silhouette_score(&x, &labels);

    let assign_header: Vec<String> = [
        "patient_id",
        "admitted",
        "age",
        "deprivation",
        "n_events",
        "wait_time_min",
        "los_min",
        "cluster",
    ]
    .iter()
    .map(|s| s.to_string())
    .collect();
    let assign_rows: Vec<Vec<String>> = records
        .iter()
        .zip(labels.iter())
        .map(|(r, &c)| {
            vec![
                r.patient_id.clone(),
                r.admitted.to_string(),
                r.age.to_string(),
                r.deprivation.to_string(),
                r.n_events.to_string(),
                r.wait_time_min.to_string(),
                r.los_min.to_string(),
                c.to_string(),
            ]
        })
        .collect();
    io::write_table(&args.assign_out, &assign_header, &assign_rows)?;

    let profiles = summarize_clusters(&records, &labels, args.k);
    let summary_header: Vec<String> = [
        "cluster",
        "n",
        "admit_rate",
        "avg_events",
        "avg_wait",
        "avg_los",
        "avg_age",
        "avg_deprivation",
    ]
    .iter()
    .map(|s| s.to_string())
    .collect();
    let summary_rows: Vec<Vec<String>> = profiles
        .iter()
        .map(|p| {
            vec![
                p.cluster.to_string(),
                p.n.to_string(),
                format!("{:.6}", p.admit_rate),
                format!("{:.6}", p.avg_events),
                format!("{:.6}", p.avg_wait),
                format!("{:.6}", p.avg_los),
                format!("{:.6}", p.avg_age),
                format!("{:.6}", p.avg_deprivation),
            ]
        })
        .collect();
    io::write_table(&args.summary_out, &summary_header, &summary_rows)?;

    plot_profiles(&args.fig_out, &profiles)?;

    let sizes: Vec<usize> = profiles.iter().map(|p| p.n).collect();
    let mut metrics = StageMetrics::new("journeys");
    metrics.set("n_patients", n);
    metrics.set("k", args.k);
    metrics.set("inertia", inertia as f64);
    metrics.set("silhouette", silhouette as f64);
    metrics.set_json("cluster_sizes", serde_json::json!(sizes));
    metrics.write()?;

    let elapsed = start_time.elapsed();
    println!("[Output]");
    println!("    Assignments: {}", args.assign_out);
    println!("    Summary: {}", args.summary_out);
    println!("    Figure: {}", args.fig_out);
    println!("    Silhouette: {:.4}", silhouette);
    println!("{}", progress::format_time_used(elapsed));

    logger.log(&format!(
        "K-means done: inertia {:.4}, silhouette {:.4}",
        inertia, silhouette
    ))?;
    logger.log(&format!("Total time: {:.2}s", elapsed.as_secs_f64()))?;

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn scaling_keeps_zeros_at_zero() {
        let mut data = vec![vec![0.0, 4.0], vec![2.0, 8.0], vec![0.0, 0.0]];
        scale_columns(&mut data);
        assert_eq!(data[0][0], 0.0);
        assert_eq!(data[2][0], 0.0);
        assert_eq!(data[2][1], 0.0);
        assert!(data[1][0] > 0.0);
    }

    #[test]
    fn constant_columns_survive_scaling() {
        let mut data = vec![vec![3.0], vec![3.0]];
        scale_columns(&mut data);
        assert_eq!(data[0][0], 3.0);
        assert_eq!(data[1][0], 3.0);
    }

    #[test]
    fn clustering_columns_exclude_raw_early_tokens() {
        assert!(is_clustering_column("trans_TRIAGE->VITALS"));
        assert!(is_clustering_column("early1_LABS"));
        assert!(is_clustering_column("wait_time_min"));
        assert!(!is_clustering_column("early_event_1"));
        assert!(!is_clustering_column("patient_id"));
        assert!(!is_clustering_column("los_min"));
        assert!(!is_clustering_column("admitted"));
    }

    #[test]
    fn cluster_summaries_aggregate_members_only() {
        let records = vec![
            JourneyRecord {
                patient_id: "P1".into(),
                admitted: 1,
                age: 40,
                deprivation: 2,
                n_events: 6,
                wait_time_min: 20,
                los_min: 120,
            },
            JourneyRecord {
                patient_id: "P2".into(),
                admitted: 0,
                age: 60,
                deprivation: 4,
                n_events: 5,
                wait_time_min: 10,
                los_min: 90,
            },
            JourneyRecord {
                patient_id: "P3".into(),
                admitted: 1,
                age: 50,
                deprivation: 3,
                n_events: 7,
                wait_time_min: 30,
                los_min: 200,
            },
        ];
        let labels = vec![0, 1, 0];
        let profiles = summarize_clusters(&records, &labels, 3);
        assert_eq!(profiles.len(), 2);
        assert_eq!(profiles[0].cluster, 0);
        assert_eq!(profiles[0].n, 2);
        assert!((profiles[0].admit_rate - 1.0).abs() < 1e-12);
        assert!((profiles[0].avg_wait - 25.0).abs() < 1e-12);
        assert_eq!(profiles[1].cluster, 1);
        assert_eq!(profiles[1].n, 1);
        assert!((profiles[1].admit_rate - 0.0).abs() < 1e-12);
    }
}
