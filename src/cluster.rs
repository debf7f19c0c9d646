//! Probabilistic clustering of the fused cell table: standardized features
//! into a full-covariance Gaussian mixture, temperature-smoothed posteriors,
//! and agreement metrics against the generator's true types (evaluation only,
//! never an input to the fit).

use aprender::prelude::*;
use clap::Args;
use std::error::Error;
use std::time::Instant;

use crate::image::percentile;
use crate::io::{self, StageMetrics, Table};
use crate::progress;

#[derive(Args, Debug, Clone)]
pub struct ClusterArgs {
    /// Input fused cell table
    #[arg(short = 'i', long = "input", default_value = "reports/cell_table.csv")]
    pub table_in: String,
    /// Output per-cell assignment table
    #[arg(short = 'o', long = "output", default_value = "reports/cluster_assignments.csv")]
    pub assign_out: String,
    /// Output per-cluster summary table
    #[arg(long = "summary", default_value = "reports/cluster_summary.csv")]
    pub summary_out: String,
    /// Number of mixture components
    #[arg(short = 'k', long = "components", default_value_t = 4)]
    pub k: usize,
    /// Posterior smoothing temperature
    #[arg(short = 't', long = "temperature", default_value_t = 10.0)]
    pub temperature: f64,
    /// Random seed for the mixture fit
    #[arg(long = "seed", default_value_t = 42)]
    pub seed: u64,
    /// Log file path (optional)
    #[arg(short = 'l', long = "log")]
    pub log: Option<String>,
}

impl Default for ClusterArgs {
    fn default() -> Self {
        Self {
            table_in: "reports/cell_table.csv".to_string(),
            assign_out: "reports/cluster_assignments.csv".to_string(),
            summary_out: "reports/cluster_summary.csv".to_string(),
            k: 4,
            temperature: 10.0,
            seed: 42,
            log: None,
        }
    }
}

fn validate_cluster_args(args: &ClusterArgs) -> Result<(), Box<dyn Error>> {
    if args.k == 0 {
        return Err("Error: component count must be at least 1".into());
    }
    if args.temperature <= 0.0 {
        return Err(format!(
            "Error: temperature must be positive, current: {}",
            args.temperature
        )
        .into());
    }
    Ok(())
}

/// Column-wise standardization in place. Columns with zero spread are centered
/// only, so constant features cannot blow up.
pub fn standardize_columns(data: &mut [Vec<f64>]) {
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
        for row in data.iter_mut() {
            row[col] -= mean;
            if std > 0.0 {
                row[col] /= std;
            }
        }
    }
}

/// Temperature smoothing of a responsibility matrix. Each row is clipped away
/// from zero, raised to `1/temperature`, and renormalized, so hard posteriors
/// relax toward uniform as the temperature grows.
pub fn temper_posteriors(probs: &mut [Vec<f64>], temperature: f64) {
    let inv_t = 1.0 / temperature;
    for row in probs.iter_mut() {
        for p in row.iter_mut() {
            *p = p.clamp(1e-12, 1.0).powf(inv_t);
        }
        let sum: f64 = row.iter().sum();
        for p in row.iter_mut() {
            *p /= sum + 1e-12;
        }
    }
}

/// First index of the row maximum.
pub fn argmax(row: &[f64]) -> usize {
    let mut best = 0usize;
    for (i, &v) in row.iter().enumerate() {
        if v > row[best] {
            best = i;
        }
    }
    best
}

fn pairs(n: u64) -> f64 {
    (n as f64) * (n as f64 - 1.0) / 2.0
}

/// Adjusted Rand Index by pair counting over the contingency table. Degenerate
/// partitions (everything in one class, or everything singleton, on both
/// sides) score 1.0 when they agree.
pub fn adjusted_rand_index(a: &[usize], b: &[usize]) -> f64 {
    assert_eq!(a.len(), b.len());
    let n = a.len() as u64;
    if n == 0 {
        return 1.0;
    }
    let ka = a.iter().copied().max().unwrap_or(0) + 1;
    let kb = b.iter().copied().max().unwrap_or(0) + 1;
    let mut contingency = vec![vec![0u64; kb]; ka];
    for (&x, &y) in a.iter().zip(b.iter()) {
        contingency[x][y] += 1;
    }
    let sum_cells: f64 = contingency
        .iter()
        .flat_map(|row| row.iter())
        .map(|&c| pairs(c))
        .sum();
    let sum_rows: f64 = contingency
        .iter()
        .map(|row| pairs(row.iter().sum::<u64>()))
        .sum();
    let sum_cols: f64 = (0..kb)
        .map(|j| pairs(contingency.iter().map(|row| row[j]).sum::<u64>()))
        .sum();
    let total = pairs(n);
    let expected = sum_rows * sum_cols / total;
    let max_index = (sum_rows + sum_cols) / 2.0;
    if (max_index - expected).abs() < 1e-12 {
        return 1.0;
    }
    (sum_cells - expected) / (max_index - expected)
}

/// Counts of (true label, predicted label) pairs, sized by the larger side so
/// the matrix is square.
pub fn confusion_counts(y_true: &[usize], y_pred: &[usize]) -> Vec<Vec<u64>> {
    let k = y_true
        .iter()
        .chain(y_pred.iter())
        .copied()
        .max()
        .map_or(0, |m| m + 1);
    let mut cm = vec![vec![0u64; k]; k];
    for (&t, &p) in y_true.iter().zip(y_pred.iter()) {
        cm[t][p] += 1;
    }
    cm
}

pub fn run(args: &ClusterArgs) -> Result<(), Box<dyn Error>> {
    validate_cluster_args(args)?;
    let start_time = Instant::now();

    let log_file = match &args.log {
        Some(path) => std::fs::File::create(path)?,
        None => std::fs::File::create("cluster.log")?,
    };
    let mut logger = crate::Logger::new(log_file);
    logger.log("=== SynthLab Cluster Stage Log ===")?;
    logger.log(&format!("Software Version: v{}", crate::VERSION))?;
    logger.log(&format!("Input: {}", args.table_in))?;
    logger.log(&format!(
        "Components: {}, temperature: {}, seed: {}",
        args.k, args.temperature, args.seed
    ))?;

    println!("[Loading data]");
    println!("    Fused table: {}", args.table_in);
    println!();

    let table = Table::read(&args.table_in)?;
    if table.rows.is_empty() {
        return Err("Error: fused cell table has no rows, nothing to cluster".into());
    }
    let seg_col = table.col("seg_id")?;
    let gt_col = table.col("gt_cell_id")?;
    let type_col = table.col("true_type")?;
    let feature_cols: Vec<usize> = (0..table.header.len())
        .filter(|&c| c != seg_col && c != gt_col && c != type_col)
        .collect();

    let n = table.rows.len();
    let d = feature_cols.len();
    let mut y_true: Vec<usize> = Vec::with_capacity(n);
    let mut features: Vec<Vec<f64>> = Vec::with_capacity(n);
    for row in 0..n {
        y_true.push(table.i64_at(row, type_col)? as usize);
        let mut rec = Vec::with_capacity(d);
        for &c in &feature_cols {
            rec.push(table.f64_at(row, c)?);
        }
        features.push(rec);
    }

    println!("[Params]");
    println!("    Mixture: {} components, full covariance.", args.k);
    println!("    Posterior temperature: {}.", args.temperature);
    println!("    Features: {} columns over {} cells.", d, n);
    println!();

    standardize_columns(&mut features);

    println!("[Processing] Fitting Gaussian mixture...");
    let flat: Vec<f32> = features.iter().flatten().map(|&v| v as f32).collect();
    let x = Matrix::from_vec(n, d, flat)?;
    let mut gmm = GaussianMixture::new(args.k, CovarianceType::Full)
        .with_random_state(args.seed);
    gmm.fit(&x)?;

    let proba = gmm.predict_proba(&x);
    let mut probs: Vec<Vec<f64>> = (0..n)
        .map(|i| (0..args.k).map(|k| proba.get(i, k) as f64).collect())
        .collect();
    temper_posteriors(&mut probs, args.temperature);

    let y_pred: Vec<usize> = probs.iter().map(|row| argmax(row)).collect();
    let maxp: Vec<f64> = probs
        .iter()
        .map(|row| row.iter().cloned().fold(f64::MIN, f64::max))
        .collect();

    let ari = adjusted_rand_index(&y_true, &y_pred);
    let cm = confusion_counts(&y_true, &y_pred);

    // Per-cell assignments.
    let assign_header: Vec<String> = [
        "seg_id",
        "gt_cell_id",
        "true_type",
        "cluster",
        "cluster_confidence",
    ]
    .iter()
    .map(|s| s.to_string())
    .collect();
    let assign_rows: Vec<Vec<String>> = (0..n)
        .map(|i| {
            vec![
                table.rows[i][seg_col].clone(),
                table.rows[i][gt_col].clone(),
                table.rows[i][type_col].clone(),
                y_pred[i].to_string(),
                format!("{:.6}", maxp[i]),
            ]
        })
        .collect();
    io::write_table(&args.assign_out, &assign_header, &assign_rows)?;

    // Per-cluster summary with the dominant true type.
    let summary_header: Vec<String> = ["cluster", "n", "avg_conf", "dominant_true_type"]
        .iter()
        .map(|s| s.to_string())
        .collect();
    let mut summary_rows: Vec<Vec<String>> = Vec::new();
    for c in 0..args.k {
        let members: Vec<usize> = (0..n).filter(|&i| y_pred[i] == c).collect();
        if members.is_empty() {
            continue;
        }
        let avg_conf = members.iter().map(|&i| maxp[i]).sum::<f64>() / members.len() as f64;
        let mut type_counts: Vec<(usize, usize)> = Vec::new();
        for &i in &members {
            match type_counts.iter_mut().find(|(t, _)| *t == y_true[i]) {
                Some((_, cnt)) => *cnt += 1,
                None => type_counts.push((y_true[i], 1)),
            }
        }
        type_counts.sort_by(|a, b| b.1.cmp(&a.1).then_with(|| a.0.cmp(&b.0)));
        summary_rows.push(vec![
            c.to_string(),
            members.len().to_string(),
            format!("{:.6}", avg_conf),
            type_counts[0].0.to_string(),
        ]);
    }
    io::write_table(&args.summary_out, &summary_header, &summary_rows)?;

    let mut metrics = StageMetrics::new("cluster");
    metrics.set("n_cells", n);
    metrics.set("ari_vs_true_type", ari);
    metrics.set("posterior_temperature", args.temperature);
    metrics.set(
        "mean_max_posterior",
        maxp.iter().sum::<f64>() / n as f64,
    );
    metrics.set_json(
        "max_posterior_quantiles",
        serde_json::json!({
            "p10": percentile(&maxp, 10.0),
            "p50": percentile(&maxp, 50.0),
            "p90": percentile(&maxp, 90.0),
        }),
    );
    metrics.set_json("confusion_matrix", serde_json::json!(cm));
    metrics.write()?;

    let elapsed = start_time.elapsed();
    println!("[Output]");
    println!("    Assignments: {}", args.assign_out);
    println!("    Summary: {}", args.summary_out);
    println!("    ARI vs true type: {:.4}", ari);
    println!("{}", progress::format_time_used(elapsed));

    logger.log(&format!("ARI vs true type: {:.6}", ari))?;
    logger.log(&format!(
        "Mean max posterior after tempering: {:.6}",
        maxp.iter().sum::<f64>() / n as f64
    ))?;
    logger.log(&format!("Total time: {:.2}s", elapsed.as_secs_f64()))?;

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tempered_rows_stay_normalized() {
        let mut probs = vec![vec![0.99, 0.01, 0.0], vec![0.4, 0.35, 0.25]];
        temper_posteriors(&mut probs, 10.0);
        for row in &probs {
            let sum: f64 = row.iter().sum();
            assert!((sum - 1.0).abs() < 1e-9, "row sum was {}", sum);
            for &p in row {
                assert!(p >= 0.0 && p <= 1.0);
            }
        }
    }

    #[test]
    fn tempering_preserves_the_argmax() {
        let raw = vec![vec![0.7, 0.2, 0.1], vec![0.05, 0.15, 0.8]];
        let mut tempered = raw.clone();
        temper_posteriors(&mut tempered, 10.0);
        for (r, t) in raw.iter().zip(tempered.iter()) {
            assert_eq!(argmax(r), argmax(t));
        }
    }

    #[test]
    fn high_temperature_flattens_posteriors() {
        let mut probs = vec![vec![0.9, 0.05, 0.05]];
        temper_posteriors(&mut probs, 10.0);
        assert!(probs[0][0] < 0.9);
        assert!(probs[0][1] > 0.05);
    }

    #[test]
    fn unit_temperature_is_a_fixed_point() {
        let mut probs = vec![vec![0.6, 0.3, 0.1]];
        temper_posteriors(&mut probs, 1.0);
        assert!((probs[0][0] - 0.6).abs() < 1e-9);
        assert!((probs[0][1] - 0.3).abs() < 1e-9);
        assert!((probs[0][2] - 0.1).abs() < 1e-9);
    }

    #[test]
    fn ari_is_one_for_identical_partitions() {
        let labels = vec![0, 0, 1, 1, 2, 2];
        assert!((adjusted_rand_index(&labels, &labels) - 1.0).abs() < 1e-12);
    }

    #[test]
    fn ari_is_one_under_relabeling() {
        let a = vec![0, 0, 1, 1, 2, 2];
        let b = vec![2, 2, 0, 0, 1, 1];
        assert!((adjusted_rand_index(&a, &b) - 1.0).abs() < 1e-12);
    }

    #[test]
    fn ari_penalizes_disagreement() {
        let a = vec![0, 0, 0, 1, 1, 1];
        let b = vec![0, 1, 0, 1, 0, 1];
        let ari = adjusted_rand_index(&a, &b);
        assert!(ari < 0.5, "ari was {}", ari);
        assert!(ari >= -1.0 && ari <= 1.0);
    }

    #[test]
    fn ari_degenerate_single_cluster_agreement() {
        let a = vec![0, 0, 0, 0];
        let b = vec![0, 0, 0, 0];
        assert!((adjusted_rand_index(&a, &b) - 1.0).abs() < 1e-12);
    }

    #[test]
    fn standardized_columns_have_zero_mean_unit_spread() {
        let mut data = vec![
            vec![1.0, 10.0],
            vec![2.0, 10.0],
            vec![3.0, 10.0],
            vec![4.0, 10.0],
        ];
        standardize_columns(&mut data);
        let n = data.len() as f64;
        for col in 0..2 {
            let mean: f64 = data.iter().map(|r| r[col]).sum::<f64>() / n;
            assert!(mean.abs() < 1e-12);
        }
        let var0: f64 = data.iter().map(|r| r[0] * r[0]).sum::<f64>() / n;
        assert!((var0 - 1.0).abs() < 1e-9);
        // Constant column is centered, not scaled.
        for row in &data {
            assert_eq!(row[1], 0.0);
        }
    }

    #[test]
    fn confusion_counts_preserve_totals() {
        let y_true = vec![0, 0, 1, 2, 2, 2];
        let y_pred = vec![0, 1, 1, 2, 2, 0];
        let cm = confusion_counts(&y_true, &y_pred);
        let total: u64 = cm.iter().flat_map(|r| r.iter()).sum();
        assert_eq!(total, 6);
        assert_eq!(cm[2][2], 2);
        assert_eq!(cm[0][1], 1);
    }
}
