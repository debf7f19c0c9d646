//! Admission prediction from early pathway signals: a seeded stratified
//! split, a gradient-descent logistic model on scaled features, and the
//! discrimination/calibration report (AUROC, Brier, ECE, ROC and calibration
//! figures). Ends by merging the journey-pipeline stage metrics into
//! `reports/metrics.json`.

use clap::Args;
use plotters::prelude::*;
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::SeedableRng;
use std::error::Error;
use std::time::Instant;

use crate::io::{self, StageMetrics, Table};
use crate::progress;

#[derive(Args, Debug, Clone)]
pub struct OutcomeArgs {
    /// Input journey feature table
    #[arg(short = 'i', long = "input", default_value = "reports/journey_features.csv")]
    pub features_in: String,
    /// ROC figure path
    #[arg(long = "roc", default_value = "figures/roc_admission.png")]
    pub roc_out: String,
    /// Calibration figure path
    #[arg(long = "calibration", default_value = "figures/calibration_admission.png")]
    pub cal_out: String,
    /// Held-out test fraction
    #[arg(long = "test-fraction", default_value_t = 0.25)]
    pub test_fraction: f64,
    /// Gradient descent step size
    #[arg(long = "learning-rate", default_value_t = 0.1)]
    pub learning_rate: f64,
    /// Gradient descent iterations
    #[arg(long = "iterations", default_value_t = 2000)]
    pub iterations: usize,
    /// Number of ECE / calibration bins
    #[arg(long = "bins", default_value_t = 10)]
    pub n_bins: usize,
    /// Random seed for the split
    #[arg(long = "seed", default_value_t = 42)]
    pub seed: u64,
    /// Log file path (optional)
    #[arg(short = 'l', long = "log")]
    pub log: Option<String>,
}

impl Default for OutcomeArgs {
    fn default() -> Self {
        Self {
            features_in: "reports/journey_features.csv".to_string(),
            roc_out: "figures/roc_admission.png".to_string(),
            cal_out: "figures/calibration_admission.png".to_string(),
            test_fraction: 0.25,
            learning_rate: 0.1,
            iterations: 2000,
            n_bins: 10,
            seed: 42,
            log: None,
        }
    }
}

fn validate_outcome_args(args: &OutcomeArgs) -> Result<(), Box<dyn Error>> {
    if !(0.0..1.0).contains(&args.test_fraction) || args.test_fraction == 0.0 {
        return Err(format!(
            "Error: test fraction must lie in (0, 1), current: {}",
            args.test_fraction
        )
        .into());
    }
    if args.n_bins == 0 {
        return Err("Error: bin count must be at least 1".into());
    }
    Ok(())
}

/// Seeded stratified split: within each class the indices are shuffled and a
/// proportional share goes to the test set. Returns (train, test) indices.
pub fn stratified_split(
    labels: &[u8],
    test_fraction: f64,
    seed: u64,
) -> (Vec<usize>, Vec<usize>) {
    let mut rng = StdRng::seed_from_u64(seed);
    let mut train = Vec::new();
    let mut test = Vec::new();
    for class in [0u8, 1u8] {
        let mut members: Vec<usize> = (0..labels.len()).filter(|&i| labels[i] == class).collect();
        members.shuffle(&mut rng);
        let n_test = ((members.len() as f64) * test_fraction).round() as usize;
        test.extend_from_slice(&members[..n_test]);
        train.extend_from_slice(&members[n_test..]);
    }
    train.sort_unstable();
    test.sort_unstable();
    (train, test)
}

/// Per-column spreads fitted on one set, for scale-only standardization.
pub fn fit_column_scales(data: &[Vec<f64>]) -> Vec<f64> {
    if data.is_empty() {
        return Vec::new();
    }
    let n = data.len() as f64;
    let d = data[0].len();
    (0..d)
        .map(|col| {
            let mean = data.iter().map(|row| row[col]).sum::<f64>() / n;
            let var = data
                .iter()
                .map(|row| (row[col] - mean).powi(2))
                .sum::<f64>()
                / n;
            var.sqrt()
        })
        .collect()
}

pub fn apply_column_scales(data: &mut [Vec<f64>], scales: &[f64]) {
    for row in data.iter_mut() {
        for (v, &s) in row.iter_mut().zip(scales.iter()) {
            if s > 0.0 {
                *v /= s;
            }
        }
    }
}

fn sigmoid(x: f64) -> f64 {
    1.0 / (1.0 + (-x).exp())
}

/// Plain gradient-descent logistic regression.
pub struct LogisticModel {
    pub weights: Vec<f64>,
    pub bias: f64,
}

impl LogisticModel {
    pub fn fit(x: &[Vec<f64>], y: &[u8], learning_rate: f64, iterations: usize) -> Self {
        let n = x.len();
        let d = if n > 0 { x[0].len() } else { 0 };
        let mut weights = vec![0.0f64; d];
        let mut bias = 0.0f64;
        for _ in 0..iterations {
            let mut grad_w = vec![0.0f64; d];
            let mut grad_b = 0.0f64;
            for (row, &label) in x.iter().zip(y.iter()) {
                let z = bias
                    + row
                        .iter()
                        .zip(weights.iter())
                        .map(|(&v, &w)| v * w)
                        .sum::<f64>();
                let residual = sigmoid(z) - label as f64;
                for (g, &v) in grad_w.iter_mut().zip(row.iter()) {
                    *g += residual * v;
                }
                grad_b += residual;
            }
            let scale = learning_rate / n as f64;
            for (w, g) in weights.iter_mut().zip(grad_w.iter()) {
                *w -= scale * g;
            }
            bias -= scale * grad_b;
        }
        Self { weights, bias }
    }

    pub fn predict_proba(&self, x: &[Vec<f64>]) -> Vec<f64> {
        x.iter()
            .map(|row| {
                let z = self.bias
                    + row
                        .iter()
                        .zip(self.weights.iter())
                        .map(|(&v, &w)| v * w)
                        .sum::<f64>();
                sigmoid(z)
            })
            .collect()
    }
}

/// ROC points from (0,0) to (1,1), thresholds swept from the highest score
/// down, plus the trapezoidal area under them.
pub fn roc_curve(y_true: &[u8], y_prob: &[f64]) -> (Vec<(f64, f64)>, f64) {
    let pos = y_true.iter().filter(|&&y| y == 1).count() as f64;
    let neg = y_true.len() as f64 - pos;
    if pos == 0.0 || neg == 0.0 {
        return (vec![(0.0, 0.0), (1.0, 1.0)], 0.5);
    }

    let mut order: Vec<usize> = (0..y_true.len()).collect();
    order.sort_by(|&a, &b| {
        y_prob[b]
            .partial_cmp(&y_prob[a])
            .unwrap_or(std::cmp::Ordering::Equal)
    });

    let mut points = vec![(0.0, 0.0)];
    let mut tp = 0.0;
    let mut fp = 0.0;
    let mut i = 0;
    while i < order.len() {
        // Take all samples tied at this score in one step.
        let score = y_prob[order[i]];
        while i < order.len() && y_prob[order[i]] == score {
            if y_true[order[i]] == 1 {
                tp += 1.0;
            } else {
                fp += 1.0;
            }
            i += 1;
        }
        points.push((fp / neg, tp / pos));
    }
    if *points.last().unwrap() != (1.0, 1.0) {
        points.push((1.0, 1.0));
    }

    let mut auc = 0.0;
    for pair in points.windows(2) {
        let (x0, y0) = pair[0];
        let (x1, y1) = pair[1];
        auc += (x1 - x0) * (y0 + y1) / 2.0;
    }
    (points, auc)
}

pub fn brier_score(y_true: &[u8], y_prob: &[f64]) -> f64 {
    let n = y_true.len() as f64;
    y_true
        .iter()
        .zip(y_prob.iter())
        .map(|(&y, &p)| (p - y as f64).powi(2))
        .sum::<f64>()
        / n
}

/// Expected calibration error over equal-width probability bins.
pub fn ece_score(y_true: &[u8], y_prob: &[f64], n_bins: usize) -> f64 {
    let n = y_true.len() as f64;
    let mut ece = 0.0;
    for b in 0..n_bins {
        let members: Vec<usize> = (0..y_true.len())
            .filter(|&i| {
                let bin = ((y_prob[i] * n_bins as f64).floor() as usize).min(n_bins - 1);
                bin == b
            })
            .collect();
        if members.is_empty() {
            continue;
        }
        let acc = members.iter().map(|&i| y_true[i] as f64).sum::<f64>() / members.len() as f64;
        let conf = members.iter().map(|&i| y_prob[i]).sum::<f64>() / members.len() as f64;
        ece += (members.len() as f64 / n) * (acc - conf).abs();
    }
    ece
}

/// Quantile-binned calibration points: mean predicted probability against
/// observed positive fraction, one point per near-equal chunk of the sorted
/// predictions.
pub fn calibration_points(y_true: &[u8], y_prob: &[f64], n_bins: usize) -> Vec<(f64, f64)> {
    let mut order: Vec<usize> = (0..y_true.len()).collect();
    order.sort_by(|&a, &b| {
        y_prob[a]
            .partial_cmp(&y_prob[b])
            .unwrap_or(std::cmp::Ordering::Equal)
    });
    let n = order.len();
    let mut points = Vec::new();
    for b in 0..n_bins {
        let lo = b * n / n_bins;
        let hi = (b + 1) * n / n_bins;
        if hi <= lo {
            continue;
        }
        let chunk = &order[lo..hi];
        let mean_pred = chunk.iter().map(|&i| y_prob[i]).sum::<f64>() / chunk.len() as f64;
        let frac_pos = chunk.iter().map(|&i| y_true[i] as f64).sum::<f64>() / chunk.len() as f64;
        points.push((mean_pred, frac_pos));
    }
    points
}

fn plot_roc(path: &str, points: &[(f64, f64)], auc: f64) -> Result<(), Box<dyn Error>> {
    io::ensure_parent_dir(path)?;
    let root = BitMapBackend::new(path, (1200, 800)).into_drawing_area();
    root.fill(&WHITE)?;
    let root = root.margin(10, 10, 10, 10);

    let mut chart = ChartBuilder::on(&root)
        .caption(
            "Admission prediction from early pathway signals",
            ("sans-serif", 30),
        )
        .x_label_area_size(40)
        .y_label_area_size(60)
        .build_cartesian_2d(0.0f64..1.0f64, 0.0f64..1.0f64)?;

    chart
        .configure_mesh()
        .x_desc("False Positive Rate")
        .y_desc("True Positive Rate")
        .draw()?;

    chart
        .draw_series(LineSeries::new(
            points.iter().copied(),
            BLUE.mix(0.8).stroke_width(2),
        ))?
        .label(format!("LogReg (AUROC={:.3})", auc))
        .legend(|(x, y)| PathElement::new(vec![(x, y), (x + 20, y)], BLUE));

    chart.draw_series(LineSeries::new(
        [(0.0, 0.0), (1.0, 1.0)],
        BLACK.mix(0.4).stroke_width(1),
    ))?;

    chart
        .configure_series_labels()
        .background_style(WHITE.mix(0.8))
        .border_style(BLACK)
        .draw()?;

    root.present()?;
    Ok(())
}

fn plot_calibration(path: &str, points: &[(f64, f64)]) -> Result<(), Box<dyn Error>> {
    io::ensure_parent_dir(path)?;
    let root = BitMapBackend::new(path, (1200, 800)).into_drawing_area();
    root.fill(&WHITE)?;
    let root = root.margin(10, 10, 10, 10);

    let mut chart = ChartBuilder::on(&root)
        .caption("Calibration curve (admission)", ("sans-serif", 30))
        .x_label_area_size(40)
        .y_label_area_size(60)
        .build_cartesian_2d(0.0f64..1.0f64, 0.0f64..1.0f64)?;

    chart
        .configure_mesh()
        .x_desc("Mean predicted probability")
        .y_desc("Fraction of positives")
        .draw()?;

    chart
        .draw_series(LineSeries::new(
            points.iter().copied(),
            BLUE.mix(0.8).stroke_width(2),
        ))?
        .label("LogReg")
        .legend(|(x, y)| PathElement::new(vec![(x, y), (x + 20, y)], BLUE));
    chart.draw_series(
        points
            .iter()
            .map(|&(x, y)| Circle::new((x, y), 4, BLUE.filled())),
    )?;

    chart.draw_series(LineSeries::new(
        [(0.0, 0.0), (1.0, 1.0)],
        BLACK.mix(0.4).stroke_width(1),
    ))?;

    chart
        .configure_series_labels()
        .background_style(WHITE.mix(0.8))
        .border_style(BLACK)
        .draw()?;

    root.present()?;
    Ok(())
}

/// Whether a feature column is available at prediction time: early one-hots
/// and pre-outcome demographics, never transitions or length of stay.
pub fn is_early_signal_column(name: &str) -> bool {
    (name.starts_with("early") && !name.starts_with("early_event_"))
        || matches!(name, "age" | "deprivation" | "wait_time_min" | "n_events")
}

pub fn run(args: &OutcomeArgs) -> Result<(), Box<dyn Error>> {
    validate_outcome_args(args)?;
    let start_time = Instant::now();

    let log_file = match &args.log {
        Some(path) => std::fs::File::create(path)?,
        None => std::fs::File::create("outcomes.log")?,
    };
    let mut logger = crate::Logger::new(log_file);
    logger.log("=== SynthLab Outcomes Stage Log ===")?;
    logger.log(&format!("Software Version: v{}", crate::VERSION))?;
    logger.log(&format!("Input: {}", args.features_in))?;
    logger.log(&format!(
        "Test fraction: {}, seed: {}, lr: {}, iterations: {}",
        args.test_fraction, args.seed, args.learning_rate, args.iterations
    ))?;

    println!("[Loading data]");
    println!("    Features: {}", args.features_in);
    println!();

    let table = Table::read(&args.features_in)?;
    let c_adm = table.col("admitted")?;
    let feature_cols: Vec<usize> = table
        .header
        .iter()
        .enumerate()
        .filter(|(_, name)| is_early_signal_column(name))
        .map(|(idx, _)| idx)
        .collect();

    let n = table.rows.len();
    let mut y: Vec<u8> = Vec::with_capacity(n);
    let mut x: Vec<Vec<f64>> = Vec::with_capacity(n);
    for row in 0..n {
        y.push(table.i64_at(row, c_adm)? as u8);
        let mut rec = Vec::with_capacity(feature_cols.len());
        for &c in &feature_cols {
            rec.push(table.f64_at(row, c)?);
        }
        x.push(rec);
    }
    if y.iter().all(|&v| v == 0) || y.iter().all(|&v| v == 1) {
        return Err("Error: admission outcome is single-class, nothing to predict".into());
    }

    println!("[Params]");
    println!(
        "    Early-signal features: {} columns over {} patients.",
        feature_cols.len(),
        n
    );
    println!(
        "    Split: {:.0}% held out, stratified, seed {}.",
        args.test_fraction * 100.0,
        args.seed
    );
    println!();

    let (train_idx, test_idx) = stratified_split(&y, args.test_fraction, args.seed);
    let mut x_train: Vec<Vec<f64>> = train_idx.iter().map(|&i| x[i].clone()).collect();
    let mut x_test: Vec<Vec<f64>> = test_idx.iter().map(|&i| x[i].clone()).collect();
    let y_train: Vec<u8> = train_idx.iter().map(|&i| y[i]).collect();
    let y_test: Vec<u8> = test_idx.iter().map(|&i| y[i]).collect();

    let scales = fit_column_scales(&x_train);
    apply_column_scales(&mut x_train, &scales);
    apply_column_scales(&mut x_test, &scales);

    println!("[Processing] Fitting logistic model...");
    let model = LogisticModel::fit(&x_train, &y_train, args.learning_rate, args.iterations);
    let p_test = model.predict_proba(&x_test);

    let (roc_points, auroc) = roc_curve(&y_test, &p_test);
    let brier = brier_score(&y_test, &p_test);
    let ece = ece_score(&y_test, &p_test, args.n_bins);
    let cal_points = calibration_points(&y_test, &p_test, args.n_bins);

    plot_roc(&args.roc_out, &roc_points, auroc)?;
    plot_calibration(&args.cal_out, &cal_points)?;

    let mut metrics = StageMetrics::new("outcomes");
    metrics.set("n_patients", n);
    metrics.set("test_size", y_test.len());
    metrics.set_json(
        "logistic_regression",
        serde_json::json!({
            "auroc": auroc,
            "brier": brier,
            "ece": ece,
        }),
    );
    metrics.write()?;

    let merged = io::merge_metrics()?;

    let elapsed = start_time.elapsed();
    println!("[Output]");
    println!("    ROC: {}", args.roc_out);
    println!("    Calibration: {}", args.cal_out);
    println!(
        "    AUROC: {:.4}, Brier: {:.4}, ECE: {:.4}",
        auroc, brier, ece
    );
    println!("    Merged metrics: reports/metrics.json");
    println!("{}", serde_json::to_string_pretty(&merged)?);
    println!("{}", progress::format_time_used(elapsed));

    logger.log(&format!(
        "AUROC {:.6}, Brier {:.6}, ECE {:.6} on {} held-out patients",
        auroc,
        brier,
        ece,
        y_test.len()
    ))?;
    logger.log(&format!("Total time: {:.2}s", elapsed.as_secs_f64()))?;

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stratified_split_preserves_class_shares() {
        let labels: Vec<u8> = (0..100).map(|i| (i % 4 == 0) as u8).collect();
        let (train, test) = stratified_split(&labels, 0.25, 42);
        assert_eq!(train.len() + test.len(), 100);
        let test_pos = test.iter().filter(|&&i| labels[i] == 1).count();
        // 25 positives overall, a quarter of them held out.
        assert_eq!(test_pos, 6);
        assert_eq!(test.len(), 25);
        let mut all: Vec<usize> = train.iter().chain(test.iter()).copied().collect();
        all.sort_unstable();
        assert_eq!(all, (0..100).collect::<Vec<_>>());
    }

    #[test]
    fn split_is_reproducible_for_a_seed() {
        let labels: Vec<u8> = (0..40).map(|i| (i % 3 == 0) as u8).collect();
        let a = stratified_split(&labels, 0.25, 7);
        let b = stratified_split(&labels, 0.25, 7);
        assert_eq!(a, b);
    }

    #[test]
    fn perfect_separation_gives_unit_auroc() {
        let y = vec![0, 0, 0, 1, 1, 1];
        let p = vec![0.1, 0.2, 0.3, 0.7, 0.8, 0.9];
        let (_, auc) = roc_curve(&y, &p);
        assert!((auc - 1.0).abs() < 1e-12);
    }

    #[test]
    fn inverted_scores_give_zero_auroc() {
        let y = vec![1, 1, 0, 0];
        let p = vec![0.1, 0.2, 0.8, 0.9];
        let (_, auc) = roc_curve(&y, &p);
        assert!(auc.abs() < 1e-12);
    }

    #[test]
    fn roc_endpoints_are_fixed() {
        let y = vec![0, 1, 0, 1, 1];
        let p = vec![0.3, 0.4, 0.6, 0.2, 0.9];
        let (points, auc) = roc_curve(&y, &p);
        assert_eq!(points[0], (0.0, 0.0));
        assert_eq!(*points.last().unwrap(), (1.0, 1.0));
        assert!((0.0..=1.0).contains(&auc));
    }

    #[test]
    fn brier_rewards_confident_correct_predictions() {
        let y = vec![1, 0];
        assert!(brier_score(&y, &[0.9, 0.1]) < brier_score(&y, &[0.6, 0.4]));
        assert!(brier_score(&y, &[1.0, 0.0]).abs() < 1e-12);
    }

    #[test]
    fn ece_is_zero_for_perfectly_calibrated_bins() {
        // Every prediction 0.5, half the labels positive.
        let y = vec![1, 0, 1, 0];
        let p = vec![0.5, 0.5, 0.5, 0.5];
        assert!(ece_score(&y, &p, 10).abs() < 1e-12);
    }

    #[test]
    fn ece_detects_overconfidence() {
        let y = vec![0, 0, 0, 0];
        let p = vec![0.95, 0.95, 0.95, 0.95];
        let ece = ece_score(&y, &p, 10);
        assert!((ece - 0.95).abs() < 1e-12);
    }

    #[test]
    fn calibration_points_are_monotone_in_prediction() {
        let y = vec![0, 0, 1, 0, 1, 1, 1, 0];
        let p = vec![0.1, 0.2, 0.3, 0.4, 0.6, 0.7, 0.8, 0.9];
        let points = calibration_points(&y, &p, 4);
        assert_eq!(points.len(), 4);
        for pair in points.windows(2) {
            assert!(pair[1].0 >= pair[0].0);
        }
    }

    #[test]
    fn logistic_fit_separates_an_easy_problem() {
        let x: Vec<Vec<f64>> = (0..20)
            .map(|i| vec![if i < 10 { -1.0 } else { 1.0 }])
            .collect();
        let y: Vec<u8> = (0..20).map(|i| (i >= 10) as u8).collect();
        let model = LogisticModel::fit(&x, &y, 0.5, 500);
        let p = model.predict_proba(&x);
        assert!(p[0] < 0.2, "negative-class probability was {}", p[0]);
        assert!(p[19] > 0.8, "positive-class probability was {}", p[19]);
    }

    #[test]
    fn early_signal_columns_exclude_outcome_leakage() {
        assert!(is_early_signal_column("early1_LABS"));
        assert!(is_early_signal_column("wait_time_min"));
        assert!(!is_early_signal_column("los_min"));
        assert!(!is_early_signal_column("admitted"));
        assert!(!is_early_signal_column("trans_TREATMENT->ADMIT"));
        assert!(!is_early_signal_column("early_event_1"));
    }
}
