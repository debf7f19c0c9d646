//! Result figures and closing metrics for the microscopy pipeline: binary
//! segmentation overlap against ground truth, a 2-D principal-component view
//! of the fused features, and the confusion heatmap. Ends by merging every
//! stage metrics document into `reports/metrics.json`.

use clap::Args;
use efficient_pca::PCA;
use ndarray::Array2;
use plotters::prelude::*;
use std::error::Error;
use std::time::Instant;

use crate::cluster::{confusion_counts, standardize_columns};
use crate::io::{self, StageMetrics, Table};
use crate::progress;

#[derive(Args, Debug, Clone)]
pub struct VisualizeArgs {
    /// Input ground-truth label mask
    #[arg(long = "gt", default_value = "data/raw/gt_mask.csv")]
    pub gt_in: String,
    /// Input segmentation label mask
    #[arg(long = "seg", default_value = "data/processed/seg_mask.csv")]
    pub seg_in: String,
    /// Input fused cell table
    #[arg(long = "cells", default_value = "reports/cell_table.csv")]
    pub table_in: String,
    /// Input cluster assignment table
    #[arg(long = "assignments", default_value = "reports/cluster_assignments.csv")]
    pub assign_in: String,
    /// Scatter figure colored by predicted cluster
    #[arg(long = "fig-clusters", default_value = "figures/pca_clusters.png")]
    pub fig_clusters: String,
    /// Scatter figure colored by true type
    #[arg(long = "fig-types", default_value = "figures/true_type_pca.png")]
    pub fig_types: String,
    /// Confusion heatmap figure
    #[arg(long = "fig-confusion", default_value = "figures/confusion_matrix.png")]
    pub fig_confusion: String,
    /// Random seed for the randomized projection
    #[arg(long = "seed", default_value_t = 42)]
    pub seed: u64,
    /// Log file path (optional)
    #[arg(short = 'l', long = "log")]
    pub log: Option<String>,
}

impl Default for VisualizeArgs {
    fn default() -> Self {
        Self {
            gt_in: "data/raw/gt_mask.csv".to_string(),
            seg_in: "data/processed/seg_mask.csv".to_string(),
            table_in: "reports/cell_table.csv".to_string(),
            assign_in: "reports/cluster_assignments.csv".to_string(),
            fig_clusters: "figures/pca_clusters.png".to_string(),
            fig_types: "figures/true_type_pca.png".to_string(),
            fig_confusion: "figures/confusion_matrix.png".to_string(),
            seed: 42,
            log: None,
        }
    }
}

/// Binary overlap of two label masks, foreground meaning any positive label.
pub fn dice_iou_binary(a: &Array2<i32>, b: &Array2<i32>) -> (f64, f64) {
    let mut inter = 0u64;
    let mut da = 0u64;
    let mut db = 0u64;
    for (&x, &y) in a.iter().zip(b.iter()) {
        let fa = x > 0;
        let fb = y > 0;
        if fa {
            da += 1;
        }
        if fb {
            db += 1;
        }
        if fa && fb {
            inter += 1;
        }
    }
    let dice = (2 * inter) as f64 / ((da + db) as f64 + 1e-12);
    let iou = inter as f64 / ((da + db - inter) as f64 + 1e-12);
    (dice, iou)
}

/// Variance share each score column carries of the total input variance.
pub fn explained_variance_ratios(scores: &Array2<f64>, total_variance: f64) -> Vec<f64> {
    let n = scores.nrows() as f64;
    if n == 0.0 || total_variance <= 0.0 {
        return vec![0.0; scores.ncols()];
    }
    (0..scores.ncols())
        .map(|c| {
            let col = scores.column(c);
            let mean = col.sum() / n;
            let var = col.iter().map(|&v| (v - mean).powi(2)).sum::<f64>() / n;
            var / total_variance
        })
        .collect()
}

const SERIES_COLORS: [RGBColor; 8] = [
    RGBColor(31, 119, 180),
    RGBColor(255, 127, 14),
    RGBColor(44, 160, 44),
    RGBColor(214, 39, 40),
    RGBColor(148, 103, 189),
    RGBColor(140, 86, 75),
    RGBColor(227, 119, 194),
    RGBColor(127, 127, 127),
];

fn plot_scatter(
    path: &str,
    title: &str,
    points: &Array2<f64>,
    labels: &[usize],
    label_prefix: &str,
) -> Result<(), Box<dyn Error>> {
    io::ensure_parent_dir(path)?;
    let root = BitMapBackend::new(path, (1200, 800)).into_drawing_area();
    root.fill(&WHITE)?;
    let root = root.margin(10, 10, 10, 10);

    let xs: Vec<f64> = points.column(0).iter().copied().collect();
    let ys: Vec<f64> = points.column(1).iter().copied().collect();
    let x_min = xs.iter().cloned().fold(f64::INFINITY, f64::min);
    let x_max = xs.iter().cloned().fold(f64::NEG_INFINITY, f64::max);
    let y_min = ys.iter().cloned().fold(f64::INFINITY, f64::min);
    let y_max = ys.iter().cloned().fold(f64::NEG_INFINITY, f64::max);
    let x_pad = (x_max - x_min).max(1e-6) * 0.05;
    let y_pad = (y_max - y_min).max(1e-6) * 0.05;

    let mut chart = ChartBuilder::on(&root)
        .caption(title, ("sans-serif", 30))
        .x_label_area_size(40)
        .y_label_area_size(60)
        .build_cartesian_2d(x_min - x_pad..x_max + x_pad, y_min - y_pad..y_max + y_pad)?;

    chart.configure_mesh().x_desc("PC1").y_desc("PC2").draw()?;

    let mut groups: Vec<usize> = labels.to_vec();
    groups.sort_unstable();
    groups.dedup();
    for &g in &groups {
        let color = SERIES_COLORS[g % SERIES_COLORS.len()];
        let members: Vec<(f64, f64)> = labels
            .iter()
            .enumerate()
            .filter(|(_, &l)| l == g)
            .map(|(i, _)| (xs[i], ys[i]))
            .collect();
        chart
            .draw_series(
                members
                    .iter()
                    .map(|&(x, y)| Circle::new((x, y), 3, color.mix(0.8).filled())),
            )?
            .label(format!("{}{}", label_prefix, g))
            .legend(move |(x, y)| Circle::new((x + 10, y), 3, color.filled()));
    }

    chart
        .configure_series_labels()
        .background_style(WHITE.mix(0.8))
        .border_style(BLACK)
        .draw()?;

    root.present()?;
    Ok(())
}

fn plot_confusion_heatmap(path: &str, cm: &[Vec<u64>]) -> Result<(), Box<dyn Error>> {
    io::ensure_parent_dir(path)?;
    let k = cm.len();
    if k == 0 {
        return Ok(());
    }
    let max_count = cm
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
        .caption(
            "Confusion matrix (true type vs predicted cluster)",
            ("sans-serif", 30),
        )
        .x_label_area_size(40)
        .y_label_area_size(60)
        .build_cartesian_2d(0..k as i32, 0..k as i32)?;

    chart
        .configure_mesh()
        .disable_mesh()
        .x_desc("Predicted cluster")
        .y_desc("True type")
        .draw()?;

    for (t, row) in cm.iter().enumerate() {
        for (p, &count) in row.iter().enumerate() {
            let level = (count as f64 / max_count as f64 * 255.0) as u8;
            let color = RGBColor(255 - level, 255 - level, 255);
            // Row 0 at the top, matching the tabular reading of the matrix.
            let y = (k - 1 - t) as i32;
            chart.draw_series(std::iter::once(Rectangle::new(
                [(p as i32, y), (p as i32 + 1, y + 1)],
                color.filled(),
            )))?;
        }
    }

    root.present()?;
    Ok(())
}

pub fn run(args: &VisualizeArgs) -> Result<(), Box<dyn Error>> {
    let start_time = Instant::now();

    let log_file = match &args.log {
        Some(path) => std::fs::File::create(path)?,
        None => std::fs::File::create("visualize.log")?,
    };
    let mut logger = crate::Logger::new(log_file);
    logger.log("=== SynthLab Visualize Stage Log ===")?;
    logger.log(&format!("Software Version: v{}", crate::VERSION))?;

    println!("[Loading data]");
    println!("    Ground truth: {}", args.gt_in);
    println!("    Segmentation: {}", args.seg_in);
    println!("    Fused table: {}", args.table_in);
    println!("    Assignments: {}", args.assign_in);
    println!();

    let gt = io::load_grid_i32(&args.gt_in)?;
    let seg = io::load_grid_i32(&args.seg_in)?;
    let (dice, iou) = dice_iou_binary(&seg, &gt);
    logger.log(&format!("Binary Dice: {:.6}, IoU: {:.6}", dice, iou))?;

    let cells = Table::read(&args.table_in)?;
    let assign = Table::read(&args.assign_in)?;

    // Join assignments onto the fused table by seg_id.
    let a_seg = assign.col("seg_id")?;
    let a_cluster = assign.col("cluster")?;
    let mut cluster_by_seg: std::collections::HashMap<i64, usize> =
        std::collections::HashMap::new();
    for row in 0..assign.rows.len() {
        cluster_by_seg.insert(
            assign.i64_at(row, a_seg)?,
            assign.i64_at(row, a_cluster)? as usize,
        );
    }

    let c_seg = cells.col("seg_id")?;
    let c_type = cells.col("true_type")?;
    let feature_cols: Vec<usize> = cells
        .header
        .iter()
        .enumerate()
        .filter(|(_, name)| {
            matches!(
                name.as_str(),
                "area" | "eccentricity" | "perimeter" | "solidity" | "mean_intensity"
                    | "max_intensity"
            ) || name.starts_with("bar_")
                || name.starts_with("prj_")
        })
        .map(|(idx, _)| idx)
        .collect();

    let mut features: Vec<Vec<f64>> = Vec::new();
    let mut y_true: Vec<usize> = Vec::new();
    let mut y_pred: Vec<usize> = Vec::new();
    for row in 0..cells.rows.len() {
        let seg_id = cells.i64_at(row, c_seg)?;
        let Some(&cluster) = cluster_by_seg.get(&seg_id) else {
            continue;
        };
        y_pred.push(cluster);
        y_true.push(cells.i64_at(row, c_type)? as usize);
        let mut rec = Vec::with_capacity(feature_cols.len());
        for &c in &feature_cols {
            rec.push(cells.f64_at(row, c)?);
        }
        features.push(rec);
    }
    if features.is_empty() {
        return Err("Error: no cells shared between the fused table and the assignments".into());
    }

    println!("[Processing] Projecting {} cells to 2 components...", features.len());
    standardize_columns(&mut features);
    let n = features.len();
    let d = features[0].len();
    let total_variance: f64 = (0..d)
        .map(|col| {
            let mean = features.iter().map(|r| r[col]).sum::<f64>() / n as f64;
            features.iter().map(|r| (r[col] - mean).powi(2)).sum::<f64>() / n as f64
        })
        .sum();

    let flat: Vec<f64> = features.iter().flatten().copied().collect();
    let x = Array2::from_shape_vec((n, d), flat)?;
    let x_for_transform = x.clone();
    let mut pca = PCA::new();
    pca.rfit(x, 2, 10, Some(args.seed), None)
        .map_err(|e| format!("Error: principal component fit failed: {}", e))?;
    let scores = pca
        .transform(x_for_transform)
        .map_err(|e| format!("Error: principal component projection failed: {}", e))?;
    if scores.ncols() < 2 {
        return Err(format!(
            "Error: projection kept {} component(s), need 2 for the scatter plots",
            scores.ncols()
        )
        .into());
    }
    let ratios = explained_variance_ratios(&scores, total_variance);

    plot_scatter(
        &args.fig_clusters,
        "Multi-view features by predicted cluster",
        &scores,
        &y_pred,
        "C",
    )?;
    plot_scatter(
        &args.fig_types,
        "Multi-view features by true type",
        &scores,
        &y_true,
        "T",
    )?;
    let cm = confusion_counts(&y_true, &y_pred);
    plot_confusion_heatmap(&args.fig_confusion, &cm)?;

    let mut metrics = StageMetrics::new("visualize");
    metrics.set("segmentation_binary_dice", dice);
    metrics.set("segmentation_binary_iou", iou);
    metrics.set_json(
        "pca_explained_variance_ratio",
        serde_json::json!(ratios),
    );
    metrics.write()?;

    let merged = io::merge_metrics()?;

    let elapsed = start_time.elapsed();
    println!("[Output]");
    println!("    Figures: {}, {}, {}", args.fig_clusters, args.fig_types, args.fig_confusion);
    println!("    Binary Dice: {:.4}, IoU: {:.4}", dice, iou);
    println!("    Merged metrics: reports/metrics.json");
    println!("{}", serde_json::to_string_pretty(&merged)?);
    println!("{}", progress::format_time_used(elapsed));

    logger.log("Figures written, metrics merged")?;
    logger.log(&format!("Total time: {:.2}s", elapsed.as_secs_f64()))?;

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::array;

    #[test]
    fn identical_masks_have_perfect_overlap() {
        let a = array![[0, 1, 1], [0, 2, 0]];
        let (dice, iou) = dice_iou_binary(&a, &a);
        assert!((dice - 1.0).abs() < 1e-9);
        assert!((iou - 1.0).abs() < 1e-9);
    }

    #[test]
    fn disjoint_masks_have_zero_overlap() {
        let a = array![[1, 0], [0, 0]];
        let b = array![[0, 0], [0, 3]];
        let (dice, iou) = dice_iou_binary(&a, &b);
        assert!(dice.abs() < 1e-9);
        assert!(iou.abs() < 1e-9);
    }

    #[test]
    fn iou_never_exceeds_dice() {
        let a = array![[1, 1, 0, 0], [1, 0, 0, 0]];
        let b = array![[0, 1, 1, 0], [1, 0, 1, 0]];
        let (dice, iou) = dice_iou_binary(&a, &b);
        assert!(iou <= dice + 1e-12);
        assert!((0.0..=1.0).contains(&dice));
        assert!((0.0..=1.0).contains(&iou));
    }

    #[test]
    fn variance_ratios_sum_below_one() {
        // Scores carrying half the total variance each along two axes.
        let scores = array![[1.0, 0.0], [-1.0, 0.0], [0.0, 1.0], [0.0, -1.0]];
        let ratios = explained_variance_ratios(&scores, 2.0);
        assert_eq!(ratios.len(), 2);
        let sum: f64 = ratios.iter().sum();
        assert!(sum <= 1.0 + 1e-9);
        assert!(ratios.iter().all(|&r| r >= 0.0));
    }

    #[test]
    fn empty_scores_give_zero_ratios() {
        let scores = Array2::<f64>::zeros((0, 2));
        let ratios = explained_variance_ratios(&scores, 1.0);
        assert_eq!(ratios, vec![0.0, 0.0]);
    }
}
