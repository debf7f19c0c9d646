//! Per-region morphology and intensity statistics, plus the majority-overlap
//! mapping from detected regions to ground-truth cells and the join with the
//! barcode view. Regions with no ground-truth overlap are dropped explicitly,
//! with the dropped count logged and reported.

use clap::Args;
use ndarray::Array2;
use rayon::prelude::*;
use std::collections::HashMap;
use std::error::Error;
use std::time::Instant;

use crate::io::{self, StageMetrics, Table};
use crate::progress;

/// Sentinel ground-truth id for regions that overlap no cell.
pub const UNMAPPED: i64 = 0;

#[derive(Args, Debug, Clone)]
pub struct FeatureArgs {
    /// Input image grid
    #[arg(long = "image", default_value = "data/raw/microscopy_image.csv")]
    pub image_in: String,
    /// Input ground-truth label mask
    #[arg(long = "gt", default_value = "data/raw/gt_mask.csv")]
    pub gt_in: String,
    /// Input segmentation label mask
    #[arg(long = "seg", default_value = "data/processed/seg_mask.csv")]
    pub seg_in: String,
    /// Input barcode/projection view table
    #[arg(long = "barcodes", default_value = "data/raw/barcode_view.csv")]
    pub barcodes_in: String,
    /// Output morphology feature table
    #[arg(long = "morph", default_value = "data/processed/morph_features.csv")]
    pub morph_out: String,
    /// Output mapped (joined) table
    #[arg(short = 'o', long = "output", default_value = "data/processed/mapped_cells.csv")]
    pub mapped_out: String,
    /// Log file path (optional)
    #[arg(short = 'l', long = "log")]
    pub log: Option<String>,
}

impl Default for FeatureArgs {
    fn default() -> Self {
        Self {
            image_in: "data/raw/microscopy_image.csv".to_string(),
            gt_in: "data/raw/gt_mask.csv".to_string(),
            seg_in: "data/processed/seg_mask.csv".to_string(),
            barcodes_in: "data/raw/barcode_view.csv".to_string(),
            morph_out: "data/processed/morph_features.csv".to_string(),
            mapped_out: "data/processed/mapped_cells.csv".to_string(),
            log: None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct RegionFeatures {
    pub seg_id: i32,
    pub area: f64,
    pub eccentricity: f64,
    pub perimeter: f64,
    pub solidity: f64,
    pub mean_intensity: f64,
    pub max_intensity: f64,
}

/// Pixel supports per region label, in ascending label order.
pub fn region_pixels(seg: &Array2<i32>) -> Vec<(i32, Vec<(usize, usize)>)> {
    let max_label = seg.iter().copied().max().unwrap_or(0);
    if max_label <= 0 {
        return Vec::new();
    }
    let mut pixels: Vec<Vec<(usize, usize)>> = vec![Vec::new(); max_label as usize];
    for ((i, j), &l) in seg.indexed_iter() {
        if l > 0 {
            pixels[(l - 1) as usize].push((i, j));
        }
    }
    (1..=max_label)
        .zip(pixels)
        .filter(|(_, px)| !px.is_empty())
        .collect()
}

/// Geometric and intensity statistics over one region's pixel support.
pub fn measure_region(
    seg_id: i32,
    pixels: &[(usize, usize)],
    image: &Array2<f64>,
    seg: &Array2<i32>,
) -> RegionFeatures {
    let area = pixels.len() as f64;

    let mut sum_i = 0.0;
    let mut sum_j = 0.0;
    let mut sum_v = 0.0;
    let mut max_v = f64::NEG_INFINITY;
    for &(i, j) in pixels {
        sum_i += i as f64;
        sum_j += j as f64;
        let v = image[[i, j]];
        sum_v += v;
        max_v = max_v.max(v);
    }
    let cy = sum_i / area;
    let cx = sum_j / area;

    // Central second moments for the eccentricity of the equivalent ellipse.
    let mut mu20 = 0.0;
    let mut mu02 = 0.0;
    let mut mu11 = 0.0;
    for &(i, j) in pixels {
        let di = i as f64 - cy;
        let dj = j as f64 - cx;
        mu20 += dj * dj;
        mu02 += di * di;
        mu11 += di * dj;
    }
    mu20 /= area;
    mu02 /= area;
    mu11 /= area;
    let common = ((mu20 - mu02).powi(2) + 4.0 * mu11 * mu11).sqrt();
    let lambda1 = (mu20 + mu02 + common) / 2.0;
    let lambda2 = (mu20 + mu02 - common) / 2.0;
    let eccentricity = if lambda1 > 0.0 {
        (1.0 - (lambda2 / lambda1).max(0.0)).max(0.0).sqrt()
    } else {
        0.0
    };

    RegionFeatures {
        seg_id,
        area,
        eccentricity,
        perimeter: exposed_edge_perimeter(seg_id, pixels, seg),
        solidity: solidity(pixels),
        mean_intensity: sum_v / area,
        max_intensity: max_v,
    }
}

/// Perimeter as the count of region pixel edges facing non-region pixels
/// (image borders included).
fn exposed_edge_perimeter(seg_id: i32, pixels: &[(usize, usize)], seg: &Array2<i32>) -> f64 {
    let (h, w) = seg.dim();
    let mut edges = 0usize;
    const NEIGHBORS: [(i64, i64); 4] = [(-1, 0), (1, 0), (0, -1), (0, 1)];
    for &(i, j) in pixels {
        for &(dy, dx) in NEIGHBORS.iter() {
            let ii = i as i64 + dy;
            let jj = j as i64 + dx;
            if ii < 0 || jj < 0 || ii >= h as i64 || jj >= w as i64 {
                edges += 1;
            } else if seg[[ii as usize, jj as usize]] != seg_id {
                edges += 1;
            }
        }
    }
    edges as f64
}

/// Area ratio of the region against the pixels covered by its convex hull.
fn solidity(pixels: &[(usize, usize)]) -> f64 {
    let hull = convex_hull(pixels);
    if hull.len() < 3 {
        return 1.0; // point or line: the region fills its own hull
    }
    let mut min_i = usize::MAX;
    let mut max_i = 0usize;
    let mut min_j = usize::MAX;
    let mut max_j = 0usize;
    for &(i, j) in pixels {
        min_i = min_i.min(i);
        max_i = max_i.max(i);
        min_j = min_j.min(j);
        max_j = max_j.max(j);
    }
    let mut hull_pixels = 0usize;
    for i in min_i..=max_i {
        for j in min_j..=max_j {
            if inside_hull(&hull, i as f64, j as f64) {
                hull_pixels += 1;
            }
        }
    }
    if hull_pixels == 0 {
        return 1.0;
    }
    (pixels.len() as f64 / hull_pixels as f64).min(1.0)
}

/// Andrew monotone chain on pixel centers; returns the hull counter-clockwise.
fn convex_hull(pixels: &[(usize, usize)]) -> Vec<(f64, f64)> {
    let mut points: Vec<(f64, f64)> = pixels.iter().map(|&(i, j)| (i as f64, j as f64)).collect();
    points.sort_by(|a, b| a.partial_cmp(b).unwrap_or(std::cmp::Ordering::Equal));
    points.dedup();
    if points.len() < 3 {
        return points;
    }
    let cross = |o: (f64, f64), a: (f64, f64), b: (f64, f64)| {
        (a.0 - o.0) * (b.1 - o.1) - (a.1 - o.1) * (b.0 - o.0)
    };
    let mut hull: Vec<(f64, f64)> = Vec::with_capacity(points.len() * 2);
    for &p in points.iter() {
        while hull.len() >= 2 && cross(hull[hull.len() - 2], hull[hull.len() - 1], p) <= 0.0 {
            hull.pop();
        }
        hull.push(p);
    }
    let lower_len = hull.len() + 1;
    for &p in points.iter().rev().skip(1) {
        while hull.len() >= lower_len && cross(hull[hull.len() - 2], hull[hull.len() - 1], p) <= 0.0
        {
            hull.pop();
        }
        hull.push(p);
    }
    hull.pop();
    hull
}

fn inside_hull(hull: &[(f64, f64)], i: f64, j: f64) -> bool {
    let n = hull.len();
    for k in 0..n {
        let a = hull[k];
        let b = hull[(k + 1) % n];
        let cross = (b.0 - a.0) * (j - a.1) - (b.1 - a.1) * (i - a.0);
        if cross < -1e-9 {
            return false;
        }
    }
    true
}

/// Ground-truth cell with the largest pixel overlap; ties break toward the
/// smaller cell id, zero overlap maps to the sentinel.
pub fn majority_gt_label(pixels: &[(usize, usize)], gt: &Array2<i32>) -> i64 {
    let mut counts: HashMap<i64, usize> = HashMap::new();
    for &(i, j) in pixels {
        let g = gt[[i, j]] as i64;
        if g > 0 {
            *counts.entry(g).or_insert(0) += 1;
        }
    }
    let mut ranked: Vec<(i64, usize)> = counts.into_iter().collect();
    ranked.sort_by(|a, b| b.1.cmp(&a.1).then_with(|| a.0.cmp(&b.0)));
    ranked.first().map(|&(id, _)| id).unwrap_or(UNMAPPED)
}

pub fn run(args: &FeatureArgs) -> Result<(), Box<dyn Error>> {
    let start_time = Instant::now();

    let log_file = match &args.log {
        Some(path) => std::fs::File::create(path)?,
        None => std::fs::File::create("features.log")?,
    };
    let mut logger = crate::Logger::new(log_file);
    logger.log("=== SynthLab Features Stage Log ===")?;
    logger.log(&format!("Software Version: v{}", crate::VERSION))?;
    logger.log(&format!("Image: {}", args.image_in))?;
    logger.log(&format!("Ground truth: {}", args.gt_in))?;
    logger.log(&format!("Segmentation: {}", args.seg_in))?;

    println!("[Loading data]");
    println!("    Image: {}", args.image_in);
    println!("    Ground truth: {}", args.gt_in);
    println!("    Segmentation: {}", args.seg_in);
    println!("    Second view: {}", args.barcodes_in);
    println!();

    let image = io::load_grid_f64(&args.image_in)?;
    let gt = io::load_grid_i32(&args.gt_in)?;
    let seg = io::load_grid_i32(&args.seg_in)?;
    if image.dim() != seg.dim() || image.dim() != gt.dim() {
        return Err(format!(
            "Error: grid shapes disagree: image {:?}, gt {:?}, seg {:?}",
            image.dim(),
            gt.dim(),
            seg.dim()
        )
        .into());
    }

    let barcodes = Table::read(&args.barcodes_in)?;
    let cell_id_col = barcodes.col("cell_id")?;
    let true_type_col = barcodes.col("true_type")?;
    let view_cols: Vec<usize> = barcodes
        .header
        .iter()
        .enumerate()
        .filter(|(_, name)| name.starts_with("bar_") || name.starts_with("prj_"))
        .map(|(idx, _)| idx)
        .collect();
    let mut view_by_cell: HashMap<i64, (i64, Vec<String>)> = HashMap::new();
    for row in 0..barcodes.rows.len() {
        let cell_id = barcodes.i64_at(row, cell_id_col)?;
        let true_type = barcodes.i64_at(row, true_type_col)?;
        let fields: Vec<String> = view_cols
            .iter()
            .map(|&c| barcodes.rows[row][c].clone())
            .collect();
        view_by_cell.insert(cell_id, (true_type, fields));
    }

    let regions = region_pixels(&seg);
    println!("[Processing] Measuring {} regions...", regions.len());

    let measured: Vec<(RegionFeatures, i64)> = regions
        .par_iter()
        .map(|(seg_id, pixels)| {
            let feats = measure_region(*seg_id, pixels, &image, &seg);
            let gt_id = majority_gt_label(pixels, &gt);
            (feats, gt_id)
        })
        .collect();

    // Morphology table for every detected region, mapped or not.
    let morph_header: Vec<String> = [
        "seg_id",
        "area",
        "eccentricity",
        "perimeter",
        "solidity",
        "mean_intensity",
        "max_intensity",
    ]
    .iter()
    .map(|s| s.to_string())
    .collect();
    let morph_rows: Vec<Vec<String>> = measured
        .iter()
        .map(|(f, _)| {
            vec![
                f.seg_id.to_string(),
                format!("{:.6}", f.area),
                format!("{:.6}", f.eccentricity),
                format!("{:.6}", f.perimeter),
                format!("{:.6}", f.solidity),
                format!("{:.6}", f.mean_intensity),
                format!("{:.6}", f.max_intensity),
            ]
        })
        .collect();
    io::write_table(&args.morph_out, &morph_header, &morph_rows)?;

    // Join with the second view, dropping unmapped regions explicitly.
    let mut mapped_header = morph_header.clone();
    mapped_header.push("gt_cell_id".to_string());
    mapped_header.push("true_type".to_string());
    for &c in &view_cols {
        mapped_header.push(barcodes.header[c].clone());
    }

    let mut dropped_unmapped = 0usize;
    let mut dropped_no_view = 0usize;
    let mut mapped_rows: Vec<Vec<String>> = Vec::new();
    for ((feats, gt_id), morph_row) in measured.iter().zip(morph_rows.iter()) {
        if *gt_id == UNMAPPED {
            dropped_unmapped += 1;
            continue;
        }
        let Some((true_type, view_fields)) = view_by_cell.get(gt_id) else {
            dropped_no_view += 1;
            continue;
        };
        let mut row = morph_row.clone();
        row.push(gt_id.to_string());
        row.push(true_type.to_string());
        row.extend(view_fields.iter().cloned());
        debug_assert!(feats.area > 0.0);
        mapped_rows.push(row);
    }
    io::write_table(&args.mapped_out, &mapped_header, &mapped_rows)?;

    if dropped_unmapped > 0 {
        println!(
            "[Filtered] {} region(s) had no ground-truth overlap and were dropped.",
            dropped_unmapped
        );
        logger.log(&format!(
            "Dropped {} unmapped region(s) (reason: no ground-truth overlap)",
            dropped_unmapped
        ))?;
    }
    if dropped_no_view > 0 {
        logger.log(&format!(
            "Dropped {} region(s) (reason: mapped cell missing from second view)",
            dropped_no_view
        ))?;
    }

    let mut metrics = StageMetrics::new("features");
    metrics.set("n_detected_regions", measured.len());
    metrics.set("n_mapped_regions", mapped_rows.len());
    metrics.set("dropped_unmapped_regions", dropped_unmapped);
    metrics.set("dropped_missing_view_rows", dropped_no_view);
    metrics.write()?;

    let elapsed = start_time.elapsed();
    println!("[Output]");
    println!("    Morphology: {}", args.morph_out);
    println!(
        "    Mapped table: {} ({} regions mapped to cells)",
        args.mapped_out,
        mapped_rows.len()
    );
    println!("{}", progress::format_time_used(elapsed));

    logger.log(&format!(
        "Feature extraction completed: {} regions, {} mapped",
        measured.len(),
        mapped_rows.len()
    ))?;
    logger.log(&format!("Total time: {:.2}s", elapsed.as_secs_f64()))?;

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::array;

    fn square_region() -> (Array2<i32>, Array2<f64>) {
        let seg = array![
            [0, 0, 0, 0, 0],
            [0, 1, 1, 1, 0],
            [0, 1, 1, 1, 0],
            [0, 1, 1, 1, 0],
            [0, 0, 0, 0, 0],
        ];
        let image = Array2::from_elem((5, 5), 0.5);
        (seg, image)
    }

    #[test]
    fn square_statistics_are_sane() {
        let (seg, image) = square_region();
        let regions = region_pixels(&seg);
        assert_eq!(regions.len(), 1);
        let (seg_id, pixels) = &regions[0];
        let f = measure_region(*seg_id, pixels, &image, &seg);
        assert_eq!(f.area, 9.0);
        assert!(f.eccentricity < 1e-9, "square should not be eccentric");
        assert_eq!(f.perimeter, 12.0);
        assert!((f.solidity - 1.0).abs() < 1e-9);
        assert!((f.mean_intensity - 0.5).abs() < 1e-12);
        assert!((f.max_intensity - 0.5).abs() < 1e-12);
    }

    #[test]
    fn elongated_region_is_eccentric() {
        let seg = array![[1, 1, 1, 1, 1, 1, 1, 1]];
        let image = Array2::from_elem((1, 8), 1.0);
        let regions = region_pixels(&seg);
        let (seg_id, pixels) = &regions[0];
        let f = measure_region(*seg_id, pixels, &image, &seg);
        assert!(f.eccentricity > 0.9, "line eccentricity was {}", f.eccentricity);
    }

    #[test]
    fn majority_mapping_prefers_greater_overlap() {
        let gt = array![
            [1, 1, 2],
            [1, 1, 2],
            [0, 0, 0],
        ];
        let pixels: Vec<(usize, usize)> =
            vec![(0, 0), (0, 1), (0, 2), (1, 0), (1, 1), (1, 2)];
        assert_eq!(majority_gt_label(&pixels, &gt), 1);
    }

    #[test]
    fn majority_mapping_tie_breaks_to_smaller_id() {
        let gt = array![[2, 2, 7, 7]];
        let pixels: Vec<(usize, usize)> = vec![(0, 0), (0, 1), (0, 2), (0, 3)];
        assert_eq!(majority_gt_label(&pixels, &gt), 2);
    }

    #[test]
    fn zero_overlap_yields_sentinel() {
        let gt = Array2::zeros((3, 3));
        let pixels: Vec<(usize, usize)> = vec![(1, 1), (1, 2)];
        assert_eq!(majority_gt_label(&pixels, &gt), UNMAPPED);
    }

    #[test]
    fn every_reported_region_has_pixels() {
        let (seg, _) = square_region();
        for (_, pixels) in region_pixels(&seg) {
            assert!(!pixels.is_empty());
        }
    }

    #[test]
    fn hollow_region_has_reduced_solidity() {
        // A 3x3 square with the center missing cannot fill its hull.
        let pixels: Vec<(usize, usize)> = vec![
            (0, 0), (0, 1), (0, 2),
            (1, 0),         (1, 2),
            (2, 0), (2, 1), (2, 2),
        ];
        let s = solidity(&pixels);
        assert!((s - 8.0 / 9.0).abs() < 1e-9, "solidity was {}", s);
    }
}
