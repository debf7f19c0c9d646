//! Grid image operations for the segmentation stage: smoothing, thresholding,
//! binary cleanup, the Euclidean distance transform, connected components and
//! marker-based watershed. All operate on `ndarray::Array2` grids with image
//! row 0 at the top.

use ndarray::Array2;
use std::cmp::Ordering;
use std::collections::BinaryHeap;

/// Separable Gaussian blur with a truncated kernel (radius = ceil(3 sigma)).
/// Borders replicate the edge pixel.
pub fn gaussian_blur(image: &Array2<f64>, sigma: f64) -> Array2<f64> {
    if sigma <= 0.0 {
        return image.clone();
    }
    let radius = (3.0 * sigma).ceil() as i64;
    let mut kernel = Vec::with_capacity((2 * radius + 1) as usize);
    let denom = 2.0 * sigma * sigma;
    for k in -radius..=radius {
        kernel.push((-(k * k) as f64 / denom).exp());
    }
    let norm: f64 = kernel.iter().sum();
    for w in kernel.iter_mut() {
        *w /= norm;
    }

    let (h, w) = image.dim();
    let clamp = |v: i64, hi: usize| v.clamp(0, hi as i64 - 1) as usize;

    // Horizontal pass, then vertical.
    let mut tmp = Array2::zeros((h, w));
    for i in 0..h {
        for j in 0..w {
            let mut acc = 0.0;
            for (ki, weight) in kernel.iter().enumerate() {
                let jj = clamp(j as i64 + ki as i64 - radius, w);
                acc += weight * image[[i, jj]];
            }
            tmp[[i, j]] = acc;
        }
    }
    let mut out = Array2::zeros((h, w));
    for i in 0..h {
        for j in 0..w {
            let mut acc = 0.0;
            for (ki, weight) in kernel.iter().enumerate() {
                let ii = clamp(i as i64 + ki as i64 - radius, h);
                acc += weight * tmp[[ii, j]];
            }
            out[[i, j]] = acc;
        }
    }
    out
}

/// Otsu's method: the threshold that maximizes between-class variance over a
/// 256-bin histogram of values clamped to [0,1].
pub fn otsu_threshold(image: &Array2<f64>) -> f64 {
    let mut histogram = vec![0usize; 256];
    let total_pixels = image.len() as f64;

    for &pixel in image.iter() {
        let bin = (pixel.clamp(0.0, 1.0) * 255.0) as usize;
        histogram[bin.min(255)] += 1;
    }

    let mut sum = 0.0;
    for (i, &count) in histogram.iter().enumerate() {
        sum += i as f64 * count as f64;
    }

    let mut sum_b = 0.0;
    let mut weight_b = 0.0;
    let mut max_variance = 0.0;
    let mut threshold = 0.0;

    for (i, &count) in histogram.iter().enumerate() {
        weight_b += count as f64;
        if weight_b == 0.0 {
            continue;
        }
        let weight_f = total_pixels - weight_b;
        if weight_f == 0.0 {
            break;
        }
        sum_b += i as f64 * count as f64;
        let mean_b = sum_b / weight_b;
        let mean_f = (sum - sum_b) / weight_f;
        let variance = weight_b * weight_f * (mean_b - mean_f).powi(2);
        if variance > max_variance {
            max_variance = variance;
            threshold = i as f64;
        }
    }

    threshold / 255.0
}

/// Disk-shaped structuring element as center offsets.
fn disk_offsets(radius: i64) -> Vec<(i64, i64)> {
    let mut offsets = Vec::new();
    for dy in -radius..=radius {
        for dx in -radius..=radius {
            if dy * dy + dx * dx <= radius * radius {
                offsets.push((dy, dx));
            }
        }
    }
    offsets
}

fn erode(mask: &Array2<bool>, offsets: &[(i64, i64)]) -> Array2<bool> {
    let (h, w) = mask.dim();
    let mut out = Array2::from_elem((h, w), false);
    for i in 0..h {
        for j in 0..w {
            if !mask[[i, j]] {
                continue;
            }
            let mut keep = true;
            for &(dy, dx) in offsets {
                let ii = i as i64 + dy;
                let jj = j as i64 + dx;
                if ii < 0 || jj < 0 || ii >= h as i64 || jj >= w as i64 {
                    keep = false; // out of bounds counts as background
                    break;
                }
                if !mask[[ii as usize, jj as usize]] {
                    keep = false;
                    break;
                }
            }
            out[[i, j]] = keep;
        }
    }
    out
}

fn dilate(mask: &Array2<bool>, offsets: &[(i64, i64)]) -> Array2<bool> {
    let (h, w) = mask.dim();
    let mut out = Array2::from_elem((h, w), false);
    for i in 0..h {
        for j in 0..w {
            if !mask[[i, j]] {
                continue;
            }
            for &(dy, dx) in offsets {
                let ii = i as i64 + dy;
                let jj = j as i64 + dx;
                if ii >= 0 && jj >= 0 && ii < h as i64 && jj < w as i64 {
                    out[[ii as usize, jj as usize]] = true;
                }
            }
        }
    }
    out
}

/// Morphological opening (erosion then dilation) with a disk footprint.
pub fn binary_opening(mask: &Array2<bool>, radius: i64) -> Array2<bool> {
    let offsets = disk_offsets(radius);
    dilate(&erode(mask, &offsets), &offsets)
}

/// Zero out connected components smaller than `min_size` pixels.
pub fn remove_small_objects(mask: &Array2<bool>, min_size: usize) -> Array2<bool> {
    let labels = connected_components(mask);
    let n_labels = labels.iter().copied().max().unwrap_or(0) as usize;
    let mut sizes = vec![0usize; n_labels + 1];
    for &l in labels.iter() {
        sizes[l as usize] += 1;
    }
    let mut out = mask.clone();
    for ((i, j), &l) in labels.indexed_iter() {
        if l > 0 && sizes[l as usize] < min_size {
            out[[i, j]] = false;
        }
    }
    out
}

fn find_root(parents: &mut [usize], label: usize) -> usize {
    let mut current = label;
    while current != parents[current] {
        parents[current] = parents[parents[current]]; // path compression
        current = parents[current];
    }
    current
}

fn union_labels(parents: &mut [usize], a: usize, b: usize) {
    let root_a = find_root(parents, a);
    let root_b = find_root(parents, b);
    if root_a != root_b {
        if root_a < root_b {
            parents[root_b] = root_a;
        } else {
            parents[root_a] = root_b;
        }
    }
}

/// Two-pass 4-connected component labeling with union-find. Background is 0;
/// components receive consecutive labels starting from 1 in scan order.
pub fn connected_components(mask: &Array2<bool>) -> Array2<i32> {
    let (h, w) = mask.dim();
    let mut labels: Array2<usize> = Array2::zeros((h, w));
    let mut parents = vec![0usize];
    let mut label_count = 0usize;

    for i in 0..h {
        for j in 0..w {
            if !mask[[i, j]] {
                continue;
            }
            let up = if i > 0 { labels[[i - 1, j]] } else { 0 };
            let left = if j > 0 { labels[[i, j - 1]] } else { 0 };
            match (up, left) {
                (0, 0) => {
                    label_count += 1;
                    parents.push(label_count);
                    labels[[i, j]] = label_count;
                }
                (0, l) | (l, 0) => labels[[i, j]] = l,
                (u, l) => {
                    let min = u.min(l);
                    labels[[i, j]] = min;
                    if u != l {
                        union_labels(&mut parents, u, l);
                    }
                }
            }
        }
    }

    for i in 1..parents.len() {
        find_root(&mut parents, i);
    }

    let mut relabel = vec![0usize; parents.len()];
    let mut next = 0usize;
    for i in 1..parents.len() {
        let root = parents[i];
        if relabel[root] == 0 {
            next += 1;
            relabel[root] = next;
        }
        relabel[i] = relabel[root];
    }

    let mut out: Array2<i32> = Array2::zeros((h, w));
    for ((i, j), &l) in labels.indexed_iter() {
        if l > 0 {
            out[[i, j]] = relabel[l] as i32;
        }
    }
    out
}

// 1-D squared distance transform (lower envelope of parabolas), after
// Felzenszwalb & Huttenlocher. INF stands in for "no site on this scanline".
const DT_INF: f64 = 1e20;

fn distance_transform_1d(f: &[f64]) -> Vec<f64> {
    let n = f.len();
    let mut d = vec![0.0; n];
    let mut v = vec![0usize; n];
    let mut z = vec![0.0f64; n + 1];
    let mut k = 0usize;
    z[0] = -DT_INF;
    z[1] = DT_INF;
    for q in 1..n {
        let intersect = |p: usize, q: usize| -> f64 {
            ((f[q] + (q * q) as f64) - (f[p] + (p * p) as f64)) / (2 * q - 2 * p) as f64
        };
        let mut s = intersect(v[k], q);
        while k > 0 && s <= z[k] {
            k -= 1;
            s = intersect(v[k], q);
        }
        k += 1;
        v[k] = q;
        z[k] = s;
        z[k + 1] = DT_INF;
    }
    k = 0;
    for q in 0..n {
        while z[k + 1] < q as f64 {
            k += 1;
        }
        let dq = q as f64 - v[k] as f64;
        d[q] = dq * dq + f[v[k]];
    }
    d
}

/// Exact Euclidean distance transform: for each foreground pixel, the distance
/// to the nearest background pixel. Background pixels get 0.
pub fn distance_transform(mask: &Array2<bool>) -> Array2<f64> {
    let (h, w) = mask.dim();
    let mut sq: Array2<f64> = Array2::zeros((h, w));
    for ((i, j), &fg) in mask.indexed_iter() {
        sq[[i, j]] = if fg { DT_INF } else { 0.0 };
    }
    // Column pass
    for j in 0..w {
        let col: Vec<f64> = (0..h).map(|i| sq[[i, j]]).collect();
        let d = distance_transform_1d(&col);
        for i in 0..h {
            sq[[i, j]] = d[i];
        }
    }
    // Row pass
    for i in 0..h {
        let row: Vec<f64> = (0..w).map(|j| sq[[i, j]]).collect();
        let d = distance_transform_1d(&row);
        for j in 0..w {
            sq[[i, j]] = d[j];
        }
    }
    sq.mapv(f64::sqrt)
}

/// Linear-interpolation percentile (numpy convention) of a value slice.
/// Returns 0.0 for an empty slice rather than failing; the segmenter simply
/// proceeds with an empty marker set in that degenerate case.
pub fn percentile(values: &[f64], pct: f64) -> f64 {
    if values.is_empty() {
        return 0.0;
    }
    let mut sorted: Vec<f64> = values.to_vec();
    sorted.sort_by(|a, b| a.partial_cmp(b).unwrap_or(Ordering::Equal));
    let rank = (pct / 100.0) * (sorted.len() - 1) as f64;
    let lo = rank.floor() as usize;
    let hi = rank.ceil() as usize;
    if lo == hi {
        sorted[lo]
    } else {
        let frac = rank - lo as f64;
        sorted[lo] * (1.0 - frac) + sorted[hi] * frac
    }
}

struct FloodPixel {
    elevation: f64,
    order: u64,
    row: usize,
    col: usize,
    label: i32,
}

impl PartialEq for FloodPixel {
    fn eq(&self, other: &Self) -> bool {
        self.elevation == other.elevation && self.order == other.order
    }
}
impl Eq for FloodPixel {}

// BinaryHeap is a max-heap; invert so the lowest elevation floods first, with
// insertion order as the deterministic tie-break.
impl Ord for FloodPixel {
    fn cmp(&self, other: &Self) -> Ordering {
        other
            .elevation
            .partial_cmp(&self.elevation)
            .unwrap_or(Ordering::Equal)
            .then_with(|| other.order.cmp(&self.order))
    }
}
impl PartialOrd for FloodPixel {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

/// Marker-based watershed: flood the elevation surface from the marker pixels,
/// constrained to `mask`. Each masked pixel receives the label of the first
/// marker basin to reach it in elevation order.
pub fn watershed(
    elevation: &Array2<f64>,
    markers: &Array2<i32>,
    mask: &Array2<bool>,
) -> Array2<i32> {
    let (h, w) = elevation.dim();
    let mut labels: Array2<i32> = Array2::zeros((h, w));
    let mut queued: Array2<bool> = Array2::from_elem((h, w), false);
    let mut heap: BinaryHeap<FloodPixel> = BinaryHeap::new();
    let mut order = 0u64;

    for ((i, j), &m) in markers.indexed_iter() {
        if m > 0 && mask[[i, j]] {
            labels[[i, j]] = m;
            queued[[i, j]] = true;
            heap.push(FloodPixel {
                elevation: elevation[[i, j]],
                order,
                row: i,
                col: j,
                label: m,
            });
            order += 1;
        }
    }

    const NEIGHBORS: [(i64, i64); 4] = [(-1, 0), (1, 0), (0, -1), (0, 1)];
    while let Some(px) = heap.pop() {
        for &(dy, dx) in NEIGHBORS.iter() {
            let ii = px.row as i64 + dy;
            let jj = px.col as i64 + dx;
            if ii < 0 || jj < 0 || ii >= h as i64 || jj >= w as i64 {
                continue;
            }
            let (ii, jj) = (ii as usize, jj as usize);
            if queued[[ii, jj]] || !mask[[ii, jj]] {
                continue;
            }
            labels[[ii, jj]] = px.label;
            queued[[ii, jj]] = true;
            heap.push(FloodPixel {
                elevation: elevation[[ii, jj]],
                order,
                row: ii,
                col: jj,
                label: px.label,
            });
            order += 1;
        }
    }

    labels
}

#[cfg(test)]
mod tests {
    use super::*;

    fn mask_from(pattern: &[&[i32]]) -> Array2<bool> {
        let h = pattern.len();
        let w = pattern[0].len();
        let mut mask = Array2::from_elem((h, w), false);
        for (i, row) in pattern.iter().enumerate() {
            for (j, &v) in row.iter().enumerate() {
                mask[[i, j]] = v != 0;
            }
        }
        mask
    }

    #[test]
    fn otsu_separates_bimodal_values() {
        let mut image = Array2::from_elem((8, 8), 0.1);
        for i in 0..4 {
            for j in 0..4 {
                image[[i, j]] = 0.9;
            }
        }
        let thr = otsu_threshold(&image);
        assert!(thr > 0.1 && thr < 0.9, "threshold {} not between modes", thr);
    }

    #[test]
    fn blur_preserves_constant_images() {
        let image = Array2::from_elem((10, 10), 0.5);
        let blurred = gaussian_blur(&image, 1.0);
        for &v in blurred.iter() {
            assert!((v - 0.5).abs() < 1e-9);
        }
    }

    #[test]
    fn components_are_separated_and_consecutive() {
        let mask = mask_from(&[
            &[0, 0, 0, 0, 0],
            &[0, 1, 1, 0, 0],
            &[0, 1, 1, 0, 0],
            &[0, 0, 0, 1, 0],
            &[0, 0, 0, 0, 0],
        ]);
        let labels = connected_components(&mask);
        assert_eq!(labels[[1, 1]], 1);
        assert_eq!(labels[[3, 3]], 2);
        assert_eq!(labels.iter().copied().max().unwrap(), 2);
    }

    #[test]
    fn u_shape_resolves_label_equivalence() {
        let mask = mask_from(&[
            &[0, 0, 0, 0, 0],
            &[0, 1, 0, 1, 0],
            &[0, 1, 0, 1, 0],
            &[0, 1, 1, 1, 0],
            &[0, 0, 0, 0, 0],
        ]);
        let labels = connected_components(&mask);
        let max = labels.iter().copied().max().unwrap();
        assert_eq!(max, 1, "U shape must be one component");
    }

    #[test]
    fn small_objects_are_removed() {
        let mask = mask_from(&[
            &[1, 1, 0, 0, 0],
            &[1, 1, 0, 0, 1],
            &[0, 0, 0, 0, 0],
        ]);
        let cleaned = remove_small_objects(&mask, 2);
        assert!(cleaned[[0, 0]]);
        assert!(!cleaned[[1, 4]]);
    }

    #[test]
    fn distance_transform_matches_hand_computed_values() {
        let mask = mask_from(&[
            &[0, 0, 0, 0, 0],
            &[0, 1, 1, 1, 0],
            &[0, 1, 1, 1, 0],
            &[0, 1, 1, 1, 0],
            &[0, 0, 0, 0, 0],
        ]);
        let dist = distance_transform(&mask);
        assert_eq!(dist[[0, 0]], 0.0);
        assert!((dist[[1, 1]] - 1.0).abs() < 1e-9);
        assert!((dist[[2, 2]] - 2.0).abs() < 1e-9);
    }

    #[test]
    fn percentile_interpolates_linearly() {
        let values = vec![0.0, 1.0, 2.0, 3.0];
        assert!((percentile(&values, 50.0) - 1.5).abs() < 1e-12);
        assert_eq!(percentile(&values, 0.0), 0.0);
        assert_eq!(percentile(&values, 100.0), 3.0);
        assert_eq!(percentile(&[], 75.0), 0.0);
    }

    #[test]
    fn watershed_labels_stay_inside_mask_and_split_basins() {
        // Two plateaus joined by a shallow bridge; each marker claims its side.
        let mask = mask_from(&[
            &[1, 1, 1, 1, 1, 1, 1],
            &[1, 1, 1, 1, 1, 1, 1],
            &[1, 1, 1, 1, 1, 1, 1],
        ]);
        let dist = distance_transform(&mask);
        let mut markers: Array2<i32> = Array2::zeros((3, 7));
        markers[[1, 1]] = 1;
        markers[[1, 5]] = 2;
        let elevation = dist.mapv(|v| -v);
        let labels = watershed(&elevation, &markers, &mask);
        assert_eq!(labels[[1, 0]], 1);
        assert_eq!(labels[[1, 6]], 2);
        for ((i, j), &l) in labels.indexed_iter() {
            if l > 0 {
                assert!(mask[[i, j]], "label outside mask at ({}, {})", i, j);
            }
        }
        // Every masked pixel is reached.
        assert!(labels.iter().all(|&l| l > 0));
    }
}
