//! SAD block matcher over a rectified stereo pair.

use stereo_calib_core::{DisparityMap, GrayImage};

/// Bounded matcher tunables. Defaults follow the OpenCV-conventional
/// values of the original tool where its revisions agreed.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct MatcherParams {
    /// Smallest disparity searched; may be negative.
    pub min_disparity: i32,
    /// Odd SAD window edge length.
    pub block_size: usize,
    /// Number of disparities searched, multiple of 16.
    pub num_disparities: usize,
    /// Max allowed left/right disparity difference; negative disables.
    pub disp12_max_diff: i32,
    /// Clamp for the x-derivative prefilter.
    pub prefilter_cap: i32,
    /// Margin (percent) by which the best cost must beat the runner-up.
    pub uniqueness_ratio: i32,
    /// Blobs smaller than this are treated as speckle noise; 0 disables.
    pub speckle_window_size: usize,
    /// Max disparity variation within a speckle component.
    pub speckle_range: i32,
    /// Smoothness penalty for +-1 disparity steps against the left
    /// neighbor. 0 disables.
    pub p1: i32,
    /// Smoothness penalty for larger disparity jumps. 0 disables.
    pub p2: i32,
}

impl Default for MatcherParams {
    fn default() -> Self {
        Self {
            min_disparity: 0,
            block_size: 21,
            num_disparities: 64,
            disp12_max_diff: -1,
            prefilter_cap: 31,
            uniqueness_ratio: 15,
            speckle_window_size: 0,
            speckle_range: 1,
            p1: 0,
            p2: 0,
        }
    }
}

/// SAD block matcher producing a signed disparity map aligned to the
/// rectified image size. Pixels with no acceptable match are set to
/// `min_disparity - 1`.
#[derive(Clone, Debug, Default)]
pub struct BlockMatcher {
    pub params: MatcherParams,
}

impl BlockMatcher {
    pub fn new(params: MatcherParams) -> Self {
        Self { params }
    }

    /// Value written into pixels without a valid match.
    #[inline]
    pub fn invalid_value(&self) -> i16 {
        (self.params.min_disparity - 1) as i16
    }

    pub fn compute(&self, left: &GrayImage, right: &GrayImage) -> DisparityMap {
        debug_assert_eq!(left.width, right.width);
        debug_assert_eq!(left.height, right.height);

        let width = left.width;
        let height = left.height;
        let half = (self.params.block_size / 2) as i32;
        let invalid = self.invalid_value();

        let left_f = prefilter(left, self.params.prefilter_cap);
        let right_f = prefilter(right, self.params.prefilter_cap);

        let mut disp = DisparityMap::new(width, height);
        disp.data.fill(invalid);

        for y in half..height as i32 - half {
            let mut prev_d: Option<i32> = None;
            for x in half..width as i32 - half {
                let d = self.match_pixel(&left_f, &right_f, width, x, y, half, prev_d);
                prev_d = d;
                if let Some(d) = d {
                    disp.data[y as usize * width + x as usize] = d as i16;
                }
            }
        }

        if self.params.disp12_max_diff >= 0 {
            self.left_right_check(&left_f, &right_f, width, height, half, &mut disp);
        }
        if self.params.speckle_window_size > 0 {
            filter_speckles(
                &mut disp,
                self.params.speckle_window_size,
                self.params.speckle_range,
                invalid,
            );
        }
        disp
    }

    /// Find the disparity minimizing block SAD for the left pixel (x, y).
    fn match_pixel(
        &self,
        left: &[i32],
        right: &[i32],
        width: usize,
        x: i32,
        y: i32,
        half: i32,
        prev_d: Option<i32>,
    ) -> Option<i32> {
        let mut best_cost = i64::MAX;
        let mut second_cost = i64::MAX;
        let mut best_d = None;

        let min_d = self.params.min_disparity;
        let max_d = min_d + self.params.num_disparities as i32;
        for d in min_d..max_d {
            let rx = x - d;
            if rx - half < 0 || rx + half >= width as i32 {
                continue;
            }
            let mut cost = block_sad(left, right, width, x, rx, y, half);
            if let Some(pd) = prev_d {
                let jump = (d - pd).abs();
                if jump == 1 {
                    cost += i64::from(self.params.p1);
                } else if jump > 1 {
                    cost += i64::from(self.params.p2);
                }
            }
            if cost < best_cost {
                second_cost = best_cost;
                best_cost = cost;
                best_d = Some(d);
            } else if cost < second_cost {
                second_cost = cost;
            }
        }

        let best_d = best_d?;
        // Uniqueness: runner-up must be worse by the configured margin.
        if second_cost != i64::MAX
            && best_cost * (100 + i64::from(self.params.uniqueness_ratio)) >= second_cost * 100
            && self.params.uniqueness_ratio > 0
        {
            return None;
        }
        Some(best_d)
    }

    /// Invalidate pixels whose disparity is inconsistent with the best
    /// match found from the right image.
    fn left_right_check(
        &self,
        left: &[i32],
        right: &[i32],
        width: usize,
        height: usize,
        half: i32,
        disp: &mut DisparityMap,
    ) {
        let invalid = self.invalid_value();
        let min_d = self.params.min_disparity;
        let max_d = min_d + self.params.num_disparities as i32;
        for y in half..height as i32 - half {
            for x in half..width as i32 - half {
                let idx = y as usize * width + x as usize;
                let d = i32::from(disp.data[idx]);
                if d < min_d {
                    continue;
                }
                let rx = x - d;
                // Match the right pixel back against the left image.
                let mut best_cost = i64::MAX;
                let mut best_rd = d;
                for rd in min_d..max_d {
                    let lx = rx + rd;
                    if lx - half < 0 || lx + half >= width as i32 {
                        continue;
                    }
                    let cost = block_sad(left, right, width, lx, rx, y, half);
                    if cost < best_cost {
                        best_cost = cost;
                        best_rd = rd;
                    }
                }
                if (best_rd - d).abs() > self.params.disp12_max_diff {
                    disp.data[idx] = invalid;
                }
            }
        }
    }
}

/// Clamped x-derivative prefilter; makes the SAD robust to brightness
/// offsets between the two cameras.
fn prefilter(img: &GrayImage, cap: i32) -> Vec<i32> {
    let cap = cap.max(1);
    let mut out = vec![0i32; img.width * img.height];
    for y in 0..img.height {
        for x in 0..img.width {
            let left = if x > 0 { img.get(x - 1, y) } else { img.get(x, y) };
            let right = if x + 1 < img.width {
                img.get(x + 1, y)
            } else {
                img.get(x, y)
            };
            let dx = i32::from(right) - i32::from(left);
            out[y * img.width + x] = dx.clamp(-cap, cap) + cap;
        }
    }
    out
}

#[inline]
fn block_sad(left: &[i32], right: &[i32], width: usize, lx: i32, rx: i32, y: i32, half: i32) -> i64 {
    let mut sum = 0i64;
    for dy in -half..=half {
        let row = (y + dy) as usize * width;
        for dx in -half..=half {
            let lv = left[row + (lx + dx) as usize];
            let rv = right[row + (rx + dx) as usize];
            sum += i64::from((lv - rv).abs());
        }
    }
    sum
}

/// Invalidate connected components smaller than `max_size` whose members
/// differ by at most `range` in disparity.
fn filter_speckles(disp: &mut DisparityMap, max_size: usize, range: i32, invalid: i16) {
    let width = disp.width;
    let height = disp.height;
    let mut labels = vec![0u32; width * height];
    let mut next_label = 1u32;
    let mut stack = Vec::new();
    let mut component = Vec::new();

    for start in 0..width * height {
        if labels[start] != 0 || disp.data[start] == invalid {
            continue;
        }
        component.clear();
        stack.push(start);
        labels[start] = next_label;
        while let Some(idx) = stack.pop() {
            component.push(idx);
            let (x, y) = (idx % width, idx / width);
            let d = i32::from(disp.data[idx]);
            let mut visit = |nx: usize, ny: usize| {
                let nidx = ny * width + nx;
                if labels[nidx] == 0
                    && disp.data[nidx] != invalid
                    && (i32::from(disp.data[nidx]) - d).abs() <= range
                {
                    labels[nidx] = next_label;
                    stack.push(nidx);
                }
            };
            if x > 0 {
                visit(x - 1, y);
            }
            if x + 1 < width {
                visit(x + 1, y);
            }
            if y > 0 {
                visit(x, y - 1);
            }
            if y + 1 < height {
                visit(x, y + 1);
            }
        }
        if component.len() < max_size {
            for &idx in &component {
                disp.data[idx] = invalid;
            }
        }
        next_label += 1;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Textured test image; the right view is the left shifted by `shift`.
    fn shifted_pair(width: usize, height: usize, shift: usize) -> (GrayImage, GrayImage) {
        let mut left = GrayImage::new(width, height);
        for y in 0..height {
            for x in 0..width {
                // Deterministic texture with horizontal variation.
                let v = ((x * 37 + y * 17) % 251) as u8;
                left.set(x, y, v);
            }
        }
        let mut right = GrayImage::new(width, height);
        for y in 0..height {
            for x in 0..width {
                let sx = (x + shift).min(width - 1);
                right.set(x, y, left.get(sx, y));
            }
        }
        (left, right)
    }

    #[test]
    fn recovers_constant_shift() {
        let shift = 4usize;
        let (left, right) = shifted_pair(64, 32, shift);
        let matcher = BlockMatcher::new(MatcherParams {
            block_size: 7,
            num_disparities: 16,
            uniqueness_ratio: 0,
            ..MatcherParams::default()
        });
        let disp = matcher.compute(&left, &right);

        let mut hits = 0usize;
        let mut total = 0usize;
        for y in 8..24 {
            for x in 16..48 {
                let d = disp.get(x, y);
                if d != matcher.invalid_value() {
                    total += 1;
                    if d == shift as i16 {
                        hits += 1;
                    }
                }
            }
        }
        assert!(total > 0);
        assert!(
            hits * 10 >= total * 9,
            "expected >=90% of valid pixels at disparity {shift}, got {hits}/{total}"
        );
    }

    #[test]
    fn invalid_value_tracks_min_disparity() {
        let matcher = BlockMatcher::new(MatcherParams {
            min_disparity: -8,
            ..MatcherParams::default()
        });
        assert_eq!(matcher.invalid_value(), -9);
    }

    #[test]
    fn speckle_filter_removes_small_islands() {
        let mut disp = DisparityMap::new(8, 8);
        disp.data.fill(-1); // invalid
        // A 2-pixel island of valid disparity.
        disp.data[3 * 8 + 3] = 5;
        disp.data[3 * 8 + 4] = 5;
        filter_speckles(&mut disp, 4, 1, -1);
        assert_eq!(disp.data[3 * 8 + 3], -1);
        assert_eq!(disp.data[3 * 8 + 4], -1);
    }

    #[test]
    fn speckle_filter_keeps_large_regions() {
        let mut disp = DisparityMap::new(8, 8);
        disp.data.fill(7);
        filter_speckles(&mut disp, 4, 1, -1);
        assert!(disp.data.iter().all(|&d| d == 7));
    }
}
