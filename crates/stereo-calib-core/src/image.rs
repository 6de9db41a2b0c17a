/// Borrowed grayscale buffer, row-major, `len = width * height`.
#[derive(Clone, Copy, Debug)]
pub struct GrayImageView<'a> {
    pub width: usize,
    pub height: usize,
    pub data: &'a [u8],
}

/// Owned grayscale buffer, row-major.
#[derive(Clone, Debug, PartialEq)]
pub struct GrayImage {
    pub width: usize,
    pub height: usize,
    pub data: Vec<u8>,
}

impl GrayImage {
    pub fn new(width: usize, height: usize) -> Self {
        Self {
            width,
            height,
            data: vec![0; width * height],
        }
    }

    pub fn as_view(&self) -> GrayImageView<'_> {
        GrayImageView {
            width: self.width,
            height: self.height,
            data: &self.data,
        }
    }

    #[inline]
    pub fn get(&self, x: usize, y: usize) -> u8 {
        self.data[y * self.width + x]
    }

    #[inline]
    pub fn set(&mut self, x: usize, y: usize, v: u8) {
        self.data[y * self.width + x] = v;
    }

    /// Place `self` and `other` side by side, left then right.
    /// Both images must share the same height.
    pub fn side_by_side(&self, other: &GrayImage) -> GrayImage {
        debug_assert_eq!(self.height, other.height);
        let mut out = GrayImage::new(self.width + other.width, self.height);
        for y in 0..self.height {
            let row = y * out.width;
            out.data[row..row + self.width]
                .copy_from_slice(&self.data[y * self.width..(y + 1) * self.width]);
            out.data[row + self.width..row + out.width]
                .copy_from_slice(&other.data[y * other.width..(y + 1) * other.width]);
        }
        out
    }

    /// Draw full-width horizontal lines every `interval` rows. An
    /// interval of 0 is treated as 1.
    pub fn draw_horizontal_lines(&mut self, interval: usize, value: u8) {
        let interval = interval.max(1);
        let mut y = 0;
        while y < self.height {
            let row = y * self.width;
            self.data[row..row + self.width].fill(value);
            y += interval;
        }
    }
}

#[inline]
fn get_gray(src: &GrayImageView<'_>, x: i32, y: i32) -> u8 {
    if x < 0 || y < 0 || x >= src.width as i32 || y >= src.height as i32 {
        return 0;
    }
    src.data[y as usize * src.width + x as usize]
}

#[inline]
pub fn sample_bilinear(src: &GrayImageView<'_>, x: f32, y: f32) -> f32 {
    let x0 = x.floor() as i32;
    let y0 = y.floor() as i32;
    let fx = x - x0 as f32;
    let fy = y - y0 as f32;

    let p00 = get_gray(src, x0, y0) as f32;
    let p10 = get_gray(src, x0 + 1, y0) as f32;
    let p01 = get_gray(src, x0, y0 + 1) as f32;
    let p11 = get_gray(src, x0 + 1, y0 + 1) as f32;

    let a = p00 + fx * (p10 - p00);
    let b = p01 + fx * (p11 - p01);
    a + fy * (b - a)
}

#[inline]
pub fn sample_bilinear_u8(src: &GrayImageView<'_>, x: f32, y: f32) -> u8 {
    sample_bilinear(src, x, y).clamp(0.0, 255.0) as u8
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bilinear_interpolates_between_pixels() {
        let img = GrayImage {
            width: 2,
            height: 1,
            data: vec![0, 100],
        };
        let v = sample_bilinear(&img.as_view(), 0.5, 0.0);
        assert!((v - 50.0).abs() < 1e-5);
    }

    #[test]
    fn side_by_side_keeps_rows_aligned() {
        let left = GrayImage {
            width: 2,
            height: 2,
            data: vec![1, 2, 3, 4],
        };
        let right = GrayImage {
            width: 1,
            height: 2,
            data: vec![9, 8],
        };
        let pair = left.side_by_side(&right);
        assert_eq!(pair.width, 3);
        assert_eq!(pair.data, vec![1, 2, 9, 3, 4, 8]);
    }

    #[test]
    fn horizontal_lines_hit_every_interval() {
        let mut img = GrayImage::new(2, 5);
        img.draw_horizontal_lines(2, 255);
        for y in 0..5 {
            let expected = if y % 2 == 0 { 255 } else { 0 };
            assert_eq!(img.get(0, y), expected, "row {y}");
        }
    }

    #[test]
    fn zero_line_interval_fills_every_row() {
        let mut img = GrayImage::new(2, 3);
        img.draw_horizontal_lines(0, 255);
        assert!(img.data.iter().all(|&v| v == 255));
    }
}
