//! Face alignment to the canonical ArcFace crop.
//!
//! Fits a 4-DOF similarity transform (scale, rotation, translation) from the
//! five detected landmarks to the InsightFace reference points, then warps
//! the RGB frame into a 112×112 crop.

use crate::types::Landmarks;
use image::{Rgb, RgbImage};

/// ArcFace reference landmarks for a 112×112 output.
pub const REFERENCE_LANDMARKS_112: Landmarks = [
    (38.2946, 51.6963), // left eye
    (73.5318, 51.5014), // right eye
    (56.0252, 71.7366), // nose
    (41.5493, 92.3655), // left mouth
    (70.7299, 92.2041), // right mouth
];

pub const ALIGNED_SIZE: u32 = 112;

/// x' = a·x − b·y + tx,  y' = b·x + a·y + ty
#[derive(Debug, Clone, Copy, PartialEq)]
struct Similarity {
    a: f32,
    b: f32,
    tx: f32,
    ty: f32,
}

impl Similarity {
    /// Least-squares fit mapping `src` points onto `dst` points.
    fn fit(src: &Landmarks, dst: &Landmarks) -> Option<Self> {
        // Unknowns p = [a, b, tx, ty]; each pair contributes two rows:
        //   [sx, -sy, 1, 0]·p = dx
        //   [sy,  sx, 0, 1]·p = dy
        // Normal equations (AᵀA)p = Aᵀd.
        let mut ata = [[0.0f64; 4]; 4];
        let mut atd = [0.0f64; 4];

        for (&(sx, sy), &(dx, dy)) in src.iter().zip(dst.iter()) {
            let (sx, sy, dx, dy) = (sx as f64, sy as f64, dx as f64, dy as f64);
            for (row, rhs) in [([sx, -sy, 1.0, 0.0], dx), ([sy, sx, 0.0, 1.0], dy)] {
                for j in 0..4 {
                    for k in 0..4 {
                        ata[j][k] += row[j] * row[k];
                    }
                    atd[j] += row[j] * rhs;
                }
            }
        }

        let p = solve4(ata, atd)?;
        Some(Self {
            a: p[0] as f32,
            b: p[1] as f32,
            tx: p[2] as f32,
            ty: p[3] as f32,
        })
    }

    /// Map an output coordinate back into the source frame.
    fn invert_point(&self, x: f32, y: f32) -> Option<(f32, f32)> {
        let det = self.a * self.a + self.b * self.b;
        if det < 1e-12 {
            return None;
        }
        let (dx, dy) = (x - self.tx, y - self.ty);
        Some((
            (self.a * dx + self.b * dy) / det,
            (-self.b * dx + self.a * dy) / det,
        ))
    }
}

/// Gaussian elimination with partial pivoting; `None` if singular.
fn solve4(mut m: [[f64; 4]; 4], mut rhs: [f64; 4]) -> Option<[f64; 4]> {
    for col in 0..4 {
        let pivot_row = (col..4)
            .max_by(|&i, &j| m[i][col].abs().total_cmp(&m[j][col].abs()))
            .unwrap_or(col);
        m.swap(col, pivot_row);
        rhs.swap(col, pivot_row);

        let pivot = m[col][col];
        if pivot.abs() < 1e-12 {
            return None;
        }
        for row in (col + 1)..4 {
            let factor = m[row][col] / pivot;
            for k in col..4 {
                m[row][k] -= factor * m[col][k];
            }
            rhs[row] -= factor * rhs[col];
        }
    }

    let mut x = [0.0f64; 4];
    for i in (0..4).rev() {
        let tail: f64 = ((i + 1)..4).map(|j| m[i][j] * x[j]).sum();
        x[i] = (rhs[i] - tail) / m[i][i];
    }
    Some(x)
}

/// Bilinear sample of one pixel; out-of-frame neighbours count as black.
fn sample_bilinear(image: &RgbImage, sx: f32, sy: f32) -> Rgb<u8> {
    let (w, h) = (image.width() as i64, image.height() as i64);
    let x0 = sx.floor() as i64;
    let y0 = sy.floor() as i64;
    let fx = sx - x0 as f32;
    let fy = sy - y0 as f32;

    let px = |x: i64, y: i64| -> [f32; 3] {
        if x >= 0 && x < w && y >= 0 && y < h {
            let p = image.get_pixel(x as u32, y as u32).0;
            [p[0] as f32, p[1] as f32, p[2] as f32]
        } else {
            [0.0; 3]
        }
    };

    let (tl, tr, bl, br) = (px(x0, y0), px(x0 + 1, y0), px(x0, y0 + 1), px(x0 + 1, y0 + 1));
    let mut out = [0u8; 3];
    for c in 0..3 {
        let top = tl[c] * (1.0 - fx) + tr[c] * fx;
        let bot = bl[c] * (1.0 - fx) + br[c] * fx;
        out[c] = (top * (1.0 - fy) + bot * fy).round().clamp(0.0, 255.0) as u8;
    }
    Rgb(out)
}

/// Warp the face described by `landmarks` into a 112×112 aligned crop.
///
/// A degenerate landmark set yields an all-black crop.
pub fn align_face(image: &RgbImage, landmarks: &Landmarks) -> RgbImage {
    let mut out = RgbImage::new(ALIGNED_SIZE, ALIGNED_SIZE);
    let Some(transform) = Similarity::fit(landmarks, &REFERENCE_LANDMARKS_112) else {
        return out;
    };

    for (ox, oy, pixel) in out.enumerate_pixels_mut() {
        if let Some((sx, sy)) = transform.invert_point(ox as f32, oy as f32) {
            *pixel = sample_bilinear(image, sx, sy);
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_identity_fit() {
        let t = Similarity::fit(&REFERENCE_LANDMARKS_112, &REFERENCE_LANDMARKS_112).unwrap();
        assert!((t.a - 1.0).abs() < 1e-4, "a = {}", t.a);
        assert!(t.b.abs() < 1e-4, "b = {}", t.b);
        assert!(t.tx.abs() < 1e-3, "tx = {}", t.tx);
        assert!(t.ty.abs() < 1e-3, "ty = {}", t.ty);
    }

    #[test]
    fn test_scaled_fit() {
        // Source landmarks at 2x scale → a ≈ 0.5
        let src = REFERENCE_LANDMARKS_112.map(|(x, y)| (x * 2.0, y * 2.0));
        let t = Similarity::fit(&src, &REFERENCE_LANDMARKS_112).unwrap();
        assert!((t.a - 0.5).abs() < 1e-3, "a = {}", t.a);
        assert!(t.b.abs() < 1e-3, "b = {}", t.b);
    }

    #[test]
    fn test_degenerate_landmarks() {
        let collapsed = [(10.0, 10.0); 5];
        assert!(Similarity::fit(&collapsed, &REFERENCE_LANDMARKS_112).is_none());
        let img = RgbImage::from_pixel(64, 64, Rgb([200, 200, 200]));
        let out = align_face(&img, &collapsed);
        assert!(out.pixels().all(|p| p.0 == [0, 0, 0]));
    }

    #[test]
    fn test_align_output_size_and_color() {
        let img = RgbImage::from_pixel(640, 480, Rgb([10, 120, 250]));
        let landmarks = REFERENCE_LANDMARKS_112.map(|(x, y)| (x + 200.0, y + 150.0));
        let out = align_face(&img, &landmarks);
        assert_eq!(out.dimensions(), (ALIGNED_SIZE, ALIGNED_SIZE));
        assert_eq!(out.get_pixel(56, 56).0, [10, 120, 250]);
    }

    #[test]
    fn test_landmark_lands_on_reference() {
        let mut img = RgbImage::new(200, 200);
        let src: Landmarks = [
            (80.0, 60.0),
            (120.0, 60.0),
            (100.0, 85.0),
            (85.0, 110.0),
            (115.0, 110.0),
        ];
        // 5x5 red patch at the left eye survives bilinear sampling
        for dy in 0..5 {
            for dx in 0..5 {
                img.put_pixel(78 + dx, 58 + dy, Rgb([255, 0, 0]));
            }
        }

        let aligned = align_face(&img, &src);
        let (rx, ry) = REFERENCE_LANDMARKS_112[0];
        let (rx, ry) = (rx.round() as u32, ry.round() as u32);
        let max_red = (rx - 1..=rx + 1)
            .flat_map(|x| (ry - 1..=ry + 1).map(move |y| (x, y)))
            .map(|(x, y)| aligned.get_pixel(x, y).0[0])
            .max()
            .unwrap();
        assert!(max_red > 100, "expected red near reference left eye, max={max_red}");
    }
}
