//! Spatial resampling: bilinear interpolation and pooling.

use ndarray::{Array1, Array3};

/// Bilinear resize of a (C, H, W) map to (C, out_h, out_w).
///
/// Half-pixel centre convention (align_corners = false); source coordinates
/// are clamped at the borders.
pub fn bilinear_resize(x: &Array3<f32>, out_h: usize, out_w: usize) -> Array3<f32> {
    let (c, h, w) = x.dim();
    if (h, w) == (out_h, out_w) {
        return x.clone();
    }

    let scale_y = h as f32 / out_h as f32;
    let scale_x = w as f32 / out_w as f32;

    let mut out = Array3::zeros((c, out_h, out_w));
    for oy in 0..out_h {
        let sy = ((oy as f32 + 0.5) * scale_y - 0.5).max(0.0);
        let y0 = (sy.floor() as usize).min(h - 1);
        let y1 = (y0 + 1).min(h - 1);
        let fy = sy - y0 as f32;
        for ox in 0..out_w {
            let sx = ((ox as f32 + 0.5) * scale_x - 0.5).max(0.0);
            let x0 = (sx.floor() as usize).min(w - 1);
            let x1 = (x0 + 1).min(w - 1);
            let fx = sx - x0 as f32;
            for ch in 0..c {
                let top = x[[ch, y0, x0]] * (1.0 - fx) + x[[ch, y0, x1]] * fx;
                let bottom = x[[ch, y1, x0]] * (1.0 - fx) + x[[ch, y1, x1]] * fx;
                out[[ch, oy, ox]] = top * (1.0 - fy) + bottom * fy;
            }
        }
    }
    out
}

/// Global average pooling: per-channel mean of a (C, H, W) map.
pub fn global_avg_pool(x: &Array3<f32>) -> Array1<f32> {
    let (c, h, w) = x.dim();
    let denom = (h * w) as f32;
    Array1::from_iter(x.outer_iter().map(|plane| plane.sum() / denom.max(1.0)))
}

/// 2x2 average-pool downsampling (floor semantics on odd sizes).
pub fn avg_pool2(x: &Array3<f32>) -> Array3<f32> {
    let (c, h, w) = x.dim();
    let out_h = (h / 2).max(1);
    let out_w = (w / 2).max(1);
    let mut out = Array3::zeros((c, out_h, out_w));
    for ch in 0..c {
        for oy in 0..out_h {
            for ox in 0..out_w {
                let y = (oy * 2).min(h - 1);
                let xx = (ox * 2).min(w - 1);
                let y1 = (y + 1).min(h - 1);
                let x1 = (xx + 1).min(w - 1);
                out[[ch, oy, ox]] = 0.25
                    * (x[[ch, y, xx]] + x[[ch, y, x1]] + x[[ch, y1, xx]] + x[[ch, y1, x1]]);
            }
        }
    }
    out
}
