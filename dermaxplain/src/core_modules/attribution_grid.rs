// THEORY:
// An `AttributionGrid` is the ephemeral product of both engines: one scalar per
// canonical cell, tagged with the class it explains. It is never persisted; the
// renderer consumes it and only the encoded overlay survives the job.
//
// Normalization is where the two engines differ:
// - occlusion scores are magnitudes, mapped to [0, 1] by min-max;
// - sampling scores are signed, scaled into [-1, 1] by the largest magnitude so
//   that a cell opposing the class stays negative.
// Both treat a flat grid as "no evidence" and return zeros instead of dividing by
// a zero range.

const FLAT_EPSILON: f32 = 1e-9;

#[derive(Debug, Clone, PartialEq)]
pub struct AttributionGrid {
    width: u32,
    height: u32,
    values: Vec<f32>,
    /// Index into the class set of the class this grid explains.
    pub target_class: usize,
}

impl AttributionGrid {
    pub fn zeros(width: u32, height: u32, target_class: usize) -> Self {
        Self {
            width,
            height,
            values: vec![0.0; (width * height) as usize],
            target_class,
        }
    }

    /// Returns `None` when `values` does not hold exactly `width * height` cells.
    pub fn from_values(width: u32, height: u32, values: Vec<f32>, target_class: usize) -> Option<Self> {
        if values.len() != (width as usize) * (height as usize) {
            return None;
        }
        Some(Self {
            width,
            height,
            values,
            target_class,
        })
    }

    pub fn width(&self) -> u32 {
        self.width
    }

    pub fn height(&self) -> u32 {
        self.height
    }

    pub fn dims(&self) -> (u32, u32) {
        (self.width, self.height)
    }

    pub fn values(&self) -> &[f32] {
        &self.values
    }

    pub fn get(&self, x: u32, y: u32) -> f32 {
        self.values[(y * self.width + x) as usize]
    }

    pub fn min(&self) -> f32 {
        self.values.iter().copied().fold(f32::INFINITY, f32::min)
    }

    pub fn max(&self) -> f32 {
        self.values.iter().copied().fold(f32::NEG_INFINITY, f32::max)
    }

    pub fn is_finite(&self) -> bool {
        self.values.iter().all(|v| v.is_finite())
    }

    /// Min-max maps every cell into [0, 1]. A flat grid becomes all zeros.
    pub fn normalize_unit(&self) -> Self {
        let (min, max) = (self.min(), self.max());
        let range = max - min;
        let values = if self.values.is_empty() || !range.is_finite() || range <= FLAT_EPSILON {
            vec![0.0; self.values.len()]
        } else {
            self.values.iter().map(|v| ((v - min) / range).clamp(0.0, 1.0)).collect()
        };
        Self {
            values,
            ..self.clone()
        }
    }

    /// Scales into [-1, 1] by the largest magnitude, preserving each cell's sign.
    pub fn normalize_signed(&self) -> Self {
        let peak = self.values.iter().fold(0f32, |acc, v| acc.max(v.abs()));
        let values = if !peak.is_finite() || peak <= FLAT_EPSILON {
            vec![0.0; self.values.len()]
        } else {
            self.values.iter().map(|v| (v / peak).clamp(-1.0, 1.0)).collect()
        };
        Self {
            values,
            ..self.clone()
        }
    }

    /// Bilinear sample at normalized coordinates `u`, `v` in [0, 1].
    pub fn sample_bilinear(&self, u: f32, v: f32) -> f32 {
        if self.values.is_empty() {
            return 0.0;
        }
        let fx = (u.clamp(0.0, 1.0) * self.width as f32 - 0.5).clamp(0.0, (self.width - 1) as f32);
        let fy = (v.clamp(0.0, 1.0) * self.height as f32 - 0.5).clamp(0.0, (self.height - 1) as f32);
        let (x0, y0) = (fx.floor() as u32, fy.floor() as u32);
        let (x1, y1) = ((x0 + 1).min(self.width - 1), (y0 + 1).min(self.height - 1));
        let (tx, ty) = (fx - x0 as f32, fy - y0 as f32);

        let top = self.get(x0, y0) * (1.0 - tx) + self.get(x1, y0) * tx;
        let bottom = self.get(x0, y1) * (1.0 - tx) + self.get(x1, y1) * tx;
        top * (1.0 - ty) + bottom * ty
    }
}
