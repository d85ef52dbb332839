//! Axis shaping: clamp, normalise, deadzone, curve, invert, rescale.

use serde::{Deserialize, Serialize};

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeadzonePosition {
    /// Zero band around the middle of travel.
    #[default]
    Center,
    /// Dead band at the low end.
    Left,
    /// Dead band at the high end.
    Right,
    /// Dead bands at both ends.
    Ends,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResponseCurve {
    #[default]
    Linear,
    Smooth,
    Aggressive,
    Soft,
    UltraFine,
    SCurve,
    Exponential,
}

impl ResponseCurve {
    /// Shape a magnitude in `0..=1`.
    pub fn apply(self, x: f32) -> f32 {
        match self {
            ResponseCurve::Linear => x,
            ResponseCurve::Smooth => x.powf(1.5),
            ResponseCurve::Aggressive => x.sqrt(),
            ResponseCurve::Soft => x * x,
            ResponseCurve::UltraFine => x * x * x,
            ResponseCurve::SCurve => 3.0 * x * x - 2.0 * x * x * x,
            ResponseCurve::Exponential => x.exp_m1() / 1f32.exp_m1(),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AxisConfig {
    pub input_min: f32,
    pub input_max: f32,
    /// Center: half-width of the zero band in normalised units. Left, right
    /// and ends: fraction of full travel swallowed at each dead end.
    pub deadzone: f32,
    pub deadzone_position: DeadzonePosition,
    pub curve: ResponseCurve,
    pub invert: bool,
    pub output_min: f32,
    pub output_max: f32,
}

impl Default for AxisConfig {
    fn default() -> Self {
        Self {
            input_min: -1.0,
            input_max: 1.0,
            deadzone: 0.0,
            deadzone_position: DeadzonePosition::Center,
            curve: ResponseCurve::Linear,
            invert: false,
            output_min: -1.0,
            output_max: 1.0,
        }
    }
}

impl AxisConfig {
    pub fn shape(&self, raw: f32) -> f32 {
        let x = self.normalise(raw);
        let x = self.apply_deadzone(x);
        let x = x.signum() * self.curve.apply(x.abs().min(1.0));
        let x = if self.invert { -x } else { x };
        self.output_min + (x + 1.0) * 0.5 * (self.output_max - self.output_min)
    }

    /// Clamp to the input range and map onto `-1..=1`.
    fn normalise(&self, raw: f32) -> f32 {
        let (lo, hi) = if self.input_min <= self.input_max {
            (self.input_min, self.input_max)
        } else {
            (self.input_max, self.input_min)
        };
        let span = hi - lo;
        if span <= f32::EPSILON {
            return 0.0;
        }
        let x = 2.0 * (raw.clamp(lo, hi) - lo) / span - 1.0;
        if self.input_min > self.input_max {
            -x
        } else {
            x
        }
    }

    fn apply_deadzone(&self, x: f32) -> f32 {
        if self.deadzone <= 0.0 {
            return x;
        }
        match self.deadzone_position {
            DeadzonePosition::Center => {
                let d = self.deadzone.min(0.99);
                if x.abs() <= d {
                    0.0
                } else {
                    x.signum() * (x.abs() - d) / (1.0 - d)
                }
            }
            DeadzonePosition::Left => {
                let lo = -1.0 + 2.0 * self.deadzone.min(0.99);
                rescale(x, lo, 1.0)
            }
            DeadzonePosition::Right => {
                let hi = 1.0 - 2.0 * self.deadzone.min(0.99);
                rescale(x, -1.0, hi)
            }
            DeadzonePosition::Ends => {
                let d = self.deadzone.min(0.49);
                rescale(x, -1.0 + 2.0 * d, 1.0 - 2.0 * d)
            }
        }
    }
}

/// Map `lo..=hi` onto `-1..=1`, pinning anything outside to the ends.
fn rescale(x: f32, lo: f32, hi: f32) -> f32 {
    if x <= lo {
        -1.0
    } else if x >= hi {
        1.0
    } else {
        -1.0 + 2.0 * (x - lo) / (hi - lo)
    }
}
