//! latest load progress, as reported by the engine.

/// passive holder for the most recent `(fraction, text)` pair of a model load.
///
/// engines are free to report anything; out-of-range fractions are kept as
/// reported and clamped on read, never rejected.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct LoadProgress {
    fraction: f32,
    text: String,
}

impl LoadProgress {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn report(&mut self, fraction: f32, text: impl Into<String>) {
        // nan would poison every comparison downstream
        self.fraction = if fraction.is_finite() { fraction } else { 0.0 };
        self.text = text.into();
    }

    /// latest fraction, clamped into `[0, 1]`.
    pub fn fraction(&self) -> f32 {
        self.fraction.clamp(0.0, 1.0)
    }

    pub fn percent(&self) -> u8 {
        (self.fraction() * 100.0).floor() as u8
    }

    pub fn text(&self) -> &str {
        &self.text
    }

    /// the bar is hidden before the first progress and once the load completes.
    pub fn shows_bar(&self) -> bool {
        let f = self.fraction();
        f > 0.0 && f < 1.0
    }
}
