//! Latency ranges, sampled delays and probability helpers shared by the
//! bus chaos path, the adversarial middleware and the engine stress path.

use crate::error::ConfigError;
use rand::Rng;
use serde::de::{self, Deserializer, SeqAccess, Visitor};
use serde::ser::{SerializeTuple, Serializer};
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Upper bound applied to the "infinite" latency sentinel.
///
/// A hung call sleeps this long instead of forever so that shutdown is
/// bounded.
pub const HANG_DURATION: Duration = Duration::from_secs(3600);

/// Clamps a probability into `[0, 1]`; NaN becomes 0.
pub fn clamp_rate(rate: f64) -> f64 {
    if rate.is_nan() {
        0.0
    } else {
        rate.clamp(0.0, 1.0)
    }
}

/// Draws one Bernoulli trial with probability `rate`.
pub fn fires<R: Rng + ?Sized>(rng: &mut R, rate: f64) -> bool {
    rate > 0.0 && rng.gen::<f64>() < rate
}

/// `(min, max)` seconds. `max` may be `f64::INFINITY`.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct LatencyRange {
    pub min: f64,
    pub max: f64,
}

impl LatencyRange {
    /// Builds a normalised range.
    pub fn new(min: f64, max: f64) -> Self {
        Self { min, max }.normalized()
    }

    pub const ZERO: LatencyRange = LatencyRange { min: 0.0, max: 0.0 };

    /// Fixed latency of `secs`.
    pub fn fixed(secs: f64) -> Self {
        Self::new(secs, secs)
    }

    /// Range whose upper bound is the hang sentinel.
    pub fn unbounded(min: f64) -> Self {
        Self::new(min, f64::INFINITY)
    }

    /// Negative/NaN bounds become 0, inverted bounds are swapped.
    pub fn normalized(self) -> Self {
        let fix = |v: f64| if v.is_nan() || v < 0.0 { 0.0 } else { v };
        let (a, b) = (fix(self.min), fix(self.max));
        if a <= b {
            Self { min: a, max: b }
        } else {
            Self { min: b, max: a }
        }
    }

    pub fn is_zero(&self) -> bool {
        self.max == 0.0
    }

    /// Uniform sample in seconds; infinite when the upper bound is the sentinel.
    pub fn sample_secs<R: Rng + ?Sized>(&self, rng: &mut R) -> f64 {
        if self.max.is_infinite() {
            return f64::INFINITY;
        }
        if self.min >= self.max {
            return self.min;
        }
        rng.gen_range(self.min..=self.max)
    }

    pub fn sample<R: Rng + ?Sized>(&self, rng: &mut R) -> Delay {
        Delay::from_secs(self.sample_secs(rng))
    }
}

impl Default for LatencyRange {
    fn default() -> Self {
        Self::ZERO
    }
}

/// How long an intercepted call must wait.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Delay {
    None,
    Finite(Duration),
    /// The infinite sentinel; realised as [`HANG_DURATION`]
    Hang,
}

impl Delay {
    pub fn from_secs(secs: f64) -> Self {
        if secs >= HANG_DURATION.as_secs_f64() {
            Delay::Hang
        } else if secs > 0.0 {
            Delay::Finite(Duration::from_secs_f64(secs))
        } else {
            Delay::None
        }
    }

    /// Multiplies a finite delay; a hang stays a hang.
    pub fn scaled(self, factor: f64) -> Self {
        match self {
            Delay::Finite(d) => Delay::from_secs(d.as_secs_f64() * factor),
            other => other,
        }
    }

    /// The duration actually slept.
    pub fn duration(&self) -> Duration {
        match self {
            Delay::None => Duration::ZERO,
            Delay::Finite(d) => *d,
            Delay::Hang => HANG_DURATION,
        }
    }

    pub fn is_none(&self) -> bool {
        matches!(self, Delay::None)
    }
}

/// Parses a single bound: a number or `inf`/`infinity`.
fn parse_bound(raw: &str) -> Result<f64, ConfigError> {
    match raw.trim().to_ascii_lowercase().as_str() {
        "inf" | "infinity" | "+inf" => Ok(f64::INFINITY),
        other => other
            .parse::<f64>()
            .map_err(|_| ConfigError::InvalidLatency(raw.to_string())),
    }
}

impl Serialize for LatencyRange {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut tup = serializer.serialize_tuple(2)?;
        for bound in [self.min, self.max] {
            if bound.is_infinite() {
                tup.serialize_element("infinity")?;
            } else {
                tup.serialize_element(&bound)?;
            }
        }
        tup.end()
    }
}

impl<'de> Deserialize<'de> for LatencyRange {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        #[derive(Deserialize)]
        #[serde(untagged)]
        enum Bound {
            Number(f64),
            Text(String),
        }

        impl Bound {
            fn value<E: de::Error>(self) -> Result<f64, E> {
                match self {
                    Bound::Number(v) => Ok(v),
                    Bound::Text(s) => parse_bound(&s).map_err(E::custom),
                }
            }
        }

        struct RangeVisitor;

        impl<'de> Visitor<'de> for RangeVisitor {
            type Value = LatencyRange;

            fn expecting(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
                f.write_str("a [min, max] latency pair")
            }

            fn visit_seq<A: SeqAccess<'de>>(self, mut seq: A) -> Result<LatencyRange, A::Error> {
                let min: Bound = seq
                    .next_element()?
                    .ok_or_else(|| de::Error::invalid_length(0, &self))?;
                let max: Bound = seq
                    .next_element()?
                    .ok_or_else(|| de::Error::invalid_length(1, &self))?;
                Ok(LatencyRange::new(min.value()?, max.value()?))
            }
        }

        deserializer.deserialize_tuple(2, RangeVisitor)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::SeedableRng;
    use rand_chacha::ChaCha8Rng;

    #[test]
    fn test_normalization() {
        assert_eq!(LatencyRange::new(0.5, 0.1), LatencyRange { min: 0.1, max: 0.5 });
        assert_eq!(LatencyRange::new(-1.0, 0.2), LatencyRange { min: 0.0, max: 0.2 });
        assert_eq!(LatencyRange::new(f64::NAN, 0.0), LatencyRange::ZERO);
        assert_eq!(LatencyRange::new(f64::INFINITY, 1.0).max, f64::INFINITY);
    }

    #[test]
    fn test_sampling_stays_in_range() {
        let mut rng = ChaCha8Rng::seed_from_u64(7);
        let range = LatencyRange::new(0.01, 0.02);
        for _ in 0..500 {
            let s = range.sample_secs(&mut rng);
            assert!((0.01..=0.02).contains(&s));
        }
        assert_eq!(LatencyRange::fixed(0.3).sample_secs(&mut rng), 0.3);
        assert_eq!(LatencyRange::unbounded(0.0).sample(&mut rng), Delay::Hang);
    }

    #[test]
    fn test_delay_conversion() {
        assert_eq!(Delay::from_secs(0.0), Delay::None);
        assert_eq!(Delay::from_secs(f64::INFINITY).duration(), HANG_DURATION);
        let scaled = Delay::from_secs(0.01).scaled(10.0).duration();
        assert!((scaled.as_secs_f64() - 0.1).abs() < 1e-6);
        assert_eq!(Delay::Hang.scaled(0.5), Delay::Hang);
    }

    #[test]
    fn test_serde_infinity_sentinel() {
        let range: LatencyRange = serde_json::from_str(r#"[0.5, "infinity"]"#).unwrap();
        assert_eq!(range.min, 0.5);
        assert!(range.max.is_infinite());

        let range: LatencyRange = serde_json::from_str("[0.3, 0.1]").unwrap();
        assert_eq!(range, LatencyRange { min: 0.1, max: 0.3 });

        let text = serde_json::to_string(&LatencyRange::unbounded(1.0)).unwrap();
        assert_eq!(text, r#"[1.0,"infinity"]"#);

        assert!(serde_json::from_str::<LatencyRange>(r#"[0.1, "soon"]"#).is_err());
    }

    #[test]
    fn test_clamp_rate() {
        assert_eq!(clamp_rate(1.7), 1.0);
        assert_eq!(clamp_rate(-0.2), 0.0);
        assert_eq!(clamp_rate(f64::NAN), 0.0);
        assert_eq!(clamp_rate(0.25), 0.25);
    }
}
