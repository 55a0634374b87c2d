//! Tide points and their line protocol encoding.

use std::fmt::Write as _;

use serde::Serialize;

use crate::dataset::LocationDataset;

/// Measurement name shared by every tide point.
pub const MEASUREMENT: &str = "tide";

/// Time-series point derived from one observation.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TidePoint {
    /// Tide station name (`location` tag)
    pub location: String,

    /// Height unit (`unit` tag)
    pub unit: String,

    /// `height` field
    pub height: f64,

    /// Seconds since the Unix epoch
    pub timestamp: i64,
}

impl TidePoint {
    pub fn measurement(&self) -> &'static str {
        MEASUREMENT
    }

    /// Tag pairs, sorted by key.
    pub fn tags(&self) -> [(&'static str, &str); 2] {
        [("location", &self.location), ("unit", &self.unit)]
    }

    /// Encode as one line of InfluxDB line protocol with second precision.
    ///
    /// Returns `None` when the height is not finite, since line protocol has
    /// no representation for NaN or infinity.
    pub fn to_line_protocol(&self) -> Option<String> {
        if !self.height.is_finite() {
            return None;
        }

        let mut line = String::with_capacity(64);
        escape_into(&mut line, MEASUREMENT, &[',', ' ']);
        for (key, value) in self.tags() {
            line.push(',');
            escape_into(&mut line, key, &[',', '=', ' ']);
            line.push('=');
            escape_into(&mut line, value, &[',', '=', ' ']);
        }
        // f64 Display is the shortest representation that round-trips
        let _ = write!(line, " height={} {}", self.height, self.timestamp);
        Some(line)
    }
}

fn escape_into(out: &mut String, value: &str, special: &[char]) {
    for c in value.chars() {
        if c == '\\' || special.contains(&c) {
            out.push('\\');
        }
        out.push(c);
    }
}

/// Build one point per observation, in observation order.
///
/// Tags come from the dataset, so all points derived from it share the same
/// `location` and `unit`.
pub fn build_points(dataset: &LocationDataset) -> Vec<TidePoint> {
    dataset
        .observations
        .iter()
        .map(|obs| TidePoint {
            location: dataset.site.clone(),
            unit: dataset.unit.clone(),
            height: obs.height,
            timestamp: obs.epoch,
        })
        .collect()
}
