//! Yield arithmetic: throughput yield, first-pass yield and the compounded
//! station products used for weekly model metrics.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::StationYield;

pub fn round_to(value: f64, places: u32) -> f64 {
    let scale = 10f64.powi(places as i32);
    (value * scale).round() / scale
}

/// `passed / total * 100` rounded to two places; `None` when nothing was seen,
/// so an idle station is never reported as 0%.
pub fn throughput_yield(passed: i64, total: i64) -> Option<f64> {
    if total <= 0 {
        return None;
    }
    Some(round_to(passed as f64 / total as f64 * 100.0, 2))
}

fn percent_or_zero(numerator: i64, denominator: i64) -> f64 {
    if denominator <= 0 {
        0.0
    } else {
        round_to(numerator as f64 / denominator as f64 * 100.0, 2)
    }
}

/// What a single serial did inside the measurement window, collapsed over all
/// of its events.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SerialProgress {
    pub reached_terminal: bool,
    pub failures: i64,
}

impl SerialProgress {
    pub fn first_pass(&self) -> bool {
        self.reached_terminal && self.failures == 0
    }

    pub fn in_limbo(&self) -> bool {
        !self.reached_terminal && self.failures == 0
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FpyFigure {
    pub parts: i64,
    pub first_pass_success: i64,
    pub yield_pct: f64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FpyBreakdown {
    pub parts_completed: i64,
    pub parts_failed: i64,
    pub parts_stuck_in_limbo: i64,
    pub total_parts: i64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FirstPassYield {
    /// Over every serial that started.
    pub traditional: FpyFigure,
    /// Over serials that either completed or failed.
    pub completed_only: FpyFigure,
    pub breakdown: FpyBreakdown,
}

pub fn first_pass_yield<'a, I>(serials: I) -> FirstPassYield
where
    I: IntoIterator<Item = &'a SerialProgress>,
{
    let mut total = 0i64;
    let mut success = 0i64;
    let mut completed = 0i64;
    let mut failed = 0i64;
    let mut limbo = 0i64;

    for serial in serials {
        total += 1;
        if serial.first_pass() {
            success += 1;
        }
        if serial.reached_terminal {
            completed += 1;
        } else if serial.failures > 0 {
            failed += 1;
        } else {
            limbo += 1;
        }
    }

    let active = completed + failed;
    FirstPassYield {
        traditional: FpyFigure {
            parts: total,
            first_pass_success: success,
            yield_pct: percent_or_zero(success, total),
        },
        completed_only: FpyFigure {
            parts: active,
            first_pass_success: success,
            yield_pct: percent_or_zero(success, active),
        },
        breakdown: FpyBreakdown {
            parts_completed: completed,
            parts_failed: failed,
            parts_stuck_in_limbo: limbo,
            total_parts: total,
        },
    }
}

fn compound(yields: impl Iterator<Item = f64>) -> f64 {
    round_to(yields.map(|y| y / 100.0).product::<f64>() * 100.0, 2)
}

/// Product of the fixed station sequence. Any missing station leaves the
/// figure undefined rather than extrapolating from the stations that ran.
pub fn hardcoded_tpy(sequence: &[String], stations: &BTreeMap<String, StationYield>) -> Option<f64> {
    if sequence.is_empty() {
        return None;
    }
    let mut picked = Vec::with_capacity(sequence.len());
    for name in sequence {
        picked.push(stations.get(name)?.throughput_yield);
    }
    Some(compound(picked.into_iter()))
}

/// Product over every observed station, with the station count.
pub fn dynamic_tpy(stations: &BTreeMap<String, StationYield>) -> (Option<f64>, usize) {
    if stations.is_empty() {
        return (None, 0);
    }
    (
        Some(compound(stations.values().map(|s| s.throughput_yield))),
        stations.len(),
    )
}

/// `EC` followed by the last three characters of the free-text reason.
pub fn derive_error_code(failure_reasons: Option<&str>) -> String {
    let tail: String = match failure_reasons {
        Some(reason) => {
            let chars: Vec<char> = reason.chars().collect();
            let from = chars.len().saturating_sub(3);
            chars[from..].iter().collect()
        }
        None => String::new(),
    };
    format!("EC{tail}")
}

#[cfg(test)]
mod tests {
    use super::*;

    fn station(passed: i64, total: i64) -> StationYield {
        StationYield {
            total,
            passed,
            throughput_yield: throughput_yield(passed, total).unwrap(),
        }
    }

    #[test]
    fn throughput_yield_rounds_to_two_places() {
        assert_eq!(throughput_yield(33, 37), Some(89.19));
        assert_eq!(throughput_yield(0, 5), Some(0.0));
        assert_eq!(throughput_yield(0, 0), None);
    }

    #[test]
    fn fpy_definitions_differ_by_limbo_serials() {
        let mut serials = Vec::new();
        serials.extend(std::iter::repeat(SerialProgress { reached_terminal: true, failures: 0 }).take(6));
        serials.extend(std::iter::repeat(SerialProgress { reached_terminal: true, failures: 1 }).take(2));
        serials.push(SerialProgress { reached_terminal: false, failures: 2 });
        serials.push(SerialProgress::default());

        let fpy = first_pass_yield(&serials);
        assert_eq!(fpy.traditional.parts, 10);
        assert_eq!(fpy.traditional.first_pass_success, 6);
        assert_eq!(fpy.traditional.yield_pct, 60.0);
        assert_eq!(fpy.completed_only.parts, 9);
        assert_eq!(fpy.completed_only.yield_pct, 66.67);
        assert_eq!(
            fpy.breakdown,
            FpyBreakdown {
                parts_completed: 8,
                parts_failed: 1,
                parts_stuck_in_limbo: 1,
                total_parts: 10,
            }
        );
    }

    #[test]
    fn fpy_of_nothing_is_zero() {
        let fpy = first_pass_yield(&Vec::<SerialProgress>::new());
        assert_eq!(fpy.traditional.yield_pct, 0.0);
        assert_eq!(fpy.completed_only.parts, 0);
    }

    #[test]
    fn hardcoded_tpy_is_null_when_a_station_is_missing() {
        let sequence: Vec<String> = ["BBD", "ASSY2", "FI", "FQC"].iter().map(|s| s.to_string()).collect();
        let mut stations = BTreeMap::new();
        stations.insert("BBD".to_string(), station(9, 10));
        stations.insert("ASSY2".to_string(), station(10, 10));
        stations.insert("FI".to_string(), station(4, 5));
        assert_eq!(hardcoded_tpy(&sequence, &stations), None);

        stations.insert("FQC".to_string(), station(1, 1));
        assert_eq!(hardcoded_tpy(&sequence, &stations), Some(72.0));
    }

    #[test]
    fn dynamic_tpy_uses_every_station() {
        let mut stations = BTreeMap::new();
        stations.insert("FI".to_string(), station(1, 2));
        stations.insert("PACKING".to_string(), station(1, 2));
        assert_eq!(dynamic_tpy(&stations), (Some(25.0), 2));
        assert_eq!(dynamic_tpy(&BTreeMap::new()), (None, 0));
    }

    #[test]
    fn error_codes_take_the_reason_tail() {
        assert_eq!(derive_error_code(Some("Memory test failed 042")), "EC042");
        assert_eq!(derive_error_code(Some("7")), "EC7");
        assert_eq!(derive_error_code(None), "EC");
    }
}
