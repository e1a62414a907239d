// pulseplug Source Code File
//
// Copyright 2020 Nonpolynomial Labs LLC. All rights reserved.
//
// Licensed under the BSD 3-Clause license. See LICENSE file in the project root
// for full license information.

//! Heart-rate-variability statistics over a window of RR intervals.
//!
//! All functions take the trailing RR history in milliseconds, oldest first,
//! and return 0 when fewer than two intervals are available; the service
//! never has a reason to crash over a short history.

use crate::api::HrvFilter;
use nalgebra::DVector;

fn successive_differences(rr_intervals_ms: &[f64]) -> Vec<f64> {
    rr_intervals_ms
        .windows(2)
        .map(|pair| pair[1] - pair[0])
        .collect()
}

/// Standard deviation of the RR intervals (population).
pub fn sdnn(rr_intervals_ms: &[f64]) -> f64 {
    if rr_intervals_ms.len() < 2 {
        return 0.0;
    }
    DVector::from_row_slice(rr_intervals_ms).variance().sqrt()
}

/// Root mean square of successive RR differences.
pub fn rmssd(rr_intervals_ms: &[f64]) -> f64 {
    if rr_intervals_ms.len() < 2 {
        return 0.0;
    }
    let diffs = DVector::from_vec(successive_differences(rr_intervals_ms));
    (diffs.dot(&diffs) / diffs.len() as f64).sqrt()
}

/// Standard deviation of successive RR differences (population).
pub fn sdsd(rr_intervals_ms: &[f64]) -> f64 {
    if rr_intervals_ms.len() < 3 {
        return 0.0;
    }
    DVector::from_vec(successive_differences(rr_intervals_ms))
        .variance()
        .sqrt()
}

fn count_above(rr_intervals_ms: &[f64], threshold_ms: f64) -> usize {
    successive_differences(rr_intervals_ms)
        .iter()
        .filter(|diff| diff.abs() > threshold_ms)
        .count()
}

/// Number of successive RR pairs differing by more than 50 ms.
pub fn nn50(rr_intervals_ms: &[f64]) -> usize {
    count_above(rr_intervals_ms, 50.0)
}

/// [`nn50`] over the number of successive pairs.
pub fn pnn50(rr_intervals_ms: &[f64]) -> f64 {
    if rr_intervals_ms.len() < 2 {
        return 0.0;
    }
    nn50(rr_intervals_ms) as f64 / (rr_intervals_ms.len() - 1) as f64
}

/// Number of successive RR pairs differing by more than 20 ms.
pub fn nn20(rr_intervals_ms: &[f64]) -> usize {
    count_above(rr_intervals_ms, 20.0)
}

/// [`nn20`] over the number of successive pairs.
pub fn pnn20(rr_intervals_ms: &[f64]) -> f64 {
    if rr_intervals_ms.len() < 2 {
        return 0.0;
    }
    nn20(rr_intervals_ms) as f64 / (rr_intervals_ms.len() - 1) as f64
}

/// Evaluate one filter over the RR history.
pub fn evaluate(filter: HrvFilter, rr_intervals_ms: &[f64]) -> f64 {
    match filter {
        HrvFilter::Sdnn => sdnn(rr_intervals_ms),
        HrvFilter::Rmssd => rmssd(rr_intervals_ms),
        HrvFilter::Sdsd => sdsd(rr_intervals_ms),
        HrvFilter::Nn50 => nn50(rr_intervals_ms) as f64,
        HrvFilter::PNn50 => pnn50(rr_intervals_ms),
        HrvFilter::Nn20 => nn20(rr_intervals_ms) as f64,
        HrvFilter::PNn20 => pnn20(rr_intervals_ms),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const WINDOW: [f64; 5] = [800.0, 810.0, 790.0, 820.0, 780.0];

    fn close(a: f64, b: f64) -> bool {
        (a - b).abs() < 1e-2
    }

    #[test]
    fn sdnn_is_population_sigma() {
        assert!(close(sdnn(&WINDOW), 14.142));
    }

    #[test]
    fn rmssd_of_window() {
        // Successive differences are [10, -20, 30, -40].
        assert!(close(rmssd(&WINDOW), (750.0f64).sqrt()));
    }

    #[test]
    fn sdsd_of_window() {
        // Population sigma of [10, -20, 30, -40], mean -5.
        assert!(close(sdsd(&WINDOW), (725.0f64).sqrt()));
    }

    #[test]
    fn nn_counts_use_strict_threshold() {
        assert_eq!(nn50(&WINDOW), 0);
        assert_eq!(nn20(&WINDOW), 2);
        assert!(close(pnn20(&WINDOW), 0.5));
        assert!(close(pnn50(&WINDOW), 0.0));

        let spread = [800.0, 880.0, 790.0, 845.0];
        assert_eq!(nn50(&spread), 3);
        assert!(close(pnn50(&spread), 1.0));
    }

    #[test]
    fn short_histories_yield_zero() {
        for filter in HrvFilter::ALL {
            assert_eq!(evaluate(filter, &[]), 0.0);
            assert_eq!(evaluate(filter, &[800.0]), 0.0);
        }
    }

    #[test]
    fn evaluate_dispatches_to_filters() {
        assert_eq!(evaluate(HrvFilter::Sdnn, &WINDOW), sdnn(&WINDOW));
        assert_eq!(evaluate(HrvFilter::Rmssd, &WINDOW), rmssd(&WINDOW));
        assert_eq!(evaluate(HrvFilter::Nn20, &WINDOW), nn20(&WINDOW) as f64);
    }
}
