//! Feature extraction from assembled epochs.
//!
//! Features are computed per channel of every source slice and concatenated
//! in source order, then channel order, then the fixed feature order below.
//! The vector length depends only on the enabled features, the number of
//! frequency bands and the channel counts, never on the data.

use crate::config::FeatureChoices;
use crate::core::types::EpochSlice;
use rustfft::num_complex::Complex64;
use rustfft::FftPlanner;
use statrs::statistics::{Data, Median, Statistics};
use std::f64::consts::PI;

/// Turns the slices of one sequence (in source order) into a feature vector.
pub trait FeatureExtractor: Send {
    fn name(&self) -> &'static str;

    fn extract(&self, slices: &[EpochSlice]) -> Vec<f64>;
}

/// One-sided power spectral density of a channel.
#[derive(Debug, Clone, PartialEq)]
pub struct Periodogram {
    pub frequencies: Vec<f64>,
    pub power: Vec<f64>,
}

impl Periodogram {
    /// Hann-windowed periodogram of `samples` taken at `sample_rate` Hz.
    pub fn compute(samples: &[f64], sample_rate: f64, planner: &mut FftPlanner<f64>) -> Self {
        let n = samples.len();
        if n < 2 || sample_rate <= 0.0 {
            return Self {
                frequencies: Vec::new(),
                power: Vec::new(),
            };
        }

        let window: Vec<f64> = (0..n)
            .map(|i| 0.5 - 0.5 * (2.0 * PI * i as f64 / (n - 1) as f64).cos())
            .collect();
        let window_power: f64 = window.iter().map(|w| w * w).sum();
        let mean = samples.iter().mean();

        let mut buffer: Vec<Complex64> = samples
            .iter()
            .zip(&window)
            .map(|(&x, &w)| Complex64::new((x - mean) * w, 0.0))
            .collect();
        planner.plan_fft_forward(n).process(&mut buffer);

        let bins = n / 2 + 1;
        let scale = 1.0 / (sample_rate * window_power);
        let power = (0..bins)
            .map(|k| {
                let p = buffer[k].norm_sqr() * scale;
                // Fold negative frequencies in, except DC and Nyquist.
                if k == 0 || (n % 2 == 0 && k == n / 2) {
                    p
                } else {
                    2.0 * p
                }
            })
            .collect();
        let frequencies = (0..bins).map(|k| k as f64 * sample_rate / n as f64).collect();
        Self { frequencies, power }
    }

    /// Power of the bins with `low <= f < high`.
    fn band(&self, low: f64, high: f64) -> Vec<f64> {
        self.frequencies
            .iter()
            .zip(&self.power)
            .filter(|(&f, _)| f >= low && f < high)
            .map(|(_, &p)| p)
            .collect()
    }

    /// Mean power in `[low, high)`, 0 when no bin falls inside.
    pub fn band_power(&self, low: f64, high: f64) -> f64 {
        finite(self.band(low, high).iter().mean())
    }
}

/// The configurable built-in extractor.
#[derive(Debug, Clone)]
pub struct GeneralFeatureExtractor {
    choices: FeatureChoices,
}

impl GeneralFeatureExtractor {
    pub fn new(choices: FeatureChoices) -> Self {
        Self { choices }
    }

    pub fn choices(&self) -> &FeatureChoices {
        &self.choices
    }

    /// Number of values produced for each channel.
    pub fn features_per_channel(&self) -> usize {
        let c = &self.choices;
        let band_count = if c.psd_band { c.freq_bands.len() } else { 0 };
        band_count
            + [
                c.mean_psd,
                c.median_psd,
                c.variance,
                c.mean_abs,
                c.rms,
                c.spectral_entropy,
                c.permutation_entropy,
                c.waveform_length,
                c.zero_crossings,
                c.slope_sign_changes,
            ]
            .iter()
            .filter(|&&on| on)
            .count()
    }

    /// Length of the vector for sources with the given channel counts.
    pub fn vector_len(&self, channel_counts: &[usize]) -> usize {
        self.features_per_channel() * channel_counts.iter().sum::<usize>()
    }

    fn channel_features(
        &self,
        samples: &[f64],
        sample_rate: f64,
        planner: &mut FftPlanner<f64>,
        out: &mut Vec<f64>,
    ) {
        let c = &self.choices;
        let spectrum = if c.uses_spectrum() {
            Some(Periodogram::compute(samples, sample_rate, planner))
        } else {
            None
        };

        if let Some(spectrum) = &spectrum {
            if c.psd_band {
                for band in &c.freq_bands {
                    out.push(spectrum.band_power(band[0], band[1]));
                }
            }
            if c.mean_psd || c.median_psd {
                let (low, high) = band_span(&c.freq_bands);
                let span = spectrum.band(low, high);
                if c.mean_psd {
                    out.push(finite(span.iter().mean()));
                }
                if c.median_psd {
                    out.push(if span.is_empty() {
                        0.0
                    } else {
                        finite(Data::new(span).median())
                    });
                }
            }
        }
        if c.variance {
            out.push(finite(samples.iter().variance()));
        }
        if c.mean_abs {
            out.push(finite(samples.iter().map(|v| v.abs()).mean()));
        }
        if c.rms {
            out.push(finite(samples.iter().quadratic_mean()));
        }
        if c.spectral_entropy {
            let entropy = spectrum.as_ref().map_or(0.0, |s| spectral_entropy(&s.power));
            out.push(entropy);
        }
        if c.permutation_entropy {
            out.push(permutation_entropy(samples));
        }
        if c.waveform_length {
            out.push(waveform_length(samples));
        }
        if c.zero_crossings {
            out.push(zero_crossings(samples) as f64);
        }
        if c.slope_sign_changes {
            out.push(slope_sign_changes(samples) as f64);
        }
    }
}

impl FeatureExtractor for GeneralFeatureExtractor {
    fn name(&self) -> &'static str {
        "general"
    }

    fn extract(&self, slices: &[EpochSlice]) -> Vec<f64> {
        let channels: usize = slices.iter().map(|s| s.channels.len()).sum();
        let mut out = Vec::with_capacity(channels * self.features_per_channel());
        let mut planner = FftPlanner::new();
        for slice in slices {
            for channel in &slice.channels {
                let samples: Vec<f64> = channel.iter().map(|&v| v as f64).collect();
                self.channel_features(&samples, slice.sample_rate, &mut planner, &mut out);
            }
        }
        out
    }
}

fn finite(value: f64) -> f64 {
    if value.is_finite() {
        value
    } else {
        0.0
    }
}

/// Lowest and highest edge over all bands.
fn band_span(bands: &[[f64; 2]]) -> (f64, f64) {
    bands.iter().fold((f64::INFINITY, f64::NEG_INFINITY), |(lo, hi), band| {
        (lo.min(band[0]), hi.max(band[1]))
    })
}

/// Shannon entropy of the normalized spectrum, scaled to [0, 1].
pub fn spectral_entropy(power: &[f64]) -> f64 {
    let total: f64 = power.iter().sum();
    if power.len() < 2 || total <= 0.0 {
        return 0.0;
    }
    let entropy: f64 = power
        .iter()
        .map(|&p| p / total)
        .filter(|&p| p > 0.0)
        .map(|p| -p * p.ln())
        .sum();
    finite(entropy / (power.len() as f64).ln())
}

/// Order-3 permutation entropy with unit delay, scaled to [0, 1].
pub fn permutation_entropy(samples: &[f64]) -> f64 {
    if samples.len() < 3 {
        return 0.0;
    }
    let mut counts = [0usize; 6];
    for w in samples.windows(3) {
        let (a, b, c) = (w[0], w[1], w[2]);
        let pattern = match (a <= b, b <= c, a <= c) {
            (true, true, _) => 0,
            (true, false, true) => 1,
            (true, false, false) => 2,
            (false, true, true) => 3,
            (false, true, false) => 4,
            (false, false, _) => 5,
        };
        counts[pattern] += 1;
    }
    let total = (samples.len() - 2) as f64;
    let entropy: f64 = counts
        .iter()
        .filter(|&&n| n > 0)
        .map(|&n| {
            let p = n as f64 / total;
            -p * p.ln()
        })
        .sum();
    entropy / 6f64.ln()
}

pub fn waveform_length(samples: &[f64]) -> f64 {
    samples.windows(2).map(|w| (w[1] - w[0]).abs()).sum()
}

pub fn zero_crossings(samples: &[f64]) -> usize {
    samples
        .windows(2)
        .filter(|w| (w[0] < 0.0 && w[1] >= 0.0) || (w[0] >= 0.0 && w[1] < 0.0))
        .count()
}

pub fn slope_sign_changes(samples: &[f64]) -> usize {
    samples
        .windows(3)
        .filter(|w| (w[1] - w[0]) * (w[2] - w[1]) < 0.0)
        .count()
}
