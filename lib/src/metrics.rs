//! Recovery latencies, accumulated across fault rounds
//!
//! Each round measures the time between the fault injection and the moment
//! the registry is back to its expected size. Latencies are stored in
//! microseconds in an HDR histogram and reported as percentiles.

use std::{fmt, time::Duration};

use hdrhistogram::Histogram;

use failover_command_lib::error;

/// significant figures kept by the histogram
const SIGNIFICANT_FIGURES: u8 = 3;

#[derive(thiserror::Error, Debug)]
pub enum MetricError {
    #[error("could not create histogram: {0}")]
    HistogramCreation(String),
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Percentiles {
    pub samples: u64,
    pub p_50: u64,
    pub p_90: u64,
    pub p_99: u64,
    pub p_100: u64,
}

impl fmt::Display for Percentiles {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "samples={} p50={}us p90={}us p99={}us max={}us",
            self.samples, self.p_50, self.p_90, self.p_99, self.p_100
        )
    }
}

pub fn histogram_to_percentiles(hist: &Histogram<u32>) -> Percentiles {
    Percentiles {
        samples: hist.len(),
        p_50: hist.value_at_percentile(50.0),
        p_90: hist.value_at_percentile(90.0),
        p_99: hist.value_at_percentile(99.0),
        p_100: hist.value_at_percentile(100.0),
    }
}

#[derive(Debug, Clone)]
pub struct RecoveryStats {
    histogram: Histogram<u32>,
}

impl RecoveryStats {
    pub fn new() -> Result<Self, MetricError> {
        let histogram = Histogram::new(SIGNIFICANT_FIGURES)
            .map_err(|error| MetricError::HistogramCreation(error.to_string()))?;
        Ok(RecoveryStats { histogram })
    }

    pub fn record(&mut self, recovery: Duration) {
        let micros = u64::try_from(recovery.as_micros()).unwrap_or(u64::MAX);
        if let Err(e) = self.histogram.record(micros) {
            error!("could not record recovery time: {:?}", e.to_string());
        }
    }

    pub fn samples(&self) -> u64 {
        self.histogram.len()
    }

    pub fn percentiles(&self) -> Percentiles {
        histogram_to_percentiles(&self.histogram)
    }

    pub fn max(&self) -> Duration {
        Duration::from_micros(self.histogram.max())
    }
}
