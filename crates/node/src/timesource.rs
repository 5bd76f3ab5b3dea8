//! Network-adjusted time from peer version timestamps.

use std::collections::HashSet;
use std::net::SocketAddr;
use std::sync::Mutex;
use std::time::{SystemTime, UNIX_EPOCH};

/// Offsets beyond this are assumed to be lying peers and are ignored.
const MAX_OFFSET_SECS: i64 = 70 * 60;
const MAX_SAMPLES: usize = 200;

/// Median of per-peer clock offsets, sampled once per peer from its version
/// message.
#[derive(Debug, Default)]
pub struct MedianTimeSource {
    inner: Mutex<Samples>,
}

#[derive(Debug, Default)]
struct Samples {
    seen: HashSet<SocketAddr>,
    offsets: Vec<i64>,
}

impl MedianTimeSource {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_time_sample(&self, source: SocketAddr, peer_time: i64) {
        let offset = peer_time - unix_now();
        if offset.abs() > MAX_OFFSET_SECS {
            return;
        }
        let Ok(mut inner) = self.inner.lock() else {
            return;
        };
        if inner.offsets.len() >= MAX_SAMPLES || !inner.seen.insert(source) {
            return;
        }
        inner.offsets.push(offset);
    }

    /// Wall-clock time corrected by the median peer offset.
    pub fn adjusted_time(&self) -> i64 {
        unix_now() + self.offset()
    }

    pub fn offset(&self) -> i64 {
        let Ok(inner) = self.inner.lock() else {
            return 0;
        };
        if inner.offsets.len() < 5 {
            return 0;
        }
        let mut offsets = inner.offsets.clone();
        offsets.sort_unstable();
        offsets[offsets.len() / 2]
    }
}

fn unix_now() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|duration| duration.as_secs() as i64)
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn addr(i: u8) -> SocketAddr {
        format!("10.0.0.{i}:8333").parse().unwrap()
    }

    #[test]
    fn few_samples_mean_no_offset() {
        let source = MedianTimeSource::new();
        source.add_time_sample(addr(1), unix_now() + 100);
        assert_eq!(source.offset(), 0);
    }

    #[test]
    fn median_of_samples_is_used() {
        let source = MedianTimeSource::new();
        let now = unix_now();
        for (i, skew) in [10, 20, 30, 40, 50].iter().enumerate() {
            source.add_time_sample(addr(i as u8), now + skew);
        }
        let offset = source.offset();
        assert!((29..=31).contains(&offset), "offset was {offset}");
    }

    #[test]
    fn duplicate_sources_sample_once() {
        let source = MedianTimeSource::new();
        let now = unix_now();
        for _ in 0..10 {
            source.add_time_sample(addr(1), now + 600);
        }
        assert_eq!(source.offset(), 0);
    }

    #[test]
    fn wild_offsets_ignored() {
        let source = MedianTimeSource::new();
        let now = unix_now();
        for i in 0..5 {
            source.add_time_sample(addr(i), now + 100_000);
        }
        assert_eq!(source.offset(), 0);
    }
}
