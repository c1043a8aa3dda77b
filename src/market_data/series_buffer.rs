// =============================================================================
// Series Buffer — append-only price series for the active symbol
// =============================================================================
//
// One buffer per subscription. Points are never evicted: the buffer lives
// exactly as long as the subscription and is replaced wholesale when the
// symbol changes. Volume is point-in-time state, not a series.
// =============================================================================

use crate::types::{SeriesPoint, Trade};

/// Insertion-ordered `(time, price)` points plus the latest traded volume.
#[derive(Debug, Clone, Default)]
pub struct SeriesBuffer {
    points: Vec<SeriesPoint>,
    latest_volume: Option<f64>,
}

impl SeriesBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a point at the tail and record `volume` as the latest volume.
    ///
    /// Time never goes backwards within the buffer: a point stamped earlier
    /// than the current tail (wall clock stepped back) takes the tail's time.
    pub fn append(&mut self, mut point: SeriesPoint, volume: f64) {
        if let Some(last) = self.points.last() {
            if point.time < last.time {
                point.time = last.time;
            }
        }
        self.points.push(point);
        self.latest_volume = Some(volume);
    }

    /// Convenience wrapper: one point per accepted trade, never coalesced.
    pub fn append_trade(&mut self, trade: &Trade) {
        self.append(
            SeriesPoint {
                time: trade.received_at,
                price: trade.price,
            },
            trade.volume,
        );
    }

    /// Volume carried by the most recent accepted trade.
    pub fn latest_volume(&self) -> Option<f64> {
        self.latest_volume
    }

    /// Discard every point and the latest volume.
    pub fn reset(&mut self) {
        self.points.clear();
        self.latest_volume = None;
    }

    /// Full current contents, oldest first.
    pub fn points(&self) -> &[SeriesPoint] {
        &self.points
    }

    #[cfg(test)]
    pub fn last_price(&self) -> Option<f64> {
        self.points.last().map(|p| p.price)
    }

    #[cfg(test)]
    pub fn len(&self) -> usize {
        self.points.len()
    }

    pub fn is_empty(&self) -> bool {
        self.points.is_empty()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use chrono::{Duration, Utc};

    use super::*;

    fn point(offset_ms: i64, price: f64) -> SeriesPoint {
        SeriesPoint {
            time: Utc::now() + Duration::milliseconds(offset_ms),
            price,
        }
    }

    #[test]
    fn appends_in_arrival_order() {
        let mut buf = SeriesBuffer::new();
        for (i, price) in [101.0, 99.5, 100.25, 100.25].into_iter().enumerate() {
            buf.append(point(i as i64 * 10, price), i as f64);
        }

        let prices: Vec<f64> = buf.points().iter().map(|p| p.price).collect();
        assert_eq!(prices, vec![101.0, 99.5, 100.25, 100.25]);
        assert_eq!(buf.len(), 4);
        assert_eq!(buf.latest_volume(), Some(3.0));
        assert_eq!(buf.last_price(), Some(100.25));
    }

    #[test]
    fn backwards_clock_is_clamped_not_reordered() {
        let mut buf = SeriesBuffer::new();
        buf.append(point(1_000, 1.0), 1.0);
        buf.append(point(0, 2.0), 1.0);
        buf.append(point(2_000, 3.0), 1.0);

        let pts = buf.points();
        assert_eq!(pts.len(), 3);
        assert!((pts[1].price - 2.0).abs() < f64::EPSILON);
        assert!(pts.windows(2).all(|w| w[0].time <= w[1].time));
    }

    #[test]
    fn volume_tracks_latest_trade() {
        let mut buf = SeriesBuffer::new();
        assert_eq!(buf.latest_volume(), None);

        let mut trade = Trade {
            symbol: "AAPL".into(),
            price: 190.0,
            volume: 5.0,
            received_at: Utc::now(),
        };
        buf.append_trade(&trade);
        trade.volume = 2.5;
        buf.append_trade(&trade);

        assert_eq!(buf.len(), 2);
        assert_eq!(buf.latest_volume(), Some(2.5));
    }

    #[test]
    fn reset_clears_points_and_volume() {
        let mut buf = SeriesBuffer::new();
        buf.append(point(0, 1.0), 4.0);
        buf.reset();
        assert!(buf.is_empty());
        assert_eq!(buf.latest_volume(), None);
        assert!(buf.points().is_empty());
    }
}
