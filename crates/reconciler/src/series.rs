//! Per-metric chart series: sorted, windowed, bounded.

/// One plotted point
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ChartPoint {
    pub elapsed: f64,
    pub value: f64,
}

/// How a sample landed in the series
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PointKind {
    /// New point
    Inserted,
    /// Overwrote the value of a point within the merge tolerance
    Merged,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Applied {
    pub kind: PointKind,
    /// Elapsed time of the point that now holds the value
    pub elapsed: f64,
    /// Earliest point dropped by the size cap
    pub evicted: Option<ChartPoint>,
}

impl Applied {
    /// False when the size cap dropped the point that was just applied.
    pub fn is_retained(&self) -> bool {
        self.kind == PointKind::Merged || self.evicted.is_none_or(|p| p.elapsed != self.elapsed)
    }
}

/// Points ordered by elapsed time, limited to `[0, duration_limit]`.
#[derive(Debug, Clone)]
pub struct ChartSeries {
    points: Vec<ChartPoint>,
    duration_limit: f64,
    merge_tolerance: f64,
}

impl ChartSeries {
    pub fn new(duration_limit: f64, merge_tolerance: f64) -> Self {
        Self {
            points: Vec::new(),
            duration_limit,
            merge_tolerance,
        }
    }

    pub fn len(&self) -> usize {
        self.points.len()
    }

    pub fn is_empty(&self) -> bool {
        self.points.is_empty()
    }

    pub fn points(&self) -> &[ChartPoint] {
        &self.points
    }

    pub fn contains_elapsed(&self, elapsed: f64) -> bool {
        (0.0..=self.duration_limit).contains(&elapsed)
    }

    /// Most points kept before the earliest is evicted
    pub fn capacity(&self) -> usize {
        (self.duration_limit.floor() as usize).max(1)
    }

    /// Insert-or-merge. `None` when `elapsed` is outside the window.
    pub fn apply(&mut self, elapsed: f64, value: f64) -> Option<Applied> {
        if !elapsed.is_finite() || !self.contains_elapsed(elapsed) {
            return None;
        }

        if let Some(idx) = self.nearest_within_tolerance(elapsed) {
            let point = &mut self.points[idx];
            point.value = value;
            return Some(Applied {
                kind: PointKind::Merged,
                elapsed: point.elapsed,
                evicted: None,
            });
        }

        // After any equal timestamps, so ties keep arrival order
        let idx = self.points.partition_point(|p| p.elapsed <= elapsed);
        let point = ChartPoint { elapsed, value };

        let evicted = if self.points.len() < self.capacity() {
            self.points.insert(idx, point);
            None
        } else if idx == 0 {
            // Earlier than everything kept: trimmed on arrival
            Some(point)
        } else {
            self.points.insert(idx, point);
            Some(self.points.remove(0))
        };

        Some(Applied {
            kind: PointKind::Inserted,
            elapsed,
            evicted,
        })
    }

    pub fn clear(&mut self) {
        self.points.clear();
    }

    /// Closest point strictly less than the tolerance away.
    fn nearest_within_tolerance(&self, elapsed: f64) -> Option<usize> {
        let idx = self.points.partition_point(|p| p.elapsed < elapsed);
        [idx.checked_sub(1), Some(idx)]
            .into_iter()
            .flatten()
            .filter_map(|i| self.points.get(i).map(|p| (i, (p.elapsed - elapsed).abs())))
            .filter(|(_, distance)| *distance < self.merge_tolerance)
            .min_by(|a, b| a.1.total_cmp(&b.1))
            .map(|(i, _)| i)
    }
}
