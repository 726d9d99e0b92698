/// Estimate used for the very first want, before any record has been seen.
pub const INITIAL_BYTES_PER_RECORD: i64 = 10_000;

/// When fetching few records we can afford to over-fetch to avoid more requests.
const MIN_FETCH_BYTES: i64 = 1_000_000;

/// Most under-estimations of a response size are by less than 5%.
const OVER_FETCH_BYTES_FACTOR: f64 = 1.05;

const CURRENT_ESTIMATE_WEIGHT: f64 = 0.8;
const OBSERVED_ESTIMATE_WEIGHT: f64 = 0.2;

/// A range of offsets to fetch.
///
/// The broker can't be asked for a number of records, only for a number of
/// bytes, so a want carries an estimate of the record size which it uses to
/// size the request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FetchWant {
    /// Inclusive.
    pub start_offset: i64,
    /// Exclusive.
    pub end_offset: i64,
    pub estimated_bytes_per_record: i64,
    pub target_max_bytes: i64,
}

impl FetchWant {
    pub fn from_offset(
        offset: i64,
        target_max_bytes: i64,
        estimated_bytes_per_record: i64,
    ) -> Self {
        let estimated_bytes_per_record = estimated_bytes_per_record.max(1);
        let estimated_number_of_records = (target_max_bytes / estimated_bytes_per_record).max(1);
        Self {
            start_offset: offset,
            end_offset: offset.saturating_add(estimated_number_of_records),
            estimated_bytes_per_record,
            target_max_bytes,
        }
    }

    /// The want for the records right after this one, with the same sizing.
    pub fn next(&self) -> Self {
        Self::from_offset(
            self.end_offset,
            self.target_max_bytes,
            self.estimated_bytes_per_record,
        )
    }

    pub fn is_complete(&self) -> bool {
        self.start_offset >= self.end_offset
    }

    pub fn num_records(&self) -> i64 {
        self.end_offset.saturating_sub(self.start_offset)
    }

    /// The maximum number of bytes to ask for in a single request: never less
    /// than 1MB and never more than the protocol allows.
    pub fn max_bytes(&self) -> i32 {
        let fetch_bytes = self.expected_bytes();
        if fetch_bytes > i32::MAX as i64 || fetch_bytes < 0 {
            // The want should have been trimmed before it was sent, but never
            // ask for a negative or truncated size.
            return i32::MAX;
        }
        fetch_bytes.max(MIN_FETCH_BYTES) as i32
    }

    /// Blends the bytes per record observed in the last fetch into the
    /// estimate. Smoothing keeps a fetch of a handful of records from
    /// dictating how the next fetch of thousands of records is sized.
    pub fn update_bytes_per_record(
        mut self,
        last_fetch_bytes: usize,
        last_fetch_records: usize,
    ) -> Self {
        if last_fetch_records == 0 {
            return self;
        }
        let actual_bytes_per_record = last_fetch_bytes as f64 / last_fetch_records as f64;
        self.estimated_bytes_per_record = (CURRENT_ESTIMATE_WEIGHT
            * self.estimated_bytes_per_record as f64
            + OBSERVED_ESTIMATE_WEIGHT * actual_bytes_per_record)
            as i64;
        self
    }

    /// Shrinks the range so that `max_bytes()` isn't capped. Keeps at least
    /// one record.
    pub fn trimmed(mut self) -> Self {
        if self.expected_bytes() <= i32::MAX as i64 {
            return self;
        }
        let bytes_per_record = self.estimated_bytes_per_record.max(1) as f64;
        let max_records = (i32::MAX as f64 / OVER_FETCH_BYTES_FACTOR / bytes_per_record) as i64;
        self.end_offset = self.start_offset.saturating_add(max_records.max(1));
        self
    }

    /// Bytes needed to hold the whole range at the current estimate. May be
    /// more than the protocol supports.
    fn expected_bytes(&self) -> i64 {
        (OVER_FETCH_BYTES_FACTOR
            * (self.estimated_bytes_per_record as f64 * self.num_records() as f64)) as i64
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn want(start_offset: i64, end_offset: i64, estimated_bytes_per_record: i64) -> FetchWant {
        FetchWant {
            start_offset,
            end_offset,
            estimated_bytes_per_record,
            target_max_bytes: 1_000_000,
        }
    }

    #[test]
    fn test_from_offset_sizes_range_by_estimate() {
        let w = FetchWant::from_offset(100, 1_000_000, 10_000);
        assert_eq!(w.start_offset, 100);
        assert_eq!(w.end_offset, 200);

        // Always at least one record, and a zero estimate is treated as 1.
        let w = FetchWant::from_offset(5, 10, 10_000);
        assert_eq!(w.end_offset, 6);
        let w = FetchWant::from_offset(0, 10, 0);
        assert_eq!(w.estimated_bytes_per_record, 1);
        assert_eq!(w.end_offset, 10);
    }

    #[test]
    fn test_next_starts_at_end() {
        let w = want(100, 150, 20_000);
        let next = w.next();
        assert_eq!(next.start_offset, 150);
        assert_eq!(next.end_offset, 200);
        assert_eq!(next.estimated_bytes_per_record, 20_000);
    }

    #[test]
    fn test_update_bytes_per_record_smooths_estimate() {
        let w = want(0, 100, 10).update_bytes_per_record(2000, 100);
        assert_eq!(w.estimated_bytes_per_record, 12);

        // Nothing observed, nothing learned.
        let w = want(0, 100, 10).update_bytes_per_record(0, 0);
        assert_eq!(w.estimated_bytes_per_record, 10);
    }

    #[test]
    fn test_estimate_converges() {
        let mut w = want(0, 100, 10_000);
        for _ in 0..100 {
            w = w.update_bytes_per_record(50_000, 100);
        }
        assert!((w.estimated_bytes_per_record - 500).abs() <= 5);
    }

    #[test]
    fn test_max_bytes_bounds() {
        assert_eq!(want(0, 1, 1).max_bytes(), 1_000_000);
        assert_eq!(want(0, 1000, 10_000).max_bytes(), 10_500_000);

        let extremes = [
            want(0, i64::MAX, i64::MAX),
            want(0, 1, i64::MAX),
            want(0, i64::MAX, 1),
            want(0, 0, 1),
            want(0, 10, i64::MIN),
            want(i64::MIN, i64::MAX, 1),
        ];
        for w in extremes {
            let max_bytes = w.max_bytes();
            assert!(
                (1_000_000..=i32::MAX).contains(&max_bytes),
                "{w:?} got {max_bytes}"
            );
        }
    }

    #[test]
    fn test_trimmed_fits_protocol_limit() {
        let w = FetchWant::from_offset(0, i32::MAX as i64, 1);
        assert_eq!(w.max_bytes(), i32::MAX);

        let trimmed = w.trimmed();
        assert_eq!(trimmed.start_offset, 0);
        assert!(trimmed.end_offset < w.end_offset);
        assert!(trimmed.expected_bytes() <= i32::MAX as i64);

        // A single huge record can't be trimmed further.
        let w = want(7, 10, i32::MAX as i64).trimmed();
        assert_eq!(w.end_offset, 8);

        // Wants that already fit are left alone.
        let w = want(0, 100, 10);
        assert_eq!(w.trimmed(), w);
    }
}
