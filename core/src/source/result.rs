use std::time::{Duration, Instant};

use tracing::{Level, Span, debug};

use crate::broker::Record;
use crate::errors::{BrokerError, KafkaErrorCode};
use crate::source::want::FetchWant;

/// The outcome of one or more fetch round trips for a single want.
#[derive(Debug)]
pub struct FetchResult {
    pub records: Vec<Record>,
    pub error: Option<BrokerError>,
    /// `-1` when the response didn't carry one.
    pub high_watermark: i64,
    pub log_start_offset: i64,
    pub fetched_bytes: usize,
    /// Context of the fetch the records came from.
    pub span: Span,
    pub(crate) waiting_since: Option<Instant>,
}

impl Default for FetchResult {
    fn default() -> Self {
        Self {
            records: Vec::new(),
            error: None,
            high_watermark: -1,
            log_start_offset: -1,
            fetched_bytes: 0,
            span: Span::none(),
            waiting_since: None,
        }
    }
}

impl FetchResult {
    pub fn empty(span: Span) -> Self {
        Self {
            span,
            ..Default::default()
        }
    }

    pub fn from_error(span: Span, error: BrokerError) -> Self {
        Self {
            span,
            error: Some(error),
            ..Default::default()
        }
    }

    pub fn last_offset(&self) -> Option<i64> {
        self.records.last().map(|r| r.offset)
    }

    /// Merges `self` with an older result of the same want. The older
    /// records come first; everything else is taken from `self`, which is
    /// more up to date.
    pub fn merge(mut self, older: FetchResult) -> FetchResult {
        if !older.records.is_empty() {
            debug!(
                parent: &older.span,
                older_records = older.records.len(),
                newer_records = self.records.len(),
                "merged fetch result with the next result"
            );
        }
        let mut records = older.records;
        records.append(&mut self.records);
        self.records = records;
        self.fetched_bytes += older.fetched_bytes;
        self
    }

    pub(crate) fn start_waiting_for_consumption(&mut self) {
        self.waiting_since = Some(Instant::now());
    }

    /// Returns how long the result waited to be consumed, zero if it never had
    /// to wait.
    pub(crate) fn finish_waiting_for_consumption(&mut self) -> Duration {
        self.waiting_since
            .take()
            .map(|since| since.elapsed())
            .unwrap_or_default()
    }

    pub(crate) fn log_completed_fetch(&self, fetch_start: Instant, want: &FetchWant) {
        let got_records = self.records.len() as i64;
        let asked_records = want.num_records();
        let asked_bytes = want.max_bytes() as i64;
        let (first_timestamp, last_timestamp) = match (self.records.first(), self.records.last()) {
            (Some(first), Some(last)) => (
                first.timestamp.map(|t| t.to_rfc3339()).unwrap_or_default(),
                last.timestamp.map(|t| t.to_rfc3339()).unwrap_or_default(),
            ),
            _ => (String::new(), String::new()),
        };
        let err = self.error.as_ref().map(ToString::to_string).unwrap_or_default();

        macro_rules! log_fetch {
            ($level:expr, $msg:expr) => {
                tracing::event!(
                    parent: &self.span,
                    $level,
                    duration = ?fetch_start.elapsed(),
                    start_offset = want.start_offset,
                    end_offset = want.end_offset,
                    asked_records,
                    got_records,
                    diff_records = asked_records - got_records,
                    asked_bytes,
                    got_bytes = self.fetched_bytes,
                    diff_bytes = asked_bytes - self.fetched_bytes as i64,
                    first_timestamp = %first_timestamp,
                    last_timestamp = %last_timestamp,
                    hwm = self.high_watermark,
                    lso = self.log_start_offset,
                    err = %err,
                    $msg
                )
            };
        }

        match &self.error {
            None => log_fetch!(Level::DEBUG, "fetched records"),
            Some(BrokerError::Kafka(KafkaErrorCode::OffsetOutOfRange)) => log_fetch!(
                Level::DEBUG,
                "received an error while fetching records; will retry after processing received records (if any)"
            ),
            Some(_) => log_fetch!(
                Level::ERROR,
                "received an error while fetching records; will retry after processing received records (if any)"
            ),
        }
    }
}
