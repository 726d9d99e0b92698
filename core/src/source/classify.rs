//! Decides how a fetch worker reacts to a failed fetch.
//!
//! Every error a fetch can end with is listed here explicitly, together with
//! what to do about it. Nothing is fatal: the worst case is an exponential
//! backoff before the next attempt. The only errors that change the want are
//! offset-out-of-range errors for records deleted by retention.

use tracing::{debug, error};

use crate::errors::{BrokerError, KafkaErrorCode};
use crate::source::want::FetchWant;

/// What the worker should do before the next attempt of a want.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryPolicy {
    /// Try again right away.
    RetryNow,
    /// The records don't exist yet. Give the broker one max-wait period for
    /// them to be produced.
    WaitForProduce,
    Backoff,
    /// The client's view of the cluster is probably stale.
    RefreshMetadataAndBackoff,
}

/// Classifies `err` returned while fetching `want`. `partition_start` is the
/// last known log start offset of the partition.
///
/// Returns the want to retry, which only differs from `want` when part of
/// its range was deleted by retention, and the policy to apply before the
/// retry.
pub fn classify_fetch_err(
    err: &BrokerError,
    mut want: FetchWant,
    partition_start: Result<i64, BrokerError>,
) -> (FetchWant, RetryPolicy) {
    use KafkaErrorCode::*;

    let policy = match err {
        BrokerError::Kafka(OffsetOutOfRange) => {
            let partition_start = match partition_start {
                Ok(offset) => offset,
                Err(start_err) => {
                    error!(
                        start_offset = want.start_offset,
                        end_offset = want.end_offset,
                        err = %start_err,
                        "failed to find start offset to readjust on OffsetOutOfRange; retrying same records range"
                    );
                    return (want, RetryPolicy::RetryNow);
                }
            };

            if want.start_offset >= partition_start {
                // Either the broker is lagging or the records weren't
                // produced yet. Both are expected to resolve on their own.
                debug!(
                    log_start_offset = partition_start,
                    start_offset = want.start_offset,
                    end_offset = want.end_offset,
                    "offset out of range; waiting for new records to be produced"
                );
                return (want, RetryPolicy::WaitForProduce);
            }

            if partition_start >= want.end_offset {
                // The whole range is gone. The wants after this one cover
                // what is still retained.
                debug!(
                    log_start_offset = partition_start,
                    start_offset = want.start_offset,
                    end_offset = want.end_offset,
                    "we're too far behind; aborting fetch"
                );
                want.start_offset = want.end_offset;
            } else {
                debug!(
                    log_start_offset = partition_start,
                    start_offset = want.start_offset,
                    end_offset = want.end_offset,
                    "part of fetch want is outside of available offsets; adjusted start offset"
                );
                want.start_offset = partition_start;
            }
            RetryPolicy::RetryNow
        }

        BrokerError::Kafka(TopicAuthorizationFailed)
        | BrokerError::Kafka(UnknownTopicOrPartition)
        | BrokerError::Kafka(KafkaStorageError)
        | BrokerError::Kafka(UnknownTopicId) => RetryPolicy::Backoff,

        BrokerError::Kafka(UnsupportedCompressionType) => {
            error!(err = %err, "received UNSUPPORTED_COMPRESSION_TYPE from kafka; this shouldn't happen; please report this as a bug");
            RetryPolicy::Backoff
        }
        BrokerError::Kafka(UnsupportedVersion) => {
            error!(err = %err, "received UNSUPPORTED_VERSION from kafka; the Kafka cluster is probably too old");
            RetryPolicy::Backoff
        }
        BrokerError::Kafka(OffsetMovedToTieredStorage) => {
            error!(err = %err, "received OFFSET_MOVED_TO_TIERED_STORAGE from kafka; this shouldn't happen; please report this as a bug");
            RetryPolicy::Backoff
        }

        BrokerError::Kafka(NotLeaderForPartition)
        | BrokerError::Kafka(ReplicaNotAvailable)
        | BrokerError::Kafka(UnknownLeaderEpoch)
        | BrokerError::Kafka(FencedLeaderEpoch)
        | BrokerError::Kafka(LeaderNotAvailable)
        | BrokerError::Kafka(BrokerNotAvailable)
        | BrokerError::UnknownPartitionLeader
        | BrokerError::FindingLeader(_) => RetryPolicy::RefreshMetadataAndBackoff,

        // The client already knows about these; its metadata should be
        // current by the time we retry.
        BrokerError::UnknownBroker(_)
        | BrokerError::BrokerDied
        | BrokerError::ConnectionClosed
        | BrokerError::FirstReadEof => RetryPolicy::RetryNow,

        // The broker may have gone away without closing the connection.
        BrokerError::IoTimeout | BrokerError::Kafka(RequestTimedOut) => {
            RetryPolicy::RefreshMetadataAndBackoff
        }

        BrokerError::UnexpectedResponse(_)
        | BrokerError::StartOffsetUnavailable
        | BrokerError::Client(_)
        | BrokerError::Kafka(Other(_)) => {
            error!(err = %err, "received an error we're not prepared to handle; this shouldn't happen; please report this as a bug");
            RetryPolicy::Backoff
        }
    };

    (want, policy)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn want(start_offset: i64, end_offset: i64) -> FetchWant {
        FetchWant {
            start_offset,
            end_offset,
            estimated_bytes_per_record: 100,
            target_max_bytes: 1_000_000,
        }
    }

    const OUT_OF_RANGE: BrokerError = BrokerError::Kafka(KafkaErrorCode::OffsetOutOfRange);

    #[test]
    fn test_want_before_partition_start_is_completed() {
        let (adjusted, policy) = classify_fetch_err(&OUT_OF_RANGE, want(0, 10), Ok(20));
        assert!(adjusted.is_complete());
        assert_eq!(adjusted.start_offset, 10);
        assert_eq!(adjusted.end_offset, 10);
        assert_eq!(policy, RetryPolicy::RetryNow);

        // Exactly at the end of the want.
        let (adjusted, _) = classify_fetch_err(&OUT_OF_RANGE, want(0, 10), Ok(10));
        assert!(adjusted.is_complete());
    }

    #[test]
    fn test_want_overlapping_partition_start_is_fast_forwarded() {
        let (adjusted, policy) = classify_fetch_err(&OUT_OF_RANGE, want(0, 10), Ok(4));
        assert_eq!(adjusted.start_offset, 4);
        assert_eq!(adjusted.end_offset, 10);
        assert_eq!(policy, RetryPolicy::RetryNow);
    }

    #[test]
    fn test_want_beyond_end_waits_for_produce() {
        let (adjusted, policy) = classify_fetch_err(&OUT_OF_RANGE, want(100, 110), Ok(20));
        assert_eq!(adjusted, want(100, 110));
        assert_eq!(policy, RetryPolicy::WaitForProduce);

        let (_, policy) = classify_fetch_err(&OUT_OF_RANGE, want(20, 30), Ok(20));
        assert_eq!(policy, RetryPolicy::WaitForProduce);
    }

    #[test]
    fn test_unknown_partition_start_retries_same_range() {
        let (adjusted, policy) = classify_fetch_err(
            &OUT_OF_RANGE,
            want(0, 10),
            Err(BrokerError::StartOffsetUnavailable),
        );
        assert_eq!(adjusted, want(0, 10));
        assert_eq!(policy, RetryPolicy::RetryNow);
    }

    #[test]
    fn test_policies_by_error_class() {
        use KafkaErrorCode::*;

        let cases = [
            (BrokerError::Kafka(TopicAuthorizationFailed), RetryPolicy::Backoff),
            (BrokerError::Kafka(UnknownTopicOrPartition), RetryPolicy::Backoff),
            (BrokerError::Kafka(UnsupportedCompressionType), RetryPolicy::Backoff),
            (BrokerError::Kafka(UnsupportedVersion), RetryPolicy::Backoff),
            (BrokerError::Kafka(KafkaStorageError), RetryPolicy::Backoff),
            (BrokerError::Kafka(UnknownTopicId), RetryPolicy::Backoff),
            (BrokerError::Kafka(OffsetMovedToTieredStorage), RetryPolicy::Backoff),
            (BrokerError::Kafka(NotLeaderForPartition), RetryPolicy::RefreshMetadataAndBackoff),
            (BrokerError::Kafka(ReplicaNotAvailable), RetryPolicy::RefreshMetadataAndBackoff),
            (BrokerError::Kafka(UnknownLeaderEpoch), RetryPolicy::RefreshMetadataAndBackoff),
            (BrokerError::Kafka(FencedLeaderEpoch), RetryPolicy::RefreshMetadataAndBackoff),
            (BrokerError::Kafka(LeaderNotAvailable), RetryPolicy::RefreshMetadataAndBackoff),
            (BrokerError::Kafka(BrokerNotAvailable), RetryPolicy::RefreshMetadataAndBackoff),
            (BrokerError::UnknownPartitionLeader, RetryPolicy::RefreshMetadataAndBackoff),
            (BrokerError::FindingLeader("no brokers".into()), RetryPolicy::RefreshMetadataAndBackoff),
            (BrokerError::UnknownBroker(3), RetryPolicy::RetryNow),
            (BrokerError::BrokerDied, RetryPolicy::RetryNow),
            (BrokerError::ConnectionClosed, RetryPolicy::RetryNow),
            (BrokerError::FirstReadEof, RetryPolicy::RetryNow),
            (BrokerError::IoTimeout, RetryPolicy::RefreshMetadataAndBackoff),
            (BrokerError::Kafka(RequestTimedOut), RetryPolicy::RefreshMetadataAndBackoff),
            (BrokerError::UnexpectedResponse("wrong topic".into()), RetryPolicy::Backoff),
            (BrokerError::Kafka(Other(42)), RetryPolicy::Backoff),
            (BrokerError::Client("boom".into()), RetryPolicy::Backoff),
        ];

        for (err, expected) in cases {
            let (adjusted, policy) = classify_fetch_err(&err, want(5, 15), Ok(0));
            assert_eq!(policy, expected, "{err}");
            assert_eq!(adjusted, want(5, 15), "{err} must not change the want");
        }
    }
}
