//! Incremental update stream.
//!
//! Fulfillment-changed batches arrive as JSON lines. A reader task parses
//! each line and pushes the batch onto a bounded `mpsc` channel; the single
//! consumer loop drains the channel and merges batches into the store in
//! arrival order.

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tokio::io::{AsyncBufRead, AsyncBufReadExt};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::error::{StreamError, StreamResult};
use crate::model::FulfillmentCheckResult;
use crate::store::FulfillmentStore;

/// One fulfillment-changed batch.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UpdateBatch {
    /// Results in arrival order; may be empty.
    pub kpi_fulfillment_check_results: Vec<FulfillmentCheckResult>,
}

impl UpdateBatch {
    /// Create a batch.
    pub fn new(results: Vec<FulfillmentCheckResult>) -> Self {
        Self {
            kpi_fulfillment_check_results: results,
        }
    }
}

/// Parse one stream line into a batch.
///
/// Besides the bare batch, the shapes the `onKPIFulfillmentChecked`
/// subscription delivers are unwrapped: `{"onKPIFulfillmentChecked": batch}`
/// and `{"data": {"onKPIFulfillmentChecked": batch}}`.
pub fn parse_batch(line: &str) -> StreamResult<UpdateBatch> {
    let mut value: serde_json::Value = serde_json::from_str(line)?;
    if let Some(data) = value.get_mut("data").map(serde_json::Value::take) {
        value = data;
    }
    if let Some(batch) = value
        .get_mut("onKPIFulfillmentChecked")
        .map(serde_json::Value::take)
    {
        value = batch;
    }
    Ok(serde_json::from_value(value)?)
}

/// Create the batch channel.
pub fn channel(capacity: usize) -> (mpsc::Sender<UpdateBatch>, mpsc::Receiver<UpdateBatch>) {
    mpsc::channel(capacity.max(1))
}

/// Counters reported by [`read_batches`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ReaderStats {
    /// Non-empty lines read.
    pub lines: usize,
    /// Batches forwarded to the channel.
    pub batches: usize,
    /// Lines skipped as malformed or oversized.
    pub skipped: usize,
}

/// Outcome of [`read_bounded_line`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum RawLine {
    Eof,
    Complete,
    TooLong,
}

/// Read one line into `buf`, newline excluded, keeping at most `max_len`
/// bytes. The rest of a longer line is consumed and discarded.
async fn read_bounded_line<R>(
    reader: &mut R,
    buf: &mut Vec<u8>,
    max_len: usize,
) -> std::io::Result<RawLine>
where
    R: AsyncBufRead + Unpin,
{
    buf.clear();
    let mut read_any = false;
    let mut too_long = false;

    loop {
        let available = reader.fill_buf().await?;
        if available.is_empty() {
            break;
        }
        read_any = true;

        let newline = available.iter().position(|b| *b == b'\n');
        let chunk = &available[..newline.unwrap_or(available.len())];
        if !too_long {
            if buf.len() + chunk.len() > max_len {
                too_long = true;
                buf.clear();
            } else {
                buf.extend_from_slice(chunk);
            }
        }
        let used = chunk.len() + usize::from(newline.is_some());
        reader.consume(used);
        if newline.is_some() {
            break;
        }
    }

    Ok(match (read_any, too_long) {
        (false, _) => RawLine::Eof,
        (true, false) => RawLine::Complete,
        (true, true) => RawLine::TooLong,
    })
}

/// Read JSON lines from `reader` and forward parsed batches until EOF.
///
/// Empty lines are ignored; malformed or oversized lines are logged and
/// skipped. No more than `max_line_bytes` of a line are held in memory.
///
/// # Errors
/// Returns [`StreamError::Io`] when reading fails and [`StreamError::Closed`]
/// when the consumer has gone away.
pub async fn read_batches<R>(
    mut reader: R,
    sender: mpsc::Sender<UpdateBatch>,
    max_line_bytes: usize,
) -> StreamResult<ReaderStats>
where
    R: AsyncBufRead + Unpin,
{
    let mut stats = ReaderStats::default();
    let mut buf = Vec::new();

    loop {
        match read_bounded_line(&mut reader, &mut buf, max_line_bytes).await? {
            RawLine::Eof => {
                debug!("EOF on update stream");
                break;
            }
            RawLine::TooLong => {
                stats.lines += 1;
                let e = StreamError::LineTooLong {
                    limit: max_line_bytes,
                };
                warn!(error = %e, line = stats.lines, "Skipping update batch");
                stats.skipped += 1;
                continue;
            }
            RawLine::Complete => {}
        }

        // Invalid UTF-8 is replaced and then fails to parse like any other
        // malformed line.
        let line = String::from_utf8_lossy(&buf);
        let trimmed = line.trim();
        if trimmed.is_empty() {
            continue;
        }
        stats.lines += 1;

        let batch = match parse_batch(trimmed) {
            Ok(batch) => batch,
            Err(e) => {
                warn!(error = %e, line = stats.lines, "Skipping malformed update batch");
                stats.skipped += 1;
                continue;
            }
        };

        debug!(
            results = batch.kpi_fulfillment_check_results.len(),
            "Update batch received"
        );
        sender.send(batch).await.map_err(|_| StreamError::Closed)?;
        stats.batches += 1;
    }

    Ok(stats)
}

/// Counters reported by [`run_consumer`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ConsumerStats {
    /// Batches merged.
    pub batches: usize,
    /// Results contained in those batches.
    pub results: usize,
    /// Instance changes reported by the store, summed over batches.
    pub changed_instances: usize,
}

/// Drain the channel into the store until every sender is dropped.
pub async fn run_consumer(
    mut receiver: mpsc::Receiver<UpdateBatch>,
    store: Arc<FulfillmentStore>,
) -> ConsumerStats {
    let mut stats = ConsumerStats::default();
    while let Some(batch) = receiver.recv().await {
        let changed = store.ingest_update(&batch.kpi_fulfillment_check_results);
        stats.batches += 1;
        stats.results += batch.kpi_fulfillment_check_results.len();
        stats.changed_instances += changed.len();
        if !changed.is_empty() {
            debug!(instances = ?changed, "Instances changed");
        }
    }
    info!(
        batches = stats.batches,
        results = stats.results,
        changed = stats.changed_instances,
        "Update stream drained"
    );
    stats
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::{BulkLoad, Catalog};
    use serde_json::json;

    #[test]
    fn test_parse_bare_batch() {
        let batch = parse_batch(
            r#"{"kpiFulfillmentCheckResults":[{"kpiDefinitionID":"1","sdInstanceID":"2","fulfilled":true}]}"#,
        )
        .unwrap();
        assert_eq!(
            batch.kpi_fulfillment_check_results,
            vec![FulfillmentCheckResult::new(1, 2, Some(true))]
        );
    }

    #[test]
    fn test_parse_subscription_envelopes() {
        let inner = json!({ "kpiFulfillmentCheckResults": [
            { "kpiDefinitionID": 3, "sdInstanceID": 4, "fulfilled": null }
        ]});
        let expected = UpdateBatch::new(vec![FulfillmentCheckResult::new(3, 4, None)]);

        let wrapped = json!({ "onKPIFulfillmentChecked": inner.clone() }).to_string();
        assert_eq!(parse_batch(&wrapped).unwrap(), expected);

        let response = json!({ "data": { "onKPIFulfillmentChecked": inner } }).to_string();
        assert_eq!(parse_batch(&response).unwrap(), expected);
    }

    #[test]
    fn test_parse_empty_batch() {
        assert_eq!(
            parse_batch(r#"{"kpiFulfillmentCheckResults":[]}"#).unwrap(),
            UpdateBatch::default()
        );
    }

    #[test]
    fn test_parse_malformed_batch() {
        let err = parse_batch(r#"{"kpiFulfillmentCheckResults":[{"sdInstanceID":1}]}"#).unwrap_err();
        assert!(matches!(err, StreamError::MalformedBatch(_)));
        assert!(parse_batch("not json").is_err());
        assert!(parse_batch("{}").is_err());
    }

    #[tokio::test]
    async fn test_read_batches_skips_bad_lines() {
        let input = concat!(
            "{\"kpiFulfillmentCheckResults\":[{\"kpiDefinitionID\":1,\"sdInstanceID\":1,\"fulfilled\":true}]}\n",
            "\n",
            "garbage\n",
            "{\"kpiFulfillmentCheckResults\":[]}\n",
        );
        let (tx, mut rx) = channel(8);
        let stats = read_batches(input.as_bytes(), tx, 1024).await.unwrap();
        assert_eq!(
            stats,
            ReaderStats {
                lines: 3,
                batches: 2,
                skipped: 1
            }
        );
        assert_eq!(rx.recv().await.unwrap().kpi_fulfillment_check_results.len(), 1);
        assert_eq!(rx.recv().await.unwrap(), UpdateBatch::default());
        assert!(rx.recv().await.is_none());
    }

    #[tokio::test]
    async fn test_read_batches_skips_oversized_lines() {
        let input = "{\"kpiFulfillmentCheckResults\":[]}\n";
        let (tx, _rx) = channel(8);
        let stats = read_batches(input.as_bytes(), tx, 10).await.unwrap();
        assert_eq!(stats.skipped, 1);
        assert_eq!(stats.batches, 0);
    }

    #[tokio::test]
    async fn test_bounded_line_discards_the_excess() {
        let mut input = "x".repeat(1024 * 1024);
        input.push_str("\n{}\n");
        let mut reader = tokio::io::BufReader::with_capacity(16, input.as_bytes());
        let mut buf = Vec::new();

        let first = read_bounded_line(&mut reader, &mut buf, 64).await.unwrap();
        assert_eq!(first, RawLine::TooLong);
        assert!(buf.is_empty());
        assert!(buf.capacity() < 1024);

        let second = read_bounded_line(&mut reader, &mut buf, 64).await.unwrap();
        assert_eq!(second, RawLine::Complete);
        assert_eq!(buf, b"{}");

        let third = read_bounded_line(&mut reader, &mut buf, 64).await.unwrap();
        assert_eq!(third, RawLine::Eof);
    }

    #[tokio::test]
    async fn test_read_batches_skips_huge_unterminated_line() {
        let input = "x".repeat(1024 * 1024);
        let (tx, _rx) = channel(8);
        let stats = read_batches(input.as_bytes(), tx, 64).await.unwrap();
        assert_eq!(
            stats,
            ReaderStats {
                lines: 1,
                batches: 0,
                skipped: 1
            }
        );
    }

    #[tokio::test]
    async fn test_read_batches_recovers_after_oversized_line() {
        let mut input = format!("{{\"kpiFulfillmentCheckResults\":[{}]}}\n", " ".repeat(4096));
        input.push_str("{\"kpiFulfillmentCheckResults\":[]}\n");
        let (tx, mut rx) = channel(8);
        let reader = tokio::io::BufReader::with_capacity(64, input.as_bytes());
        let stats = read_batches(reader, tx, 1024).await.unwrap();
        assert_eq!(
            stats,
            ReaderStats {
                lines: 2,
                batches: 1,
                skipped: 1
            }
        );
        assert_eq!(rx.recv().await.unwrap(), UpdateBatch::default());
    }

    #[tokio::test]
    async fn test_read_batches_skips_invalid_utf8() {
        let mut input = vec![0xff, 0xfe, b'\n'];
        input.extend_from_slice(b"{\"kpiFulfillmentCheckResults\":[]}\n");
        let (tx, _rx) = channel(8);
        let stats = read_batches(input.as_slice(), tx, 1024).await.unwrap();
        assert_eq!(stats.skipped, 1);
        assert_eq!(stats.batches, 1);
    }

    #[tokio::test]
    async fn test_read_batches_reports_closed_consumer() {
        let input = "{\"kpiFulfillmentCheckResults\":[]}\n";
        let (tx, rx) = channel(1);
        drop(rx);
        let err = read_batches(input.as_bytes(), tx, 1024).await.unwrap_err();
        assert!(matches!(err, StreamError::Closed));
    }

    #[tokio::test]
    async fn test_consumer_merges_in_arrival_order() {
        let bulk: BulkLoad = serde_json::from_value(json!({
            "sdInstances": [
                { "id": 1, "uid": "a", "userIdentifier": "A", "confirmedByUser": true, "type": { "id": 1 } }
            ],
            "kpiDefinitions": [
                { "id": 1, "userIdentifier": "K", "sdTypeID": 1, "sdTypeSpecification": "t",
                  "nodes": [{ "id": 1, "nodeType": "BooleanEQAtom", "sdParameterID": 1,
                              "sdParameterSpecification": "on", "booleanReferenceValue": true }] }
            ]
        }))
        .unwrap();
        let store = Arc::new(FulfillmentStore::new(Arc::new(Catalog::from_bulk(&bulk))));

        let (tx, rx) = channel(4);
        let consumer = tokio::spawn(run_consumer(rx, Arc::clone(&store)));
        for fulfilled in [Some(true), Some(false), Some(false)] {
            tx.send(UpdateBatch::new(vec![FulfillmentCheckResult::new(1, 1, fulfilled)]))
                .await
                .unwrap();
        }
        drop(tx);

        let stats = consumer.await.unwrap();
        assert_eq!(stats.batches, 3);
        assert_eq!(stats.results, 3);
        assert_eq!(stats.changed_instances, 2);
        assert_eq!(store.not_fulfilled(1), 1);
        assert_eq!(store.version(1), 2);
    }
}
