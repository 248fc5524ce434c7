//! Deterministic ingestion and normalization pipeline (C2, §4.2).

use serde::Serialize;
use sha2::{Digest, Sha256};
use std::path::Path;

use crate::canon::round_via_canon;
use crate::dataset::calendar::Calendar;
use crate::domain::{AnomalyCounters, Candle, DatasetMetadata};
use crate::errors::{EngineError, EngineResult};

const MAX_DUPLICATE_SAMPLES: usize = 5;

/// Declared source parameters a client supplies alongside a CSV path.
#[derive(Debug, Clone)]
pub struct SourceDeclaration {
    pub symbol: String,
    pub timeframe: String,
    /// Fixed UTC offset in minutes the source timestamps are stated in.
    pub source_tz_offset_minutes: i64,
    pub calendar_id: String,
}

struct RawRow {
    ts: i64,
    o: f64,
    h: f64,
    l: f64,
    c: f64,
    v: i64,
}

/// Parse the declared timeframe string (`"1m"`, `"5m"`, `"1h"`, `"1d"`) into
/// seconds.
pub fn declared_bar_seconds(timeframe: &str) -> EngineResult<f64> {
    let (num_str, unit) = timeframe.split_at(
        timeframe
            .find(|c: char| c.is_alphabetic())
            .ok_or_else(|| EngineError::InvalidParam(format!("bad timeframe: {timeframe}")))?,
    );
    let num: f64 = num_str
        .parse()
        .map_err(|_| EngineError::InvalidParam(format!("bad timeframe: {timeframe}")))?;
    let unit_seconds = match unit {
        "s" => 1.0,
        "m" => 60.0,
        "h" => 3600.0,
        "d" => 86_400.0,
        _ => {
            return Err(EngineError::InvalidParam(format!(
                "unknown timeframe unit: {unit}"
            )))
        }
    };
    Ok(num * unit_seconds)
}

/// Result of the full ingestion pipeline: the immutable normalized candle
/// sequence plus its provenance metadata.
pub struct IngestedDataset {
    pub candles: Vec<Candle>,
    pub metadata: DatasetMetadata,
}

/// Run the deterministic ingestion pipeline over a CSV file, in the exact
/// step order §4.2 lists.
pub fn ingest_csv(
    path: &Path,
    decl: &SourceDeclaration,
    now_utc_ms: i64,
    timeframe_strict: bool,
) -> EngineResult<IngestedDataset> {
    if !path.exists() {
        return Err(EngineError::DatasetMissing(path.display().to_string()));
    }

    let mut counters = AnomalyCounters::default();
    let mut rows = parse_rows(path, decl, &mut counters)?;

    // Step 3: sort ascending; duplicates on ts keep first.
    rows.sort_by_key(|r| r.ts);
    let mut deduped: Vec<RawRow> = Vec::with_capacity(rows.len());
    for row in rows {
        if let Some(last) = deduped.last() {
            if last.ts == row.ts {
                counters.duplicates_dropped += 1;
                if counters.duplicate_sample_ts.len() < MAX_DUPLICATE_SAMPLES {
                    counters.duplicate_sample_ts.push(row.ts);
                }
                continue;
            }
        }
        deduped.push(row);
    }

    // Step 4: drop rows with ts > now_utc.
    let before_future = deduped.len();
    deduped.retain(|r| r.ts <= now_utc_ms);
    counters.future_rows_dropped = (before_future - deduped.len()) as u64;

    if deduped.is_empty() {
        return Err(EngineError::SchemaMismatch(
            "no usable rows after normalization".to_string(),
        ));
    }

    // Step 5: flag zero-volume rows (retained).
    let candles: Vec<Candle> = deduped
        .iter()
        .map(|r| {
            let zero_volume = r.v == 0;
            if zero_volume {
                counters.zero_volume_rows += 1;
            }
            Candle {
                ts: r.ts,
                o: r.o,
                h: r.h,
                l: r.l,
                c: r.c,
                v: r.v,
                zero_volume,
            }
        })
        .collect();

    // Step 6: observed vs declared bar seconds.
    let observed_bar_seconds = median_delta_seconds(&candles);
    let declared = declared_bar_seconds(&decl.timeframe)?;
    let timeframe_ok = declared <= 0.0
        || (observed_bar_seconds - declared).abs() / declared < 0.05;
    if !timeframe_ok && timeframe_strict {
        return Err(EngineError::SchemaMismatch(format!(
            "observed bar seconds {observed_bar_seconds} does not match declared {declared}"
        )));
    }

    // Step 7: gap classification.
    let calendar = Calendar::from_id(&decl.calendar_id);
    for pair in candles.windows(2) {
        let gap_seconds = (pair[1].ts - pair[0].ts) as f64 / 1000.0;
        if declared > 0.0 && gap_seconds > declared * 1.5 {
            if calendar.is_expected_closure(pair[0].ts, pair[1].ts) {
                counters.expected_closures += 1;
            } else {
                counters.unexpected_gaps += 1;
            }
        }
    }

    // Step 8: canonical columns + data_hash.
    let data_hash = canonical_frame_digest(&candles)?;

    let metadata = DatasetMetadata {
        symbol: decl.symbol.clone(),
        timeframe: decl.timeframe.clone(),
        data_hash,
        calendar_id: calendar.id().to_string(),
        first_ts: candles.first().unwrap().ts,
        last_ts: candles.last().unwrap().ts,
        row_count: candles.len(),
        anomaly_counters: counters,
        observed_bar_seconds,
        declared_bar_seconds: declared,
        timeframe_ok,
    };

    Ok(IngestedDataset { candles, metadata })
}

fn parse_rows(
    path: &Path,
    decl: &SourceDeclaration,
    counters: &mut AnomalyCounters,
) -> EngineResult<Vec<RawRow>> {
    let mut reader = csv::ReaderBuilder::new()
        .has_headers(true)
        .from_path(path)
        .map_err(|e| EngineError::DatasetUnreadable(e.to_string()))?;

    let headers = reader
        .headers()
        .map_err(|e| EngineError::DatasetUnreadable(e.to_string()))?
        .clone();
    let required = ["timestamp", "open", "high", "low", "close", "volume"];
    for col in required {
        if !headers.iter().any(|h| h == col) {
            return Err(EngineError::SchemaMismatch(format!(
                "missing required column: {col}"
            )));
        }
    }

    let offset_ms = decl.source_tz_offset_minutes * 60_000;
    let mut rows = Vec::new();
    for record in reader.records() {
        let record = match record {
            Ok(r) => r,
            Err(_) => {
                counters.rows_dropped_missing += 1;
                continue;
            }
        };
        let get = |name: &str| -> Option<&str> {
            headers
                .iter()
                .position(|h| h == name)
                .and_then(|i| record.get(i))
        };
        let parsed = (|| -> Option<RawRow> {
            let ts_raw: i64 = get("timestamp")?.trim().parse().ok()?;
            let o: f64 = get("open")?.trim().parse().ok()?;
            let h: f64 = get("high")?.trim().parse().ok()?;
            let l: f64 = get("low")?.trim().parse().ok()?;
            let c: f64 = get("close")?.trim().parse().ok()?;
            let v: i64 = get("volume")?.trim().parse().ok()?;
            Some(RawRow {
                ts: ts_raw - offset_ms,
                o,
                h,
                l,
                c,
                v,
            })
        })();
        match parsed {
            Some(row) => rows.push(row),
            None => counters.rows_dropped_missing += 1,
        }
    }
    Ok(rows)
}

fn median_delta_seconds(candles: &[Candle]) -> f64 {
    if candles.len() < 2 {
        return 0.0;
    }
    let mut deltas: Vec<f64> = candles
        .windows(2)
        .map(|p| (p[1].ts - p[0].ts) as f64 / 1000.0)
        .collect();
    deltas.sort_by(|a, b| a.partial_cmp(b).unwrap());
    let mid = deltas.len() / 2;
    if deltas.len() % 2 == 0 {
        (deltas[mid - 1] + deltas[mid]) / 2.0
    } else {
        deltas[mid]
    }
}

#[derive(Serialize)]
struct CanonicalRow {
    ts: i64,
    o: f64,
    h: f64,
    l: f64,
    c: f64,
    v: i64,
    zero_volume: bool,
}

fn canonical_frame_digest(candles: &[Candle]) -> EngineResult<String> {
    let rows: Vec<CanonicalRow> = candles
        .iter()
        .map(|c| CanonicalRow {
            ts: c.ts,
            o: round_via_canon(c.o),
            h: round_via_canon(c.h),
            l: round_via_canon(c.l),
            c: round_via_canon(c.c),
            v: c.v,
            zero_volume: c.zero_volume,
        })
        .collect();
    let bytes = crate::canon::canonicalize(&rows)?;
    Ok(hex::encode(Sha256::digest(&bytes)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn write_csv(contents: &str) -> tempfile::NamedTempFile {
        let mut f = tempfile::NamedTempFile::new().unwrap();
        write!(f, "{contents}").unwrap();
        f
    }

    fn decl() -> SourceDeclaration {
        SourceDeclaration {
            symbol: "TEST".to_string(),
            timeframe: "1m".to_string(),
            source_tz_offset_minutes: 0,
            calendar_id: "24x7".to_string(),
        }
    }

    #[test]
    fn drops_duplicate_timestamps_keeping_first() {
        let csv = "timestamp,open,high,low,close,volume\n\
                   0,1,1,1,1,10\n\
                   0,2,2,2,2,20\n\
                   60000,1,1,1,1,10\n";
        let f = write_csv(csv);
        let ds = ingest_csv(f.path(), &decl(), 10_000_000, false).unwrap();
        assert_eq!(ds.candles.len(), 2);
        assert_eq!(ds.candles[0].o, 1.0);
        assert_eq!(ds.metadata.anomaly_counters.duplicates_dropped, 1);
    }

    #[test]
    fn drops_future_rows() {
        let csv = "timestamp,open,high,low,close,volume\n\
                   0,1,1,1,1,10\n\
                   999999999999999,1,1,1,1,10\n";
        let f = write_csv(csv);
        let ds = ingest_csv(f.path(), &decl(), 60_000, false).unwrap();
        assert_eq!(ds.candles.len(), 1);
        assert_eq!(ds.metadata.anomaly_counters.future_rows_dropped, 1);
    }

    #[test]
    fn flags_zero_volume_rows_but_retains_them() {
        let csv = "timestamp,open,high,low,close,volume\n\
                   0,1,1,1,1,0\n\
                   60000,1,1,1,1,10\n";
        let f = write_csv(csv);
        let ds = ingest_csv(f.path(), &decl(), 10_000_000, false).unwrap();
        assert_eq!(ds.candles.len(), 2);
        assert!(ds.candles[0].zero_volume);
        assert_eq!(ds.metadata.anomaly_counters.zero_volume_rows, 1);
    }

    #[test]
    fn data_hash_independent_of_duplicate_count() {
        let csv_a = "timestamp,open,high,low,close,volume\n\
                     0,1,1,1,1,10\n\
                     60000,2,2,2,2,20\n";
        let csv_b = "timestamp,open,high,low,close,volume\n\
                     0,1,1,1,1,10\n\
                     0,1,1,1,1,10\n\
                     0,1,1,1,1,10\n\
                     60000,2,2,2,2,20\n";
        let fa = write_csv(csv_a);
        let fb = write_csv(csv_b);
        let da = ingest_csv(fa.path(), &decl(), 10_000_000, false).unwrap();
        let db = ingest_csv(fb.path(), &decl(), 10_000_000, false).unwrap();
        assert_eq!(da.metadata.data_hash, db.metadata.data_hash);
    }

    #[test]
    fn missing_file_is_dataset_missing() {
        let err = ingest_csv(Path::new("/nonexistent/path.csv"), &decl(), 0, false).unwrap_err();
        assert!(matches!(err, EngineError::DatasetMissing(_)));
    }

    #[test]
    fn missing_required_column_is_schema_mismatch() {
        let csv = "timestamp,open,high,low,close\n0,1,1,1,1\n";
        let f = write_csv(csv);
        let err = ingest_csv(f.path(), &decl(), 10_000_000, false).unwrap_err();
        assert!(matches!(err, EngineError::SchemaMismatch(_)));
    }
}
