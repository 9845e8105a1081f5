//! CSV trace ingestion.
//!
//! Row format: arrival-time (seconds, float), request-id, an ignored column,
//! input tokens (JSON int array), output tokens (JSON int array). Rows whose
//! arrival time lies past the horizon terminate ingestion; a malformed row
//! aborts ingestion with a row-qualified error, and the simulator runs on the
//! rows that parsed.

use std::io::Read;
use std::path::Path;

use tracing::warn;

use super::DEFAULT_MAX_TOKEN_ID;
use crate::error::Error;
use crate::request::{Request, SloClass};
use crate::types::{Tick, TICKS_PER_SEC};

/// Result of ingesting a trace: the successfully parsed prefix plus the
/// error that stopped ingestion, if any.
#[derive(Debug)]
pub struct TraceIngest {
    pub requests: Vec<Request>,
    pub error: Option<Error>,
}

pub fn read_trace_file(path: &Path, horizon: Tick, max_token_id: u32) -> TraceIngest {
    match std::fs::File::open(path) {
        Ok(file) => read_trace(file, horizon, max_token_id),
        Err(e) => TraceIngest {
            requests: Vec::new(),
            error: Some(Error::IoError(e)),
        },
    }
}

pub fn read_trace<R: Read>(reader: R, horizon: Tick, max_token_id: u32) -> TraceIngest {
    let max_token_id = if max_token_id == 0 {
        DEFAULT_MAX_TOKEN_ID
    } else {
        max_token_id
    };
    let mut csv_reader = csv::ReaderBuilder::new()
        .has_headers(false)
        .flexible(false)
        .from_reader(reader);

    let mut requests = Vec::new();
    let mut last_arrival: Tick = 0;
    let horizon_secs = horizon as f64 / TICKS_PER_SEC;

    for (idx, record) in csv_reader.records().enumerate() {
        let row = idx + 1;
        match parse_row(record, row, horizon_secs, last_arrival, max_token_id) {
            Ok(Some(request)) => {
                last_arrival = request.arrival_time();
                requests.push(request);
            }
            Ok(None) => break,
            Err(error) => {
                warn!(row, %error, "trace ingestion aborted");
                return TraceIngest {
                    requests,
                    error: Some(error),
                };
            }
        }
    }
    TraceIngest {
        requests,
        error: None,
    }
}

fn parse_row(
    record: std::result::Result<csv::StringRecord, csv::Error>,
    row: usize,
    horizon_secs: f64,
    last_arrival: Tick,
    max_token_id: u32,
) -> std::result::Result<Option<Request>, Error> {
    let field_err = |reason: String| Error::WorkloadError { row, reason };

    let record = record.map_err(|e| field_err(format!("csv parse failure: {e}")))?;
    if record.len() < 5 {
        return Err(field_err(format!("expected 5 columns, got {}", record.len())));
    }

    let arrival_secs: f64 = record[0]
        .trim()
        .parse()
        .map_err(|e| field_err(format!("bad arrival time '{}': {e}", &record[0])))?;
    if !arrival_secs.is_finite() || arrival_secs < 0.0 {
        return Err(field_err(format!("bad arrival time {arrival_secs}")));
    }
    // Rows beyond the horizon end ingestion cleanly.
    if arrival_secs > horizon_secs {
        return Ok(None);
    }
    let arrival = (arrival_secs * TICKS_PER_SEC).round() as Tick;
    if arrival < last_arrival {
        return Err(field_err(format!(
            "arrival time regressed ({arrival} after {last_arrival})"
        )));
    }

    let id = record[1].trim();
    if id.is_empty() {
        return Err(field_err("empty request id".into()));
    }

    let input_tokens = parse_tokens(&record[3], "input", max_token_id)
        .map_err(&field_err)?;
    let output_tokens = parse_tokens(&record[4], "output", max_token_id)
        .map_err(&field_err)?;
    if input_tokens.is_empty() {
        return Err(field_err("empty input token array".into()));
    }

    Ok(Some(Request::new(
        id.to_string(),
        arrival,
        input_tokens,
        output_tokens,
        SloClass::Unspecified,
        None,
    )))
}

fn parse_tokens(
    field: &str,
    what: &str,
    max_token_id: u32,
) -> std::result::Result<Vec<u32>, String> {
    let tokens: Vec<u32> = serde_json::from_str(field.trim())
        .map_err(|e| format!("bad {what} token array: {e}"))?;
    if let Some(&t) = tokens.iter().find(|&&t| t >= max_token_id) {
        return Err(format!("{what} token {t} out of range (max {max_token_id})"));
    }
    Ok(tokens)
}

#[cfg(test)]
mod tests {
    use super::*;

    const HORIZON: Tick = 10_000_000;

    #[test]
    fn parses_well_formed_rows() {
        let data = "\
0.0,req-a,x,\"[1, 2, 3]\",\"[4, 5]\"
0.5,req-b,x,\"[10]\",\"[11]\"
";
        let ingest = read_trace(data.as_bytes(), HORIZON, 1000);
        assert!(ingest.error.is_none());
        assert_eq!(ingest.requests.len(), 2);
        assert_eq!(ingest.requests[0].id(), "req-a");
        assert_eq!(ingest.requests[1].arrival_time(), 500_000);
        assert_eq!(ingest.requests[0].input_tokens(), &[1, 2, 3]);
    }

    #[test]
    fn horizon_terminates_ingestion_cleanly() {
        let data = "\
0.0,a,x,[1],[2]
99.0,b,x,[1],[2]
";
        let ingest = read_trace(data.as_bytes(), 1_000_000, 1000);
        assert!(ingest.error.is_none());
        assert_eq!(ingest.requests.len(), 1);
    }

    #[test]
    fn malformed_row_aborts_with_row_number() {
        let data = "\
0.0,a,x,[1],[2]
0.1,b,x,not-json,[2]
0.2,c,x,[1],[2]
";
        let ingest = read_trace(data.as_bytes(), HORIZON, 1000);
        assert_eq!(ingest.requests.len(), 1);
        let err = ingest.error.expect("row 2 must fail");
        match err {
            Error::WorkloadError { row, .. } => assert_eq!(row, 2),
            other => panic!("unexpected error {other}"),
        }
    }

    #[test]
    fn out_of_range_token_is_rejected() {
        let data = "0.0,a,x,\"[5000]\",[2]\n";
        let ingest = read_trace(data.as_bytes(), HORIZON, 1000);
        assert!(ingest.requests.is_empty());
        assert!(ingest.error.is_some());
    }

    #[test]
    fn regressed_arrival_is_rejected() {
        let data = "\
1.0,a,x,[1],[2]
0.5,b,x,[1],[2]
";
        let ingest = read_trace(data.as_bytes(), HORIZON, 1000);
        assert_eq!(ingest.requests.len(), 1);
        assert!(ingest.error.is_some());
    }

    #[test]
    fn reads_from_a_file_on_disk() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("trace.csv");
        std::fs::write(&path, "0.25,file-req,x,\"[7, 8, 9]\",\"[10]\"\n").unwrap();
        let ingest = read_trace_file(&path, HORIZON, 1000);
        assert!(ingest.error.is_none());
        assert_eq!(ingest.requests.len(), 1);
        assert_eq!(ingest.requests[0].id(), "file-req");
        assert_eq!(ingest.requests[0].arrival_time(), 250_000);
    }

    #[test]
    fn missing_file_reports_io_error() {
        let ingest = read_trace_file(std::path::Path::new("/nonexistent/trace.csv"), HORIZON, 0);
        assert!(ingest.requests.is_empty());
        assert!(matches!(ingest.error, Some(Error::IoError(_))));
    }
}
