//! Parser for the meter's cumulative-energy CSV export
//!
//! Rows arrive newest first with a `Date & Time` column holding unix
//! seconds and one `Name [kWh]` column per register with the lifetime
//! energy at that instant. Consumption over an interval is the absolute
//! difference between consecutive rows; some registers count down, which
//! the fold to positive hides.

use crate::{CumulativeRow, FetchError, FetchResult};
use std::collections::HashMap;
use watt_core::Timestamp;

const TIME_COLUMN: &str = "Date & Time";
const KWH_SUFFIX: &str = " [kWh]";

/// Parse a history export into rows sorted oldest first.
pub fn parse_history(body: &str) -> FetchResult<Vec<CumulativeRow>> {
    let mut lines = body.lines();
    let header = lines
        .next()
        .ok_or_else(|| FetchError::MalformedPayload("empty history payload".to_string()))?;
    let columns = split_line(header);
    let ts_idx = columns.iter().position(|c| c == TIME_COLUMN).ok_or_else(|| {
        FetchError::MalformedPayload(format!("history payload has no {TIME_COLUMN:?} column"))
    })?;

    let mut rows = Vec::new();
    for line in lines {
        if line.trim().is_empty() {
            continue;
        }
        let fields = split_line(line);
        if fields.len() != columns.len() {
            return Err(FetchError::MalformedPayload(format!(
                "history row has {} fields, expected {}",
                fields.len(),
                columns.len()
            )));
        }

        let ts: Timestamp = fields[ts_idx].trim().parse().map_err(|_| {
            FetchError::MalformedPayload(format!("bad history timestamp: {:?}", fields[ts_idx]))
        })?;

        let mut kwh = HashMap::new();
        for (i, column) in columns.iter().enumerate() {
            if i == ts_idx {
                continue;
            }
            let name = column.strip_suffix(KWH_SUFFIX).unwrap_or(column).to_string();
            // unparseable cells count as zero, matching the meter's own export quirks
            let value = fields[i].trim().parse::<f64>().unwrap_or(0.0);
            kwh.insert(name, value.abs());
        }
        rows.push(CumulativeRow { ts, kwh });
    }

    rows.sort_by_key(|r| r.ts);
    Ok(rows)
}

/// Per-register consumption between two consecutive history rows
#[derive(Debug, Clone, PartialEq)]
pub struct IntervalConsumption {
    pub start_ts: Timestamp,
    pub end_ts: Timestamp,

    /// Register name to kWh consumed in `[start_ts, end_ts)`
    pub kwh: HashMap<String, f64>,
}

/// Diffs consecutive cumulative rows into interval consumption.
pub fn consumption_between(rows: &[CumulativeRow]) -> Vec<IntervalConsumption> {
    rows.windows(2)
        .map(|pair| {
            let (prev, curr) = (&pair[0], &pair[1]);
            let kwh = curr
                .kwh
                .iter()
                .filter_map(|(name, value)| {
                    prev.kwh.get(name).map(|p| (name.clone(), (value - p).abs()))
                })
                .collect();
            IntervalConsumption {
                start_ts: prev.ts,
                end_ts: curr.ts,
                kwh,
            }
        })
        .collect()
}

fn split_line(line: &str) -> Vec<String> {
    let mut fields = Vec::new();
    let mut cur = String::new();
    let mut in_quotes = false;
    let mut chars = line.chars().peekable();
    while let Some(c) = chars.next() {
        match c {
            '"' if in_quotes && chars.peek() == Some(&'"') => {
                cur.push('"');
                chars.next();
            }
            '"' => in_quotes = !in_quotes,
            ',' if !in_quotes => fields.push(std::mem::take(&mut cur)),
            _ => cur.push(c),
        }
    }
    fields.push(cur);
    fields
}

#[cfg(test)]
mod tests {
    use super::*;

    const EXPORT: &str = "\"Date & Time\",\"Usage [kWh]\",\"Kitchen [kWh]\",\"Car Charger [kWh]\"\n\
        \"1757475600\",\"12010.5\",\"2001.25\",\"510.0\"\n\
        \"1757472000\",\"12008.0\",\"2000.75\",\"508.4\"\n\
        \"1757468400\",\"12005.0\",\"2000.50\",\"508.4\"\n";

    #[test]
    fn test_rows_sorted_oldest_first() {
        let rows = parse_history(EXPORT).unwrap();
        assert_eq!(rows.len(), 3);
        assert_eq!(rows[0].ts, 1_757_468_400);
        assert_eq!(rows[2].ts, 1_757_475_600);
        assert_eq!(rows[0].kwh["Kitchen"], 2000.50);
        assert_eq!(rows[0].kwh["Usage"], 12005.0);
    }

    #[test]
    fn test_consumption_diffs() {
        let rows = parse_history(EXPORT).unwrap();
        let intervals = consumption_between(&rows);
        assert_eq!(intervals.len(), 2);

        let first = &intervals[0];
        assert_eq!(first.start_ts, 1_757_468_400);
        assert_eq!(first.end_ts, 1_757_472_000);
        assert!((first.kwh["Usage"] - 3.0).abs() < 1e-9);
        assert!((first.kwh["Kitchen"] - 0.25).abs() < 1e-9);
        assert!((first.kwh["Car Charger"]).abs() < 1e-9);

        let second = &intervals[1];
        assert!((second.kwh["Car Charger"] - 1.6).abs() < 1e-9);
    }

    #[test]
    fn test_count_down_registers_fold_positive() {
        let body = "\"Date & Time\",\"Generation [kWh]\"\n\
            \"7200\",\"-105.0\"\n\
            \"3600\",\"-100.0\"\n";
        let rows = parse_history(body).unwrap();
        assert_eq!(rows[0].kwh["Generation"], 100.0);
        let intervals = consumption_between(&rows);
        assert!((intervals[0].kwh["Generation"] - 5.0).abs() < 1e-9);
    }

    #[test]
    fn test_unparseable_cell_counts_as_zero() {
        let body = "\"Date & Time\",\"Kitchen [kWh]\"\n\"3600\",\"n/a\"\n";
        let rows = parse_history(body).unwrap();
        assert_eq!(rows[0].kwh["Kitchen"], 0.0);
    }

    #[test]
    fn test_missing_time_column_is_malformed() {
        let body = "\"Kitchen [kWh]\"\n\"1.0\"\n";
        assert!(matches!(
            parse_history(body),
            Err(FetchError::MalformedPayload(_))
        ));
    }

    #[test]
    fn test_bad_timestamp_is_malformed() {
        let body = "\"Date & Time\",\"Kitchen [kWh]\"\n\"yesterday\",\"1.0\"\n";
        assert!(matches!(
            parse_history(body),
            Err(FetchError::MalformedPayload(_))
        ));
    }

    #[test]
    fn test_quoted_names_with_commas() {
        let body = "\"Date & Time\",\"Washer, Dryer [kWh]\"\n\"3600\",\"4.5\"\n";
        let rows = parse_history(body).unwrap();
        assert_eq!(rows[0].kwh["Washer, Dryer"], 4.5);
    }
}
