//! Listing snapshot loading and universe resolution.
//!
//! The listing is a CSV screener export. Only two columns matter (symbol and
//! last-sale price); everything else is ignored.

use crate::domain::{ExclusionRule, Instrument};
use std::collections::BTreeSet;
use std::io::Read;
use std::path::{Path, PathBuf};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum UniverseError {
    #[error("listing snapshot {} is unavailable: {reason}", path.display())]
    SourceUnavailable { path: PathBuf, reason: String },

    #[error("listing snapshot is missing column '{column}'")]
    MissingColumn { column: String },
}

/// Parse a screener price cell such as `$1,234.56`.
///
/// Returns `None` for empty or non-numeric text.
pub fn parse_price(raw: &str) -> Option<f64> {
    let cleaned: String = raw
        .chars()
        .filter(|c| *c != '$' && *c != ',' && !c.is_whitespace())
        .collect();
    if cleaned.is_empty() {
        return None;
    }
    cleaned.parse::<f64>().ok().filter(|p| p.is_finite())
}

/// Candidate records read from one listing snapshot, in file order.
#[derive(Debug, Clone, Default)]
pub struct ListingSnapshot {
    pub instruments: Vec<Instrument>,
    /// Rows dropped while reading (unparsable record, empty symbol).
    pub unreadable_rows: usize,
}

impl ListingSnapshot {
    /// Read a snapshot file. A missing or unreadable file is `SourceUnavailable`.
    pub fn from_path(
        path: &Path,
        symbol_column: &str,
        price_column: &str,
    ) -> Result<Self, UniverseError> {
        let file = std::fs::File::open(path).map_err(|e| UniverseError::SourceUnavailable {
            path: path.to_path_buf(),
            reason: e.to_string(),
        })?;
        Self::from_reader(file, symbol_column, price_column).map_err(|e| match e {
            UniverseError::SourceUnavailable { reason, .. } => UniverseError::SourceUnavailable {
                path: path.to_path_buf(),
                reason,
            },
            other => other,
        })
    }

    pub fn from_reader<R: Read>(
        reader: R,
        symbol_column: &str,
        price_column: &str,
    ) -> Result<Self, UniverseError> {
        let mut rdr = csv::ReaderBuilder::new()
            .has_headers(true)
            .flexible(true)
            .trim(csv::Trim::All)
            .from_reader(reader);

        let headers = rdr
            .headers()
            .map_err(|e| UniverseError::SourceUnavailable {
                path: PathBuf::new(),
                reason: e.to_string(),
            })?
            .clone();
        let column = |name: &str| {
            headers
                .iter()
                .position(|h| h.eq_ignore_ascii_case(name))
                .ok_or_else(|| UniverseError::MissingColumn {
                    column: name.to_string(),
                })
        };
        let symbol_idx = column(symbol_column)?;
        let price_idx = column(price_column)?;

        let mut snapshot = ListingSnapshot::default();
        for record in rdr.records() {
            let Ok(record) = record else {
                snapshot.unreadable_rows += 1;
                continue;
            };
            let symbol = record.get(symbol_idx).unwrap_or("");
            if symbol.trim().is_empty() {
                snapshot.unreadable_rows += 1;
                continue;
            }
            let price = record.get(price_idx).and_then(parse_price);
            snapshot.instruments.push(Instrument::new(symbol, price));
        }
        Ok(snapshot)
    }
}

/// Outcome of filtering a snapshot down to the target universe.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct UniverseResolution {
    pub symbols: BTreeSet<String>,
    /// Records with an absent or non-numeric price, plus unreadable rows.
    pub skipped_malformed: usize,
    pub out_of_range: usize,
    pub excluded: usize,
}

/// Keep symbols priced within `[min_price, max_price]` that are standard
/// equities under `rule`.
pub fn resolve_universe(
    snapshot: &ListingSnapshot,
    min_price: f64,
    max_price: f64,
    rule: &ExclusionRule,
) -> UniverseResolution {
    let mut resolution = UniverseResolution {
        skipped_malformed: snapshot.unreadable_rows,
        ..Default::default()
    };

    for instrument in &snapshot.instruments {
        let Some(price) = instrument.price else {
            resolution.skipped_malformed += 1;
            continue;
        };
        if price < min_price || price > max_price {
            resolution.out_of_range += 1;
            continue;
        }
        if !instrument.is_standard_equity(rule) {
            resolution.excluded += 1;
            continue;
        }
        resolution.symbols.insert(instrument.symbol.clone());
    }

    if resolution.skipped_malformed > 0 {
        tracing::warn!(
            skipped = resolution.skipped_malformed,
            "listing records with malformed price skipped"
        );
    }
    tracing::info!(
        eligible = resolution.symbols.len(),
        out_of_range = resolution.out_of_range,
        excluded = resolution.excluded,
        min_price,
        max_price,
        "universe resolved"
    );

    resolution
}

#[cfg(test)]
mod tests {
    use super::*;

    const LISTING: &str = "\
Symbol,Name,Last Sale,Net Change
AAA,Alpha Corp,$10.00,0.1
BBB,Beta Inc,$300.00,1.2
CCC,Gamma Ltd,N/A,0
DDDDW,Delta Warrants,$2.50,0
EE.B,Echo Class B,$50.00,0
FFF,Foxtrot,\"$1,234.56\",3
GGG,Golf,$2.00,0
HHH,Hotel,$200.00,0
ZAZZT,Test Issue,$10.00,0
";

    fn snapshot() -> ListingSnapshot {
        ListingSnapshot::from_reader(LISTING.as_bytes(), "Symbol", "Last Sale").unwrap()
    }

    #[test]
    fn price_parsing_strips_currency_formatting() {
        assert_eq!(parse_price("$1,234.56"), Some(1234.56));
        assert_eq!(parse_price(" 10 "), Some(10.0));
        assert_eq!(parse_price(""), None);
        assert_eq!(parse_price("N/A"), None);
    }

    #[test]
    fn snapshot_reads_all_rows() {
        let snap = snapshot();
        assert_eq!(snap.instruments.len(), 9);
        assert_eq!(snap.instruments[5].price, Some(1234.56));
    }

    #[test]
    fn resolves_closed_interval_and_exclusions() {
        let rule = ExclusionRule::new(crate::domain::DEFAULT_EXCLUSION_PATTERN).unwrap();
        let res = resolve_universe(&snapshot(), 2.0, 200.0, &rule);
        let expected: BTreeSet<String> = ["AAA", "GGG", "HHH"].iter().map(|s| s.to_string()).collect();
        assert_eq!(res.symbols, expected);
        assert_eq!(res.skipped_malformed, 1);
        assert_eq!(res.out_of_range, 2);
        assert_eq!(res.excluded, 3);
    }

    #[test]
    fn missing_price_column_is_an_error() {
        let err = ListingSnapshot::from_reader("Symbol,Name\nAAA,x\n".as_bytes(), "Symbol", "Last Sale")
            .unwrap_err();
        assert!(matches!(err, UniverseError::MissingColumn { .. }));
    }

    #[test]
    fn missing_file_is_source_unavailable() {
        let dir = tempfile::tempdir().unwrap();
        let err = ListingSnapshot::from_path(&dir.path().join("nope.csv"), "Symbol", "Last Sale")
            .unwrap_err();
        assert!(matches!(err, UniverseError::SourceUnavailable { .. }));
    }
}
