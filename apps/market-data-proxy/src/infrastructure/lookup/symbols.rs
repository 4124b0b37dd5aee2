//! CSV symbol master.
//!
//! One row per client-facing instrument:
//!
//! ```text
//! symbol,venue,provider,provider_symbol
//! RELIANCE,NSE,kite,738561
//! ```
//!
//! Symbol and venue lookups are case-insensitive. Provider names are stored
//! lowercase to match the configured provider pools.

use std::collections::HashMap;
use std::io::Read;
use std::path::Path;

use serde::Deserialize;

use crate::application::ports::{LookupError, ResolvedSymbol, SymbolResolver};

#[derive(Debug, Deserialize)]
struct SymbolRow {
    symbol: String,
    venue: String,
    provider: String,
    provider_symbol: String,
}

/// In-memory symbol table.
#[derive(Debug, Clone, Default)]
pub struct SymbolMaster {
    entries: HashMap<(String, String), ResolvedSymbol>,
}

impl SymbolMaster {
    /// Create an empty table.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Load a table from a CSV file.
    ///
    /// # Errors
    ///
    /// Returns `LookupError::SymbolMaster` if the file cannot be opened or
    /// has a malformed header.
    pub fn from_path(path: impl AsRef<Path>) -> Result<Self, LookupError> {
        let path = path.as_ref();
        let file = std::fs::File::open(path)
            .map_err(|e| LookupError::SymbolMaster(format!("{}: {e}", path.display())))?;
        let master = Self::from_reader(file)?;
        tracing::info!(
            path = %path.display(),
            symbols = master.len(),
            "Symbol master loaded"
        );
        Ok(master)
    }

    /// Load a table from CSV text.
    ///
    /// Rows with missing fields are skipped with a warning.
    ///
    /// # Errors
    ///
    /// Returns `LookupError::SymbolMaster` if the header cannot be read.
    pub fn from_reader(reader: impl Read) -> Result<Self, LookupError> {
        let mut csv = csv::ReaderBuilder::new()
            .trim(csv::Trim::All)
            .from_reader(reader);
        csv.headers()
            .map_err(|e| LookupError::SymbolMaster(e.to_string()))?;

        let mut master = Self::new();
        let mut skipped = 0usize;
        for row in csv.deserialize::<SymbolRow>() {
            match row {
                Ok(row) if !row.symbol.is_empty() && !row.provider_symbol.is_empty() => {
                    master.insert(&row.symbol, &row.venue, &row.provider, row.provider_symbol);
                }
                Ok(_) | Err(_) => skipped += 1,
            }
        }
        if skipped > 0 {
            tracing::warn!(skipped, "Symbol master rows skipped");
        }
        Ok(master)
    }

    /// Add or replace one mapping.
    pub fn insert(
        &mut self,
        symbol: &str,
        venue: &str,
        provider: &str,
        provider_symbol: impl Into<String>,
    ) {
        self.entries.insert(
            (symbol.to_uppercase(), venue.to_uppercase()),
            ResolvedSymbol {
                provider_name: provider.to_lowercase(),
                provider_symbol: provider_symbol.into(),
            },
        );
    }

    /// Number of mappings.
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether the table is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl SymbolResolver for SymbolMaster {
    fn resolve(&self, symbol: &str, venue: &str) -> Option<ResolvedSymbol> {
        self.entries
            .get(&(symbol.to_uppercase(), venue.to_uppercase()))
            .cloned()
    }
}

#[cfg(test)]
mod tests {
    use std::io::Write;

    use super::*;

    const CSV: &str = "symbol,venue,provider,provider_symbol
RELIANCE,NSE,kite,738561
 infy , nse , KITE , 408065
BTCUSDT,BINANCE,binance,btcusdt
BROKEN,NSE
";

    #[test]
    fn loads_rows_and_resolves_case_insensitively() {
        let master = SymbolMaster::from_reader(CSV.as_bytes()).unwrap();

        assert_eq!(master.len(), 3);
        assert_eq!(
            master.resolve("reliance", "nse"),
            Some(ResolvedSymbol {
                provider_name: "kite".to_string(),
                provider_symbol: "738561".to_string(),
            })
        );
        let infy = master.resolve("INFY", "NSE").unwrap();
        assert_eq!(infy.provider_name, "kite");
        assert_eq!(infy.provider_symbol, "408065");
    }

    #[test]
    fn unknown_pair_is_none() {
        let master = SymbolMaster::from_reader(CSV.as_bytes()).unwrap();
        assert!(master.resolve("RELIANCE", "BSE").is_none());
        assert!(master.resolve("TCS", "NSE").is_none());
    }

    #[test]
    fn loads_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(CSV.as_bytes()).unwrap();

        let master = SymbolMaster::from_path(file.path()).unwrap();
        assert_eq!(
            master.resolve("btcusdt", "binance").unwrap().provider_symbol,
            "btcusdt"
        );
    }

    #[test]
    fn missing_file_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let err = SymbolMaster::from_path(dir.path().join("absent.csv")).unwrap_err();
        assert!(matches!(err, LookupError::SymbolMaster(_)));
    }
}
