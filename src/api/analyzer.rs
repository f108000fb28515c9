//! Signal source backed by a JSON file of per-symbol signals.

use std::collections::HashMap;
use std::path::Path;

use anyhow::{Context, Result};
use async_trait::async_trait;
use tracing::debug;

use crate::models::Signal;

use super::AnalysisProvider;

/// Returns a fixed signal per symbol.
///
/// The file is a JSON object keyed by symbol:
/// ```json
/// { "XBTUSDTM": { "direction": "long", "confidence": "0.9",
///                 "current_price": "64000", "suggested_leverage": 3 } }
/// ```
pub struct ScriptedAnalyzer {
    signals: HashMap<String, Signal>,
}

impl ScriptedAnalyzer {
    pub fn new(signals: HashMap<String, Signal>) -> Self {
        Self { signals }
    }

    /// Load signals from a JSON file.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read signals file {}", path.display()))?;
        let signals: HashMap<String, Signal> = serde_json::from_str(&raw)
            .with_context(|| format!("Failed to parse signals file {}", path.display()))?;

        Ok(Self::new(signals))
    }

    /// Symbols with a signal, sorted.
    pub fn symbols(&self) -> Vec<String> {
        let mut symbols: Vec<_> = self.signals.keys().cloned().collect();
        symbols.sort();
        symbols
    }
}

#[async_trait]
impl AnalysisProvider for ScriptedAnalyzer {
    async fn analyze(&self, symbol: &str) -> Result<Signal> {
        debug!(symbol = %symbol, "Analyzing market");
        self.signals
            .get(symbol)
            .cloned()
            .with_context(|| format!("No signal available for {}", symbol))
    }
}
