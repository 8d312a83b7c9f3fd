//! Decision sources: where strategies hand their per-cycle decisions to the
//! scheduler.

use super::model::TradeDecision;
use anyhow::{Context, Result};
use async_trait::async_trait;
use std::collections::HashMap;
use std::io::ErrorKind;
use std::path::PathBuf;
use tokio::sync::RwLock;
use tracing::debug;

/// Supplies the current decisions of a strategy.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait DecisionSource: Send + Sync {
    async fn decisions(&self, strategy_id: &str) -> Result<Vec<TradeDecision>>;
}

/// Reads `{dir}/{strategy_id}.json`, a JSON array of decisions.
///
/// A missing file means the strategy has nothing to do this cycle.
pub struct JsonFileDecisionSource {
    dir: PathBuf,
}

impl JsonFileDecisionSource {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    fn path_for(&self, strategy_id: &str) -> PathBuf {
        self.dir.join(format!("{strategy_id}.json"))
    }
}

#[async_trait]
impl DecisionSource for JsonFileDecisionSource {
    async fn decisions(&self, strategy_id: &str) -> Result<Vec<TradeDecision>> {
        let path = self.path_for(strategy_id);
        let raw = match tokio::fs::read_to_string(&path).await {
            Ok(raw) => raw,
            Err(e) if e.kind() == ErrorKind::NotFound => {
                debug!(strategy_id, path = %path.display(), "No decision file");
                return Ok(Vec::new());
            }
            Err(e) => {
                return Err(e).with_context(|| format!("Failed to read {}", path.display()))
            }
        };

        serde_json::from_str(&raw)
            .with_context(|| format!("Failed to parse decisions in {}", path.display()))
    }
}

/// In-memory decisions, replaced wholesale per strategy.
#[derive(Default)]
pub struct StaticDecisionSource {
    decisions: RwLock<HashMap<String, Vec<TradeDecision>>>,
}

impl StaticDecisionSource {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn set(&self, strategy_id: &str, decisions: Vec<TradeDecision>) {
        self.decisions
            .write()
            .await
            .insert(strategy_id.to_string(), decisions);
    }
}

#[async_trait]
impl DecisionSource for StaticDecisionSource {
    async fn decisions(&self, strategy_id: &str) -> Result<Vec<TradeDecision>> {
        Ok(self
            .decisions
            .read()
            .await
            .get(strategy_id)
            .cloned()
            .unwrap_or_default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn temp_dir(name: &str) -> PathBuf {
        let dir = std::env::temp_dir().join(format!(
            "order-scheduler-{name}-{}",
            std::process::id()
        ));
        std::fs::create_dir_all(&dir).unwrap();
        dir
    }

    #[tokio::test]
    async fn test_missing_file_is_empty() {
        let source = JsonFileDecisionSource::new(temp_dir("missing"));
        assert!(source.decisions("nobody").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_reads_decision_array() {
        let dir = temp_dir("read");
        std::fs::write(
            dir.join("alpha.json"),
            r#"[{
                "sequence": 12,
                "symbol": "BTCUSDT",
                "side": "BUY",
                "action": "open",
                "sizing": {"margin": "100"},
                "reference_price": "50000",
                "leverage": 10
            }]"#,
        )
        .unwrap();

        let source = JsonFileDecisionSource::new(&dir);
        let decisions = source.decisions("alpha").await.unwrap();
        assert_eq!(decisions.len(), 1);
        assert_eq!(decisions[0].sequence, 12);
        assert_eq!(decisions[0].leverage, Some(10));
    }

    #[tokio::test]
    async fn test_malformed_file_is_an_error() {
        let dir = temp_dir("bad");
        std::fs::write(dir.join("beta.json"), "{not json").unwrap();
        let source = JsonFileDecisionSource::new(&dir);
        assert!(source.decisions("beta").await.is_err());
    }
}
