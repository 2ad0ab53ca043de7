//! Delay policy: simulated execution cost per operator.

use std::collections::{BTreeMap, HashMap};
use std::future::Future;
use std::time::Duration;

use tokio::sync::RwLock;
use tracing::info;

use crate::error::DelayError;
use crate::tasks::model::Operator;

/// Delay every operator starts with.
pub const DEFAULT_DELAY: Duration = Duration::from_secs(10);

/// Largest delay accepted from the API, in seconds (one day).
pub const MAX_DELAY_SECS: i64 = 86_400;

pub type Delays = BTreeMap<Operator, Duration>;

/// Mutable operator → duration mapping.
///
/// The scheduler copies the relevant entry into each assignment, so
/// updates only affect subtasks handed out afterwards.
pub struct DelayPolicy {
    delays: RwLock<Delays>,
}

impl Default for DelayPolicy {
    fn default() -> Self {
        Self::new()
    }
}

impl DelayPolicy {
    pub fn new() -> Self {
        Self::with_delays(default_delays())
    }

    pub fn with_delays(delays: Delays) -> Self {
        let mut full = default_delays();
        full.extend(delays);
        Self {
            delays: RwLock::new(full),
        }
    }

    pub async fn get(&self, operator: Operator) -> Duration {
        self.delays
            .read()
            .await
            .get(&operator)
            .copied()
            .unwrap_or(DEFAULT_DELAY)
    }

    pub async fn snapshot(&self) -> Delays {
        self.delays.read().await.clone()
    }

    /// Merge stored entries over the current mapping.
    pub async fn load(&self, delays: Delays) {
        let mut current = self.delays.write().await;
        current.extend(delays);
    }

    /// Validate and apply a partial update in whole seconds.
    ///
    /// Either every entry is applied or none is.
    pub async fn apply_update(&self, update: &HashMap<String, i64>) -> Result<Delays, DelayError> {
        self.apply_update_with(update, |_| async { Ok(()) }).await
    }

    /// Like [`DelayPolicy::apply_update`], but the merged mapping is first
    /// handed to `persist`. The write lock is held throughout, and nothing
    /// changes in memory unless `persist` succeeds.
    pub async fn apply_update_with<F, Fut, E>(
        &self,
        update: &HashMap<String, i64>,
        persist: F,
    ) -> Result<Delays, E>
    where
        F: FnOnce(Delays) -> Fut,
        Fut: Future<Output = Result<(), E>>,
        E: From<DelayError>,
    {
        let parsed = parse_update(update)?;
        let mut delays = self.delays.write().await;
        let mut next = delays.clone();
        next.extend(parsed.iter().copied());
        persist(next.clone()).await?;

        for (operator, delay) in &parsed {
            info!(operator = %operator, delay_secs = delay.as_secs(), "Delay updated");
        }
        *delays = next.clone();
        Ok(next)
    }
}

pub fn default_delays() -> Delays {
    Operator::ALL.iter().map(|op| (*op, DEFAULT_DELAY)).collect()
}

/// Validate a wire update (`{"plus": 5, ...}` in seconds).
pub fn parse_update(update: &HashMap<String, i64>) -> Result<Vec<(Operator, Duration)>, DelayError> {
    let mut parsed = Vec::with_capacity(update.len());
    for (key, value) in update {
        let operator: Operator = key
            .parse()
            .map_err(|_| DelayError::UnknownOperator(key.clone()))?;
        if *value < 0 {
            return Err(DelayError::Negative {
                operator: key.clone(),
                value: *value,
            });
        }
        if *value > MAX_DELAY_SECS {
            return Err(DelayError::TooLarge {
                operator: key.clone(),
                value: *value,
                max: MAX_DELAY_SECS,
            });
        }
        parsed.push((operator, Duration::from_secs(*value as u64)));
    }
    Ok(parsed)
}

/// Wire form: operator name → whole seconds.
pub fn to_wire(delays: &Delays) -> BTreeMap<String, u64> {
    delays
        .iter()
        .map(|(op, d)| (op.name().to_string(), d.as_secs()))
        .collect()
}
