use std::time::Duration;

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use tracing::{debug, warn};

/// One place a piece of state may live: memory, a local cache, a remote.
#[async_trait]
pub trait StateSource<T: Send + Sync>: Send + Sync {
    fn name(&self) -> &'static str;

    /// Overrides the lookup timeout passed to [`resolve_first`].
    fn timeout(&self) -> Option<Duration> {
        None
    }

    async fn load(&self) -> Result<Option<T>>;

    /// Back-fill after a later source hit. Read-only sources keep the default.
    async fn store(&self, _value: &T) -> Result<()> {
        Ok(())
    }
}

/// Walks `sources` in order and returns the first value found, back-filling
/// every earlier source with it.
///
/// A failing or timed-out source is skipped. If nothing is found and some
/// source failed, the last failure is returned since "absent" cannot be told
/// apart from "unreachable".
pub async fn resolve_first<T: Send + Sync>(
    sources: &[&dyn StateSource<T>],
    default_timeout: Option<Duration>,
) -> Result<Option<T>> {
    let mut last_err = None;
    for (index, source) in sources.iter().enumerate() {
        let loaded = match source.timeout().or(default_timeout) {
            Some(limit) => match tokio::time::timeout(limit, source.load()).await {
                Ok(result) => result,
                Err(_) => Err(anyhow!("{} lookup timed out after {limit:?}", source.name())),
            },
            None => source.load().await,
        };

        match loaded {
            Ok(Some(value)) => {
                debug!(source = source.name(), "state: resolved");
                for earlier in &sources[..index] {
                    if let Err(err) = earlier.store(&value).await {
                        warn!(source = earlier.name(), "state: back-fill failed: {err:#}");
                    }
                }
                return Ok(Some(value));
            }
            Ok(None) => {}
            Err(err) => {
                warn!(source = source.name(), "state: lookup failed: {err:#}");
                last_err = Some(err);
            }
        }
    }

    match last_err {
        Some(err) => Err(err),
        None => Ok(None),
    }
}

#[cfg(test)]
#[path = "tests/state_resolution_tests.rs"]
mod tests;
