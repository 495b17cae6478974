// Runner Pool
// Capacity-limited, tagged runner slots in front of an environment provider

use crate::config::RunnerSlotConfig;
use crate::runtime::{
    tags_match, Environment, EnvironmentError, EnvironmentProvider, EnvironmentRequest, ExecStatus,
};

use async_trait::async_trait;
use futures::future::select_all;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tokio_util::sync::CancellationToken;

struct Slot {
    config: RunnerSlotConfig,
    permits: Arc<Semaphore>,
}

/// Limits how many environments each runner slot hands out at once.
///
/// A request waits on every slot whose tags cover the job's tags and takes
/// the first permit that frees up. The caller bounds the wait.
pub struct RunnerPool {
    slots: Vec<Slot>,
    inner: Arc<dyn EnvironmentProvider>,
}

impl RunnerPool {
    pub fn new(inner: Arc<dyn EnvironmentProvider>, slots: Vec<RunnerSlotConfig>) -> Self {
        let slots = slots
            .into_iter()
            .map(|config| Slot {
                permits: Arc::new(Semaphore::new(config.capacity)),
                config,
            })
            .collect();
        Self { slots, inner }
    }

    /// Free permits per slot
    pub fn available(&self) -> Vec<(String, usize)> {
        self.slots
            .iter()
            .map(|s| (s.config.name.clone(), s.permits.available_permits()))
            .collect()
    }

    async fn reserve(
        &self,
        request: &EnvironmentRequest,
    ) -> Result<(String, OwnedSemaphorePermit), EnvironmentError> {
        let eligible: Vec<&Slot> = self
            .slots
            .iter()
            .filter(|slot| tags_match(&request.tags, &slot.config.tags))
            .collect();

        if eligible.is_empty() {
            return Err(EnvironmentError::Unavailable(format!(
                "no runner slot offers tags [{}]",
                request.tags.join(", ")
            )));
        }

        let waits = eligible
            .iter()
            .map(|slot| Box::pin(slot.permits.clone().acquire_owned()));
        let (permit, index, _) = select_all(waits).await;
        let permit = permit.map_err(|_| {
            EnvironmentError::Unavailable("runner pool is shut down".to_string())
        })?;

        Ok((eligible[index].config.name.clone(), permit))
    }
}

#[async_trait]
impl EnvironmentProvider for RunnerPool {
    fn name(&self) -> &str {
        self.inner.name()
    }

    async fn acquire(
        &self,
        request: &EnvironmentRequest,
    ) -> Result<Box<dyn Environment>, EnvironmentError> {
        let (slot, permit) = self.reserve(request).await?;
        tracing::debug!(job = %request.job, %slot, "runner slot reserved");

        let inner = self.inner.acquire(request).await?;
        Ok(Box::new(PooledEnvironment {
            inner,
            _permit: permit,
        }))
    }
}

/// Holds its slot permit until dropped
struct PooledEnvironment {
    inner: Box<dyn Environment>,
    _permit: OwnedSemaphorePermit,
}

#[async_trait]
impl Environment for PooledEnvironment {
    fn id(&self) -> &str {
        self.inner.id()
    }

    async fn exec(
        &mut self,
        line: &str,
        env: &HashMap<String, String>,
        cancel: &CancellationToken,
    ) -> Result<ExecStatus, EnvironmentError> {
        self.inner.exec(line, env, cancel).await
    }

    async fn release(&mut self) {
        self.inner.release().await;
    }
}
