use crate::config::{AcquirePolicy, ThrottleConfig};
use crate::error::{OrchestratorError, Result};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::sync::{OwnedSemaphorePermit, Semaphore, TryAcquireError};
use tokio_util::sync::CancellationToken;

/// Counting limiter shared by running jobs and running DAG node tasks
#[derive(Debug, Clone)]
pub struct ResourceThrottle {
    semaphore: Arc<Semaphore>,
    max: usize,
    policy: AcquirePolicy,
}

/// Permit of some weight, returned to the pool on drop
#[derive(Debug)]
#[must_use = "dropping the token releases it immediately"]
pub struct ResourceToken {
    _permit: OwnedSemaphorePermit,
    weight: u32,
}

impl ResourceToken {
    pub fn weight(&self) -> u32 {
        self.weight
    }
}

/// Point-in-time view of throttle capacity
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ThrottleSnapshot {
    pub available: usize,
    pub max: usize,
    pub in_use: usize,
}

impl ResourceThrottle {
    pub fn new(max: usize, policy: AcquirePolicy) -> Self {
        Self {
            semaphore: Arc::new(Semaphore::new(max)),
            max,
            policy,
        }
    }

    pub fn from_config(config: &ThrottleConfig) -> Self {
        Self::new(config.max_tokens, config.policy)
    }

    pub fn max(&self) -> usize {
        self.max
    }

    pub fn policy(&self) -> AcquirePolicy {
        self.policy
    }

    /// Acquire `weight` tokens, waiting or failing per the configured policy
    pub async fn acquire(&self, weight: u32) -> Result<ResourceToken> {
        self.check_weight(weight)?;
        match self.policy {
            AcquirePolicy::FailFast => self.try_acquire(weight),
            AcquirePolicy::Wait => {
                let permit = self
                    .semaphore
                    .clone()
                    .acquire_many_owned(weight)
                    .await
                    .map_err(|_| OrchestratorError::Cancelled("throttle closed".to_string()))?;
                Ok(ResourceToken {
                    _permit: permit,
                    weight,
                })
            }
        }
    }

    /// Like [`acquire`](Self::acquire), but gives up when `cancel` fires
    pub async fn acquire_cancellable(
        &self,
        weight: u32,
        cancel: &CancellationToken,
    ) -> Result<ResourceToken> {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                Err(OrchestratorError::Cancelled("cancelled while waiting for a resource token".to_string()))
            }
            token = self.acquire(weight) => token,
        }
    }

    /// Non-waiting acquire regardless of policy
    pub fn try_acquire(&self, weight: u32) -> Result<ResourceToken> {
        self.check_weight(weight)?;
        match self.semaphore.clone().try_acquire_many_owned(weight) {
            Ok(permit) => Ok(ResourceToken {
                _permit: permit,
                weight,
            }),
            Err(TryAcquireError::NoPermits) => Err(self.exhausted(weight)),
            Err(TryAcquireError::Closed) => {
                Err(OrchestratorError::Cancelled("throttle closed".to_string()))
            }
        }
    }

    /// Return a token to the pool.
    ///
    /// Consumes the token; dropping it has the same effect.
    pub fn release(&self, token: ResourceToken) {
        drop(token);
    }

    pub fn snapshot(&self) -> ThrottleSnapshot {
        let available = self.semaphore.available_permits();
        ThrottleSnapshot {
            available,
            max: self.max,
            in_use: self.max.saturating_sub(available),
        }
    }

    /// Wake every waiter with a `Cancelled` error.
    ///
    /// The orchestrator closes its throttle on shutdown.
    pub fn close(&self) {
        self.semaphore.close();
    }

    fn check_weight(&self, weight: u32) -> Result<()> {
        if weight == 0 {
            return Err(OrchestratorError::fatal("throttle weight must be at least 1"));
        }
        if weight as usize > self.max {
            return Err(self.exhausted(weight));
        }
        Ok(())
    }

    fn exhausted(&self, weight: u32) -> OrchestratorError {
        OrchestratorError::ResourceExhausted {
            requested: weight,
            available: self.semaphore.available_permits(),
            max: self.max,
        }
    }
}
