use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, info, instrument, warn};

use overwatch_core::ids::SessionId;
use overwatch_store::{EventRow, InterventionRow, InterventionStore, NewIntervention, PolicyRow, PolicyStore};

use crate::condition;
use crate::error::EngineError;
use crate::generator::InstructionGenerator;

#[derive(Clone, Debug)]
pub struct EngineConfig {
    pub policy_fetch_timeout: Duration,
    pub policy_fetch_attempts: u32,
    pub policy_fetch_backoff: Duration,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            policy_fetch_timeout: Duration::from_secs(3),
            policy_fetch_attempts: 2,
            policy_fetch_backoff: Duration::from_millis(100),
        }
    }
}

/// Evaluates events against the active policy set and records an
/// intervention for every match.
pub struct PolicyEngine {
    policies: Arc<dyn PolicyStore>,
    interventions: Arc<dyn InterventionStore>,
    generator: Arc<InstructionGenerator>,
    config: EngineConfig,
}

impl PolicyEngine {
    pub fn new(
        policies: Arc<dyn PolicyStore>,
        interventions: Arc<dyn InterventionStore>,
        generator: Arc<InstructionGenerator>,
        config: EngineConfig,
    ) -> Self {
        Self {
            policies,
            interventions,
            generator,
            config,
        }
    }

    /// Evaluate one event. Returns the interventions created, in policy
    /// order. Only a failed policy fetch is an error; everything after that
    /// is isolated per policy.
    #[instrument(skip(self, event), fields(session_id = %session_id, event_id = %event.id))]
    pub async fn evaluate_policies(
        &self,
        session_id: &SessionId,
        event: &EventRow,
    ) -> Result<Vec<InterventionRow>, EngineError> {
        let policies = self.fetch_policies().await?;
        let mut fired = Vec::new();

        for policy in policies.iter().filter(|p| p.active) {
            if !condition::evaluate(&policy.condition, event) {
                continue;
            }
            debug!(policy_id = %policy.id, "policy matched");

            let generated = self.generator.generate(policy, event).await;
            let new = NewIntervention {
                session_id: session_id.clone(),
                rule_id: policy.id.clone(),
                event_id: Some(event.id.clone()),
                decision: policy.action,
                reasoning: Some(generated.reasoning),
                instruction: Some(generated.instruction),
            };

            match self.interventions.create_intervention(&new) {
                Ok(row) => {
                    info!(
                        policy_id = %policy.id,
                        intervention_id = %row.id,
                        decision = %row.decision,
                        "intervention recorded"
                    );
                    fired.push(row);
                }
                Err(e) => warn!(policy_id = %policy.id, error = %e, "failed to record intervention, dropping"),
            }
        }

        Ok(fired)
    }

    async fn fetch_policies(&self) -> Result<Vec<PolicyRow>, EngineError> {
        let attempts = self.config.policy_fetch_attempts.max(1);
        let mut last_error = String::new();

        for attempt in 1..=attempts {
            let store = Arc::clone(&self.policies);
            let read = tokio::task::spawn_blocking(move || store.active_policies());

            last_error = match tokio::time::timeout(self.config.policy_fetch_timeout, read).await {
                Ok(Ok(Ok(policies))) => return Ok(policies),
                Ok(Ok(Err(e))) => e.to_string(),
                Ok(Err(join)) => format!("policy fetch task failed: {join}"),
                Err(_) => format!("timed out after {:?}", self.config.policy_fetch_timeout),
            };
            warn!(attempt, attempts, error = %last_error, "active policy fetch failed");

            if attempt < attempts {
                tokio::time::sleep(self.config.policy_fetch_backoff).await;
            }
        }

        Err(EngineError::PolicyFetch {
            attempts,
            reason: last_error,
        })
    }
}
