use std::sync::Arc;

use parking_lot::Mutex;
use serde_json::Value;

use overwatch_engine::{EngineConfig, GeneratorConfig, InstructionGenerator, PolicyEngine, SuggestionAdvisor};
use overwatch_llm::mock::{MockBackend, MockResponse};
use overwatch_core::ids::{PolicyId, SessionId};
use overwatch_store::{
    Database, EventRow, EventStore, NewEvent, PolicyAction, PolicyRepo, PolicyRow, PolicyStore, StoreError, Stores,
};

use crate::gateway::Gateway;
use crate::hub::{Channel, ChannelError, ChannelState, HubRegistry};
use crate::lifecycle::LifecycleManager;

enum Behavior {
    Record,
    Fail,
    Panic,
}

/// Channel that keeps every message it is sent.
pub struct RecordingChannel {
    behavior: Behavior,
    state: Mutex<ChannelState>,
    messages: Mutex<Vec<String>>,
}

impl RecordingChannel {
    fn with(behavior: Behavior) -> Arc<Self> {
        Arc::new(Self {
            behavior,
            state: Mutex::new(ChannelState::Open),
            messages: Mutex::new(Vec::new()),
        })
    }

    pub fn open() -> Arc<Self> {
        Self::with(Behavior::Record)
    }

    pub fn failing() -> Arc<Self> {
        Self::with(Behavior::Fail)
    }

    pub fn panicking() -> Arc<Self> {
        Self::with(Behavior::Panic)
    }

    pub fn set_state(&self, state: ChannelState) {
        *self.state.lock() = state;
    }

    pub fn received(&self) -> Vec<String> {
        self.messages.lock().clone()
    }

    pub fn received_json(&self) -> Vec<Value> {
        self.received()
            .iter()
            .map(|m| serde_json::from_str(m).unwrap())
            .collect()
    }
}

impl Channel for RecordingChannel {
    fn send(&self, message: String) -> Result<(), ChannelError> {
        match self.behavior {
            Behavior::Record => {
                self.messages.lock().push(message);
                Ok(())
            }
            Behavior::Fail => Err(ChannelError::Failed("connection reset".into())),
            Behavior::Panic => panic!("channel exploded"),
        }
    }

    fn state(&self) -> ChannelState {
        *self.state.lock()
    }
}

pub fn workers_ai_policy() -> PolicyRow {
    PolicyRow {
        id: PolicyId::from_raw("pol_workers_ai"),
        name: "workers-ai-import".into(),
        description: "Use the AI binding instead of importing workers-ai".into(),
        active: true,
        condition: "payload LIKE '%workers-ai%'".into(),
        action: PolicyAction::Warn,
        prompt_template: None,
    }
}

pub struct TestContext {
    pub db: Database,
    pub backend: Arc<MockBackend>,
    pub hubs: Arc<HubRegistry>,
    pub lifecycle: Arc<LifecycleManager>,
    pub gateway: Arc<Gateway>,
}

/// In-memory gateway with the workers-ai policy loaded and a scripted backend.
pub fn context(responses: Vec<MockResponse>) -> TestContext {
    context_with(responses, |stores| stores)
}

/// Like [`context`], with a chance to swap individual stores first.
pub fn context_with(responses: Vec<MockResponse>, adjust: impl FnOnce(Stores) -> Stores) -> TestContext {
    let db = Database::in_memory().unwrap();
    PolicyRepo::new(db.clone()).upsert(&workers_ai_policy()).unwrap();
    let stores = adjust(Stores::sqlite(&db));

    let backend = Arc::new(MockBackend::new(responses));
    let generator = Arc::new(InstructionGenerator::new(backend.clone(), GeneratorConfig::default()));
    let engine = Arc::new(PolicyEngine::new(
        stores.policies.clone(),
        stores.interventions.clone(),
        generator.clone(),
        EngineConfig {
            policy_fetch_backoff: std::time::Duration::from_millis(1),
            ..Default::default()
        },
    ));
    let advisor = Arc::new(SuggestionAdvisor::new(
        stores.events.clone(),
        stores.policies.clone(),
        generator,
    ));
    let hubs = Arc::new(HubRegistry::new());
    let lifecycle = Arc::new(LifecycleManager::new(
        stores.sessions.clone(),
        std::time::Duration::from_secs(3600),
    ));
    let gateway = Arc::new(Gateway::new(
        stores,
        engine,
        advisor,
        hubs.clone(),
        lifecycle.clone(),
    ));

    TestContext {
        db,
        backend,
        hubs,
        lifecycle,
        gateway,
    }
}

/// Policy store that is always offline.
pub struct OfflinePolicies;

impl PolicyStore for OfflinePolicies {
    fn active_policies(&self) -> Result<Vec<PolicyRow>, StoreError> {
        Err(StoreError::Database("policy store offline".into()))
    }

    fn get_policy(&self, _id: &PolicyId) -> Result<PolicyRow, StoreError> {
        Err(StoreError::Database("policy store offline".into()))
    }
}

/// Event store whose writes and reads all fail.
pub struct OfflineEvents;

impl EventStore for OfflineEvents {
    fn create_event(&self, _new: &NewEvent) -> Result<EventRow, StoreError> {
        Err(StoreError::Database("disk I/O error".into()))
    }

    fn events_by_session(&self, _id: &SessionId, _limit: u32) -> Result<Vec<EventRow>, StoreError> {
        Err(StoreError::Database("disk I/O error".into()))
    }
}
