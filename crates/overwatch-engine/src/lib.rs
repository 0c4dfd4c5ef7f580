pub mod condition;
pub mod engine;
pub mod error;
pub mod generator;
pub mod suggestions;
pub mod text;

pub use condition::{evaluate, Condition, ConditionError};
pub use engine::{EngineConfig, PolicyEngine};
pub use error::EngineError;
pub use generator::{GeneratedInstruction, GeneratorConfig, InstructionGenerator, InstructionSource};
pub use suggestions::{SuggestionAdvisor, FALLBACK_SUGGESTIONS};

#[cfg(test)]
pub(crate) mod test_support;
