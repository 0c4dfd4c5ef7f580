pub mod database;
pub mod error;
pub mod events;
pub mod interventions;
pub mod policies;
pub mod row_helpers;
pub mod schema;
pub mod sessions;
pub mod traits;

pub use database::Database;
pub use error::StoreError;
pub use events::{EventRepo, EventRow, NewEvent, Severity};
pub use interventions::{InterventionRepo, InterventionRow, InterventionUpdate, NewIntervention};
pub use policies::{PolicyAction, PolicyRepo, PolicyRow};
pub use sessions::{NewSession, SessionRepo, SessionRow, SessionStatus, SessionUpdate};
pub use traits::{EventStore, InterventionStore, PolicyStore, SessionStore, Stores};
