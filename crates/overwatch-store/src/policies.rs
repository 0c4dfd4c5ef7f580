use serde::{Deserialize, Serialize};
use tracing::{instrument, warn};

use overwatch_core::ids::PolicyId;

use crate::database::Database;
use crate::error::StoreError;
use crate::row_helpers;

/// What a fired policy asks the client to do.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum PolicyAction {
    #[serde(rename = "advise")]
    Advise,
    #[serde(rename = "warn")]
    Warn,
    #[serde(rename = "block")]
    Block,
    #[serde(rename = "auto-fix")]
    AutoFix,
}

impl PolicyAction {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Advise => "advise",
            Self::Warn => "warn",
            Self::Block => "block",
            Self::AutoFix => "auto-fix",
        }
    }
}

impl std::fmt::Display for PolicyAction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for PolicyAction {
    type Err = String;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "advise" => Ok(Self::Advise),
            "warn" => Ok(Self::Warn),
            "block" => Ok(Self::Block),
            "auto-fix" => Ok(Self::AutoFix),
            other => Err(format!("unknown policy action: {other}")),
        }
    }
}

/// A named condition -> action rule.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PolicyRow {
    pub id: PolicyId,
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(default = "default_active")]
    pub active: bool,
    pub condition: String,
    pub action: PolicyAction,
    #[serde(default)]
    pub prompt_template: Option<String>,
}

fn default_active() -> bool {
    true
}

pub struct PolicyRepo {
    db: Database,
}

impl PolicyRepo {
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    /// Insert or replace a policy by id. Used by startup seeding and admin tooling.
    #[instrument(skip(self, policy), fields(policy_id = %policy.id, name = %policy.name))]
    pub fn upsert(&self, policy: &PolicyRow) -> Result<(), StoreError> {
        let now = overwatch_core::timestamp_now();
        self.db.with_conn(|conn| {
            conn.execute(
                "INSERT INTO policies (id, name, description, active, condition, action, prompt_template, created_at, updated_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?8)
                 ON CONFLICT(id) DO UPDATE SET
                    name = excluded.name,
                    description = excluded.description,
                    active = excluded.active,
                    condition = excluded.condition,
                    action = excluded.action,
                    prompt_template = excluded.prompt_template,
                    updated_at = excluded.updated_at",
                rusqlite::params![
                    policy.id.as_str(),
                    policy.name,
                    policy.description,
                    policy.active,
                    policy.condition,
                    policy.action.as_str(),
                    policy.prompt_template,
                    now,
                ],
            )?;
            Ok(())
        })
    }

    /// Active policies in creation order. The single read is the evaluation snapshot.
    /// Rows that fail to decode are logged and left out.
    #[instrument(skip(self))]
    pub fn list_active(&self) -> Result<Vec<PolicyRow>, StoreError> {
        self.db.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT id, name, description, active, condition, action, prompt_template
                 FROM policies WHERE active = 1 ORDER BY created_at, rowid",
            )?;
            let mut rows = stmt.query([])?;
            let mut results = Vec::new();
            while let Some(row) = rows.next()? {
                match row_to_policy(row) {
                    Ok(policy) => results.push(policy),
                    Err(e) => {
                        let policy_id: String = row.get(0).unwrap_or_default();
                        warn!(policy_id = %policy_id, error = %e, "skipping corrupt policy row");
                    }
                }
            }
            Ok(results)
        })
    }

    #[instrument(skip(self), fields(policy_id = %id))]
    pub fn get(&self, id: &PolicyId) -> Result<PolicyRow, StoreError> {
        self.query(
            "SELECT id, name, description, active, condition, action, prompt_template
             FROM policies WHERE id = ?1",
            [id.as_str()],
        )?
        .into_iter()
        .next()
        .ok_or_else(|| StoreError::NotFound(format!("policy {id}")))
    }

    fn query<P: rusqlite::Params>(&self, sql: &str, params: P) -> Result<Vec<PolicyRow>, StoreError> {
        self.db.with_conn(|conn| {
            let mut stmt = conn.prepare(sql)?;
            let mut rows = stmt.query(params)?;
            let mut results = Vec::new();
            while let Some(row) = rows.next()? {
                results.push(row_to_policy(row)?);
            }
            Ok(results)
        })
    }
}

fn row_to_policy(row: &rusqlite::Row<'_>) -> Result<PolicyRow, StoreError> {
    let action_str: String = row_helpers::get(row, 5, "policies", "action")?;
    Ok(PolicyRow {
        id: PolicyId::from_raw(row_helpers::get::<String>(row, 0, "policies", "id")?),
        name: row_helpers::get(row, 1, "policies", "name")?,
        description: row_helpers::get(row, 2, "policies", "description")?,
        active: row_helpers::get(row, 3, "policies", "active")?,
        condition: row_helpers::get(row, 4, "policies", "condition")?,
        action: row_helpers::parse_enum(&action_str, "policies", "action")?,
        prompt_template: row_helpers::get_opt(row, 6, "policies", "prompt_template")?,
    })
}
