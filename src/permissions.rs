//! Role based resource permissions.
//!
//! Rules are `(role, resource, action)` triples loaded in bulk from
//! `role_permissions`. A resource of `*` matches every resource for that
//! role and action. `admin` and `founder` always hold `*` for every action.

use std::{
    collections::{HashMap, HashSet},
    fmt,
    str::FromStr,
    sync::Arc,
};

use serde::{Deserialize, Serialize};
use sqlx::SqlitePool;
use tokio::sync::RwLock;

use crate::{db, structs::PermissionRule};

pub const WILDCARD: &str = "*";

const SUPER_ROLES: [&str; 2] = ["admin", "founder"];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Action {
    View,
    Edit,
    Create,
    Delete,
}

impl Action {
    pub const ALL: [Action; 4] = [Action::View, Action::Edit, Action::Create, Action::Delete];

    pub fn as_str(&self) -> &'static str {
        match self {
            Action::View => "view",
            Action::Edit => "edit",
            Action::Create => "create",
            Action::Delete => "delete",
        }
    }
}

impl fmt::Display for Action {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Action {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Action::ALL
            .into_iter()
            .find(|a| a.as_str() == s)
            .ok_or_else(|| format!("unknown action: {}", s))
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RuleTable {
    rules: HashMap<(String, Action), HashSet<String>>,
}

impl RuleTable {
    /// Builds a table from raw rows. Rows with an unknown action are skipped.
    pub fn from_rules(rows: impl IntoIterator<Item = PermissionRule>) -> Self {
        let mut table = RuleTable::default();
        for row in rows {
            match row.action.parse::<Action>() {
                Ok(action) => table.grant(&row.role, action, &row.resource),
                Err(e) => log::warn!("Skipping permission rule for {}: {}", row.role, e),
            }
        }
        table.grant_super_roles();
        table
    }

    /// Embedded table used when the rule source cannot be read.
    pub fn defaults() -> Self {
        let mut table = RuleTable::default();
        table.grant("manager", Action::View, WILDCARD);
        for resource in ["rota", "staff", "transactions", "knowledge_base"] {
            table.grant("manager", Action::Edit, resource);
            table.grant("manager", Action::Create, resource);
        }
        table.grant("manager", Action::Delete, "rota");
        for resource in ["dashboard", "rota", "knowledge_base"] {
            table.grant("front_of_house", Action::View, resource);
            table.grant("instructor", Action::View, resource);
        }
        table.grant_super_roles();
        table
    }

    /// Reads the active rules, falling back to [`RuleTable::defaults`] on error.
    pub async fn load(pool: &SqlitePool) -> Self {
        match db::active_permission_rules(pool).await {
            Ok(rows) if rows.is_empty() => {
                log::warn!("No active permission rules found, using defaults");
                RuleTable::defaults()
            }
            Ok(rows) => {
                log::info!("Loaded {} permission rules", rows.len());
                RuleTable::from_rules(rows)
            }
            Err(e) => {
                log::error!("Failed to load permission rules, using defaults: {}", e);
                RuleTable::defaults()
            }
        }
    }

    fn grant(&mut self, role: &str, action: Action, resource: &str) {
        self.rules
            .entry((role.to_owned(), action))
            .or_default()
            .insert(resource.to_owned());
    }

    fn grant_super_roles(&mut self) {
        for role in SUPER_ROLES {
            for action in Action::ALL {
                self.grant(role, action, WILDCARD);
            }
        }
    }

    pub fn resolve(&self, role: Option<&str>, resource: &str, action: Action) -> bool {
        let Some(role) = role else {
            return false;
        };
        self.rules
            .get(&(role.to_owned(), action))
            .is_some_and(|resources| resources.contains(resource) || resources.contains(WILDCARD))
    }
}

/// Lazily loaded, shared rule table.
#[derive(Debug, Clone, Default)]
pub struct PermissionCache {
    table: Arc<RwLock<Option<Arc<RuleTable>>>>,
}

impl PermissionCache {
    pub async fn get(&self, pool: &SqlitePool) -> Arc<RuleTable> {
        if let Some(table) = self.table.read().await.as_ref() {
            return table.clone();
        }
        let mut guard = self.table.write().await;
        if let Some(table) = guard.as_ref() {
            return table.clone();
        }
        let table = Arc::new(RuleTable::load(pool).await);
        *guard = Some(table.clone());
        table
    }

    pub async fn reload(&self, pool: &SqlitePool) -> Arc<RuleTable> {
        let table = Arc::new(RuleTable::load(pool).await);
        *self.table.write().await = Some(table.clone());
        table
    }
}
