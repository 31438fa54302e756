//! Shared test utilities for foreman integration tests.
//!
//! Provides a scratch SQLite store per test (a database file inside a temp
//! directory, migrations applied) plus builders for task records in common
//! shapes.

use std::collections::BTreeMap;

use sqlx::SqlitePool;
use tempfile::TempDir;

use foreman_db::config::DbConfig;
use foreman_db::models::{
    Expert, ExpertStatus, Phase, PhaseStatus, TaskRecord, TaskStatus,
};
use foreman_db::pool;
use foreman_db::store::TaskStore;

/// A store backed by a temp directory. Dropping it removes the files.
pub struct TestStore {
    pub store: TaskStore,
    pub pool: SqlitePool,
    /// Held to keep the temp directory alive for the duration of the test.
    _dir: TempDir,
}

/// Create a scratch store with migrations applied.
pub async fn create_test_store() -> TestStore {
    let dir = TempDir::new().expect("failed to create temp dir");
    let db_path = dir.path().join("foreman-test.db");
    let config = DbConfig::new(format!("sqlite://{}", db_path.display()));

    let pool = pool::create_pool(&config)
        .await
        .expect("failed to open test database");
    pool::run_migrations(&pool, pool::default_migrations_path())
        .await
        .expect("failed to run migrations");

    TestStore {
        store: TaskStore::new(pool.clone()),
        pool,
        _dir: dir,
    }
}

/// Build a pending expert with boilerplate prompt fields.
pub fn expert(role: &str) -> Expert {
    Expert {
        role: role.to_string(),
        expertise: format!("{role} expertise"),
        persona: format!("You are a {role}."),
        task: format!("Do the {role} work."),
        status: ExpertStatus::Pending,
        result: None,
        error: None,
        extra: serde_json::Map::new(),
    }
}

/// Build a pending phase from a list of expert roles.
pub fn phase(id: &str, name: &str, roles: &[&str]) -> Phase {
    Phase {
        id: id.to_string(),
        name: name.to_string(),
        description: format!("{name} phase"),
        status: PhaseStatus::Pending,
        experts: roles.iter().map(|r| expert(r)).collect(),
        results: BTreeMap::new(),
        started_at: None,
        completed_at: None,
        approved: false,
        user_feedback: None,
        extra: serde_json::Map::new(),
    }
}

/// Build a task that already carries an installed plan, in `running` status
/// with phase 0 `running`. Mirrors the state right after planning succeeds.
pub fn planned_task(
    objective: &str,
    phases: Vec<Phase>,
    requires_user_approval: bool,
) -> TaskRecord {
    let mut task = TaskRecord::new(objective, requires_user_approval);
    task.status = TaskStatus::Running;
    task.phases = phases;
    if let Some(first) = task.phases.first_mut() {
        first.status = PhaseStatus::Running;
        first.started_at = Some(chrono::Utc::now());
    }
    task
}
