//! Task board, goals, and measurable goals.
//!
//! Tasks form two graphs — a parent tree and a dependency DAG — and both are
//! kept acyclic at write time. A task is *blocked* iff any dependency is not
//! `done`. Goal progress derives from its linked tasks.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::sync::Arc;
use uuid::Uuid;

use crate::error::{EngineError, Result};
use crate::store::Store;
use crate::vault::parse_store_time;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Backlog,
    Todo,
    InProgress,
    Review,
    Done,
}

impl std::fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            TaskStatus::Backlog => "backlog",
            TaskStatus::Todo => "todo",
            TaskStatus::InProgress => "in_progress",
            TaskStatus::Review => "review",
            TaskStatus::Done => "done",
        };
        write!(f, "{s}")
    }
}

impl std::str::FromStr for TaskStatus {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "backlog" => Ok(TaskStatus::Backlog),
            "todo" => Ok(TaskStatus::Todo),
            "in_progress" => Ok(TaskStatus::InProgress),
            "review" => Ok(TaskStatus::Review),
            "done" => Ok(TaskStatus::Done),
            other => Err(format!("unknown task status: {other}")),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskPriority {
    Low,
    Medium,
    High,
    Urgent,
}

impl std::fmt::Display for TaskPriority {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            TaskPriority::Low => "low",
            TaskPriority::Medium => "medium",
            TaskPriority::High => "high",
            TaskPriority::Urgent => "urgent",
        };
        write!(f, "{s}")
    }
}

impl std::str::FromStr for TaskPriority {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "low" => Ok(TaskPriority::Low),
            "medium" => Ok(TaskPriority::Medium),
            "high" => Ok(TaskPriority::High),
            "urgent" => Ok(TaskPriority::Urgent),
            other => Err(format!("unknown task priority: {other}")),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Task {
    pub id: Uuid,
    pub team_id: Uuid,
    pub title: String,
    pub description: String,
    pub status: TaskStatus,
    pub priority: TaskPriority,
    pub assigned_agent_id: Option<Uuid>,
    pub parent_task_id: Option<Uuid>,
    pub deadline: Option<DateTime<Utc>>,
    pub dependencies: Vec<Uuid>,
    pub created_at: DateTime<Utc>,
}

/// Fields accepted when creating a task.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct NewTask {
    pub title: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub priority: Option<TaskPriority>,
    #[serde(default)]
    pub assigned_agent_id: Option<Uuid>,
    #[serde(default)]
    pub parent_task_id: Option<Uuid>,
    #[serde(default)]
    pub deadline: Option<DateTime<Utc>>,
}

/// Partial update; absent fields are left untouched.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct TaskPatch {
    pub title: Option<String>,
    pub description: Option<String>,
    pub status: Option<TaskStatus>,
    pub priority: Option<TaskPriority>,
    pub assigned_agent_id: Option<Option<Uuid>>,
    pub parent_task_id: Option<Option<Uuid>>,
    pub deadline: Option<Option<DateTime<Utc>>>,
}

/// Task board operations.
pub struct Tasks {
    store: Arc<Store>,
}

impl Tasks {
    pub fn new(store: Arc<Store>) -> Self {
        Self { store }
    }

    pub fn create(&self, team_id: &Uuid, new: NewTask) -> Result<Task> {
        if new.title.trim().is_empty() {
            return Err(EngineError::invalid("task title must not be empty"));
        }
        if let Some(parent) = &new.parent_task_id {
            // Parent must exist in the same tenant; a fresh task cannot yet
            // participate in a cycle.
            if !self.store.owned_by_team("tasks", parent, team_id)? {
                return Err(EngineError::not_found("parent task"));
            }
        }
        let id = Uuid::new_v4();
        self.store.with_conn(|conn| {
            conn.execute(
                "INSERT INTO tasks (id, team_id, title, description, priority, assigned_agent_id, parent_task_id, deadline)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
                rusqlite::params![
                    id.to_string(),
                    team_id.to_string(),
                    new.title.trim(),
                    new.description,
                    new.priority.unwrap_or(TaskPriority::Medium).to_string(),
                    new.assigned_agent_id.map(|a| a.to_string()),
                    new.parent_task_id.map(|p| p.to_string()),
                    new.deadline.map(|d| d.to_rfc3339()),
                ],
            )?;
            Ok(())
        })?;
        self.get(team_id, &id)
    }

    pub fn get(&self, team_id: &Uuid, id: &Uuid) -> Result<Task> {
        let found = self.store.with_conn(|conn| {
            conn.query_row(
                "SELECT title, description, status, priority, assigned_agent_id,
                        parent_task_id, deadline, created_at
                 FROM tasks WHERE id = ?1 AND team_id = ?2",
                rusqlite::params![id.to_string(), team_id.to_string()],
                |row| {
                    let status: String = row.get(2)?;
                    let priority: String = row.get(3)?;
                    let agent: Option<String> = row.get(4)?;
                    let parent: Option<String> = row.get(5)?;
                    let deadline: Option<String> = row.get(6)?;
                    let created: String = row.get(7)?;
                    Ok(Task {
                        id: *id,
                        team_id: *team_id,
                        title: row.get(0)?,
                        description: row.get(1)?,
                        status: status.parse().unwrap_or(TaskStatus::Backlog),
                        priority: priority.parse().unwrap_or(TaskPriority::Medium),
                        assigned_agent_id: agent.and_then(|a| Uuid::parse_str(&a).ok()),
                        parent_task_id: parent.and_then(|p| Uuid::parse_str(&p).ok()),
                        deadline: deadline
                            .and_then(|d| DateTime::parse_from_rfc3339(&d).ok())
                            .map(|d| d.with_timezone(&Utc)),
                        dependencies: Vec::new(),
                        created_at: parse_store_time(&created),
                    })
                },
            )
            .map(Some)
            .or_else(|e| match e {
                rusqlite::Error::QueryReturnedNoRows => Ok(None),
                other => Err(other),
            })
        })?;
        let mut task = found.ok_or_else(|| EngineError::not_found("task"))?;
        task.dependencies = self.dependencies_of(id)?;
        Ok(task)
    }

    pub fn list(&self, team_id: &Uuid, status: Option<TaskStatus>) -> Result<Vec<Task>> {
        let ids: Vec<String> = self.store.with_conn(|conn| {
            let mut stmt = conn.prepare_cached(
                "SELECT id FROM tasks
                 WHERE team_id = ?1 AND (?2 IS NULL OR status = ?2)
                 ORDER BY created_at, id",
            )?;
            let rows = stmt.query_map(
                rusqlite::params![team_id.to_string(), status.map(|s| s.to_string())],
                |row| row.get(0),
            )?;
            rows.collect()
        })?;
        ids.iter()
            .filter_map(|id| Uuid::parse_str(id).ok())
            .map(|id| self.get(team_id, &id))
            .collect()
    }

    pub fn update(&self, team_id: &Uuid, id: &Uuid, patch: TaskPatch) -> Result<Task> {
        let current = self.get(team_id, id)?;

        if let Some(Some(parent)) = &patch.parent_task_id {
            if !self.store.owned_by_team("tasks", parent, team_id)? {
                return Err(EngineError::not_found("parent task"));
            }
            if self.ancestor_chain_contains(team_id, parent, id)? {
                return Err(EngineError::invalid("parent assignment would form a cycle"));
            }
        }

        let next_title = patch.title.unwrap_or(current.title);
        let next_description = patch.description.unwrap_or(current.description);
        let next_status = patch.status.unwrap_or(current.status);
        let next_priority = patch.priority.unwrap_or(current.priority);
        let next_agent = patch.assigned_agent_id.unwrap_or(current.assigned_agent_id);
        let next_parent = patch.parent_task_id.unwrap_or(current.parent_task_id);
        let next_deadline = patch.deadline.unwrap_or(current.deadline);

        self.store.with_conn(|conn| {
            conn.execute(
                "UPDATE tasks SET title = ?3, description = ?4, status = ?5, priority = ?6,
                        assigned_agent_id = ?7, parent_task_id = ?8, deadline = ?9,
                        updated_at = datetime('now')
                 WHERE id = ?1 AND team_id = ?2",
                rusqlite::params![
                    id.to_string(),
                    team_id.to_string(),
                    next_title,
                    next_description,
                    next_status.to_string(),
                    next_priority.to_string(),
                    next_agent.map(|a| a.to_string()),
                    next_parent.map(|p| p.to_string()),
                    next_deadline.map(|d| d.to_rfc3339()),
                ],
            )?;
            Ok(())
        })?;
        self.get(team_id, id)
    }

    pub fn delete(&self, team_id: &Uuid, id: &Uuid) -> Result<()> {
        let deleted = self.store.with_tx(|tx| {
            let n = tx.execute(
                "DELETE FROM tasks WHERE id = ?1 AND team_id = ?2",
                rusqlite::params![id.to_string(), team_id.to_string()],
            )?;
            tx.execute(
                "DELETE FROM task_dependencies WHERE task_id = ?1 OR depends_on = ?1",
                [id.to_string()],
            )?;
            Ok(n)
        })?;
        if deleted == 0 {
            return Err(EngineError::not_found("task"));
        }
        Ok(())
    }

    /// Add `task -> depends_on`. Rejects unknown tasks, self-dependencies,
    /// and anything that would close a cycle.
    pub fn add_dependency(&self, team_id: &Uuid, task: &Uuid, depends_on: &Uuid) -> Result<()> {
        if task == depends_on {
            return Err(EngineError::invalid("a task cannot depend on itself"));
        }
        for id in [task, depends_on] {
            if !self.store.owned_by_team("tasks", id, team_id)? {
                return Err(EngineError::not_found("task"));
            }
        }
        if self.dependency_reachable(depends_on, task)? {
            return Err(EngineError::invalid("dependency would form a cycle"));
        }
        self.store.with_conn(|conn| {
            conn.execute(
                "INSERT OR IGNORE INTO task_dependencies (task_id, depends_on) VALUES (?1, ?2)",
                rusqlite::params![task.to_string(), depends_on.to_string()],
            )?;
            Ok(())
        })
    }

    pub fn remove_dependency(&self, team_id: &Uuid, task: &Uuid, depends_on: &Uuid) -> Result<()> {
        if !self.store.owned_by_team("tasks", task, team_id)? {
            return Err(EngineError::not_found("task"));
        }
        self.store.with_conn(|conn| {
            conn.execute(
                "DELETE FROM task_dependencies WHERE task_id = ?1 AND depends_on = ?2",
                rusqlite::params![task.to_string(), depends_on.to_string()],
            )?;
            Ok(())
        })
    }

    /// A task is blocked iff any dependency is not `done`.
    pub fn is_blocked(&self, team_id: &Uuid, id: &Uuid) -> Result<bool> {
        if !self.store.owned_by_team("tasks", id, team_id)? {
            return Err(EngineError::not_found("task"));
        }
        self.store.with_conn(|conn| {
            let mut stmt = conn.prepare_cached(
                "SELECT 1 FROM task_dependencies d
                 JOIN tasks t ON t.id = d.depends_on
                 WHERE d.task_id = ?1 AND t.status != 'done'",
            )?;
            stmt.exists([id.to_string()])
        })
    }

    fn dependencies_of(&self, id: &Uuid) -> Result<Vec<Uuid>> {
        self.store.with_conn(|conn| {
            let mut stmt = conn.prepare_cached(
                "SELECT depends_on FROM task_dependencies WHERE task_id = ?1 ORDER BY depends_on",
            )?;
            let rows = stmt.query_map([id.to_string()], |row| {
                let dep: String = row.get(0)?;
                Ok(Uuid::parse_str(&dep).unwrap_or_default())
            })?;
            rows.collect()
        })
    }

    /// Walk the parent chain upward from `start` looking for `needle`.
    fn ancestor_chain_contains(
        &self,
        team_id: &Uuid,
        start: &Uuid,
        needle: &Uuid,
    ) -> Result<bool> {
        let mut seen = HashSet::new();
        let mut cursor = Some(*start);
        while let Some(current) = cursor {
            if current == *needle {
                return Ok(true);
            }
            if !seen.insert(current) {
                // Pre-existing corruption; stop rather than loop.
                return Ok(true);
            }
            cursor = self.store.with_conn(|conn| {
                conn.query_row(
                    "SELECT parent_task_id FROM tasks WHERE id = ?1 AND team_id = ?2",
                    rusqlite::params![current.to_string(), team_id.to_string()],
                    |row| {
                        let parent: Option<String> = row.get(0)?;
                        Ok(parent.and_then(|p| Uuid::parse_str(&p).ok()))
                    },
                )
                .or_else(|e| match e {
                    rusqlite::Error::QueryReturnedNoRows => Ok(None),
                    other => Err(other),
                })
            })?;
        }
        Ok(false)
    }

    /// Depth-first reachability over the dependency graph.
    fn dependency_reachable(&self, from: &Uuid, target: &Uuid) -> Result<bool> {
        let mut seen = HashSet::new();
        let mut stack = vec![*from];
        while let Some(current) = stack.pop() {
            if current == *target {
                return Ok(true);
            }
            if !seen.insert(current) {
                continue;
            }
            stack.extend(self.dependencies_of(&current)?);
        }
        Ok(false)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Goal {
    pub id: Uuid,
    pub team_id: Uuid,
    pub title: String,
    pub status: String,
    pub target_date: Option<DateTime<Utc>>,
    /// Derived: `round(100 * done / linked)`, 0 with no linked tasks.
    pub progress: u8,
    pub created_at: DateTime<Utc>,
}

/// Goal operations.
pub struct Goals {
    store: Arc<Store>,
}

impl Goals {
    pub fn new(store: Arc<Store>) -> Self {
        Self { store }
    }

    pub fn create(
        &self,
        team_id: &Uuid,
        title: &str,
        target_date: Option<DateTime<Utc>>,
    ) -> Result<Goal> {
        if title.trim().is_empty() {
            return Err(EngineError::invalid("goal title must not be empty"));
        }
        let id = Uuid::new_v4();
        self.store.with_conn(|conn| {
            conn.execute(
                "INSERT INTO goals (id, team_id, title, target_date) VALUES (?1, ?2, ?3, ?4)",
                rusqlite::params![
                    id.to_string(),
                    team_id.to_string(),
                    title.trim(),
                    target_date.map(|d| d.to_rfc3339())
                ],
            )?;
            Ok(())
        })?;
        self.get(team_id, &id)
    }

    pub fn get(&self, team_id: &Uuid, id: &Uuid) -> Result<Goal> {
        let found = self.store.with_conn(|conn| {
            conn.query_row(
                "SELECT title, status, target_date, created_at FROM goals
                 WHERE id = ?1 AND team_id = ?2",
                rusqlite::params![id.to_string(), team_id.to_string()],
                |row| {
                    let target: Option<String> = row.get(2)?;
                    let created: String = row.get(3)?;
                    Ok(Goal {
                        id: *id,
                        team_id: *team_id,
                        title: row.get(0)?,
                        status: row.get(1)?,
                        target_date: target
                            .and_then(|d| DateTime::parse_from_rfc3339(&d).ok())
                            .map(|d| d.with_timezone(&Utc)),
                        progress: 0,
                        created_at: parse_store_time(&created),
                    })
                },
            )
            .map(Some)
            .or_else(|e| match e {
                rusqlite::Error::QueryReturnedNoRows => Ok(None),
                other => Err(other),
            })
        })?;
        let mut goal = found.ok_or_else(|| EngineError::not_found("goal"))?;
        goal.progress = self.progress(team_id, id)?;
        Ok(goal)
    }

    pub fn list(&self, team_id: &Uuid) -> Result<Vec<Goal>> {
        let ids: Vec<String> = self.store.with_conn(|conn| {
            let mut stmt = conn.prepare_cached(
                "SELECT id FROM goals WHERE team_id = ?1 ORDER BY created_at, id",
            )?;
            let rows = stmt.query_map([team_id.to_string()], |row| row.get(0))?;
            rows.collect()
        })?;
        ids.iter()
            .filter_map(|id| Uuid::parse_str(id).ok())
            .map(|id| self.get(team_id, &id))
            .collect()
    }

    pub fn link_task(&self, team_id: &Uuid, goal: &Uuid, task: &Uuid) -> Result<()> {
        if !self.store.owned_by_team("goals", goal, team_id)? {
            return Err(EngineError::not_found("goal"));
        }
        if !self.store.owned_by_team("tasks", task, team_id)? {
            return Err(EngineError::not_found("task"));
        }
        self.store.with_conn(|conn| {
            conn.execute(
                "INSERT OR IGNORE INTO goal_tasks (goal_id, task_id) VALUES (?1, ?2)",
                rusqlite::params![goal.to_string(), task.to_string()],
            )?;
            Ok(())
        })
    }

    fn progress(&self, team_id: &Uuid, goal: &Uuid) -> Result<u8> {
        let (linked, done): (i64, i64) = self.store.with_conn(|conn| {
            conn.query_row(
                "SELECT COUNT(*), COALESCE(SUM(t.status = 'done'), 0)
                 FROM goal_tasks g JOIN tasks t ON t.id = g.task_id AND t.team_id = ?2
                 WHERE g.goal_id = ?1",
                rusqlite::params![goal.to_string(), team_id.to_string()],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )
        })?;
        if linked == 0 {
            return Ok(0);
        }
        Ok(((100.0 * done as f64 / linked as f64).round()) as u8)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MeasurableGoalStatus {
    Active,
    Achieved,
    Missed,
    Paused,
}

impl std::fmt::Display for MeasurableGoalStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            MeasurableGoalStatus::Active => "active",
            MeasurableGoalStatus::Achieved => "achieved",
            MeasurableGoalStatus::Missed => "missed",
            MeasurableGoalStatus::Paused => "paused",
        };
        write!(f, "{s}")
    }
}

impl std::str::FromStr for MeasurableGoalStatus {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "active" => Ok(MeasurableGoalStatus::Active),
            "achieved" => Ok(MeasurableGoalStatus::Achieved),
            "missed" => Ok(MeasurableGoalStatus::Missed),
            "paused" => Ok(MeasurableGoalStatus::Paused),
            other => Err(format!("unknown measurable goal status: {other}")),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MeasurableGoal {
    pub id: Uuid,
    pub team_id: Uuid,
    pub metric_name: String,
    pub current_value: f64,
    pub target_value: f64,
    pub unit: String,
    pub deadline: Option<DateTime<Utc>>,
    pub status: MeasurableGoalStatus,
}

/// Measurable goal operations.
pub struct MeasurableGoals {
    store: Arc<Store>,
}

impl MeasurableGoals {
    pub fn new(store: Arc<Store>) -> Self {
        Self { store }
    }

    pub fn create(
        &self,
        team_id: &Uuid,
        metric_name: &str,
        target_value: f64,
        unit: &str,
        deadline: Option<DateTime<Utc>>,
    ) -> Result<MeasurableGoal> {
        let id = Uuid::new_v4();
        self.store.with_conn(|conn| {
            conn.execute(
                "INSERT INTO measurable_goals (id, team_id, metric_name, target_value, unit, deadline)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                rusqlite::params![
                    id.to_string(),
                    team_id.to_string(),
                    metric_name,
                    target_value,
                    unit,
                    deadline.map(|d| d.to_rfc3339())
                ],
            )?;
            Ok(())
        })?;
        self.get(team_id, &id)
    }

    pub fn get(&self, team_id: &Uuid, id: &Uuid) -> Result<MeasurableGoal> {
        let found = self.store.with_conn(|conn| {
            conn.query_row(
                "SELECT metric_name, current_value, target_value, unit, deadline, status
                 FROM measurable_goals WHERE id = ?1 AND team_id = ?2",
                rusqlite::params![id.to_string(), team_id.to_string()],
                |row| {
                    let deadline: Option<String> = row.get(4)?;
                    let status: String = row.get(5)?;
                    Ok(MeasurableGoal {
                        id: *id,
                        team_id: *team_id,
                        metric_name: row.get(0)?,
                        current_value: row.get(1)?,
                        target_value: row.get(2)?,
                        unit: row.get(3)?,
                        deadline: deadline
                            .and_then(|d| DateTime::parse_from_rfc3339(&d).ok())
                            .map(|d| d.with_timezone(&Utc)),
                        status: status.parse().unwrap_or(MeasurableGoalStatus::Active),
                    })
                },
            )
            .map(Some)
            .or_else(|e| match e {
                rusqlite::Error::QueryReturnedNoRows => Ok(None),
                other => Err(other),
            })
        })?;
        found.ok_or_else(|| EngineError::not_found("measurable goal"))
    }

    pub fn list(&self, team_id: &Uuid) -> Result<Vec<MeasurableGoal>> {
        let ids: Vec<String> = self.store.with_conn(|conn| {
            let mut stmt = conn.prepare_cached(
                "SELECT id FROM measurable_goals WHERE team_id = ?1 ORDER BY created_at, id",
            )?;
            let rows = stmt.query_map([team_id.to_string()], |row| row.get(0))?;
            rows.collect()
        })?;
        ids.iter()
            .filter_map(|id| Uuid::parse_str(id).ok())
            .map(|id| self.get(team_id, &id))
            .collect()
    }

    /// Record a new metric value, flipping to `achieved` when the target is
    /// reached while the goal is still active.
    pub fn record_value(&self, team_id: &Uuid, id: &Uuid, value: f64) -> Result<MeasurableGoal> {
        let goal = self.get(team_id, id)?;
        let next_status = if goal.status == MeasurableGoalStatus::Active && value >= goal.target_value
        {
            MeasurableGoalStatus::Achieved
        } else {
            goal.status
        };
        self.store.with_conn(|conn| {
            conn.execute(
                "UPDATE measurable_goals SET current_value = ?3, status = ?4
                 WHERE id = ?1 AND team_id = ?2",
                rusqlite::params![
                    id.to_string(),
                    team_id.to_string(),
                    value,
                    next_status.to_string()
                ],
            )?;
            Ok(())
        })?;
        self.get(team_id, id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn setup() -> (Tasks, Goals, MeasurableGoals, Uuid) {
        let store = Arc::new(Store::open_in_memory().unwrap());
        let team = Uuid::new_v4();
        store
            .with_conn(|conn| {
                conn.execute("INSERT INTO teams (id, name) VALUES (?1, 't')", [
                    team.to_string()
                ])
            })
            .unwrap();
        (
            Tasks::new(Arc::clone(&store)),
            Goals::new(Arc::clone(&store)),
            MeasurableGoals::new(store),
            team,
        )
    }

    fn make_task(tasks: &Tasks, team: &Uuid, title: &str) -> Task {
        tasks
            .create(team, NewTask {
                title: title.into(),
                ..NewTask::default()
            })
            .unwrap()
    }

    #[test]
    fn test_create_and_get_task() {
        let (tasks, _, _, team) = setup();
        let task = make_task(&tasks, &team, "write report");
        assert_eq!(task.status, TaskStatus::Backlog);
        assert_eq!(task.priority, TaskPriority::Medium);
        assert!(task.dependencies.is_empty());
    }

    #[test]
    fn test_cross_tenant_task_is_not_found() {
        let (tasks, _, _, team) = setup();
        let task = make_task(&tasks, &team, "secret");
        let err = tasks.get(&Uuid::new_v4(), &task.id).unwrap_err();
        assert_eq!(err.kind(), crate::error::ErrorKind::NotFound);
    }

    #[test]
    fn test_parent_cycle_rejected() {
        let (tasks, _, _, team) = setup();
        let a = make_task(&tasks, &team, "a");
        let b = make_task(&tasks, &team, "b");
        let c = make_task(&tasks, &team, "c");

        // a <- b <- c is fine.
        tasks
            .update(&team, &b.id, TaskPatch {
                parent_task_id: Some(Some(a.id)),
                ..TaskPatch::default()
            })
            .unwrap();
        tasks
            .update(&team, &c.id, TaskPatch {
                parent_task_id: Some(Some(b.id)),
                ..TaskPatch::default()
            })
            .unwrap();

        // Closing the loop a -> c is rejected.
        let err = tasks
            .update(&team, &a.id, TaskPatch {
                parent_task_id: Some(Some(c.id)),
                ..TaskPatch::default()
            })
            .unwrap_err();
        assert_eq!(err.kind(), crate::error::ErrorKind::InvalidInput);
    }

    #[test]
    fn test_dependency_cycle_rejected() {
        let (tasks, _, _, team) = setup();
        let a = make_task(&tasks, &team, "a");
        let b = make_task(&tasks, &team, "b");
        let c = make_task(&tasks, &team, "c");

        tasks.add_dependency(&team, &b.id, &a.id).unwrap();
        tasks.add_dependency(&team, &c.id, &b.id).unwrap();

        assert!(tasks.add_dependency(&team, &a.id, &c.id).is_err());
        assert!(tasks.add_dependency(&team, &a.id, &a.id).is_err());
    }

    #[test]
    fn test_blocked_iff_dependency_unfinished() {
        let (tasks, _, _, team) = setup();
        let dep = make_task(&tasks, &team, "dep");
        let task = make_task(&tasks, &team, "main");
        tasks.add_dependency(&team, &task.id, &dep.id).unwrap();

        assert!(tasks.is_blocked(&team, &task.id).unwrap());

        tasks
            .update(&team, &dep.id, TaskPatch {
                status: Some(TaskStatus::Done),
                ..TaskPatch::default()
            })
            .unwrap();
        assert!(!tasks.is_blocked(&team, &task.id).unwrap());
    }

    #[test]
    fn test_delete_clears_dependency_edges() {
        let (tasks, _, _, team) = setup();
        let dep = make_task(&tasks, &team, "dep");
        let task = make_task(&tasks, &team, "main");
        tasks.add_dependency(&team, &task.id, &dep.id).unwrap();

        tasks.delete(&team, &dep.id).unwrap();
        let remaining = tasks.get(&team, &task.id).unwrap();
        assert!(remaining.dependencies.is_empty());
    }

    #[test]
    fn test_goal_progress() {
        let (tasks, goals, _, team) = setup();
        let goal = goals.create(&team, "ship v1", None).unwrap();
        assert_eq!(goal.progress, 0, "no linked tasks means zero progress");

        let a = make_task(&tasks, &team, "a");
        let b = make_task(&tasks, &team, "b");
        let c = make_task(&tasks, &team, "c");
        for task in [&a, &b, &c] {
            goals.link_task(&team, &goal.id, &task.id).unwrap();
        }

        tasks
            .update(&team, &a.id, TaskPatch {
                status: Some(TaskStatus::Done),
                ..TaskPatch::default()
            })
            .unwrap();
        // 1 of 3 done -> round(33.3) = 33.
        assert_eq!(goals.get(&team, &goal.id).unwrap().progress, 33);

        tasks
            .update(&team, &b.id, TaskPatch {
                status: Some(TaskStatus::Done),
                ..TaskPatch::default()
            })
            .unwrap();
        // 2 of 3 done -> round(66.7) = 67.
        assert_eq!(goals.get(&team, &goal.id).unwrap().progress, 67);
    }

    #[test]
    fn test_measurable_goal_achievement() {
        let (_, _, metrics, team) = setup();
        let goal = metrics
            .create(&team, "weekly_signups", 100.0, "users", None)
            .unwrap();
        assert_eq!(goal.status, MeasurableGoalStatus::Active);

        let updated = metrics.record_value(&team, &goal.id, 55.0).unwrap();
        assert_eq!(updated.status, MeasurableGoalStatus::Active);
        assert_eq!(updated.current_value, 55.0);

        let achieved = metrics.record_value(&team, &goal.id, 120.0).unwrap();
        assert_eq!(achieved.status, MeasurableGoalStatus::Achieved);
    }

    #[test]
    fn test_task_patch_clears_optional_fields() {
        let (tasks, _, _, team) = setup();
        let parent = make_task(&tasks, &team, "parent");
        let task = tasks
            .create(&team, NewTask {
                title: "child".into(),
                parent_task_id: Some(parent.id),
                ..NewTask::default()
            })
            .unwrap();
        assert_eq!(task.parent_task_id, Some(parent.id));

        let updated = tasks
            .update(&team, &task.id, TaskPatch {
                parent_task_id: Some(None),
                ..TaskPatch::default()
            })
            .unwrap();
        assert_eq!(updated.parent_task_id, None);
    }
}
