//! Database queries for projects, tasks, dependencies, agent profiles and
//! project memory.

use agentry_core::db::unix_timestamp;

use super::db::{Database, DatabaseError};
use super::models::{AgentProfile, NewTask, Project, ProjectMemory, Task, TaskPatch};

/// Fields for inserting an agent profile.
#[derive(Debug, Clone)]
pub struct NewAgentProfile {
    pub id: String,
    pub project_id: String,
    pub name: String,
    pub runner: String,
    pub model: Option<String>,
    pub prompt_template: Option<String>,
    pub config: serde_json::Value,
    pub default_exclude: Vec<String>,
}

impl Database {
    // =========================================================================
    // Project queries
    // =========================================================================

    /// Create a new project.
    pub async fn create_project(
        &self,
        id: &str,
        name: &str,
        repo_path: &str,
    ) -> Result<Project, DatabaseError> {
        sqlx::query("INSERT INTO projects (id, name, repo_path, created_at) VALUES (?, ?, ?, ?)")
            .bind(id)
            .bind(name)
            .bind(repo_path)
            .bind(unix_timestamp())
            .execute(self.pool())
            .await?;

        self.get_project(id).await
    }

    /// Get a project by ID.
    pub async fn get_project(&self, id: &str) -> Result<Project, DatabaseError> {
        sqlx::query_as::<_, Project>("SELECT * FROM projects WHERE id = ?")
            .bind(id)
            .fetch_optional(self.pool())
            .await?
            .ok_or_else(|| DatabaseError::NotFound(format!("Project {id}")))
    }

    // =========================================================================
    // Task queries
    // =========================================================================

    /// Create a new task.
    pub async fn create_task(&self, task: NewTask) -> Result<Task, DatabaseError> {
        let now = unix_timestamp();
        let write_scope = serde_json::to_string(&task.write_scope)?;

        sqlx::query(
            r"
            INSERT INTO tasks (id, project_id, parent_id, title, description, write_scope, created_at, updated_at)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?)
            ",
        )
        .bind(&task.id)
        .bind(&task.project_id)
        .bind(&task.parent_id)
        .bind(&task.title)
        .bind(&task.description)
        .bind(write_scope)
        .bind(now)
        .bind(now)
        .execute(self.pool())
        .await?;

        self.get_task(&task.id).await
    }

    /// Get a task by ID.
    pub async fn get_task(&self, id: &str) -> Result<Task, DatabaseError> {
        sqlx::query_as::<_, Task>("SELECT * FROM tasks WHERE id = ?")
            .bind(id)
            .fetch_optional(self.pool())
            .await?
            .ok_or_else(|| DatabaseError::NotFound(format!("Task {id}")))
    }

    /// List a project's tasks in creation order.
    pub async fn list_tasks(&self, project_id: &str) -> Result<Vec<Task>, DatabaseError> {
        let tasks = sqlx::query_as::<_, Task>(
            "SELECT * FROM tasks WHERE project_id = ? ORDER BY created_at ASC, rowid ASC",
        )
        .bind(project_id)
        .fetch_all(self.pool())
        .await?;

        Ok(tasks)
    }

    /// Apply a partial update to a task.
    ///
    /// Existing runs keep their scope snapshot; only future runs see a new
    /// write scope.
    pub async fn update_task(&self, id: &str, patch: TaskPatch) -> Result<Task, DatabaseError> {
        let write_scope = patch
            .write_scope
            .as_ref()
            .map(serde_json::to_string)
            .transpose()?;

        let result = sqlx::query(
            r"
            UPDATE tasks SET
                title = COALESCE(?, title),
                description = COALESCE(?, description),
                write_scope = COALESCE(?, write_scope),
                updated_at = ?
            WHERE id = ?
            ",
        )
        .bind(patch.title)
        .bind(patch.description)
        .bind(write_scope)
        .bind(unix_timestamp())
        .bind(id)
        .execute(self.pool())
        .await?;

        if result.rows_affected() == 0 {
            return Err(DatabaseError::NotFound(format!("Task {id}")));
        }
        self.get_task(id).await
    }

    /// Mark a task cancelled. Returns `false` if it was already cancelled.
    pub async fn cancel_task(&self, id: &str) -> Result<bool, DatabaseError> {
        let now = unix_timestamp();
        let result = sqlx::query(
            "UPDATE tasks SET cancelled_at = ?, updated_at = ? WHERE id = ? AND cancelled_at IS NULL",
        )
        .bind(now)
        .bind(now)
        .bind(id)
        .execute(self.pool())
        .await?;

        Ok(result.rows_affected() > 0)
    }

    /// Record an explicit approval, making the task resolve to "done" for
    /// its dependents. Returns `false` if already approved.
    pub async fn approve_task(&self, id: &str) -> Result<bool, DatabaseError> {
        let now = unix_timestamp();
        let result = sqlx::query(
            "UPDATE tasks SET approved_at = ?, updated_at = ? WHERE id = ? AND approved_at IS NULL",
        )
        .bind(now)
        .bind(now)
        .bind(id)
        .execute(self.pool())
        .await?;

        Ok(result.rows_affected() > 0)
    }

    // =========================================================================
    // Dependency queries
    // =========================================================================

    /// Add a dependency edge `task_id -> depends_on_task_id`.
    pub async fn add_dependency(
        &self,
        task_id: &str,
        depends_on_task_id: &str,
    ) -> Result<(), DatabaseError> {
        sqlx::query(
            "INSERT OR IGNORE INTO task_dependencies (task_id, depends_on_task_id) VALUES (?, ?)",
        )
        .bind(task_id)
        .bind(depends_on_task_id)
        .execute(self.pool())
        .await?;

        Ok(())
    }

    /// Tasks that `task_id` depends on.
    pub async fn list_dependencies(&self, task_id: &str) -> Result<Vec<Task>, DatabaseError> {
        let tasks = sqlx::query_as::<_, Task>(
            r"
            SELECT t.* FROM tasks t
            JOIN task_dependencies d ON d.depends_on_task_id = t.id
            WHERE d.task_id = ?
            ORDER BY t.created_at ASC, t.rowid ASC
            ",
        )
        .bind(task_id)
        .fetch_all(self.pool())
        .await?;

        Ok(tasks)
    }

    // =========================================================================
    // Agent profile queries
    // =========================================================================

    /// Create a new agent profile.
    pub async fn create_agent_profile(
        &self,
        profile: NewAgentProfile,
    ) -> Result<AgentProfile, DatabaseError> {
        let config = serde_json::to_string(&profile.config)?;
        let default_exclude = serde_json::to_string(&profile.default_exclude)?;

        sqlx::query(
            r"
            INSERT INTO agent_profiles (id, project_id, name, runner, model, prompt_template, config, default_exclude, created_at)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)
            ",
        )
        .bind(&profile.id)
        .bind(&profile.project_id)
        .bind(&profile.name)
        .bind(&profile.runner)
        .bind(&profile.model)
        .bind(&profile.prompt_template)
        .bind(config)
        .bind(default_exclude)
        .bind(unix_timestamp())
        .execute(self.pool())
        .await?;

        self.get_agent_profile(&profile.id).await
    }

    /// Get an agent profile by ID.
    pub async fn get_agent_profile(&self, id: &str) -> Result<AgentProfile, DatabaseError> {
        sqlx::query_as::<_, AgentProfile>("SELECT * FROM agent_profiles WHERE id = ?")
            .bind(id)
            .fetch_optional(self.pool())
            .await?
            .ok_or_else(|| DatabaseError::NotFound(format!("Agent profile {id}")))
    }

    // =========================================================================
    // Project memory queries
    // =========================================================================

    /// Add a memory entry to a project.
    pub async fn add_memory(
        &self,
        id: &str,
        project_id: &str,
        memory_type: &str,
        content: &str,
        relevance: f64,
    ) -> Result<ProjectMemory, DatabaseError> {
        sqlx::query(
            r"
            INSERT INTO project_memory (id, project_id, memory_type, content, relevance, created_at)
            VALUES (?, ?, ?, ?, ?, ?)
            ",
        )
        .bind(id)
        .bind(project_id)
        .bind(memory_type)
        .bind(content)
        .bind(relevance)
        .bind(unix_timestamp())
        .execute(self.pool())
        .await?;

        sqlx::query_as::<_, ProjectMemory>("SELECT * FROM project_memory WHERE id = ?")
            .bind(id)
            .fetch_one(self.pool())
            .await
            .map_err(Into::into)
    }

    /// Deactivate a memory entry; inactive entries never reach prompts.
    pub async fn deactivate_memory(&self, id: &str) -> Result<bool, DatabaseError> {
        let result = sqlx::query("UPDATE project_memory SET active = 0 WHERE id = ?")
            .bind(id)
            .execute(self.pool())
            .await?;

        Ok(result.rows_affected() > 0)
    }

    /// The `limit` highest-relevance active memory entries for a project.
    ///
    /// Ties break on insertion order so prompt assembly is reproducible.
    pub async fn top_memory(
        &self,
        project_id: &str,
        limit: u32,
    ) -> Result<Vec<ProjectMemory>, DatabaseError> {
        let entries = sqlx::query_as::<_, ProjectMemory>(
            r"
            SELECT * FROM project_memory
            WHERE project_id = ? AND active = 1
            ORDER BY relevance DESC, created_at ASC, rowid ASC
            LIMIT ?
            ",
        )
        .bind(project_id)
        .bind(limit)
        .fetch_all(self.pool())
        .await?;

        Ok(entries)
    }
}
