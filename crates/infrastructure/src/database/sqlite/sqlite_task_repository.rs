use std::collections::HashMap;

use async_trait::async_trait;
use chrono::Utc;
use edge_scheduler_core::{
    models::{Task, TaskPhase, TaskSpec, TaskStatus, TaskStatusUpdate, TaskTreeNode},
    traits::TaskRepository,
    SchedulerError, SchedulerResult,
};
use sqlx::{sqlite::SqliteRow, Row, SqlitePool};
use tracing::{debug, instrument};

use crate::database::mapping::MappingHelpers;

const FINISHED_PHASES: &str = "('Succeed', 'Failed', 'PartiallyFailed')";
const UNFINISHED_PHASES: &str = "('Waiting', 'Processing', 'Aborting')";

/// 重启时遗留任务的失败原因
pub const INTERRUPTED_BY_RESTART: &str = "task interrupted by scheduler restart";

pub struct SqliteTaskRepository {
    pool: SqlitePool,
}

impl SqliteTaskRepository {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// 创建任务表及索引
    pub async fn run_migrations(pool: &SqlitePool) -> SchedulerResult<()> {
        debug!("Running SQLite database migrations");

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS tasks (
                id TEXT PRIMARY KEY NOT NULL,
                parent_id TEXT NOT NULL DEFAULT '',
                name TEXT NOT NULL DEFAULT '',
                command TEXT NOT NULL,
                worker_pool TEXT NOT NULL,
                args TEXT NOT NULL DEFAULT '{}',
                wait_timeout INTEGER NOT NULL DEFAULT 0,
                execute_timeout INTEGER NOT NULL DEFAULT 0,
                heartbeat_timeout INTEGER NOT NULL DEFAULT 0,
                graceful_shutdown_timeout INTEGER NOT NULL DEFAULT 0,
                phase TEXT NOT NULL DEFAULT 'Waiting',
                progress INTEGER NOT NULL DEFAULT 0,
                message TEXT NOT NULL DEFAULT '',
                reason TEXT NOT NULL DEFAULT '',
                data TEXT,
                created_at INTEGER NOT NULL,
                started_at INTEGER,
                finished_at INTEGER
            )
            "#,
        )
        .execute(pool)
        .await?;

        let indexes = [
            "CREATE INDEX IF NOT EXISTS idx_tasks_parent_id ON tasks(parent_id)",
            "CREATE INDEX IF NOT EXISTS idx_tasks_phase ON tasks(phase)",
        ];
        for index_sql in indexes {
            sqlx::query(index_sql).execute(pool).await?;
        }

        debug!("Successfully completed SQLite database migrations");
        Ok(())
    }

    fn row_to_task(row: &SqliteRow) -> SchedulerResult<Task> {
        let spec = TaskSpec {
            id: row.try_get("id")?,
            name: row.try_get("name")?,
            parent_id: row.try_get("parent_id")?,
            worker_pool: row.try_get("worker_pool")?,
            command: row.try_get("command")?,
            args: MappingHelpers::parse_args_sqlite(row, "args")?,
            wait_timeout: MappingHelpers::duration_sqlite(row, "wait_timeout")?,
            execute_timeout: MappingHelpers::duration_sqlite(row, "execute_timeout")?,
            heartbeat_timeout: MappingHelpers::duration_sqlite(row, "heartbeat_timeout")?,
            graceful_shutdown_timeout: MappingHelpers::duration_sqlite(
                row,
                "graceful_shutdown_timeout",
            )?,
        };
        let status = TaskStatus {
            phase: row.try_get("phase")?,
            progress: MappingHelpers::progress_sqlite(row, "progress")?,
            message: row.try_get("message")?,
            reason: row.try_get("reason")?,
            data: MappingHelpers::parse_data_sqlite(row, "data")?,
            created_at: MappingHelpers::timestamp_from_db(row.try_get("created_at")?)?,
            started_at: MappingHelpers::optional_timestamp_sqlite(row, "started_at")?,
            finished_at: MappingHelpers::optional_timestamp_sqlite(row, "finished_at")?,
        };
        Ok(Task { spec, status })
    }

    async fn fetch_descendants(&self, id: &str) -> SchedulerResult<Vec<Task>> {
        let rows = sqlx::query(
            r#"
            WITH RECURSIVE tree(id) AS (
                SELECT id FROM tasks WHERE id = ?
                UNION ALL
                SELECT t.id FROM tasks t JOIN tree ON t.parent_id = tree.id
            )
            SELECT tasks.* FROM tasks JOIN tree ON tasks.id = tree.id
            ORDER BY tasks.rowid
            "#,
        )
        .bind(id)
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(Self::row_to_task).collect()
    }
}

fn assemble_tree(root: Task, by_parent: &mut HashMap<String, Vec<Task>>) -> TaskTreeNode {
    let children = by_parent
        .remove(&root.spec.id)
        .unwrap_or_default()
        .into_iter()
        .map(|child| assemble_tree(child, by_parent))
        .collect();
    TaskTreeNode {
        current: root,
        children,
    }
}

#[async_trait]
impl TaskRepository for SqliteTaskRepository {
    #[instrument(skip(self, task), fields(task_id = %task.spec.id))]
    async fn create(&self, task: &Task) -> SchedulerResult<()> {
        let args = serde_json::to_string(&task.spec.args)?;
        let data = task
            .status
            .data
            .as_ref()
            .map(serde_json::to_string)
            .transpose()?;

        let result = sqlx::query(
            r#"
            INSERT INTO tasks (
                id, parent_id, name, command, worker_pool, args,
                wait_timeout, execute_timeout, heartbeat_timeout, graceful_shutdown_timeout,
                phase, progress, message, reason, data, created_at, started_at, finished_at
            )
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&task.spec.id)
        .bind(&task.spec.parent_id)
        .bind(&task.spec.name)
        .bind(&task.spec.command)
        .bind(&task.spec.worker_pool)
        .bind(args)
        .bind(MappingHelpers::duration_to_db(task.spec.wait_timeout))
        .bind(MappingHelpers::duration_to_db(task.spec.execute_timeout))
        .bind(MappingHelpers::duration_to_db(task.spec.heartbeat_timeout))
        .bind(MappingHelpers::duration_to_db(task.spec.graceful_shutdown_timeout))
        .bind(task.status.phase)
        .bind(i64::from(task.status.progress))
        .bind(&task.status.message)
        .bind(&task.status.reason)
        .bind(data)
        .bind(MappingHelpers::timestamp_to_db(task.status.created_at))
        .bind(task.status.started_at.map(MappingHelpers::timestamp_to_db))
        .bind(task.status.finished_at.map(MappingHelpers::timestamp_to_db))
        .execute(&self.pool)
        .await;

        match result {
            Ok(_) => {
                debug!("创建任务成功: ID {}", task.spec.id);
                Ok(())
            }
            Err(sqlx::Error::Database(db_err)) if db_err.is_unique_violation() => {
                Err(SchedulerError::Conflict {
                    id: task.spec.id.clone(),
                })
            }
            Err(e) => Err(e.into()),
        }
    }

    #[instrument(skip(self), fields(task_id = %id))]
    async fn delete(&self, id: &str) -> SchedulerResult<()> {
        let result = sqlx::query("DELETE FROM tasks WHERE id = ?")
            .bind(id)
            .execute(&self.pool)
            .await?;
        debug!("删除任务: ID {}, 影响行数 {}", id, result.rows_affected());
        Ok(())
    }

    #[instrument(skip(self, update), fields(task_id = %id, phase = ?update.phase))]
    async fn update_status(
        &self,
        id: &str,
        update: &TaskStatusUpdate,
    ) -> SchedulerResult<(Task, u64)> {
        let data = update
            .data
            .as_ref()
            .map(serde_json::to_string)
            .transpose()?;

        let mut tx = self.pool.begin().await?;

        let sql = format!(
            r#"
            UPDATE tasks SET
                phase = COALESCE(?, phase),
                progress = COALESCE(?, progress),
                message = COALESCE(?, message),
                reason = COALESCE(?, reason),
                data = COALESCE(?, data),
                started_at = COALESCE(?, started_at),
                finished_at = COALESCE(?, finished_at)
            WHERE id = ? AND phase NOT IN {FINISHED_PHASES}
            RETURNING *
            "#
        );
        let updated = sqlx::query(&sql)
            .bind(update.phase)
            .bind(update.progress.map(i64::from))
            .bind(update.message.as_deref())
            .bind(update.reason.as_deref())
            .bind(data)
            .bind(update.started_at.map(MappingHelpers::timestamp_to_db))
            .bind(update.finished_at.map(MappingHelpers::timestamp_to_db))
            .bind(id)
            .fetch_optional(&mut *tx)
            .await?;

        let outcome = match updated {
            Some(row) => (Self::row_to_task(&row)?, 1),
            None => {
                let row = sqlx::query("SELECT * FROM tasks WHERE id = ?")
                    .bind(id)
                    .fetch_optional(&mut *tx)
                    .await?
                    .ok_or_else(|| SchedulerError::task_not_found(id))?;
                (Self::row_to_task(&row)?, 0)
            }
        };
        tx.commit().await?;

        debug!(
            "更新任务状态: ID {}, 阶段 {}, 影响行数 {}",
            id, outcome.0.status.phase, outcome.1
        );
        Ok(outcome)
    }

    #[instrument(skip(self), fields(task_id = %id))]
    async fn get(&self, id: &str) -> SchedulerResult<Task> {
        let row = sqlx::query("SELECT * FROM tasks WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?
            .ok_or_else(|| SchedulerError::task_not_found(id))?;
        Self::row_to_task(&row)
    }

    #[instrument(skip(self), fields(parent_id = %parent_id))]
    async fn get_sub_tasks(&self, parent_id: &str) -> SchedulerResult<Vec<Task>> {
        if parent_id.is_empty() {
            return Ok(Vec::new());
        }
        let rows = sqlx::query("SELECT * FROM tasks WHERE parent_id = ? ORDER BY rowid")
            .bind(parent_id)
            .fetch_all(&self.pool)
            .await?;
        rows.iter().map(Self::row_to_task).collect()
    }

    #[instrument(skip(self))]
    async fn get_finished_master_tasks(&self) -> SchedulerResult<Vec<Task>> {
        let sql = format!(
            "SELECT * FROM tasks WHERE parent_id = '' AND phase IN {FINISHED_PHASES} \
             ORDER BY finished_at, rowid"
        );
        let rows = sqlx::query(&sql).fetch_all(&self.pool).await?;
        rows.iter().map(Self::row_to_task).collect()
    }

    #[instrument(skip(self), fields(task_id = %id))]
    async fn get_task_tree(&self, id: &str) -> SchedulerResult<TaskTreeNode> {
        let mut tasks = self.fetch_descendants(id).await?;
        let root_index = tasks
            .iter()
            .position(|task| task.spec.id == id)
            .ok_or_else(|| SchedulerError::task_not_found(id))?;
        let root = tasks.remove(root_index);

        let mut by_parent: HashMap<String, Vec<Task>> = HashMap::new();
        for task in tasks {
            by_parent
                .entry(task.spec.parent_id.clone())
                .or_default()
                .push(task);
        }
        Ok(assemble_tree(root, &mut by_parent))
    }

    #[instrument(skip(self))]
    async fn mark_unfinished_as_failed(&self) -> SchedulerResult<u64> {
        let sql = format!(
            "UPDATE tasks SET phase = ?, message = ?, finished_at = COALESCE(finished_at, ?) \
             WHERE phase IN {UNFINISHED_PHASES}"
        );
        let result = sqlx::query(&sql)
            .bind(TaskPhase::Failed)
            .bind(INTERRUPTED_BY_RESTART)
            .bind(MappingHelpers::timestamp_to_db(Utc::now()))
            .execute(&self.pool)
            .await?;
        debug!("标记遗留任务为失败: 影响行数 {}", result.rows_affected());
        Ok(result.rows_affected())
    }

    async fn count_tasks(&self) -> SchedulerResult<u64> {
        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM tasks")
            .fetch_one(&self.pool)
            .await?;
        Ok(u64::try_from(count).unwrap_or(0))
    }
}
