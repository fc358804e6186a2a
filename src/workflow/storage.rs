//! SQLite persistence layer for workflow storage
//!
//! `WorkflowStorage` owns the pool and serves read-side queries. The free
//! `pub(crate)` functions below operate on a borrowed `SqliteConnection` so
//! the command log can chain them inside a single transaction while the
//! workflow's lock is held.

use crate::config::DatabaseConfig;
use crate::error::{Error, Result};
use crate::workflow::types::{StaleEntry, Step, Tab, UpdateSettings, Workflow};
use chrono::{DateTime, Utc};
use serde_json::Value;
use sqlx::sqlite::{SqliteConnectOptions, SqlitePool, SqlitePoolOptions, SqliteRow};
use sqlx::{Row, SqliteConnection};
use std::str::FromStr;

const STEP_COLUMNS: &str = "id, tab_id, module_id_name, step_order, is_deleted, stale_marker, \
     params, notes, stored_data_version, notifications, auto_update_data, update_interval, next_update";

/// SQLite-based workflow storage manager
#[derive(Debug, Clone)]
pub struct WorkflowStorage {
    /// SQLite connection pool for the workflow database
    pool: SqlitePool,
}

/// Values for a freshly created step row
#[derive(Debug, Clone)]
pub(crate) struct NewStep<'a> {
    pub tab_id: i64,
    pub module_id_name: &'a str,
    pub order: i64,
    pub params: &'a Value,
}

impl WorkflowStorage {
    /// Create new storage instance with database connection
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Open a pool for the configured database, creating the file if missing
    pub async fn connect(config: &DatabaseConfig) -> Result<Self> {
        let options = SqliteConnectOptions::from_str(&config.url)?
            .create_if_missing(true)
            .foreign_keys(true);
        let pool = SqlitePoolOptions::new()
            .max_connections(config.max_connections)
            .connect_with(options)
            .await?;

        tracing::info!("Opened workflow database: {}", config.url);
        Ok(Self::new(pool))
    }

    /// Underlying pool, for callers that open their own transactions
    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    /// Initialize the storage schema
    ///
    /// Safe to call multiple times (uses IF NOT EXISTS). Command ids use
    /// AUTOINCREMENT so a destroyed command's id is never handed out again;
    /// stale markers may still mention it.
    pub async fn init_schema(&self) -> Result<()> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS workflows (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                name TEXT NOT NULL,
                current_command_id INTEGER,
                selected_tab_position INTEGER,
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS tabs (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                workflow_id INTEGER NOT NULL REFERENCES workflows(id),
                name TEXT NOT NULL,
                position INTEGER NOT NULL,
                selected_step_position INTEGER,
                UNIQUE (workflow_id, position)
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS steps (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                tab_id INTEGER NOT NULL REFERENCES tabs(id),
                module_id_name TEXT NOT NULL,
                step_order INTEGER NOT NULL,
                is_deleted INTEGER NOT NULL DEFAULT 0,
                stale_marker INTEGER,
                params JSON NOT NULL DEFAULT '{}',
                notes TEXT,
                stored_data_version TEXT,
                notifications INTEGER NOT NULL DEFAULT 0,
                auto_update_data INTEGER NOT NULL DEFAULT 0,
                update_interval INTEGER NOT NULL DEFAULT 0,
                next_update TEXT
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS commands (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                workflow_id INTEGER NOT NULL REFERENCES workflows(id),
                prev_id INTEGER REFERENCES commands(id),
                next_id INTEGER REFERENCES commands(id),
                step_id INTEGER REFERENCES steps(id),
                kind TEXT NOT NULL,
                payload JSON NOT NULL,
                pre_image JSON,
                undo_selection JSON,
                created_at TEXT NOT NULL
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query("CREATE INDEX IF NOT EXISTS idx_steps_tab_order ON steps(tab_id, is_deleted, step_order)")
            .execute(&self.pool)
            .await?;

        sqlx::query("CREATE INDEX IF NOT EXISTS idx_commands_prev ON commands(workflow_id, prev_id)")
            .execute(&self.pool)
            .await?;

        Ok(())
    }

    /// Retrieve a workflow by ID
    pub async fn get_workflow(&self, id: i64) -> Result<Option<Workflow>> {
        let mut conn = self.pool.acquire().await?;
        fetch_workflow(&mut conn, id).await
    }

    /// List the ids of every stored workflow
    pub async fn list_workflow_ids(&self) -> Result<Vec<i64>> {
        let rows = sqlx::query("SELECT id FROM workflows ORDER BY id")
            .fetch_all(&self.pool)
            .await?;

        let mut ids = Vec::with_capacity(rows.len());
        for row in rows {
            ids.push(row.try_get("id")?);
        }
        Ok(ids)
    }

    /// Append a tab at the next free position of a workflow
    ///
    /// Tabs are not part of the undo history; the unique (workflow, position)
    /// constraint rejects two concurrent appends racing for one slot.
    pub async fn create_tab(&self, workflow_id: i64, name: &str) -> Result<Tab> {
        let mut tx = self.pool.begin().await?;
        if fetch_workflow(&mut tx, workflow_id).await?.is_none() {
            return Err(Error::WorkflowNotFound(workflow_id));
        }

        let position: i64 = sqlx::query(
            "SELECT COALESCE(MAX(position) + 1, 0) AS next FROM tabs WHERE workflow_id = ?",
        )
        .bind(workflow_id)
        .fetch_one(&mut *tx)
        .await?
        .try_get("next")?;

        let tab_id = insert_tab(&mut tx, workflow_id, name, position).await?;
        let tab = fetch_tab(&mut tx, tab_id)
            .await?
            .ok_or(Error::Database(sqlx::Error::RowNotFound))?;
        tx.commit().await?;

        tracing::info!("Created tab {} at position {} in workflow {}", tab.id, position, workflow_id);
        Ok(tab)
    }

    /// List a workflow's tabs by position
    pub async fn list_tabs(&self, workflow_id: i64) -> Result<Vec<Tab>> {
        let rows = sqlx::query(
            "SELECT id, workflow_id, name, position, selected_step_position FROM tabs \
             WHERE workflow_id = ? ORDER BY position",
        )
        .bind(workflow_id)
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(tab_from_row).collect()
    }

    /// Retrieve a tab by ID
    pub async fn get_tab(&self, tab_id: i64) -> Result<Option<Tab>> {
        let mut conn = self.pool.acquire().await?;
        fetch_tab(&mut conn, tab_id).await
    }

    /// Retrieve a step by ID, deleted or not
    pub async fn get_step(&self, step_id: i64) -> Result<Option<Step>> {
        let mut conn = self.pool.acquire().await?;
        fetch_step(&mut conn, step_id).await
    }

    /// Live (non-deleted) steps of a tab in order
    pub async fn live_steps(&self, tab_id: i64) -> Result<Vec<Step>> {
        let mut conn = self.pool.acquire().await?;
        fetch_live_steps(&mut conn, tab_id).await
    }

    /// Every step of a tab including soft-deleted ones, by id
    pub async fn all_steps(&self, tab_id: i64) -> Result<Vec<Step>> {
        let sql = format!("SELECT {STEP_COLUMNS} FROM steps WHERE tab_id = ? ORDER BY id");
        let rows = sqlx::query(&sql).bind(tab_id).fetch_all(&self.pool).await?;
        rows.iter().map(step_from_row).collect()
    }
}

fn workflow_from_row(row: &SqliteRow) -> Result<Workflow> {
    Ok(Workflow {
        id: row.try_get("id")?,
        name: row.try_get("name")?,
        current_command_id: row.try_get("current_command_id")?,
        selected_tab_position: row.try_get("selected_tab_position")?,
        created_at: row.try_get("created_at")?,
        updated_at: row.try_get("updated_at")?,
    })
}

fn tab_from_row(row: &SqliteRow) -> Result<Tab> {
    Ok(Tab {
        id: row.try_get("id")?,
        workflow_id: row.try_get("workflow_id")?,
        name: row.try_get("name")?,
        position: row.try_get("position")?,
        selected_step_position: row.try_get("selected_step_position")?,
    })
}

fn step_from_row(row: &SqliteRow) -> Result<Step> {
    let params_json: String = row.try_get("params")?;
    Ok(Step {
        id: row.try_get("id")?,
        tab_id: row.try_get("tab_id")?,
        module_id_name: row.try_get("module_id_name")?,
        order: row.try_get("step_order")?,
        is_deleted: row.try_get("is_deleted")?,
        stale_marker: row.try_get("stale_marker")?,
        params: serde_json::from_str(&params_json)?,
        notes: row.try_get("notes")?,
        stored_data_version: row.try_get("stored_data_version")?,
        notifications: row.try_get("notifications")?,
        update_settings: UpdateSettings {
            auto_update_data: row.try_get("auto_update_data")?,
            next_update: row.try_get("next_update")?,
            update_interval: row.try_get("update_interval")?,
        },
    })
}

/// Insert a workflow row with no history yet; returns its id
pub(crate) async fn insert_workflow(conn: &mut SqliteConnection, name: &str, now: DateTime<Utc>) -> Result<i64> {
    let result = sqlx::query(
        "INSERT INTO workflows (name, current_command_id, selected_tab_position, created_at, updated_at) \
         VALUES (?, NULL, 0, ?, ?)",
    )
    .bind(name)
    .bind(now)
    .bind(now)
    .execute(&mut *conn)
    .await?;
    Ok(result.last_insert_rowid())
}

/// Read a workflow row without locking it
pub(crate) async fn fetch_workflow(conn: &mut SqliteConnection, id: i64) -> Result<Option<Workflow>> {
    let row = sqlx::query(
        "SELECT id, name, current_command_id, selected_tab_position, created_at, updated_at \
         FROM workflows WHERE id = ?",
    )
    .bind(id)
    .fetch_optional(&mut *conn)
    .await?;

    row.as_ref().map(workflow_from_row).transpose()
}

/// Take SQLite's write lock on the workflow row and return the fresh row.
///
/// This is the first statement of every locked transaction, so concurrent
/// writers from other processes queue behind us instead of interleaving.
pub(crate) async fn lock_workflow_row(conn: &mut SqliteConnection, id: i64) -> Result<Workflow> {
    let touched = sqlx::query("UPDATE workflows SET updated_at = ? WHERE id = ?")
        .bind(Utc::now())
        .bind(id)
        .execute(&mut *conn)
        .await?;
    if touched.rows_affected() == 0 {
        return Err(Error::WorkflowNotFound(id));
    }

    fetch_workflow(conn, id).await?.ok_or(Error::WorkflowNotFound(id))
}

/// Move the workflow's history pointer
pub(crate) async fn set_current_command(
    conn: &mut SqliteConnection,
    workflow_id: i64,
    command_id: Option<i64>,
) -> Result<()> {
    sqlx::query("UPDATE workflows SET current_command_id = ? WHERE id = ?")
        .bind(command_id)
        .bind(workflow_id)
        .execute(&mut *conn)
        .await?;
    Ok(())
}

/// Insert an empty tab with no selection; returns its id
pub(crate) async fn insert_tab(conn: &mut SqliteConnection, workflow_id: i64, name: &str, position: i64) -> Result<i64> {
    let result = sqlx::query(
        "INSERT INTO tabs (workflow_id, name, position, selected_step_position) VALUES (?, ?, ?, NULL)",
    )
    .bind(workflow_id)
    .bind(name)
    .bind(position)
    .execute(&mut *conn)
    .await?;
    Ok(result.last_insert_rowid())
}

/// Read a tab by id, in any workflow
pub(crate) async fn fetch_tab(conn: &mut SqliteConnection, tab_id: i64) -> Result<Option<Tab>> {
    let row = sqlx::query(
        "SELECT id, workflow_id, name, position, selected_step_position FROM tabs WHERE id = ?",
    )
    .bind(tab_id)
    .fetch_optional(&mut *conn)
    .await?;

    row.as_ref().map(tab_from_row).transpose()
}

/// Ids of a workflow's tabs by position
pub(crate) async fn tab_ids(conn: &mut SqliteConnection, workflow_id: i64) -> Result<Vec<i64>> {
    let rows = sqlx::query("SELECT id FROM tabs WHERE workflow_id = ? ORDER BY position")
        .bind(workflow_id)
        .fetch_all(&mut *conn)
        .await?;

    let mut ids = Vec::with_capacity(rows.len());
    for row in rows {
        ids.push(row.try_get("id")?);
    }
    Ok(ids)
}

/// Write a tab's selection as given; callers keep it within the live steps
pub(crate) async fn set_tab_selection(conn: &mut SqliteConnection, tab_id: i64, selected: Option<i64>) -> Result<()> {
    sqlx::query("UPDATE tabs SET selected_step_position = ? WHERE id = ?")
        .bind(selected)
        .bind(tab_id)
        .execute(&mut *conn)
        .await?;
    Ok(())
}

/// Read a step by id, deleted or not
pub(crate) async fn fetch_step(conn: &mut SqliteConnection, step_id: i64) -> Result<Option<Step>> {
    let sql = format!("SELECT {STEP_COLUMNS} FROM steps WHERE id = ?");
    let row = sqlx::query(&sql).bind(step_id).fetch_optional(&mut *conn).await?;
    row.as_ref().map(step_from_row).transpose()
}

/// Load a step only if it belongs to one of the workflow's tabs
pub(crate) async fn fetch_step_in_workflow(
    conn: &mut SqliteConnection,
    workflow_id: i64,
    step_id: i64,
) -> Result<Option<Step>> {
    let sql = format!(
        "SELECT {STEP_COLUMNS} FROM steps \
         WHERE id = ? AND tab_id IN (SELECT id FROM tabs WHERE workflow_id = ?)"
    );
    let row = sqlx::query(&sql)
        .bind(step_id)
        .bind(workflow_id)
        .fetch_optional(&mut *conn)
        .await?;
    row.as_ref().map(step_from_row).transpose()
}

/// Live steps of a tab in order
pub(crate) async fn fetch_live_steps(conn: &mut SqliteConnection, tab_id: i64) -> Result<Vec<Step>> {
    let sql = format!(
        "SELECT {STEP_COLUMNS} FROM steps WHERE tab_id = ? AND is_deleted = 0 ORDER BY step_order"
    );
    let rows = sqlx::query(&sql).bind(tab_id).fetch_all(&mut *conn).await?;
    rows.iter().map(step_from_row).collect()
}

/// `(id, order)` of a tab's live steps, in order
pub(crate) async fn live_step_orders(conn: &mut SqliteConnection, tab_id: i64) -> Result<Vec<(i64, i64)>> {
    let rows = sqlx::query(
        "SELECT id, step_order FROM steps WHERE tab_id = ? AND is_deleted = 0 ORDER BY step_order, id",
    )
    .bind(tab_id)
    .fetch_all(&mut *conn)
    .await?;

    let mut orders = Vec::with_capacity(rows.len());
    for row in rows {
        orders.push((row.try_get("id")?, row.try_get("step_order")?));
    }
    Ok(orders)
}

/// Number of live steps in a tab
pub(crate) async fn count_live_steps(conn: &mut SqliteConnection, tab_id: i64) -> Result<i64> {
    let count = sqlx::query("SELECT COUNT(*) AS n FROM steps WHERE tab_id = ? AND is_deleted = 0")
        .bind(tab_id)
        .fetch_one(&mut *conn)
        .await?
        .try_get("n")?;
    Ok(count)
}

/// Insert a step that starts out soft-deleted; AddStep's forward reveals it
pub(crate) async fn insert_step_row(conn: &mut SqliteConnection, step: NewStep<'_>) -> Result<i64> {
    let params_json = serde_json::to_string(step.params)?;
    let result = sqlx::query(
        "INSERT INTO steps (tab_id, module_id_name, step_order, is_deleted, stale_marker, params) \
         VALUES (?, ?, ?, 1, NULL, ?)",
    )
    .bind(step.tab_id)
    .bind(step.module_id_name)
    .bind(step.order)
    .bind(params_json)
    .execute(&mut *conn)
    .await?;
    Ok(result.last_insert_rowid())
}

/// Flip a step's soft-delete flag. Its order is left alone.
pub(crate) async fn set_step_deleted(conn: &mut SqliteConnection, step_id: i64, deleted: bool) -> Result<()> {
    sqlx::query("UPDATE steps SET is_deleted = ? WHERE id = ?")
        .bind(deleted)
        .bind(step_id)
        .execute(&mut *conn)
        .await?;
    Ok(())
}

/// Add `delta` to the order of every live step at or after `from_order`,
/// leaving `exclude` untouched.
pub(crate) async fn shift_live_orders(
    conn: &mut SqliteConnection,
    tab_id: i64,
    from_order: i64,
    delta: i64,
    exclude: i64,
) -> Result<u64> {
    let result = sqlx::query(
        "UPDATE steps SET step_order = step_order + ? \
         WHERE tab_id = ? AND is_deleted = 0 AND step_order >= ? AND id != ?",
    )
    .bind(delta)
    .bind(tab_id)
    .bind(from_order)
    .bind(exclude)
    .execute(&mut *conn)
    .await?;
    Ok(result.rows_affected())
}

/// Write one step's order
pub(crate) async fn set_step_order(conn: &mut SqliteConnection, step_id: i64, order: i64) -> Result<()> {
    sqlx::query("UPDATE steps SET step_order = ? WHERE id = ?")
        .bind(order)
        .bind(step_id)
        .execute(&mut *conn)
        .await?;
    Ok(())
}

/// Current markers of the tab's live steps at or after `from_order`
pub(crate) async fn live_stale_markers_from(
    conn: &mut SqliteConnection,
    tab_id: i64,
    from_order: i64,
) -> Result<Vec<StaleEntry>> {
    let rows = sqlx::query(
        "SELECT id, stale_marker FROM steps \
         WHERE tab_id = ? AND is_deleted = 0 AND step_order >= ? ORDER BY step_order",
    )
    .bind(tab_id)
    .bind(from_order)
    .fetch_all(&mut *conn)
    .await?;

    let mut entries = Vec::with_capacity(rows.len());
    for row in rows {
        entries.push(StaleEntry {
            step_id: row.try_get("id")?,
            stale_marker: row.try_get("stale_marker")?,
        });
    }
    Ok(entries)
}

/// Stamp every live step at or after `from_order` in one statement
pub(crate) async fn stamp_live_steps_from(
    conn: &mut SqliteConnection,
    tab_id: i64,
    from_order: i64,
    marker: i64,
) -> Result<u64> {
    let result = sqlx::query(
        "UPDATE steps SET stale_marker = ? WHERE tab_id = ? AND is_deleted = 0 AND step_order >= ?",
    )
    .bind(marker)
    .bind(tab_id)
    .bind(from_order)
    .execute(&mut *conn)
    .await?;
    Ok(result.rows_affected())
}

/// Write one step's marker; returns the rows touched (0 if the step is gone)
pub(crate) async fn set_stale_marker(conn: &mut SqliteConnection, step_id: i64, marker: Option<i64>) -> Result<u64> {
    let result = sqlx::query("UPDATE steps SET stale_marker = ? WHERE id = ?")
        .bind(marker)
        .bind(step_id)
        .execute(&mut *conn)
        .await?;
    Ok(result.rows_affected())
}

/// Replace a step's parameters wholesale
pub(crate) async fn set_step_params(conn: &mut SqliteConnection, step_id: i64, params: &Value) -> Result<()> {
    sqlx::query("UPDATE steps SET params = ? WHERE id = ?")
        .bind(serde_json::to_string(params)?)
        .bind(step_id)
        .execute(&mut *conn)
        .await?;
    Ok(())
}

pub(crate) async fn set_step_notes(conn: &mut SqliteConnection, step_id: i64, notes: Option<&str>) -> Result<()> {
    sqlx::query("UPDATE steps SET notes = ? WHERE id = ?")
        .bind(notes)
        .bind(step_id)
        .execute(&mut *conn)
        .await?;
    Ok(())
}

/// Point a step at a stored data version, or at none
pub(crate) async fn set_step_data_version(
    conn: &mut SqliteConnection,
    step_id: i64,
    version: Option<DateTime<Utc>>,
) -> Result<()> {
    sqlx::query("UPDATE steps SET stored_data_version = ? WHERE id = ?")
        .bind(version)
        .bind(step_id)
        .execute(&mut *conn)
        .await?;
    Ok(())
}

/// Write the three auto-update columns together
pub(crate) async fn set_step_update_settings(
    conn: &mut SqliteConnection,
    step_id: i64,
    settings: &UpdateSettings,
) -> Result<()> {
    sqlx::query(
        "UPDATE steps SET auto_update_data = ?, next_update = ?, update_interval = ? WHERE id = ?",
    )
    .bind(settings.auto_update_data)
    .bind(settings.next_update)
    .bind(settings.update_interval)
    .bind(step_id)
    .execute(&mut *conn)
    .await?;
    Ok(())
}

/// Whether any live step of the workflow asks for change notifications
pub(crate) async fn workflow_has_notifying_steps(conn: &mut SqliteConnection, workflow_id: i64) -> Result<bool> {
    let row = sqlx::query(
        "SELECT 1 FROM steps WHERE notifications = 1 AND is_deleted = 0 \
         AND tab_id IN (SELECT id FROM tabs WHERE workflow_id = ?) LIMIT 1",
    )
    .bind(workflow_id)
    .fetch_optional(&mut *conn)
    .await?;
    Ok(row.is_some())
}

/// Toggle a step's change notifications; steers the data version render policy
pub(crate) async fn set_step_notifications(conn: &mut SqliteConnection, step_id: i64, enabled: bool) -> Result<()> {
    sqlx::query("UPDATE steps SET notifications = ? WHERE id = ?")
        .bind(enabled)
        .bind(step_id)
        .execute(&mut *conn)
        .await?;
    Ok(())
}

/// Physically remove a step row
pub(crate) async fn delete_step_row(conn: &mut SqliteConnection, step_id: i64) -> Result<()> {
    sqlx::query("DELETE FROM steps WHERE id = ?")
        .bind(step_id)
        .execute(&mut *conn)
        .await?;
    Ok(())
}


#[cfg(test)]
mod tests {
    use super::test_support::memory_storage;
    use super::*;
    use serde_json::json;

    async fn seeded_tab(storage: &WorkflowStorage) -> (i64, i64) {
        let mut tx = storage.pool().begin().await.unwrap();
        let workflow_id = insert_workflow(&mut tx, "wf", Utc::now()).await.unwrap();
        let tab_id = insert_tab(&mut tx, workflow_id, "Tab 1", 0).await.unwrap();
        tx.commit().await.unwrap();
        (workflow_id, tab_id)
    }

    #[tokio::test]
    async fn init_schema_is_idempotent() {
        let storage = memory_storage().await;
        storage.init_schema().await.unwrap();
        assert!(storage.list_workflow_ids().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn inserted_steps_start_deleted_and_invisible() {
        let storage = memory_storage().await;
        let (_, tab_id) = seeded_tab(&storage).await;
        let params = json!({"csv": "a,b"});

        let mut conn = storage.pool().acquire().await.unwrap();
        let step_id = insert_step_row(
            &mut conn,
            NewStep { tab_id, module_id_name: "pastecsv", order: 0, params: &params },
        )
        .await
        .unwrap();
        drop(conn);

        assert!(storage.live_steps(tab_id).await.unwrap().is_empty());
        let step = storage.get_step(step_id).await.unwrap().unwrap();
        assert!(step.is_deleted);
        assert_eq!(step.params, params);
        assert_eq!(step.stale_marker, None);
    }

    #[tokio::test]
    async fn shift_skips_deleted_and_excluded_steps() {
        let storage = memory_storage().await;
        let (_, tab_id) = seeded_tab(&storage).await;
        let params = json!({});

        let mut conn = storage.pool().acquire().await.unwrap();
        let mut ids = Vec::new();
        for order in 0..3 {
            let id = insert_step_row(
                &mut conn,
                NewStep { tab_id, module_id_name: "m", order, params: &params },
            )
            .await
            .unwrap();
            ids.push(id);
        }
        set_step_deleted(&mut conn, ids[1], false).await.unwrap();
        set_step_deleted(&mut conn, ids[2], false).await.unwrap();

        let shifted = shift_live_orders(&mut conn, tab_id, 1, 1, ids[2]).await.unwrap();
        assert_eq!(shifted, 1);
        assert_eq!(
            live_step_orders(&mut conn, tab_id).await.unwrap(),
            vec![(ids[1], 2), (ids[2], 2)]
        );
        assert_eq!(fetch_step(&mut conn, ids[0]).await.unwrap().unwrap().order, 0);
    }

    #[tokio::test]
    async fn create_tab_appends_positions() {
        let storage = memory_storage().await;
        let (workflow_id, _) = seeded_tab(&storage).await;

        let tab = storage.create_tab(workflow_id, "Tab 2").await.unwrap();
        assert_eq!(tab.position, 1);
        let tabs = storage.list_tabs(workflow_id).await.unwrap();
        assert_eq!(tabs.iter().map(|t| t.position).collect::<Vec<_>>(), vec![0, 1]);

        assert!(matches!(
            storage.create_tab(workflow_id + 100, "nope").await,
            Err(Error::WorkflowNotFound(_))
        ));
    }
}
