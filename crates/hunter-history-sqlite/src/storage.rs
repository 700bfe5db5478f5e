use std::collections::BTreeSet;
use std::net::IpAddr;
use std::path::Path;
use std::sync::{Mutex, MutexGuard};

use anyhow::{anyhow, Context, Result};
use hunter_core::{Candidates, ExecutionHistory, ExecutionRecord, TaskId};
use hunter_history::HistoryStore;
use rusqlite::types::{Type, Value};
use rusqlite::{params, params_from_iter, Connection};
use tracing::debug;

pub struct SqliteHistory {
    conn: Mutex<Connection>,
}

impl SqliteHistory {
    pub fn open(db_path: &Path) -> Result<Self> {
        if let Some(parent) = db_path.parent() {
            std::fs::create_dir_all(parent).ok();
        }
        let conn = Connection::open(db_path)
            .with_context(|| format!("open sqlite db {}", db_path.display()))?;
        let init_sql = include_str!("../migrations/0001_init.sql");
        conn.execute_batch(init_sql).context("migrate history db")?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    fn conn(&self) -> Result<MutexGuard<'_, Connection>> {
        self.conn
            .lock()
            .map_err(|_| anyhow!("history connection mutex poisoned"))
    }

    fn parse_ip(idx: usize, s: String) -> rusqlite::Result<IpAddr> {
        s.parse::<IpAddr>()
            .map_err(|e| rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, Box::new(e)))
    }
}

impl HistoryStore for SqliteHistory {
    fn last_executions(
        &self,
        task_ids: &BTreeSet<TaskId>,
        candidates: Candidates,
    ) -> Result<ExecutionHistory> {
        if task_ids.is_empty() {
            return Ok(ExecutionHistory::new());
        }

        let placeholders = vec!["?"; task_ids.len()].join(", ");
        let sql = format!(
            "SELECT task_id, public_ip, MAX(server_time_of_execution) FROM performed_tasks
             WHERE task_id IN ({placeholders}) AND (public_ip = ? OR public_ip = ?)
             GROUP BY task_id, public_ip"
        );

        // An unsupported address binds as NULL, which equals nothing.
        let ip_value = |ip: Option<IpAddr>| ip.map_or(Value::Null, |ip| Value::Text(ip.to_string()));
        let mut values: Vec<Value> = task_ids
            .iter()
            .map(|id| Value::Integer(id.as_u32() as i64))
            .collect();
        values.push(ip_value(candidates.v4));
        values.push(ip_value(candidates.v6));

        let conn = self.conn()?;
        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt.query_map(params_from_iter(values.iter()), |r| {
            Ok(ExecutionRecord {
                task_id: TaskId(r.get::<_, i64>(0)? as u32),
                public_ip: Self::parse_ip(1, r.get(1)?)?,
                executed_at: r.get(2)?,
            })
        })?;

        let mut history = ExecutionHistory::new();
        for row in rows {
            let row = row.context("read performed_tasks row")?;
            history.insert(row.task_id, row.public_ip, row.executed_at);
        }
        debug!(
            "history query: {} tasks, {} matching (task, address) pairs",
            task_ids.len(),
            history.len()
        );
        Ok(history)
    }

    fn record_execution(&self, record: &ExecutionRecord) -> Result<()> {
        let conn = self.conn()?;
        conn.execute(
            "INSERT INTO performed_tasks(task_id, public_ip, server_time_of_execution) VALUES (?1, ?2, ?3)",
            params![
                record.task_id.as_u32() as i64,
                record.public_ip.to_string(),
                record.executed_at
            ],
        )?;
        Ok(())
    }

    fn executions_of(&self, task_id: TaskId) -> Result<Vec<ExecutionRecord>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(
            "SELECT task_id, public_ip, server_time_of_execution FROM performed_tasks
             WHERE task_id = ?1 ORDER BY server_time_of_execution DESC",
        )?;
        let rows = stmt.query_map(params![task_id.as_u32() as i64], |r| {
            Ok(ExecutionRecord {
                task_id: TaskId(r.get::<_, i64>(0)? as u32),
                public_ip: Self::parse_ip(1, r.get(1)?)?,
                executed_at: r.get(2)?,
            })
        })?;
        let mut out = vec![];
        for row in rows {
            out.push(row?);
        }
        Ok(out)
    }
}
