//! Orchestration of the external schema-migration tool.
//!
//! A run moves through three phases: prepare the database (create-if-absent,
//! optional purge of generated scripts, transactional drop of the tool's
//! bookkeeping table), invoke the tool as a child process under a hard
//! wall-clock bound, and report the captured output, including whatever a
//! timed-out run wrote before the kill. A non-zero
//! exit is an expected, structured outcome; only precondition and
//! bookkeeping failures are errors.

use std::path::PathBuf;
use std::process::Stdio;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::process::Command;
use tracing::{debug, info, instrument, warn};

use crate::config::MigrationConfig;
use crate::model::{split_lines, MigrationRun, MigrationStatus};
use crate::pool::{Pool, PoolError};
use crate::store::{Connector, StoreConn, StoreError};

#[derive(Debug, Error)]
pub enum MigrateError {
    /// The tool's entry script is missing; nothing was invoked.
    #[error("migration entry script not found at {0}")]
    Precondition(PathBuf),
    /// The bookkeeping table could not be dropped; migrations cannot proceed
    /// without a known-clean bookkeeping state.
    #[error("failed to clear migration bookkeeping table: {0}")]
    Bookkeeping(#[source] StoreError),
    #[error("could not acquire a database connection: {0}")]
    Pool(#[from] PoolError),
    #[error("failed to run migration tool: {0}")]
    Tool(#[source] std::io::Error),
}

#[derive(Debug, Clone, Copy)]
pub struct MigrationOptions {
    /// Remove previously generated scripts from the versions directory.
    pub delete_existing_scripts: bool,
    /// Pass `-r`: skip the script-generation step.
    pub skip_generation: bool,
    /// Pass `-u`: skip applying migrations.
    pub skip_apply: bool,
}

impl Default for MigrationOptions {
    fn default() -> Self {
        Self {
            delete_existing_scripts: true,
            skip_generation: false,
            skip_apply: false,
        }
    }
}

pub struct MigrationOrchestrator<C: Connector> {
    pool: Pool<C>,
    admin: C,
    cfg: MigrationConfig,
    /// Target schema, validated as a plain identifier by the config layer.
    database: String,
}

impl<C: Connector> MigrationOrchestrator<C> {
    pub fn new(pool: Pool<C>, admin: C, cfg: MigrationConfig, database: String) -> Self {
        Self {
            pool,
            admin,
            cfg,
            database,
        }
    }

    /// Run the migration tool once. Callers are responsible for serializing
    /// concurrent invocations.
    #[instrument(skip_all)]
    pub async fn run(&self, opts: MigrationOptions) -> Result<MigrationRun, MigrateError> {
        // Fail the cheapest check first, before touching the database or
        // spawning anything.
        if !tokio::fs::try_exists(&self.cfg.script).await.unwrap_or(false) {
            return Err(MigrateError::Precondition(self.cfg.script.clone()));
        }

        self.ensure_database().await;
        if opts.delete_existing_scripts {
            self.purge_version_scripts().await;
        }
        self.drop_bookkeeping_table().await?;

        self.invoke(&opts).await
    }

    /// Idempotent create-if-absent through a server-level connection.
    /// Failures are logged and not fatal: the schema usually already exists.
    async fn ensure_database(&self) {
        let sql = format!("CREATE DATABASE IF NOT EXISTS `{}`", self.database);
        match self.admin.connect().await {
            Ok(mut conn) => {
                if let Err(err) = conn.execute(&sql, &[]).await {
                    warn!(error = %err, database = %self.database, "create-database step failed");
                }
            }
            Err(err) => {
                warn!(error = %err, "could not open admin connection for create-database");
            }
        }
    }

    /// Delete generated migration scripts, one file at a time. A single
    /// failed deletion is logged and skipped, never aborts the batch.
    async fn purge_version_scripts(&self) {
        let mut entries = match tokio::fs::read_dir(&self.cfg.versions_dir).await {
            Ok(entries) => entries,
            Err(err) => {
                debug!(
                    dir = %self.cfg.versions_dir.display(),
                    error = %err,
                    "versions directory not readable; skipping purge"
                );
                return;
            }
        };
        while let Ok(Some(entry)) = entries.next_entry().await {
            let path = entry.path();
            let is_file = entry.file_type().await.map(|t| t.is_file()).unwrap_or(false);
            if !is_file {
                continue;
            }
            match tokio::fs::remove_file(&path).await {
                Ok(()) => info!(path = %path.display(), "deleted migration script"),
                Err(err) => warn!(path = %path.display(), error = %err, "failed to delete migration script"),
            }
        }
    }

    /// Drop the tool's bookkeeping table inside a transaction. Fatal on
    /// failure: migrations must start from known-clean bookkeeping state.
    async fn drop_bookkeeping_table(&self) -> Result<(), MigrateError> {
        let mut conn = self.pool.acquire().await?;
        let result = drop_table(&mut *conn, &self.cfg.bookkeeping_table).await;
        self.pool.release(conn).await;
        result.map_err(MigrateError::Bookkeeping)
    }

    async fn invoke(&self, opts: &MigrationOptions) -> Result<MigrationRun, MigrateError> {
        let flags = flags_for(opts);
        let command = self.cfg.script.display().to_string();
        info!(%command, ?flags, timeout = ?self.cfg.timeout, "invoking migration tool");

        let mut child = Command::new(&self.cfg.script)
            .args(&flags)
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            // If the surrounding future is dropped mid-run the child must not
            // outlive it.
            .kill_on_drop(true)
            .spawn()
            .map_err(MigrateError::Tool)?;

        // Drain both streams off-task so output produced before a kill
        // survives into the report. Only wait() is put under the clock.
        let stdout_task = tokio::spawn(drain(child.stdout.take().expect("stdout piped")));
        let stderr_task = tokio::spawn(drain(child.stderr.take().expect("stderr piped")));

        let exit = match tokio::time::timeout(self.cfg.timeout, child.wait()).await {
            Ok(Ok(status)) => Some(status),
            Ok(Err(err)) => {
                if let Err(kill_err) = child.kill().await {
                    warn!(error = %kill_err, "failed to kill migration tool after wait error");
                }
                return Err(MigrateError::Tool(err));
            }
            Err(_) => {
                warn!(timeout = ?self.cfg.timeout, "migration tool exceeded wall-clock bound; killing");
                if let Err(kill_err) = child.kill().await {
                    warn!(error = %kill_err, "failed to kill timed-out migration tool");
                }
                None
            }
        };

        // The kill closed the pipes, so the readers hit end-of-file and
        // finish with whatever the child managed to write.
        let stdout = stdout_task.await.unwrap_or_default();
        let stderr = stderr_task.await.unwrap_or_default();

        let status = match exit {
            Some(exit) if exit.success() => MigrationStatus::Success,
            Some(_) => MigrationStatus::Failure,
            None => MigrationStatus::Timeout,
        };
        let run = MigrationRun {
            command,
            flags,
            status,
            exit_code: exit.and_then(|e| e.code()),
            stdout: split_lines(&stdout),
            stderr: split_lines(&stderr),
        };
        match status {
            MigrationStatus::Success => info!(exit_code = ?run.exit_code, "migration tool succeeded"),
            MigrationStatus::Failure => warn!(exit_code = ?run.exit_code, "migration tool failed"),
            MigrationStatus::Timeout => {
                warn!(captured_lines = run.stdout.len(), "reporting partial output from killed run")
            }
        }
        Ok(run)
    }
}

/// Read a child stream to end-of-file, keeping whatever arrived even if the
/// child is killed partway through.
async fn drain<R: AsyncRead + Unpin>(mut reader: R) -> Vec<u8> {
    let mut buf = Vec::new();
    if let Err(err) = reader.read_to_end(&mut buf).await {
        warn!(error = %err, "error draining migration tool stream");
    }
    buf
}

async fn drop_table<S: StoreConn>(conn: &mut S, table: &str) -> Result<(), StoreError> {
    conn.begin().await?;
    let sql = format!("DROP TABLE IF EXISTS `{table}`");
    if let Err(err) = conn.execute(&sql, &[]).await {
        if let Err(rb_err) = conn.rollback().await {
            warn!(error = %rb_err, "rollback failed after aborted bookkeeping drop");
        }
        return Err(err);
    }
    conn.commit().await
}

fn flags_for(opts: &MigrationOptions) -> Vec<String> {
    let mut flags = Vec::new();
    if opts.skip_generation {
        flags.push("-r".to_string());
    }
    if opts.skip_apply {
        flags.push("-u".to_string());
    }
    flags
}
