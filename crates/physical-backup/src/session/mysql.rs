//! MariaDB sessions over `mysql_async`.
//!
//! Each session is a dedicated `Conn`, never a pooled one: table locks and
//! `foreign_key_checks` are per-session state.

use async_trait::async_trait;
use mysql_async::prelude::*;
use mysql_async::{Conn, OptsBuilder, Row as MySqlRow};
use tracing::{debug, info};

use super::{Connector, Row, Session, SessionRole};
use crate::config::{DatabaseTarget, SessionConfig};
use crate::error::{BackupError, Result};

/// Opens MariaDB sessions with the configured timeouts.
pub struct MysqlConnector {
    config: SessionConfig,
}

impl MysqlConnector {
    pub fn new(config: SessionConfig) -> Self {
        Self { config }
    }
}

#[async_trait]
impl Connector for MysqlConnector {
    async fn connect(
        &self,
        target: &DatabaseTarget,
        role: SessionRole,
    ) -> Result<Box<dyn Session>> {
        let opts = OptsBuilder::default()
            .ip_or_hostname(target.host.clone())
            .tcp_port(target.port)
            .user(Some(target.user.clone()))
            .pass(Some(target.password.clone()))
            .db_name(Some(target.database.clone()));

        let conn = tokio::time::timeout(self.config.connect_timeout(), Conn::new(opts))
            .await
            .map_err(|_| {
                BackupError::connection(
                    target.label(),
                    format!(
                        "connect timed out after {}s",
                        self.config.connect_timeout_secs
                    ),
                )
            })?
            .map_err(|e| BackupError::connection(target.label(), e))?;

        let mut session = MysqlSession {
            conn: Some(conn),
            label: target.label(),
        };

        // File copies can run for hours while this session sits idle holding locks
        session
            .execute(&format!(
                "SET SESSION wait_timeout = {}",
                self.config.wait_timeout_secs
            ))
            .await?;

        info!("Connected {:?} session to {}", role, target.label());
        Ok(Box::new(session))
    }
}

/// One MariaDB connection.
pub struct MysqlSession {
    conn: Option<Conn>,
    label: String,
}

impl MysqlSession {
    fn conn(&mut self) -> Result<&mut Conn> {
        self.conn
            .as_mut()
            .ok_or_else(|| BackupError::connection(self.label.clone(), "session already closed"))
    }
}

#[async_trait]
impl Session for MysqlSession {
    async fn execute(&mut self, statement: &str) -> Result<()> {
        debug!("{}: {}", self.label, statement.trim());
        self.conn()?
            .query_drop(statement)
            .await
            .map_err(|e| BackupError::sql(statement, e))
    }

    async fn query(&mut self, statement: &str) -> Result<Vec<Row>> {
        debug!("{}: {}", self.label, statement.trim());
        let rows: Vec<MySqlRow> = self
            .conn()?
            .query(statement)
            .await
            .map_err(|e| BackupError::sql(statement, e))?;
        Ok(rows.iter().map(row_to_strings).collect())
    }

    async fn is_usable(&mut self) -> bool {
        match self.conn.as_mut() {
            Some(conn) => conn.ping().await.is_ok(),
            None => false,
        }
    }

    async fn close(&mut self) -> Result<()> {
        if let Some(conn) = self.conn.take() {
            conn.disconnect()
                .await
                .map_err(|e| BackupError::connection(self.label.clone(), e))?;
        }
        Ok(())
    }
}

fn row_to_strings(row: &MySqlRow) -> Row {
    (0..row.len())
        .map(|i| {
            row.get_opt::<Option<String>, usize>(i)
                .and_then(|value| value.ok())
                .flatten()
        })
        .collect()
}
