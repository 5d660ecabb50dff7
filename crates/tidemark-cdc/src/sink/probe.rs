//! Downstream session-variable probe
//!
//! DSN rendering adapts to the downstream's capabilities by probing
//! session variables (`show session variables like '…'`). The probe is a
//! trait so tests can substitute a canned downstream.

use crate::common::Result;
use async_trait::async_trait;

/// Asks the downstream about one session variable.
#[async_trait]
pub trait SessionVariableProbe: Send + Sync {
    /// `show session variables like '<name>'`. `Ok(None)` when the
    /// variable does not exist; connection errors propagate.
    async fn show_session_variable(&self, name: &str) -> Result<Option<String>>;
}

/// Probe `name` and return `expected` when the downstream knows the
/// variable; absence is not an error.
pub async fn check_variable(
    probe: &dyn SessionVariableProbe,
    name: &str,
    expected: &str,
) -> Result<Option<String>> {
    match probe.show_session_variable(name).await? {
        Some(_) => Ok(Some(expected.to_string())),
        None => Ok(None),
    }
}

/// Probe over a live MySQL connection pool.
#[cfg(feature = "mysql")]
pub struct MySqlProbe {
    pool: mysql_async::Pool,
}

#[cfg(feature = "mysql")]
impl MySqlProbe {
    pub fn new(pool: mysql_async::Pool) -> Self {
        Self { pool }
    }
}

#[cfg(feature = "mysql")]
#[async_trait]
impl SessionVariableProbe for MySqlProbe {
    async fn show_session_variable(&self, name: &str) -> Result<Option<String>> {
        use mysql_async::prelude::*;

        let mut conn = self.pool.get_conn().await?;
        let row: Option<(String, String)> = conn
            .query_first(format!("show session variables like '{name}'"))
            .await?;
        Ok(row.map(|(_, value)| value))
    }
}
