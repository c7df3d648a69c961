//! Prepared statements (§9): an opaque handle owning an identifier and a
//! fixed parameter count, executing through the same Hook Pipeline as any
//! other command.

use std::sync::atomic::{AtomicU64, Ordering};

use crate::client::Client;
use crate::error::{DriverError, Result};

static NEXT_STATEMENT_ID: AtomicU64 = AtomicU64::new(1);

/// A command template bound to a fixed parameter count. Parameters are
/// substituted positionally into `{}` placeholders before the resulting
/// command is sent — this core does not parse or validate the query
/// language itself (out of scope), only the placeholder count.
pub struct Statement {
    id: u64,
    template: String,
    param_count: usize,
}

impl Statement {
    pub(crate) fn new(command: &str, param_count: usize) -> Self {
        Self {
            id: NEXT_STATEMENT_ID.fetch_add(1, Ordering::SeqCst),
            template: command.to_string(),
            param_count,
        }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn param_count(&self) -> usize {
        self.param_count
    }

    /// Binds `params` into the template and runs it as a query through
    /// `client`'s Hook Pipeline.
    pub async fn query(&self, client: &Client, params: &[String], timeout_ms: u64) -> Result<serde_json::Value> {
        let command = self.bind(params)?;
        client.query(&command, timeout_ms).await
    }

    /// As [`Statement::query`], but runs as a mutation.
    pub async fn mutate(&self, client: &Client, params: &[String], timeout_ms: u64) -> Result<serde_json::Value> {
        let command = self.bind(params)?;
        client.mutate(&command, timeout_ms).await
    }

    fn bind(&self, params: &[String]) -> Result<String> {
        if params.len() != self.param_count {
            return Err(DriverError::ProtocolViolation(format!(
                "statement expects {} parameters, got {}",
                self.param_count,
                params.len()
            )));
        }
        let mut command = self.template.clone();
        for param in params {
            command = command.replacen("{}", param, 1);
        }
        Ok(command)
    }
}
