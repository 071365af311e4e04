//! Shared fake relational store for integration tests.
#![allow(dead_code)]

use async_trait::async_trait;
use depot::pool::{Pool, PoolOptions};
use depot::store::{Connector, StoreConn, StoreError};
use std::sync::{Arc, Mutex};
use std::time::Duration;

#[derive(Default)]
pub struct Shared {
    pub next_id: usize,
    /// Statements visible after a commit, with their bound parameters.
    pub committed: Vec<(String, Vec<String>)>,
    /// Every statement ever executed, committed or not.
    pub statements: Vec<String>,
    /// Fail any execute whose SQL contains this fragment.
    pub fail_matching: Option<String>,
}

#[derive(Clone, Default)]
pub struct FakeConnector {
    pub shared: Arc<Mutex<Shared>>,
}

impl FakeConnector {
    pub fn committed(&self) -> Vec<(String, Vec<String>)> {
        self.shared.lock().unwrap().committed.clone()
    }

    pub fn statements(&self) -> Vec<String> {
        self.shared.lock().unwrap().statements.clone()
    }

    pub fn fail_matching(&self, fragment: &str) {
        self.shared.lock().unwrap().fail_matching = Some(fragment.to_string());
    }
}

pub struct FakeConn {
    in_tx: bool,
    pending: Vec<(String, Vec<String>)>,
    shared: Arc<Mutex<Shared>>,
}

#[async_trait]
impl Connector for FakeConnector {
    type Conn = FakeConn;

    async fn connect(&self) -> Result<FakeConn, StoreError> {
        self.shared.lock().unwrap().next_id += 1;
        Ok(FakeConn {
            in_tx: false,
            pending: Vec::new(),
            shared: Arc::clone(&self.shared),
        })
    }
}

#[async_trait]
impl StoreConn for FakeConn {
    async fn ping(&mut self) -> Result<(), StoreError> {
        Ok(())
    }

    async fn execute(&mut self, sql: &str, params: &[&str]) -> Result<u64, StoreError> {
        let mut shared = self.shared.lock().unwrap();
        shared.statements.push(sql.to_string());
        if let Some(fragment) = shared.fail_matching.clone() {
            if sql.contains(&fragment) {
                return Err(StoreError::Other(format!("forced failure on {fragment:?}")));
            }
        }
        let row = (
            sql.to_string(),
            params.iter().map(|p| p.to_string()).collect(),
        );
        drop(shared);
        if self.in_tx {
            self.pending.push(row);
        } else {
            self.shared.lock().unwrap().committed.push(row);
        }
        Ok(1)
    }

    async fn begin(&mut self) -> Result<(), StoreError> {
        self.in_tx = true;
        Ok(())
    }

    async fn commit(&mut self) -> Result<(), StoreError> {
        let staged = std::mem::take(&mut self.pending);
        self.shared.lock().unwrap().committed.extend(staged);
        self.in_tx = false;
        Ok(())
    }

    async fn rollback(&mut self) -> Result<(), StoreError> {
        self.pending.clear();
        self.in_tx = false;
        Ok(())
    }
}

/// A small pool over the fake connector with test-friendly timeouts.
pub fn fake_pool(connector: FakeConnector) -> Pool<FakeConnector> {
    Pool::new(
        connector,
        PoolOptions {
            size: 2,
            max_overflow: 1,
            acquire_timeout: Duration::from_millis(500),
            recycle_after: Duration::from_secs(600),
            use_lifo: true,
        },
    )
}
