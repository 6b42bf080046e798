// src/core/leader/lock.rs

//! The distributed-lock seam: a key-value store with CAS transactions and
//! leases. The production implementation speaks the etcd v3 JSON gateway
//! (keys and values travel base64-encoded); the in-memory implementation
//! backs the tests and single-controller deployments.

use crate::config::LockConfig;
use crate::core::errors::ControlError;
use async_trait::async_trait;
use base64::Engine;
use base64::engine::general_purpose::STANDARD as B64;
use parking_lot::Mutex;
use serde_json::json;
use std::collections::HashMap;
use std::time::{Duration, Instant};
use tracing::debug;

/// Operations the leader agent needs from the lock store.
#[async_trait]
pub trait LockStore: Send + Sync {
    /// Grants a lease with the given TTL, returning its id.
    async fn lease_grant(&self, ttl: i64) -> Result<i64, ControlError>;

    /// Refreshes a lease; returns the remaining TTL. A non-positive TTL
    /// means the lease is gone and ownership with it.
    async fn lease_keep_alive(&self, lease: i64) -> Result<i64, ControlError>;

    async fn lease_revoke(&self, lease: i64) -> Result<(), ControlError>;

    /// One-shot acquisition: create the key with the given value and lease
    /// iff it does not exist. Returns whether the txn succeeded.
    async fn acquire_once(&self, key: &str, value: &str, lease: i64)
    -> Result<bool, ControlError>;

    /// CAS on the key's mod revision.
    async fn safe_put(
        &self,
        key: &str,
        value: &str,
        mod_revision: i64,
    ) -> Result<bool, ControlError>;

    /// Current value and mod revision, if the key exists.
    async fn get_with_revision(&self, key: &str)
    -> Result<Option<(String, i64)>, ControlError>;
}

/// etcd v3 over its JSON gateway.
pub struct EtcdLockStore {
    client: reqwest::Client,
    endpoint: String,
}

impl EtcdLockStore {
    pub fn new(config: &LockConfig) -> Result<Self, ControlError> {
        let mut builder = reqwest::Client::builder()
            .use_rustls_tls()
            .timeout(Duration::from_secs(5));
        if config.tls.enabled {
            builder = builder.min_tls_version(reqwest::tls::Version::TLS_1_3);
            if let Some(ca) = &config.tls.ca_path {
                let pem = std::fs::read(ca)?;
                let cert = reqwest::Certificate::from_pem(&pem)
                    .map_err(|e| ControlError::Unauthenticated(format!("CA load: {e}")))?;
                builder = builder.add_root_certificate(cert);
            }
        }
        Ok(Self {
            client: builder.build().map_err(ControlError::from)?,
            endpoint: config.endpoint.trim_end_matches('/').to_string(),
        })
    }

    async fn call(&self, path: &str, body: serde_json::Value) -> Result<serde_json::Value, ControlError> {
        let url = format!("{}{}", self.endpoint, path);
        let resp = self.client.post(&url).json(&body).send().await?;
        if !resp.status().is_success() {
            return Err(ControlError::Unavailable(format!(
                "{url} returned {}",
                resp.status()
            )));
        }
        Ok(resp.json().await?)
    }
}

fn parse_i64(value: &serde_json::Value) -> i64 {
    match value {
        serde_json::Value::String(s) => s.parse().unwrap_or(0),
        serde_json::Value::Number(n) => n.as_i64().unwrap_or(0),
        _ => 0,
    }
}

#[async_trait]
impl LockStore for EtcdLockStore {
    async fn lease_grant(&self, ttl: i64) -> Result<i64, ControlError> {
        let resp = self.call("/v3/lease/grant", json!({ "TTL": ttl.to_string() })).await?;
        let id = parse_i64(&resp["ID"]);
        if id == 0 {
            return Err(ControlError::Unavailable("lease grant returned no id".to_string()));
        }
        Ok(id)
    }

    async fn lease_keep_alive(&self, lease: i64) -> Result<i64, ControlError> {
        let resp = self
            .call("/v3/lease/keepalive", json!({ "ID": lease.to_string() }))
            .await?;
        Ok(parse_i64(&resp["result"]["TTL"]))
    }

    async fn lease_revoke(&self, lease: i64) -> Result<(), ControlError> {
        self.call("/v3/kv/lease/revoke", json!({ "ID": lease.to_string() }))
            .await?;
        Ok(())
    }

    async fn acquire_once(&self, key: &str, value: &str, lease: i64)
    -> Result<bool, ControlError> {
        let body = json!({
            "compare": [{
                "target": "CREATE",
                "key": B64.encode(key),
                "create_revision": "0",
            }],
            "success": [{
                "request_put": {
                    "key": B64.encode(key),
                    "value": B64.encode(value),
                    "lease": lease.to_string(),
                }
            }],
            "failure": [{
                "request_range": { "key": B64.encode(key) }
            }],
        });
        let resp = self.call("/v3/kv/txn", body).await?;
        Ok(resp["succeeded"].as_bool().unwrap_or(false))
    }

    async fn safe_put(
        &self,
        key: &str,
        value: &str,
        mod_revision: i64,
    ) -> Result<bool, ControlError> {
        let body = json!({
            "compare": [{
                "target": "MOD",
                "key": B64.encode(key),
                "mod_revision": mod_revision.to_string(),
            }],
            "success": [{
                "request_put": {
                    "key": B64.encode(key),
                    "value": B64.encode(value),
                }
            }],
        });
        let resp = self.call("/v3/kv/txn", body).await?;
        Ok(resp["succeeded"].as_bool().unwrap_or(false))
    }

    async fn get_with_revision(&self, key: &str)
    -> Result<Option<(String, i64)>, ControlError> {
        let resp = self.call("/v3/kv/range", json!({ "key": B64.encode(key) })).await?;
        let Some(kv) = resp["kvs"].as_array().and_then(|kvs| kvs.first()) else {
            return Ok(None);
        };
        let value = kv["value"]
            .as_str()
            .map(|raw| B64.decode(raw).unwrap_or_default())
            .map(|bytes| String::from_utf8_lossy(&bytes).to_string())
            .unwrap_or_default();
        Ok(Some((value, parse_i64(&kv["mod_revision"]))))
    }
}

#[derive(Debug, Default)]
struct MemoryLockInner {
    kvs: HashMap<String, (String, i64, i64)>,
    leases: HashMap<i64, Instant>,
    next_lease: i64,
    next_revision: i64,
}

impl MemoryLockInner {
    fn purge_expired(&mut self) {
        let now = Instant::now();
        let expired: Vec<i64> = self
            .leases
            .iter()
            .filter(|(_, deadline)| **deadline <= now)
            .map(|(id, _)| *id)
            .collect();
        for lease in expired {
            self.leases.remove(&lease);
            self.kvs.retain(|_, (_, l, _)| *l != lease);
        }
    }
}

/// In-process lock store with real lease expiry, used by tests to exercise
/// the agent without an external etcd.
#[derive(Debug, Default)]
pub struct MemoryLockStore {
    inner: Mutex<MemoryLockInner>,
}

impl MemoryLockStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Drops a lease immediately, simulating a crashed owner.
    pub fn expire_lease(&self, lease: i64) {
        let mut inner = self.inner.lock();
        inner.leases.remove(&lease);
        inner.kvs.retain(|_, (_, l, _)| *l != lease);
    }
}

#[async_trait]
impl LockStore for MemoryLockStore {
    async fn lease_grant(&self, ttl: i64) -> Result<i64, ControlError> {
        let mut inner = self.inner.lock();
        inner.next_lease += 1;
        let id = inner.next_lease;
        inner
            .leases
            .insert(id, Instant::now() + Duration::from_secs(ttl.max(1) as u64));
        debug!(lease = id, ttl, "Memory lease granted");
        Ok(id)
    }

    async fn lease_keep_alive(&self, lease: i64) -> Result<i64, ControlError> {
        let mut inner = self.inner.lock();
        inner.purge_expired();
        match inner.leases.get_mut(&lease) {
            Some(deadline) => {
                *deadline = Instant::now() + Duration::from_secs(5);
                Ok(5)
            }
            None => Ok(0),
        }
    }

    async fn lease_revoke(&self, lease: i64) -> Result<(), ControlError> {
        self.expire_lease(lease);
        Ok(())
    }

    async fn acquire_once(&self, key: &str, value: &str, lease: i64)
    -> Result<bool, ControlError> {
        let mut inner = self.inner.lock();
        inner.purge_expired();
        if inner.kvs.contains_key(key) {
            return Ok(false);
        }
        inner.next_revision += 1;
        let revision = inner.next_revision;
        inner
            .kvs
            .insert(key.to_string(), (value.to_string(), lease, revision));
        Ok(true)
    }

    async fn safe_put(
        &self,
        key: &str,
        value: &str,
        mod_revision: i64,
    ) -> Result<bool, ControlError> {
        let mut inner = self.inner.lock();
        inner.purge_expired();
        inner.next_revision += 1;
        let next = inner.next_revision;
        match inner.kvs.get_mut(key) {
            Some((stored, _, revision)) if *revision == mod_revision => {
                *stored = value.to_string();
                *revision = next;
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn get_with_revision(&self, key: &str)
    -> Result<Option<(String, i64)>, ControlError> {
        let mut inner = self.inner.lock();
        inner.purge_expired();
        Ok(inner
            .kvs
            .get(key)
            .map(|(value, _, revision)| (value.clone(), *revision)))
    }
}
