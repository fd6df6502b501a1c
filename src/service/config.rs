// Copyright 2025 jonefeewang@gmail.com
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

extern crate config as _;

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use super::{AppError, AppResult};
use crate::node::{CertificateRequest, TlsMode};
use crate::utils::{DispatchOrder, WorkerPoolConfig};

/// Everything a node needs at construction and `run` time.
///
/// Missing keys fall back to `NodeConfig::default()`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NodeConfig {
    pub node_name: String,
    pub bind_address: String,
    pub port: u16,
    pub tls_mode: TlsMode,
    /// PEM files used in `system_ssl` mode.
    pub tls_cert_path: Option<String>,
    pub tls_key_path: Option<String>,
    /// Subject of the certificate generated in `self_signed` mode.
    pub certificate: CertificateRequest,
    pub max_connections: usize,
    pub confirmation_timeout_ms: u64,
    /// 0 means one worker per CPU core.
    pub worker_pool_size: usize,
    pub worker_channel_capacity: usize,
    pub worker_monitor_interval_ms: u64,
    pub dispatch_order: DispatchOrder,
    pub accept_legacy_hash: bool,
    pub send_wait_timeout_ms: u64,
    pub stop_grace_ms: u64,
    pub read_buffer_size: usize,
    pub event_channel_capacity: usize,
}

impl Default for NodeConfig {
    fn default() -> Self {
        NodeConfig {
            node_name: format!("heart-{}", uuid::Uuid::new_v4().simple()),
            bind_address: "0.0.0.0".to_string(),
            port: 7777,
            tls_mode: TlsMode::NoSsl,
            tls_cert_path: None,
            tls_key_path: None,
            certificate: CertificateRequest::default(),
            max_connections: 1024,
            confirmation_timeout_ms: 30_000,
            worker_pool_size: 0,
            worker_channel_capacity: 1024,
            worker_monitor_interval_ms: 5_000,
            dispatch_order: DispatchOrder::Shared,
            accept_legacy_hash: false,
            send_wait_timeout_ms: 5_000,
            stop_grace_ms: 5_000,
            read_buffer_size: 4 * 1024,
            event_channel_capacity: 1024,
        }
    }
}

impl NodeConfig {
    /// Loads the config file at `path`, then applies `HEART_*` environment
    /// overrides (`HEART_PORT=9000`, `HEART_CERTIFICATE__COMMON_NAME=...`).
    pub fn set_up_config<P: AsRef<Path>>(path: P) -> AppResult<NodeConfig> {
        let path_str = path
            .as_ref()
            .to_str()
            .ok_or(AppError::InvalidValue(format!(
                "config file path: {}",
                path.as_ref().to_string_lossy()
            )))?;
        let config = config::Config::builder()
            .add_source(config::File::with_name(path_str))
            .add_source(
                config::Environment::with_prefix("HEART")
                    .prefix_separator("_")
                    .separator("__"),
            )
            .build()?;

        let node_config: NodeConfig = config.try_deserialize()?;
        node_config.validate()?;
        Ok(node_config)
    }

    pub fn validate(&self) -> AppResult<()> {
        if self.max_connections == 0 {
            return Err(AppError::InvalidValue("max_connections must be > 0".into()));
        }
        if self.read_buffer_size == 0 {
            return Err(AppError::InvalidValue("read_buffer_size must be > 0".into()));
        }
        if self.tls_mode == TlsMode::SystemSsl
            && (self.tls_cert_path.is_none() || self.tls_key_path.is_none())
        {
            return Err(AppError::InvalidValue(
                "system_ssl needs tls_cert_path and tls_key_path".into(),
            ));
        }
        Ok(())
    }

    pub fn confirmation_timeout(&self) -> Duration {
        Duration::from_millis(self.confirmation_timeout_ms)
    }

    pub fn send_wait_timeout(&self) -> Duration {
        Duration::from_millis(self.send_wait_timeout_ms)
    }

    pub fn stop_grace(&self) -> Duration {
        Duration::from_millis(self.stop_grace_ms)
    }

    pub fn worker_count(&self) -> usize {
        if self.worker_pool_size == 0 {
            num_cpus::get()
        } else {
            self.worker_pool_size
        }
    }

    pub fn worker_pool_config(&self) -> WorkerPoolConfig {
        WorkerPoolConfig {
            channel_capacity: self.worker_channel_capacity,
            num_workers: self.worker_count(),
            order: self.dispatch_order,
            monitor_interval: Duration::from_millis(self.worker_monitor_interval_ms.max(1)),
        }
    }
}
