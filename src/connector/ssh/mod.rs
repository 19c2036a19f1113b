// SSH 连接器：基于 ssh2 的会话、命令执行与 SFTP 传输
mod client;
mod file_transfer;
mod hash;

pub use client::SshConnector;

use crate::config::Config;
use crate::connector::{Connector, ConnectorKind, HostEntry};
use crate::error::InfraError;
use crate::Result;
use serde_json::{Map, Value};
use std::path::PathBuf;

/// 未知主机密钥的处理方式
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HostKeyPolicy {
    /// 必须已存在于 known_hosts
    Strict,
    /// 首次连接时写入 known_hosts
    AcceptNew,
    /// 不检查
    Off,
}

/// 从主机数据中解析出的 SSH 连接参数
#[derive(Debug, Clone)]
pub struct SshSettings {
    pub host_name: String,
    pub hostname: String,
    pub port: u16,
    pub user: String,
    pub key: Option<PathBuf>,
    pub key_password: Option<String>,
    pub password: Option<String>,
    pub known_hosts_file: Option<PathBuf>,
    pub host_key_policy: HostKeyPolicy,
    pub connect_timeout: u64,
    pub connect_retries: u32,
    pub temp_dir: String,
}

fn data_str(data: &Map<String, Value>, key: &str) -> Option<String> {
    match data.get(key) {
        Some(Value::String(value)) => Some(value.clone()),
        Some(Value::Number(value)) => Some(value.to_string()),
        _ => None,
    }
}

impl SshSettings {
    pub fn from_data(host_name: &str, data: &Map<String, Value>, config: &Config) -> Result<Self> {
        let port = match data.get("ssh_port") {
            None | Some(Value::Null) => 22,
            Some(value) => value
                .as_u64()
                .or_else(|| value.as_str().and_then(|s| s.parse().ok()))
                .and_then(|p| u16::try_from(p).ok())
                .ok_or_else(|| {
                    InfraError::InventoryError(format!("Invalid ssh_port for {}: {}", host_name, value))
                })?,
        };

        let host_key_policy = match data_str(data, "ssh_strict_host_key_checking").as_deref() {
            None | Some("accept-new") => HostKeyPolicy::AcceptNew,
            Some("yes") => HostKeyPolicy::Strict,
            Some("no") | Some("off") => HostKeyPolicy::Off,
            Some(other) => {
                return Err(InfraError::InventoryError(format!(
                    "Invalid ssh_strict_host_key_checking for {}: {}",
                    host_name, other
                )));
            }
        };

        let known_hosts_file = data_str(data, "ssh_known_hosts_file")
            .map(PathBuf::from)
            .or_else(|| std::env::var_os("HOME").map(|home| PathBuf::from(home).join(".ssh/known_hosts")));

        let user = data_str(data, "ssh_user")
            .or_else(|| std::env::var("USER").ok())
            .unwrap_or_else(|| "root".to_string());

        Ok(Self {
            host_name: host_name.to_string(),
            hostname: data_str(data, "ssh_hostname").unwrap_or_else(|| host_name.to_string()),
            port,
            user,
            key: data_str(data, "ssh_key").map(PathBuf::from),
            key_password: data_str(data, "ssh_key_password"),
            password: data_str(data, "ssh_password"),
            known_hosts_file,
            host_key_policy,
            connect_timeout: data
                .get("ssh_connect_timeout")
                .and_then(Value::as_u64)
                .unwrap_or(config.connect_timeout),
            connect_retries: data
                .get("ssh_connect_retries")
                .and_then(Value::as_u64)
                .map(|n| n.clamp(1, 10) as u32)
                .unwrap_or(3),
            temp_dir: config.temp_dir.clone(),
        })
    }

    /// known_hosts 中使用的主机名格式
    pub fn known_hosts_name(&self) -> String {
        if self.port == 22 {
            self.hostname.clone()
        } else {
            format!("[{}]:{}", self.hostname, self.port)
        }
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct SshConnectorKind;

impl ConnectorKind for SshConnectorKind {
    fn name(&self) -> &str {
        "ssh"
    }

    fn make_names_data(&self, selector: Option<&str>) -> Result<Vec<HostEntry>> {
        match selector {
            Some(hostname) if !hostname.is_empty() => Ok(vec![
                HostEntry::new(hostname).with_data("ssh_hostname", Value::String(hostname.to_string())),
            ]),
            _ => Err(InfraError::InventoryError(
                "No ssh host provided, use @ssh/<hostname>".to_string(),
            )),
        }
    }

    fn build(
        &self,
        host_name: &str,
        data: &Map<String, Value>,
        config: &Config,
    ) -> Result<Box<dyn Connector>> {
        let settings = SshSettings::from_data(host_name, data, config)?;
        Ok(Box::new(SshConnector::new(settings)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn settings(data: Value) -> Result<SshSettings> {
        let data = data.as_object().cloned().unwrap_or_default();
        SshSettings::from_data("web1", &data, &Config::default())
    }

    #[test]
    fn test_settings_defaults() {
        let settings = settings(json!({})).unwrap();
        assert_eq!(settings.hostname, "web1");
        assert_eq!(settings.port, 22);
        assert_eq!(settings.connect_timeout, 10);
        assert_eq!(settings.connect_retries, 3);
        assert_eq!(settings.host_key_policy, HostKeyPolicy::AcceptNew);
        assert_eq!(settings.known_hosts_name(), "web1");
    }

    #[test]
    fn test_settings_from_data() {
        let settings = settings(json!({
            "ssh_hostname": "10.0.0.5",
            "ssh_port": "2222",
            "ssh_user": "deploy",
            "ssh_key": "/keys/id_ed25519",
            "ssh_strict_host_key_checking": "yes",
        }))
        .unwrap();
        assert_eq!(settings.hostname, "10.0.0.5");
        assert_eq!(settings.port, 2222);
        assert_eq!(settings.user, "deploy");
        assert_eq!(settings.key, Some(PathBuf::from("/keys/id_ed25519")));
        assert_eq!(settings.host_key_policy, HostKeyPolicy::Strict);
        assert_eq!(settings.known_hosts_name(), "[10.0.0.5]:2222");
    }

    #[test]
    fn test_invalid_settings() {
        assert!(settings(json!({"ssh_port": 70000})).is_err());
        assert!(settings(json!({"ssh_strict_host_key_checking": "maybe"})).is_err());
    }

    #[test]
    fn test_make_names_data_requires_selector() {
        let entries = SshConnectorKind.make_names_data(Some("db.internal")).unwrap();
        assert_eq!(entries[0].name, "db.internal");
        assert!(SshConnectorKind.make_names_data(None).is_err());
    }
}
