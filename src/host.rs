use crate::command::StringCommand;
use crate::config::Config;
use crate::connector::util::needs_sudo_password;
use crate::connector::Connector;
use crate::error::InfraError;
use crate::types::{
    ArgOverrides, CommandOutput, ConnectorArguments, FileSource, OperationArgs, Secret,
};
use crate::utils::generate_remote_temp_path;
use crate::Result;
use serde_json::{Map, Value};
use std::collections::HashMap;
use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard};
use tracing::{info, warn};

pub type SharedHost = Arc<Mutex<Host>>;

/// 获取主机锁。持锁线程 panic 后仍可继续使用
pub fn lock_host(host: &SharedHost) -> MutexGuard<'_, Host> {
    host.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// 分层的主机数据：deploy 数据 → 主机 → 组（后声明者优先）→ 全局
#[derive(Debug, Clone, Default)]
pub struct HostData {
    // 下标越小优先级越高
    layers: Vec<Arc<Map<String, Value>>>,
    overrides: Vec<Map<String, Value>>,
}

impl HostData {
    pub fn new(layers: Vec<Arc<Map<String, Value>>>) -> Self {
        Self {
            layers,
            overrides: Vec::new(),
        }
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.overrides
            .iter()
            .rev()
            .find_map(|layer| layer.get(key))
            .or_else(|| self.layers.iter().find_map(|layer| layer.get(key)))
    }

    pub fn get_str(&self, key: &str) -> Option<&str> {
        self.get(key).and_then(Value::as_str)
    }

    /// 按优先级合并所有层
    pub fn merged(&self) -> Map<String, Value> {
        let mut merged = Map::new();
        for layer in self.layers.iter().rev() {
            merged.extend(layer.iter().map(|(k, v)| (k.clone(), v.clone())));
        }
        for layer in &self.overrides {
            merged.extend(layer.iter().map(|(k, v)| (k.clone(), v.clone())));
        }
        merged
    }

    /// 进入 deploy 时叠加的数据
    pub fn push_override(&mut self, data: Map<String, Value>) {
        self.overrides.push(data);
    }

    pub fn pop_override(&mut self) {
        self.overrides.pop();
    }
}

/// 连接器私有的运行期数据
#[derive(Debug, Clone, Default)]
pub struct ConnectorData {
    /// 曾经遇到过 sudo 要求密码，后续命令直接使用 askpass
    pub sudo_password_required: bool,
}

/// 目标主机：持有一个连接器实例和本次运行的 fact 缓存
pub struct Host {
    pub name: String,
    pub groups: Vec<String>,
    pub data: HostData,
    pub connector_name: String,
    pub scratch: Map<String, Value>,
    pub(crate) connector: Box<dyn Connector>,
    pub(crate) connector_data: ConnectorData,
    pub(crate) connected: bool,
    pub(crate) config: Arc<Config>,
    pub(crate) facts: HashMap<String, Value>,
    pub(crate) loop_position: Vec<usize>,
    /// 正在编译的操作的已解析参数，fact 指纹使用
    pub(crate) current_op: Option<OperationArgs>,
}

impl std::fmt::Debug for Host {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Host")
            .field("name", &self.name)
            .field("groups", &self.groups)
            .field("connector", &self.connector_name)
            .field("connected", &self.connected)
            .finish()
    }
}

impl Host {
    pub fn new(
        name: impl Into<String>,
        groups: Vec<String>,
        data: HostData,
        connector_name: impl Into<String>,
        connector: Box<dyn Connector>,
        config: Arc<Config>,
    ) -> Self {
        Self {
            name: name.into(),
            groups,
            data,
            connector_name: connector_name.into(),
            scratch: Map::new(),
            connector,
            connector_data: ConnectorData::default(),
            connected: false,
            config,
            facts: HashMap::new(),
            loop_position: Vec::new(),
            current_op: None,
        }
    }

    pub fn config(&self) -> &Arc<Config> {
        &self.config
    }

    pub fn is_connected(&self) -> bool {
        self.connected
    }

    pub fn in_group(&self, group: &str) -> bool {
        self.groups.iter().any(|g| g == group)
    }

    pub fn connect(&mut self) -> Result<()> {
        if self.connected {
            return Ok(());
        }
        self.connector.connect()?;
        self.connected = true;
        Ok(())
    }

    pub fn disconnect(&mut self) -> Result<()> {
        if !self.connected {
            return Ok(());
        }
        self.connected = false;
        self.connector.disconnect()
    }

    /// 主机数据中以 `_` 开头的全局参数
    pub fn data_overrides(&self) -> ArgOverrides {
        ArgOverrides::from_data(&self.data.merged())
    }

    /// 主机在操作之外使用的默认参数
    pub fn default_arguments(&self) -> ConnectorArguments {
        OperationArgs::resolve(&self.data_overrides(), &self.config).connector
    }

    fn sudo_password(&self) -> Option<Secret> {
        self.config.sudo_password.clone().or_else(|| {
            self.data
                .get_str("_sudo_password")
                .map(Secret::new)
        })
    }

    fn with_cached_password(&self, args: &ConnectorArguments) -> ConnectorArguments {
        let mut args = args.clone();
        if args.sudo
            && args.sudo_password.is_none()
            && (args.use_sudo_password || self.connector_data.sudo_password_required)
        {
            args.sudo_password = self.sudo_password();
        }
        args
    }

    /// sudo 第一次要求密码：记下来，返回带密码的重试参数
    fn password_retry(&mut self, args: &ConnectorArguments) -> Option<ConnectorArguments> {
        let Some(password) = self.sudo_password() else {
            warn!(
                "[{}] sudo requires a password but none is configured",
                self.name
            );
            return None;
        };
        info!("[{}] sudo requires a password, retrying with askpass", self.name);
        self.connector_data.sudo_password_required = true;
        let mut retry = args.clone();
        retry.sudo_password = Some(password);
        Some(retry)
    }

    /// 执行 shell 命令；sudo 要求密码时用 askpass 重试一次
    pub fn run_shell_command(
        &mut self,
        command: &StringCommand,
        args: &ConnectorArguments,
    ) -> Result<(bool, CommandOutput)> {
        let args = self.with_cached_password(args);
        let (ok, output) = self.connector.run_shell_command(command, &args)?;

        if args.sudo && args.sudo_password.is_none() && needs_sudo_password(ok, &output.lines) {
            if let Some(retry) = self.password_retry(&args) {
                return self.connector.run_shell_command(command, &retry);
            }
        }

        Ok((ok, output))
    }

    pub fn put_file(
        &mut self,
        src: &FileSource,
        dest: &str,
        args: &ConnectorArguments,
    ) -> Result<bool> {
        let args = self.with_cached_password(args);
        match self.connector.put_file(src, dest, &args) {
            Err(InfraError::SudoPasswordRequired) => match self.password_retry(&args) {
                Some(retry) => self.connector.put_file(src, dest, &retry),
                None => Ok(false),
            },
            outcome => outcome,
        }
    }

    pub fn get_file(&mut self, src: &str, dest: &Path, args: &ConnectorArguments) -> Result<bool> {
        let args = self.with_cached_password(args);
        match self.connector.get_file(src, dest, &args) {
            Err(InfraError::SudoPasswordRequired) => match self.password_retry(&args) {
                Some(retry) => self.connector.get_file(src, dest, &retry),
                None => Ok(false),
            },
            outcome => outcome,
        }
    }

    pub fn check_can_rsync(&self) -> Result<()> {
        self.connector.check_can_rsync()
    }

    pub fn rsync(
        &mut self,
        src: &str,
        dest: &str,
        flags: &[String],
        args: &ConnectorArguments,
    ) -> Result<(bool, CommandOutput)> {
        self.connector.rsync(src, dest, flags, args)
    }

    /// 远程临时文件路径；给定 key 时路径固定
    pub fn get_temp_filename(&self, hash_key: Option<&str>) -> String {
        generate_remote_temp_path(&self.config.temp_dir, hash_key)
    }

    /// 当前所在循环的位置
    pub fn loop_position(&self) -> &[usize] {
        &self.loop_position
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn layer(value: Value) -> Arc<Map<String, Value>> {
        Arc::new(value.as_object().cloned().unwrap_or_default())
    }

    #[test]
    fn test_host_data_precedence() {
        let data = HostData::new(vec![
            layer(json!({"role": "host"})),
            layer(json!({"role": "group-late", "region": "eu"})),
            layer(json!({"role": "group-early", "tier": "web"})),
            layer(json!({"tier": "global", "env": "prod"})),
        ]);

        assert_eq!(data.get_str("role"), Some("host"));
        assert_eq!(data.get_str("region"), Some("eu"));
        assert_eq!(data.get_str("tier"), Some("web"));
        assert_eq!(data.get_str("env"), Some("prod"));
        assert!(data.get("missing").is_none());

        let merged = data.merged();
        assert_eq!(merged["role"], "host");
        assert_eq!(merged["tier"], "web");
    }

    #[test]
    fn test_host_data_overrides() {
        let mut data = HostData::new(vec![layer(json!({"port": 80}))]);
        let mut deploy = Map::new();
        deploy.insert("port".to_string(), json!(8080));
        data.push_override(deploy);
        assert_eq!(data.get("port"), Some(&json!(8080)));
        assert_eq!(data.merged()["port"], 8080);
        data.pop_override();
        assert_eq!(data.get("port"), Some(&json!(80)));
    }
}
