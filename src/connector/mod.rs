// 连接器：每台主机一个传输实例
pub mod local;
pub mod ssh;
pub mod util;

use crate::command::StringCommand;
use crate::config::Config;
use crate::error::InfraError;
use crate::types::{CommandOutput, ConnectorArguments, FileSource};
use crate::utils::generate_remote_temp_path;
use util::needs_sudo_password;
use crate::Result;
use serde_json::{Map, Value};
use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;
use tracing::{error, warn};

pub use local::{LocalConnector, LocalConnectorKind};
pub use ssh::{SshConnector, SshConnectorKind};

/// 连接器展开得到的一台主机
#[derive(Debug, Clone, PartialEq)]
pub struct HostEntry {
    pub name: String,
    pub data: Map<String, Value>,
    pub groups: Vec<String>,
}

impl HostEntry {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            data: Map::new(),
            groups: Vec::new(),
        }
    }

    pub fn with_data(mut self, key: impl Into<String>, value: Value) -> Self {
        self.data.insert(key.into(), value);
        self
    }
}

/// 单台主机的传输实例。同一时刻只会被一个 worker 使用
pub trait Connector: Send {
    /// 建立连接，重复调用无副作用
    fn connect(&mut self) -> Result<()>;

    fn disconnect(&mut self) -> Result<()> {
        Ok(())
    }

    /// 执行 shell 命令，返回 (是否成功, 合并输出)
    fn run_shell_command(
        &mut self,
        command: &StringCommand,
        args: &ConnectorArguments,
    ) -> Result<(bool, CommandOutput)>;

    /// 以连接用户身份上传
    fn upload(&mut self, src: &FileSource, dest: &str) -> Result<()>;

    /// 以连接用户身份下载
    fn download(&mut self, src: &str, dest: &Path) -> Result<()>;

    /// 提权传输使用的临时目录
    fn temp_dir(&self) -> &str {
        "/tmp"
    }

    /// 上传文件。需要提权时先传到临时位置，再以提权身份复制到目标
    fn put_file(
        &mut self,
        src: &FileSource,
        dest: &str,
        args: &ConnectorArguments,
    ) -> Result<bool> {
        if !args.escalates() {
            self.upload(src, dest)?;
            return Ok(true);
        }

        let temp = generate_remote_temp_path(self.temp_dir(), Some(dest));
        let outcome = upload_and_copy(self, src, &temp, dest, args);
        remove_temp(self, &temp, &args.unprivileged());
        outcome
    }

    /// 下载文件。需要提权时先以提权身份复制到临时位置，下载后删除
    fn get_file(
        &mut self,
        src: &str,
        dest: &Path,
        args: &ConnectorArguments,
    ) -> Result<bool> {
        if !args.escalates() {
            self.download(src, dest)?;
            return Ok(true);
        }

        let temp = generate_remote_temp_path(self.temp_dir(), Some(src));
        let outcome = copy_and_download(self, src, &temp, dest, args);
        remove_temp(self, &temp, args);
        outcome
    }

    fn check_can_rsync(&self) -> Result<()> {
        Err(InfraError::NotSupported(
            "this connector does not support rsync".to_string(),
        ))
    }

    fn rsync(
        &mut self,
        _src: &str,
        _dest: &str,
        _flags: &[String],
        _args: &ConnectorArguments,
    ) -> Result<(bool, CommandOutput)> {
        Err(InfraError::NotSupported(
            "this connector does not support rsync".to_string(),
        ))
    }
}

/// 提权复制因 sudo 需要密码而失败时交给 Host 重试
pub(crate) fn check_sudo_password(
    args: &ConnectorArguments,
    ok: bool,
    output: &CommandOutput,
) -> Result<()> {
    if args.sudo && args.sudo_password.is_none() && needs_sudo_password(ok, &output.lines) {
        return Err(InfraError::SudoPasswordRequired);
    }
    Ok(())
}

fn upload_and_copy<C: Connector + ?Sized>(
    connector: &mut C,
    src: &FileSource,
    temp: &str,
    dest: &str,
    args: &ConnectorArguments,
) -> Result<bool> {
    connector.upload(src, temp)?;

    // 让提权后的用户能读取临时文件
    if let Some(user) = args.escalation_user() {
        let acl = StringCommand::new()
            .raw("setfacl")
            .raw("-m")
            .quote(format!("u:{}:r", user))
            .quote(temp);
        let (ok, output) = connector.run_shell_command(&acl, &args.unprivileged())?;
        if !ok {
            error!("Error on handover to escalated user: {}", output.stderr());
            return Ok(false);
        }
    }

    let copy = StringCommand::new().raw("cp").quote(temp).quote(dest);
    let (ok, output) = connector.run_shell_command(&copy, args)?;
    check_sudo_password(args, ok, &output)?;
    if !ok {
        error!("File upload error: {}", output.stderr());
    }
    Ok(ok)
}

fn copy_and_download<C: Connector + ?Sized>(
    connector: &mut C,
    src: &str,
    temp: &str,
    dest: &Path,
    args: &ConnectorArguments,
) -> Result<bool> {
    let copy = StringCommand::new()
        .raw("cp")
        .quote(src)
        .quote(temp)
        .raw("&&")
        .raw("chmod")
        .raw("+r")
        .quote(temp);
    let (ok, output) = connector.run_shell_command(&copy, args)?;
    check_sudo_password(args, ok, &output)?;
    if !ok {
        error!("File download copy temp error: {}", output.stderr());
        return Ok(false);
    }

    connector.download(temp, dest)?;
    Ok(true)
}

fn remove_temp<C: Connector + ?Sized>(connector: &mut C, temp: &str, args: &ConnectorArguments) {
    let remove = StringCommand::new().raw("rm").raw("-f").quote(temp);
    match connector.run_shell_command(&remove, args) {
        Ok((true, _)) => {}
        Ok((false, output)) => warn!("Unable to remove temporary file {}: {}", temp, output.stderr()),
        Err(e) => warn!("Unable to remove temporary file {}: {}", temp, e),
    }
}

/// 连接器类型：负责把 `@name/arg` 展开成主机，并为每台主机创建实例
pub trait ConnectorKind: Send + Sync {
    fn name(&self) -> &str;

    /// 不负责执行的连接器（只提供主机列表）展开出的主机交给默认连接器
    fn handles_execution(&self) -> bool {
        true
    }

    fn make_names_data(&self, selector: Option<&str>) -> Result<Vec<HostEntry>>;

    fn build(
        &self,
        host_name: &str,
        data: &Map<String, Value>,
        config: &Config,
    ) -> Result<Box<dyn Connector>>;
}

#[derive(Clone)]
pub struct ConnectorRegistry {
    kinds: HashMap<String, Arc<dyn ConnectorKind>>,
}

impl Default for ConnectorRegistry {
    fn default() -> Self {
        Self::with_defaults()
    }
}

impl ConnectorRegistry {
    pub fn empty() -> Self {
        Self {
            kinds: HashMap::new(),
        }
    }

    /// 注册 ssh 与 local
    pub fn with_defaults() -> Self {
        let mut registry = Self::empty();
        registry.register(Arc::new(SshConnectorKind));
        registry.register(Arc::new(LocalConnectorKind));
        registry
    }

    pub fn register(&mut self, kind: Arc<dyn ConnectorKind>) {
        self.kinds.insert(kind.name().to_string(), kind);
    }

    pub fn get(&self, name: &str) -> Result<Arc<dyn ConnectorKind>> {
        self.kinds
            .get(name)
            .cloned()
            .ok_or_else(|| InfraError::UnknownConnector(name.to_string()))
    }

    pub fn names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.kinds.keys().map(|k| k.as_str()).collect();
        names.sort_unstable();
        names
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_registry_defaults() {
        let registry = ConnectorRegistry::with_defaults();
        assert_eq!(registry.names(), vec!["local", "ssh"]);
        assert!(registry.get("ssh").is_ok());
        match registry.get("docker") {
            Err(InfraError::UnknownConnector(name)) => assert_eq!(name, "docker"),
            _ => panic!("expected UnknownConnector"),
        }
    }
}
