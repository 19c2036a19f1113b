use crate::error::InfraError;
use crate::types::Secret;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::Path;

/// 操作哈希的生成方式
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OpOrdering {
    /// 由调用位置（含 deploy 链和循环位置）计算哈希
    #[default]
    CallSite,
    /// 按主机上的编译顺序编号，适合以 API 方式嵌入
    Sequential,
}

/// 一次运行的全局默认值。运行开始后以 `Arc<Config>` 的只读快照共享
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE", default)]
pub struct Config {
    pub parallel: Option<usize>,
    pub fail_percent: Option<u32>,
    pub connect_timeout: u64,
    pub temp_dir: String,
    pub shell: String,
    pub env: BTreeMap<String, String>,
    pub ignore_errors: bool,
    pub default_connector: String,
    pub op_ordering: OpOrdering,

    pub sudo: bool,
    pub sudo_user: Option<String>,
    pub use_sudo_login: bool,
    pub use_sudo_password: bool,
    pub preserve_sudo_env: bool,
    #[serde(skip_serializing)]
    pub sudo_password: Option<Secret>,

    pub su_user: Option<String>,
    pub use_su_login: bool,
    pub preserve_su_env: bool,
    pub su_shell: Option<String>,

    pub doas: bool,
    pub doas_user: Option<String>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            parallel: None,
            fail_percent: None,
            connect_timeout: 10,
            temp_dir: "/tmp".to_string(),
            shell: "sh".to_string(),
            env: BTreeMap::new(),
            ignore_errors: false,
            default_connector: "ssh".to_string(),
            op_ordering: OpOrdering::CallSite,
            sudo: false,
            sudo_user: None,
            use_sudo_login: false,
            use_sudo_password: false,
            preserve_sudo_env: false,
            sudo_password: None,
            su_user: None,
            use_su_login: false,
            preserve_su_env: false,
            su_shell: None,
            doas: false,
            doas_user: None,
        }
    }
}

impl Config {
    pub fn new() -> Self {
        Self::default()
    }

    /// 从YAML文件加载配置
    pub fn from_yaml_file<P: AsRef<Path>>(path: P) -> Result<Self, InfraError> {
        let content = std::fs::read_to_string(&path)
            .map_err(|e| InfraError::ConfigError(format!("Failed to read config file: {}", e)))?;

        serde_yaml::from_str(&content)
            .map_err(|e| InfraError::ConfigError(format!("Failed to parse YAML: {}", e)))
    }

    /// 从JSON文件加载配置
    pub fn from_json_file<P: AsRef<Path>>(path: P) -> Result<Self, InfraError> {
        let content = std::fs::read_to_string(&path)
            .map_err(|e| InfraError::ConfigError(format!("Failed to read config file: {}", e)))?;

        serde_json::from_str(&content)
            .map_err(|e| InfraError::ConfigError(format!("Failed to parse JSON: {}", e)))
    }

    /// 保存配置到YAML文件（不包含密码）
    pub fn save_to_yaml<P: AsRef<Path>>(&self, path: P) -> Result<(), InfraError> {
        let yaml_content = serde_yaml::to_string(self)
            .map_err(|e| InfraError::ConfigError(format!("Failed to serialize to YAML: {}", e)))?;

        std::fs::write(path, yaml_content)
            .map_err(|e| InfraError::FileOperationError(format!("Failed to write file: {}", e)))
    }

    pub fn with_parallel(mut self, parallel: usize) -> Self {
        self.parallel = Some(parallel);
        self
    }

    pub fn with_fail_percent(mut self, percent: u32) -> Self {
        self.fail_percent = Some(percent);
        self
    }

    pub fn with_connect_timeout(mut self, seconds: u64) -> Self {
        self.connect_timeout = seconds;
        self
    }

    pub fn with_shell(mut self, shell: impl Into<String>) -> Self {
        self.shell = shell.into();
        self
    }

    pub fn with_env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.insert(key.into(), value.into());
        self
    }

    pub fn with_temp_dir(mut self, dir: impl Into<String>) -> Self {
        self.temp_dir = dir.into();
        self
    }

    pub fn with_ignore_errors(mut self, ignore: bool) -> Self {
        self.ignore_errors = ignore;
        self
    }

    pub fn with_sudo(mut self, sudo: bool) -> Self {
        self.sudo = sudo;
        self
    }

    pub fn with_sudo_user(mut self, user: impl Into<String>) -> Self {
        self.sudo_user = Some(user.into());
        self
    }

    pub fn with_sudo_password(mut self, password: impl Into<String>) -> Self {
        self.sudo_password = Some(Secret::new(password));
        self
    }

    pub fn with_su_user(mut self, user: impl Into<String>) -> Self {
        self.su_user = Some(user.into());
        self
    }

    pub fn with_op_ordering(mut self, ordering: OpOrdering) -> Self {
        self.op_ordering = ordering;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_config_defaults() {
        let config = Config::default();
        assert_eq!(config.connect_timeout, 10);
        assert_eq!(config.shell, "sh");
        assert_eq!(config.temp_dir, "/tmp");
        assert!(config.fail_percent.is_none());
        assert_eq!(config.op_ordering, OpOrdering::CallSite);
    }

    #[test]
    fn test_config_from_yaml_keys() {
        let yaml = "PARALLEL: 5\nFAIL_PERCENT: 20\nSUDO: true\nSUDO_PASSWORD: secret\nENV:\n  LANG: C\n";
        let config: Config = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(config.parallel, Some(5));
        assert_eq!(config.fail_percent, Some(20));
        assert!(config.sudo);
        assert_eq!(config.env["LANG"], "C");
        assert_eq!(config.sudo_password.unwrap().expose(), "secret");
    }

    #[test]
    fn test_password_not_serialized() {
        let config = Config::default().with_sudo_password("hunter2");
        let yaml = serde_yaml::to_string(&config).unwrap();
        assert!(!yaml.contains("hunter2"));
        assert!(!format!("{:?}", config).contains("hunter2"));
    }
}
