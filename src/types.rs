use crate::config::Config;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::path::PathBuf;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OutputStream {
    Stdout,
    Stderr,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OutputLine {
    pub stream: OutputStream,
    pub line: String,
}

/// 一条命令的合并输出，保持 stdout/stderr 的到达顺序
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CommandOutput {
    pub lines: Vec<OutputLine>,
    pub exit_code: Option<i32>,
}

impl CommandOutput {
    pub fn new(lines: Vec<OutputLine>, exit_code: Option<i32>) -> Self {
        Self { lines, exit_code }
    }

    pub fn stdout_lines(&self) -> Vec<String> {
        self.lines_of(OutputStream::Stdout)
    }

    pub fn stderr_lines(&self) -> Vec<String> {
        self.lines_of(OutputStream::Stderr)
    }

    pub fn stdout(&self) -> String {
        self.stdout_lines().join("\n")
    }

    pub fn stderr(&self) -> String {
        self.stderr_lines().join("\n")
    }

    pub fn last_line(&self) -> Option<&str> {
        self.lines.last().map(|l| l.line.as_str())
    }

    fn lines_of(&self, stream: OutputStream) -> Vec<String> {
        self.lines
            .iter()
            .filter(|l| l.stream == stream)
            .map(|l| l.line.clone())
            .collect()
    }
}

/// 不会出现在日志或 Debug 输出中的字符串
#[derive(Clone, PartialEq, Eq, Default, Deserialize)]
#[serde(transparent)]
pub struct Secret(String);

impl Secret {
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    pub fn expose(&self) -> &str {
        &self.0
    }
}

impl fmt::Debug for Secret {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("***")
    }
}

/// 上传的数据来源：本地文件或内存数据
#[derive(Debug, Clone, PartialEq)]
pub enum FileSource {
    Path(PathBuf),
    Bytes(Vec<u8>),
}

impl FileSource {
    pub fn read_bytes(&self) -> std::io::Result<Vec<u8>> {
        match self {
            FileSource::Path(path) => std::fs::read(path),
            FileSource::Bytes(bytes) => Ok(bytes.clone()),
        }
    }
}

impl fmt::Display for FileSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FileSource::Path(path) => write!(f, "{}", path.display()),
            FileSource::Bytes(bytes) => write!(f, "<{} bytes>", bytes.len()),
        }
    }
}

/// 传给连接器的完整参数（已解析）
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ConnectorArguments {
    pub sudo: bool,
    pub sudo_user: Option<String>,
    pub use_sudo_login: bool,
    pub use_sudo_password: bool,
    #[serde(skip)]
    pub sudo_password: Option<Secret>,
    pub preserve_sudo_env: bool,
    pub su_user: Option<String>,
    pub use_su_login: bool,
    pub preserve_su_env: bool,
    pub su_shell: Option<String>,
    pub doas: bool,
    pub doas_user: Option<String>,
    pub shell_executable: Option<String>,
    pub chdir: Option<String>,
    pub env: BTreeMap<String, String>,
    pub success_exit_codes: Vec<i32>,
    pub timeout: Option<u64>,
    pub get_pty: bool,
    pub stdin: Option<String>,
}

impl Default for ConnectorArguments {
    fn default() -> Self {
        Self {
            sudo: false,
            sudo_user: None,
            use_sudo_login: false,
            use_sudo_password: false,
            sudo_password: None,
            preserve_sudo_env: false,
            su_user: None,
            use_su_login: false,
            preserve_su_env: false,
            su_shell: None,
            doas: false,
            doas_user: None,
            shell_executable: Some("sh".to_string()),
            chdir: None,
            env: BTreeMap::new(),
            success_exit_codes: vec![0],
            timeout: None,
            get_pty: false,
            stdin: None,
        }
    }
}

impl ConnectorArguments {
    pub fn from_config(config: &Config) -> Self {
        Self {
            sudo: config.sudo,
            sudo_user: config.sudo_user.clone(),
            use_sudo_login: config.use_sudo_login,
            use_sudo_password: config.use_sudo_password,
            sudo_password: None,
            preserve_sudo_env: config.preserve_sudo_env,
            su_user: config.su_user.clone(),
            use_su_login: config.use_su_login,
            preserve_su_env: config.preserve_su_env,
            su_shell: config.su_shell.clone(),
            doas: config.doas,
            doas_user: config.doas_user.clone(),
            shell_executable: Some(config.shell.clone()),
            chdir: None,
            env: config.env.clone(),
            success_exit_codes: vec![0],
            timeout: None,
            get_pty: false,
            stdin: None,
        }
    }

    /// 是否需要提权（sudo/su/doas）
    pub fn escalates(&self) -> bool {
        self.sudo || self.su_user.is_some() || self.doas
    }

    /// 提权后的目标用户（未指定时为 root）
    pub fn escalation_user(&self) -> Option<&str> {
        self.su_user
            .as_deref()
            .or(self.sudo_user.as_deref())
            .or(self.doas_user.as_deref())
    }

    /// 去掉提权设置，以连接用户身份执行
    pub fn unprivileged(&self) -> Self {
        Self {
            sudo: false,
            sudo_user: None,
            sudo_password: None,
            su_user: None,
            doas: false,
            doas_user: None,
            ..self.clone()
        }
    }

    pub fn is_success(&self, exit_code: i32) -> bool {
        if self.success_exit_codes.is_empty() {
            exit_code == 0
        } else {
            self.success_exit_codes.contains(&exit_code)
        }
    }
}

/// 调用处、deploy、主机数据中声明的全局参数（未声明的为 None）
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ArgOverrides {
    pub sudo: Option<bool>,
    pub sudo_user: Option<String>,
    pub use_sudo_login: Option<bool>,
    pub use_sudo_password: Option<bool>,
    pub preserve_sudo_env: Option<bool>,
    pub su_user: Option<String>,
    pub use_su_login: Option<bool>,
    pub preserve_su_env: Option<bool>,
    pub su_shell: Option<String>,
    pub doas: Option<bool>,
    pub doas_user: Option<String>,
    pub shell_executable: Option<String>,
    pub chdir: Option<String>,
    pub env: Option<BTreeMap<String, String>>,
    pub success_exit_codes: Option<Vec<i32>>,
    pub timeout: Option<u64>,
    pub get_pty: Option<bool>,
    pub stdin: Option<String>,

    pub ignore_errors: Option<bool>,
    pub continue_on_error: Option<bool>,
    pub precondition: Option<String>,
    pub postcondition: Option<String>,

    pub parallel: Option<usize>,
    pub run_once: Option<bool>,
    pub serial: Option<bool>,
}

macro_rules! overlay {
    ($target:expr, $lower:expr, $($field:ident),+) => {
        $( if $target.$field.is_none() { $target.$field = $lower.$field.clone(); } )+
    };
}

macro_rules! apply_set {
    ($args:expr, $over:expr, [$($plain:ident),*], [$($opt:ident),*]) => {
        $( if let Some(value) = &$over.$plain { $args.$plain = value.clone(); } )*
        $( if let Some(value) = &$over.$opt { $args.$opt = Some(value.clone()); } )*
    };
}

impl ArgOverrides {
    /// 以 self 为高优先级，叠加低优先级的参数
    pub fn layered_over(&self, lower: &ArgOverrides) -> ArgOverrides {
        let mut merged = self.clone();
        overlay!(
            merged, lower, sudo, sudo_user, use_sudo_login, use_sudo_password,
            preserve_sudo_env, su_user, use_su_login, preserve_su_env, su_shell, doas,
            doas_user, shell_executable, chdir, success_exit_codes, timeout, get_pty, stdin,
            ignore_errors, continue_on_error, precondition, postcondition, parallel, run_once,
            serial
        );
        merged.env = match (&lower.env, &self.env) {
            (Some(low), Some(high)) => {
                let mut env = low.clone();
                env.extend(high.clone());
                Some(env)
            }
            (low, high) => high.clone().or_else(|| low.clone()),
        };
        merged
    }

    /// 把连接器相关的字段覆盖到已解析的参数上
    pub fn apply_to(&self, args: &mut ConnectorArguments) {
        apply_set!(
            args,
            self,
            [
                sudo, use_sudo_login, use_sudo_password, preserve_sudo_env, use_su_login,
                preserve_su_env, doas, success_exit_codes, get_pty
            ],
            [sudo_user, su_user, su_shell, doas_user, shell_executable, chdir, timeout, stdin]
        );
        if let Some(env) = &self.env {
            args.env.extend(env.clone());
        }
    }

    pub fn has_execution_args(&self) -> bool {
        self.parallel.is_some() || self.run_once.is_some() || self.serial.is_some()
    }

    /// 已设置的参数名，用于错误信息
    pub fn keys(&self) -> Vec<String> {
        match serde_json::to_value(self) {
            Ok(serde_json::Value::Object(map)) => map
                .into_iter()
                .filter(|(_, value)| !value.is_null())
                .map(|(key, _)| key)
                .collect(),
            _ => Vec::new(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.keys().is_empty()
    }

    /// 从主机数据中提取以 `_` 开头的参数，例如 `_sudo: true`
    pub fn from_data(data: &serde_json::Map<String, serde_json::Value>) -> ArgOverrides {
        let prefixed: serde_json::Map<String, serde_json::Value> = data
            .iter()
            .filter_map(|(key, value)| {
                key.strip_prefix('_')
                    .map(|stripped| (stripped.to_string(), value.clone()))
            })
            .collect();
        if prefixed.is_empty() {
            return ArgOverrides::default();
        }
        match serde_json::from_value(serde_json::Value::Object(prefixed)) {
            Ok(overrides) => overrides,
            Err(e) => {
                tracing::warn!("Ignoring invalid argument data: {}", e);
                ArgOverrides::default()
            }
        }
    }
}

/// 执行策略参数：同一个操作在所有主机上必须一致
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecutionArgs {
    pub parallel: Option<usize>,
    pub run_once: bool,
    pub serial: bool,
}

/// 一个操作在某台主机上的全部已解析参数
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct OperationArgs {
    pub connector: ConnectorArguments,
    pub ignore_errors: bool,
    pub continue_on_error: bool,
    pub precondition: Option<String>,
    pub postcondition: Option<String>,
    pub execution: ExecutionArgs,
}

impl OperationArgs {
    pub fn resolve(overrides: &ArgOverrides, config: &Config) -> Self {
        let mut connector = ConnectorArguments::from_config(config);
        overrides.apply_to(&mut connector);
        Self {
            connector,
            ignore_errors: overrides.ignore_errors.unwrap_or(config.ignore_errors),
            continue_on_error: overrides.continue_on_error.unwrap_or(false),
            precondition: overrides.precondition.clone(),
            postcondition: overrides.postcondition.clone(),
            execution: ExecutionArgs {
                parallel: overrides.parallel.or(config.parallel),
                run_once: overrides.run_once.unwrap_or(false),
                serial: overrides.serial.unwrap_or(false),
            },
        }
    }
}

/// 编译阶段每台主机的计数
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct HostMeta {
    pub ops: usize,
    pub commands: usize,
    pub ops_change: usize,
    pub ops_no_change: usize,
}

/// 执行阶段每台主机的结果计数
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct HostResults {
    pub ops: usize,
    pub success_ops: usize,
    pub error_ops: usize,
    pub ignored_error_ops: usize,
    pub partial_ops: usize,
    pub commands: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum OpResultKind {
    Success,
    NoChange,
    Skipped,
    IgnoredError,
    Error,
    Partial,
}

impl OpResultKind {
    /// 该结果是否让主机继续执行后续操作
    pub fn is_ok(&self) -> bool {
        matches!(
            self,
            OpResultKind::Success
                | OpResultKind::NoChange
                | OpResultKind::Skipped
                | OpResultKind::IgnoredError
        )
    }
}

impl HostResults {
    pub fn record(&mut self, kind: OpResultKind, commands: usize) {
        self.commands += commands;
        match kind {
            OpResultKind::Success | OpResultKind::NoChange => {
                self.ops += 1;
                self.success_ops += 1;
            }
            OpResultKind::IgnoredError => {
                self.ops += 1;
                self.error_ops += 1;
                self.ignored_error_ops += 1;
            }
            OpResultKind::Error => self.error_ops += 1,
            OpResultKind::Partial => {
                self.error_ops += 1;
                self.partial_ops += 1;
            }
            OpResultKind::Skipped => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_layered_overrides_prefer_higher() {
        let high = ArgOverrides {
            sudo: Some(true),
            env: Some(BTreeMap::from([("A".to_string(), "high".to_string())])),
            ..Default::default()
        };
        let low = ArgOverrides {
            sudo: Some(false),
            sudo_user: Some("deploy".to_string()),
            env: Some(BTreeMap::from([
                ("A".to_string(), "low".to_string()),
                ("B".to_string(), "low".to_string()),
            ])),
            ..Default::default()
        };

        let merged = high.layered_over(&low);
        assert_eq!(merged.sudo, Some(true));
        assert_eq!(merged.sudo_user.as_deref(), Some("deploy"));
        let env = merged.env.unwrap();
        assert_eq!(env["A"], "high");
        assert_eq!(env["B"], "low");
    }

    #[test]
    fn test_overrides_from_host_data() {
        let data = serde_json::json!({
            "_sudo": true,
            "_timeout": 30,
            "ssh_user": "ubuntu",
        });
        let overrides = ArgOverrides::from_data(data.as_object().unwrap());
        assert_eq!(overrides.sudo, Some(true));
        assert_eq!(overrides.timeout, Some(30));
        assert_eq!(overrides.keys().len(), 2);
    }

    #[test]
    fn test_success_exit_codes() {
        let mut args = ConnectorArguments::default();
        assert!(args.is_success(0));
        assert!(!args.is_success(1));
        args.success_exit_codes = vec![0, 2];
        assert!(args.is_success(2));
    }

    #[test]
    fn test_secret_debug_is_masked() {
        let secret = Secret::new("hunter2");
        assert_eq!(format!("{:?}", secret), "***");
        assert_eq!(secret.expose(), "hunter2");
    }
}
