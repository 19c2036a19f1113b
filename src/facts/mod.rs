// 主机 fact：只读探测，按指纹缓存
pub mod builtin;

use crate::command::StringCommand;
use crate::error::InfraError;
use crate::host::Host;
use crate::types::{ArgOverrides, CommandOutput, ConnectorArguments, OperationArgs};
use crate::utils::make_hash;
use crate::Result;
use regex::Regex;
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::json;
use std::sync::OnceLock;
use tracing::{debug, error, warn};

pub use builtin::{CommandOutput as CommandOutputFact, FileExists, Hostname, Which};

// 提权目标用户不存在时的输出，视为条件不成立而不是失败
const SUDO_USER_MISSING: &[&str] = &[r"^sudo: unknown user:"];
const SU_USER_MISSING: &[&str] = &[r"^su: user .+ does not exist", r"^su: unknown login"];

fn compile_patterns(patterns: &[&str]) -> Vec<Regex> {
    patterns.iter().filter_map(|p| Regex::new(p).ok()).collect()
}

/// 只看 stderr 第一行，并且只在对应的提权用户被设置时生效
fn benign_stderr(lines: &[String], context: &ConnectorArguments) -> bool {
    static SUDO: OnceLock<Vec<Regex>> = OnceLock::new();
    static SU: OnceLock<Vec<Regex>> = OnceLock::new();

    let Some(first) = lines.first() else {
        return false;
    };
    let sudo_missing = context.sudo_user.is_some()
        && SUDO
            .get_or_init(|| compile_patterns(SUDO_USER_MISSING))
            .iter()
            .any(|p| p.is_match(first));
    let su_missing = context.su_user.is_some()
        && SU
            .get_or_init(|| compile_patterns(SU_USER_MISSING))
            .iter()
            .any(|p| p.is_match(first));
    sudo_missing || su_missing
}

/// fact 描述：探测命令 + 纯函数解析
pub trait Fact: Send + Sync {
    type Args: Serialize;
    type Output: Serialize + DeserializeOwned;

    fn name(&self) -> &str;

    fn command(&self, args: &Self::Args) -> StringCommand;

    /// 命令依赖的程序，不存在时直接返回默认值
    fn requires_command(&self, _args: &Self::Args) -> Option<String> {
        None
    }

    /// 强制使用的 shell
    fn shell_executable(&self) -> Option<String> {
        None
    }

    fn default_value(&self) -> Self::Output;

    fn process(&self, lines: &[String]) -> Self::Output;

    /// 需要 stderr 等完整输出的 fact 可以覆盖此方法
    fn process_output(&self, output: &CommandOutput) -> Self::Output {
        self.process(&output.stdout_lines())
    }
}

/// 指纹：名称 + 参数 + 影响结果的连接参数
pub fn fingerprint<F: Fact>(fact: &F, args: &F::Args, context: &ConnectorArguments) -> String {
    let key = json!({
        "name": fact.name(),
        "args": serde_json::to_value(args).unwrap_or(serde_json::Value::Null),
        "context": {
            "sudo": context.sudo,
            "sudo_user": context.sudo_user,
            "su_user": context.su_user,
            "shell": context.shell_executable,
            "env": context.env,
            "timeout": context.timeout,
        },
    });
    make_hash(&key.to_string())
}

impl Host {
    fn fact_context<F: Fact>(&self, fact: &F, overrides: &ArgOverrides) -> (ConnectorArguments, bool) {
        let op_args = self
            .current_op
            .clone()
            .unwrap_or_else(|| OperationArgs::resolve(&self.data_overrides(), &self.config));
        let mut context = op_args.connector;
        overrides.apply_to(&mut context);
        if let Some(shell) = fact.shell_executable() {
            context.shell_executable = Some(shell);
        }
        let ignore_errors = overrides.ignore_errors.unwrap_or(op_args.ignore_errors);
        (context, ignore_errors)
    }

    pub fn get_fact<F: Fact>(&mut self, fact: &F, args: &F::Args) -> Result<F::Output> {
        self.get_fact_with(fact, args, &ArgOverrides::default())
    }

    /// 读取 fact。同一指纹在一次运行中只探测一次
    pub fn get_fact_with<F: Fact>(
        &mut self,
        fact: &F,
        args: &F::Args,
        overrides: &ArgOverrides,
    ) -> Result<F::Output> {
        let (context, ignore_errors) = self.fact_context(fact, overrides);
        let key = fingerprint(fact, args, &context);

        if let Some(cached) = self.facts.get(&key) {
            debug!("[{}] Using cached fact {}", self.name, fact.name());
            return serde_json::from_value(cached.clone()).map_err(|_| InfraError::FactError {
                host: self.name.clone(),
                fact: fact.name().to_string(),
            });
        }

        let mut command = fact.command(args);
        if let Some(binary) = fact.requires_command(args) {
            command = StringCommand::new()
                .raw("! command -v")
                .quote(binary)
                .raw(">/dev/null ||")
                .nested(command);
        }

        debug!("[{}] Loading fact {}", self.name, fact.name());
        // 超时、连接中断与非零退出一样按 ignore_errors 处理
        let (ok, output) = match self.run_shell_command(&command, &context) {
            Ok(result) => result,
            Err(e) => {
                error!("[{}] Error loading fact {}: {}", self.name, fact.name(), e);
                (false, CommandOutput::default())
            }
        };

        let value = if ok {
            if output.stdout_lines().is_empty() {
                fact.default_value()
            } else {
                fact.process_output(&output)
            }
        } else if benign_stderr(&output.stderr_lines(), &context) {
            debug!(
                "[{}] Fact {} hit a missing escalation user, using default",
                self.name,
                fact.name()
            );
            fact.default_value()
        } else if ignore_errors {
            warn!(
                "[{}] Could not load fact {}, ignoring: {}",
                self.name,
                fact.name(),
                output.stderr()
            );
            fact.default_value()
        } else {
            warn!(
                "[{}] Could not load fact {}: {}",
                self.name,
                fact.name(),
                output.stderr()
            );
            return Err(InfraError::FactError {
                host: self.name.clone(),
                fact: fact.name().to_string(),
            });
        };

        self.store_fact(key, &value, fact.name())?;
        Ok(value)
    }

    fn store_fact<T: Serialize>(&mut self, key: String, value: &T, name: &str) -> Result<()> {
        let stored = serde_json::to_value(value).map_err(|_| InfraError::FactError {
            host: self.name.clone(),
            fact: name.to_string(),
        })?;
        self.facts.insert(key, stored);
        Ok(())
    }

    /// 写入 fact 缓存，避免在已知的变更后重新探测
    pub fn create_fact<F: Fact>(&mut self, fact: &F, args: &F::Args, value: F::Output) -> Result<()> {
        let (context, _) = self.fact_context(fact, &ArgOverrides::default());
        let key = fingerprint(fact, args, &context);
        self.store_fact(key, &value, fact.name())
    }

    pub fn delete_fact<F: Fact>(&mut self, fact: &F, args: &F::Args) {
        let (context, _) = self.fact_context(fact, &ArgOverrides::default());
        let key = fingerprint(fact, args, &context);
        self.facts.remove(&key);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn lines(values: &[&str]) -> Vec<String> {
        values.iter().map(|v| v.to_string()).collect()
    }

    #[test]
    fn test_benign_stderr_needs_matching_escalation() {
        let plain = ConnectorArguments::default();
        let mut sudo = ConnectorArguments::default();
        sudo.sudo = true;
        sudo.sudo_user = Some("nobody2".to_string());
        let mut su = ConnectorArguments::default();
        su.su_user = Some("app".to_string());

        assert!(benign_stderr(&lines(&["sudo: unknown user: nobody2"]), &sudo));
        assert!(benign_stderr(&lines(&["su: user app does not exist"]), &su));
        assert!(benign_stderr(&lines(&["su: unknown login: app"]), &su));

        assert!(!benign_stderr(&lines(&["su: user app does not exist"]), &plain));
        assert!(!benign_stderr(&lines(&["sudo: unknown user: nobody2"]), &su));
        assert!(!benign_stderr(&lines(&["su: unknown login: app"]), &sudo));
        assert!(!benign_stderr(&lines(&["permission denied"]), &su));
    }

    #[test]
    fn test_benign_stderr_only_checks_first_line() {
        let mut su = ConnectorArguments::default();
        su.su_user = Some("app".to_string());
        assert!(!benign_stderr(
            &lines(&["cat: /etc/app: No such file", "su: user app does not exist"]),
            &su
        ));
        assert!(!benign_stderr(&[], &su));
    }

    #[test]
    fn test_fingerprint_depends_on_context() {
        let args = "/etc/hosts".to_string();
        let plain = ConnectorArguments::default();
        let mut sudo = ConnectorArguments::default();
        sudo.sudo = true;

        assert_eq!(
            fingerprint(&FileExists, &args, &plain),
            fingerprint(&FileExists, &args, &plain.clone())
        );
        assert_ne!(
            fingerprint(&FileExists, &args, &plain),
            fingerprint(&FileExists, &args, &sudo)
        );
        assert_ne!(
            fingerprint(&FileExists, &args, &plain),
            fingerprint(&FileExists, &"/etc/passwd".to_string(), &plain)
        );
    }
}
