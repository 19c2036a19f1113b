use crate::error::InfraError;
use crate::host::Host;
use crate::types::{ArgOverrides, CommandOutput, ConnectorArguments, FileSource, OutputLine, OutputStream};
use crate::utils::quote;
use crate::Result;
use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{debug, error};

/// 命令字符串的组成部分
#[derive(Clone, PartialEq)]
pub enum CommandPart {
    /// 原样拼接
    Raw(String),
    /// shell 转义后拼接
    Quote(String),
    /// 执行时原样使用，打印时显示为 `***`
    Mask(String),
    Nested(StringCommand),
    /// 整个子命令作为一个参数转义
    QuotedNested(StringCommand),
}

impl CommandPart {
    fn render(&self, masked: bool) -> String {
        match self {
            CommandPart::Raw(value) => value.clone(),
            CommandPart::Quote(value) => quote(value),
            CommandPart::Mask(value) => {
                if masked {
                    "***".to_string()
                } else {
                    value.clone()
                }
            }
            CommandPart::Nested(command) => command.render(masked),
            CommandPart::QuotedNested(command) => quote(&command.render(masked)),
        }
    }
}

/// 由多个部分组成的 shell 命令
#[derive(Clone)]
pub struct StringCommand {
    parts: Vec<CommandPart>,
    separator: String,
    pub overrides: ArgOverrides,
}

impl Default for StringCommand {
    fn default() -> Self {
        Self::new()
    }
}

impl StringCommand {
    pub fn new() -> Self {
        Self {
            parts: Vec::new(),
            separator: " ".to_string(),
            overrides: ArgOverrides::default(),
        }
    }

    pub fn from_parts(parts: Vec<CommandPart>) -> Self {
        Self {
            parts,
            ..Self::new()
        }
    }

    pub fn raw(mut self, value: impl Into<String>) -> Self {
        self.parts.push(CommandPart::Raw(value.into()));
        self
    }

    pub fn quote(mut self, value: impl Into<String>) -> Self {
        self.parts.push(CommandPart::Quote(value.into()));
        self
    }

    pub fn mask(mut self, value: impl Into<String>) -> Self {
        self.parts.push(CommandPart::Mask(value.into()));
        self
    }

    pub fn nested(mut self, command: StringCommand) -> Self {
        self.parts.push(CommandPart::Nested(command));
        self
    }

    pub fn quoted_nested(mut self, command: StringCommand) -> Self {
        self.parts.push(CommandPart::QuotedNested(command));
        self
    }

    pub fn part(mut self, part: CommandPart) -> Self {
        self.parts.push(part);
        self
    }

    pub fn with_separator(mut self, separator: impl Into<String>) -> Self {
        self.separator = separator.into();
        self
    }

    pub fn with_overrides(mut self, overrides: ArgOverrides) -> Self {
        self.overrides = overrides;
        self
    }

    pub fn is_empty(&self) -> bool {
        self.parts.is_empty()
    }

    /// 实际执行的字符串
    pub fn raw_value(&self) -> String {
        self.render(false)
    }

    /// 用于日志输出的字符串
    pub fn masked_value(&self) -> String {
        self.render(true)
    }

    fn render(&self, masked: bool) -> String {
        self.parts
            .iter()
            .map(|part| part.render(masked))
            .collect::<Vec<_>>()
            .join(&self.separator)
    }
}

impl From<&str> for StringCommand {
    fn from(value: &str) -> Self {
        StringCommand::new().raw(value)
    }
}

impl From<String> for StringCommand {
    fn from(value: String) -> Self {
        StringCommand::new().raw(value)
    }
}

impl fmt::Display for StringCommand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.masked_value())
    }
}

impl fmt::Debug for StringCommand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "StringCommand({})", self.masked_value())
    }
}

// 仅用于测试和去重
impl PartialEq for StringCommand {
    fn eq(&self, other: &Self) -> bool {
        self.raw_value() == other.raw_value()
    }
}

/// 按空白切分模板，并把 `{0}`、`{1}` 等占位符替换为对应的部分
///
/// 占位符嵌在单词中间时（如 `--file={0}`），该单词整体作为一个无分隔符的子命令
pub fn make_formatted_string_command(
    template: &str,
    args: Vec<CommandPart>,
) -> Result<StringCommand> {
    let placeholder = regex::Regex::new(r"\{(\d+)\}")
        .map_err(|e| InfraError::DeployError(format!("Invalid placeholder pattern: {}", e)))?;
    let lookup = |index: &str| -> Result<CommandPart> {
        let position: usize = index
            .parse()
            .map_err(|_| InfraError::DeployError(format!("Invalid placeholder: {{{}}}", index)))?;
        args.get(position).cloned().ok_or_else(|| {
            InfraError::DeployError(format!("Missing argument {} for template: {}", position, template))
        })
    };

    let mut command = StringCommand::new();
    for token in template.split_whitespace() {
        let matches: Vec<_> = placeholder.captures_iter(token).collect();
        if matches.is_empty() {
            command = command.raw(token);
            continue;
        }

        let whole = &matches[0];
        if matches.len() == 1 && whole[0].len() == token.len() {
            command = command.part(lookup(&whole[1])?);
            continue;
        }

        let mut word = StringCommand::new().with_separator("");
        let mut last = 0;
        for capture in &matches {
            let span = capture.get(0).map(|m| (m.start(), m.end())).unwrap_or((last, last));
            if span.0 > last {
                word = word.raw(&token[last..span.0]);
            }
            word = word.part(lookup(&capture[1])?);
            last = span.1;
        }
        if last < token.len() {
            word = word.raw(&token[last..]);
        }
        command = command.nested(word);
    }
    Ok(command)
}

pub type HostFunction =
    Arc<dyn Fn(&mut Host, &ConnectorArguments) -> Result<bool> + Send + Sync>;

/// 一个原子动作
#[derive(Clone)]
pub enum Command {
    Shell(StringCommand),
    Upload {
        src: FileSource,
        dest: String,
        overrides: ArgOverrides,
    },
    Download {
        src: String,
        dest: PathBuf,
        overrides: ArgOverrides,
    },
    Function {
        name: String,
        func: HostFunction,
        overrides: ArgOverrides,
    },
    Rsync {
        src: String,
        dest: String,
        flags: Vec<String>,
        overrides: ArgOverrides,
    },
}

impl Command {
    pub fn shell(command: impl Into<StringCommand>) -> Self {
        Command::Shell(command.into())
    }

    pub fn upload(src: FileSource, dest: impl Into<String>) -> Self {
        Command::Upload {
            src,
            dest: dest.into(),
            overrides: ArgOverrides::default(),
        }
    }

    pub fn download(src: impl Into<String>, dest: impl Into<PathBuf>) -> Self {
        Command::Download {
            src: src.into(),
            dest: dest.into(),
            overrides: ArgOverrides::default(),
        }
    }

    pub fn function<F>(name: impl Into<String>, func: F) -> Self
    where
        F: Fn(&mut Host, &ConnectorArguments) -> Result<bool> + Send + Sync + 'static,
    {
        Command::Function {
            name: name.into(),
            func: Arc::new(func),
            overrides: ArgOverrides::default(),
        }
    }

    pub fn rsync(src: impl Into<String>, dest: impl Into<String>, flags: Vec<String>) -> Self {
        Command::Rsync {
            src: src.into(),
            dest: dest.into(),
            flags,
            overrides: ArgOverrides::default(),
        }
    }

    pub fn overrides(&self) -> &ArgOverrides {
        match self {
            Command::Shell(command) => &command.overrides,
            Command::Upload { overrides, .. }
            | Command::Download { overrides, .. }
            | Command::Function { overrides, .. }
            | Command::Rsync { overrides, .. } => overrides,
        }
    }

    pub fn with_overrides(mut self, new_overrides: ArgOverrides) -> Self {
        match &mut self {
            Command::Shell(command) => command.overrides = new_overrides,
            Command::Upload { overrides, .. }
            | Command::Download { overrides, .. }
            | Command::Function { overrides, .. }
            | Command::Rsync { overrides, .. } => *overrides = new_overrides,
        }
        self
    }

    /// 在主机上执行。命令自身的参数覆盖操作的参数
    pub fn execute(
        &self,
        host: &mut Host,
        base_args: &ConnectorArguments,
    ) -> Result<(bool, CommandOutput)> {
        let mut args = base_args.clone();
        self.overrides().apply_to(&mut args);
        debug!("[{}] Executing: {}", host.name, self);

        match self {
            Command::Shell(command) => host.run_shell_command(command, &args),
            Command::Upload { src, dest, .. } => {
                let ok = host.put_file(src, dest, &args)?;
                Ok((ok, CommandOutput::default()))
            }
            Command::Download { src, dest, .. } => {
                let ok = host.get_file(src, dest, &args)?;
                Ok((ok, CommandOutput::default()))
            }
            Command::Function { name, func, .. } => match func(host, &args) {
                Ok(ok) => Ok((ok, CommandOutput::default())),
                Err(e) => {
                    error!("[{}] Function {} failed: {}", host.name, name, e);
                    let output = CommandOutput::new(
                        vec![OutputLine {
                            stream: OutputStream::Stderr,
                            line: e.to_string(),
                        }],
                        None,
                    );
                    Ok((false, output))
                }
            },
            Command::Rsync { src, dest, flags, .. } => {
                host.check_can_rsync()?;
                host.rsync(src, dest, flags, &args)
            }
        }
    }
}

impl fmt::Display for Command {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Command::Shell(command) => write!(f, "{}", command),
            Command::Upload { src, dest, .. } => write!(f, "upload {} -> {}", src, dest),
            Command::Download { src, dest, .. } => {
                write!(f, "download {} -> {}", src, dest.display())
            }
            Command::Function { name, .. } => write!(f, "function {}", name),
            Command::Rsync { src, dest, .. } => write!(f, "rsync {} -> {}", src, dest),
        }
    }
}

impl fmt::Debug for Command {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Command({})", self)
    }
}

/// 操作体产出的条目，产出时即规范化为 `Command`
#[derive(Debug, Clone)]
pub enum OpItem {
    RawShell(String),
    Command(Command),
}

impl OpItem {
    pub fn into_command(self) -> Command {
        match self {
            OpItem::RawShell(raw) => Command::shell(raw),
            OpItem::Command(command) => command,
        }
    }
}

impl From<&str> for OpItem {
    fn from(value: &str) -> Self {
        OpItem::RawShell(value.to_string())
    }
}

impl From<String> for OpItem {
    fn from(value: String) -> Self {
        OpItem::RawShell(value)
    }
}

impl From<Command> for OpItem {
    fn from(value: Command) -> Self {
        OpItem::Command(value)
    }
}

impl From<StringCommand> for OpItem {
    fn from(value: StringCommand) -> Self {
        OpItem::Command(Command::Shell(value))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_masked_parts_hidden_in_display() {
        let command = StringCommand::new()
            .raw("mysql")
            .raw("-p")
            .mask("s3cret")
            .quote("my db");

        assert_eq!(command.raw_value(), "mysql -p s3cret 'my db'");
        assert_eq!(command.masked_value(), "mysql -p *** 'my db'");
        assert_eq!(command.to_string(), "mysql -p *** 'my db'");
        assert!(!format!("{:?}", command).contains("s3cret"));
    }

    #[test]
    fn test_nested_commands() {
        let inner = StringCommand::new().raw("echo").quote("a b");
        let command = StringCommand::new()
            .raw("sh")
            .raw("-c")
            .quoted_nested(inner.clone());
        assert_eq!(command.raw_value(), "sh -c 'echo '\"'\"'a b'\"'\"''");

        let joined = StringCommand::new().raw("cd /tmp").raw("&&").nested(inner);
        assert_eq!(joined.raw_value(), "cd /tmp && echo 'a b'");
    }

    #[test]
    fn test_equality_uses_raw_value() {
        let a = StringCommand::new().raw("echo").mask("one");
        let b = StringCommand::from("echo one");
        assert_eq!(a, b);
    }

    #[test]
    fn test_formatted_string_command() {
        let command = make_formatted_string_command(
            "test -e {0} && echo --path={0}x",
            vec![CommandPart::Quote("/a b".to_string())],
        )
        .unwrap();
        assert_eq!(command.raw_value(), "test -e '/a b' && echo --path='/a b'x");

        let missing = make_formatted_string_command("echo {1}", vec![]);
        assert!(missing.is_err());
    }

    #[test]
    fn test_op_item_normalizes() {
        let item: OpItem = "echo hi".into();
        match item.into_command() {
            Command::Shell(command) => assert_eq!(command.raw_value(), "echo hi"),
            other => panic!("unexpected command {:?}", other),
        }
    }
}
