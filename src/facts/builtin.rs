use super::Fact;
use crate::command::StringCommand;

/// 路径是否存在
#[derive(Debug, Clone, Copy, Default)]
pub struct FileExists;

impl Fact for FileExists {
    type Args = String;
    type Output = bool;

    fn name(&self) -> &str {
        "file_exists"
    }

    fn command(&self, path: &String) -> StringCommand {
        StringCommand::new()
            .raw("test")
            .raw("-e")
            .quote(path)
            .raw("&& echo yes || echo no")
    }

    fn default_value(&self) -> bool {
        false
    }

    fn process(&self, lines: &[String]) -> bool {
        lines.first().map(|line| line.trim() == "yes").unwrap_or(false)
    }
}

/// 任意命令的标准输出
#[derive(Debug, Clone, Copy, Default)]
pub struct CommandOutput;

impl Fact for CommandOutput {
    type Args = String;
    type Output = String;

    fn name(&self) -> &str {
        "command_output"
    }

    fn command(&self, command: &String) -> StringCommand {
        StringCommand::from(command.as_str())
    }

    fn default_value(&self) -> String {
        String::new()
    }

    fn process(&self, lines: &[String]) -> String {
        lines.join("\n")
    }
}

/// 可执行文件路径
#[derive(Debug, Clone, Copy, Default)]
pub struct Which;

impl Fact for Which {
    type Args = String;
    type Output = Option<String>;

    fn name(&self) -> &str {
        "which"
    }

    fn command(&self, binary: &String) -> StringCommand {
        StringCommand::new()
            .raw("command -v")
            .quote(binary)
            .raw("|| true")
    }

    fn default_value(&self) -> Option<String> {
        None
    }

    fn process(&self, lines: &[String]) -> Option<String> {
        lines
            .first()
            .map(|line| line.trim().to_string())
            .filter(|line| !line.is_empty())
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct Hostname;

impl Fact for Hostname {
    type Args = ();
    type Output = String;

    fn name(&self) -> &str {
        "hostname"
    }

    fn command(&self, _args: &()) -> StringCommand {
        StringCommand::from("uname -n")
    }

    fn requires_command(&self, _args: &()) -> Option<String> {
        Some("uname".to_string())
    }

    fn default_value(&self) -> String {
        String::new()
    }

    fn process(&self, lines: &[String]) -> String {
        lines.first().map(|line| line.trim().to_string()).unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn lines(values: &[&str]) -> Vec<String> {
        values.iter().map(|v| v.to_string()).collect()
    }

    #[test]
    fn test_file_exists() {
        let command = FileExists.command(&"/tmp/a b".to_string());
        assert_eq!(command.raw_value(), "test -e '/tmp/a b' && echo yes || echo no");
        assert!(FileExists.process(&lines(&["yes"])));
        assert!(!FileExists.process(&lines(&["no"])));
    }

    #[test]
    fn test_which_and_hostname() {
        assert_eq!(Which.process(&lines(&["/usr/bin/git"])), Some("/usr/bin/git".to_string()));
        assert_eq!(Which.process(&lines(&[""])), None);
        assert_eq!(Hostname.process(&lines(&["web1 "])), "web1");
        assert_eq!(CommandOutput.process(&lines(&["a", "b"])), "a\nb");
    }
}
