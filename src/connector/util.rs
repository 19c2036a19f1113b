use crate::command::StringCommand;
use crate::types::{ConnectorArguments, OutputLine, OutputStream};
use crate::utils::quote;
use std::io::{BufRead, BufReader, Read};
use std::sync::mpsc;
use std::thread;
use std::time::{Duration, Instant};

/// sudo 需要密码时输出的最后一行
pub const SUDO_PASSWORD_REQUIRED: &str = "sudo: a password is required";

/// askpass 脚本从这个环境变量读取 sudo 密码
pub const SUDO_ASKPASS_ENV_VAR: &str = "RSINFRA_SUDO_PASSWORD";

// 在同一次调用内创建并删除 askpass 脚本
const ASKPASS_SETUP: &str = concat!(
    r#"_askpass=$(mktemp "${TMPDIR:-/tmp}/rsinfra-askpass-XXXXXXXXXX") &&"#,
    r#" printf '%s\n' '#!/bin/sh' 'printf "%s\n" "$RSINFRA_SUDO_PASSWORD"' > "$_askpass" &&"#,
    r#" chmod 700 "$_askpass" &&"#
);
const ASKPASS_TEARDOWN: &str = r#"; _rc=$?; rm -f "$_askpass"; exit $_rc"#;

fn uses_shell(shell: &Option<String>) -> Option<&str> {
    match shell.as_deref() {
        None | Some("") | Some("none") => None,
        Some(shell) => Some(shell),
    }
}

/// 按参数包装 Unix 命令：环境变量、工作目录、doas/sudo/su 提权，最后交给 shell 执行
pub fn make_unix_command(command: &StringCommand, args: &ConnectorArguments) -> StringCommand {
    let mut inner = command.clone();

    if !args.env.is_empty() {
        let mut export = StringCommand::new().raw("export");
        for (key, value) in &args.env {
            export = export.raw(format!("{}={}", key, quote(value)));
        }
        inner = export.raw("&&").nested(inner);
    }

    if let Some(chdir) = &args.chdir {
        inner = StringCommand::new()
            .raw("cd")
            .quote(chdir)
            .raw("&&")
            .nested(inner);
    }

    let shell = uses_shell(&args.shell_executable);
    let mut wrapped = StringCommand::new();

    if args.doas {
        wrapped = wrapped.raw("doas").raw("-n");
        if let Some(user) = &args.doas_user {
            wrapped = wrapped.raw("-u").quote(user);
        }
    }

    let askpass = args.sudo && args.sudo_password.is_some();
    if let (true, Some(password)) = (askpass, &args.sudo_password) {
        wrapped = wrapped
            .raw("env")
            .raw(r#"SUDO_ASKPASS="$_askpass""#)
            .mask(format!("{}={}", SUDO_ASKPASS_ENV_VAR, quote(password.expose())));
    }

    if args.sudo {
        wrapped = wrapped.raw("sudo").raw("-H");
        if askpass {
            wrapped = wrapped.raw("-A").raw("-k");
        } else {
            wrapped = wrapped.raw("-n");
        }
        if args.use_sudo_login {
            wrapped = wrapped.raw("-i");
        }
        if args.preserve_sudo_env {
            wrapped = wrapped.raw("-E");
        }
        if let Some(user) = &args.sudo_user {
            wrapped = wrapped.raw("-u").quote(user);
        }
    }

    if let Some(su_user) = &args.su_user {
        wrapped = wrapped.raw("su");
        if args.use_su_login {
            wrapped = wrapped.raw("-l");
        }
        if args.preserve_su_env {
            wrapped = wrapped.raw("-m");
        }
        if let Some(su_shell) = &args.su_shell {
            wrapped = wrapped.raw("-s").raw(format!("`which {}`", su_shell));
        }
        wrapped = wrapped.quote(su_user).raw("-c");
        // BSD su 没有 shell 选项，整条 `shell -c 'cmd'` 作为一个参数
        let body = match shell {
            Some(shell) => StringCommand::new().raw(shell).raw("-c").quoted_nested(inner),
            None => inner,
        };
        wrapped = wrapped.quoted_nested(body);
    } else {
        match shell {
            Some(shell) => wrapped = wrapped.raw(shell).raw("-c").quoted_nested(inner),
            None => wrapped = wrapped.nested(inner),
        }
    }

    if askpass {
        wrapped = StringCommand::new()
            .raw(ASKPASS_SETUP)
            .raw(" ")
            .nested(wrapped)
            .raw(ASKPASS_TEARDOWN)
            .with_separator("");
    }

    wrapped.with_overrides(command.overrides.clone())
}

/// 命令失败且最后一行是 sudo 要求密码
pub fn needs_sudo_password(success: bool, lines: &[OutputLine]) -> bool {
    !success
        && lines
            .last()
            .map(|line| line.line.trim() == SUDO_PASSWORD_REQUIRED)
            .unwrap_or(false)
}

enum ReaderMessage {
    Line(OutputLine),
    Done,
}

fn spawn_reader<R: Read + Send + 'static>(
    stream: OutputStream,
    source: R,
    sender: mpsc::Sender<ReaderMessage>,
) {
    thread::spawn(move || {
        let mut reader = BufReader::new(source);
        let mut buffer = Vec::new();
        loop {
            buffer.clear();
            match reader.read_until(b'\n', &mut buffer) {
                Ok(0) | Err(_) => break,
                Ok(_) => {
                    let line = String::from_utf8_lossy(&buffer)
                        .trim_end_matches(['\n', '\r'])
                        .to_string();
                    if sender
                        .send(ReaderMessage::Line(OutputLine { stream, line }))
                        .is_err()
                    {
                        return;
                    }
                }
            }
        }
        let _ = sender.send(ReaderMessage::Done);
    });
}

/// 读取超时
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReadTimeout {
    pub partial: Vec<OutputLine>,
}

/// 用两个独立的读取线程把 stdout/stderr 读入同一个有序队列
///
/// 超时后返回 `ReadTimeout`，调用方负责终止进程（进程退出后读取线程随之结束）
pub fn read_buffers_into_queue<O, E>(
    stdout: O,
    stderr: E,
    timeout: Option<Duration>,
) -> Result<Vec<OutputLine>, ReadTimeout>
where
    O: Read + Send + 'static,
    E: Read + Send + 'static,
{
    let (sender, receiver) = mpsc::channel();
    spawn_reader(OutputStream::Stdout, stdout, sender.clone());
    spawn_reader(OutputStream::Stderr, stderr, sender);

    let deadline = timeout.map(|t| Instant::now() + t);
    let mut lines = Vec::new();
    let mut finished = 0;

    while finished < 2 {
        let message = match deadline {
            Some(deadline) => {
                let remaining = deadline.saturating_duration_since(Instant::now());
                match receiver.recv_timeout(remaining) {
                    Ok(message) => message,
                    Err(mpsc::RecvTimeoutError::Timeout) => {
                        return Err(ReadTimeout { partial: lines });
                    }
                    Err(mpsc::RecvTimeoutError::Disconnected) => break,
                }
            }
            None => match receiver.recv() {
                Ok(message) => message,
                Err(_) => break,
            },
        };
        match message {
            ReaderMessage::Line(line) => lines.push(line),
            ReaderMessage::Done => finished += 1,
        }
    }

    Ok(lines)
}

/// 把非阻塞读取得到的字节块切成行
#[derive(Debug, Default)]
pub struct LineSplitter {
    pending: Vec<u8>,
}

impl LineSplitter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, chunk: &[u8]) -> Vec<String> {
        self.pending.extend_from_slice(chunk);
        let mut lines = Vec::new();
        while let Some(position) = self.pending.iter().position(|b| *b == b'\n') {
            let raw: Vec<u8> = self.pending.drain(..=position).collect();
            lines.push(
                String::from_utf8_lossy(&raw)
                    .trim_end_matches(['\n', '\r'])
                    .to_string(),
            );
        }
        lines
    }

    pub fn finish(&mut self) -> Option<String> {
        if self.pending.is_empty() {
            return None;
        }
        let raw = std::mem::take(&mut self.pending);
        Some(String::from_utf8_lossy(&raw).to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::Secret;

    fn render(args: &ConnectorArguments) -> String {
        make_unix_command(&StringCommand::from("whoami"), args).raw_value()
    }

    #[test]
    fn test_plain_shell_wrap() {
        let args = ConnectorArguments::default();
        assert_eq!(render(&args), "sh -c whoami");
    }

    #[test]
    fn test_env_and_chdir() {
        let mut args = ConnectorArguments::default();
        args.env.insert("LANG".to_string(), "C".to_string());
        args.chdir = Some("/var/www".to_string());
        assert_eq!(
            render(&args),
            "sh -c 'cd /var/www && export LANG=C && whoami'"
        );
    }

    #[test]
    fn test_sudo_flags() {
        let mut args = ConnectorArguments::default();
        args.sudo = true;
        args.sudo_user = Some("postgres".to_string());
        args.use_sudo_login = true;
        args.preserve_sudo_env = true;
        assert_eq!(render(&args), "sudo -H -n -i -E -u postgres sh -c whoami");
    }

    #[test]
    fn test_su_and_doas() {
        let mut args = ConnectorArguments::default();
        args.su_user = Some("app".to_string());
        args.use_su_login = true;
        assert_eq!(render(&args), "su -l app -c 'sh -c whoami'");

        let mut args = ConnectorArguments::default();
        args.doas = true;
        args.doas_user = Some("root".to_string());
        assert_eq!(render(&args), "doas -n -u root sh -c whoami");
    }

    #[test]
    fn test_askpass_invocation_is_masked_and_self_cleaning() {
        let mut args = ConnectorArguments::default();
        args.sudo = true;
        args.sudo_password = Some(Secret::new("pa ss"));
        let command = make_unix_command(&StringCommand::from("whoami"), &args);

        let raw = command.raw_value();
        let masked = command.masked_value();
        assert!(raw.contains("RSINFRA_SUDO_PASSWORD='pa ss'"));
        assert!(raw.contains("sudo -H -A -k sh -c whoami"));
        assert!(raw.starts_with("_askpass=$(mktemp"));
        assert!(raw.ends_with(r#"rm -f "$_askpass"; exit $_rc"#));
        assert!(!masked.contains("pa ss"));
        assert!(masked.contains("***"));
    }

    #[test]
    fn test_needs_sudo_password() {
        let lines = vec![OutputLine {
            stream: OutputStream::Stderr,
            line: SUDO_PASSWORD_REQUIRED.to_string(),
        }];
        assert!(needs_sudo_password(false, &lines));
        assert!(!needs_sudo_password(true, &lines));
        assert!(!needs_sudo_password(false, &[]));
    }

    #[test]
    fn test_read_buffers_orders_lines() {
        let stdout = std::io::Cursor::new(b"one\ntwo\n".to_vec());
        let stderr = std::io::Cursor::new(b"err\n".to_vec());
        let lines = read_buffers_into_queue(stdout, stderr, Some(Duration::from_secs(5))).unwrap();
        let stdout_lines: Vec<_> = lines
            .iter()
            .filter(|l| l.stream == OutputStream::Stdout)
            .map(|l| l.line.as_str())
            .collect();
        assert_eq!(stdout_lines, vec!["one", "two"]);
        assert_eq!(lines.len(), 3);
    }

    #[test]
    fn test_line_splitter() {
        let mut splitter = LineSplitter::new();
        assert!(splitter.push(b"par").is_empty());
        assert_eq!(splitter.push(b"tial\nnext\r\nta"), vec!["partial", "next"]);
        assert_eq!(splitter.finish().as_deref(), Some("ta"));
        assert!(splitter.finish().is_none());
    }
}
