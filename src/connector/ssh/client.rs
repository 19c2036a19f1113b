use super::{HostKeyPolicy, SshSettings};
use crate::command::StringCommand;
use crate::connector::local::LocalConnector;
use crate::connector::util::{make_unix_command, LineSplitter};
use crate::connector::Connector;
use crate::error::{ConnectErrorKind, InfraError};
use crate::types::{CommandOutput, ConnectorArguments, FileSource, OutputLine, OutputStream};
use crate::utils::quote;
use crate::Result;
use ssh2::{CheckResult, Channel, KnownHostFileKind, Session, Sftp};
use std::io::{ErrorKind, Read, Write};
use std::net::{TcpStream, ToSocketAddrs};
use std::path::Path;
use std::thread;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

/// 单台主机的 SSH 连接
pub struct SshConnector {
    pub(super) settings: SshSettings,
    pub(super) session: Option<Session>,
    pub(super) sftp: Option<Sftp>,
}

/// 提权时远端执行的 rsync 命令
fn remote_rsync_path(args: &ConnectorArguments) -> Option<String> {
    if !args.sudo {
        return None;
    }
    Some(match &args.sudo_user {
        Some(user) => format!("sudo -u {} rsync", quote(user)),
        None => "sudo rsync".to_string(),
    })
}

impl SshConnector {
    pub fn new(settings: SshSettings) -> Self {
        Self {
            settings,
            session: None,
            sftp: None,
        }
    }

    pub fn settings(&self) -> &SshSettings {
        &self.settings
    }

    fn connect_error(&self, kind: ConnectErrorKind, message: impl std::fmt::Display) -> InfraError {
        InfraError::connect(&self.settings.host_name, kind, message)
    }

    pub(super) fn session(&self) -> Result<&Session> {
        self.session.as_ref().ok_or_else(|| {
            InfraError::CommandIoError(format!("{} is not connected", self.settings.host_name))
        })
    }

    /// 执行单次连接尝试
    fn connect_once(&self) -> Result<Session> {
        let settings = &self.settings;
        let address = (settings.hostname.as_str(), settings.port)
            .to_socket_addrs()
            .map_err(|e| self.connect_error(ConnectErrorKind::Dns, e))?
            .next()
            .ok_or_else(|| self.connect_error(ConnectErrorKind::Dns, &settings.hostname))?;

        let timeout = Duration::from_secs(settings.connect_timeout.max(1));
        let tcp = TcpStream::connect_timeout(&address, timeout).map_err(|e| {
            let kind = match e.kind() {
                ErrorKind::TimedOut | ErrorKind::WouldBlock => ConnectErrorKind::Timeout,
                ErrorKind::ConnectionRefused => ConnectErrorKind::Refused,
                _ => ConnectErrorKind::Other,
            };
            self.connect_error(kind, e)
        })?;

        // 禁用 Nagle 算法，减少小包延迟
        if let Err(e) = tcp.set_nodelay(true) {
            warn!("Failed to set TCP_NODELAY: {}", e);
        }

        let mut session =
            Session::new().map_err(|e| self.connect_error(ConnectErrorKind::Other, e))?;
        session.set_tcp_stream(tcp);
        session.set_timeout((settings.connect_timeout.max(1) * 1000) as u32);

        session.handshake().map_err(|e| {
            self.connect_error(ConnectErrorKind::Other, format!("SSH handshake failed: {}", e))
        })?;

        self.verify_host_key(&session)?;
        self.authenticate(&session)?;

        info!("Successfully connected to {}", settings.hostname);
        Ok(session)
    }

    fn verify_host_key(&self, session: &Session) -> Result<()> {
        let settings = &self.settings;
        if settings.host_key_policy == HostKeyPolicy::Off {
            return Ok(());
        }
        let Some(path) = settings.known_hosts_file.as_ref() else {
            return Ok(());
        };

        let mut known_hosts = session
            .known_hosts()
            .map_err(|e| self.connect_error(ConnectErrorKind::Other, e))?;
        if path.exists() {
            known_hosts
                .read_file(path, KnownHostFileKind::OpenSSH)
                .map_err(|e| self.connect_error(ConnectErrorKind::Other, e))?;
        }

        let (key, key_type) = session
            .host_key()
            .ok_or_else(|| self.connect_error(ConnectErrorKind::Other, "no host key"))?;

        match known_hosts.check_port(&settings.hostname, settings.port, key) {
            CheckResult::Match => Ok(()),
            CheckResult::Mismatch => Err(self.connect_error(
                ConnectErrorKind::HostKeyMismatch,
                format!("host key for {} does not match {}", settings.hostname, path.display()),
            )),
            CheckResult::NotFound if settings.host_key_policy == HostKeyPolicy::Strict => {
                Err(self.connect_error(
                    ConnectErrorKind::HostKeyMismatch,
                    format!("no host key for {} in {}", settings.hostname, path.display()),
                ))
            }
            CheckResult::NotFound => {
                warn!(
                    "Adding new host key for {} to {}",
                    settings.hostname,
                    path.display()
                );
                known_hosts
                    .add(&settings.known_hosts_name(), key, "", key_type.into())
                    .and_then(|_| known_hosts.write_file(path, KnownHostFileKind::OpenSSH))
                    .map_err(|e| self.connect_error(ConnectErrorKind::Other, e))
            }
            CheckResult::Failure => Err(self.connect_error(
                ConnectErrorKind::Other,
                "failed to check known hosts",
            )),
        }
    }

    fn authenticate(&self, session: &Session) -> Result<()> {
        let settings = &self.settings;
        let auth_error = |e: ssh2::Error| self.connect_error(ConnectErrorKind::Authentication, e);

        if let Some(key) = &settings.key {
            session
                .userauth_pubkey_file(&settings.user, None, key, settings.key_password.as_deref())
                .map_err(auth_error)?;
        } else if let Some(password) = &settings.password {
            session
                .userauth_password(&settings.user, password)
                .map_err(auth_error)?;
        } else {
            session.userauth_agent(&settings.user).map_err(auth_error)?;
        }

        if !session.authenticated() {
            return Err(self.connect_error(
                ConnectErrorKind::Authentication,
                format!("authentication failed for user {}", settings.user),
            ));
        }
        Ok(())
    }

    /// 非阻塞地轮流读取 stdout/stderr，超过期限即关闭通道
    fn read_channel(&self, channel: &mut Channel, timeout: Option<u64>) -> Result<Vec<OutputLine>> {
        let deadline = timeout.map(|t| Instant::now() + Duration::from_secs(t));
        let mut stdout_lines = LineSplitter::new();
        let mut stderr_lines = LineSplitter::new();
        let mut lines = Vec::new();
        let mut buffer = [0u8; 8192];

        loop {
            let mut progressed = false;

            match channel.read(&mut buffer) {
                Ok(0) => {}
                Ok(n) => {
                    progressed = true;
                    for line in stdout_lines.push(&buffer[..n]) {
                        lines.push(OutputLine { stream: OutputStream::Stdout, line });
                    }
                }
                Err(e) if e.kind() == ErrorKind::WouldBlock => {}
                Err(e) => return Err(InfraError::CommandIoError(e.to_string())),
            }

            match channel.stderr().read(&mut buffer) {
                Ok(0) => {}
                Ok(n) => {
                    progressed = true;
                    for line in stderr_lines.push(&buffer[..n]) {
                        lines.push(OutputLine { stream: OutputStream::Stderr, line });
                    }
                }
                Err(e) if e.kind() == ErrorKind::WouldBlock => {}
                Err(e) => return Err(InfraError::CommandIoError(e.to_string())),
            }

            if !progressed && channel.eof() {
                break;
            }

            if let Some(deadline) = deadline
                && Instant::now() >= deadline
            {
                let _ = channel.close();
                return Err(InfraError::CommandTimeout {
                    host: self.settings.host_name.clone(),
                    timeout: timeout.unwrap_or_default(),
                });
            }

            if !progressed {
                thread::sleep(Duration::from_millis(10));
            }
        }

        if let Some(line) = stdout_lines.finish() {
            lines.push(OutputLine { stream: OutputStream::Stdout, line });
        }
        if let Some(line) = stderr_lines.finish() {
            lines.push(OutputLine { stream: OutputStream::Stderr, line });
        }
        Ok(lines)
    }

    fn ssh_command_for_rsync(&self) -> String {
        let settings = &self.settings;
        let mut ssh = vec!["ssh".to_string(), "-p".to_string(), settings.port.to_string()];
        if let Some(key) = &settings.key {
            ssh.push("-i".to_string());
            ssh.push(quote(&key.display().to_string()));
        }
        match settings.host_key_policy {
            HostKeyPolicy::Strict => ssh.push("-o StrictHostKeyChecking=yes".to_string()),
            HostKeyPolicy::AcceptNew => ssh.push("-o StrictHostKeyChecking=accept-new".to_string()),
            HostKeyPolicy::Off => ssh.push("-o StrictHostKeyChecking=no".to_string()),
        }
        ssh.join(" ")
    }
}

impl Connector for SshConnector {
    /// 建立 SSH 连接（带重试机制）
    fn connect(&mut self) -> Result<()> {
        if self.session.is_some() {
            return Ok(());
        }

        let max_retries = self.settings.connect_retries.max(1);
        let retry_delay = Duration::from_millis(1000);
        let mut last_error = None;

        for attempt in 1..=max_retries {
            if attempt > 1 {
                info!(
                    "Retrying SSH connection to {}:{} (Attempt {}/{})",
                    self.settings.hostname, self.settings.port, attempt, max_retries
                );
                thread::sleep(retry_delay * (attempt - 1));
            }

            match self.connect_once() {
                Ok(session) => {
                    self.session = Some(session);
                    return Ok(());
                }
                Err(e) => {
                    warn!(
                        "SSH connection failed for {}:{}: {}",
                        self.settings.hostname, self.settings.port, e
                    );
                    // 认证失败和主机密钥不匹配不会因重试而改变
                    let retryable = !matches!(
                        e,
                        InfraError::ConnectError {
                            kind: ConnectErrorKind::Authentication
                                | ConnectErrorKind::HostKeyMismatch
                                | ConnectErrorKind::Dns,
                            ..
                        }
                    );
                    last_error = Some(e);
                    if !retryable {
                        break;
                    }
                }
            }
        }

        Err(last_error.unwrap_or_else(|| {
            self.connect_error(ConnectErrorKind::Other, "failed to connect after retries")
        }))
    }

    fn disconnect(&mut self) -> Result<()> {
        self.sftp = None;
        if let Some(session) = self.session.take() {
            session.disconnect(None, "disconnecting", None)?;
            debug!("Disconnected from {}", self.settings.hostname);
        }
        Ok(())
    }

    fn run_shell_command(
        &mut self,
        command: &StringCommand,
        args: &ConnectorArguments,
    ) -> Result<(bool, CommandOutput)> {
        let wrapped = make_unix_command(command, args);
        debug!("Running command on {}: {}", self.settings.host_name, wrapped);

        let session = self.session()?.clone();
        let mut channel = session.channel_session()?;
        if args.get_pty {
            channel.request_pty("xterm", None, None)?;
        }
        channel.exec(&wrapped.raw_value())?;

        if let Some(stdin) = &args.stdin {
            channel
                .write_all(stdin.as_bytes())
                .map_err(|e| InfraError::CommandIoError(format!("Failed to write stdin: {}", e)))?;
        }
        channel.send_eof()?;

        session.set_blocking(false);
        let lines = self.read_channel(&mut channel, args.timeout);
        session.set_blocking(true);
        let lines = lines?;

        channel.wait_close()?;
        let exit_code = channel.exit_status()?;
        debug!(
            "Command on {} exited with code {}",
            self.settings.host_name, exit_code
        );

        Ok((
            args.is_success(exit_code),
            CommandOutput::new(lines, Some(exit_code)),
        ))
    }

    fn upload(&mut self, src: &FileSource, dest: &str) -> Result<()> {
        self.upload_verified(src, dest)
    }

    fn download(&mut self, src: &str, dest: &Path) -> Result<()> {
        self.download_file(src, dest)
    }

    fn temp_dir(&self) -> &str {
        &self.settings.temp_dir
    }

    fn check_can_rsync(&self) -> Result<()> {
        if self.settings.password.is_some() {
            return Err(InfraError::NotSupported(
                "rsync does not support password authentication".to_string(),
            ));
        }
        LocalConnector::new(self.settings.temp_dir.clone()).check_can_rsync()
    }

    fn rsync(
        &mut self,
        src: &str,
        dest: &str,
        flags: &[String],
        args: &ConnectorArguments,
    ) -> Result<(bool, CommandOutput)> {
        let mut command = StringCommand::new()
            .raw("rsync")
            .raw("-e")
            .quote(self.ssh_command_for_rsync());
        for flag in flags {
            command = command.raw(flag.as_str());
        }
        if let Some(remote_rsync) = remote_rsync_path(args) {
            command = command.raw("--rsync-path").quote(remote_rsync);
        }
        command = command.quote(src).quote(format!(
            "{}@{}:{}",
            self.settings.user, self.settings.hostname, dest
        ));

        // rsync 在本机执行，只保留超时与环境变量
        let local_args = ConnectorArguments {
            timeout: args.timeout,
            env: args.env.clone(),
            ..ConnectorArguments::default()
        };
        LocalConnector::new(self.settings.temp_dir.clone()).run_shell_command(&command, &local_args)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_remote_rsync_path_quotes_user() {
        let mut args = ConnectorArguments::default();
        assert_eq!(remote_rsync_path(&args), None);

        args.sudo = true;
        assert_eq!(remote_rsync_path(&args).as_deref(), Some("sudo rsync"));

        args.sudo_user = Some("deploy".to_string());
        assert_eq!(remote_rsync_path(&args).as_deref(), Some("sudo -u deploy rsync"));

        args.sudo_user = Some("app; rm -rf /".to_string());
        assert_eq!(
            remote_rsync_path(&args).as_deref(),
            Some("sudo -u 'app; rm -rf /' rsync")
        );
    }
}
