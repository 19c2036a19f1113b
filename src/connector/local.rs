use crate::command::StringCommand;
use crate::config::Config;
use crate::connector::util::{make_unix_command, read_buffers_into_queue};
use crate::connector::{check_sudo_password, Connector, ConnectorKind, HostEntry};
use crate::error::InfraError;
use crate::types::{CommandOutput, ConnectorArguments, FileSource};
use crate::utils::generate_local_temp_path;
use crate::Result;
use serde_json::{Map, Value};
use std::io::Write;
use std::path::Path;
use std::process::Stdio;
use std::time::Duration;
use tracing::debug;

pub const LOCAL_HOST_NAME: &str = "@local";

/// 通过子进程在本机执行
#[derive(Debug, Clone)]
pub struct LocalConnector {
    temp_dir: String,
}

impl LocalConnector {
    pub fn new(temp_dir: impl Into<String>) -> Self {
        Self {
            temp_dir: temp_dir.into(),
        }
    }

    fn run_process(
        &self,
        command: &StringCommand,
        args: &ConnectorArguments,
    ) -> Result<(bool, CommandOutput)> {
        let wrapped = make_unix_command(command, args);
        debug!("--> Running command on localhost: {}", wrapped);

        let mut child = std::process::Command::new("sh")
            .arg("-c")
            .arg(wrapped.raw_value())
            .stdin(if args.stdin.is_some() {
                Stdio::piped()
            } else {
                Stdio::null()
            })
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|e| InfraError::CommandIoError(format!("Failed to spawn process: {}", e)))?;

        if let (Some(input), Some(mut stdin)) = (&args.stdin, child.stdin.take()) {
            stdin
                .write_all(input.as_bytes())
                .map_err(|e| InfraError::CommandIoError(format!("Failed to write stdin: {}", e)))?;
        }

        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| InfraError::CommandIoError("Missing stdout pipe".to_string()))?;
        let stderr = child
            .stderr
            .take()
            .ok_or_else(|| InfraError::CommandIoError("Missing stderr pipe".to_string()))?;

        let timeout = args.timeout.map(Duration::from_secs);
        let lines = match read_buffers_into_queue(stdout, stderr, timeout) {
            Ok(lines) => lines,
            Err(_) => {
                let _ = child.kill();
                let _ = child.wait();
                return Err(InfraError::CommandTimeout {
                    host: LOCAL_HOST_NAME.to_string(),
                    timeout: args.timeout.unwrap_or_default(),
                });
            }
        };

        let status = child
            .wait()
            .map_err(|e| InfraError::CommandIoError(format!("Failed to wait for process: {}", e)))?;
        let exit_code = status.code().unwrap_or(-1);
        debug!("--> Command exit status: {}", exit_code);

        Ok((
            args.is_success(exit_code),
            CommandOutput::new(lines, Some(exit_code)),
        ))
    }
}

impl Connector for LocalConnector {
    fn connect(&mut self) -> Result<()> {
        Ok(())
    }

    fn run_shell_command(
        &mut self,
        command: &StringCommand,
        args: &ConnectorArguments,
    ) -> Result<(bool, CommandOutput)> {
        self.run_process(command, args)
    }

    fn upload(&mut self, src: &FileSource, dest: &str) -> Result<()> {
        let data = src.read_bytes().map_err(|e| {
            InfraError::FileOperationError(format!("Failed to read {}: {}", src, e))
        })?;
        std::fs::write(dest, data).map_err(|e| {
            InfraError::FileOperationError(format!("Failed to write {}: {}", dest, e))
        })
    }

    fn download(&mut self, src: &str, dest: &Path) -> Result<()> {
        std::fs::copy(src, dest).map(|_| ()).map_err(|e| {
            InfraError::FileOperationError(format!(
                "Failed to copy {} to {}: {}",
                src,
                dest.display(),
                e
            ))
        })
    }

    fn temp_dir(&self) -> &str {
        &self.temp_dir
    }

    // 统一通过 `cp` 复制，这样 sudo/su 同样生效
    fn put_file(
        &mut self,
        src: &FileSource,
        dest: &str,
        args: &ConnectorArguments,
    ) -> Result<bool> {
        let temp = generate_local_temp_path("rsinfra_put");
        let outcome = (|| -> Result<bool> {
            self.upload(src, &temp)?;
            let copy = StringCommand::new().raw("cp").quote(&temp).quote(dest);
            let (ok, output) = self.run_process(&copy, args)?;
            check_sudo_password(args, ok, &output)?;
            if !ok {
                return Err(InfraError::FileOperationError(output.stderr()));
            }
            Ok(true)
        })();
        let _ = std::fs::remove_file(&temp);
        outcome
    }

    fn get_file(&mut self, src: &str, dest: &Path, args: &ConnectorArguments) -> Result<bool> {
        let temp = generate_local_temp_path("rsinfra_get");
        let outcome = (|| -> Result<bool> {
            // 先以当前用户创建，cp 覆盖内容时保留属主
            std::fs::File::create(&temp).map_err(|e| {
                InfraError::FileOperationError(format!("Failed to create {}: {}", temp, e))
            })?;
            let copy = StringCommand::new().raw("cp").quote(src).quote(&temp);
            let (ok, output) = self.run_process(&copy, args)?;
            check_sudo_password(args, ok, &output)?;
            if !ok {
                return Err(InfraError::FileOperationError(output.stderr()));
            }
            self.download(&temp, dest)?;
            Ok(true)
        })();
        let _ = std::fs::remove_file(&temp);
        outcome
    }

    fn check_can_rsync(&self) -> Result<()> {
        let found = std::env::var_os("PATH")
            .map(|paths| std::env::split_paths(&paths).any(|dir| dir.join("rsync").is_file()))
            .unwrap_or(false);
        if found {
            Ok(())
        } else {
            Err(InfraError::NotSupported(
                "The `rsync` binary is not available on this system".to_string(),
            ))
        }
    }

    fn rsync(
        &mut self,
        src: &str,
        dest: &str,
        flags: &[String],
        args: &ConnectorArguments,
    ) -> Result<(bool, CommandOutput)> {
        let mut command = StringCommand::new().raw("rsync");
        for flag in flags {
            command = command.raw(flag.as_str());
        }
        command = command.quote(src).quote(dest);
        self.run_process(&command, args)
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct LocalConnectorKind;

impl ConnectorKind for LocalConnectorKind {
    fn name(&self) -> &str {
        "local"
    }

    fn make_names_data(&self, selector: Option<&str>) -> Result<Vec<HostEntry>> {
        if selector.is_some() {
            return Err(InfraError::InventoryError(
                "Cannot have more than one @local".to_string(),
            ));
        }
        let mut entry = HostEntry::new(LOCAL_HOST_NAME);
        entry.groups.push(LOCAL_HOST_NAME.to_string());
        Ok(vec![entry])
    }

    fn build(
        &self,
        _host_name: &str,
        _data: &Map<String, Value>,
        config: &Config,
    ) -> Result<Box<dyn Connector>> {
        Ok(Box::new(LocalConnector::new(config.temp_dir.clone())))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::OutputStream;

    #[test]
    fn test_make_names_data() {
        let entries = LocalConnectorKind.make_names_data(None).unwrap();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].name, "@local");
        assert!(LocalConnectorKind.make_names_data(Some("other")).is_err());
    }

    #[test]
    fn test_run_shell_command_captures_streams() {
        let mut connector = LocalConnector::new("/tmp");
        let command = StringCommand::from("echo out; echo err 1>&2; exit 3");
        let mut args = ConnectorArguments::default();

        let (ok, output) = connector.run_shell_command(&command, &args).unwrap();
        assert!(!ok);
        assert_eq!(output.exit_code, Some(3));
        assert_eq!(output.stdout_lines(), vec!["out"]);
        assert_eq!(output.stderr_lines(), vec!["err"]);

        args.success_exit_codes = vec![3];
        let (ok, _) = connector.run_shell_command(&command, &args).unwrap();
        assert!(ok);
    }

    #[test]
    fn test_env_and_stdin() {
        let mut connector = LocalConnector::new("/tmp");
        let mut args = ConnectorArguments::default();
        args.env.insert("GREETING".to_string(), "hello there".to_string());
        args.stdin = Some("piped\n".to_string());

        let (ok, output) = connector
            .run_shell_command(&StringCommand::from("echo $GREETING; cat"), &args)
            .unwrap();
        assert!(ok);
        assert_eq!(output.stdout_lines(), vec!["hello there", "piped"]);
        assert!(output.lines.iter().all(|l| l.stream == OutputStream::Stdout));
    }

    #[test]
    fn test_timeout_kills_command() {
        let mut connector = LocalConnector::new("/tmp");
        let mut args = ConnectorArguments::default();
        args.timeout = Some(1);

        let result = connector.run_shell_command(&StringCommand::from("exec sleep 5"), &args);
        match result {
            Err(InfraError::CommandTimeout { timeout, .. }) => assert_eq!(timeout, 1),
            other => panic!("expected timeout, got {:?}", other),
        }
    }

    #[test]
    fn test_put_and_get_file() {
        let dir = tempfile::tempdir().unwrap();
        let dest = dir.path().join("uploaded.txt");
        let fetched = dir.path().join("fetched.txt");
        let mut connector = LocalConnector::new("/tmp");
        let args = ConnectorArguments::default();

        let ok = connector
            .put_file(
                &FileSource::Bytes(b"payload".to_vec()),
                dest.to_str().unwrap(),
                &args,
            )
            .unwrap();
        assert!(ok);
        assert_eq!(std::fs::read(&dest).unwrap(), b"payload");

        let ok = connector
            .get_file(dest.to_str().unwrap(), &fetched, &args)
            .unwrap();
        assert!(ok);
        assert_eq!(std::fs::read(&fetched).unwrap(), b"payload");
    }
}
