use crate::command::StringCommand;
use crate::connector::ssh::client::SshConnector;
use crate::connector::ssh::hash::FileHashInfo;
use crate::connector::Connector;
use crate::error::InfraError;
use crate::types::{ConnectorArguments, FileSource};
use crate::Result;
use ssh2::Sftp;
use std::io::{Read, Write};
use std::path::Path;
use tracing::{debug, info, warn};

impl SshConnector {
    /// 复用已创建的 SFTP 会话
    fn sftp(&mut self) -> Result<&Sftp> {
        if self.sftp.is_none() {
            let sftp = self.session()?.sftp()?;
            self.sftp = Some(sftp);
        }
        self.sftp
            .as_ref()
            .ok_or_else(|| InfraError::FileOperationError("SFTP session unavailable".to_string()))
    }

    /// 通过 SFTP 上传，并在传输后校验 sha256
    pub(super) fn upload_verified(&mut self, src: &FileSource, dest: &str) -> Result<()> {
        let data = src.read_bytes().map_err(|e| {
            InfraError::FileOperationError(format!("Failed to read {}: {}", src, e))
        })?;
        let local_hash = FileHashInfo::of_bytes(&data);
        debug!(
            "Uploading {} to {}:{} (sha256 {})",
            src, self.settings.host_name, dest, local_hash.hash
        );

        {
            let sftp = self.sftp()?;
            let mut remote_file = sftp.create(Path::new(dest)).map_err(|e| {
                InfraError::FileOperationError(format!("Failed to create remote file {}: {}", dest, e))
            })?;
            remote_file.write_all(&data).map_err(|e| {
                InfraError::FileOperationError(format!("Failed to transfer file: {}", e))
            })?;
        }

        match self.get_remote_file_hash(dest)? {
            Some(remote_hash) if remote_hash == local_hash => {
                info!(
                    "Transfer verified on {}: {} ({} bytes)",
                    self.settings.host_name, dest, remote_hash.size
                );
                Ok(())
            }
            Some(remote_hash) => {
                let remove = StringCommand::new().raw("rm").raw("-f").quote(dest);
                let _ = self.run_shell_command(&remove, &ConnectorArguments::default());
                Err(InfraError::FileOperationError(format!(
                    "File transfer verification failed for {}: local sha256 {} ({} bytes), remote sha256 {} ({} bytes)",
                    dest, local_hash.hash, local_hash.size, remote_hash.hash, remote_hash.size
                )))
            }
            None => {
                warn!(
                    "Could not verify upload of {} on {}, no sha256 tool available",
                    dest, self.settings.host_name
                );
                Ok(())
            }
        }
    }

    /// 通过 SFTP 下载到本地
    pub(super) fn download_file(&mut self, src: &str, dest: &Path) -> Result<()> {
        let mut data = Vec::new();
        {
            let sftp = self.sftp()?;
            let mut remote_file = sftp.open(Path::new(src)).map_err(|e| {
                InfraError::FileOperationError(format!("Failed to open remote file {}: {}", src, e))
            })?;
            remote_file.read_to_end(&mut data).map_err(|e| {
                InfraError::FileOperationError(format!("Failed to transfer file: {}", e))
            })?;
        }

        std::fs::write(dest, &data).map_err(|e| {
            InfraError::FileOperationError(format!(
                "Failed to create local file {}: {}",
                dest.display(),
                e
            ))
        })?;

        info!(
            "File {} copied from {} to {} ({} bytes)",
            src,
            self.settings.host_name,
            dest.display(),
            data.len()
        );
        Ok(())
    }
}
