use crate::command::StringCommand;
use crate::connector::ssh::client::SshConnector;
use crate::connector::Connector;
use crate::error::InfraError;
use crate::types::ConnectorArguments;
use crate::Result;
use sha2::{Digest, Sha256};

/// 文件摘要与大小
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileHashInfo {
    pub hash: String,
    pub size: u64,
}

impl FileHashInfo {
    pub fn of_bytes(data: &[u8]) -> Self {
        let mut hasher = Sha256::new();
        hasher.update(data);
        Self {
            hash: format!("{:x}", hasher.finalize()),
            size: data.len() as u64,
        }
    }
}

impl SshConnector {
    /// 获取远程文件的 sha256。远程没有可用的工具时返回 None
    pub(super) fn get_remote_file_hash(&mut self, remote_path: &str) -> Result<Option<FileHashInfo>> {
        let command = StringCommand::new()
            .raw("(sha256sum")
            .quote(remote_path)
            .raw("2>/dev/null || shasum -a 256")
            .quote(remote_path)
            .raw(") && (stat -c %s")
            .quote(remote_path)
            .raw("2>/dev/null || stat -f %z")
            .quote(remote_path)
            .raw(")");
        let (ok, output) = self.run_shell_command(&command, &ConnectorArguments::default())?;
        if !ok {
            return Ok(None);
        }

        let stdout = output.stdout_lines();
        let hash = stdout
            .first()
            .and_then(|line| line.split_whitespace().next())
            .ok_or_else(|| InfraError::FileOperationError("Failed to parse hash output".to_string()))?
            .to_string();
        let size = stdout
            .get(1)
            .and_then(|line| line.trim().parse().ok())
            .ok_or_else(|| {
                InfraError::FileOperationError("Failed to parse file size".to_string())
            })?;

        Ok(Some(FileHashInfo { hash, size }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_hash_of_bytes() {
        let info = FileHashInfo::of_bytes(b"hello");
        assert_eq!(
            info.hash,
            "2cf24dba5fb0a30e26e83b2ac5b9e29e1b161e5c1fa7425e73043362938b9824"
        );
        assert_eq!(info.size, 5);
    }
}
