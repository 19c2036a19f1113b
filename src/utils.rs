use sha2::{Digest, Sha256};

/// 生成唯一的临时文件后缀
///
/// 使用纳秒级时间戳 + 随机数，确保在高并发场景下不会产生文件名冲突。
pub fn generate_temp_suffix() -> String {
    let now = chrono::Utc::now();
    let timestamp = now.timestamp();
    let nanos = now.timestamp_subsec_nanos();
    let random_suffix: u32 = rand::random();

    format!("{}.{}.{}", timestamp, nanos, random_suffix)
}

/// 生成本地临时文件路径
///
/// 返回类似: "/tmp/rs_infra_get_1732492800.123456789.987654321.tmp"
pub fn generate_local_temp_path(prefix: &str) -> String {
    let dir = std::env::temp_dir();
    format!(
        "{}/{}_{}.tmp",
        dir.display().to_string().trim_end_matches('/'),
        prefix,
        generate_temp_suffix()
    )
}

/// 在远程临时目录下生成文件路径
///
/// `hash_key` 给定时路径是确定的（同一内容得到同一路径），否则使用唯一后缀
pub fn generate_remote_temp_path(temp_dir: &str, hash_key: Option<&str>) -> String {
    let name = match hash_key {
        Some(key) => format!("rsinfra-{}", &make_hash(key)[..16]),
        None => format!("rsinfra-{}", generate_temp_suffix()),
    };
    format!("{}/{}", temp_dir.trim_end_matches('/'), name)
}

/// sha256 十六进制摘要
pub fn make_hash(value: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(value.as_bytes());
    format!("{:x}", hasher.finalize())
}

fn is_safe_shell_char(c: char) -> bool {
    c.is_ascii_alphanumeric() || "@%+=:,./-_".contains(c)
}

/// POSIX shell 单引号转义
pub fn quote(value: &str) -> String {
    if value.is_empty() {
        return "''".to_string();
    }
    if value.chars().all(is_safe_shell_char) {
        return value.to_string();
    }
    format!("'{}'", value.replace('\'', "'\"'\"'"))
}

/// 根据文件描述符上限推算的最大并发数：每台主机预留 3 个，再留 10 个给自身
pub fn max_parallel() -> Option<usize> {
    #[cfg(unix)]
    {
        let mut limit = libc::rlimit {
            rlim_cur: 0,
            rlim_max: 0,
        };
        // SAFETY: getrlimit 只写入传入的结构体
        let rc = unsafe { libc::getrlimit(libc::RLIMIT_NOFILE, &mut limit) };
        if rc == 0 {
            let soft = limit.rlim_cur as u64;
            return Some((soft.saturating_sub(10) / 3).max(1) as usize);
        }
        None
    }
    #[cfg(not(unix))]
    {
        None
    }
}

/// 未显式配置时的默认并发数
pub fn default_parallel(host_count: usize) -> usize {
    let cpus = std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(1);
    let mut parallel = (cpus * 20).min(host_count);
    if let Some(max) = max_parallel() {
        parallel = parallel.min(max);
    }
    parallel.max(1)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    #[test]
    fn test_temp_suffix_uniqueness() {
        let mut suffixes = HashSet::new();

        for _ in 0..1000 {
            let suffix = generate_temp_suffix();
            assert!(
                suffixes.insert(suffix.clone()),
                "Generated duplicate suffix: {}",
                suffix
            );
        }
    }

    #[test]
    fn test_local_temp_path_format() {
        let path = generate_local_temp_path("test_prefix");
        assert!(path.contains("/test_prefix_"));
        assert!(path.ends_with(".tmp"));
    }

    #[test]
    fn test_remote_temp_path_is_stable_for_key() {
        let a = generate_remote_temp_path("/tmp/", Some("/etc/hosts"));
        let b = generate_remote_temp_path("/tmp", Some("/etc/hosts"));
        assert_eq!(a, b);
        assert!(a.starts_with("/tmp/rsinfra-"));
        assert_ne!(
            generate_remote_temp_path("/tmp", None),
            generate_remote_temp_path("/tmp", None)
        );
    }

    #[test]
    fn test_quote() {
        assert_eq!(quote("plain/path-1.txt"), "plain/path-1.txt");
        assert_eq!(quote(""), "''");
        assert_eq!(quote("hello world"), "'hello world'");
        assert_eq!(quote("it's"), "'it'\"'\"'s'");
        assert_eq!(quote("$HOME"), "'$HOME'");
    }

    #[test]
    fn test_default_parallel_bounds() {
        assert_eq!(default_parallel(1), 1);
        assert!(default_parallel(0) >= 1);
        assert!(default_parallel(10_000) >= 1);
    }
}
