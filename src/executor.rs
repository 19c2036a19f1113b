use crate::command::StringCommand;
use crate::error::InfraError;
use crate::host::{lock_host, Host, SharedHost};
use crate::operation::OpOutcome;
use crate::state::{HostOp, OpMeta, State};
use crate::types::{CommandOutput, HostResults, OpResultKind};
use crate::Result;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::Semaphore;
use tokio::task::{self, JoinSet};
use tracing::{debug, error, info, warn};

/// 执行策略，一次运行只选一种
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStrategy {
    /// 逐个操作在所有主机上执行，每个操作结束后汇合
    #[default]
    PerOperation,
    /// 逐台主机执行完整的操作序列
    Serial,
    /// 每台主机独立执行完整序列，不等待其他主机
    NoWait,
}

/// 运行结束后的汇总
#[derive(Debug, Clone, Default, Serialize)]
pub struct RunSummary {
    pub ops: usize,
    pub hosts: BTreeMap<String, HostResults>,
    pub failed_hosts: Vec<String>,
}

impl RunSummary {
    pub fn is_success(&self) -> bool {
        self.failed_hosts.is_empty()
            && self
                .hosts
                .values()
                .all(|results| results.error_ops == results.ignored_error_ops)
    }
}

/// 单台主机执行一个操作的结果
#[derive(Debug, Clone)]
struct HostOpResult {
    host: String,
    hash: String,
    kind: OpResultKind,
    commands: usize,
}

fn run_check(host: &mut Host, label: &str, command: &str, op: &HostOp) -> bool {
    let command = StringCommand::from(command);
    match host.run_shell_command(&command, &op.args.connector) {
        Ok((true, _)) => true,
        Ok((false, output)) => {
            warn!("[{}] {} failed: {}", host.name, label, output.stderr());
            false
        }
        Err(e) => {
            warn!("[{}] {} failed: {}", host.name, label, e);
            false
        }
    }
}

/// 在一台主机上执行一个操作的全部命令并分类结果
fn run_host_op(host: &mut Host, hash: &str, op: &HostOp) -> HostOpResult {
    if op.commands.is_empty() && op.args.execution.run_once {
        op.meta.set_outcome(OpOutcome {
            success: true,
            output: CommandOutput::default(),
        });
        return HostOpResult {
            host: host.name.clone(),
            hash: hash.to_string(),
            kind: OpResultKind::Skipped,
            commands: 0,
        };
    }

    let mut failed = false;
    let mut succeeded = 0;
    let mut executed = 0;
    let mut output = CommandOutput::default();

    if let Some(precondition) = &op.args.precondition {
        failed = !run_check(host, "Precondition", precondition, op);
    }

    if !failed {
        for command in &op.commands {
            executed += 1;
            debug!("[{}] Running command: {}", host.name, command);
            match command.execute(host, &op.args.connector) {
                Ok((true, command_output)) => {
                    succeeded += 1;
                    output.lines.extend(command_output.lines);
                    output.exit_code = command_output.exit_code;
                }
                Ok((false, command_output)) => {
                    error!(
                        "[{}] Command failed: {} {}",
                        host.name,
                        command,
                        command_output.stderr()
                    );
                    output.lines.extend(command_output.lines);
                    output.exit_code = command_output.exit_code;
                    failed = true;
                }
                Err(e) => {
                    error!("[{}] Command error: {} ({})", host.name, command, e);
                    failed = true;
                }
            }
            if failed && !op.args.continue_on_error {
                break;
            }
        }
    }

    if !failed {
        if let Some(postcondition) = &op.args.postcondition {
            failed = !run_check(host, "Postcondition", postcondition, op);
        }
    }

    let kind = if !failed {
        if op.commands.is_empty() {
            OpResultKind::NoChange
        } else {
            OpResultKind::Success
        }
    } else if op.args.ignore_errors {
        OpResultKind::IgnoredError
    } else if succeeded > 0 {
        OpResultKind::Partial
    } else {
        OpResultKind::Error
    };

    op.meta.set_outcome(OpOutcome {
        success: !failed,
        output,
    });

    let callback = if failed { &op.on_error } else { &op.on_success };
    if let Some(callback) = callback {
        callback(&mut *host, &op.meta);
    }

    HostOpResult {
        host: host.name.clone(),
        hash: hash.to_string(),
        kind,
        commands: executed,
    }
}

fn error_result(host: &str, hash: &str, reason: impl std::fmt::Display) -> HostOpResult {
    error!("[{}] Operation {} aborted: {}", host, hash, reason);
    HostOpResult {
        host: host.to_string(),
        hash: hash.to_string(),
        kind: OpResultKind::Error,
        commands: 0,
    }
}

/// 记录结果并通知回调，返回需要标记为失败的主机
fn record_results(state: &mut State, results: &[HostOpResult]) -> Vec<String> {
    let mut failed = Vec::new();
    for result in results {
        state
            .ledger
            .record_result(&result.host, result.kind, result.commands);

        let Some(meta) = state.op_meta(&result.hash).cloned() else {
            continue;
        };
        if result.kind.is_ok() {
            info!("[{}] {} {:?}", result.host, meta.display_name(), result.kind);
            for callback in state.callbacks() {
                callback.operation_host_success(&result.host, &meta, result.kind);
            }
        } else {
            error!("[{}] {} {:?}", result.host, meta.display_name(), result.kind);
            for callback in state.callbacks() {
                callback.operation_host_error(&result.host, &meta, result.kind);
            }
            failed.push(result.host.clone());
        }
    }
    failed
}

type Job = (String, SharedHost, Arc<HostOp>);

fn jobs_for_op(state: &State, hash: &str) -> Vec<Job> {
    state
        .inventory
        .iter_active(&state.ledger.active)
        .filter_map(|(name, host)| {
            state
                .ledger
                .host_op(name, hash)
                .map(|op| (name.to_string(), host.clone(), op))
        })
        .collect()
}

/// 在一批主机上并发执行同一个操作（带并发控制）
async fn run_batch(semaphore: &Arc<Semaphore>, hash: &str, batch: &[Job]) -> Vec<HostOpResult> {
    let mut handles = Vec::new();

    for (name, host, op) in batch {
        let name = name.clone();
        let hash = hash.to_string();
        let host = host.clone();
        let op = op.clone();
        let semaphore = semaphore.clone();

        handles.push(task::spawn(async move {
            let _permit = match semaphore.acquire_owned().await {
                Ok(permit) => permit,
                Err(e) => return error_result(&name, &hash, e),
            };
            let blocking_name = name.clone();
            let blocking_hash = hash.clone();
            task::spawn_blocking(move || {
                let mut host = lock_host(&host);
                run_host_op(&mut host, &blocking_hash, &op)
            })
            .await
            .unwrap_or_else(|e| error_result(&blocking_name, &hash, e))
        }));
    }

    let mut results = Vec::new();
    for handle in handles {
        match handle.await {
            Ok(result) => results.push(result),
            Err(e) => warn!("Operation task failed: {}", e),
        }
    }
    results
}

fn batch_size(meta: &OpMeta, host_count: usize) -> usize {
    if meta.execution.serial {
        1
    } else {
        meta.execution.parallel.unwrap_or(host_count).max(1)
    }
}

async fn run_per_operation(state: &mut State, order: &[String]) -> Result<()> {
    let semaphore = Arc::new(Semaphore::new(state.pool_size()));

    for hash in order {
        if state.is_cancelled() {
            warn!("Run cancelled, skipping remaining operations");
            break;
        }
        let Some(meta) = state.op_meta(hash).cloned() else {
            continue;
        };
        let jobs = jobs_for_op(state, hash);
        if jobs.is_empty() {
            debug!("No active hosts for operation {}", meta.display_name());
            continue;
        }

        info!("--> Starting operation: {}", meta.display_name());
        for callback in state.callbacks() {
            callback.operation_start(&meta);
        }

        let size = batch_size(&meta, jobs.len());
        for batch in jobs.chunks(size) {
            let results = run_batch(&semaphore, hash, batch).await;
            let failed = record_results(state, &results);
            state.fail_hosts(&failed)?;
        }

        for callback in state.callbacks() {
            callback.operation_end(&meta);
        }
    }
    Ok(())
}

/// 在一台主机上按全局顺序执行它的所有操作，遇到失败即停止
fn run_host_sequence(
    name: &str,
    host: &SharedHost,
    ops: Vec<(String, Arc<HostOp>)>,
    cancelled: &AtomicBool,
) -> Vec<HostOpResult> {
    let mut host = lock_host(host);
    let mut results = Vec::new();
    for (hash, op) in ops {
        if cancelled.load(Ordering::SeqCst) {
            warn!("[{}] Run cancelled, stopping", name);
            break;
        }
        let result = run_host_op(&mut host, &hash, &op);
        let ok = result.kind.is_ok();
        results.push(result);
        if !ok {
            break;
        }
    }
    results
}

fn host_ops(state: &State, name: &str, order: &[String]) -> Vec<(String, Arc<HostOp>)> {
    order
        .iter()
        .filter_map(|hash| {
            state
                .ledger
                .host_op(name, hash)
                .map(|op| (hash.clone(), op))
        })
        .collect()
}

async fn run_serial(state: &mut State, order: &[String]) -> Result<()> {
    let hosts: Vec<(String, SharedHost)> = state
        .inventory
        .iter_active(&state.ledger.active)
        .map(|(name, host)| (name.to_string(), host.clone()))
        .collect();

    for (name, host) in hosts {
        if state.is_cancelled() {
            break;
        }
        info!("[{}] Running all operations", name);
        let ops = host_ops(state, &name, order);
        let cancelled = state.cancel_flag();
        let task_name = name.clone();
        let results = task::spawn_blocking(move || {
            run_host_sequence(&task_name, &host, ops, &cancelled)
        })
        .await
        .map_err(|e| InfraError::TaskError(e.to_string()))?;

        let failed = record_results(state, &results);
        state.fail_hosts(&failed)?;
    }
    Ok(())
}

async fn run_no_wait(state: &mut State, order: &[String]) -> Result<()> {
    let semaphore = Arc::new(Semaphore::new(state.pool_size()));
    let mut tasks = JoinSet::new();

    for (name, host) in state.inventory.iter_active(&state.ledger.active) {
        let name = name.to_string();
        let host = host.clone();
        let ops = host_ops(state, &name, order);
        let semaphore = semaphore.clone();
        let cancelled = state.cancel_flag();

        tasks.spawn(async move {
            let _permit = match semaphore.acquire_owned().await {
                Ok(permit) => permit,
                Err(e) => {
                    warn!("[{}] {}", name, e);
                    return Vec::new();
                }
            };
            task::spawn_blocking(move || run_host_sequence(&name, &host, ops, &cancelled))
                .await
                .unwrap_or_else(|e| {
                    warn!("Host task failed: {}", e);
                    Vec::new()
                })
        });
    }

    while let Some(joined) = tasks.join_next().await {
        let results = joined.map_err(|e| InfraError::TaskError(e.to_string()))?;
        let failed = record_results(state, &results);
        state.fail_hosts(&failed)?;
    }
    Ok(())
}

/// 按选定的策略执行已编译的操作
pub async fn run(state: &mut State, strategy: RunStrategy) -> Result<RunSummary> {
    let order = state.get_op_order()?;
    info!(
        "Starting run: {} operations on {} hosts ({:?})",
        order.len(),
        state.ledger.active.len(),
        strategy
    );

    match strategy {
        RunStrategy::PerOperation => run_per_operation(state, &order).await?,
        RunStrategy::Serial => run_serial(state, &order).await?,
        RunStrategy::NoWait => run_no_wait(state, &order).await?,
    }

    let mut failed_hosts: Vec<String> = state.ledger.failed.iter().cloned().collect();
    failed_hosts.sort();
    let summary = RunSummary {
        ops: order.len(),
        hosts: state
            .inventory
            .host_names()
            .iter()
            .map(|name| (name.clone(), state.results(name)))
            .collect(),
        failed_hosts,
    };

    info!(
        "Run completed: {} operations, {} failed hosts",
        summary.ops,
        summary.failed_hosts.len()
    );
    Ok(summary)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::command::Command;
    use crate::config::Config;
    use crate::connector::LocalConnector;
    use crate::host::HostData;
    use crate::operation::OperationMeta;
    use crate::types::OperationArgs;

    fn local_host() -> Host {
        Host::new(
            "@local",
            vec![],
            HostData::default(),
            "local",
            Box::new(LocalConnector::new("/tmp")),
            Arc::new(Config::default()),
        )
    }

    fn host_op(commands: Vec<Command>, configure: impl FnOnce(&mut OperationArgs)) -> HostOp {
        let mut args = OperationArgs::resolve(&Default::default(), &Config::default());
        configure(&mut args);
        HostOp {
            meta: OperationMeta::new("op", commands.len()),
            commands,
            args,
            on_success: None,
            on_error: None,
        }
    }

    #[test]
    fn test_classifies_success_and_no_change() {
        let mut host = local_host();
        let op = host_op(vec![Command::shell("true")], |_| {});
        assert_eq!(run_host_op(&mut host, "op", &op).kind, OpResultKind::Success);
        assert_eq!(op.meta.did_change(), Some(true));

        let op = host_op(vec![], |_| {});
        assert_eq!(run_host_op(&mut host, "op", &op).kind, OpResultKind::NoChange);
        assert_eq!(op.meta.did_change(), Some(false));
    }

    #[test]
    fn test_classifies_partial_and_ignored() {
        let mut host = local_host();
        let op = host_op(
            vec![Command::shell("true"), Command::shell("false"), Command::shell("true")],
            |_| {},
        );
        let result = run_host_op(&mut host, "op", &op);
        assert_eq!(result.kind, OpResultKind::Partial);
        assert_eq!(result.commands, 2);

        let op = host_op(vec![Command::shell("false")], |args| args.ignore_errors = true);
        assert_eq!(run_host_op(&mut host, "op", &op).kind, OpResultKind::IgnoredError);

        let op = host_op(vec![Command::shell("false")], |_| {});
        assert_eq!(run_host_op(&mut host, "op", &op).kind, OpResultKind::Error);
    }

    #[test]
    fn test_continue_on_error_runs_remaining_commands() {
        let mut host = local_host();
        let op = host_op(
            vec![Command::shell("false"), Command::shell("true")],
            |args| args.continue_on_error = true,
        );
        let result = run_host_op(&mut host, "op", &op);
        assert_eq!(result.commands, 2);
        assert_eq!(result.kind, OpResultKind::Partial);
    }

    #[test]
    fn test_precondition_blocks_commands() {
        let mut host = local_host();
        let op = host_op(vec![Command::shell("true")], |args| {
            args.precondition = Some("false".to_string())
        });
        let result = run_host_op(&mut host, "op", &op);
        assert_eq!(result.commands, 0);
        assert_eq!(result.kind, OpResultKind::Error);
        assert_eq!(op.meta.did_succeed(), Some(false));
    }

    #[test]
    fn test_batch_size() {
        let mut meta = OpMeta {
            hash: "h".to_string(),
            names: Default::default(),
            args: vec![],
            execution: Default::default(),
            first_seen: 0,
        };
        assert_eq!(batch_size(&meta, 7), 7);
        meta.execution.parallel = Some(3);
        assert_eq!(batch_size(&meta, 7), 3);
        meta.execution.serial = true;
        assert_eq!(batch_size(&meta, 7), 1);
    }
}
