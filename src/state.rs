use crate::command::Command;
use crate::config::Config;
use crate::error::InfraError;
use crate::facts::Fact;
use crate::graph::topological_order;
use crate::host::lock_host;
use crate::inventory::Inventory;
use crate::operation::{HostContext, OpCallback, OperationMeta};
use crate::types::{ExecutionArgs, HostMeta, HostResults, OpResultKind, OperationArgs};
use crate::utils::default_parallel;
use crate::Result;
use serde::Serialize;
use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::Semaphore;
use tokio::task;
use tracing::{debug, error, info, warn};

/// 所有主机共享的操作元数据
#[derive(Debug, Clone, Serialize)]
pub struct OpMeta {
    pub hash: String,
    pub names: BTreeSet<String>,
    pub args: Vec<String>,
    pub execution: ExecutionArgs,
    #[serde(skip)]
    pub(crate) first_seen: usize,
}

impl OpMeta {
    pub fn display_name(&self) -> String {
        self.names.iter().cloned().collect::<Vec<_>>().join(", ")
    }
}

/// 一个操作在一台主机上的编译结果
pub struct HostOp {
    pub commands: Vec<Command>,
    pub args: OperationArgs,
    pub meta: OperationMeta,
    pub on_success: Option<OpCallback>,
    pub on_error: Option<OpCallback>,
}

/// 编译与执行共用的账本
#[derive(Default)]
pub struct ExecutionState {
    pub op_meta: HashMap<String, OpMeta>,
    pub ops: HashMap<String, HashMap<String, Arc<HostOp>>>,
    pub op_hash_order: HashMap<String, Vec<String>>,
    pub meta: HashMap<String, HostMeta>,
    pub results: HashMap<String, HostResults>,
    pub active: HashSet<String>,
    pub failed: HashSet<String>,
    pub activated: HashSet<String>,
    order: Option<Vec<String>>,
    next_first_seen: usize,
}

impl ExecutionState {
    pub fn host_op_order(&self, host: &str) -> &[String] {
        self.op_hash_order
            .get(host)
            .map(|order| order.as_slice())
            .unwrap_or(&[])
    }

    pub fn host_has_op(&self, host: &str, hash: &str) -> bool {
        self.host_op_order(host).iter().any(|h| h == hash)
    }

    pub(crate) fn push_host_op(&mut self, host: &str, hash: &str) {
        self.op_hash_order
            .entry(host.to_string())
            .or_default()
            .push(hash.to_string());
        self.order = None;
    }

    /// 首次见到的操作登记元数据；之后的主机必须给出相同的执行参数
    pub(crate) fn ensure_shared_op_meta(
        &mut self,
        hash: &str,
        name: &str,
        execution: &ExecutionArgs,
        args: &[String],
    ) -> Result<()> {
        match self.op_meta.get_mut(hash) {
            Some(meta) => {
                let mismatch = if meta.execution.parallel != execution.parallel {
                    Some("parallel")
                } else if meta.execution.run_once != execution.run_once {
                    Some("run_once")
                } else if meta.execution.serial != execution.serial {
                    Some("serial")
                } else {
                    None
                };
                if let Some(key) = mismatch {
                    return Err(InfraError::OperationValueError {
                        key: key.to_string(),
                        op_hash: hash.to_string(),
                    });
                }
                meta.names.insert(name.to_string());
            }
            None => {
                let mut names = BTreeSet::new();
                names.insert(name.to_string());
                self.op_meta.insert(
                    hash.to_string(),
                    OpMeta {
                        hash: hash.to_string(),
                        names,
                        args: args.to_vec(),
                        execution: execution.clone(),
                        first_seen: self.next_first_seen,
                    },
                );
                self.next_first_seen += 1;
            }
        }
        Ok(())
    }

    /// 是否已有主机为该操作生成了命令
    pub fn has_commands(&self, hash: &str) -> bool {
        self.ops
            .values()
            .any(|ops| ops.get(hash).map(|op| !op.commands.is_empty()).unwrap_or(false))
    }

    pub(crate) fn record_host_op(&mut self, host: &str, hash: &str, op: HostOp) {
        let meta = self.meta.entry(host.to_string()).or_default();
        meta.ops += 1;
        meta.commands += op.commands.len();
        if op.commands.is_empty() {
            meta.ops_no_change += 1;
        } else {
            meta.ops_change += 1;
        }
        self.ops
            .entry(host.to_string())
            .or_default()
            .insert(hash.to_string(), Arc::new(op));
    }

    pub fn host_op(&self, host: &str, hash: &str) -> Option<Arc<HostOp>> {
        self.ops.get(host).and_then(|ops| ops.get(hash)).cloned()
    }

    pub(crate) fn record_result(&mut self, host: &str, kind: OpResultKind, commands: usize) {
        self.results
            .entry(host.to_string())
            .or_default()
            .record(kind, commands);
    }

    /// 全局操作顺序，按需重新计算
    pub fn get_op_order(&mut self) -> Result<Vec<String>> {
        if let Some(order) = &self.order {
            return Ok(order.clone());
        }
        let first_seen: HashMap<String, usize> = self
            .op_meta
            .iter()
            .map(|(hash, meta)| (hash.clone(), meta.first_seen))
            .collect();
        let order = topological_order(self.op_hash_order.values(), &first_seen)?;
        self.order = Some(order.clone());
        Ok(order)
    }

    /// 将主机移出活动集合，并检查失败比例
    pub fn fail_hosts(&mut self, names: &[String], fail_percent: Option<u32>) -> Result<()> {
        if names.is_empty() {
            return Ok(());
        }
        for name in names {
            self.active.remove(name);
            self.failed.insert(name.clone());
        }

        if self.active.is_empty() {
            return Err(InfraError::NoHostsRemaining);
        }

        if let Some(limit) = fail_percent {
            let activated = self.activated.len().max(1);
            let failed = self.failed.len();
            // 整数比较：failed / activated > limit / 100
            if failed * 100 > limit as usize * activated {
                return Err(InfraError::FailPercentExceeded {
                    limit,
                    actual: (failed * 100 / activated) as u32,
                });
            }
        }
        Ok(())
    }
}

/// 运行过程中的事件回调
pub trait StateCallback: Send + Sync {
    fn host_connect(&self, _host: &str) {}

    fn host_connect_error(&self, _host: &str, _error: &InfraError) {}

    fn host_disconnect(&self, _host: &str) {}

    fn operation_start(&self, _op: &OpMeta) {}

    fn operation_host_success(&self, _host: &str, _op: &OpMeta, _kind: OpResultKind) {}

    fn operation_host_error(&self, _host: &str, _op: &OpMeta, _kind: OpResultKind) {}

    fn operation_end(&self, _op: &OpMeta) {}
}

/// 一次运行的全部状态
pub struct State {
    pub inventory: Inventory,
    pub config: Arc<Config>,
    pub ledger: ExecutionState,
    callbacks: Vec<Arc<dyn StateCallback>>,
    cancelled: Arc<AtomicBool>,
    pool_size: usize,
}

impl State {
    pub fn new(inventory: Inventory, config: Arc<Config>) -> Self {
        let ledger = ExecutionState {
            active: inventory.host_names().iter().cloned().collect(),
            ..Default::default()
        };
        let pool_size = config
            .parallel
            .unwrap_or_else(|| default_parallel(inventory.len()))
            .max(1);
        info!(
            "State created with {} hosts, max {} concurrent",
            inventory.len(),
            pool_size
        );
        Self {
            inventory,
            config,
            ledger,
            callbacks: Vec::new(),
            cancelled: Arc::new(AtomicBool::new(false)),
            pool_size,
        }
    }

    pub fn add_callback(&mut self, callback: Arc<dyn StateCallback>) {
        self.callbacks.push(callback);
    }

    pub(crate) fn callbacks(&self) -> &[Arc<dyn StateCallback>] {
        &self.callbacks
    }

    pub fn pool_size(&self) -> usize {
        self.pool_size
    }

    /// 请求停止：正在执行的命令完成后不再启动新的命令
    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }

    pub(crate) fn cancel_flag(&self) -> Arc<AtomicBool> {
        self.cancelled.clone()
    }

    pub fn active_hosts(&self) -> Vec<String> {
        self.inventory
            .iter_active(&self.ledger.active)
            .map(|(name, _)| name.to_string())
            .collect()
    }

    /// 并发连接所有活动主机；连接失败的主机计入失败
    pub async fn connect_all(&mut self) -> Result<()> {
        let semaphore = Arc::new(Semaphore::new(self.pool_size));
        let mut handles = Vec::new();

        info!(
            "Connecting to {} hosts with max {} concurrent connections",
            self.ledger.active.len(),
            self.pool_size
        );

        for (name, host) in self.inventory.iter_active(&self.ledger.active) {
            let name = name.to_string();
            let host = host.clone();
            let semaphore = semaphore.clone();

            handles.push(task::spawn(async move {
                let _permit = match semaphore.acquire_owned().await {
                    Ok(permit) => permit,
                    Err(e) => return (name, Err(InfraError::TaskError(e.to_string()))),
                };
                let result = task::spawn_blocking(move || lock_host(&host).connect())
                    .await
                    .unwrap_or_else(|e| Err(InfraError::TaskError(e.to_string())));
                (name, result)
            }));
        }

        let mut failed = Vec::new();
        for handle in handles {
            let (name, result) = handle
                .await
                .map_err(|e| InfraError::TaskError(e.to_string()))?;
            self.ledger.activated.insert(name.clone());
            match result {
                Ok(()) => {
                    info!("[{}] Connected", name);
                    for callback in &self.callbacks {
                        callback.host_connect(&name);
                    }
                }
                Err(e) => {
                    error!("[{}] {}", name, e);
                    for callback in &self.callbacks {
                        callback.host_connect_error(&name, &e);
                    }
                    failed.push(name);
                }
            }
        }

        self.fail_hosts(&failed)
    }

    /// 在所有活动主机上并发读取同一个 fact；读取失败的主机计入失败
    pub async fn get_facts<F>(
        &mut self,
        fact: F,
        args: F::Args,
    ) -> Result<BTreeMap<String, F::Output>>
    where
        F: Fact + 'static,
        F::Args: Send + Sync + 'static,
        F::Output: Send + 'static,
    {
        let semaphore = Arc::new(Semaphore::new(self.pool_size));
        let fact = Arc::new(fact);
        let args = Arc::new(args);
        let mut handles = Vec::new();

        debug!(
            "Loading fact {} on {} hosts",
            fact.name(),
            self.ledger.active.len()
        );

        for (name, host) in self.inventory.iter_active(&self.ledger.active) {
            let name = name.to_string();
            let host = host.clone();
            let semaphore = semaphore.clone();
            let fact = fact.clone();
            let args = args.clone();

            handles.push(task::spawn(async move {
                let _permit = match semaphore.acquire_owned().await {
                    Ok(permit) => permit,
                    Err(e) => return (name, Err(InfraError::TaskError(e.to_string()))),
                };
                let result = task::spawn_blocking(move || {
                    let mut host = lock_host(&host);
                    host.connect()?;
                    host.get_fact(fact.as_ref(), args.as_ref())
                })
                .await
                .unwrap_or_else(|e| Err(InfraError::TaskError(e.to_string())));
                (name, result)
            }));
        }

        let mut values = BTreeMap::new();
        let mut failed = Vec::new();
        for handle in handles {
            let (name, result) = handle
                .await
                .map_err(|e| InfraError::TaskError(e.to_string()))?;
            self.ledger.activated.insert(name.clone());
            match result {
                Ok(value) => {
                    values.insert(name, value);
                }
                Err(e) => {
                    error!("[{}] {}", name, e);
                    failed.push(name);
                }
            }
        }

        self.fail_hosts(&failed)?;
        Ok(values)
    }

    /// 对每台活动主机依次执行 deploy，生成操作与命令
    pub fn compile<F>(&mut self, deploy: F) -> Result<()>
    where
        F: for<'h> Fn(&mut HostContext<'h>) -> Result<()>,
    {
        let hosts: Vec<_> = self
            .inventory
            .iter_active(&self.ledger.active)
            .map(|(name, host)| (name.to_string(), host.clone()))
            .collect();

        let mut failed = Vec::new();
        for (name, host) in hosts {
            self.ledger.activated.insert(name.clone());
            let mut guard = lock_host(&host);
            if let Err(e) = guard.connect() {
                error!("[{}] {}", name, e);
                failed.push(name);
                continue;
            }

            debug!("[{}] Compiling deploy", name);
            let mut ctx = HostContext::new(&mut guard, &mut self.ledger, self.config.clone());
            match deploy(&mut ctx) {
                Ok(()) => {}
                Err(e) if e.is_fatal() => return Err(e),
                Err(e) => {
                    error!("[{}] {}", name, e);
                    failed.push(name);
                }
            }
        }

        self.fail_hosts(&failed)?;
        let order = self.ledger.get_op_order()?;
        info!("Compiled {} operations", order.len());
        Ok(())
    }

    pub fn fail_hosts(&mut self, names: &[String]) -> Result<()> {
        if !names.is_empty() {
            warn!("Failing hosts: {}", names.join(", "));
        }
        let result = self.ledger.fail_hosts(names, self.config.fail_percent);
        if result.is_err() {
            self.cancel();
        }
        result
    }

    pub fn get_op_order(&mut self) -> Result<Vec<String>> {
        self.ledger.get_op_order()
    }

    pub fn op_meta(&self, hash: &str) -> Option<&OpMeta> {
        self.ledger.op_meta.get(hash)
    }

    pub fn results(&self, host: &str) -> HostResults {
        self.ledger.results.get(host).cloned().unwrap_or_default()
    }

    pub fn host_meta(&self, host: &str) -> HostMeta {
        self.ledger.meta.get(host).cloned().unwrap_or_default()
    }

    /// 断开所有已连接的主机
    pub async fn disconnect_all(&mut self) {
        let mut handles = Vec::new();
        for host in self.inventory.hosts() {
            let host = host.clone();
            handles.push(task::spawn_blocking(move || {
                let mut guard = lock_host(&host);
                let name = guard.name.clone();
                let was_connected = guard.is_connected();
                (name, was_connected, guard.disconnect())
            }));
        }

        for handle in handles {
            match handle.await {
                Ok((name, true, Ok(()))) => {
                    debug!("[{}] Disconnected", name);
                    for callback in &self.callbacks {
                        callback.host_disconnect(&name);
                    }
                }
                Ok((name, _, Err(e))) => warn!("[{}] Error while disconnecting: {}", name, e),
                Ok(_) => {}
                Err(e) => warn!("Disconnect task failed: {}", e),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ledger_with(hosts: &[&str]) -> ExecutionState {
        let names: Vec<String> = hosts.iter().map(|h| h.to_string()).collect();
        ExecutionState {
            active: names.iter().cloned().collect(),
            activated: names.iter().cloned().collect(),
            ..Default::default()
        }
    }

    fn names(hosts: &[&str]) -> Vec<String> {
        hosts.iter().map(|h| h.to_string()).collect()
    }

    #[test]
    fn test_fail_percent_boundary() {
        let hosts: Vec<String> = (0..10).map(|i| format!("h{}", i)).collect();
        let refs: Vec<&str> = hosts.iter().map(|h| h.as_str()).collect();
        let mut ledger = ledger_with(&refs);

        assert!(ledger.fail_hosts(&names(&["h0", "h1"]), Some(20)).is_ok());
        match ledger.fail_hosts(&names(&["h2"]), Some(20)) {
            Err(InfraError::FailPercentExceeded { limit, actual }) => {
                assert_eq!(limit, 20);
                assert_eq!(actual, 30);
            }
            other => panic!("expected FailPercentExceeded, got {:?}", other),
        }
    }

    #[test]
    fn test_no_hosts_remaining() {
        let mut ledger = ledger_with(&["a", "b"]);
        assert!(ledger.fail_hosts(&names(&["a"]), None).is_ok());
        assert!(matches!(
            ledger.fail_hosts(&names(&["b"]), None),
            Err(InfraError::NoHostsRemaining)
        ));
    }

    #[test]
    fn test_execution_args_must_match() {
        let mut ledger = ExecutionState::default();
        let serial = ExecutionArgs {
            serial: true,
            ..Default::default()
        };
        ledger
            .ensure_shared_op_meta("abc", "Op", &ExecutionArgs::default(), &[])
            .unwrap();
        ledger
            .ensure_shared_op_meta("abc", "Op again", &ExecutionArgs::default(), &[])
            .unwrap();
        assert_eq!(ledger.op_meta["abc"].names.len(), 2);

        match ledger.ensure_shared_op_meta("abc", "Op", &serial, &[]) {
            Err(InfraError::OperationValueError { key, op_hash }) => {
                assert_eq!(key, "serial");
                assert_eq!(op_hash, "abc");
            }
            other => panic!("expected OperationValueError, got {:?}", other),
        }
    }

    #[test]
    fn test_op_order_is_cached_until_changed() {
        let mut ledger = ExecutionState::default();
        for hash in ["a", "b"] {
            ledger
                .ensure_shared_op_meta(hash, hash, &ExecutionArgs::default(), &[])
                .unwrap();
            ledger.push_host_op("h1", hash);
        }
        assert_eq!(ledger.get_op_order().unwrap(), vec!["a", "b"]);

        ledger
            .ensure_shared_op_meta("c", "c", &ExecutionArgs::default(), &[])
            .unwrap();
        ledger.push_host_op("h2", "c");
        ledger.push_host_op("h2", "a");
        // h2 要求 c 在 a 之前
        assert_eq!(ledger.get_op_order().unwrap(), vec!["c", "a", "b"]);
    }
}
