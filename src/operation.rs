use crate::command::{Command, OpItem};
use crate::config::{Config, OpOrdering};
use crate::error::InfraError;
use crate::facts::Fact;
use crate::host::Host;
use crate::state::{ExecutionState, HostOp};
use crate::types::{ArgOverrides, CommandOutput, OperationArgs};
use crate::utils::make_hash;
use crate::Result;
use serde_json::{Map, Value};
use std::panic::Location;
use std::sync::{Arc, OnceLock};
use tracing::debug;

/// 操作执行后的结果
#[derive(Debug, Clone)]
pub struct OpOutcome {
    pub success: bool,
    pub output: CommandOutput,
}

/// 操作在一台主机上的编译结果。执行完成后可读取是否发生了变更
#[derive(Debug, Clone)]
pub struct OperationMeta {
    pub hash: String,
    pub commands: usize,
    outcome: Arc<OnceLock<OpOutcome>>,
}

impl OperationMeta {
    pub(crate) fn new(hash: impl Into<String>, commands: usize) -> Self {
        Self {
            hash: hash.into(),
            commands,
            outcome: Arc::new(OnceLock::new()),
        }
    }

    pub fn will_change(&self) -> bool {
        self.commands > 0
    }

    pub fn is_complete(&self) -> bool {
        self.outcome.get().is_some()
    }

    /// 执行前为 None
    pub fn did_change(&self) -> Option<bool> {
        self.outcome
            .get()
            .map(|outcome| outcome.success && self.commands > 0)
    }

    pub fn did_succeed(&self) -> Option<bool> {
        self.outcome.get().map(|outcome| outcome.success)
    }

    pub fn output(&self) -> Option<&CommandOutput> {
        self.outcome.get().map(|outcome| &outcome.output)
    }

    pub(crate) fn set_outcome(&self, outcome: OpOutcome) {
        let _ = self.outcome.set(outcome);
    }
}

pub type OpCallback = Arc<dyn Fn(&mut Host, &OperationMeta) + Send + Sync>;

struct DeployFrame {
    name: String,
    location: &'static Location<'static>,
    overrides: ArgOverrides,
}

struct ActiveOp {
    hash: String,
    nested: Vec<Command>,
}

/// 一台主机的编译上下文，显式地传给 deploy 与操作体
pub struct HostContext<'a> {
    host: &'a mut Host,
    ledger: &'a mut ExecutionState,
    config: Arc<Config>,
    deploys: Vec<DeployFrame>,
    active: Option<ActiveOp>,
}

impl<'a> HostContext<'a> {
    pub(crate) fn new(host: &'a mut Host, ledger: &'a mut ExecutionState, config: Arc<Config>) -> Self {
        Self {
            host,
            ledger,
            config,
            deploys: Vec::new(),
            active: None,
        }
    }

    pub fn host(&self) -> &Host {
        self.host
    }

    pub fn host_mut(&mut self) -> &mut Host {
        self.host
    }

    pub fn config(&self) -> &Arc<Config> {
        &self.config
    }

    pub fn data(&self, key: &str) -> Option<&Value> {
        self.host.data.get(key)
    }

    pub fn get_fact<F: Fact>(&mut self, fact: &F, args: &F::Args) -> Result<F::Output> {
        self.host.get_fact(fact, args)
    }

    /// 是否正在某个操作体内
    pub fn in_op(&self) -> bool {
        self.active.is_some()
    }

    /// 声明一个操作，调用位置决定其哈希
    #[track_caller]
    pub fn op<F>(&mut self, name: impl Into<String>, body: F) -> OpCall<'_, 'a, F>
    where
        F: FnOnce(&mut HostContext<'a>) -> Result<Vec<OpItem>>,
    {
        OpCall {
            location: Location::caller(),
            ctx: self,
            name: name.into(),
            body,
            overrides: ArgOverrides::default(),
            display_args: Vec::new(),
            on_success: None,
            on_error: None,
        }
    }

    /// 在 deploy 作用域内执行：名称作为操作名前缀，数据与参数作为默认值
    #[track_caller]
    pub fn deploy<R>(
        &mut self,
        name: impl Into<String>,
        data: Value,
        args: ArgOverrides,
        body: impl FnOnce(&mut HostContext<'a>) -> Result<R>,
    ) -> Result<R> {
        let data = match data {
            Value::Object(map) => map,
            Value::Null => Map::new(),
            other => {
                return Err(InfraError::DeployError(format!(
                    "Deploy data must be an object, got: {}",
                    other
                )));
            }
        };

        self.deploys.push(DeployFrame {
            name: name.into(),
            location: Location::caller(),
            overrides: args,
        });
        self.host.data.push_override(data);

        let result = body(&mut *self);

        self.host.data.pop_override();
        self.deploys.pop();
        result
    }

    /// 循环中的每次迭代记录位置，使同一调用位置得到不同的操作哈希
    pub fn looped<I, T>(
        &mut self,
        items: I,
        mut body: impl FnMut(&mut HostContext<'a>, T) -> Result<()>,
    ) -> Result<()>
    where
        I: IntoIterator<Item = T>,
    {
        for (position, item) in items.into_iter().enumerate() {
            self.host.loop_position.push(position);
            let result = body(&mut *self, item);
            self.host.loop_position.pop();
            result?;
        }
        Ok(())
    }

    fn deploy_name(&self) -> Option<String> {
        if self.deploys.is_empty() {
            return None;
        }
        Some(
            self.deploys
                .iter()
                .map(|frame| frame.name.as_str())
                .collect::<Vec<_>>()
                .join(" | "),
        )
    }

    /// 调用位置（含 deploy 链与循环位置）或编译序号，再对重复值追加后缀
    fn solve_op_hash(&mut self, location: &'static Location<'static>) -> String {
        let host_name = self.host.name.clone();
        let loop_position = self
            .host
            .loop_position
            .iter()
            .map(|p| p.to_string())
            .collect::<Vec<_>>()
            .join(",");

        let base = match self.config.op_ordering {
            OpOrdering::CallSite => {
                let mut chain: Vec<String> = self
                    .deploys
                    .iter()
                    .map(|frame| frame.location.to_string())
                    .collect();
                chain.push(location.to_string());
                make_hash(&format!("{}#{}", chain.join("|"), loop_position))
            }
            OpOrdering::Sequential => {
                let index = self.ledger.host_op_order(&host_name).len();
                make_hash(&format!("{}#{}", index, loop_position))
            }
        };
        let base = base[..16].to_string();

        let mut hash = base.clone();
        let mut duplicates = 0;
        while self.ledger.host_has_op(&host_name, &hash) {
            debug!("Duplicate hash ({}) detected on {}", hash, host_name);
            duplicates += 1;
            hash = format!("{}-{}", base, duplicates);
        }
        hash
    }
}

/// 操作调用的构建器，`run()` 时编译到当前主机
pub struct OpCall<'c, 'a, F> {
    ctx: &'c mut HostContext<'a>,
    location: &'static Location<'static>,
    name: String,
    body: F,
    overrides: ArgOverrides,
    display_args: Vec<String>,
    on_success: Option<OpCallback>,
    on_error: Option<OpCallback>,
}

impl<'c, 'a, F> OpCall<'c, 'a, F>
where
    F: FnOnce(&mut HostContext<'a>) -> Result<Vec<OpItem>>,
{
    /// 叠加一组全局参数（已设置的字段优先）
    pub fn args(mut self, overrides: ArgOverrides) -> Self {
        self.overrides = self.overrides.layered_over(&overrides);
        self
    }

    /// 用于展示的调用参数
    pub fn arg(mut self, value: impl std::fmt::Display) -> Self {
        self.display_args.push(value.to_string());
        self
    }

    pub fn sudo(mut self, sudo: bool) -> Self {
        self.overrides.sudo = Some(sudo);
        self
    }

    pub fn sudo_user(mut self, user: impl Into<String>) -> Self {
        self.overrides.sudo_user = Some(user.into());
        self
    }

    pub fn su_user(mut self, user: impl Into<String>) -> Self {
        self.overrides.su_user = Some(user.into());
        self
    }

    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.overrides
            .env
            .get_or_insert_with(Default::default)
            .insert(key.into(), value.into());
        self
    }

    pub fn chdir(mut self, dir: impl Into<String>) -> Self {
        self.overrides.chdir = Some(dir.into());
        self
    }

    pub fn timeout(mut self, seconds: u64) -> Self {
        self.overrides.timeout = Some(seconds);
        self
    }

    pub fn success_exit_codes(mut self, codes: Vec<i32>) -> Self {
        self.overrides.success_exit_codes = Some(codes);
        self
    }

    pub fn ignore_errors(mut self, ignore: bool) -> Self {
        self.overrides.ignore_errors = Some(ignore);
        self
    }

    pub fn continue_on_error(mut self, value: bool) -> Self {
        self.overrides.continue_on_error = Some(value);
        self
    }

    pub fn precondition(mut self, command: impl Into<String>) -> Self {
        self.overrides.precondition = Some(command.into());
        self
    }

    pub fn postcondition(mut self, command: impl Into<String>) -> Self {
        self.overrides.postcondition = Some(command.into());
        self
    }

    pub fn serial(mut self, serial: bool) -> Self {
        self.overrides.serial = Some(serial);
        self
    }

    pub fn run_once(mut self, run_once: bool) -> Self {
        self.overrides.run_once = Some(run_once);
        self
    }

    pub fn parallel(mut self, parallel: usize) -> Self {
        self.overrides.parallel = Some(parallel);
        self
    }

    pub fn on_success(mut self, callback: impl Fn(&mut Host, &OperationMeta) + Send + Sync + 'static) -> Self {
        self.on_success = Some(Arc::new(callback));
        self
    }

    pub fn on_error(mut self, callback: impl Fn(&mut Host, &OperationMeta) + Send + Sync + 'static) -> Self {
        self.on_error = Some(Arc::new(callback));
        self
    }

    /// 编译操作：生成本主机的命令并写入执行账本
    pub fn run(self) -> Result<OperationMeta> {
        let OpCall {
            ctx,
            location,
            name,
            body,
            overrides,
            display_args,
            on_success,
            on_error,
        } = self;

        if let Some(parent) = ctx.active.as_ref() {
            // 嵌套操作：命令并入外层操作，不允许声明新的全局参数
            let mut keys = overrides.keys();
            if on_success.is_some() {
                keys.push("on_success".to_string());
            }
            if on_error.is_some() {
                keys.push("on_error".to_string());
            }
            if !keys.is_empty() {
                return Err(InfraError::NestedOperationArguments(keys));
            }

            let parent_hash = parent.hash.clone();
            let commands: Vec<Command> = body(&mut *ctx)?.into_iter().map(OpItem::into_command).collect();
            let count = commands.len();
            if let Some(active) = ctx.active.as_mut() {
                active.nested.extend(commands);
            }
            return Ok(OperationMeta::new(parent_hash, count));
        }

        let host_name = ctx.host.name.clone();
        let hash = ctx.solve_op_hash(location);
        ctx.ledger.push_host_op(&host_name, &hash);

        let full_name = match ctx.deploy_name() {
            Some(deploy) => format!("{} | {}", deploy, name),
            None => name,
        };

        // 调用参数 > deploy 默认值（内层优先）> 主机数据
        let mut merged = overrides;
        for frame in ctx.deploys.iter().rev() {
            merged = merged.layered_over(&frame.overrides);
        }
        merged = merged.layered_over(&ctx.host.data_overrides());
        let op_args = OperationArgs::resolve(&merged, &ctx.config);

        ctx.ledger
            .ensure_shared_op_meta(&hash, &full_name, &op_args.execution, &display_args)?;

        if op_args.execution.run_once && ctx.ledger.has_commands(&hash) {
            debug!("[{}] Skipping run_once operation {} ({})", host_name, full_name, hash);
            let meta = OperationMeta::new(hash.clone(), 0);
            ctx.ledger.record_host_op(
                &host_name,
                &hash,
                HostOp {
                    commands: Vec::new(),
                    args: op_args,
                    meta: meta.clone(),
                    on_success: None,
                    on_error: None,
                },
            );
            return Ok(meta);
        }

        ctx.active = Some(ActiveOp {
            hash: hash.clone(),
            nested: Vec::new(),
        });
        ctx.host.current_op = Some(op_args.clone());

        let result = body(&mut *ctx);

        ctx.host.current_op = None;
        let nested = ctx.active.take().map(|active| active.nested).unwrap_or_default();
        let items = result?;

        let mut commands = nested;
        commands.extend(items.into_iter().map(OpItem::into_command));
        debug!(
            "[{}] Compiled {} ({}): {} commands",
            host_name,
            full_name,
            hash,
            commands.len()
        );

        let meta = OperationMeta::new(hash.clone(), commands.len());
        ctx.ledger.record_host_op(
            &host_name,
            &hash,
            HostOp {
                commands,
                args: op_args,
                meta: meta.clone(),
                on_success,
                on_error,
            },
        );
        Ok(meta)
    }
}
