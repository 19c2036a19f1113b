use rs_infra::{
    run, Config, FileExists, Hostname, Inventory, RunStrategy, State, StringCommand,
};
use std::sync::Arc;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // 初始化tracing日志
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"))
        )
        .with_target(false)
        .with_thread_ids(false)
        .with_file(true)
        .with_line_number(true)
        .init();

    println!("=== rs-infra Local Deploy Demo ===\n");

    // 可选：第一个参数指定 YAML 配置文件
    let config = match std::env::args().nth(1) {
        Some(path) => Config::from_yaml_file(&path)?,
        None => Config::default(),
    };
    let config = Arc::new(config);

    let inventory = Inventory::builder(config.clone()).host("@local").build()?;
    let mut state = State::new(inventory, config);

    state.connect_all().await?;

    let marker = std::env::temp_dir()
        .join("rs-infra-demo.marker")
        .to_string_lossy()
        .into_owned();

    state.compile(|ctx| {
        let hostname = ctx.get_fact(&Hostname, &())?;
        println!("📋 主机名: {}", hostname);

        let path = marker.clone();
        ctx.op("Create marker file", move |ctx| {
            if ctx.get_fact(&FileExists, &path)? {
                return Ok(vec![]);
            }
            Ok(vec![StringCommand::new().raw("touch").quote(&path).into()])
        })
        .arg(&marker)
        .run()?;

        ctx.op("Show uptime", |_| Ok(vec!["uptime".into()])).run()?;
        Ok(())
    })?;

    let summary = run(&mut state, RunStrategy::PerOperation).await?;
    state.disconnect_all().await;

    println!("\n📊 运行结果:");
    println!("{}", serde_json::to_string_pretty(&summary)?);

    if summary.is_success() {
        println!("✅ 完成");
    } else {
        println!("❌ 存在失败的主机: {:?}", summary.failed_hosts);
    }
    Ok(())
}
