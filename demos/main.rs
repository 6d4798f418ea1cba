use std::sync::Arc;
use std::time::Duration;

use cmdorc::{CommandConfig, CommandRuntime, OnRetrigger, RunnerConfig};

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt::init();

    let build = CommandConfig::builder("Build", "echo building...")
        .trigger("build")
        .build()
        .unwrap();
    let test = CommandConfig::builder("Test", "echo testing...")
        .trigger("command_success:Build")
        .on_retrigger(OnRetrigger::CancelAndRestart)
        .build()
        .unwrap();

    let config = RunnerConfig::new(vec![build, test]).unwrap();
    let runtime = CommandRuntime::new(config);

    runtime
        .on_event(
            "command_success:*",
            Arc::new(|_snapshot, ctx| {
                println!("event dispatched along chain: {:?}", ctx.trigger_chain);
            }),
        )
        .await;

    runtime.trigger("build").await.unwrap();

    loop {
        let status = runtime.get_status("Test").await.unwrap();
        if let Some(last_run) = status.last_run {
            println!("Test finished: {:?}", last_run.state);
            break;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }

    runtime.shutdown(Duration::from_secs(5), true).await;
}
