use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;

use taskcore::config::{SchedulerConfig, ShellConfig, load_crontab};
use taskcore::registry::builtin::ShellCommand;
use taskcore::{ExecContext, Registry, Scheduler};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with_target(false)
        .init();

    let crontab = std::env::args()
        .nth(1)
        .or_else(|| std::env::var("TASKCORE_CRONTAB").ok())
        .map(PathBuf::from)
        .unwrap_or_else(|| {
            eprintln!("Usage: taskcore <crontab>");
            eprintln!("  or set TASKCORE_CRONTAB=/path/to/crontab");
            std::process::exit(2);
        });

    let lines = load_crontab(&crontab)
        .with_context(|| format!("Failed to read crontab {}", crontab.display()))?;
    if lines.is_empty() {
        anyhow::bail!("No schedule lines in {}", crontab.display());
    }

    let shell = ShellConfig::from_env()?;
    let ctx = ExecContext::with_runner(Registry::new(), Arc::new(ShellCommand::from_config(&shell)));
    let config = SchedulerConfig::from_env()?;

    eprintln!("taskcore v{}", env!("CARGO_PKG_VERSION"));
    eprintln!("   Crontab: {} ({} entries)", crontab.display(), lines.len());
    eprintln!("   Flavor: {}", config.flavor);
    eprintln!("   Press Ctrl-C to stop.\n");

    let mut schedulers = Vec::with_capacity(lines.len());
    for line in &lines {
        let scheduler = Scheduler::new(line, None, config.clone(), &ctx)
            .with_context(|| format!("Bad schedule line '{line}'"))?;
        scheduler.start().await?;
        schedulers.push(scheduler);
    }
    tracing::info!("Started {} schedulers", schedulers.len());

    tokio::signal::ctrl_c()
        .await
        .context("Failed to listen for Ctrl-C")?;
    tracing::info!("Shutting down");

    for scheduler in &schedulers {
        scheduler.stop().await;
    }
    ctx.shutdown().await;
    Ok(())
}
