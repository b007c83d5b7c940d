use anyhow::Result;
use workers::stats_logic::config::WorkerKind;
use workers::stats_logic::runner;

#[tokio::main]
async fn main() -> Result<()> {
    runner::run(WorkerKind::Sense).await
}
