use anyhow::Result;
use sandbox_agent::run_sandbox_agent;

#[tokio::main(flavor = "multi_thread")]
async fn main() -> Result<()> {
    run_sandbox_agent().await
}
