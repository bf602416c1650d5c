use common::logging::init_tracing;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    init_tracing("driver=info,common=warn");
    driver::cli::run().await
}
