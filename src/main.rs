#[tokio::main]
async fn main() -> anyhow::Result<()> {
    resi_tracker::run().await
}
