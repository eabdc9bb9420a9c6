#[tokio::main]
async fn main() -> anyhow::Result<()> {
    collaborator::run().await
}
