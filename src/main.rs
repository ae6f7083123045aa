#[tokio::main]
async fn main() -> anyhow::Result<()> {
    simplepage_lib::run().await
}
