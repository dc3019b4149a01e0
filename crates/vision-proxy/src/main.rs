mod cli;
mod proxy;
mod relay;
mod route;
mod types;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();

    tracing_subscriber::fmt()
        .with_env_filter(std::env::var("RUST_LOG").unwrap_or_else(|_| {
            "info,vision_proxy=debug,caption_adapter=debug".to_string()
        }))
        .with_target(false)
        .compact()
        .init();

    cli::run().await
}
