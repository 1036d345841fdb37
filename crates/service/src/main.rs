use fieldops_service::{ServiceConfig, app};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();

    let config = ServiceConfig::from_env()?;
    fieldops_observability::init(config.log_format);

    app::run(config).await
}
