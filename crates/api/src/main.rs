use loomerp_infra::Settings;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let settings = Settings::load()?;
    loomerp_observability::init(&settings.environment);

    loomerp_api::app::services::serve(settings).await
}
