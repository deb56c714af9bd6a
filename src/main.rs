use std::sync::Arc;

use ranging_core::config::Config;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = Arc::new(Config::load()?);
    simple_logger::init_with_level(config.log.level.as_level())?;
    ranging_core::core_main(config).await
}
