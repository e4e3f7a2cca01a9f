use anyhow::Context;
use argh::FromArgs;
use tollgate::{config::Config, run::App};
use tollgate_common::logger;

/// The tollgate billing and entitlements service.
#[derive(FromArgs)]
struct Args {
    /// path to a .env file to load before reading configuration
    #[argh(option)]
    env_file: Option<std::path::PathBuf>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = argh::from_env::<Args>();
    match &args.env_file {
        Some(path) => {
            dotenvy::from_path(path).with_context(|| {
                format!("Could not load env file {}", path.display())
            })?;
        }
        // Best-effort `.env` in dev; absence is fine.
        None => {
            let _ = dotenvy::dotenv();
        }
    }

    logger::init();
    let config = Config::from_env().context("Invalid configuration")?;
    let app = App::init(&config).await.context("Initialization failed")?;
    app.run().await
}
