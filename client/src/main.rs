use {
    anyhow::Result,
    clap::Parser,
    cloakfs::{
        cli::{Cli, default_config_path},
        config::Config,
        run, setup_logger,
    },
};

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let config_file = if let Some(path) = &cli.config {
        path.clone()
    } else {
        default_config_path()?
    };
    let config = Config::load(&config_file)?;
    setup_logger(config.log_file.as_deref(), &config.log_filter)?;
    run(cli, config).await
}
