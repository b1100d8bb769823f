use anyhow::Result;
use clap::Parser;
use std::fs::File;
use supercall::app::AppBuilder;
use supercall::config::{Cli, Config};
use tracing::{info, level_filters::LevelFilter};

#[tokio::main]
async fn main() -> Result<()> {
    dotenv::dotenv().ok();
    let cli = Cli::parse();

    let config = cli
        .conf
        .filter(|path| std::path::Path::new(path).exists())
        .map(|path| Config::load(&path).expect("Failed to load config"))
        .unwrap_or_default();

    let mut log_fmt = tracing_subscriber::fmt();
    if let Some(ref level) = config.log_level {
        if let Ok(lv) = level.as_str().parse::<LevelFilter>() {
            log_fmt = log_fmt.with_max_level(lv);
        }
    }

    let _guard;
    if let Some(ref log_file) = config.log_file {
        let file = File::create(log_file).expect("Failed to create log file");
        let (non_blocking, guard) = tracing_appender::non_blocking(file);
        _guard = guard;
        log_fmt.with_writer(non_blocking).try_init().ok();
    } else {
        log_fmt.try_init().ok();
    }

    let app = AppBuilder::new()
        .config(config)
        .build()
        .expect("Failed to build app");

    info!(
        "starting supercall on {}:{}",
        app.config.serve.bind, app.config.serve.port
    );
    app.run().await
}
