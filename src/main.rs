use log::info;
use std::sync::Arc;

use tokio::io::{AsyncBufReadExt, BufReader};
use tokio_stream::StreamExt;
use tokio_stream::wrappers::LinesStream;

use lamp_switch::{AppConfig, Application, HttpDeviceStack};

#[cfg(feature = "hardware-gpio")]
use lamp_switch::LibgpiodBackend;
#[cfg(not(feature = "hardware-gpio"))]
use lamp_switch::MockGpioBackend;

#[actix_web::main]
async fn main() -> std::io::Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    info!("Welcome to the Lamp & Switch application.");

    let config = match std::env::args()
        .nth(1)
        .or_else(|| std::env::var("LAMP_SWITCH_CONFIG").ok())
    {
        Some(path) => AppConfig::load_from_file(&path)
            .unwrap_or_else(|e| panic!("Failed to load config {path}: {e}")),
        None => {
            info!("No config given, using the built-in pin map");
            AppConfig::default()
        }
    };
    let config = Arc::new(config);

    let backend = {
        #[cfg(feature = "hardware-gpio")]
        {
            Arc::new(
                LibgpiodBackend::new()
                    .unwrap_or_else(|e| panic!("Failed to init libgpiod backend: {e}")),
            )
        }
        #[cfg(not(feature = "hardware-gpio"))]
        {
            Arc::new(MockGpioBackend::default())
        }
    };

    let stack = Arc::new(HttpDeviceStack::new(config.http.clone(), &config.device));
    let mut app = Application::new(config, backend, stack.clone());

    info!("Initializing...");
    app.configure().map_err(std::io::Error::other)?;

    let commands = LinesStream::new(BufReader::new(tokio::io::stdin()).lines())
        .filter_map(|line| line.ok());
    let shutdown = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            log::warn!("Failed to listen for Ctrl-C: {e}");
            std::future::pending::<()>().await;
        }
    };

    let result = app.run(commands, shutdown).await;
    stack.stopped().await;

    result.map_err(std::io::Error::other)
}
