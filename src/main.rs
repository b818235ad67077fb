use std::sync::Arc;

use kwdb_datasource::{api::server, config::ServerConfig, datasource::DataSource, logging, metrics};
use tracing::error;

#[tokio::main]
async fn main() {
    logging::init_logger(env!("CARGO_CRATE_NAME"));

    let config = match ServerConfig::from_env() {
        Ok(config) => config,
        Err(e) => {
            error!("Invalid configuration: {}", e);
            std::process::exit(1);
        }
    };

    metrics::init_metrics();

    let datasource = Arc::new(DataSource::start(config.instance).await);
    let result = server::serve(datasource.clone(), config.port).await;
    datasource.dispose();

    if let Err(e) = result {
        error!("Server stopped: {}", e);
        std::process::exit(1);
    }
}
