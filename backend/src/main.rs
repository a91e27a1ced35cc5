use actix_cors::Cors;
use actix_web::{http::header, middleware::Logger, App, HttpServer};
use dermascan::config::{AppConfig, HistoryBackend};
use dermascan::history::dynamodb::DynamoDbHistoryStore;
use dermascan::history::memory::MemoryHistoryStore;
use dermascan::history::HistoryService;
use dermascan::imaging::loader::ImageLoader;
use dermascan::imaging::preprocess::Preprocessor;
use dermascan::model::handler::ModelHandler;
use dermascan::model::runtime::load_runtime;
use dermascan::model::ModelError;
use dermascan::routes::{configure_services, AppServices};
use std::io;
use std::sync::Arc;

#[actix_web::main]
async fn main() -> io::Result<()> {
    dotenv::dotenv().ok();
    env_logger::init_from_env(env_logger::Env::new().default_filter_or("info"));

    let config = AppConfig::from_env().map_err(startup_error)?;

    let preprocessor = Preprocessor::new(
        config.image.width,
        config.image.height,
        config.image.layout,
    );
    let model = ModelHandler::new(
        config.model.labels.clone(),
        config.model.threshold,
        preprocessor.input_shape(),
    )
    .with_activation(config.model.activation);

    match load_runtime(&config.model).and_then(|runtime| model.install(runtime)) {
        Ok(()) => {}
        Err(e @ ModelError::LabelMismatch { .. }) => {
            log::error!("Model does not match the configured class labels: {}", e);
            return Err(startup_error(e));
        }
        Err(e) if config.model.required => {
            log::error!("Failed to load model at startup: {}", e);
            return Err(startup_error(e));
        }
        Err(e) => {
            log::error!("Failed to load model, serving as unhealthy: {}", e);
        }
    }

    let loader = ImageLoader::new(config.image.fetch_timeout, config.image.max_bytes)
        .map_err(startup_error)?
        .with_decode_limits(config.image.decode_limits);

    let history = match config.history.backend {
        HistoryBackend::None => HistoryService::disabled(),
        HistoryBackend::Memory => HistoryService::new(Arc::new(MemoryHistoryStore::new())),
        HistoryBackend::DynamoDb => {
            let store = DynamoDbHistoryStore::from_env(config.history.table.clone()).await;
            if let Err(e) = store.check_table().await {
                log::warn!(
                    "History table '{}' is not ready, writes will fail until it is: {}",
                    store.table(),
                    e
                );
            }
            HistoryService::new(Arc::new(store))
        }
    };

    if history.is_enabled() {
        log::info!("Recording prediction history ({:?})", config.history.backend);
    } else {
        log::info!("Prediction history is disabled");
    }

    let services = AppServices::new(model, preprocessor, loader, history);
    let bind_address = config.bind_address();

    log::info!("Starting server on {}", bind_address);

    HttpServer::new(move || {
        App::new()
            .wrap(
                Cors::default()
                    .allow_any_origin()
                    .allowed_methods(vec!["GET", "POST", "OPTIONS"])
                    .allowed_headers(vec![header::ACCEPT, header::CONTENT_TYPE])
                    .max_age(3600),
            )
            .wrap(Logger::default())
            .configure(|cfg| configure_services(cfg, &services))
    })
    .bind(&bind_address)?
    .run()
    .await
}

fn startup_error(err: impl std::fmt::Display) -> io::Error {
    io::Error::other(err.to_string())
}
