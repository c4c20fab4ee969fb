use actix_web::{App, HttpServer, middleware::Compress, middleware::DefaultHeaders};
use actix_cors::Cors;
use utoipa_swagger_ui::SwaggerUi;

mod auth;
mod detector;
mod error;
mod models;
mod moderation;
mod openapi;
mod repo;
mod routes;
mod storage;
mod worker;

#[cfg(feature = "inmem-store")]
use repo::inmem::InMemRepo;
use detector::ModelConfig;
use moderation::{ModerationConfig, ModerationService};
use openapi::ApiDoc;
use routes::{config, AppState};
use storage::build_media_store;
use utoipa::OpenApi; // bring trait into scope for ApiDoc::openapi()
use worker::ModerationQueue;
use std::sync::Arc;
use tracing::{error, info, Level};
use tracing_subscriber::EnvFilter;
use tracing_actix_web::TracingLogger;

#[actix_web::main]
async fn main() -> std::io::Result<()> {
    // Environment variables must be set externally (shell, systemd, Docker, etc.)
    // Load .env automatically only in debug builds to reduce manual setup overhead.
    if cfg!(debug_assertions) {
        let _ = dotenv::dotenv();
    }

    validate_env_vars();

    // Structured logging initialisation
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env().add_directive(Level::INFO.into()))
        .init();

    if let Err(e) = metrics_exporter_prometheus::PrometheusBuilder::new().install() {
        tracing::warn!("prometheus exporter not started: {e}");
    }

    info!("Bootstrapping clearfeed server");

    // The detector is mandatory: a post can never leave `pending` without it,
    // so refuse to serve when the weights cannot be obtained.
    let model_cfg = ModelConfig::from_env();
    let classifier = match detector::get_model(&model_cfg).await {
        Ok(model) => model,
        Err(e) => {
            error!("failed to initialize authenticity detector: {e:#}");
            std::process::exit(1);
        }
    };
    info!("authenticity detector ready");

    #[cfg(all(feature = "inmem-store", not(feature = "postgres-store")))]
    let repo = InMemRepo::new();
    #[cfg(all(feature = "inmem-store", not(feature = "postgres-store")))]
    info!("Using in-memory repository backend");

    #[cfg(feature = "postgres-store")]
    let repo = {
        use sqlx::postgres::PgPoolOptions;
        let db_url = std::env::var("DATABASE_URL").expect("DATABASE_URL must be set for postgres-store");
        let pool = PgPoolOptions::new()
            .max_connections(5)
            .connect_lazy(&db_url)
            .expect("Failed to create Pg pool");
        info!("Using Postgres repository backend");
        crate::repo::pg::PgRepo::new(pool)
    };

    let media_store = build_media_store().await;
    let repo: Arc<dyn repo::Repo> = Arc::new(repo);

    let service = Arc::new(ModerationService::new(
        repo.clone(),
        media_store.clone(),
        classifier,
        ModerationConfig::from_env(),
    ));
    let queue = ModerationQueue::spawn(service, ModerationQueue::default_workers());

    let openapi = ApiDoc::openapi();
    info!("OpenAPI spec generated");

    let state = AppState { repo, media_store, queue };

    let server = HttpServer::new(move || {
        let cors = {
            let mut c = Cors::default()
                .allowed_origin("http://localhost:3000")
                .allowed_origin("http://127.0.0.1:3000")
                .allow_any_header()
                .allowed_methods(["GET", "POST", "PUT", "PATCH", "DELETE", "OPTIONS"])
                .supports_credentials()
                .max_age(3600);
            if let Ok(front) = std::env::var("FRONTEND_URL") {
                c = c.allowed_origin(&front);
            }
            c
        };

        App::new()
            .wrap(TracingLogger::default())
            .wrap(Compress::default())
            .wrap(
                DefaultHeaders::new()
                    .add(("X-Content-Type-Options", "nosniff"))
                    .add(("X-Frame-Options", "DENY"))
                    .add(("Referrer-Policy", "no-referrer")),
            )
            .wrap(cors)
            .configure(config)
            .service(SwaggerUi::new("/docs").url("/docs/openapi.json", openapi.clone()))
            .app_data(actix_web::web::Data::new(state.clone()))
    })
    .bind(("0.0.0.0", 8080))?;

    info!("Listening on http://0.0.0.0:8080 (all interfaces)");

    server.run().await
}

/// Validate that required environment variables are set
fn validate_env_vars() {
    use std::env;

    let required = vec![
        "JWT_SECRET",
    ];

    let mut missing = Vec::new();
    for var in required {
        if env::var(var).is_err() {
            missing.push(var);
        }
    }

    if !missing.is_empty() {
        eprintln!("Missing required environment variables: {:?}", missing);
        eprintln!("Please copy .env.example to .env and configure it");
        std::process::exit(1);
    }

    if let Ok(secret) = env::var("JWT_SECRET") {
        if secret.len() < 32 {
            eprintln!("JWT_SECRET must be at least 32 characters long for security");
            std::process::exit(1);
        }
    }

    // Weights can be pre-seeded on disk; warn when neither cache nor URL exists.
    if env::var("MODEL_BACKBONE_URL").is_err() || env::var("MODEL_HEAD_URL").is_err() {
        eprintln!("Warning: MODEL_BACKBONE_URL/MODEL_HEAD_URL not set");
        eprintln!("Startup will fail unless weights are already present under MODEL_DIR");
    }
}
