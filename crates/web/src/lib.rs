//! Operator HTTP API over the session controller.

pub mod error;
pub mod handlers;

use actix_web::{App, HttpResponse, HttpServer, error::JsonPayloadError, middleware, web};

use herald_protocol::api::ErrorResponse;
use herald_session::SessionController;

pub use error::ApiError;

/// Upper bound for a JSON body. Uploaded message files and credential
/// backups travel inline.
pub const MAX_JSON_BODY: usize = 16 * 1024 * 1024;

/// Registers every route on `cfg`.
pub fn configure(cfg: &mut web::ServiceConfig) {
    cfg.app_data(
        web::JsonConfig::default()
            .limit(MAX_JSON_BODY)
            .error_handler(|err, _req| {
                let response = json_error_response(&err);
                actix_web::error::InternalError::from_response(err, response).into()
            }),
    )
    .route("/health", web::get().to(handlers::health))
    .service(
        web::scope("/api")
            .route("/status", web::get().to(handlers::status))
            .route("/pairing", web::post().to(handlers::pairing))
            .route("/start", web::post().to(handlers::start))
            .route("/stop", web::post().to(handlers::stop)),
    );
}

fn json_error_response(err: &JsonPayloadError) -> HttpResponse {
    HttpResponse::BadRequest().json(ErrorResponse {
        error: "Invalid request body".into(),
        details: err.to_string(),
    })
}

/// Creates the HTTP server bound to `bind_addr`.
///
/// # Example
/// ```ignore
/// let session = web::Data::new(SessionController::new(connector, store, config));
/// let server = herald_web::create_http_server(session, "127.0.0.1:3000")?;
/// server.await?;
/// ```
pub fn create_http_server(
    session: web::Data<SessionController>,
    bind_addr: &str,
) -> std::io::Result<actix_web::dev::Server> {
    let server = HttpServer::new(move || {
        App::new()
            .app_data(session.clone())
            .wrap(middleware::Logger::default())
            .configure(configure)
    })
    .bind(bind_addr)?
    .run();

    Ok(server)
}
