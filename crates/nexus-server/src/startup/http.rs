//! HTTP server setup

use actix_web::{App, HttpServer, dev::Server, middleware::Logger, web};

use crate::{api::route::routes, middleware::metrics::RequestMetrics, model::AppState};

/// Creates and binds the HTTP server.
pub fn main_server(
    app_state: AppState,
    address: String,
    port: u16,
) -> Result<Server, std::io::Error> {
    let data = web::Data::new(app_state);
    Ok(HttpServer::new(move || {
        App::new()
            .wrap(Logger::default())
            .wrap(RequestMetrics)
            .app_data(data.clone())
            .configure(routes)
    })
    .bind((address, port))?
    .disable_signals()
    .run())
}
