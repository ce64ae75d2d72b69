//! Management REST API for edge functions
//!
//! | Method | Path | Description |
//! |---|---|---|
//! | GET | `/functions` | List functions with their files |
//! | GET | `/functions/{name}` | Get one function with files |
//! | POST | `/functions` | Deploy (create or bump version) |
//! | DELETE | `/functions/{name}` | Delete a function |
//!
//! Every route requires `Authorization: Bearer <token>`; the token is checked
//! against the identity service before the handler runs.

pub mod handlers;

use axum::extract::{Request, State};
use axum::http::header::AUTHORIZATION;
use axum::middleware::{self, Next};
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::Router;
use std::net::SocketAddr;
use std::sync::Arc;
use tracing::{info, warn};

use crate::auth::{bearer_token, TokenVerifier};
use crate::functions::FunctionStore;

/// Shared state for API handlers.
#[derive(Clone)]
pub struct ApiState {
    pub functions: Arc<FunctionStore>,
    pub verifier: Arc<dyn TokenVerifier>,
}

/// Build the management router.
pub fn build_router(functions: Arc<FunctionStore>, verifier: Arc<dyn TokenVerifier>) -> Router {
    let state = ApiState { functions, verifier };

    Router::new()
        .route("/functions", get(handlers::list_functions).post(handlers::deploy_function))
        .route(
            "/functions/{name}",
            get(handlers::get_function).delete(handlers::delete_function),
        )
        .route_layer(middleware::from_fn_with_state(state.clone(), require_bearer))
        .with_state(state)
}

async fn require_bearer(State(state): State<ApiState>, request: Request, next: Next) -> Response {
    let header = request.headers().get(AUTHORIZATION).and_then(|v| v.to_str().ok());
    let token = match bearer_token(header) {
        Ok(token) => token.to_string(),
        Err(e) => return e.into_response(),
    };

    if let Err(e) = state.verifier.verify(&token).await {
        warn!(path = %request.uri().path(), "Rejected management request");
        return e.into_response();
    }

    next.run(request).await
}

/// Serve `router` on `addr` until Ctrl+C.
pub async fn serve(addr: SocketAddr, router: Router) -> std::io::Result<()> {
    info!(%addr, "Management API starting");
    let listener = tokio::net::TcpListener::bind(addr).await?;

    axum::serve(listener, router)
        .with_graceful_shutdown(async {
            if tokio::signal::ctrl_c().await.is_err() {
                warn!("Could not install Ctrl+C handler, serving until killed");
                std::future::pending::<()>().await;
            }
            info!("Shutdown signal received");
        })
        .await
}
