//! HTTP routing: `/<prefix>/<class>/<name>[/...]` (§6 "HTTP routing").
//!
//! A GET carrying WebSocket upgrade headers is admitted into the duplex
//! protocol; every other request is admitted and forwarded to the agent's
//! `on_request` hook. Requests that don't match the prefixed shape never
//! reach an agent and fall through to axum's default 404.

use std::sync::Arc;

use agent_runtime::actor::HttpRequest as AgentHttpRequest;
use axum::body::Bytes;
use axum::extract::ws::WebSocketUpgrade;
use axum::extract::{Path, State};
use axum::http::{Method, StatusCode, Uri};
use axum::response::{IntoResponse, Response};
use axum::routing::any;
use axum::Router;

use crate::connection::handle_socket;
use crate::state::ServerState;

pub fn router(state: Arc<ServerState>) -> Router {
    let prefix = state.prefix.clone();
    Router::new()
        .route(&format!("/{prefix}/:class/:name"), any(agent_handler))
        .route(&format!("/{prefix}/:class/:name/*rest"), any(agent_handler))
        .with_state(state)
}

async fn agent_handler(
    State(state): State<Arc<ServerState>>,
    Path(path_params): Path<std::collections::HashMap<String, String>>,
    method: Method,
    uri: Uri,
    ws: Option<WebSocketUpgrade>,
    body: Bytes,
) -> Response {
    let (Some(class), Some(name)) = (path_params.get("class").cloned(), path_params.get("name").cloned())
    else {
        return (StatusCode::NOT_FOUND, "missing class/name").into_response();
    };

    let handle = match state.admit(&class, &name).await {
        Ok(h) => h,
        Err(e) => return error_response(e),
    };

    if let Some(ws) = ws {
        let path = uri.path().to_string();
        return ws.on_upgrade(move |socket| handle_socket(socket, handle, path));
    }

    let req = AgentHttpRequest {
        method: method.to_string(),
        path: uri.path().to_string(),
        body: body.to_vec(),
    };
    match handle.request(req).await {
        Ok(resp) => {
            let status = StatusCode::from_u16(resp.status).unwrap_or(StatusCode::OK);
            (status, resp.body).into_response()
        }
        Err(e) => error_response(e),
    }
}

fn error_response(err: agent_runtime::error::AgentError) -> Response {
    use agent_runtime::error::AgentError::*;
    let status = match err {
        NotFound(_) => StatusCode::NOT_FOUND,
        InvalidRequest(_) => StatusCode::BAD_REQUEST,
        Unauthorized(_) => StatusCode::UNAUTHORIZED,
        Conflict(_) => StatusCode::CONFLICT,
        Timeout(_) => StatusCode::GATEWAY_TIMEOUT,
        Downstream(_) => StatusCode::BAD_GATEWAY,
        Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
    };
    (status, err.to_string()).into_response()
}

#[cfg(test)]
mod tests {
    use super::*;
    use agent_runtime::actor::{Agent, ActorContext};
    use agent_runtime::error::AgentError;
    use async_trait::async_trait;
    use axum::body::Body;
    use axum::http::Request;
    use tower::ServiceExt;

    struct HelloAgent;

    #[async_trait]
    impl Agent for HelloAgent {
        async fn on_request(
            &self,
            _ctx: &ActorContext,
            req: agent_runtime::actor::HttpRequest,
        ) -> Result<agent_runtime::actor::HttpResponse, AgentError> {
            Ok(agent_runtime::actor::HttpResponse {
                status: 200,
                body: format!("hello from {}", req.path).into_bytes(),
            })
        }
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn plain_http_request_reaches_on_request() {
        let dir = tempfile::tempdir().unwrap();
        let state = Arc::new(ServerState::new(dir.path()));
        state.register_class("demo", std::sync::Arc::new(|| std::sync::Arc::new(HelloAgent) as std::sync::Arc<dyn Agent>));
        let app = router(state);

        let response = app
            .oneshot(
                Request::builder()
                    .uri("/agents/demo/room-1")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn unknown_class_returns_not_found() {
        let dir = tempfile::tempdir().unwrap();
        let state = Arc::new(ServerState::new(dir.path()));
        let app = router(state);

        let response = app
            .oneshot(
                Request::builder()
                    .uri("/agents/missing/room-1")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }
}
