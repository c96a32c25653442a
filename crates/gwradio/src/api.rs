use std::net::SocketAddr;
use std::sync::Arc;

use axum::Json;
use axum::Router;
use axum::extract::Path;
use axum::extract::State;
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::response::Response;
use axum::routing::delete;
use axum::routing::get;
use axum::routing::post;
use serde::Serialize;
use serde_json::Value;
use tokio::net::TcpListener;
use tower_http::trace::TraceLayer;

use crate::engine::Engine;
use crate::engine::EntryError;
use crate::engine::FlowError;
use crate::engine::MediaPlayerCommand;

/// Response for the /v1/ping endpoint
#[derive(Serialize)]
struct PingResponse {
    status: String,
}

/// Response for the /v1/info endpoint
#[derive(Serialize)]
struct InfoResponse {
    version: String,
    hostname: String,
    integrations: Vec<String>,
}

/// Body of every error response
#[derive(Serialize)]
struct ErrorResponse {
    error: String,
    message: String,
}

fn error_response(status: StatusCode, error: &str, message: impl ToString) -> Response {
    (
        status,
        Json(ErrorResponse {
            error: error.to_string(),
            message: message.to_string(),
        }),
    )
        .into_response()
}

/// Shared application state
#[derive(Clone)]
struct AppState {
    version: &'static str,
    engine: Arc<Engine>,
}

/// Handler for GET /v1/ping
#[tracing::instrument]
async fn ping() -> impl IntoResponse {
    tracing::debug!("Handling /v1/ping request");
    (
        StatusCode::OK,
        Json(PingResponse {
            status: "ok".to_string(),
        }),
    )
}

/// Handler for GET /v1/info
#[tracing::instrument(skip(state))]
async fn info(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    tracing::debug!("Handling /v1/info request");

    let hostname = hostname::get()
        .ok()
        .and_then(|h| h.into_string().ok())
        .unwrap_or_else(|| "unknown".to_string());

    let mut integrations = state.engine.integration_names();
    integrations.sort();

    (
        StatusCode::OK,
        Json(InfoResponse {
            version: state.version.to_string(),
            hostname,
            integrations,
        }),
    )
}

/// Handler for GET /v1/media_players
#[tracing::instrument(skip(state))]
async fn list_media_players(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let snapshot = state.engine.state_snapshot();
    (StatusCode::OK, Json(snapshot.media_players.clone()))
}

/// Handler for GET /v1/media_players/:entity_id
#[tracing::instrument(skip(state))]
async fn get_media_player(
    State(state): State<Arc<AppState>>,
    Path(entity_id): Path<String>,
) -> Response {
    let snapshot = state.engine.state_snapshot();
    match snapshot.media_players.get(&entity_id) {
        Some(player) => (StatusCode::OK, Json(player.clone())).into_response(),
        None => error_response(
            StatusCode::NOT_FOUND,
            "not_found",
            format!("Media player not found: {}", entity_id),
        ),
    }
}

/// Map a service name and its data to a media player command
fn parse_service(service: &str, data: &Value) -> Result<MediaPlayerCommand, String> {
    match service {
        "turn_on" => Ok(MediaPlayerCommand::TurnOn),
        "turn_off" => Ok(MediaPlayerCommand::TurnOff),
        "volume_up" => Ok(MediaPlayerCommand::VolumeUp),
        "volume_down" => Ok(MediaPlayerCommand::VolumeDown),
        "volume_set" => data
            .get("volume_level")
            .cloned()
            .map(|volume_level| MediaPlayerCommand::VolumeSet { volume_level })
            .ok_or_else(|| "volume_set requires volume_level".to_string()),
        "volume_mute" => data
            .get("is_volume_muted")
            .and_then(Value::as_bool)
            .map(|is_volume_muted| MediaPlayerCommand::VolumeMute { is_volume_muted })
            .ok_or_else(|| "volume_mute requires a boolean is_volume_muted".to_string()),
        other => Err(format!("Unknown service: {}", other)),
    }
}

/// Handler for POST /v1/media_players/:entity_id/:service
#[tracing::instrument(skip(state, body))]
async fn call_service(
    State(state): State<Arc<AppState>>,
    Path((entity_id, service)): Path<(String, String)>,
    body: Option<Json<Value>>,
) -> Response {
    let data = body.map(|Json(v)| v).unwrap_or(Value::Null);
    let command = match parse_service(&service, &data) {
        Ok(command) => command,
        Err(message) => return error_response(StatusCode::BAD_REQUEST, "invalid_service", message),
    };

    match state.engine.send_media_player_command(entity_id, command) {
        Ok(()) => StatusCode::ACCEPTED.into_response(),
        Err(e) => {
            let not_found = e
                .downcast_ref::<std::io::Error>()
                .is_some_and(|io| io.kind() == std::io::ErrorKind::NotFound);
            if not_found {
                error_response(StatusCode::NOT_FOUND, "not_found", e)
            } else {
                error_response(StatusCode::INTERNAL_SERVER_ERROR, "internal", e)
            }
        }
    }
}

/// Handler for POST /v1/entries/:domain
#[tracing::instrument(skip(state, input))]
async fn create_entry(
    State(state): State<Arc<AppState>>,
    Path(domain): Path<String>,
    Json(input): Json<Value>,
) -> Response {
    match state.engine.start_config_flow(&domain, input).await {
        Ok(result) => (StatusCode::CREATED, Json(result)).into_response(),
        Err(e) => {
            let status = match &e {
                FlowError::AlreadyConfigured => StatusCode::CONFLICT,
                FlowError::UnknownDomain(_) => StatusCode::NOT_FOUND,
                FlowError::CannotConnect | FlowError::InvalidInput(_) => StatusCode::BAD_REQUEST,
            };
            error_response(status, e.key(), &e)
        }
    }
}

/// Handler for DELETE /v1/entries/:domain/:entry_id
#[tracing::instrument(skip(state))]
async fn remove_entry(
    State(state): State<Arc<AppState>>,
    Path((domain, entry_id)): Path<(String, String)>,
) -> Response {
    match state.engine.remove_entry(&domain, &entry_id).await {
        Ok(()) => StatusCode::NO_CONTENT.into_response(),
        Err(e @ (EntryError::NotFound(_) | EntryError::UnknownDomain(_))) => {
            error_response(StatusCode::NOT_FOUND, "not_found", e)
        }
        Err(e @ EntryError::UnloadFailed { .. }) => {
            error_response(StatusCode::INTERNAL_SERVER_ERROR, "unload_failed", e)
        }
    }
}

/// Create the API router with all endpoints
fn create_router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/v1/ping", get(ping))
        .route("/v1/info", get(info))
        .route("/v1/media_players", get(list_media_players))
        .route("/v1/media_players/:entity_id", get(get_media_player))
        .route("/v1/media_players/:entity_id/:service", post(call_service))
        .route("/v1/entries/:domain", post(create_entry))
        .route("/v1/entries/:domain/:entry_id", delete(remove_entry))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Start the HTTP API server
///
/// This function will bind to the specified address and serve the API endpoints.
/// It will run until the provided shutdown signal is triggered.
///
/// # Arguments
/// * `listen` - The IP address to listen on (e.g., "127.0.0.1")
/// * `port` - The port to listen on (e.g., 8565)
/// * `engine` - The engine commands are routed through
/// * `shutdown_rx` - A oneshot receiver that will trigger graceful shutdown
pub async fn serve(
    listen: &str,
    port: u16,
    engine: Arc<Engine>,
    shutdown_rx: tokio::sync::oneshot::Receiver<()>,
) -> anyhow::Result<()> {
    let version = env!("CARGO_PKG_VERSION");

    let state = Arc::new(AppState { version, engine });
    let app = create_router(state);

    let addr: SocketAddr = format!("{}:{}", listen, port).parse()?;
    tracing::info!("Starting HTTP API server on {}", addr);

    let listener = TcpListener::bind(addr).await?;

    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            shutdown_rx.await.ok();
            tracing::info!("HTTP API server shutting down gracefully");
        })
        .await?;

    Ok(())
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;
    use std::time::Duration;

    use axum::body::Body;
    use axum::http::Request;
    use serde_json::json;
    use tower::ServiceExt;

    use super::*;
    use crate::integrations::xiaomi_gateway_radio::EntryData;
    use crate::integrations::xiaomi_gateway_radio::GatewayRadioConfig;
    use crate::integrations::xiaomi_gateway_radio::GatewayRadioIntegration;
    use crate::integrations::xiaomi_gateway_radio::device::MockConnector;

    const TOKEN: &str = "0123456789abcdef0123456789abcdef";

    async fn router() -> (Router, MockConnector) {
        let connector = MockConnector::new();
        let config = GatewayRadioConfig {
            scan_interval_secs: 3600,
            entries: HashMap::from([(
                "kitchen".to_string(),
                EntryData {
                    host: "192.168.1.20".to_string(),
                    token: TOKEN.to_string(),
                    name: "Kitchen Radio".to_string(),
                    volume_step: 5,
                },
            )]),
        };

        let mut engine = Engine::new();
        engine.register_integration(
            "xiaomi_gateway_radio".to_string(),
            Box::new(GatewayRadioIntegration::new(
                &config,
                Some(Arc::new(connector.clone())),
            )),
        );
        let engine = Arc::new(engine);

        let runner = engine.clone();
        tokio::spawn(async move {
            let _ = runner.run().await;
        });

        for _ in 0..100 {
            if engine
                .state_snapshot()
                .media_players
                .contains_key("media_player.kitchen")
            {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }

        let state = Arc::new(AppState {
            version: "test",
            engine,
        });
        (create_router(state), connector)
    }

    async fn request(router: &Router, method: &str, uri: &str, body: Option<Value>) -> (StatusCode, Value) {
        let mut builder = Request::builder().method(method).uri(uri);
        let body = match body {
            Some(json) => {
                builder = builder.header("content-type", "application/json");
                Body::from(json.to_string())
            }
            None => Body::empty(),
        };

        let response = router
            .clone()
            .oneshot(builder.body(body).unwrap())
            .await
            .unwrap();
        let status = response.status();
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        let json = if bytes.is_empty() {
            Value::Null
        } else {
            serde_json::from_slice(&bytes).unwrap()
        };
        (status, json)
    }

    #[test]
    fn test_parse_service() {
        assert_eq!(
            parse_service("volume_set", &json!({"volume_level": "abc"})),
            Ok(MediaPlayerCommand::VolumeSet {
                volume_level: json!("abc")
            })
        );
        assert_eq!(
            parse_service("volume_mute", &json!({"is_volume_muted": true})),
            Ok(MediaPlayerCommand::VolumeMute {
                is_volume_muted: true
            })
        );
        assert!(parse_service("volume_mute", &json!({"is_volume_muted": "yes"})).is_err());
        assert!(parse_service("volume_set", &Value::Null).is_err());
        assert!(parse_service("play_media", &Value::Null).is_err());
    }

    #[tokio::test]
    async fn test_ping_and_info() {
        let (router, _) = router().await;

        let (status, body) = request(&router, "GET", "/v1/ping", None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body, json!({"status": "ok"}));

        let (status, body) = request(&router, "GET", "/v1/info", None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["version"], "test");
        assert_eq!(body["integrations"], json!(["xiaomi_gateway_radio"]));
    }

    #[tokio::test]
    async fn test_media_player_state() {
        let (router, _) = router().await;

        let (status, body) = request(&router, "GET", "/v1/media_players", None).await;
        assert_eq!(status, StatusCode::OK);
        assert!(body.get("media_player.kitchen").is_some());

        let (status, body) =
            request(&router, "GET", "/v1/media_players/media_player.kitchen", None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["friendly_name"], "Kitchen Radio");
        assert_eq!(body["unique_id"], "lumi.gateway.v3-34:CE:00:AA:BB:CC-fm");
        assert_eq!(body["attributes"]["volume_step"], 5);

        let (status, body) =
            request(&router, "GET", "/v1/media_players/media_player.nope", None).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        assert_eq!(body["error"], "not_found");
    }

    #[tokio::test]
    async fn test_call_service() {
        let (router, connector) = router().await;

        let (status, _) = request(
            &router,
            "POST",
            "/v1/media_players/media_player.kitchen/volume_mute",
            Some(json!({"is_volume_muted": true})),
        )
        .await;
        assert_eq!(status, StatusCode::ACCEPTED);

        for _ in 0..100 {
            if !connector.client.sent_volumes().is_empty() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(connector.client.sent_volumes(), vec![0]);

        let (status, body) = request(
            &router,
            "POST",
            "/v1/media_players/media_player.kitchen/volume_set",
            None,
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["error"], "invalid_service");

        let (status, _) = request(
            &router,
            "POST",
            "/v1/media_players/media_player.nope/turn_on",
            None,
        )
        .await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_entries() {
        let (router, _) = router().await;

        let (status, body) = request(
            &router,
            "POST",
            "/v1/entries/xiaomi_gateway_radio",
            Some(json!({"host": "192.168.1.20", "token": TOKEN})),
        )
        .await;
        assert_eq!(status, StatusCode::CONFLICT);
        assert_eq!(body["error"], "already_configured");

        let (status, body) = request(
            &router,
            "POST",
            "/v1/entries/xiaomi_gateway_radio",
            Some(json!({"host": "192.168.1.21", "token": TOKEN, "name": "Study"})),
        )
        .await;
        assert_eq!(status, StatusCode::CREATED);
        assert_eq!(body["title"], "Study");

        let (status, body) = request(
            &router,
            "POST",
            "/v1/entries/xiaomi_gateway_radio",
            Some(json!({"token": TOKEN})),
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["error"], "invalid_input");

        let (status, _) = request(
            &router,
            "POST",
            "/v1/entries/zigbee",
            Some(json!({"host": "192.168.1.22", "token": TOKEN})),
        )
        .await;
        assert_eq!(status, StatusCode::NOT_FOUND);

        let (status, _) = request(
            &router,
            "DELETE",
            "/v1/entries/xiaomi_gateway_radio/kitchen",
            None,
        )
        .await;
        assert_eq!(status, StatusCode::NO_CONTENT);

        let (status, _) = request(
            &router,
            "DELETE",
            "/v1/entries/xiaomi_gateway_radio/kitchen",
            None,
        )
        .await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }
}
