use serde_json::{json, Value};
use std::convert::Infallible;
use std::sync::Arc;
use warp::Filter;

use super::websocket;
use crate::config::IceConfig;
use crate::signaling::SignalingServer;

/// All HTTP and WebSocket routes, wrapped in the CORS policy.
pub fn routes(
    server: Arc<SignalingServer>,
    ice: IceConfig,
    cors_origin: &str,
) -> impl Filter<Extract = impl warp::Reply, Error = warp::Rejection> + Clone {
    signal_websocket_route(server.clone())
        .or(health_check(server))
        .or(config_endpoint(ice))
        .with(cors(cors_origin))
        .with(warp::trace::request())
}

pub fn signal_websocket_route(
    server: Arc<SignalingServer>,
) -> impl Filter<Extract = impl warp::Reply, Error = warp::Rejection> + Clone {
    warp::path("signal")
        .and(warp::path::end())
        .and(warp::ws())
        .and(with_server(server))
        .map(|ws: warp::ws::Ws, server: Arc<SignalingServer>| {
            ws.on_upgrade(move |socket| websocket::handle_signal_websocket(socket, server))
        })
}

pub fn health_check(
    server: Arc<SignalingServer>,
) -> impl Filter<Extract = impl warp::Reply, Error = warp::Rejection> + Clone {
    warp::path("health")
        .and(warp::path::end())
        .and(warp::get())
        .and(with_server(server))
        .and_then(|server: Arc<SignalingServer>| async move {
            let stats = server.stats().await;
            Ok::<_, warp::Rejection>(warp::reply::json(&json!({
                "status": "ok",
                "stats": stats,
                "timestamp": chrono::Utc::now().to_rfc3339(),
            })))
        })
}

pub fn config_endpoint(
    ice: IceConfig,
) -> impl Filter<Extract = impl warp::Reply, Error = warp::Rejection> + Clone {
    let body = json!({ "iceServers": browser_ice_servers(&ice) });

    warp::path("config")
        .and(warp::path::end())
        .and(warp::get())
        .map(move || warp::reply::json(&body))
}

/// ICE servers in the shape `RTCPeerConnection` expects in a browser.
pub fn browser_ice_servers(ice: &IceConfig) -> Vec<Value> {
    let mut servers = vec![];

    if !ice.stun_servers.is_empty() {
        servers.push(json!({ "urls": ice.stun_servers }));
    }

    for turn in &ice.turn_servers {
        servers.push(json!({
            "urls": turn.urls,
            "username": turn.username,
            "credential": turn.credential,
        }));
    }

    servers
}

fn cors(origin: &str) -> warp::cors::Builder {
    let builder = warp::cors()
        .allow_methods(vec!["GET", "POST", "OPTIONS"])
        .allow_headers(vec!["content-type"]);

    if origin == "*" {
        builder.allow_any_origin()
    } else {
        builder.allow_origin(origin)
    }
}

fn with_server(
    server: Arc<SignalingServer>,
) -> impl Filter<Extract = (Arc<SignalingServer>,), Error = Infallible> + Clone {
    warp::any().map(move || server.clone())
}
