use log::warn;
use std::sync::Arc;

use actix_web::{HttpRequest, HttpResponse, Resource, Responder, Route, guard, http::Method, web};
use actix_ws::{Message, MessageStream, Session};
use parking_lot::RwLock;
use tokio::sync::broadcast;
use tokio_stream::StreamExt;
use tokio_stream::wrappers::BroadcastStream;
use tokio_stream::wrappers::errors::BroadcastStreamRecvError;

use crate::datapoint::{DatapointId, DatapointStore, DatapointUpdate, SwitchValue};
use crate::device::DeviceIdentity;
use crate::error::AppError;

#[derive(Clone)]
pub struct AppState {
    pub store: Arc<DatapointStore>,
    pub identity: Arc<RwLock<DeviceIdentity>>,
}

async fn handle_update_websocket(
    mut session: Session,
    mut client_stream: MessageStream,
    rx: broadcast::Receiver<DatapointUpdate>,
    filter: Option<DatapointId>,
) {
    let mut updates = BroadcastStream::new(rx);

    loop {
        tokio::select! {
            msg = client_stream.recv() => {
                let Some(msg) = msg else { break; };

                match msg {
                    Ok(Message::Ping(bytes)) => {
                        let _ = session.pong(&bytes).await;
                    }
                    Ok(Message::Close(reason)) => {
                        let _ = session.close(reason).await;
                        break;
                    }
                    Ok(_) => {}
                    Err(_) => break,
                }
            }
            update = updates.next() => {
                let Some(update) = update else { break; };

                match update {
                    Ok(update) => {
                        if filter.is_some_and(|id| id != update.id) {
                            continue;
                        }
                        if let Ok(text) = serde_json::to_string(&update)
                            && session.text(text).await.is_err()
                        {
                            warn!("WebSocket client disconnected");
                            break;
                        }
                    }
                    Err(BroadcastStreamRecvError::Lagged(n)) => {
                        let msg = AppError::Stack(format!("Update stream lagged by {n} messages"));
                        if session.text(msg.to_string()).await.is_err() {
                            warn!("WebSocket client lagged and disconnected");
                            break;
                        }
                    }
                }
            }
        }
    }
}

fn get_only(path: &str, handler: Route) -> Resource {
    web::resource(path).route(handler).route(
        web::route()
            .guard(guard_not_methods(&[Method::GET]))
            .to(method_not_allowed),
    )
}

pub fn api_scope(base_path: &str) -> actix_web::Scope {
    web::scope(base_path)
        .service(get_only("/device", web::get().to(device_info)))
        .service(get_only("/datapoints", web::get().to(list_datapoints)))
        .service(get_only("/datapoints/events", web::get().to(updates_ws_all)))
        .service(get_only("/datapoint/{name}", web::get().to(datapoint)))
        .service(get_only("/datapoint/{name}/events", web::get().to(updates_ws_one)))
        .service(
            web::resource("/datapoint/{name}/value")
                .route(web::get().to(get_value))
                .route(web::post().to(set_value))
                .route(
                    web::route()
                        .guard(guard_not_methods(&[Method::GET, Method::POST]))
                        .to(method_not_allowed),
                ),
        )
}

async fn device_info(state: web::Data<AppState>) -> impl Responder {
    web::Json(state.identity.read().clone())
}

async fn list_datapoints(state: web::Data<AppState>) -> impl Responder {
    web::Json(state.store.list())
}

async fn datapoint(
    req: HttpRequest,
    state: web::Data<AppState>,
) -> Result<impl Responder, AppError> {
    let id = resolve_name(&req, &state)?;

    Ok(web::Json(state.store.get(id)?))
}

async fn get_value(
    req: HttpRequest,
    state: web::Data<AppState>,
) -> Result<impl Responder, AppError> {
    let id = resolve_name(&req, &state)?;

    Ok(web::Json(state.store.value(id)?))
}

async fn set_value(
    req: HttpRequest,
    body: web::Bytes,
    state: web::Data<AppState>,
) -> Result<impl Responder, AppError> {
    let id = resolve_name(&req, &state)?;
    let value = parse_value_payload(&body)?;

    state.store.network_write(id, value)?;

    Ok(web::Json(value))
}

async fn updates_ws_all(
    req: HttpRequest,
    stream: web::Payload,
    state: web::Data<AppState>,
) -> Result<HttpResponse, AppError> {
    open_update_websocket(req, stream, &state, None)
}

async fn updates_ws_one(
    req: HttpRequest,
    stream: web::Payload,
    state: web::Data<AppState>,
) -> Result<HttpResponse, AppError> {
    let id = resolve_name(&req, &state)?;
    open_update_websocket(req, stream, &state, Some(id))
}

fn open_update_websocket(
    req: HttpRequest,
    stream: web::Payload,
    state: &AppState,
    filter: Option<DatapointId>,
) -> Result<HttpResponse, AppError> {
    let rx = state.store.subscribe();
    let (response, session, client_stream) = actix_ws::handle(&req, stream)
        .map_err(|e| AppError::Stack(format!("Websocket error: {e}")))?;

    actix_web::rt::spawn(async move {
        handle_update_websocket(session, client_stream, rx, filter).await;
    });

    Ok(response)
}

fn resolve_name(req: &HttpRequest, state: &AppState) -> Result<DatapointId, AppError> {
    let name = req
        .match_info()
        .get("name")
        .ok_or_else(|| AppError::InvalidValue("Missing datapoint name".into()))?;

    state.store.resolve(name)
}

fn parse_value_payload(body: &[u8]) -> Result<SwitchValue, AppError> {
    if body.is_empty() {
        return Err(AppError::InvalidValue("Empty value payload".into()));
    }

    serde_json::from_slice(body)
        .map_err(|e| AppError::InvalidValue(format!("Invalid value payload: {e}")))
}

async fn method_not_allowed() -> HttpResponse {
    HttpResponse::MethodNotAllowed().finish()
}

fn guard_not_methods(methods: &[Method]) -> impl guard::Guard {
    let allowed: Vec<Method> = methods.to_vec();
    guard::fn_guard(move |ctx| !allowed.iter().any(|m| m == ctx.head().method))
}
