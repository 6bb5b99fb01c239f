use std::fs;
use std::path::Path;
use std::sync::Arc;

use actix_web::dev::ServerHandle;
use actix_web::{App, HttpServer, web};
use log::{info, warn};
use parking_lot::{Mutex, RwLock};
use tokio::task::JoinHandle;

use crate::config::{DeviceConfig, HttpConfig};
use crate::datapoint::DatapointStore;
use crate::device::{DeviceIdentity, DeviceStack, DeviceState};
use crate::error::AppError;
use crate::routes::{AppState, api_scope};

struct RunningServer {
    handle: ServerHandle,
    task: JoinHandle<std::io::Result<()>>,
}

/// Must be started from inside an actix system.
pub struct HttpDeviceStack {
    http: HttpConfig,
    state: DeviceState,
    first_run: bool,
    identity: Arc<RwLock<DeviceIdentity>>,
    server: Mutex<Option<RunningServer>>,
}

impl HttpDeviceStack {
    pub fn new(http: HttpConfig, device: &DeviceConfig) -> Self {
        let state = DeviceState::new(&device.state_dir);
        Self {
            http,
            first_run: !state.exists(),
            state,
            identity: Arc::new(RwLock::new(DeviceIdentity::new(0))),
            server: Mutex::new(None),
        }
    }

    pub fn identity(&self) -> DeviceIdentity {
        self.identity.read().clone()
    }

    pub async fn stopped(&self) {
        let task = self.server.lock().take().map(|s| s.task);
        if let Some(task) = task {
            match task.await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => warn!("HTTP server exited with error: {e}"),
                Err(e) => warn!("HTTP server task failed: {e}"),
            }
        }
    }

    fn bind(&self, state: AppState) -> Result<(actix_web::dev::Server, String), AppError> {
        let scope_path = self.http.path.clone();
        let server = HttpServer::new(move || {
            App::new()
                .app_data(web::Data::new(state.clone()))
                .service(api_scope(&scope_path))
        })
        .workers(1)
        .disable_signals();

        let bind_err = |e: std::io::Error| AppError::Stack(format!("bind: {e}"));
        let (server, bind_addrs) = match (&self.http.unix_socket, &self.http.host) {
            (Some(socket_path), Some(host)) => {
                remove_stale_socket(socket_path)?;
                (
                    server
                        .bind_uds(socket_path)
                        .and_then(|s| s.bind_auto_h2c(host))
                        .map_err(bind_err)?,
                    format!("{socket_path} and {host}"),
                )
            }
            (Some(socket_path), None) => {
                remove_stale_socket(socket_path)?;
                (
                    server.bind_uds(socket_path).map_err(bind_err)?,
                    socket_path.clone(),
                )
            }
            (None, Some(host)) => (server.bind_auto_h2c(host).map_err(bind_err)?, host.clone()),
            (None, None) => {
                return Err(AppError::Config(
                    "either 'unix_socket' or 'host' must be specified".into(),
                ));
            }
        };

        Ok((server.run(), bind_addrs))
    }
}

fn remove_stale_socket(socket_path: &str) -> Result<(), AppError> {
    if Path::new(socket_path).exists() {
        fs::remove_file(socket_path)
            .map_err(|e| AppError::Stack(format!("remove stale socket {socket_path}: {e}")))?;
    }
    Ok(())
}

impl DeviceStack for HttpDeviceStack {
    fn start(&self, store: Arc<DatapointStore>, identity: DeviceIdentity) -> Result<(), AppError> {
        let mut server_slot = self.server.lock();
        if server_slot.is_some() {
            return Err(AppError::InvalidState("device stack already started".into()));
        }

        {
            let mut current = self.identity.write();
            *current = identity;
            current.name = self.state.load_name()?;
        }

        let state = AppState {
            store,
            identity: self.identity.clone(),
        };
        let (server, bind_addrs) = self.bind(state)?;
        let handle = server.handle();
        let task = actix_web::rt::spawn(server);

        info!("Serving datapoints on {bind_addrs}...");
        *server_slot = Some(RunningServer { handle, task });
        Ok(())
    }

    fn is_first_run(&self) -> bool {
        self.first_run
    }

    fn set_device_name(&self, name: &str) -> Result<(), AppError> {
        self.state.save_name(name)?;
        self.identity.write().name = Some(name.to_string());
        Ok(())
    }

    fn service(&self) -> Result<(), AppError> {
        match self.server.lock().as_ref() {
            Some(running) if running.task.is_finished() => {
                Err(AppError::Stack("HTTP server stopped unexpectedly".into()))
            }
            Some(_) => Ok(()),
            None => Err(AppError::InvalidState("device stack not started".into())),
        }
    }

    fn stop(&self) {
        if let Some(running) = self.server.lock().as_ref() {
            info!("Stopping HTTP server");
            // the stop command is queued before the returned future is polled
            drop(running.handle.stop(true));
        }
    }
}
