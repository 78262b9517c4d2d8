//! Reference handler: enough of the build protocol to identify clients and
//! end sessions cleanly.

use std::collections::BTreeMap;
use std::sync::{Mutex, PoisonError};

use kiln_bsp::{BuildHandler, ConnectionControl, Frame, HandlerError, SharedState};
use kiln_types::ClientId;
use serde_json::{Value, json};
use tokio_util::sync::CancellationToken;

pub const BSP_VERSION: &str = "2.1.0";

/// State shared by every connection of one server run.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BuildState {
    pub sessions: u64,
    /// Connected clients, keyed to the session number that identified them.
    pub connected: BTreeMap<ClientId, u64>,
}

pub struct SessionHandler {
    control: ConnectionControl,
    state: SharedState<BuildState>,
    joined: Mutex<Option<(ClientId, u64)>>,
}

impl SessionHandler {
    pub fn new(control: ConnectionControl, state: SharedState<BuildState>) -> Self {
        Self {
            control,
            state,
            joined: Mutex::new(None),
        }
    }

    /// Drop this connection's entry from `connected`. A newer session that
    /// has since taken over the identity is left alone.
    fn leave(&self) {
        let joined = self
            .joined
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some((client, session)) = joined {
            self.state.update(|state| {
                if state.connected.get(&client) == Some(&session) {
                    state.connected.remove(&client);
                }
            });
        }
    }

    async fn initialize(&self, params: Option<&Value>) -> Result<Value, HandlerError> {
        let params = params.ok_or_else(|| HandlerError::invalid_params("missing params"))?;
        let client = client_identity(params)?;

        self.control
            .register_client(client.clone())
            .await
            .map_err(|e| HandlerError::internal(e.to_string()))?;
        let mut session = 0;
        self.state.update(|state| {
            state.sessions += 1;
            session = state.sessions;
            state.connected.insert(client.clone(), session);
        });
        *self.joined.lock().unwrap_or_else(PoisonError::into_inner) = Some((client, session));

        Ok(json!({
            "displayName": "kiln",
            "version": env!("CARGO_PKG_VERSION"),
            "bspVersion": BSP_VERSION,
            "capabilities": {},
        }))
    }

    fn exit(&self) {
        self.control.unregister_client();
        self.leave();
        self.control.request_exit();
    }
}

impl Drop for SessionHandler {
    fn drop(&mut self) {
        // Covers clients that vanish without `build/exit`.
        self.leave();
    }
}

/// `data.clientId` when the client sends one, else `<displayName>-<version>`.
fn client_identity(params: &Value) -> Result<ClientId, HandlerError> {
    let raw = match params.pointer("/data/clientId").and_then(Value::as_str) {
        Some(id) => id.to_string(),
        None => {
            let name = params
                .get("displayName")
                .and_then(Value::as_str)
                .ok_or_else(|| HandlerError::invalid_params("missing displayName"))?;
            match params.get("version").and_then(Value::as_str) {
                Some(version) => format!("{name}-{version}"),
                None => name.to_string(),
            }
        }
    };
    ClientId::new(raw).map_err(|e| HandlerError::invalid_params(e.to_string()))
}

impl BuildHandler for SessionHandler {
    async fn handle(
        &self,
        frame: Frame,
        _cancel: CancellationToken,
    ) -> Result<Option<Value>, HandlerError> {
        match frame.method().unwrap_or_default() {
            "build/initialize" => self.initialize(frame.params()).await.map(Some),
            "build/initialized" => Ok(None),
            "build/shutdown" => Ok(None),
            "build/exit" => {
                self.exit();
                Ok(None)
            }
            "workspace/buildTargets" => Ok(Some(json!({"targets": []}))),
            method => {
                tracing::debug!(method, "Unhandled method");
                Err(HandlerError::method_not_found(method))
            }
        }
    }
}
