use std::sync::{Arc, Mutex};
use tabmux_storage::{StorageArea, StorageError};
use thiserror::Error;
use tracing::{info, warn};
use uuid::Uuid;

pub const INSTANCE_ID_KEY: &str = "tabmux.instanceId";
pub const RUNTIME_SESSION_ID_KEY: &str = "tabmux.runtimeSessionId";

#[derive(Debug, Error)]
pub enum IdentityError {
    #[error("identity storage failed: {0}")]
    Storage(#[from] StorageError),
    #[error("identity cache poisoned")]
    Poisoned,
}

/// The two persisted tiers of identity. `connection_id` is never stored.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Identity {
    pub instance_id: String,
    pub runtime_session_id: String,
}

impl Identity {
    /// Identity that lives only as long as this process, for when storage
    /// is unavailable.
    pub fn ephemeral() -> Self {
        Self {
            instance_id: Uuid::new_v4().to_string(),
            runtime_session_id: Uuid::new_v4().to_string(),
        }
    }
}

#[derive(Default)]
struct Cached {
    instance_id: Option<String>,
    runtime_session_id: Option<String>,
}

pub struct IdentityManager {
    durable: Arc<dyn StorageArea>,
    session: Arc<dyn StorageArea>,
    cached: Mutex<Cached>,
}

impl IdentityManager {
    pub fn new(durable: Arc<dyn StorageArea>, session: Arc<dyn StorageArea>) -> Self {
        Self {
            durable,
            session,
            cached: Mutex::new(Cached::default()),
        }
    }

    /// Profile-lifetime id, created on first read.
    pub fn get_instance_id(&self) -> Result<String, IdentityError> {
        let mut cached = self.cached.lock().map_err(|_| IdentityError::Poisoned)?;
        if let Some(id) = &cached.instance_id {
            return Ok(id.clone());
        }
        let id = load_or_create(self.durable.as_ref(), INSTANCE_ID_KEY)?;
        cached.instance_id = Some(id.clone());
        Ok(id)
    }

    /// Browser-session id; survives host restarts, not browser restarts.
    pub fn get_runtime_session_id(&self) -> Result<String, IdentityError> {
        let mut cached = self.cached.lock().map_err(|_| IdentityError::Poisoned)?;
        if let Some(id) = &cached.runtime_session_id {
            return Ok(id.clone());
        }
        let id = load_or_create(self.session.as_ref(), RUNTIME_SESSION_ID_KEY)?;
        cached.runtime_session_id = Some(id.clone());
        Ok(id)
    }

    pub fn generate_connection_id(&self) -> String {
        generate_connection_id()
    }

    pub fn load(&self) -> Result<Identity, IdentityError> {
        Ok(Identity {
            instance_id: self.get_instance_id()?,
            runtime_session_id: self.get_runtime_session_id()?,
        })
    }
}

pub fn generate_connection_id() -> String {
    Uuid::new_v4().to_string()
}

fn load_or_create(area: &dyn StorageArea, key: &str) -> Result<String, IdentityError> {
    if let Some(existing) = area.get(key)? {
        if Uuid::parse_str(&existing).is_ok() {
            return Ok(existing);
        }
        warn!(event = "identity_value_invalid", key, value = %existing);
    }
    let id = Uuid::new_v4().to_string();
    area.set(key, &id)?;
    info!(event = "identity_created", key, id = %id);
    Ok(id)
}
