//! Session state persisted between runs: the API credential and the registry.

use serde::de::DeserializeOwned;

use crate::registry::OutputRegistry;
use crate::store::{SessionStore, StoreError};

pub const CREDENTIAL_KEY: &str = "credential";
pub const OUTPUTS_KEY: &str = "outputs";

#[derive(Debug, Clone, Default, PartialEq)]
pub struct SessionState {
    pub credential: Option<String>,
    pub outputs: OutputRegistry,
}

/// Read and decode one key. Undecodable values are logged and treated as absent.
fn load_key<T: DeserializeOwned>(
    store: &dyn SessionStore,
    key: &str,
) -> Result<Option<T>, StoreError> {
    let Some(raw) = store.read(key)? else {
        return Ok(None);
    };

    match serde_json::from_str(&raw) {
        Ok(value) => Ok(Some(value)),
        Err(e) => {
            tracing::warn!(%key, error = %e, "Discarding unreadable persisted value");
            Ok(None)
        }
    }
}

impl SessionState {
    pub fn load(store: &dyn SessionStore) -> Result<Self, StoreError> {
        let credential = load_key::<Option<String>>(store, CREDENTIAL_KEY)?.flatten();
        let outputs = load_key::<OutputRegistry>(store, OUTPUTS_KEY)?.unwrap_or_default();

        tracing::debug!(
            outputs = outputs.len(),
            has_credential = credential.is_some(),
            "Loaded session state"
        );

        Ok(Self {
            credential,
            outputs,
        })
    }

    pub fn save(&self, store: &dyn SessionStore) -> Result<(), StoreError> {
        let encode = |key: &str, result: serde_json::Result<String>| {
            result.map_err(|source| StoreError::Serialize {
                key: key.to_string(),
                source,
            })
        };

        let credential = encode(CREDENTIAL_KEY, serde_json::to_string(&self.credential))?;
        let outputs = encode(OUTPUTS_KEY, serde_json::to_string(&self.outputs))?;

        store.write(CREDENTIAL_KEY, &credential)?;
        store.write(OUTPUTS_KEY, &outputs)
    }
}
