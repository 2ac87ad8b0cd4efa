use chrono::Utc;
use serde::Serialize;

use crate::config::{Identity, VERSION};

/// Common wrapper around every HTTP response body and every advertisement sent to the hub.
#[derive(Debug, Serialize)]
pub struct Envelope<T: Serialize> {
    pub timestamp: String,
    pub version: &'static str,
    pub name: String,
    pub satellite_port: u16,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub satellite_host: Option<String>,
    pub data: T,
}

impl<T: Serialize> Envelope<T> {
    pub fn wrap(identity: &Identity, data: T) -> Self {
        Self {
            timestamp: Utc::now().to_rfc3339(),
            version: VERSION,
            name: identity.name.clone(),
            satellite_port: identity.export_port,
            satellite_host: identity.export_host.clone(),
            data,
        }
    }
}
