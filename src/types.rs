//! Data structures exchanged between relay nodes.
//!
//! An [`Update`] is serialised with [`serde`](https://serde.rs/) as one
//! JSON object per line.  The wire names are kept short (`uaid`, `chid`,
//! `vers`) to match what every node in the cluster already speaks.

use serde::{Deserialize, Serialize};

/// A notification that a client's channel has a new version available.
///
/// Updates are transient: one is built per send or per decoded line and
/// dropped once handed on.  They are never deduplicated.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Update {
    /// Client the notification targets.  Updates with an empty id are
    /// dropped by the listener.
    #[serde(rename = "uaid")]
    pub client_id: String,
    #[serde(rename = "chid", default)]
    pub channel_id: String,
    #[serde(rename = "vers", default)]
    pub version: i64,
}

impl Update {
    pub fn new(client_id: impl Into<String>, channel_id: impl Into<String>, version: i64) -> Self {
        Self {
            client_id: client_id.into(),
            channel_id: channel_id.into(),
            version,
        }
    }

    /// Whether this update names a client and can be dispatched.
    pub fn is_routable(&self) -> bool {
        !self.client_id.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn wire_names_are_short() {
        let json = serde_json::to_value(Update::new("abc123", "chan1", 42)).unwrap();
        assert_eq!(json["uaid"], "abc123");
        assert_eq!(json["chid"], "chan1");
        assert_eq!(json["vers"], 42);
    }

    #[test]
    fn missing_client_id_is_rejected() {
        let err = serde_json::from_str::<Update>(r#"{"chid":"c","vers":1}"#);
        assert!(err.is_err());
    }

    #[test]
    fn empty_client_id_is_not_routable() {
        assert!(!Update::new("", "chan", 1).is_routable());
        assert!(Update::new("a", "", 0).is_routable());
    }
}
