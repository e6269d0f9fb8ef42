//! Channel composition — the static recipe a manager instance is built from.

use serde::{Deserialize, Serialize};

/// Kind of node this composition runs on.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NodeKind {
    #[default]
    Undef,
    Client,
    Server,
}

/// Immutable descriptor naming the transport, the user model, and the
/// ordered encodings that together form one channel. Created once at
/// manager construction and never mutated.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Composition {
    /// Channel id; every id-bearing plugin call must match it.
    pub id: String,
    pub transport: String,
    pub usermodel: String,
    /// Encoding component names, in match-priority order.
    pub encodings: Vec<String>,
    pub node_kind: NodeKind,
    pub platform: String,
    pub architecture: String,
}

impl Composition {
    pub fn new(
        id: impl Into<String>,
        transport: impl Into<String>,
        usermodel: impl Into<String>,
        encodings: Vec<String>,
    ) -> Self {
        Self {
            id: id.into(),
            transport: transport.into(),
            usermodel: usermodel.into(),
            encodings,
            node_kind: NodeKind::Undef,
            platform: String::new(),
            architecture: String::new(),
        }
    }

    /// One-line summary for logs.
    pub fn description(&self) -> String {
        format!(
            "composite channel {}: transport={}, usermodel={}, encodings=[{}]",
            self.id,
            self.transport,
            self.usermodel,
            self.encodings.join(", ")
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn description_names_all_components() {
        let c = Composition::new(
            "chan",
            "twoSixDirect",
            "periodicModel",
            vec!["base64Enc".into(), "imageEnc".into()],
        );
        let d = c.description();
        assert!(d.contains("chan"));
        assert!(d.contains("twoSixDirect"));
        assert!(d.contains("periodicModel"));
        assert!(d.contains("base64Enc, imageEnc"));
    }
}
