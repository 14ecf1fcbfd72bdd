use std::path::Path;

use anyhow::Context;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value as JsonValue};

/// A party trusted to issue and revoke entitlements.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Issuer {
    pub id: String,
    pub name: String,
    #[serde(default, alias = "issuer_class")]
    pub class: String,
    /// Scopes this issuer may grant. Empty or `*` means unrestricted.
    #[serde(default)]
    pub scopes: Vec<String>,
    #[serde(default)]
    pub public_key: Option<String>,
    #[serde(default = "default_active")]
    pub is_active: bool,
    #[serde(default)]
    pub metadata: JsonValue,
}

fn default_active() -> bool { true }

impl Issuer {
    pub fn permits_scope(&self, scope: &str) -> bool {
        self.scopes.is_empty() || self.scopes.iter().any(|s| s == "*" || s == scope)
    }

    pub fn profile(&self) -> JsonValue {
        json!({
            "id": self.id,
            "name": self.name,
            "class": self.class,
            "scopes": self.scopes,
            "public_key": self.public_key,
            "is_active": self.is_active,
            "metadata": self.metadata,
        })
    }
}

/// Read a JSON array of issuers.
pub fn load_issuers(path: impl AsRef<Path>) -> anyhow::Result<Vec<Issuer>> {
    let path = path.as_ref();
    let text = std::fs::read_to_string(path).with_context(|| format!("reading issuers file {}", path.display()))?;
    let issuers: Vec<Issuer> =
        serde_json::from_str(&text).with_context(|| format!("parsing issuers file {}", path.display()))?;
    if let Some(dup) = issuers.iter().enumerate().find_map(|(i, a)| issuers[..i].iter().find(|b| b.id == a.id)) {
        anyhow::bail!("duplicate issuer id {} in {}", dup.id, path.display());
    }
    Ok(issuers)
}
