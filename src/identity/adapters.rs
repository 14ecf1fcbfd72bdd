//! Built-in provider variants. Adding a provider means adding a struct here and a
//! line in `builtin_adapter`.

use std::sync::Arc;

use async_trait::async_trait;
use serde_json::{json, Value as JsonValue};

use super::provider::{ExternalIdentity, ProviderAdapter, ProviderConfig, ProviderError};
use super::transport::Headers;

/// Provider ids with a built-in adapter.
pub const BUILTIN_PROVIDERS: &[&str] = &["discord", "github", "roblox", "twitch", "youtube"];

/// Build the adapter for a known provider id, or None if there is no variant for it.
pub fn builtin_adapter(id: &str, client_id: &str, client_secret: &str) -> Option<Arc<dyn ProviderAdapter>> {
    let cfg = |auth: &str, token: &str, info: &str, scope: &str, pkce: bool| ProviderConfig {
        id: id.to_string(),
        client_id: client_id.to_string(),
        client_secret: client_secret.to_string(),
        auth_url: auth.to_string(),
        token_url: token.to_string(),
        user_info_url: info.to_string(),
        scope: scope.to_string(),
        requires_pkce: pkce,
    };
    let adapter: Arc<dyn ProviderAdapter> = match id {
        "discord" => Arc::new(Discord(cfg(
            "https://discord.com/api/oauth2/authorize",
            "https://discord.com/api/oauth2/token",
            "https://discord.com/api/users/@me",
            "identify email",
            false,
        ))),
        "github" => Arc::new(GitHub(cfg(
            "https://github.com/login/oauth/authorize",
            "https://github.com/login/oauth/access_token",
            "https://api.github.com/user",
            "read:user user:email",
            false,
        ))),
        "roblox" => Arc::new(Roblox(cfg(
            "https://apis.roblox.com/oauth/v1/authorize",
            "https://apis.roblox.com/oauth/v1/token",
            "https://apis.roblox.com/oauth/v1/userinfo",
            "openid profile",
            true,
        ))),
        "twitch" => Arc::new(Twitch(cfg(
            "https://id.twitch.tv/oauth2/authorize",
            "https://id.twitch.tv/oauth2/token",
            "https://api.twitch.tv/helix/users",
            "user:read:email",
            false,
        ))),
        "youtube" => Arc::new(YouTube(cfg(
            "https://accounts.google.com/o/oauth2/v2/auth",
            "https://oauth2.googleapis.com/token",
            "https://www.googleapis.com/oauth2/v2/userinfo",
            "https://www.googleapis.com/auth/userinfo.profile https://www.googleapis.com/auth/youtube",
            false,
        ))),
        _ => return None,
    };
    Some(adapter)
}

fn mapping_err(provider: &str, detail: impl Into<String>) -> ProviderError {
    ProviderError::Mapping { provider: provider.to_string(), detail: detail.into() }
}

/// String ids pass through, numeric ids are stringified.
fn id_field(provider: &str, raw: &JsonValue, field: &str) -> Result<String, ProviderError> {
    match raw.get(field) {
        Some(JsonValue::String(s)) if !s.is_empty() => Ok(s.clone()),
        Some(JsonValue::Number(n)) => Ok(n.to_string()),
        _ => Err(mapping_err(provider, format!("missing '{}'", field))),
    }
}

fn str_field(raw: &JsonValue, field: &str) -> Option<String> {
    raw.get(field).and_then(|v| v.as_str()).filter(|s| !s.is_empty()).map(|s| s.to_string())
}

fn field(raw: &JsonValue, name: &str) -> JsonValue {
    raw.get(name).cloned().unwrap_or(JsonValue::Null)
}

pub struct Discord(ProviderConfig);

#[async_trait]
impl ProviderAdapter for Discord {
    fn config(&self) -> &ProviderConfig { &self.0 }

    fn map_identity(&self, raw: &JsonValue) -> Result<ExternalIdentity, ProviderError> {
        let external_id = id_field("discord", raw, "id")?;
        let username = str_field(raw, "username").ok_or_else(|| mapping_err("discord", "missing 'username'"))?;
        // Accounts migrated to unique usernames report discriminator "0".
        let external_username = match str_field(raw, "discriminator") {
            Some(d) if d != "0" => format!("{}#{}", username, d),
            _ => username,
        };
        Ok(ExternalIdentity {
            external_id,
            external_username,
            metadata: json!({
                "avatar": field(raw, "avatar"),
                "email": field(raw, "email"),
                "verified": field(raw, "verified"),
            }),
        })
    }
}

pub struct GitHub(ProviderConfig);

#[async_trait]
impl ProviderAdapter for GitHub {
    fn config(&self) -> &ProviderConfig { &self.0 }

    fn map_identity(&self, raw: &JsonValue) -> Result<ExternalIdentity, ProviderError> {
        let external_id = id_field("github", raw, "id")?;
        let external_username = str_field(raw, "login").ok_or_else(|| mapping_err("github", "missing 'login'"))?;
        Ok(ExternalIdentity {
            external_id,
            external_username,
            metadata: json!({
                "name": field(raw, "name"),
                "email": field(raw, "email"),
                "avatar_url": field(raw, "avatar_url"),
                "html_url": field(raw, "html_url"),
            }),
        })
    }
}

/// OpenID Connect userinfo; PKCE required.
pub struct Roblox(ProviderConfig);

#[async_trait]
impl ProviderAdapter for Roblox {
    fn config(&self) -> &ProviderConfig { &self.0 }

    fn map_identity(&self, raw: &JsonValue) -> Result<ExternalIdentity, ProviderError> {
        let external_id = id_field("roblox", raw, "sub")?;
        let external_username = str_field(raw, "preferred_username")
            .or_else(|| str_field(raw, "name"))
            .ok_or_else(|| mapping_err("roblox", "missing 'preferred_username' and 'name'"))?;
        Ok(ExternalIdentity {
            external_id,
            external_username,
            metadata: json!({
                "profile": field(raw, "profile"),
                "picture": field(raw, "picture"),
            }),
        })
    }
}

/// Helix wraps the user in `data[0]` and wants the client id on every call.
pub struct Twitch(ProviderConfig);

#[async_trait]
impl ProviderAdapter for Twitch {
    fn config(&self) -> &ProviderConfig { &self.0 }

    fn user_info_headers(&self, access_token: &str) -> Headers {
        vec![
            ("Authorization".to_string(), format!("Bearer {}", access_token)),
            ("Client-Id".to_string(), self.0.client_id.clone()),
            ("Accept".to_string(), "application/json".to_string()),
        ]
    }

    fn map_identity(&self, raw: &JsonValue) -> Result<ExternalIdentity, ProviderError> {
        let user = raw
            .get("data")
            .and_then(|d| d.get(0))
            .ok_or_else(|| mapping_err("twitch", "missing 'data[0]'"))?;
        let external_id = id_field("twitch", user, "id")?;
        let external_username = str_field(user, "login").ok_or_else(|| mapping_err("twitch", "missing 'login'"))?;
        Ok(ExternalIdentity {
            external_id,
            external_username,
            metadata: json!({
                "display_name": field(user, "display_name"),
                "email": field(user, "email"),
                "profile_image_url": field(user, "profile_image_url"),
            }),
        })
    }
}

/// Google account userinfo behind the YouTube scopes.
pub struct YouTube(ProviderConfig);

#[async_trait]
impl ProviderAdapter for YouTube {
    fn config(&self) -> &ProviderConfig { &self.0 }

    fn map_identity(&self, raw: &JsonValue) -> Result<ExternalIdentity, ProviderError> {
        let external_id = id_field("youtube", raw, "id")?;
        let external_username = str_field(raw, "name")
            .or_else(|| str_field(raw, "email"))
            .ok_or_else(|| mapping_err("youtube", "missing 'name'"))?;
        Ok(ExternalIdentity {
            external_id,
            external_username,
            metadata: json!({
                "email": field(raw, "email"),
                "picture": field(raw, "picture"),
                "verified_email": field(raw, "verified_email"),
            }),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn adapter(id: &str) -> Arc<dyn ProviderAdapter> {
        builtin_adapter(id, "cid", "secret").unwrap()
    }

    #[test]
    fn every_builtin_has_a_variant() {
        for id in BUILTIN_PROVIDERS {
            assert_eq!(adapter(id).id(), *id);
        }
        assert!(builtin_adapter("steam", "a", "b").is_none());
        assert!(adapter("roblox").requires_pkce());
        assert!(!adapter("github").requires_pkce());
    }

    #[test]
    fn discord_mapping() {
        let raw = json!({"id": "80351110224678912", "username": "nelly", "discriminator": "1337",
                         "avatar": "8342729096ea3675442027381ff50dfe", "email": "nelly@discord.com", "verified": true});
        let id = adapter("discord").map_identity(&raw).unwrap();
        assert_eq!(id.external_id, "80351110224678912");
        assert_eq!(id.external_username, "nelly#1337");
        assert_eq!(id.metadata["email"], "nelly@discord.com");
        assert_eq!(id.metadata["verified"], true);

        let migrated = json!({"id": "1", "username": "nelly", "discriminator": "0"});
        assert_eq!(adapter("discord").map_identity(&migrated).unwrap().external_username, "nelly");
    }

    #[test]
    fn github_stringifies_numeric_id() {
        let raw = json!({"id": 42, "login": "octocat", "name": "The Octocat", "email": null,
                         "avatar_url": "https://avatars.githubusercontent.com/u/42", "html_url": "https://github.com/octocat"});
        let id = adapter("github").map_identity(&raw).unwrap();
        assert_eq!(id.external_id, "42");
        assert_eq!(id.external_username, "octocat");
        assert_eq!(id.metadata["name"], "The Octocat");
        assert!(id.metadata["email"].is_null());
    }

    #[test]
    fn roblox_falls_back_to_name() {
        let raw = json!({"sub": "555", "name": "Builderman", "picture": "https://tr.rbxcdn.com/x"});
        let id = adapter("roblox").map_identity(&raw).unwrap();
        assert_eq!(id.external_id, "555");
        assert_eq!(id.external_username, "Builderman");
        let raw = json!({"sub": "555", "name": "Builderman", "preferred_username": "builderman"});
        assert_eq!(adapter("roblox").map_identity(&raw).unwrap().external_username, "builderman");
    }

    #[test]
    fn twitch_unwraps_data_array() {
        let raw = json!({"data": [{"id": "141981764", "login": "twitchdev", "display_name": "TwitchDev"}]});
        let id = adapter("twitch").map_identity(&raw).unwrap();
        assert_eq!(id.external_id, "141981764");
        assert_eq!(id.external_username, "twitchdev");
        let headers = adapter("twitch").user_info_headers("tok");
        assert!(headers.contains(&("Client-Id".to_string(), "cid".to_string())));
        assert!(adapter("twitch").map_identity(&json!({"data": []})).is_err());
    }

    #[test]
    fn youtube_mapping() {
        let raw = json!({"id": "1090", "name": "Jane", "email": "jane@example.com", "verified_email": true});
        let id = adapter("youtube").map_identity(&raw).unwrap();
        assert_eq!(id.external_id, "1090");
        assert_eq!(id.external_username, "Jane");
    }

    #[test]
    fn missing_id_is_a_mapping_error() {
        let err = adapter("github").map_identity(&json!({"login": "x"})).unwrap_err();
        assert!(matches!(err, ProviderError::Mapping { .. }));
        let err = adapter("discord").map_identity(&json!({"id": "", "username": "x"})).unwrap_err();
        assert!(matches!(err, ProviderError::Mapping { .. }));
    }
}
