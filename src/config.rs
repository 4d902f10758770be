//! Environment configuration loading and validation.
//!
//! The four cloud values are hard requirements: running without them would
//! only produce signature failures on every call, so startup aborts instead,
//! reporting every violation at once rather than the first one found.

use std::env;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};

use anyhow::{bail, Result};

// ---------------------------------------------------------------------------
// Settings
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct Settings {
    /// Cloud API base URL, e.g. `https://openapi.tuyaus.com`.
    pub base_url: String,
    pub access_id: String,
    pub secret_key: String,
    /// Target valve device identifier.
    pub device_id: String,
    pub bind_address: IpAddr,
    pub port: u16,
    pub auth: AuthSettings,
}

/// Login + control-endpoint gating. The control guard is a config flag, not
/// a second code path, so localhost-only deployments can drop it.
#[derive(Debug, Clone)]
pub struct AuthSettings {
    pub username: String,
    pub password: String,
    pub session_secret: String,
    pub require_control_auth: bool,
}

impl Settings {
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| env::var(key).ok())
    }

    /// Build settings from any key lookup; tests feed a map instead of the
    /// process environment.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let mut errors: Vec<String> = Vec::new();

        // Trimmed; whitespace-only counts as missing.
        let mut required = |key: &str| -> String {
            match lookup(key).map(|v| v.trim().to_string()) {
                Some(v) if !v.is_empty() => v,
                _ => {
                    errors.push(format!("{key} is not set"));
                    String::new()
                }
            }
        };

        let base_url = required("TUYA_ENDPOINT");
        let access_id = required("TUYA_ACCESS_ID");
        let secret_key = required("TUYA_SECRET_KEY");
        let device_id = required("TUYA_DEVICE_ID_VALVE");

        let bind_address = match lookup("BIND_ADDRESS") {
            Some(v) => match v.trim().parse::<IpAddr>() {
                Ok(addr) => addr,
                Err(_) => {
                    errors.push(format!("BIND_ADDRESS '{}' is not a valid IP address", v.trim()));
                    IpAddr::V4(Ipv4Addr::UNSPECIFIED)
                }
            },
            None => IpAddr::V4(Ipv4Addr::UNSPECIFIED),
        };

        let port = match lookup("PORT") {
            Some(v) => match v.trim().parse::<u16>() {
                Ok(p) => p,
                Err(_) => {
                    errors.push(format!("PORT '{}' is not a valid port number", v.trim()));
                    0
                }
            },
            None => 3000,
        };

        let require_control_auth = lookup("REQUIRE_CONTROL_AUTH")
            .map(|v| {
                let v = v.trim().to_ascii_lowercase();
                !(v == "0" || v == "false" || v == "no")
            })
            .unwrap_or(true);

        let auth = AuthSettings {
            username: lookup("AUTH_USERNAME").unwrap_or_else(|| "admin".to_string()),
            password: lookup("AUTH_PASSWORD").unwrap_or_else(|| "123".to_string()),
            session_secret: lookup("SESSION_SECRET")
                .unwrap_or_else(|| "TU_SECRETO_SEGURO_AQUI_2025".to_string()),
            require_control_auth,
        };

        if !errors.is_empty() {
            bail!(
                "configuration invalid ({} error{}):\n  - {}",
                errors.len(),
                if errors.len() == 1 { "" } else { "s" },
                errors.join("\n  - ")
            );
        }

        Ok(Self {
            base_url,
            access_id,
            secret_key,
            device_id,
            bind_address,
            port,
            auth,
        })
    }

    pub fn socket_addr(&self) -> SocketAddr {
        SocketAddr::new(self.bind_address, self.port)
    }
}

// ===========================================================================
// Tests
// ===========================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn base_env() -> HashMap<&'static str, &'static str> {
        HashMap::from([
            ("TUYA_ENDPOINT", "https://openapi.tuyaus.com"),
            ("TUYA_ACCESS_ID", "access-id"),
            ("TUYA_SECRET_KEY", "secret-key"),
            ("TUYA_DEVICE_ID_VALVE", "device-1"),
        ])
    }

    fn load(env: &HashMap<&str, &str>) -> Result<Settings> {
        Settings::from_lookup(|k| env.get(k).map(|v| v.to_string()))
    }

    #[test]
    fn minimal_env_loads_with_defaults() {
        let settings = load(&base_env()).unwrap();
        assert_eq!(settings.base_url, "https://openapi.tuyaus.com");
        assert_eq!(settings.device_id, "device-1");
        assert_eq!(settings.socket_addr().to_string(), "0.0.0.0:3000");
        assert_eq!(settings.auth.username, "admin");
        assert!(settings.auth.require_control_auth);
    }

    #[test]
    fn dotenv_file_contents_load() {
        // Deployments ship a .env file; main() loads it into the process
        // environment before from_env(). Same parser, fed to from_lookup.
        let dotenv = "\
TUYA_ENDPOINT=https://openapi.tuyaus.com
TUYA_ACCESS_ID=access-id
TUYA_SECRET_KEY=secret-key
TUYA_DEVICE_ID_VALVE=device-1
PORT=8123
";
        let env: HashMap<String, String> = dotenvy::from_read_iter(dotenv.as_bytes())
            .collect::<std::result::Result<_, _>>()
            .unwrap();

        let settings = Settings::from_lookup(|k| env.get(k).cloned()).unwrap();
        assert_eq!(settings.device_id, "device-1");
        assert_eq!(settings.port, 8123);
    }

    #[test]
    fn missing_required_value_rejected() {
        for key in [
            "TUYA_ENDPOINT",
            "TUYA_ACCESS_ID",
            "TUYA_SECRET_KEY",
            "TUYA_DEVICE_ID_VALVE",
        ] {
            let mut env = base_env();
            env.remove(key);
            let err = load(&env).unwrap_err();
            assert!(
                format!("{err:#}").contains(key),
                "expected error naming {key}, got: {err:#}"
            );
        }
    }

    #[test]
    fn whitespace_only_counts_as_missing() {
        let mut env = base_env();
        env.insert("TUYA_ACCESS_ID", "   ");
        let err = load(&env).unwrap_err();
        assert!(format!("{err:#}").contains("TUYA_ACCESS_ID"));
    }

    #[test]
    fn values_are_trimmed() {
        let mut env = base_env();
        env.insert("TUYA_ACCESS_ID", "  access-id  ");
        let settings = load(&env).unwrap();
        assert_eq!(settings.access_id, "access-id");
    }

    #[test]
    fn all_missing_values_reported_together() {
        let env: HashMap<&str, &str> = HashMap::new();
        let err = load(&env).unwrap_err();
        let msg = format!("{err:#}");
        assert!(msg.contains("4 errors"), "got: {msg}");
        assert!(msg.contains("TUYA_ENDPOINT"));
        assert!(msg.contains("TUYA_DEVICE_ID_VALVE"));
    }

    #[test]
    fn bind_address_and_port_override() {
        let mut env = base_env();
        env.insert("BIND_ADDRESS", "127.0.0.1");
        env.insert("PORT", "8080");
        let settings = load(&env).unwrap();
        assert_eq!(settings.socket_addr().to_string(), "127.0.0.1:8080");
    }

    #[test]
    fn invalid_bind_address_rejected() {
        let mut env = base_env();
        env.insert("BIND_ADDRESS", "not-an-ip");
        let err = load(&env).unwrap_err();
        assert!(format!("{err:#}").contains("BIND_ADDRESS"));
    }

    #[test]
    fn invalid_port_rejected() {
        let mut env = base_env();
        env.insert("PORT", "99999");
        let err = load(&env).unwrap_err();
        assert!(format!("{err:#}").contains("PORT"));
    }

    #[test]
    fn control_auth_can_be_disabled() {
        for value in ["0", "false", "FALSE", "no"] {
            let mut env = base_env();
            env.insert("REQUIRE_CONTROL_AUTH", value);
            let settings = load(&env).unwrap();
            assert!(!settings.auth.require_control_auth, "value={value}");
        }

        let mut env = base_env();
        env.insert("REQUIRE_CONTROL_AUTH", "1");
        assert!(load(&env).unwrap().auth.require_control_auth);
    }

    #[test]
    fn auth_overrides_apply() {
        let mut env = base_env();
        env.insert("AUTH_USERNAME", "operator");
        env.insert("AUTH_PASSWORD", "hunter2");
        env.insert("SESSION_SECRET", "s3cr3t");
        let settings = load(&env).unwrap();
        assert_eq!(settings.auth.username, "operator");
        assert_eq!(settings.auth.password, "hunter2");
        assert_eq!(settings.auth.session_secret, "s3cr3t");
    }
}
