//! Device sessions. Every device kind exposes the same small capability
//! set: connect, report connectivity, gather facts, execute a command, and
//! close. The kinds are a closed set, so the session is a tagged enum
//! rather than a trait object.

mod netconf;
mod resthttp;

pub use self::netconf::NetconfSession;
pub use self::resthttp::RestSession;

use catalog::{Credential, DeviceType};
use parsers::RawPayload;
use std::collections::BTreeMap;
use std::time::Duration;

#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    #[error("session is not connected")]
    NotConnected,

    #[error("no usable credentials: {0}")]
    Credentials(String),

    #[error("i/o failure: {0}")]
    Io(#[from] std::io::Error),

    #[error("ssh failure: {0}")]
    Ssh(#[from] ssh2::Error),

    #[error("rpc failed: {0}")]
    Rpc(String),

    #[error("http request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("device returned no usable payload: {0}")]
    Payload(String),
}

/// Connection knobs shared by every session kind.
#[derive(Debug, Clone)]
pub struct SessionOptions {
    pub timeout: Duration,
    pub retry: u32,
    /// Replace the inventory key with the hostname the device reports.
    pub use_hostname: bool,
    pub collect_facts: bool,
}

impl Default for SessionOptions {
    fn default() -> Self {
        SessionOptions {
            timeout: Duration::from_secs(600),
            retry: 5,
            use_hostname: true,
            collect_facts: true,
        }
    }
}

/// Resolves vault-managed credentials through the environment. Everything
/// else passes through unchanged.
pub(crate) fn resolve_login(credential: &Credential) -> Result<(String, String), SessionError> {
    if credential.method == catalog::AuthMethod::Vault {
        let username = std::env::var("VAULT_USERNAME")
            .ok()
            .unwrap_or_else(|| credential.username.clone());
        let password = std::env::var("VAULT_PASSWORD")
            .ok()
            .or_else(|| credential.password.clone());
        return match password {
            Some(password) => Ok((username, password)),
            None => Err(SessionError::Credentials(
                "vault method without resolvable password".to_string(),
            )),
        };
    }
    match &credential.password {
        Some(password) => Ok((credential.username.clone(), password.clone())),
        None => Err(SessionError::Credentials("no password available".to_string())),
    }
}

pub enum DeviceSession {
    Netconf(NetconfSession),
    Rest(RestSession),
}

impl DeviceSession {
    pub fn new(
        device_type: DeviceType,
        host_key: &str,
        address: &str,
        credential: Credential,
        context: &[(String, String)],
        options: SessionOptions,
    ) -> DeviceSession {
        let context: BTreeMap<String, String> = context.iter().cloned().collect();
        match device_type {
            DeviceType::Juniper => DeviceSession::Netconf(NetconfSession::new(
                host_key, address, credential, context, options,
            )),
            DeviceType::Arista => DeviceSession::Rest(RestSession::new(
                host_key, address, credential, context, options, false,
            )),
            DeviceType::F5 => DeviceSession::Rest(RestSession::new(
                host_key, address, credential, context, options, true,
            )),
        }
    }

    /// Attempts to open the session, with the kind's bounded retry loop.
    /// Failure leaves the session disconnected; it never panics the worker.
    pub fn connect(&mut self) {
        match self {
            DeviceSession::Netconf(s) => s.connect(),
            DeviceSession::Rest(s) => s.connect(),
        }
    }

    pub fn is_connected(&self) -> bool {
        match self {
            DeviceSession::Netconf(s) => s.is_connected(),
            DeviceSession::Rest(s) => s.is_connected(),
        }
    }

    pub fn collect_facts(&mut self) {
        match self {
            DeviceSession::Netconf(s) => s.collect_facts(),
            DeviceSession::Rest(s) => s.collect_facts(),
        }
    }

    pub fn execute(&mut self, target: &str) -> Result<RawPayload, SessionError> {
        match self {
            DeviceSession::Netconf(s) => s.execute(target),
            DeviceSession::Rest(s) => s.execute(target),
        }
    }

    pub fn close(&mut self) {
        match self {
            DeviceSession::Netconf(s) => s.close(),
            DeviceSession::Rest(s) => s.close(),
        }
    }

    /// The name the device is reported under; the inventory key unless fact
    /// collection replaced it.
    pub fn device_name(&self) -> &str {
        match self {
            DeviceSession::Netconf(s) => s.device_name(),
            DeviceSession::Rest(s) => s.device_name(),
        }
    }

    pub fn facts(&self) -> &BTreeMap<String, String> {
        match self {
            DeviceSession::Netconf(s) => s.facts(),
            DeviceSession::Rest(s) => s.facts(),
        }
    }

    pub fn context(&self) -> &BTreeMap<String, String> {
        match self {
            DeviceSession::Netconf(s) => s.context(),
            DeviceSession::Rest(s) => s.context(),
        }
    }

    /// Whether command routing should use the parser's `query` field (HTTP
    /// kinds) or its command text (NETCONF).
    pub fn executes_queries(&self) -> bool {
        matches!(self, DeviceSession::Rest(_))
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use catalog::AuthMethod;

    fn credential(method: AuthMethod, password: Option<&str>) -> Credential {
        Credential {
            tags: vec!["lab".to_string()],
            username: "operator".to_string(),
            password: password.map(str::to_string),
            method,
            key_file: None,
            port: 22,
        }
    }

    #[test]
    fn plain_credentials_pass_through() {
        let (user, password) =
            resolve_login(&credential(AuthMethod::Password, Some("secret"))).unwrap();
        assert_eq!(user, "operator");
        assert_eq!(password, "secret");
    }

    #[test]
    fn missing_password_is_an_error() {
        assert!(resolve_login(&credential(AuthMethod::Password, None)).is_err());
    }
}
