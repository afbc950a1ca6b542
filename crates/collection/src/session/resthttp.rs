//! JSON-over-HTTPS sessions for Arista and F5 devices. Each command routes
//! to a relative URL from the parser catalog; the reply body is decoded
//! JSON. Devices ship self-signed certificates, so verification is off.

use super::{resolve_login, SessionError, SessionOptions};
use catalog::Credential;
use parsers::RawPayload;
use std::collections::BTreeMap;
use std::time::Duration;

const RETRY_BACKOFF: Duration = Duration::from_secs(2);
/// F5 only: the endpoint that reports the running software version.
const F5_DEVICE_INFO: &str = "mgmt/shared/identified-devices/config/device-info";

pub struct RestSession {
    device_name: String,
    address: String,
    credential: Credential,
    options: SessionOptions,
    /// Present once connected.
    client: Option<reqwest::blocking::Client>,
    login: Option<(String, String)>,
    is_f5: bool,
    facts: BTreeMap<String, String>,
    context: BTreeMap<String, String>,
}

impl RestSession {
    pub fn new(
        host_key: &str,
        address: &str,
        credential: Credential,
        context: BTreeMap<String, String>,
        options: SessionOptions,
        is_f5: bool,
    ) -> RestSession {
        RestSession {
            device_name: host_key.to_string(),
            address: address.to_string(),
            credential,
            options,
            client: None,
            login: None,
            is_f5,
            facts: BTreeMap::new(),
            context,
        }
    }

    pub fn connect(&mut self) {
        tracing::info!(device = %self.device_name, address = %self.address, "connecting");
        let login = match resolve_login(&self.credential) {
            Ok(login) => login,
            Err(error) => {
                tracing::error!(device = %self.device_name, %error, "invalid or no credentials");
                return;
            }
        };
        let client = reqwest::blocking::Client::builder()
            .danger_accept_invalid_certs(true)
            .timeout(self.options.timeout.min(Duration::from_secs(30)))
            .build();
        match client {
            Ok(client) => {
                self.client = Some(client);
                self.login = Some(login);
            }
            Err(error) => {
                tracing::error!(device = %self.device_name, %error, "failed to build http client");
            }
        }
    }

    pub fn is_connected(&self) -> bool {
        self.client.is_some()
    }

    /// GETs the relative URL with bounded retries and returns the decoded
    /// JSON body.
    pub fn execute(&mut self, query: &str) -> Result<RawPayload, SessionError> {
        let client = self.client.as_ref().ok_or(SessionError::NotConnected)?;
        let (username, password) = self.login.as_ref().ok_or(SessionError::NotConnected)?;
        let url = format!("https://{}/{}", self.address, query.trim_start_matches('/'));

        let mut last_error = None;
        for attempt in 1..=self.options.retry.max(1) {
            tracing::debug!(device = %self.device_name, %url, "executing");
            let attempt_result = client
                .get(&url)
                .basic_auth(username, Some(password))
                .send()
                .and_then(|response| response.error_for_status())
                .and_then(|response| response.json::<serde_json::Value>());
            match attempt_result {
                Ok(body) => return Ok(RawPayload::Json(body)),
                Err(error) => {
                    tracing::warn!(
                        device = %self.device_name,
                        %url,
                        attempt,
                        %error,
                        "query failed"
                    );
                    last_error = Some(error);
                    if attempt < self.options.retry {
                        std::thread::sleep(RETRY_BACKOFF);
                    }
                }
            }
        }
        tracing::error!(
            device = %self.device_name,
            %url,
            retry = self.options.retry,
            "query failed after all attempts"
        );
        Err(last_error.map(SessionError::Http).unwrap_or(SessionError::NotConnected))
    }

    pub fn collect_facts(&mut self) {
        tracing::info!(device = %self.device_name, "collecting facts");
        if self.is_f5 && self.is_connected() {
            match self.execute(F5_DEVICE_INFO) {
                Ok(RawPayload::Json(body)) => {
                    if let Some(version) = body.get("version").and_then(|v| v.as_str()) {
                        self.facts
                            .insert("tmos_version".to_string(), version.to_string());
                    }
                }
                Ok(RawPayload::Text(_)) => {}
                Err(error) => {
                    tracing::debug!(device = %self.device_name, %error, "version probe failed");
                }
            }
        }
        self.facts
            .insert("device".to_string(), self.device_name.clone());
    }

    pub fn close(&mut self) {
        // The REST session is stateless; dropping the client is enough.
        self.client = None;
        self.login = None;
    }

    pub fn device_name(&self) -> &str {
        &self.device_name
    }

    pub fn facts(&self) -> &BTreeMap<String, String> {
        &self.facts
    }

    pub fn context(&self) -> &BTreeMap<String, String> {
        &self.context
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use catalog::AuthMethod;

    fn session() -> RestSession {
        RestSession::new(
            "lb1",
            "192.0.2.10",
            Credential {
                tags: vec!["lab".to_string()],
                username: "operator".to_string(),
                password: Some("secret".to_string()),
                method: AuthMethod::Password,
                key_file: None,
                port: 443,
            },
            BTreeMap::new(),
            SessionOptions {
                retry: 1,
                timeout: Duration::from_millis(200),
                ..SessionOptions::default()
            },
            true,
        )
    }

    #[test]
    fn execute_requires_a_connected_session() {
        let mut session = session();
        assert!(!session.is_connected());
        assert!(matches!(
            session.execute("mgmt/tm/ltm/pool/stats"),
            Err(SessionError::NotConnected)
        ));
    }

    #[test]
    fn facts_always_carry_the_device_name() {
        let mut session = session();
        // Disconnected: the version probe is skipped but the device fact is
        // still recorded.
        session.collect_facts();
        assert_eq!(session.facts().get("device").map(String::as_str), Some("lb1"));
    }
}
