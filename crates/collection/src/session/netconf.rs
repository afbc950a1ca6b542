//! NETCONF-over-SSH sessions for Juniper devices. The transport is a plain
//! SSH channel running the `netconf` subsystem; RPCs and replies are framed
//! by the `]]>]]>` end-of-message marker.

use super::{resolve_login, SessionError, SessionOptions};
use catalog::{AuthMethod, Credential};
use parsers::RawPayload;
use regex::Regex;
use ssh2::Session;
use std::collections::BTreeMap;
use std::io::{Read, Write};
use std::net::{TcpStream, ToSocketAddrs};
use std::path::Path;
use std::time::Duration;

const EOM: &str = "]]>]]>";
const RETRY_BACKOFF: Duration = Duration::from_secs(1);

const CLIENT_HELLO: &str = r#"<?xml version="1.0" encoding="UTF-8"?>
<hello xmlns="urn:ietf:params:xml:ns:netconf:base:1.0">
  <capabilities>
    <capability>urn:ietf:params:xml:ns:netconf:base:1.0</capability>
  </capabilities>
</hello>
"#;

pub struct NetconfSession {
    device_name: String,
    address: String,
    credential: Credential,
    options: SessionOptions,
    ssh: Option<Session>,
    channel: Option<ssh2::Channel>,
    facts: BTreeMap<String, String>,
    context: BTreeMap<String, String>,
}

impl NetconfSession {
    pub fn new(
        host_key: &str,
        address: &str,
        credential: Credential,
        context: BTreeMap<String, String>,
        options: SessionOptions,
    ) -> NetconfSession {
        NetconfSession {
            device_name: host_key.to_string(),
            address: address.to_string(),
            credential,
            options,
            ssh: None,
            channel: None,
            facts: BTreeMap::new(),
            context,
        }
    }

    pub fn connect(&mut self) {
        tracing::info!(device = %self.device_name, address = %self.address, "connecting");
        for attempt in 1..=self.options.retry.max(1) {
            match self.open() {
                Ok(()) => return,
                Err(error) => {
                    if attempt < self.options.retry {
                        tracing::warn!(
                            device = %self.device_name,
                            attempt,
                            %error,
                            "connection failed, retrying"
                        );
                        std::thread::sleep(RETRY_BACKOFF);
                    } else {
                        tracing::error!(device = %self.device_name, %error, "connection failed");
                    }
                }
            }
        }
    }

    fn open(&mut self) -> Result<(), SessionError> {
        let target = format!("{}:{}", self.address, self.credential.port);
        let addr = target
            .to_socket_addrs()?
            .next()
            .ok_or_else(|| SessionError::Rpc(format!("cannot resolve {}", target)))?;
        // Bound the handshake with the per-operation timeout; a dead device
        // must not hold a collector thread for long.
        let connect_timeout = self.options.timeout.min(Duration::from_secs(30));
        let stream = TcpStream::connect_timeout(&addr, connect_timeout)?;

        let mut ssh = Session::new()?;
        ssh.set_tcp_stream(stream);
        ssh.set_timeout(self.options.timeout.as_millis() as u32);
        ssh.handshake()?;

        let username = self.credential.username.clone();
        match self.credential.method {
            AuthMethod::Key => {
                let key_file = self.credential.key_file.clone().ok_or_else(|| {
                    SessionError::Credentials("key method without key_file".to_string())
                })?;
                ssh.userauth_pubkey_file(&username, None, Path::new(&key_file), None)?;
            }
            AuthMethod::EncryptedKey => {
                let key_file = self.credential.key_file.clone().ok_or_else(|| {
                    SessionError::Credentials("enc_key method without key_file".to_string())
                })?;
                ssh.userauth_pubkey_file(
                    &username,
                    None,
                    Path::new(&key_file),
                    self.credential.password.as_deref(),
                )?;
            }
            AuthMethod::Password | AuthMethod::Vault => {
                let (username, password) = resolve_login(&self.credential)?;
                ssh.userauth_password(&username, &password)?;
            }
        }

        let mut channel = ssh.channel_session()?;
        channel.subsystem("netconf")?;
        channel.write_all(CLIENT_HELLO.as_bytes())?;
        channel.write_all(EOM.as_bytes())?;
        channel.flush()?;
        // The server's hello must be drained before the first RPC.
        read_frame(&mut channel)?;

        self.ssh = Some(ssh);
        self.channel = Some(channel);
        Ok(())
    }

    pub fn is_connected(&self) -> bool {
        self.channel.is_some()
    }

    fn rpc(&mut self, body: &str) -> Result<String, SessionError> {
        let channel = self.channel.as_mut().ok_or(SessionError::NotConnected)?;
        channel.write_all(format!("<rpc>{}</rpc>", body).as_bytes())?;
        channel.write_all(EOM.as_bytes())?;
        channel.flush()?;
        let reply = read_frame(channel)?;
        if reply.contains("<rpc-error") {
            return Err(SessionError::Rpc(
                element_text(&reply, "error-message").unwrap_or_else(|| "rpc-error".to_string()),
            ));
        }
        Ok(reply)
    }

    /// Runs one CLI command through the `<command format="xml">` RPC and
    /// returns the reply XML text.
    pub fn execute(&mut self, command: &str) -> Result<RawPayload, SessionError> {
        tracing::debug!(device = %self.device_name, command, "executing");
        let reply = self.rpc(&format!(
            r#"<command format="xml">{}</command>"#,
            escape_xml(command)
        ))?;
        Ok(RawPayload::Text(reply))
    }

    /// Refreshes version, model, and hostname facts. When configured, the
    /// discovered hostname replaces the inventory key in every tag set.
    pub fn collect_facts(&mut self) {
        if !self.is_connected() {
            return;
        }
        if self.options.collect_facts {
            tracing::info!(device = %self.device_name, "collecting facts");
            match self.rpc("<get-software-information/>") {
                Ok(reply) => {
                    let version =
                        element_text(&reply, "junos-version").unwrap_or_else(|| "unknown".to_string());
                    self.facts.insert("version".to_string(), version);
                    if let Some(model) = element_text(&reply, "product-model") {
                        self.facts.insert("product-model".to_string(), model);
                    }
                    if let Some(hostname) = element_text(&reply, "host-name") {
                        if self.options.use_hostname && hostname != self.device_name {
                            tracing::info!(
                                device = %self.device_name,
                                hostname = %hostname,
                                "host will now be referenced by its reported hostname"
                            );
                            self.device_name = hostname;
                        }
                    }
                }
                Err(error) => {
                    tracing::warn!(device = %self.device_name, %error, "fact collection failed");
                }
            }
        }
        self.facts
            .insert("device".to_string(), self.device_name.clone());
    }

    pub fn close(&mut self) {
        if let Some(mut channel) = self.channel.take() {
            let _ = channel.send_eof();
            let _ = channel.close();
        }
        self.ssh = None;
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

/// Reads one `]]>]]>`-terminated frame and strips the marker.
fn read_frame(channel: &mut ssh2::Channel) -> Result<String, SessionError> {
    let mut collected = Vec::new();
    let mut buf = [0u8; 4096];
    loop {
        let n = channel.read(&mut buf)?;
        if n == 0 {
            return Err(SessionError::Rpc("channel closed mid-frame".to_string()));
        }
        collected.extend_from_slice(&buf[..n]);
        if let Some(position) = find_eom(&collected) {
            collected.truncate(position);
            return Ok(String::from_utf8_lossy(&collected).into_owned());
        }
    }
}

fn find_eom(haystack: &[u8]) -> Option<usize> {
    haystack
        .windows(EOM.len())
        .position(|window| window == EOM.as_bytes())
}

fn escape_xml(raw: &str) -> String {
    raw.replace('&', "&amp;").replace('<', "&lt;").replace('>', "&gt;")
}

/// First occurrence of `<name>text</name>` anywhere in the reply.
fn element_text(xml: &str, name: &str) -> Option<String> {
    let pattern = format!("<{0}>([^<]*)</{0}>", regex::escape(name));
    let re = Regex::new(&pattern).ok()?;
    re.captures(xml)
        .and_then(|caps| caps.get(1))
        .map(|m| m.as_str().trim().to_string())
}
