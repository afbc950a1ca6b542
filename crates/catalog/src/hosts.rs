//! The host manager owns three maps: hosts, credentials, and command
//! groups. Credentials and commands are fixed at startup; the host set is
//! replaced atomically on every inventory refresh. Resolution between the
//! three is by case-insensitive regex tag matching, in both directions,
//! since inventories in the field rely on either reading.

use crate::inventory::{Inventory, InventoryEntry};
use regex::RegexBuilder;
use serde::Deserialize;
use std::collections::{BTreeMap, BTreeSet};
use std::sync::RwLock;

/// A tag list in configuration: either a YAML list or a single
/// whitespace-separated string.
#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub enum TagList {
    Many(Vec<String>),
    One(String),
}

impl TagList {
    fn into_vec(self) -> Vec<String> {
        match self {
            TagList::Many(tags) => tags,
            TagList::One(joined) => joined.split_whitespace().map(str::to_string).collect(),
        }
    }
}

/// A command list in configuration: a YAML list or a multiline string.
#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub enum CommandLines {
    Many(Vec<String>),
    Block(String),
}

impl CommandLines {
    fn into_vec(self) -> Vec<String> {
        match self {
            CommandLines::Many(commands) => commands,
            CommandLines::Block(block) => block
                .trim()
                .lines()
                .map(|line| line.trim().to_string())
                .filter(|line| !line.is_empty())
                .collect(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct RawCredential {
    pub tags: Option<TagList>,
    pub username: Option<String>,
    pub password: Option<String>,
    pub method: Option<String>,
    pub key_file: Option<String>,
    pub port: Option<u16>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RawCommandGroup {
    pub tags: Option<TagList>,
    pub netconf: Option<CommandLines>,
    pub commands: Option<CommandLines>,
    pub interval: Option<u64>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthMethod {
    Password,
    Key,
    /// A key file protected by a passphrase.
    EncryptedKey,
    /// Username and password resolved externally at connect time.
    Vault,
}

impl AuthMethod {
    fn from_label(label: &str) -> Option<AuthMethod> {
        match label {
            "password" => Some(AuthMethod::Password),
            "key" => Some(AuthMethod::Key),
            "enc_key" => Some(AuthMethod::EncryptedKey),
            "vault" => Some(AuthMethod::Vault),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Credential {
    pub tags: Vec<String>,
    pub username: String,
    pub password: Option<String>,
    pub method: AuthMethod,
    pub key_file: Option<String>,
    pub port: u16,
}

#[derive(Debug, Clone, PartialEq)]
pub struct CommandGroup {
    pub tags: Vec<String>,
    pub commands: Vec<String>,
    pub interval_secs: u64,
}

/// Default polling interval for command groups that do not declare one.
pub const DEFAULT_INTERVAL_SECS: u64 = 120;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeviceType {
    Juniper,
    Arista,
    F5,
}

impl DeviceType {
    fn from_label(label: &str) -> Option<DeviceType> {
        match label {
            "juniper" => Some(DeviceType::Juniper),
            "arista" => Some(DeviceType::Arista),
            "f5" => Some(DeviceType::F5),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Host {
    pub address: String,
    pub tags: Vec<String>,
    /// Ordered key/value pairs merged into every point's tags.
    pub context: Vec<(String, String)>,
    pub device_type: DeviceType,
}

/// Case-insensitive regex `search`, in both directions. A pattern that
/// fails to compile matches nothing.
pub fn tag_matches(a: &str, b: &str) -> bool {
    search_ci(a, b) || search_ci(b, a)
}

fn search_ci(pattern: &str, text: &str) -> bool {
    RegexBuilder::new(pattern)
        .case_insensitive(true)
        .build()
        .map(|re| re.is_match(text))
        .unwrap_or(false)
}

pub struct HostManager {
    commands: BTreeMap<String, CommandGroup>,
    credentials: BTreeMap<String, Credential>,
    hosts: RwLock<BTreeMap<String, Host>>,
}

impl HostManager {
    /// Validates the credential and command catalogs. Invalid entries are
    /// logged and skipped; they never abort startup.
    pub fn new(
        credentials: BTreeMap<String, RawCredential>,
        commands: BTreeMap<String, RawCommandGroup>,
    ) -> HostManager {
        let mut command_groups = BTreeMap::new();
        for (group, raw) in commands {
            let tags = match raw.tags {
                Some(tags) => tags.into_vec(),
                None => {
                    tracing::warn!(group = %group, "command group without tags, skipping");
                    continue;
                }
            };
            let mut commands = Vec::new();
            if let Some(netconf) = raw.netconf {
                commands.extend(netconf.into_vec());
            }
            if let Some(cli) = raw.commands {
                commands.extend(cli.into_vec());
            }
            if commands.is_empty() {
                tracing::warn!(group = %group, "command group without commands, skipping");
                continue;
            }
            command_groups.insert(
                group,
                CommandGroup {
                    tags,
                    commands,
                    interval_secs: raw.interval.unwrap_or(DEFAULT_INTERVAL_SECS),
                },
            );
        }

        let mut credential_groups = BTreeMap::new();
        for (group, raw) in credentials {
            let tags = match raw.tags {
                Some(tags) => tags.into_vec(),
                None => {
                    tracing::warn!(group = %group, "credential without tags, skipping");
                    continue;
                }
            };
            let username = match raw.username {
                Some(username) => username,
                None => {
                    tracing::warn!(group = %group, "credential without username, skipping");
                    continue;
                }
            };
            let method = match raw.method.as_deref() {
                None => AuthMethod::Password,
                Some(label) => match AuthMethod::from_label(label) {
                    Some(method) => method,
                    None => {
                        tracing::warn!(group = %group, method = label, "unsupported auth method, skipping");
                        continue;
                    }
                },
            };
            // The method dictates which secrets must be present.
            match method {
                AuthMethod::Password if raw.password.is_none() => {
                    tracing::warn!(group = %group, "password method without password, skipping");
                    continue;
                }
                AuthMethod::Key | AuthMethod::EncryptedKey if raw.key_file.is_none() => {
                    tracing::warn!(group = %group, "key method without key_file, skipping");
                    continue;
                }
                AuthMethod::EncryptedKey if raw.password.is_none() => {
                    tracing::warn!(group = %group, "enc_key method without passphrase, skipping");
                    continue;
                }
                _ => {}
            }
            credential_groups.insert(
                group,
                Credential {
                    tags,
                    username,
                    password: raw.password,
                    method,
                    key_file: raw.key_file,
                    port: raw.port.unwrap_or(22),
                },
            );
        }

        HostManager {
            commands: command_groups,
            credentials: credential_groups,
            hosts: RwLock::new(BTreeMap::new()),
        }
    }

    /// Replaces the host set. Hosts missing tags or an address are logged
    /// and dropped. Credentials and command groups are untouched.
    pub fn update_hosts(&self, inventory: Inventory) {
        let mut next = BTreeMap::new();
        for (key, entry) in inventory {
            match entry {
                InventoryEntry::Legacy(tags) => {
                    // Legacy form: the key is also the address.
                    next.insert(
                        key.clone(),
                        Host {
                            address: key,
                            tags: tags.split_whitespace().map(str::to_string).collect(),
                            context: Vec::new(),
                            device_type: DeviceType::Juniper,
                        },
                    );
                }
                InventoryEntry::Table(raw) => {
                    let tags = match raw.tags {
                        Some(tags) => tags.into_vec(),
                        None => {
                            tracing::warn!(host = %key, "host without tags, skipping");
                            continue;
                        }
                    };
                    let address = match raw.address {
                        Some(address) => address,
                        None => {
                            tracing::warn!(host = %key, "host without address, skipping");
                            continue;
                        }
                    };
                    let device_type = match raw.device_type.as_deref() {
                        None => DeviceType::Juniper,
                        Some(label) => match DeviceType::from_label(label) {
                            Some(device_type) => device_type,
                            None => {
                                tracing::warn!(host = %key, device_type = label,
                                    "unknown device type, assuming juniper");
                                DeviceType::Juniper
                            }
                        },
                    };
                    let mut context = Vec::new();
                    for pair in raw.context.unwrap_or_default() {
                        for (k, v) in pair {
                            context.push((k, v));
                        }
                    }
                    next.insert(
                        key,
                        Host {
                            address,
                            tags,
                            context,
                            device_type,
                        },
                    );
                }
            }
        }

        let mut hosts = self.hosts.write().unwrap();
        *hosts = next;
    }

    /// Sorted unique host keys whose tag set intersects any of the supplied
    /// tags. An empty tag list selects nothing.
    pub fn get_target_hosts(&self, tags: &[String]) -> Vec<String> {
        if tags.is_empty() {
            return Vec::new();
        }
        let hosts = self.hosts.read().unwrap();
        let mut selected = BTreeSet::new();
        for tag in tags {
            for (key, host) in hosts.iter() {
                if host.tags.iter().any(|host_tag| tag_matches(tag, host_tag)) {
                    selected.insert(key.clone());
                }
            }
        }
        selected.into_iter().collect()
    }

    /// Two-stage filter: command groups whose tags match any of the host's
    /// tags, narrowed to those whose tags also match any of `cmd_tags`.
    pub fn get_target_commands(&self, host: &str, cmd_tags: &[String]) -> Vec<CommandGroup> {
        let hosts = self.hosts.read().unwrap();
        let host = match hosts.get(host) {
            Some(host) => host,
            None => return Vec::new(),
        };

        let stage_one: Vec<&String> = self
            .commands
            .iter()
            .filter(|(_, group)| {
                host.tags.iter().any(|host_tag| {
                    group.tags.iter().any(|group_tag| tag_matches(host_tag, group_tag))
                })
            })
            .map(|(name, _)| name)
            .collect();

        stage_one
            .into_iter()
            .filter(|name| {
                let group = &self.commands[*name];
                cmd_tags.iter().any(|cmd_tag| {
                    group.tags.iter().any(|group_tag| tag_matches(cmd_tag, group_tag))
                })
            })
            .map(|name| self.commands[name].clone())
            .collect()
    }

    /// The first credential group (in sorted name order) whose tags match
    /// any of the host's tags.
    pub fn get_credentials(&self, host: &str) -> Option<Credential> {
        let hosts = self.hosts.read().unwrap();
        let host = hosts.get(host)?;
        for credential in self.credentials.values() {
            let matched = host.tags.iter().any(|host_tag| {
                credential.tags.iter().any(|cred_tag| tag_matches(host_tag, cred_tag))
            });
            if matched {
                return Some(credential.clone());
            }
        }
        None
    }

    pub fn get_address(&self, host: &str) -> Option<String> {
        self.hosts.read().unwrap().get(host).map(|h| h.address.clone())
    }

    pub fn get_context(&self, host: &str) -> Vec<(String, String)> {
        self.hosts
            .read()
            .unwrap()
            .get(host)
            .map(|h| h.context.clone())
            .unwrap_or_default()
    }

    pub fn get_device_type(&self, host: &str) -> DeviceType {
        self.hosts
            .read()
            .unwrap()
            .get(host)
            .map(|h| h.device_type)
            .unwrap_or(DeviceType::Juniper)
    }

    pub fn host_count(&self) -> usize {
        self.hosts.read().unwrap().len()
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn credentials_site1() -> BTreeMap<String, RawCredential> {
        serde_yaml::from_str(
            r#"
lab_credentials:
    username: user1
    password: pwd1
    method: password
    tags: site1
"#,
        )
        .unwrap()
    }

    fn commands_basic() -> BTreeMap<String, RawCommandGroup> {
        serde_yaml::from_str(
            r#"
test1_commands:
    netconf:
        - show version
        - show cpu
    tags: [router, test1]
test2_commands:
    netconf: [show test2]
    tags: [site1, test2, 1m]
test3_commands:
    netconf: [show test3]
    tags: [switch, test3, 5m]
"#,
        )
        .unwrap()
    }

    fn inventory_structured() -> Inventory {
        serde_yaml::from_str(
            r#"
switch1:
    tags: [switch, site1, lab]
    address: 30.30.0.3
    context:
        - site: site1
        - role: switch
router1:
    tags: [router, site1, lab]
    address: 40.40.0.4
    context:
        - site: site1
        - role: router
"#,
        )
        .unwrap()
    }

    fn inventory_legacy() -> Inventory {
        serde_yaml::from_str(
            r#"
10.10.0.1: switch site1 lab
20.20.0.20: router site1 lab
"#,
        )
        .unwrap()
    }

    fn manager() -> HostManager {
        let hm = HostManager::new(credentials_site1(), commands_basic());
        hm.update_hosts(inventory_structured());
        hm
    }

    #[test]
    fn target_hosts_by_tag_structured_inventory() {
        let hm = manager();
        assert!(hm.get_target_hosts(&[]).is_empty());
        assert_eq!(
            hm.get_target_hosts(&[".*".to_string()]),
            vec!["router1".to_string(), "switch1".to_string()]
        );
        assert_eq!(
            hm.get_target_hosts(&["router".to_string()]),
            vec!["router1".to_string()]
        );
    }

    #[test]
    fn target_hosts_by_tag_legacy_inventory() {
        let hm = HostManager::new(credentials_site1(), commands_basic());
        hm.update_hosts(inventory_legacy());
        assert_eq!(
            hm.get_target_hosts(&[".*".to_string()]),
            vec!["10.10.0.1".to_string(), "20.20.0.20".to_string()]
        );
        assert_eq!(
            hm.get_target_hosts(&["router".to_string()]),
            vec!["20.20.0.20".to_string()]
        );
    }

    #[test]
    fn target_commands_follow_host_tags() {
        let hm = manager();
        let all = vec![".*".to_string()];

        let mut router_cmds: Vec<String> = hm
            .get_target_commands("router1", &all)
            .into_iter()
            .flat_map(|g| g.commands)
            .collect();
        router_cmds.sort();
        assert_eq!(router_cmds, vec!["show cpu", "show test2", "show version"]);

        let mut switch_cmds: Vec<String> = hm
            .get_target_commands("switch1", &all)
            .into_iter()
            .flat_map(|g| g.commands)
            .collect();
        switch_cmds.sort();
        assert_eq!(switch_cmds, vec!["show test2", "show test3"]);
    }

    #[test]
    fn command_tags_narrow_the_selection() {
        let hm = manager();
        let cmds = hm.get_target_commands("switch1", &["1m".to_string()]);
        assert_eq!(cmds.len(), 1);
        assert_eq!(cmds[0].commands, vec!["show test2"]);

        let cmds = hm.get_target_commands("switch1", &["5m".to_string()]);
        assert_eq!(cmds.len(), 1);
        assert_eq!(cmds[0].commands, vec!["show test3"]);
    }

    #[test]
    fn tag_matching_is_case_insensitive_and_tolerates_dashes() {
        let commands: BTreeMap<String, RawCommandGroup> = serde_yaml::from_str(
            r#"
test2_commands:
    netconf: [show test3]
    tags: [lab-cmd]
test4_commands:
    netconf: [show test4]
    tags: [LAB-CMD]
"#,
        )
        .unwrap();
        let hm = HostManager::new(credentials_site1(), commands);
        hm.update_hosts(inventory_structured());

        let cmds = hm.get_target_commands("router1", &["lab-cmd".to_string()]);
        // lab matches lab-cmd in the host-tag stage, both spellings in the
        // command-tag stage.
        assert_eq!(cmds.len(), 2);
    }

    #[test]
    fn credentials_resolve_with_defaulted_port() {
        let hm = manager();
        let cred = hm.get_credentials("router1").unwrap();
        assert_eq!(cred.username, "user1");
        assert_eq!(cred.password.as_deref(), Some("pwd1"));
        assert_eq!(cred.method, AuthMethod::Password);
        assert_eq!(cred.port, 22);
        assert_eq!(cred.key_file, None);
    }

    #[test]
    fn credentials_keep_declared_port() {
        let credentials: BTreeMap<String, RawCredential> = serde_yaml::from_str(
            r#"
lab_credentials:
    username: user1
    password: pwd1
    port: 843
    method: password
    tags: router1
"#,
        )
        .unwrap();
        let hm = HostManager::new(credentials, commands_basic());
        hm.update_hosts(inventory_structured());
        assert_eq!(hm.get_credentials("router1").unwrap().port, 843);
    }

    #[test]
    fn invalid_credentials_are_skipped() {
        let credentials: BTreeMap<String, RawCredential> = serde_yaml::from_str(
            r#"
no_username:
    password: pwd1
    tags: site1
no_password:
    username: user1
    method: password
    tags: site1
no_key:
    username: user1
    method: key
    tags: site1
"#,
        )
        .unwrap();
        let hm = HostManager::new(credentials, commands_basic());
        hm.update_hosts(inventory_structured());
        assert!(hm.get_credentials("router1").is_none());
    }

    #[test]
    fn context_preserves_declaration_order() {
        let hm = manager();
        assert_eq!(
            hm.get_context("router1"),
            vec![
                ("site".to_string(), "site1".to_string()),
                ("role".to_string(), "router".to_string()),
            ]
        );
    }

    #[test]
    fn hosts_without_address_or_tags_are_rejected() {
        let hm = HostManager::new(credentials_site1(), commands_basic());
        let inventory: Inventory = serde_yaml::from_str(
            r#"
good:
    tags: [router]
    address: 1.1.1.1
no_address:
    tags: [router]
no_tags:
    address: 2.2.2.2
"#,
        )
        .unwrap();
        hm.update_hosts(inventory);
        assert_eq!(hm.host_count(), 1);
        assert_eq!(hm.get_address("good").as_deref(), Some("1.1.1.1"));
    }

    #[test]
    fn refresh_replaces_only_hosts() {
        let hm = manager();
        assert_eq!(hm.host_count(), 2);
        let smaller: Inventory = serde_yaml::from_str(
            r#"
router1:
    tags: [router, site1]
    address: 40.40.0.4
"#,
        )
        .unwrap();
        hm.update_hosts(smaller);
        assert_eq!(hm.host_count(), 1);
        // Credentials survive the refresh.
        assert!(hm.get_credentials("router1").is_some());
    }

    #[test]
    fn device_type_defaults_to_juniper() {
        let hm = manager();
        assert_eq!(hm.get_device_type("router1"), DeviceType::Juniper);
    }

    #[test]
    fn tag_matching_symmetry_holds_for_every_pair() {
        let hm = manager();
        let all = vec![".*".to_string()];
        let hosts = hm.get_target_hosts(&all);
        for host_key in &hosts {
            let selected = hm.get_target_commands(host_key, &all);
            let hosts_map = hm.hosts.read().unwrap();
            let host = hosts_map.get(host_key).unwrap();
            for (_, group) in hm.commands.iter() {
                let expected = host.tags.iter().any(|ht| {
                    group.tags.iter().any(|gt| tag_matches(ht, gt))
                });
                let present = selected.iter().any(|g| g.commands == group.commands);
                assert_eq!(expected, present, "group selection mismatch for {}", host_key);
            }
        }
    }
}
