//! The parser registry: scans directories of YAML parser definitions at
//! startup, classifies each by kind, and answers two questions for the
//! collectors: *which parser handles this command string* and *what points
//! does this raw response contain*. The registry is immutable once loaded
//! and is shared read-only across every collector thread.

mod json;
mod regex_kind;
mod spec;
mod textfsm;
mod transform;
mod xml;

pub use self::textfsm::{Template, TemplateError};
pub use self::transform::{is_numeric, str_2_int};

use self::spec::{MatchSpec, ParserFile};
use self::textfsm::TextfsmSpec;
use lazy_static::lazy_static;
use points::Point;
use regex::Regex;
use std::fs;
use std::path::{Path, PathBuf};

lazy_static! {
    /// Trailing `| display xml` with arbitrary interior spacing.
    static ref DISPLAY_XML: Regex = Regex::new(r"(\s*\|\s*display\s*xml\s*)$").unwrap();
    /// Commands containing `\s+` or `\s*` are regexes, not literals.
    static ref REGEX_HINT: Regex = Regex::new(r"\\s[\+\*]").unwrap();
}

#[derive(Debug, thiserror::Error)]
pub enum ParseError {
    #[error("no parser found for command {command:?}")]
    NoParser { command: String },

    #[error("parser expects {expected} input")]
    Payload { expected: &'static str },

    #[error("parser definition is incomplete: {0}")]
    Descriptor(String),

    #[error("failed to parse xml document: {0}")]
    Xml(String),

    #[error("xpath evaluation failed: {0}")]
    Xpath(String),

    #[error("jmespath evaluation failed: {0}")]
    Jmespath(String),

    #[error("textfsm template failed: {0}")]
    Template(String),

    #[error(transparent)]
    Json(#[from] serde_json::Error),
}

/// Parser kinds in their fixed lookup priority order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Kind {
    Xml,
    Textfsm,
    Regex,
    Json,
}

const KIND_PRIORITY: [Kind; 4] = [Kind::Xml, Kind::Textfsm, Kind::Regex, Kind::Json];

impl Kind {
    fn from_label(label: &str) -> Option<Kind> {
        match label {
            "xml" => Some(Kind::Xml),
            "textfsm" => Some(Kind::Textfsm),
            "regex" => Some(Kind::Regex),
            "json" => Some(Kind::Json),
            _ => None,
        }
    }
}

/// How a parser's command is matched against a probed command string.
#[derive(Debug)]
enum CommandPattern {
    Literal(String),
    Pattern(Regex),
}

impl CommandPattern {
    fn matches(&self, base: &str, suffixed: &str) -> bool {
        match self {
            CommandPattern::Literal(literal) => literal == base || literal == suffixed,
            // Anchored at the start, like a prefix match.
            CommandPattern::Pattern(re) => {
                starts_with_match(re, base) || starts_with_match(re, suffixed)
            }
        }
    }
}

fn starts_with_match(re: &Regex, text: &str) -> bool {
    re.find(text).map_or(false, |m| m.start() == 0)
}

/// One loaded parser definition with its compiled match specification.
#[derive(Debug)]
pub struct Descriptor {
    /// File name; doubles as the stable lookup identity.
    pub name: String,
    pub kind: Kind,
    pattern: CommandPattern,
    /// Literal command text, when the definition declares one.
    pub command: Option<String>,
    /// Relative URL executed instead of a CLI command on HTTP devices.
    pub query: Option<String>,
    pub measurement: Option<String>,
    kind_spec: KindSpec,
}

#[derive(Debug)]
enum KindSpec {
    Xml(Vec<MatchSpec>),
    Json(Vec<MatchSpec>),
    Regex(Vec<MatchSpec>),
    Textfsm(TextfsmSpec),
}

/// A device response on its way into the registry: CLI/NETCONF sessions
/// produce text, HTTP sessions produce decoded JSON.
#[derive(Debug, Clone)]
pub enum RawPayload {
    Text(String),
    Json(serde_json::Value),
}

impl RawPayload {
    fn as_text(&self) -> Result<&str, ParseError> {
        match self {
            RawPayload::Text(s) => Ok(s),
            RawPayload::Json(_) => Err(ParseError::Payload { expected: "text" }),
        }
    }

    fn to_json(&self) -> Result<serde_json::Value, ParseError> {
        match self {
            RawPayload::Json(v) => Ok(v.clone()),
            RawPayload::Text(s) => Ok(serde_json::from_str(s)?),
        }
    }
}

impl Descriptor {
    fn parse(&self, payload: &RawPayload) -> Result<Vec<Point>, ParseError> {
        match &self.kind_spec {
            KindSpec::Xml(matches) => xml::parse(matches, payload.as_text()?),
            KindSpec::Textfsm(spec) => {
                textfsm::parse(spec, self.measurement.as_deref(), payload.as_text()?)
            }
            KindSpec::Regex(matches) => regex_kind::parse(matches, payload.as_text()?),
            KindSpec::Json(matches) => json::parse(matches, &payload.to_json()?),
        }
    }
}

#[derive(Debug, Default)]
pub struct ParserRegistry {
    parsers: Vec<Descriptor>,
}

impl ParserRegistry {
    /// Scans the given directories recursively and loads every definition
    /// that survives validation. Individual failures are logged and
    /// skipped; loading never aborts.
    pub fn load<P: AsRef<Path>>(dirs: &[P]) -> ParserRegistry {
        let mut files = Vec::new();
        for dir in dirs {
            walk(dir.as_ref(), &mut files);
        }
        files.sort();

        let mut parsers = Vec::new();
        for file in files {
            match load_descriptor(&file) {
                Ok(descriptor) => {
                    tracing::debug!(name = %descriptor.name, kind = ?descriptor.kind, "loaded parser");
                    parsers.push(descriptor);
                }
                Err(reason) => {
                    tracing::warn!(file = %file.display(), %reason, "skipping parser definition");
                }
            }
        }
        if parsers.is_empty() {
            tracing::warn!("no parsers loaded");
        } else {
            tracing::info!(count = parsers.len(), "parser registry ready");
        }
        ParserRegistry { parsers }
    }

    pub fn len(&self) -> usize {
        self.parsers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.parsers.is_empty()
    }

    pub fn count_of(&self, kind: Kind) -> usize {
        self.parsers.iter().filter(|p| p.kind == kind).count()
    }

    /// Resolves a command string (or a parser file name) to its parser.
    /// Name matches win; otherwise kinds are probed in fixed priority order
    /// against both the base command and its `| display xml` form, first
    /// match winning. Deterministic for a given registry.
    pub fn find(&self, input: &str) -> Option<&Descriptor> {
        if let Some(by_name) = self.parsers.iter().find(|p| p.name == input) {
            return Some(by_name);
        }

        let (base, suffixed) = display_xml_forms(input);
        for kind in KIND_PRIORITY {
            for parser in self.parsers.iter().filter(|p| p.kind == kind) {
                if parser.pattern.matches(&base, &suffixed) {
                    return Some(parser);
                }
            }
        }
        None
    }

    /// Parses a raw device response with the parser matching `command`.
    pub fn parse(&self, command: &str, payload: &RawPayload) -> Result<Vec<Point>, ParseError> {
        let descriptor = self.find(command).ok_or_else(|| ParseError::NoParser {
            command: command.to_string(),
        })?;
        descriptor.parse(payload)
    }

    /// The measurement name for a command: the parser's override when
    /// declared, otherwise derived from the parser's command text.
    pub fn measurement_for(&self, command: &str) -> Option<String> {
        let descriptor = self.find(command)?;
        if let Some(measurement) = &descriptor.measurement {
            return Some(measurement.clone());
        }
        let source = descriptor.command.as_deref().unwrap_or(command);
        Some(derive_measurement(source))
    }
}

/// `show bgp summary` -> `bgp_summary`.
pub fn derive_measurement(command: &str) -> String {
    command
        .replace(' ', "_")
        .replace('-', "_")
        .replace("show_", "")
}

/// Returns the command without and with the ` | display xml` suffix.
fn display_xml_forms(input: &str) -> (String, String) {
    if DISPLAY_XML.is_match(input) {
        (DISPLAY_XML.replace(input, "").into_owned(), input.to_string())
    } else {
        (input.to_string(), format!("{} | display xml", input))
    }
}

fn walk(dir: &Path, files: &mut Vec<PathBuf>) {
    let entries = match fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(error) => {
            tracing::warn!(dir = %dir.display(), %error, "cannot read parser directory");
            return;
        }
    };
    for entry in entries.flatten() {
        let path = entry.path();
        if path.is_dir() {
            walk(&path, files);
        } else {
            files.push(path);
        }
    }
}

fn load_descriptor(path: &Path) -> Result<Descriptor, String> {
    let name = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .ok_or_else(|| "not a file".to_string())?;

    let raw = fs::read_to_string(path).map_err(|e| format!("unreadable: {}", e))?;
    let file: ParserFile =
        serde_yaml::from_str(&raw).map_err(|e| format!("invalid yaml: {}", e))?;
    let parser = file.parser;

    let kind = match parser.kind.as_deref() {
        None => {
            tracing::warn!(file = %name, "parser kind not declared, assuming xml");
            Kind::Xml
        }
        Some(label) => {
            Kind::from_label(label).ok_or_else(|| format!("unsupported kind {:?}", label))?
        }
    };

    let (pattern, command) = match (&parser.regex_command, &parser.command) {
        (Some(regex_command), _) => {
            let re = Regex::new(regex_command).map_err(|e| format!("bad regex-command: {}", e))?;
            (CommandPattern::Pattern(re), None)
        }
        (None, Some(command)) => {
            if REGEX_HINT.is_match(command) {
                let re = Regex::new(command).map_err(|e| format!("bad command regex: {}", e))?;
                (CommandPattern::Pattern(re), Some(command.clone()))
            } else {
                (CommandPattern::Literal(command.clone()), Some(command.clone()))
            }
        }
        (None, None) => return Err("neither command nor regex-command declared".to_string()),
    };

    let kind_spec = match kind {
        Kind::Xml => KindSpec::Xml(parser.matches.unwrap_or_default()),
        Kind::Json => KindSpec::Json(parser.matches.unwrap_or_default()),
        Kind::Regex => KindSpec::Regex(parser.matches.unwrap_or_default()),
        Kind::Textfsm => {
            let source = parser
                .template
                .ok_or_else(|| "textfsm parser without template".to_string())?;
            let template =
                Template::compile(&source).map_err(|e| format!("bad template: {}", e))?;
            KindSpec::Textfsm(TextfsmSpec {
                template,
                fields: parser.fields.unwrap_or_default(),
                tags: parser.tags.unwrap_or_default(),
            })
        }
    };

    Ok(Descriptor {
        name,
        kind,
        pattern,
        command,
        query: parser.query,
        measurement: parser.measurement,
        kind_spec,
    })
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn measurement_derivation_strips_show_prefix() {
        assert_eq!(derive_measurement("show bgp summary"), "bgp_summary");
        assert_eq!(derive_measurement("show route-summary"), "route_summary");
        assert_eq!(derive_measurement("uptime"), "uptime");
    }

    #[test]
    fn display_xml_suffix_is_recognized() {
        let (base, suffixed) = display_xml_forms("show bgp summary | display xml");
        assert_eq!(base, "show bgp summary");
        assert_eq!(suffixed, "show bgp summary | display xml");

        let (base, suffixed) = display_xml_forms("show bgp summary");
        assert_eq!(base, "show bgp summary");
        assert_eq!(suffixed, "show bgp summary | display xml");
    }

    #[test]
    fn regex_hint_detects_patterns() {
        assert!(REGEX_HINT.is_match(r"show system processes\s+extensive"));
        assert!(!REGEX_HINT.is_match("show system processes extensive"));
    }
}
