//! Serde model for on-disk parser definitions. Files are YAML with a single
//! top-level `parser` object; everything inside is decoded leniently so that
//! one malformed definition never takes the registry down with it.

use serde::Deserialize;
use std::collections::BTreeMap;

#[derive(Debug, Deserialize)]
pub(crate) struct ParserFile {
    pub parser: RawParser,
}

#[derive(Debug, Deserialize)]
pub(crate) struct RawParser {
    #[serde(rename = "type")]
    pub kind: Option<String>,

    /// Literal command the parser applies to.
    pub command: Option<String>,
    /// Alternative to `command`: a regular expression over command strings.
    #[serde(rename = "regex-command")]
    pub regex_command: Option<String>,

    /// Overrides the measurement name derived from the command.
    pub measurement: Option<String>,
    /// Relative URL executed instead of a CLI command on HTTP devices.
    pub query: Option<String>,

    pub matches: Option<Vec<MatchSpec>>,

    /// textfsm only: the template source and the column mappings.
    pub template: Option<String>,
    pub fields: Option<BTreeMap<String, String>>,
    pub tags: Option<BTreeMap<String, String>>,
}

/// One entry of a `matches` list. The populated subset of fields depends on
/// the parser kind and on the `single-value` / `multi-value` discriminator.
#[derive(Debug, Clone, Deserialize)]
pub struct MatchSpec {
    #[serde(rename = "type")]
    pub kind: String,

    /// json only; the sole supported method is `jmespath`.
    pub method: Option<String>,

    pub xpath: Option<String>,
    pub jmespath: Option<String>,
    pub regex: Option<String>,

    #[serde(rename = "variable-name")]
    pub variable_name: Option<String>,
    #[serde(rename = "variable-type")]
    pub variable_type: Option<String>,
    pub variables: Option<Vec<VariableSpec>>,

    pub transform: Option<String>,
    pub enumerate: Option<BTreeMap<String, serde_yaml::Value>>,
    #[serde(rename = "default-if-missing")]
    pub default_if_missing: Option<serde_yaml::Value>,

    pub measurement: Option<String>,
    #[serde(rename = "loop-key")]
    pub loop_key: Option<String>,
    #[serde(rename = "loop")]
    pub loop_spec: Option<LoopSpec>,
}

/// The `loop` block of a multi-value match: the repeated sub-matches plus a
/// free-form map of tag name to match expression.
#[derive(Debug, Clone, Deserialize)]
pub struct LoopSpec {
    #[serde(rename = "sub-matches")]
    pub sub_matches: Vec<SubMatch>,

    #[serde(flatten)]
    pub tags: BTreeMap<String, String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SubMatch {
    pub xpath: Option<String>,
    pub jmespath: Option<String>,

    #[serde(rename = "variable-name")]
    pub variable_name: Option<String>,
    #[serde(rename = "variable-type")]
    pub variable_type: Option<String>,

    pub regex: Option<String>,
    pub variables: Option<Vec<VariableSpec>>,

    pub transform: Option<String>,
    pub enumerate: Option<BTreeMap<String, serde_yaml::Value>>,
    #[serde(rename = "default-if-missing")]
    pub default_if_missing: Option<serde_yaml::Value>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct VariableSpec {
    #[serde(rename = "variable-name")]
    pub variable_name: String,
    #[serde(rename = "variable-type")]
    pub variable_type: Option<String>,
    #[serde(default)]
    pub tag: bool,
}
