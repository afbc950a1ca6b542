//! The xml parser kind: XPath matches over a cleaned document. Device XML
//! arrives with vendor namespaces and `junos:` annotation attributes; both
//! are stripped before parsing so that match expressions stay short.

use crate::spec::{MatchSpec, SubMatch};
use crate::transform::{
    cleanup_xpath, expand_engineering, field_is_numeric, is_numeric, str_2_int,
    yaml_scalar_to_field,
};
use crate::ParseError;
use lazy_static::lazy_static;
use points::{FieldValue, Point};
use regex::Regex;
use sxd_document::Package;
use sxd_xpath::nodeset::Node;
use sxd_xpath::{Context, Factory, Value};

lazy_static! {
    static ref XMLNS_ATTR: Regex =
        Regex::new(r#"\s+xmlns(?::[A-Za-z0-9_.-]+)?="[^"]*""#).unwrap();
    static ref JUNOS_ATTR: Regex = Regex::new(r#"\s+junos:[A-Za-z0-9_.-]+="[^"]*""#).unwrap();
}

/// Removes namespace declarations and `junos:` annotation attributes so the
/// document can be matched without prefix bookkeeping.
pub(crate) fn strip_namespaces(raw: &str) -> String {
    let stripped = XMLNS_ATTR.replace_all(raw, "");
    JUNOS_ATTR.replace_all(&stripped, "").into_owned()
}

pub(crate) fn parse(matches: &[MatchSpec], raw: &str) -> Result<Vec<Point>, ParseError> {
    let cleaned = strip_namespaces(raw);
    let package: Package =
        sxd_document::parser::parse(&cleaned).map_err(|e| ParseError::Xml(format!("{:?}", e)))?;
    let document = package.as_document();
    let factory = Factory::new();
    let context = Context::new();

    let mut out = Vec::new();
    for match_spec in matches {
        match match_spec.kind.as_str() {
            "single-value" => {
                out.push(parse_single(&factory, &context, document.root(), match_spec)?);
            }
            "multi-value" => {
                parse_multi(&factory, &context, document.root(), match_spec, &mut out)?;
            }
            other => {
                tracing::warn!(kind = other, "unknown xml match type, skipping");
            }
        }
    }
    Ok(out)
}

fn parse_single<'d>(
    factory: &Factory,
    context: &Context<'d>,
    root: impl Into<Node<'d>>,
    match_spec: &MatchSpec,
) -> Result<Point, ParseError> {
    let mut point = Point::new();
    let xpath = match_spec
        .xpath
        .as_deref()
        .ok_or_else(|| ParseError::Descriptor("single-value match without xpath".to_string()))?;

    let key = match match_spec.variable_name.as_deref() {
        Some(name) => name.to_string(),
        None => cleanup_xpath(xpath),
    };

    match eval_first_string(factory, context, root, xpath)? {
        Some(value) => {
            let value = value.trim().to_string();
            if is_numeric(&value) {
                point.insert_field(key, value);
            }
        }
        None => {
            if let Some(default) = &match_spec.default_if_missing {
                if let Some(value) = yaml_scalar_to_field(default) {
                    if field_is_numeric(&value) {
                        point.insert_field(key, value);
                    }
                }
            }
        }
    }
    Ok(point)
}

fn parse_multi<'d>(
    factory: &Factory,
    context: &Context<'d>,
    root: impl Into<Node<'d>>,
    match_spec: &MatchSpec,
    out: &mut Vec<Point>,
) -> Result<(), ParseError> {
    let xpath = match_spec
        .xpath
        .as_deref()
        .ok_or_else(|| ParseError::Descriptor("multi-value match without xpath".to_string()))?;
    let loop_spec = match_spec
        .loop_spec
        .as_ref()
        .ok_or_else(|| ParseError::Descriptor("multi-value match without loop".to_string()))?;

    for node in eval_nodes(factory, context, root, xpath)? {
        let mut point = Point::new();
        point.measurement = match_spec.measurement.clone();

        for sub in &loop_spec.sub_matches {
            apply_sub_match(factory, context, node, sub, &mut point)?;
        }

        for (tag_name, tag_xpath) in &loop_spec.tags {
            if let Some(value) = eval_first_string(factory, context, node, tag_xpath)? {
                point.insert_tag(tag_name.clone(), value.trim());
            }
        }
        out.push(point);
    }
    Ok(())
}

fn apply_sub_match<'d>(
    factory: &Factory,
    context: &Context<'d>,
    node: Node<'d>,
    sub: &SubMatch,
    point: &mut Point,
) -> Result<(), ParseError> {
    let xpath = sub
        .xpath
        .as_deref()
        .ok_or_else(|| ParseError::Descriptor("sub-match without xpath".to_string()))?;

    let found = eval_first_string(factory, context, node, xpath)?;
    let found = match found {
        Some(raw) => raw.trim().to_string(),
        None => {
            // No node: only a declared default can still produce the field.
            if let Some(default) = &sub.default_if_missing {
                if let Some(value) = yaml_scalar_to_field(default) {
                    if field_is_numeric(&value) {
                        let key = sub_key(sub, xpath);
                        point.fields.entry(key).or_insert(value);
                    }
                }
            }
            return Ok(());
        }
    };

    // A sub-match with its own regex extracts positional variables from the
    // node text instead of storing the text itself.
    if let Some(pattern) = &sub.regex {
        let variables = sub.variables.as_deref().unwrap_or(&[]);
        let re = Regex::new(pattern).map_err(|e| ParseError::Descriptor(e.to_string()))?;
        let captured: Vec<String> = re
            .captures_iter(&found)
            .map(|caps| {
                caps.get(1)
                    .or_else(|| caps.get(0))
                    .map(|m| m.as_str().to_string())
                    .unwrap_or_default()
            })
            .collect();
        if captured.is_empty() {
            tracing::debug!(%pattern, "no matches found for sub-match regex");
        } else if captured.len() == variables.len() {
            for (value, variable) in captured.into_iter().zip(variables) {
                let value = match variable.variable_type.as_deref() {
                    Some("integer") => match expand_engineering(&value) {
                        Some(i) => FieldValue::Integer(i),
                        None => continue,
                    },
                    _ => FieldValue::Text(value),
                };
                if field_is_numeric(&value) {
                    point.insert_field(variable.variable_name.clone(), value);
                }
            }
        } else {
            tracing::warn!(
                %pattern,
                captured = captured.len(),
                declared = variables.len(),
                "sub-match regex capture count does not line up with variables"
            );
        }
        return Ok(());
    }

    let key = sub_key(sub, xpath);
    let mut value = FieldValue::Text(found);

    if sub.transform.as_deref() == Some("str_2_int") {
        value = match &value {
            FieldValue::Text(s) => match str_2_int(s) {
                Some(i) => FieldValue::Integer(i),
                None => return Ok(()),
            },
            other => other.clone(),
        };
    }

    if sub.variable_type.as_deref() == Some("integer") {
        if let FieldValue::Text(s) = &value {
            value = match expand_engineering(s) {
                Some(i) => FieldValue::Integer(i),
                None => return Ok(()),
            };
        }
    }

    if let Some(enumerate) = &sub.enumerate {
        let text = match &value {
            FieldValue::Text(s) => s.clone(),
            FieldValue::Integer(i) => i.to_string(),
            FieldValue::Float(f) => f.to_string(),
        };
        value = match enumerate.get(&text).and_then(yaml_scalar_to_field) {
            Some(mapped) => mapped,
            None => match sub.default_if_missing.as_ref().and_then(yaml_scalar_to_field) {
                Some(default) => default,
                None => FieldValue::Integer(0),
            },
        };
    }

    if !point.fields.contains_key(&key) && field_is_numeric(&value) {
        point.insert_field(key, value);
    }
    Ok(())
}

fn sub_key(sub: &SubMatch, xpath: &str) -> String {
    match sub.variable_name.as_deref() {
        Some(name) => name.to_string(),
        None => cleanup_xpath(xpath),
    }
}

fn eval<'d>(
    factory: &Factory,
    context: &Context<'d>,
    node: impl Into<Node<'d>>,
    xpath: &str,
) -> Result<Value<'d>, ParseError> {
    let compiled = factory
        .build(xpath)
        .map_err(|e| ParseError::Xpath(format!("{}: {}", xpath, e)))?
        .ok_or_else(|| ParseError::Xpath(format!("{}: empty expression", xpath)))?;
    compiled
        .evaluate(context, node)
        .map_err(|e| ParseError::Xpath(format!("{}: {}", xpath, e)))
}

fn eval_nodes<'d>(
    factory: &Factory,
    context: &Context<'d>,
    node: impl Into<Node<'d>>,
    xpath: &str,
) -> Result<Vec<Node<'d>>, ParseError> {
    match eval(factory, context, node, xpath)? {
        Value::Nodeset(set) => Ok(set.document_order()),
        _ => Ok(Vec::new()),
    }
}

fn eval_first_string<'d>(
    factory: &Factory,
    context: &Context<'d>,
    node: impl Into<Node<'d>>,
    xpath: &str,
) -> Result<Option<String>, ParseError> {
    match eval(factory, context, node, xpath)? {
        Value::Nodeset(set) => Ok(set
            .document_order()
            .first()
            .map(|n| n.string_value())),
        Value::String(s) => {
            if s.is_empty() {
                Ok(None)
            } else {
                Ok(Some(s))
            }
        }
        Value::Number(n) => Ok(Some(n.to_string())),
        Value::Boolean(_) => Ok(None),
    }
}
