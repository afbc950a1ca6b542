//! The json parser kind. Match expressions are jmespath queries; multi-value
//! matches iterate either a list of nodes or a map (in which case the map
//! key is recorded as a tag under the declared `loop-key`).

use crate::spec::{MatchSpec, SubMatch};
use crate::transform::{str_2_int, yaml_scalar_to_field};
use crate::ParseError;
use jmespath::{Rcvar, Variable};
use points::{FieldValue, Point};
use std::rc::Rc;

pub(crate) fn parse(matches: &[MatchSpec], data: &serde_json::Value) -> Result<Vec<Point>, ParseError> {
    let rendered = serde_json::to_string(data)?;
    let root: Rcvar = Rc::new(
        Variable::from_json(&rendered).map_err(ParseError::Jmespath)?,
    );

    let mut out = Vec::new();
    for match_spec in matches {
        if match_spec.method.as_deref() != Some("jmespath") {
            tracing::warn!(
                method = match_spec.method.as_deref().unwrap_or("<missing>"),
                "unsupported json match method"
            );
            return Ok(out);
        }
        match match_spec.kind.as_str() {
            "single-value" => out.push(parse_single(match_spec, &root)?),
            "multi-value" => parse_multi(match_spec, &root, &mut out)?,
            other => {
                tracing::warn!(kind = other, "unknown json match type, skipping");
            }
        }
    }
    Ok(out)
}

fn search(expression: &str, data: &Rcvar) -> Result<Rcvar, ParseError> {
    let compiled =
        jmespath::compile(expression).map_err(|e| ParseError::Jmespath(e.to_string()))?;
    compiled
        .search(Rc::clone(data))
        .map_err(|e| ParseError::Jmespath(e.to_string()))
}

fn parse_single(match_spec: &MatchSpec, root: &Rcvar) -> Result<Point, ParseError> {
    let mut point = Point::new();
    point.measurement = match_spec.measurement.clone();

    let key = match match_spec.variable_name.as_deref() {
        Some(key) => key.to_string(),
        None => {
            tracing::warn!("single-value json match without variable-name");
            return Ok(point);
        }
    };
    let expression = match_spec
        .jmespath
        .as_deref()
        .ok_or_else(|| ParseError::Descriptor("json match without jmespath".to_string()))?;

    let value = search(expression, root)?;
    if value.is_null() {
        return Ok(point);
    }
    if let Some(field) = coerce_field(&value, match_spec.enumerate.as_ref(), None) {
        point.insert_field(key, field);
    }
    Ok(point)
}

fn parse_multi(match_spec: &MatchSpec, root: &Rcvar, out: &mut Vec<Point>) -> Result<(), ParseError> {
    let expression = match_spec
        .jmespath
        .as_deref()
        .ok_or_else(|| ParseError::Descriptor("json match without jmespath".to_string()))?;
    let loop_spec = match_spec
        .loop_spec
        .as_ref()
        .ok_or_else(|| ParseError::Descriptor("multi-value match without loop".to_string()))?;

    let found = search(expression, root)?;
    let (keys, nodes): (Option<Vec<String>>, Vec<Rcvar>) = if let Some(map) = found.as_object() {
        (
            Some(map.keys().cloned().collect()),
            map.values().cloned().collect(),
        )
    } else if let Some(list) = found.as_array() {
        (None, list.clone())
    } else {
        return Ok(());
    };

    for (index, node) in nodes.iter().enumerate() {
        let mut point = Point::new();
        point.measurement = match_spec.measurement.clone();

        for sub in &loop_spec.sub_matches {
            apply_sub_match(sub, node, &mut point)?;
        }

        if let (Some(keys), Some(loop_key)) = (&keys, match_spec.loop_key.as_deref()) {
            if let Some(key) = keys.get(index) {
                point.insert_tag(loop_key, key);
            }
        }

        for (tag_name, tag_expression) in &loop_spec.tags {
            let tag_value = search(tag_expression, node)?;
            if let Some(text) = scalar_string(&tag_value) {
                point.insert_tag(tag_name.clone(), &text);
            }
        }
        out.push(point);
    }
    Ok(())
}

fn apply_sub_match(sub: &SubMatch, node: &Rcvar, point: &mut Point) -> Result<(), ParseError> {
    let key = match sub.variable_name.as_deref() {
        Some(key) => key.to_string(),
        None => {
            tracing::warn!("json sub-match without variable-name, skipping");
            return Ok(());
        }
    };
    let expression = sub
        .jmespath
        .as_deref()
        .ok_or_else(|| ParseError::Descriptor("json sub-match without jmespath".to_string()))?;

    let value = search(expression, node)?;
    if value.is_null() {
        tracing::debug!(expression, "sub-match not found in node");
        return Ok(());
    }

    let transform = sub.transform.as_deref();
    if let Some(field) = coerce_field(&value, sub.enumerate.as_ref(), transform) {
        point.insert_field(key, field);
    }
    Ok(())
}

/// Applies the optional transform and enumerate steps, then keeps the value
/// only if it ended up numeric. Numbers are rounded to three decimal places
/// and reported as integers when whole.
fn coerce_field(
    value: &Variable,
    enumerate: Option<&std::collections::BTreeMap<String, serde_yaml::Value>>,
    transform: Option<&str>,
) -> Option<FieldValue> {
    let mut current: Option<FieldValue> = if let Some(n) = value.as_number() {
        Some(FieldValue::Float(n))
    } else if let Some(s) = value.as_string() {
        Some(FieldValue::Text(s.clone()))
    } else if let Some(b) = value.as_boolean() {
        Some(FieldValue::Integer(b as i64))
    } else {
        None
    };

    if transform == Some("str_2_int") {
        current = match current {
            Some(FieldValue::Text(s)) => str_2_int(&s).map(FieldValue::Integer),
            other => other,
        };
    }

    if let Some(enumerate) = enumerate {
        let rendered = match &current {
            Some(FieldValue::Text(s)) => Some(s.clone()),
            Some(FieldValue::Integer(i)) => Some(i.to_string()),
            _ => None,
        };
        if let Some(mapped) = rendered
            .and_then(|text| enumerate.get(&text))
            .and_then(yaml_scalar_to_field)
        {
            current = Some(mapped);
        }
    }

    match current? {
        FieldValue::Float(f) => {
            let rounded = (f * 1000.0).round() / 1000.0;
            if rounded.fract() == 0.0 {
                Some(FieldValue::Integer(rounded as i64))
            } else {
                Some(FieldValue::Float(rounded))
            }
        }
        FieldValue::Integer(i) => Some(FieldValue::Integer(i)),
        FieldValue::Text(s) => {
            // Unconverted text has to read as a number to survive.
            s.trim().parse::<f64>().ok().map(|f| {
                if f.fract() == 0.0 {
                    FieldValue::Integer(f as i64)
                } else {
                    FieldValue::Float(f)
                }
            })
        }
    }
}

fn scalar_string(value: &Variable) -> Option<String> {
    if let Some(s) = value.as_string() {
        Some(s.clone())
    } else if let Some(n) = value.as_number() {
        Some(n.to_string())
    } else {
        value.as_boolean().map(|b| b.to_string())
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use serde_json::json;

    fn pool_stats() -> serde_json::Value {
        json!({
            "entries": {
                "https://localhost/mgmt/tm/ltm/pool/~Common~web/stats": {
                    "nestedStats": {
                        "entries": {
                            "activeMemberCnt": {"value": 1},
                            "serverside.bitsIn": {"value": 1085496},
                            "tmName": {"description": "/Common/web"}
                        }
                    }
                },
                "https://localhost/mgmt/tm/ltm/pool/~Common~syslog/stats": {
                    "nestedStats": {
                        "entries": {
                            "activeMemberCnt": {"value": 1},
                            "serverside.bitsIn": {"value": 0},
                            "tmName": {"description": "/Common/syslog"}
                        }
                    }
                }
            }
        })
    }

    fn multi_value_matches() -> Vec<MatchSpec> {
        serde_yaml::from_str(
            r#"
- type: multi-value
  method: jmespath
  jmespath: entries
  loop-key: pool_url
  loop:
    partition_poolname: nestedStats.entries.tmName.description
    sub-matches:
      - variable-name: active_member_count
        jmespath: nestedStats.entries.activeMemberCnt.value
      - variable-name: bits_in
        jmespath: "nestedStats.entries.\"serverside.bitsIn\".value"
"#,
        )
        .unwrap()
    }

    #[test]
    fn map_iteration_yields_one_point_per_entry() {
        let points = parse(&multi_value_matches(), &pool_stats()).unwrap();
        assert_eq!(points.len(), 2);

        for point in &points {
            assert_eq!(
                point.fields.get("active_member_count"),
                Some(&FieldValue::Integer(1))
            );
            assert!(point.tags.contains_key("partition_poolname"));
            assert!(point.tags.contains_key("pool_url"));
        }
        let bits: Vec<_> = points
            .iter()
            .map(|p| p.fields.get("bits_in").cloned().unwrap())
            .collect();
        assert!(bits.contains(&FieldValue::Integer(1085496)));
        assert!(bits.contains(&FieldValue::Integer(0)));
    }

    #[test]
    fn single_value_rounds_to_three_decimals() {
        let data = json!({"system": {"load": 0.123456}});
        let matches: Vec<MatchSpec> = serde_yaml::from_str(
            r#"
- type: single-value
  method: jmespath
  jmespath: system.load
  variable-name: load
"#,
        )
        .unwrap();
        let points = parse(&matches, &data).unwrap();
        assert_eq!(points[0].fields.get("load"), Some(&FieldValue::Float(0.123)));
    }

    #[test]
    fn missing_expression_yields_empty_point() {
        let data = json!({"a": 1});
        let matches: Vec<MatchSpec> = serde_yaml::from_str(
            r#"
- type: single-value
  method: jmespath
  jmespath: b.c
  variable-name: missing
"#,
        )
        .unwrap();
        let points = parse(&matches, &data).unwrap();
        assert_eq!(points.len(), 1);
        assert!(points[0].fields.is_empty());
    }

    #[test]
    fn enumerate_maps_status_strings() {
        let data = json!({"pools": [{"state": "available"}, {"state": "offline"}]});
        let matches: Vec<MatchSpec> = serde_yaml::from_str(
            r#"
- type: multi-value
  method: jmespath
  jmespath: pools
  loop:
    sub-matches:
      - variable-name: state
        jmespath: state
        enumerate:
          available: 1
          offline: 0
"#,
        )
        .unwrap();
        let points = parse(&matches, &data).unwrap();
        assert_eq!(points[0].fields.get("state"), Some(&FieldValue::Integer(1)));
        assert_eq!(points[1].fields.get("state"), Some(&FieldValue::Integer(0)));
    }

    #[test]
    fn non_jmespath_method_is_refused() {
        let data = json!({});
        let matches: Vec<MatchSpec> = serde_yaml::from_str(
            r#"
- type: single-value
  method: xpath
  jmespath: a
  variable-name: v
"#,
        )
        .unwrap();
        let points = parse(&matches, &data).unwrap();
        assert!(points.is_empty());
    }
}
