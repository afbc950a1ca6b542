//! The regex parser kind: single-value matches whose capture groups bind
//! positionally to declared variables. Variables flagged as tags land in
//! the tag set; everything else becomes a field, coerced by its declared
//! `variable-type`.

use crate::spec::MatchSpec;
use crate::transform::{cleanup_variable, expand_engineering};
use crate::ParseError;
use points::{FieldValue, Point};
use regex::RegexBuilder;

pub(crate) fn parse(matches: &[MatchSpec], raw: &str) -> Result<Vec<Point>, ParseError> {
    let mut out = Vec::new();

    for match_spec in matches {
        if match_spec.kind != "single-value" {
            tracing::warn!(kind = %match_spec.kind, "unknown regex match type, skipping");
            continue;
        }
        let pattern = match_spec
            .regex
            .as_deref()
            .ok_or_else(|| ParseError::Descriptor("regex match without pattern".to_string()))?;
        let variables = match_spec.variables.as_deref().unwrap_or(&[]);

        let re = RegexBuilder::new(pattern)
            .multi_line(true)
            .build()
            .map_err(|e| ParseError::Descriptor(e.to_string()))?;

        let caps = match re.captures(raw) {
            Some(caps) => caps,
            None => {
                tracing::debug!(pattern, "no matches found for regex");
                continue;
            }
        };
        if caps.len() - 1 != variables.len() {
            tracing::warn!(
                pattern,
                groups = caps.len() - 1,
                declared = variables.len(),
                "capture group count does not line up with variables"
            );
            continue;
        }

        let mut point = Point::new();
        for (index, variable) in variables.iter().enumerate() {
            let value = caps
                .get(index + 1)
                .map(|m| m.as_str().trim().to_string())
                .unwrap_or_default();

            let variable_type = match variable.variable_type.as_deref() {
                Some(t) => t,
                None => {
                    tracing::warn!(
                        variable = %variable.variable_name,
                        "variable without variable-type, skipping"
                    );
                    continue;
                }
            };
            let coerced = match variable_type {
                "integer" => match expand_engineering(&value) {
                    Some(i) => FieldValue::Integer(i),
                    None => {
                        tracing::warn!(variable = %variable.variable_name, raw = %value,
                            "value is not an integer rendering, skipping");
                        continue;
                    }
                },
                "string" => FieldValue::Text(value),
                other => {
                    tracing::warn!(variable_type = other, "unknown variable-type");
                    FieldValue::Text(value)
                }
            };

            let key = cleanup_variable(&variable.variable_name);
            if variable.tag {
                point.insert_tag(key, &coerced.to_string());
            } else {
                point.insert_field(key, coerced);
            }
        }
        out.push(point);
    }
    Ok(out)
}

#[cfg(test)]
mod test {
    use super::*;

    const PROCESS_DUMP: &str = "\
 2161 root          1  20  70372K 16648K select  0:52  0.00% rpd
 2169 root          1  20  20804K 10144K select  0:31  0.00% snmpd
";

    fn matches_for(process: &str) -> Vec<MatchSpec> {
        let yaml = format!(
            r#"
- type: single-value
  regex: '\s+\d+\s+\w+\s+\d+\s+\d+\s+(\d+K)\s+(\d+K)\s+\w+\s+[0-9:]+\s+([0-9.]+)%\s+{process}'
  variables:
    - variable-name: $host.re.memory.{process}-SIZE
      variable-type: integer
    - variable-name: $host.re.memory.{process}-RES
      variable-type: integer
    - variable-name: $host.re.memory.{process}-CPU
      variable-type: integer
"#,
            process = process
        );
        serde_yaml::from_str(&yaml).unwrap()
    }

    #[test]
    fn capture_groups_bind_positionally() {
        let points = parse(&matches_for("rpd"), PROCESS_DUMP).unwrap();
        assert_eq!(points.len(), 1);
        let fields = &points[0].fields;
        assert_eq!(
            fields.get("re.memory.rpd-SIZE"),
            Some(&FieldValue::Integer(70_372_000))
        );
        assert_eq!(
            fields.get("re.memory.rpd-RES"),
            Some(&FieldValue::Integer(16_648_000))
        );
        assert_eq!(fields.get("re.memory.rpd-CPU"), Some(&FieldValue::Integer(0)));
    }

    #[test]
    fn unmatched_regex_produces_no_point() {
        let points = parse(&matches_for("dhcpd"), PROCESS_DUMP).unwrap();
        assert!(points.is_empty());
    }

    #[test]
    fn tag_flagged_variables_land_in_tags() {
        let matches: Vec<MatchSpec> = serde_yaml::from_str(
            r#"
- type: single-value
  regex: 'slot (\d+) state (\w+)'
  variables:
    - variable-name: slot
      variable-type: string
      tag: true
    - variable-name: state
      variable-type: string
"#,
        )
        .unwrap();
        let points = parse(&matches, "slot 3 state online").unwrap();
        assert_eq!(points[0].tags.get("slot").unwrap(), "3");
        assert_eq!(
            points[0].fields.get("state"),
            Some(&FieldValue::Text("online".to_string()))
        );
    }
}
