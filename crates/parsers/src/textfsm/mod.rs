//! The textfsm parser kind: a compiled template tabulates raw CLI text and
//! every row becomes one point, with declared column-to-name mappings for
//! fields and tags.

mod template;

pub use self::template::{Template, TemplateError};

use crate::transform::{expand_engineering, is_numeric};
use crate::ParseError;
use points::Point;
use std::collections::BTreeMap;

#[derive(Debug)]
pub(crate) struct TextfsmSpec {
    pub template: Template,
    /// Template column -> field name.
    pub fields: BTreeMap<String, String>,
    /// Template column -> tag name.
    pub tags: BTreeMap<String, String>,
}

pub(crate) fn parse(
    spec: &TextfsmSpec,
    measurement: Option<&str>,
    raw: &str,
) -> Result<Vec<Point>, ParseError> {
    let rows = spec
        .template
        .parse_text(raw)
        .map_err(|e| ParseError::Template(e.to_string()))?;

    let mut out = Vec::with_capacity(rows.len());
    for row in rows {
        let mut point = Point::new();
        point.measurement = measurement.map(str::to_string);

        for (column, field_name) in &spec.fields {
            let cell = match row.get(column) {
                Some(cell) => cell,
                None => continue,
            };
            // Values like `112M` are promoted to plain integers before the
            // numeric gate.
            let rendered = if cell.contains('K') || cell.contains('M') || cell.contains('G') {
                match expand_engineering(cell) {
                    Some(i) => i.to_string(),
                    None => cell.clone(),
                }
            } else {
                cell.clone()
            };
            if !is_numeric(&rendered) {
                continue;
            }
            point.insert_field(field_name.clone(), rendered);
        }

        for (column, tag_name) in &spec.tags {
            if let Some(cell) = row.get(column) {
                point.insert_tag(tag_name.clone(), cell);
            }
        }
        out.push(point);
    }
    Ok(out)
}

#[cfg(test)]
mod test {
    use super::*;
    use points::FieldValue;

    fn spec() -> TextfsmSpec {
        let template = Template::compile(
            "\
Value Process (\\S+)
Value Cpu (\\d+\\.\\d+)
Value Memory (\\d+[KMG]?)

Start
  ^\\s*\\d+\\s+\\S+\\s+${Memory}\\s+${Cpu}%\\s+${Process}\\s*$$ -> Record
",
        )
        .unwrap();
        let mut fields = BTreeMap::new();
        fields.insert("Cpu".to_string(), "cpu".to_string());
        fields.insert("Memory".to_string(), "memory".to_string());
        let mut tags = BTreeMap::new();
        tags.insert("Process".to_string(), "process".to_string());
        TextfsmSpec {
            template,
            fields,
            tags,
        }
    }

    #[test]
    fn rows_become_points_with_promoted_values() {
        let raw = " 1324 root      112M   0.59% authd\n 2211 root      55532K 0.00% pfed\n";
        let points = parse(&spec(), Some("jnpr_system_process"), raw).unwrap();
        assert_eq!(points.len(), 2);

        let first = &points[0];
        assert_eq!(first.measurement.as_deref(), Some("jnpr_system_process"));
        assert_eq!(first.tags.get("process").unwrap(), "authd");
        assert_eq!(
            first.fields.get("memory"),
            Some(&FieldValue::Text("112000000".to_string()))
        );
        assert_eq!(
            first.fields.get("cpu"),
            Some(&FieldValue::Text("0.59".to_string()))
        );
    }

    #[test]
    fn non_numeric_cells_are_dropped_from_fields() {
        let mut s = spec();
        s.fields.insert("Process".to_string(), "process_field".to_string());
        let raw = " 10 root 4K 0.10% snmpd\n";
        let points = parse(&s, None, raw).unwrap();
        assert_eq!(points.len(), 1);
        assert!(points[0].fields.get("process_field").is_none());
        assert!(points[0].fields.get("memory").is_some());
    }
}
