//! Inline-protocol rendering. One terminated line per point:
//! `measurement,tag=v field=v,field=v <nanoseconds>`. When the tag set is
//! empty the comma after the measurement is omitted. Field values render
//! exactly as produced (no quoting, no integer suffix), which is the format
//! the downstream relay has always consumed.

use crate::{FieldValue, Point};

/// Renders a point as a single line, without the trailing newline.
pub fn format_line(point: &Point) -> String {
    let tags = point
        .tags
        .iter()
        .map(|(k, v)| format!("{}={}", k, v))
        .collect::<Vec<_>>()
        .join(",");
    let fields = point
        .fields
        .iter()
        .map(|(k, v)| format!("{}={}", k, v))
        .collect::<Vec<_>>()
        .join(",");

    let measurement = point.measurement.as_deref().unwrap_or("");
    if point.tags.is_empty() {
        format!("{} {} {}", measurement, fields, point.timestamp_ns)
    } else {
        format!("{},{} {} {}", measurement, tags, fields, point.timestamp_ns)
    }
}

/// Parses a line back into a point. Only used to verify round-trips in
/// tests; values are recovered as integers, floats, or text in that order
/// of preference.
pub fn parse_line(line: &str) -> Option<Point> {
    let mut sections = line.split(' ');
    let head = sections.next()?;
    let fields = sections.next()?;
    let timestamp_ns = sections.next()?.parse::<i64>().ok()?;
    if sections.next().is_some() {
        return None;
    }

    let mut point = Point::new();
    point.timestamp_ns = timestamp_ns;

    let mut head_parts = head.split(',');
    point.measurement = Some(head_parts.next()?.to_string());
    for tag in head_parts {
        let (key, value) = tag.split_once('=')?;
        point.tags.insert(key.to_string(), value.to_string());
    }

    for field in fields.split(',') {
        let (key, value) = field.split_once('=')?;
        point.fields.insert(key.to_string(), parse_field_value(value));
    }
    Some(point)
}

fn parse_field_value(raw: &str) -> FieldValue {
    if let Ok(i) = raw.parse::<i64>() {
        return FieldValue::Integer(i);
    }
    if let Ok(f) = raw.parse::<f64>() {
        return FieldValue::Float(f);
    }
    FieldValue::Text(raw.to_string())
}

#[cfg(test)]
mod test {
    use super::*;
    use quickcheck_macros::quickcheck;
    use std::collections::BTreeMap;

    #[test]
    fn point_with_one_tag_and_one_field_renders_the_documented_line() {
        let mut point = Point::new();
        point.measurement = Some("m".to_string());
        point.insert_tag("a", "1");
        point.insert_field("f", 2i64);
        point.timestamp_ns = 100;
        assert_eq!(format_line(&point), "m,a=1 f=2 100");
    }

    #[test]
    fn tagless_point_omits_the_comma() {
        let mut point = Point::new();
        point.measurement = Some("agent_stats".to_string());
        point.insert_field("nbr_devices", 7i64);
        point.timestamp_ns = 42;
        assert_eq!(format_line(&point), "agent_stats nbr_devices=7 42");
    }

    #[test]
    fn textual_field_values_pass_through_unquoted() {
        let mut point = Point::new();
        point.measurement = Some("m".to_string());
        point.insert_field("execution_time_sec", "0.0040");
        point.timestamp_ns = 1;
        assert_eq!(format_line(&point), "m execution_time_sec=0.0040 1");
    }

    // Restrict generated identifiers to characters that carry no meaning in
    // the protocol, per the round-trip contract.
    fn ident(seed: &str, fallback: &str) -> String {
        let cleaned: String = seed.chars().filter(|c| c.is_ascii_alphanumeric()).collect();
        if cleaned.is_empty() {
            fallback.to_string()
        } else {
            cleaned
        }
    }

    #[quickcheck]
    fn lines_round_trip(keys: Vec<String>, values: Vec<i64>, timestamp_ns: i64) -> bool {
        let mut point = Point::new();
        point.measurement = Some("m".to_string());
        point.timestamp_ns = timestamp_ns;
        point.insert_field("f", 1i64);
        let mut tags = BTreeMap::new();
        for (i, (key, value)) in keys.iter().zip(values.iter()).enumerate() {
            let name = format!("{}{}", ident(key, "k"), i);
            point.insert_field(name.clone(), *value);
            tags.insert(format!("t{}", name), format!("{}", value));
        }
        for (k, v) in &tags {
            point.insert_tag(k.clone(), v);
        }
        parse_line(&format_line(&point)).as_ref() == Some(&point)
    }
}
