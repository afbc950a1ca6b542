//! Value transforms shared by the parser kinds: engineering-suffix
//! conversion, numeric validation, and the identifier cleanups applied to
//! xpath-derived and `$`-templated variable names.

use points::FieldValue;

/// A field survives only if it can be read as a number. Textual values keep
/// their original rendering but still have to pass this gate.
pub fn is_numeric(value: &str) -> bool {
    value.trim().parse::<f64>().is_ok()
}

pub fn field_is_numeric(value: &FieldValue) -> bool {
    match value {
        FieldValue::Integer(_) | FieldValue::Float(_) => true,
        FieldValue::Text(s) => is_numeric(s),
    }
}

/// Converts a throughput rendering such as `1.5G`, `300mbps` or `12kbps`
/// into an integer count. Returns `None` when the input does not begin with
/// a digit or the remainder is not a number.
pub fn str_2_int(value: &str) -> Option<i64> {
    if !value.chars().next().map_or(false, |c| c.is_ascii_digit()) {
        return None;
    }
    let value = value.to_lowercase();

    let (stripped, multiplier) = if value.contains("gbps") || value.contains('g') {
        (value.replace("gbps", "").replace('g', ""), 1e9)
    } else if value.contains("mbps") || value.contains('m') {
        (value.replace("mbps", "").replace('m', ""), 1e6)
    } else if value.contains("kbps") {
        (value.replace("kbps", ""), 1e3)
    } else if value.contains("bps") {
        (value.replace("bps", ""), 1.0)
    } else {
        (value, 1.0)
    };

    stripped
        .trim()
        .parse::<f64>()
        .ok()
        .map(|v| (v * multiplier) as i64)
}

/// The `variable-type: integer` conversion: K/M/G are expanded digit-wise
/// (`112M` becomes `112000000`) and the result truncated to an integer.
pub fn expand_engineering(value: &str) -> Option<i64> {
    let expanded = value
        .replace('G', "000000000")
        .replace('M', "000000")
        .replace('K', "000");
    expanded.trim().parse::<f64>().ok().map(|v| v as i64)
}

/// Derives a field name from an xpath when no `variable-name` is declared.
pub fn cleanup_xpath(xpath: &str) -> String {
    xpath.replace("./", "").replace("..", "").replace("//", "")
}

/// Strips the `$host.` prefix that legacy definitions carry on variable
/// names.
pub fn cleanup_variable(name: &str) -> String {
    name.replace("$host.", "")
}

/// Collapses the `$host` / `$<key>` placeholders of templated variable
/// names into a plain dotted identifier.
pub fn normalize_variable_name(name: &str) -> String {
    let flattened = name.replace("$host", "").replace("..", ".");
    flattened.trim_start_matches('.').to_string()
}

/// Maps a YAML scalar (an `enumerate` target or a `default-if-missing`
/// value) onto a field value.
pub fn yaml_scalar_to_field(value: &serde_yaml::Value) -> Option<FieldValue> {
    match value {
        serde_yaml::Value::Number(n) => {
            if let Some(i) = n.as_i64() {
                Some(FieldValue::Integer(i))
            } else {
                n.as_f64().map(FieldValue::Float)
            }
        }
        serde_yaml::Value::String(s) => Some(FieldValue::Text(s.clone())),
        serde_yaml::Value::Bool(b) => Some(FieldValue::Integer(*b as i64)),
        _ => None,
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn throughput_strings_convert_to_counts() {
        assert_eq!(str_2_int("1.5G"), Some(1_500_000_000));
        assert_eq!(str_2_int("300mbps"), Some(300_000_000));
        assert_eq!(str_2_int("12kbps"), Some(12_000));
        assert_eq!(str_2_int("9600bps"), Some(9600));
        assert_eq!(str_2_int("42"), Some(42));
    }

    #[test]
    fn non_numeric_input_is_rejected() {
        assert_eq!(str_2_int("full"), None);
        assert_eq!(str_2_int(""), None);
    }

    #[test]
    fn engineering_suffixes_expand_digitwise() {
        assert_eq!(expand_engineering("112M"), Some(112_000_000));
        assert_eq!(expand_engineering("70372K"), Some(70_372_000));
        assert_eq!(expand_engineering("2G"), Some(2_000_000_000));
        assert_eq!(expand_engineering("0.59"), Some(0));
    }

    #[test]
    fn numeric_gate_accepts_number_renderings_only() {
        assert!(is_numeric("16"));
        assert!(is_numeric("0.59"));
        assert!(is_numeric(" 21 "));
        assert!(!is_numeric("inet.0"));
        assert!(!is_numeric(""));
    }

    #[test]
    fn variable_names_lose_their_placeholders() {
        assert_eq!(cleanup_variable("$host.re.memory.rpd-CPU"), "re.memory.rpd-CPU");
        assert_eq!(normalize_variable_name("$host.re.memory"), "re.memory");
    }
}
