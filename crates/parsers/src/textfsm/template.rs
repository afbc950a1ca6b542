//! A template-driven state machine for tabulating CLI screen output. The
//! grammar is the established one for network-device scraping templates:
//! `Value` declarations followed by named states whose rules are
//! line-anchored regular expressions with optional record/transition
//! actions.

use regex::Regex;
use std::collections::BTreeMap;

#[derive(Debug, thiserror::Error)]
pub enum TemplateError {
    #[error("malformed value declaration: {0}")]
    BadValue(String),

    #[error("invalid rule pattern {pattern:?}: {source}")]
    BadPattern {
        pattern: String,
        source: regex::Error,
    },

    #[error("template has no Start state")]
    MissingStart,

    #[error("rule transitions to undeclared state: {0}")]
    UnknownState(String),

    #[error("template raised Error action on line {0:?}")]
    ErrorAction(String),
}

#[derive(Debug, Clone)]
struct ValueDef {
    name: String,
    /// The parenthesized pattern from the declaration, outer parens
    /// included; substitution turns it into a named capture group.
    pattern: String,
    filldown: bool,
    required: bool,
}

#[derive(Debug, Clone, Copy, PartialEq)]
enum LineOp {
    Next,
    Continue,
}

#[derive(Debug, Clone, Copy, PartialEq)]
enum RecordOp {
    None,
    Record,
    Clear,
    Clearall,
    Error,
}

#[derive(Debug)]
struct Rule {
    pattern: Regex,
    line_op: LineOp,
    record_op: RecordOp,
    next_state: Option<String>,
}

/// A compiled template. Parsing text yields one row per `Record` action,
/// each row keyed by the declared value names.
#[derive(Debug)]
pub struct Template {
    values: Vec<ValueDef>,
    states: BTreeMap<String, Vec<Rule>>,
}

impl Template {
    pub fn compile(source: &str) -> Result<Template, TemplateError> {
        let mut values: Vec<ValueDef> = Vec::new();
        let mut states: BTreeMap<String, Vec<Rule>> = BTreeMap::new();
        let mut order: Vec<String> = Vec::new();
        let mut current_state: Option<String> = None;

        for line in source.lines() {
            let line = line.trim_end();
            if line.trim_start().starts_with('#') || line.is_empty() {
                continue;
            }

            if let Some(rest) = line.strip_prefix("Value ") {
                values.push(parse_value(rest)?);
                continue;
            }

            if !line.starts_with(' ') && !line.starts_with('\t') {
                let name = line.trim().to_string();
                states.entry(name.clone()).or_default();
                order.push(name.clone());
                current_state = Some(name);
                continue;
            }

            let state = current_state.clone().ok_or(TemplateError::MissingStart)?;
            let rule = parse_rule(line.trim_start(), &values)?;
            if let Some(rules) = states.get_mut(&state) {
                rules.push(rule);
            }
        }

        if !states.contains_key("Start") {
            return Err(TemplateError::MissingStart);
        }
        for rules in states.values() {
            for rule in rules {
                if let Some(next) = &rule.next_state {
                    if next != "End" && !states.contains_key(next) {
                        return Err(TemplateError::UnknownState(next.clone()));
                    }
                }
            }
        }
        Ok(Template { values, states })
    }

    /// The value names in declaration order; every emitted row has exactly
    /// these keys.
    pub fn headers(&self) -> Vec<String> {
        self.values.iter().map(|v| v.name.clone()).collect()
    }

    pub fn parse_text(&self, text: &str) -> Result<Vec<BTreeMap<String, String>>, TemplateError> {
        let mut rows: Vec<BTreeMap<String, String>> = Vec::new();
        let mut current: BTreeMap<String, String> = BTreeMap::new();
        let mut state = "Start".to_string();

        'lines: for line in text.lines() {
            if state == "End" {
                break;
            }
            let rules = match self.states.get(&state) {
                Some(rules) => rules,
                None => break,
            };
            for rule in rules {
                let caps = match rule.pattern.captures(line) {
                    Some(caps) => caps,
                    None => continue,
                };
                for value in &self.values {
                    if let Some(m) = caps.name(&value.name) {
                        current.insert(value.name.clone(), m.as_str().to_string());
                    }
                }
                match rule.record_op {
                    RecordOp::Record => self.record(&mut current, &mut rows),
                    RecordOp::Clear => self.clear(&mut current, false),
                    RecordOp::Clearall => self.clear(&mut current, true),
                    RecordOp::Error => {
                        return Err(TemplateError::ErrorAction(line.to_string()));
                    }
                    RecordOp::None => {}
                }
                if let Some(next) = &rule.next_state {
                    state = next.clone();
                }
                match rule.line_op {
                    // Same line, next rule.
                    LineOp::Continue => continue,
                    LineOp::Next => continue 'lines,
                }
            }
        }

        // Screen output rarely ends with a terminator line; an in-progress
        // row is recorded at end of input. Filldown leftovers alone do not
        // constitute a row.
        let has_fresh = self
            .values
            .iter()
            .any(|v| !v.filldown && current.contains_key(&v.name));
        if has_fresh {
            self.record(&mut current, &mut rows);
        }
        Ok(rows)
    }

    fn record(
        &self,
        current: &mut BTreeMap<String, String>,
        rows: &mut Vec<BTreeMap<String, String>>,
    ) {
        let required_ok = self
            .values
            .iter()
            .filter(|v| v.required)
            .all(|v| current.contains_key(&v.name));
        if required_ok && !current.is_empty() {
            let mut row = BTreeMap::new();
            for value in &self.values {
                let cell = current.get(&value.name).cloned().unwrap_or_default();
                row.insert(value.name.clone(), cell);
            }
            rows.push(row);
        }
        self.clear(current, false);
    }

    fn clear(&self, current: &mut BTreeMap<String, String>, include_filldown: bool) {
        for value in &self.values {
            if include_filldown || !value.filldown {
                current.remove(&value.name);
            }
        }
    }
}

fn parse_value(rest: &str) -> Result<ValueDef, TemplateError> {
    // `Value [modifiers] NAME (pattern)`: everything from the first `(` is
    // the pattern, the token before it the name, anything earlier a
    // comma-separated modifier list.
    let open = rest
        .find('(')
        .ok_or_else(|| TemplateError::BadValue(rest.to_string()))?;
    let head = rest[..open].trim();
    let pattern = rest[open..].trim();
    if !pattern.starts_with('(') || !pattern.ends_with(')') {
        return Err(TemplateError::BadValue(rest.to_string()));
    }

    let mut tokens: Vec<&str> = head.split_whitespace().collect();
    let name = tokens
        .pop()
        .ok_or_else(|| TemplateError::BadValue(rest.to_string()))?
        .to_string();
    let mut filldown = false;
    let mut required = false;
    for modifier_list in tokens {
        for modifier in modifier_list.split(',') {
            match modifier {
                "Filldown" => filldown = true,
                "Required" => required = true,
                // Key and List affect row grouping upstream of us; the
                // captured text is still stored per row.
                "Key" | "List" => {}
                other => return Err(TemplateError::BadValue(other.to_string())),
            }
        }
    }
    Ok(ValueDef {
        name,
        pattern: pattern.to_string(),
        filldown,
        required,
    })
}

fn parse_rule(line: &str, values: &[ValueDef]) -> Result<Rule, TemplateError> {
    let (pattern_src, action_src) = match line.rsplit_once(" -> ") {
        Some((pattern, action)) => (pattern.trim_end(), Some(action.trim())),
        None => (line, None),
    };

    let mut expanded = pattern_src.replace("$$", "$");
    for value in values {
        let placeholder = format!("${{{}}}", value.name);
        if expanded.contains(&placeholder) {
            let group = format!("(?P<{}>", value.name);
            let named = value.pattern.replacen('(', &group, 1);
            expanded = expanded.replace(&placeholder, &named);
        }
    }

    let pattern = Regex::new(&expanded).map_err(|source| TemplateError::BadPattern {
        pattern: expanded.clone(),
        source,
    })?;

    let mut line_op = LineOp::Next;
    let mut record_op = RecordOp::None;
    let mut next_state = None;
    if let Some(action) = action_src {
        let mut tokens = action.split_whitespace();
        if let Some(first) = tokens.next() {
            let mut consumed = true;
            match first {
                "Next" => {}
                "Continue" => line_op = LineOp::Continue,
                "Record" | "Next.Record" => record_op = RecordOp::Record,
                "Clear" => record_op = RecordOp::Clear,
                "Clearall" => record_op = RecordOp::Clearall,
                "Error" => record_op = RecordOp::Error,
                "Continue.Record" => {
                    line_op = LineOp::Continue;
                    record_op = RecordOp::Record;
                }
                other => {
                    next_state = Some(other.to_string());
                    consumed = false;
                }
            }
            if consumed {
                if let Some(state) = tokens.next() {
                    next_state = Some(state.to_string());
                }
            }
        }
    }

    Ok(Rule {
        pattern,
        line_op,
        record_op,
        next_state,
    })
}

#[cfg(test)]
mod test {
    use super::*;

    const PROCESS_TEMPLATE: &str = "\
Value Process (\\S+)
Value Cpu (\\d+\\.\\d+)
Value Memory (\\d+[KMG]?)

Start
  ^\\s*\\d+\\s+\\S+\\s+${Memory}\\s+${Cpu}%\\s+${Process}\\s*$$ -> Record
";

    const SAMPLE: &str = "\
  PID USERNAME  RES    CPU   COMMAND
 1324 root      112M   0.59% authd
 2211 root      55532K 0.00% pfed
";

    #[test]
    fn rows_are_recorded_per_matching_line() {
        let template = Template::compile(PROCESS_TEMPLATE).unwrap();
        let rows = template.parse_text(SAMPLE).unwrap();
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[0].get("Process").unwrap(), "authd");
        assert_eq!(rows[0].get("Memory").unwrap(), "112M");
        assert_eq!(rows[1].get("Cpu").unwrap(), "0.00");
    }

    #[test]
    fn headers_follow_declaration_order() {
        let template = Template::compile(PROCESS_TEMPLATE).unwrap();
        assert_eq!(template.headers(), vec!["Process", "Cpu", "Memory"]);
    }

    #[test]
    fn filldown_values_persist_across_records() {
        let source = "\
Value Filldown Slot (\\d+)
Value Name (\\S+)

Start
  ^slot ${Slot}
  ^  item ${Name} -> Record
";
        let template = Template::compile(source).unwrap();
        let rows = template
            .parse_text("slot 2\n  item fan\n  item psu\n")
            .unwrap();
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[0].get("Slot").unwrap(), "2");
        assert_eq!(rows[1].get("Slot").unwrap(), "2");
        assert_eq!(rows[1].get("Name").unwrap(), "psu");
    }

    #[test]
    fn missing_start_state_is_rejected() {
        assert!(matches!(
            Template::compile("Value V (\\d+)\n\nOther\n  ^x\n"),
            Err(TemplateError::MissingStart)
        ));
    }

    #[test]
    fn state_transitions_are_followed() {
        let source = "\
Value Name (\\S+)

Start
  ^-- begin -> Body

Body
  ^${Name} -> Record
";
        let template = Template::compile(source).unwrap();
        let rows = template.parse_text("ignored\n-- begin\nalpha\nbeta\n").unwrap();
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[0].get("Name").unwrap(), "alpha");
    }
}
