use serde_json::Value;

fn truthy(value: &Value) -> bool {
    match value {
        Value::Null => false,
        Value::Bool(b) => *b,
        Value::Number(n) => n.as_f64().map_or(false, |f| f != 0.0),
        Value::String(s) => !s.is_empty(),
        Value::Array(items) => !items.is_empty(),
        Value::Object(map) => !map.is_empty(),
    }
}

fn matches_literal(value: Option<&Value>, literal: &str) -> bool {
    let literal = literal.trim().trim_matches(|c| c == '"' || c == '\'');
    match value {
        Some(Value::String(s)) => s == literal,
        Some(Value::Bool(b)) => literal.parse::<bool>().map_or(false, |l| l == *b),
        Some(Value::Number(n)) => literal
            .parse::<f64>()
            .ok()
            .zip(n.as_f64())
            .map_or(false, |(l, v)| l == v),
        Some(Value::Null) | None => literal == "null",
        Some(other) => other.to_string() == literal,
    }
}

fn lookup_path<'a>(output: &'a Value, path: &str) -> Option<&'a Value> {
    path.trim()
        .split('.')
        .try_fold(output, |current, key| current.get(key))
}

/// Evaluate an edge condition against the source node's outcome.
///
/// Grammar: `success`, `failed`, `field`, `!field`, `field == value`,
/// `field != value`. Fields may be dotted paths into the output.
pub fn condition_holds(condition: &str, source_succeeded: bool, output: &Value) -> bool {
    let condition = condition.trim();
    match condition {
        "" | "always" | "true" => return true,
        "success" => return source_succeeded,
        "failed" => return !source_succeeded,
        _ => {}
    }

    let lookup = |path: &str| lookup_path(output, path);

    if let Some((field, literal)) = condition.split_once("!=") {
        return !matches_literal(lookup(field), literal);
    }
    if let Some((field, literal)) = condition.split_once("==") {
        return matches_literal(lookup(field), literal);
    }
    if let Some(field) = condition.strip_prefix('!') {
        return !lookup(field).map_or(false, truthy);
    }
    lookup(condition).map_or(false, truthy)
}
