//! Bit-exact initial-prompt and system-prompt construction (§6).

use chrono::{DateTime, Utc};
use orc_store::ApiDefinitionVersion;
use orc_tools::schema::infer_schema;

/// Marker string beginning the extraction-contract preamble. The OpenCUA
/// handler re-extracts the original task instruction by splitting on this
/// exact literal, so it must never change independently in both places.
pub const EXTRACTION_PREAMBLE_MARKER: &str = "IMPORTANT INSTRUCTIONS FOR RETURNING RESULTS:";

/// Replaces `{name}` and `{{name}}` placeholders in `template` with the
/// corresponding value from `parameters`, plus a synthetic `now`.
pub fn substitute_parameters(template: &str, parameters: &serde_json::Value, now: DateTime<Utc>) -> String {
    let mut out = template.to_string();
    let mut values: Vec<(String, String)> = Vec::new();
    if let Some(obj) = parameters.as_object() {
        for (key, value) in obj {
            let rendered = match value {
                serde_json::Value::String(s) => s.clone(),
                other => other.to_string(),
            };
            values.push((key.clone(), rendered));
        }
    }
    values.push(("now".to_string(), now.to_rfc3339()));

    for (key, value) in &values {
        out = out.replace(&format!("{{{{{key}}}}}"), value);
        out = out.replace(&format!("{{{key}}}"), value);
    }
    out
}

/// Builds the extraction-contract preamble: the literal marker, the
/// response JSON schema inferred from `response_example`, the API name,
/// and the cleanup sentence (§6).
pub fn build_extraction_preamble(api_name: &str, response_example: &serde_json::Value, prompt_cleanup: &str) -> String {
    let schema = infer_schema(response_example);
    let schema_text = serde_json::to_string_pretty(&schema).unwrap_or_default();
    format!(
        "{EXTRACTION_PREAMBLE_MARKER}\n\
         Call the `extraction` tool with a `data` object matching this JSON schema once you have \
         completed the task \"{api_name}\":\n{schema_text}\n\n\
         After you've completed the extraction, please perform these steps to return the system to \
         its original state: {prompt_cleanup}"
    )
}

/// Concatenates the version's prompt (parameters substituted), the
/// extraction preamble, and the cleanup sentence into the job's initial
/// user message (§6, "bit-exact structure").
pub fn build_initial_prompt(api_name: &str, version: &ApiDefinitionVersion, parameters: &serde_json::Value, now: DateTime<Utc>) -> String {
    let task_prompt = substitute_parameters(&version.prompt, parameters, now);
    let preamble = build_extraction_preamble(api_name, &version.response_example, &version.prompt_cleanup);
    format!("{task_prompt}\n\n{preamble}")
}

/// The static capabilities paragraph, bit-exact for default mode (§6).
fn system_capability_paragraph() -> &'static str {
    "You are utilizing a Linux virtual machine with internet access and a resolution matching the \
     remote session. When clicking, aim for the center of small UI elements rather than the edge. \
     Key combinations must use X11 keysym names (e.g. the Command/Windows/Meta key is `Super_L`, \
     never `cmd` or `win`). After every tool call that changes the screen, take a screenshot and \
     confirm the expected state before proceeding. You MUST call the `extraction` tool exactly once \
     to report your final result; never report results as plain text. If the screen does not match \
     what the task instructions describe, call `ui_not_as_expected` with your reasoning instead of \
     guessing. Chain related tool calls together rather than pausing between obviously sequential steps."
}

/// Builds the system prompt: `<SYSTEM_CAPABILITY>` paragraph, current date
/// formatted `%A, %B %-d, %Y`, closing tag, and an optional suffix.
pub fn build_system_prompt(now: DateTime<Utc>, suffix: Option<&str>) -> String {
    let date = now.format("%A, %B %-d, %Y").to_string();
    let mut prompt = format!("<SYSTEM_CAPABILITY>\n{}\nToday's date is {date}.\n</SYSTEM_CAPABILITY>", system_capability_paragraph());
    if let Some(suffix) = suffix {
        prompt.push(' ');
        prompt.push_str(suffix);
    }
    prompt
}

#[cfg(test)]
mod tests {
    use super::*;
    use uuid::Uuid;

    fn version() -> ApiDefinitionVersion {
        ApiDefinitionVersion {
            id: Uuid::new_v4(),
            api_definition_id: Uuid::new_v4(),
            version_number: 1,
            parameters: vec![],
            prompt: "Add {a} and {{b}} together.".to_string(),
            prompt_cleanup: "close any open dialogs".to_string(),
            response_example: serde_json::json!({"sum": 0}),
            is_active: true,
        }
    }

    #[test]
    fn substitutes_single_and_double_brace_placeholders() {
        let params = serde_json::json!({"a": 2, "b": 3});
        let out = substitute_parameters("Add {a} and {{b}} together.", &params, Utc::now());
        assert_eq!(out, "Add 2 and 3 together.");
    }

    #[test]
    fn initial_prompt_contains_the_preamble_marker_and_task() {
        let prompt = build_initial_prompt("sum", &version(), &serde_json::json!({"a": 2, "b": 3}), Utc::now());
        assert!(prompt.contains("Add 2 and 3 together."));
        assert!(prompt.contains(EXTRACTION_PREAMBLE_MARKER));
        assert!(prompt.contains("close any open dialogs"));
    }

    #[test]
    fn system_prompt_wraps_capability_block_and_date() {
        let now = DateTime::parse_from_rfc3339("2026-08-01T00:00:00Z").unwrap().with_timezone(&Utc);
        let prompt = build_system_prompt(now, None);
        assert!(prompt.starts_with("<SYSTEM_CAPABILITY>"));
        assert!(prompt.ends_with("</SYSTEM_CAPABILITY>"));
        assert!(prompt.contains("Saturday, August 1, 2026"));
    }

    #[test]
    fn system_prompt_appends_suffix_with_single_space() {
        let prompt = build_system_prompt(Utc::now(), Some("Extra instructions."));
        assert!(prompt.ends_with("</SYSTEM_CAPABILITY> Extra instructions."));
    }
}
