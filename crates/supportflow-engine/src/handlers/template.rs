//! `{{variable}}` substitution for message templates.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde_json::Value;
use supportflow_store::SupportUser;

use crate::context::TriggerContext;

/// Build the variable table for a template rendered on behalf of `user`.
///
/// Keys from `context.data.variables` override the built-in names.
pub fn variables(ctx: &TriggerContext, user: Option<&SupportUser>) -> HashMap<String, String> {
    let mut vars = HashMap::new();
    let now = DateTime::<Utc>::from_timestamp(ctx.timestamp, 0).unwrap_or_default();
    vars.insert("current_time".to_string(), now.to_rfc3339());
    vars.insert("current_date".to_string(), now.format("%Y-%m-%d").to_string());

    if let Some(text) = ctx.message_text() {
        vars.insert("message_content".to_string(), text.to_string());
    }
    if let Some(conversation_id) = &ctx.conversation_id {
        vars.insert("conversation_id".to_string(), conversation_id.clone());
    }
    if let Some(user) = user {
        vars.insert("user_id".to_string(), user.id.clone());
        vars.insert("platform".to_string(), user.platform.clone());
        vars.insert(
            "user_name".to_string(),
            user.display_name.clone().unwrap_or_default(),
        );
    } else if let Some(user_id) = &ctx.user_id {
        vars.insert("user_id".to_string(), user_id.clone());
    }

    if let Some(custom) = ctx.variables() {
        for (key, value) in custom {
            let rendered = match value {
                Value::String(s) => s.clone(),
                other => other.to_string(),
            };
            vars.insert(key.clone(), rendered);
        }
    }
    vars
}

/// Replace every `{{ name }}` with its value. Unknown names and
/// unterminated braces are left untouched.
pub fn render(template: &str, vars: &HashMap<String, String>) -> String {
    let mut out = String::with_capacity(template.len());
    let mut rest = template;

    while let Some(open) = rest.find("{{") {
        out.push_str(&rest[..open]);
        let after = &rest[open + 2..];
        let Some(close) = after.find("}}") else {
            out.push_str(&rest[open..]);
            return out;
        };

        let name = after[..close].trim();
        match vars.get(name) {
            Some(value) if is_identifier(name) => out.push_str(value),
            _ => out.push_str(&rest[open..open + 2 + close + 2]),
        }
        rest = &after[close + 2..];
    }

    out.push_str(rest);
    out
}

fn is_identifier(name: &str) -> bool {
    !name.is_empty()
        && name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '.')
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn vars(pairs: &[(&str, &str)]) -> HashMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn substitutes_known_placeholders() {
        let out = render(
            "Hello {{user_name}}, re: {{ message_content }}",
            &vars(&[("user_name", "Ada"), ("message_content", "refund")]),
        );
        assert_eq!(out, "Hello Ada, re: refund");
    }

    #[test]
    fn unknown_placeholders_are_kept() {
        let out = render("Hi {{nobody}}!", &vars(&[]));
        assert_eq!(out, "Hi {{nobody}}!");
    }

    #[test]
    fn unterminated_braces_are_kept() {
        let out = render("Hi {{user_name", &vars(&[("user_name", "Ada")]));
        assert_eq!(out, "Hi {{user_name");
    }

    #[test]
    fn custom_variables_override_builtins() {
        let ctx = TriggerContext::new(
            "custom",
            json!({"text": "hey", "variables": {"order_id": 77, "message_content": "x"}}),
        )
        .with_conversation("c1")
        .at(0);
        let vars = variables(&ctx, None);
        assert_eq!(vars["order_id"], "77");
        assert_eq!(vars["message_content"], "x");
        assert_eq!(vars["conversation_id"], "c1");
        assert_eq!(vars["current_date"], "1970-01-01");
    }
}
