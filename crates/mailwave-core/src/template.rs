//! Merge-tag template rendering.
//!
//! Pure string substitution: `{{key}}` tokens are replaced with values from
//! an ordered variable list. No escaping is applied — campaign content is
//! plain text. A token whose key is absent from the variables is left raw so
//! a broken merge field is visible in the output instead of silently blank.

/// Render `template`, replacing every `{{key}}` with its value. Variables are
/// applied in list order; same inputs always produce the same output.
pub fn render(template: &str, vars: &[(String, String)]) -> String {
    let mut out = template.to_string();
    for (key, value) in vars {
        out = out.replace(&format!("{{{{{key}}}}}"), value);
    }
    out
}

/// The implicit variables every recipient row provides: `name` (falling back
/// to the email local part) and `email`.
pub fn builtin_vars(email: &str, name: Option<&str>) -> Vec<(String, String)> {
    let display = match name {
        Some(n) if !n.trim().is_empty() => n.trim().to_string(),
        _ => email.split('@').next().unwrap_or(email).to_string(),
    };
    vec![
        ("name".to_string(), display),
        ("email".to_string(), email.to_string()),
    ]
}
