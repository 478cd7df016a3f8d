//! Built-in stage handlers.

pub mod command;

pub use command::CommandHandler;

use std::collections::HashMap;
use std::sync::OnceLock;

fn variable_pattern() -> &'static regex::Regex {
    static PATTERN: OnceLock<regex::Regex> = OnceLock::new();
    PATTERN.get_or_init(|| {
        regex::Regex::new(r"\$\{([A-Za-z_][A-Za-z0-9_]*)\}").expect("variable pattern is valid")
    })
}

/// Expand `${variable}` patterns in a string.
///
/// Replaces each occurrence of `${key}` with the corresponding value from `vars`.
/// Variables that do not appear in `vars` are left as-is. Expansion is a single
/// left-to-right pass: substituted values are never expanded again.
pub fn expand_variables(template: &str, vars: &HashMap<String, String>) -> String {
    variable_pattern()
        .replace_all(template, |caps: &regex::Captures<'_>| match vars.get(&caps[1]) {
            Some(value) => value.clone(),
            None => caps[0].to_string(),
        })
        .into_owned()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn expands_known_variables() {
        let vars = HashMap::from([
            ("provider".to_string(), "acme".to_string()),
            ("snapshot_date".to_string(), "2024-01-31".to_string()),
        ]);
        assert_eq!(
            expand_variables("configs/${provider}.yaml --date ${snapshot_date}", &vars),
            "configs/acme.yaml --date 2024-01-31"
        );
    }

    #[test]
    fn leaves_unknown_variables() {
        let vars = HashMap::new();
        assert_eq!(expand_variables("echo ${unknown}", &vars), "echo ${unknown}");
    }

    #[test]
    fn substituted_values_are_not_expanded_again() {
        let vars = HashMap::from([
            ("run_dir".to_string(), "/runs/${stage}".to_string()),
            ("stage".to_string(), "train".to_string()),
        ]);
        for _ in 0..16 {
            assert_eq!(
                expand_variables("${run_dir} ${stage}", &vars),
                "/runs/${stage} train"
            );
        }
    }
}
