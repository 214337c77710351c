//! Restricted word expansion for service argv.
//!
//! Only environment variable substitution (`$VAR` and `${VAR}`) is
//! performed. Shell globs, command substitution and redirections are never
//! interpreted; metacharacters pass through as literal text. Unknown
//! variables expand to the empty string. A literal `$` can be written as
//! `$$`.

use std::sync::OnceLock;

use regex::Regex;

fn var_pattern() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"\$(\$|\{[A-Za-z_][A-Za-z0-9_]*\}|[A-Za-z_][A-Za-z0-9_]*)")
            .expect("static pattern")
    })
}

/// Expands variables in one word using `lookup`.
pub fn expand_word(input: &str, lookup: impl Fn(&str) -> Option<String>) -> String {
    var_pattern()
        .replace_all(input, |caps: &regex::Captures| {
            let token = &caps[1];
            if token == "$" {
                return "$".to_string();
            }
            let name = token.trim_start_matches('{').trim_end_matches('}');
            lookup(name).unwrap_or_default()
        })
        .into_owned()
}

/// Expands every argv word, each freshly allocated.
pub fn expand_args(
    args: &[String],
    lookup: impl Fn(&str) -> Option<String>,
) -> Vec<String> {
    args.iter()
        .map(|arg| expand_word(arg, &lookup))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn env(pairs: &[(&str, &str)]) -> HashMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn plain_and_braced_variables_expand() {
        let vars = env(&[("IFACE", "eth0")]);
        let lookup = |name: &str| vars.get(name).cloned();
        assert_eq!(expand_word("up-$IFACE", lookup), "up-eth0");
        assert_eq!(expand_word("up-${IFACE}x", lookup), "up-eth0x");
    }

    #[test]
    fn unknown_variables_expand_to_empty() {
        assert_eq!(expand_word("a$MISSING-b", |_| None), "a-b");
    }

    #[test]
    fn double_dollar_is_a_literal_dollar() {
        assert_eq!(expand_word("$$HOME", |_| Some("x".into())), "$HOME");
    }

    #[test]
    fn shell_metacharacters_are_not_interpreted() {
        let lookup = |_: &str| None::<String>;
        assert_eq!(expand_word("*.log", lookup), "*.log");
        assert_eq!(expand_word("|<>&:", lookup), "|<>&:");
        assert_eq!(expand_word("a;b", lookup), "a;b");
    }

    #[test]
    fn args_expand_independently() {
        let vars = env(&[("A", "1"), ("B", "2")]);
        let out = expand_args(
            &["$A".into(), "-x".into(), "${B}".into()],
            |name| vars.get(name).cloned(),
        );
        assert_eq!(out, vec!["1", "-x", "2"]);
    }
}
