//! TTY line declarations.
//!
//! A `tty` stanza is a degenerate service: it parses into an ordinary
//! daemon record running a getty, and shares the whole supervision
//! lifecycle. Three forms are accepted:
//!
//! ```text
//! tty [runlevels] /dev/DEV [BAUD[,BAUD...]] [noclear] [nowait] [TERM]
//! tty [runlevels] /path/to/external-getty args [noclear] [nowait]
//! tty [runlevels] notty
//! ```

use std::path::PathBuf;

use crate::{
    config,
    constants::{DEFAULT_GETTY, FALLBACK_SHELL},
    error::ConfigError,
    service::{LogSink, ServiceDecl, SvcKind},
};

/// Parses the tokens following the `tty` keyword.
pub fn parse_tty(tokens: &[String]) -> Result<ServiceDecl, ConfigError> {
    let mut decl = ServiceDecl::new(SvcKind::Tty, PathBuf::new());
    decl.log = LogSink::Console;

    let mut iter = tokens.iter().peekable();

    // Leading option tokens (runlevels, conditions, name:, ...) reuse the
    // common grammar.
    while let Some(token) = iter.peek() {
        if token.starts_with('/') || token.as_str() == "notty" {
            break;
        }
        let token = iter.next().expect("peeked token");
        config::apply_option(&mut decl, token)?;
    }

    let Some(target) = iter.next() else {
        return Err(ConfigError::BadTty("no device or command".into()));
    };

    let rest: Vec<String> = iter.cloned().collect();
    let noclear = rest.iter().any(|t| t.as_str() == "noclear");
    let words: Vec<&String> = rest
        .iter()
        .filter(|t| t.as_str() != "noclear" && t.as_str() != "nowait")
        .collect();

    if target.as_str() == "notty" {
        // Fallback shell on the console.
        decl.cmd = PathBuf::from(FALLBACK_SHELL);
        decl.args = vec!["-l".to_string()];
        decl.name = Some("notty".to_string());
        return Ok(decl);
    }

    if target.starts_with("/dev/") {
        // Built-in getty invocation: getty [--noclear] DEV [BAUD] [TERM].
        decl.cmd = PathBuf::from(DEFAULT_GETTY);
        if noclear {
            decl.args.push("--noclear".to_string());
        }
        decl.args.push(target.clone());
        for word in words {
            decl.args.push(word.clone());
        }
        let base = target.trim_start_matches("/dev/").replace('/', "-");
        if base.is_empty() {
            return Err(ConfigError::BadTty(target.clone()));
        }
        decl.name = Some(base);
        return Ok(decl);
    }

    if target.starts_with('/') {
        // External getty with its own argv.
        decl.cmd = PathBuf::from(target);
        decl.args = words.into_iter().cloned().collect();
        return Ok(decl);
    }

    Err(ConfigError::BadTty(target.clone()))
}

/// The device a tty record will open, when one is named in its argv.
pub fn device_of(decl: &ServiceDecl) -> Option<PathBuf> {
    if decl.kind != SvcKind::Tty {
        return None;
    }
    decl.args
        .iter()
        .find(|arg| arg.starts_with("/dev/"))
        .map(PathBuf::from)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::constants::RUNLEVEL_S;

    fn toks(line: &str) -> Vec<String> {
        line.split_whitespace().map(str::to_string).collect()
    }

    #[test]
    fn device_form_builds_getty_argv() {
        let decl = parse_tty(&toks("[12345] /dev/ttyS0 115200,9600 noclear vt100"))
            .expect("parse");
        assert_eq!(decl.kind, SvcKind::Tty);
        assert_eq!(decl.cmd, PathBuf::from(DEFAULT_GETTY));
        assert_eq!(
            decl.args,
            vec!["--noclear", "/dev/ttyS0", "115200,9600", "vt100"]
        );
        assert_eq!(decl.name.as_deref(), Some("ttyS0"));
        assert!(decl.runlevels.contains(1) && !decl.runlevels.contains(RUNLEVEL_S));
        assert_eq!(device_of(&decl), Some(PathBuf::from("/dev/ttyS0")));
    }

    #[test]
    fn external_getty_form_keeps_argv() {
        let decl =
            parse_tty(&toks("[2345] /sbin/mingetty tty2 nowait")).expect("parse");
        assert_eq!(decl.cmd, PathBuf::from("/sbin/mingetty"));
        assert_eq!(decl.args, vec!["tty2"]);
        assert_eq!(device_of(&decl), None);
    }

    #[test]
    fn notty_falls_back_to_shell() {
        let decl = parse_tty(&toks("notty")).expect("parse");
        assert_eq!(decl.cmd, PathBuf::from(FALLBACK_SHELL));
        assert_eq!(decl.args, vec!["-l"]);
    }

    #[test]
    fn bare_word_is_refused() {
        assert!(matches!(
            parse_tty(&toks("ttyS0")),
            Err(ConfigError::BadTty(_))
        ));
        assert!(matches!(parse_tty(&[]), Err(ConfigError::BadTty(_))));
    }
}
