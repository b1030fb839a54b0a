//! Parsing of `stanc` compiler output into structured diagnostics.
//!
//! stanc3 reports errors as
//!
//! ```text
//! Syntax error in 'model.stan', line 3, column 2 to column 8, parsing error:
//!    -------------------------------------------------
//!      2:  parameters {
//!      3:    real mu
//!            ^
//!    -------------------------------------------------
//!
//! Expected ";" after variable declaration.
//! ```
//!
//! The header gives the position, the last non-blank line after the excerpt
//! gives the message, and the excerpt line carrying the position is kept as
//! the offending construct.

use std::sync::OnceLock;

use chainfit_core::CompilerDiagnostic;
use regex::Regex;

fn header_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"^(Syntax|Semantic) error in '[^']*', line (\d+), column (\d+)")
            .unwrap_or_else(|e| unreachable!("static regex: {e}"))
    })
}

fn excerpt_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"^\s*(\d+):\s?(.*)$").unwrap_or_else(|e| unreachable!("static regex: {e}"))
    })
}

/// Extract every error reported in `output`.
///
/// Output that mentions an error but matches no known header yields one
/// diagnostic carrying the first non-blank line, so a failed compile never
/// comes back without an explanation.
pub fn parse_diagnostics(output: &str) -> Vec<CompilerDiagnostic> {
    let lines: Vec<&str> = output.lines().collect();
    let mut diagnostics = Vec::new();

    let mut idx = 0;
    while idx < lines.len() {
        let Some(caps) = header_re().captures(lines[idx]) else {
            idx += 1;
            continue;
        };
        let line: usize = caps[2].parse().unwrap_or(0);
        let column: usize = caps[3].parse().unwrap_or(0);

        // The block runs until the next header or the end of output.
        let end = (idx + 1..lines.len())
            .find(|&i| header_re().is_match(lines[i]))
            .unwrap_or(lines.len());
        let block = &lines[idx + 1..end];

        let construct = block.iter().find_map(|l| {
            excerpt_re()
                .captures(l)
                .filter(|c| c[1].parse::<usize>().ok() == Some(line))
                .map(|c| c[2].trim().to_string())
        });
        let message = block
            .iter()
            .rev()
            .map(|l| l.trim())
            .find(|l| !l.is_empty() && !l.starts_with("---") && !excerpt_re().is_match(l) && *l != "^")
            .unwrap_or(&caps[1])
            .to_string();

        diagnostics.push(CompilerDiagnostic {
            message,
            line: Some(line),
            column: Some(column),
            construct,
        });
        idx = end;
    }

    if diagnostics.is_empty() {
        if let Some(first) = lines.iter().map(|l| l.trim()).find(|l| !l.is_empty()) {
            diagnostics.push(CompilerDiagnostic {
                message: first.to_string(),
                line: None,
                column: None,
                construct: None,
            });
        }
    }
    diagnostics
}

#[cfg(test)]
mod tests {
    use super::*;

    const SYNTAX: &str = r#"
Syntax error in '/tmp/build/normal.stan', line 3, column 2 to column 8, parsing error:
   -------------------------------------------------
     1:  parameters {
     2:    real mu
     3:    real sigma;
           ^
     4:  }
   -------------------------------------------------

Expected ";" after variable declaration.
"#;

    #[test]
    fn syntax_error_position_and_message() {
        let diags = parse_diagnostics(SYNTAX);
        assert_eq!(diags.len(), 1);
        let d = &diags[0];
        assert_eq!(d.line, Some(3));
        assert_eq!(d.column, Some(2));
        assert_eq!(d.message, "Expected \";\" after variable declaration.");
        assert_eq!(d.construct.as_deref(), Some("real sigma;"));
    }

    #[test]
    fn semantic_error_is_recognized() {
        let output = "Semantic error in 'm.stan', line 7, column 4 to column 10:\n   -------\n     7:    y ~ normal(mu, s);\n   -------\n\nIdentifier 's' not in scope.\n";
        let diags = parse_diagnostics(output);
        assert_eq!(diags.len(), 1);
        assert_eq!(diags[0].line, Some(7));
        assert_eq!(diags[0].message, "Identifier 's' not in scope.");
    }

    #[test]
    fn unknown_format_keeps_first_line() {
        let diags = parse_diagnostics("\nmake: *** [normal] Error 1\nmore\n");
        assert_eq!(diags.len(), 1);
        assert_eq!(diags[0].message, "make: *** [normal] Error 1");
        assert_eq!(diags[0].line, None);
    }

    #[test]
    fn empty_output_has_no_diagnostics() {
        assert!(parse_diagnostics("").is_empty());
    }
}
