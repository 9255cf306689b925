// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Conventions rustfmt and clippy do not cover.

use std::fs;

use anyhow::{bail, Context, Result};
use camino::Utf8Path;

use crate::util::{glob_set, workspace_root, workspace_files};

/// Crates whose output goes through slog rather than stdio. The xtask
/// itself talks to a terminal.
const LOGGING_TREES: &[&str] = &["bin/", "crates/", "lib/"];

const PRINT_MACROS: &[&str] = &["println!", "eprintln!", "print!", "eprint!", "dbg!"];

/// Problems with one source file, as `(line, message)`.
fn check_source(path: &Utf8Path, text: &str) -> Vec<(usize, String)> {
    let logs = LOGGING_TREES.iter().any(|t| path.as_str().starts_with(t))
        && !path.components().any(|c| c.as_str() == "tests");
    let mut in_tests = false;
    let mut problems = Vec::new();
    for (i, line) in text.lines().enumerate() {
        let code = line.trim_start();
        if code.starts_with("//") {
            continue;
        }
        if code.starts_with("#[cfg(test)]") {
            in_tests = true;
        }
        if code.starts_with("mod tests") || code.starts_with("pub(crate) mod tests") {
            problems.push((i + 1, "test module should be `mod test`".to_string()));
        }
        if logs && !in_tests {
            if let Some(m) = PRINT_MACROS.iter().find(|m| contains_macro(code, m)) {
                problems.push((i + 1, format!("`{m}` outside tests; log through slog")));
            }
        }
    }
    problems
}

/// `code` invokes `mac`, and not merely a macro whose name ends with it.
fn contains_macro(code: &str, mac: &str) -> bool {
    code.match_indices(mac).any(|(at, _)| {
        !code[..at]
            .chars()
            .next_back()
            .is_some_and(|c| c.is_alphanumeric() || c == '_')
    })
}

pub(crate) fn cmd_style() -> Result<()> {
    let root = workspace_root()?;
    let mut failures = 0;
    for file in workspace_files(&root, "**/*.rs", &glob_set::<&str>(&[])?)? {
        let text = fs::read_to_string(root.join(&file))
            .with_context(|| format!("cannot read {file}"))?;
        for (line, problem) in check_source(&file, &text) {
            eprintln!("{file}:{line}: {problem}");
            failures += 1;
        }
    }
    if failures > 0 {
        bail!("{failures} style error(s) detected")
    }
    Ok(())
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_modules_are_singular() {
        let text = "fn f() {}\n\n#[cfg(test)]\nmod tests {\n}\n";
        let problems = check_source(Utf8Path::new("crates/ipam/src/lib.rs"), text);
        assert_eq!(problems, [(4, "test module should be `mod test`".to_string())]);

        let text = "#[cfg(test)]\nmod test {\n}\n";
        assert!(check_source(Utf8Path::new("crates/ipam/src/lib.rs"), text).is_empty());
    }

    #[test]
    fn printing_is_reserved_for_tests_and_xtask() {
        let text = concat!(
            "fn f() {\n    println!(\"hi\");\n}\n",
            "#[cfg(test)]\nmod test {\n    fn g() { dbg!(1); }\n}\n",
        );
        let problems = check_source(Utf8Path::new("lib/provision/src/state.rs"), text);
        assert_eq!(problems.len(), 1);
        assert_eq!(problems[0].0, 2);

        assert!(check_source(Utf8Path::new("xtask/src/main.rs"), text).is_empty());
        assert!(check_source(Utf8Path::new("lib/provision/tests/reflect.rs"), text).is_empty());
    }

    #[test]
    fn macro_names_match_whole_words() {
        assert!(contains_macro("println!(\"x\")", "println!"));
        assert!(contains_macro("x; eprint!(\"x\")", "eprint!"));
        assert!(!contains_macro("eprintln!(\"x\")", "println!"));
        assert!(!contains_macro("eprint!(\"x\")", "print!"));
        assert!(!contains_macro("slog::info!(log, \"x\")", "dbg!"));
    }
}
