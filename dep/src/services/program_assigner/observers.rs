//! Observer-name matching between a file's OBSERVER keyword and the
//! scheduled programs.

use regex::Regex;
use std::collections::HashSet;
use std::sync::LazyLock;

use crate::models::Program;

static SEPARATORS: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\s+|\.+|/+|-+").expect("separator pattern"));
static PARENTHESIZED: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\(.+?\)").expect("parenthesis pattern"));
static COMMAS: LazyLock<Regex> = LazyLock::new(|| Regex::new(r",+").expect("comma pattern"));

const DROPPED: [&str; 5] = ["_", "/", "&", ".", "and"];

/// Normalized, de-duplicated lower-case names from a free-form observer list.
///
/// Handles strings like `"Ellis Konidaris Newman"`, `"Ellis et al."` and
/// `"Ellis, Konidaris, Belli, & Schenker"`. Single-letter tokens are dropped.
pub fn observer_names(raw: &str) -> Vec<String> {
    let s = SEPARATORS.replace_all(raw.trim(), ",");
    let mut s = PARENTHESIZED.replace_all(&s, "").into_owned();
    for token in DROPPED {
        s = s.replace(token, "");
    }
    let s = COMMAS.replace_all(&s, ",");

    let mut names: Vec<String> = Vec::new();
    for name in s.split(',') {
        let name = name.trim().to_lowercase();
        if name.chars().count() <= 1 || names.contains(&name) {
            continue;
        }
        names.push(name);
    }
    names
}

/// Index of the one program whose observers overlap the file's observers.
///
/// Overlap must hold in both directions: some file name is on the program
/// and some program name is on the file. A second matching program makes
/// the result ambiguous and yields `None`.
pub fn match_observer(file_observer: &str, programs: &[Program]) -> Option<usize> {
    let observers = observer_names(file_observer);
    if observers.is_empty() {
        return None;
    }
    let file_set: HashSet<&str> = observers.iter().map(String::as_str).collect();

    let mut matched = None;
    for (idx, prog) in programs.iter().enumerate() {
        let prog_names = observer_names(&format!("{},{}", prog.observer, prog.principal));
        if prog_names.is_empty() {
            continue;
        }
        let prog_set: HashSet<&str> = prog_names.iter().map(String::as_str).collect();

        let file_only = file_set.difference(&prog_set).count() as f64 / file_set.len() as f64;
        let prog_only = prog_set.difference(&file_set).count() as f64 / prog_set.len() as f64;
        if file_only < 1.0 && prog_only < 1.0 {
            if matched.is_some() {
                return None;
            }
            matched = Some(idx);
        }
    }
    matched
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_observer_names_normalization() {
        assert_eq!(
            observer_names("Ellis Konidaris Newman Schenker Belli"),
            vec!["ellis", "konidaris", "newman", "schenker", "belli"]
        );
        assert_eq!(observer_names("Ellis et al."), vec!["ellis", "et", "al"]);
        assert_eq!(
            observer_names("Ellis, Konidaris, Belli, Newman, & Schenkar"),
            vec!["ellis", "konidaris", "belli", "newman", "schenkar"]
        );
        assert_eq!(observer_names("Smith (UCLA)/Jones"), vec!["smith", "jones"]);
        assert_eq!(observer_names("J. Smith-Jones"), vec!["smith", "jones"]);
        assert!(observer_names("  ").is_empty());
    }

    #[test]
    fn test_literal_and_is_removed() {
        // Substring removal is literal, names containing "and" lose it.
        assert_eq!(observer_names("Sandra"), vec!["sra"]);
    }

    fn prog(code: &str, observer: &str, pi: &str) -> Program {
        Program::new(code).with_observer(observer).with_principal(pi)
    }

    #[test]
    fn test_match_observer() {
        let programs = vec![
            prog("A1", "Smith, Jones", "Smith"),
            prog("B2", "Garcia", "Nguyen"),
        ];
        assert_eq!(match_observer("Garcia", &programs), Some(1));
        assert_eq!(match_observer("jones smith", &programs), Some(0));
        assert_eq!(match_observer("Unknown", &programs), None);
        assert_eq!(match_observer("", &programs), None);
    }

    #[test]
    fn test_match_observer_ambiguous() {
        let programs = vec![prog("A1", "Smith", "Lee"), prog("B2", "Smith", "Kim")];
        assert_eq!(match_observer("Smith", &programs), None);
    }
}
