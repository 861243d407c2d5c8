//! Parsing helpers for `KEY=value` environment files such as `/etc/os-release`.

use std::collections::HashMap;
use std::path::Path;

use crate::HalResult;

/// Loads a `KEY=value` file into a map.
///
/// Quotes around values are stripped, comment and malformed lines are
/// skipped.
pub fn load_env_file(path: &Path) -> HalResult<HashMap<String, String>> {
    let content = std::fs::read_to_string(path)?;
    Ok(parse_env_content(&content))
}

fn parse_env_content(content: &str) -> HashMap<String, String> {
    let mut vars = HashMap::new();
    for line in content.lines() {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        if let Some((key, value)) = line.split_once('=') {
            let key = key.trim();
            if key.is_empty() {
                continue;
            }
            let value = value.trim().trim_matches('"').trim_matches('\'');
            vars.insert(key.to_string(), value.to_string());
        }
    }
    vars
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_os_release_grammar() {
        let content = "NAME=\"SUSE Linux\"\nID=suse\n# comment\n\nBROKEN LINE\nVARIANT='Base'\n";
        let vars = parse_env_content(content);
        assert_eq!(vars.get("NAME").map(String::as_str), Some("SUSE Linux"));
        assert_eq!(vars.get("ID").map(String::as_str), Some("suse"));
        assert_eq!(vars.get("VARIANT").map(String::as_str), Some("Base"));
        assert!(!vars.contains_key("BROKEN LINE"));
    }

    #[test]
    fn loads_from_disk() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("os-release");
        std::fs::write(&path, "ID=test\n").unwrap();
        let vars = load_env_file(&path).unwrap();
        assert_eq!(vars.get("ID").map(String::as_str), Some("test"));
    }
}
