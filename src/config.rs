//! Access to the UCI configuration store.
//!
//! The store is a hierarchical string key/value database addressed by
//! `(package, section, option)`. Everything udiald reads and writes lives in
//! the `network` package: per-connection keys in the section named after the
//! network (`wan` by default), and a few globals in the [`GLOBAL_SECTION`].
//!
//! The store is an external collaborator. [`ConfigStore`] is the narrow
//! interface the rest of the crate sees; [`UciCli`] implements it by driving
//! the `uci` command-line tool, and tests substitute the in-memory store from
//! [`crate::test_utils`].

use std::process::Command;
use tracing::{debug, error};

/// Section holding state shared between networks, such as `failed_pin`.
pub const GLOBAL_SECTION: &str = "udiald";

pub trait ConfigStore {
    fn get(&self, section: &str, option: &str) -> Option<String>;

    fn get_list(&self, section: &str, option: &str) -> Vec<String>;

    fn set(&mut self, section: &str, option: &str, value: &str);

    /// Append a value to a list option.
    fn append(&mut self, section: &str, option: &str, value: &str);

    fn delete(&mut self, section: &str, option: &str);

    /// Create `section` with the given type if it does not exist yet.
    fn add_section(&mut self, section: &str, kind: &str);

    /// Names of all sections of the given type, in configuration order.
    fn sections_of_type(&self, kind: &str) -> Vec<String>;

    /// Flush staged changes to the backing store.
    fn commit(&mut self);

    fn get_int(&self, section: &str, option: &str, default: i64) -> i64 {
        self.get(section, option)
            .and_then(|v| v.trim().parse().ok())
            .unwrap_or(default)
    }
}

/// [`ConfigStore`] backed by the `uci` command-line tool.
pub struct UciCli {
    package: String,
}

impl UciCli {
    pub fn new(package: &str) -> Self {
        Self {
            package: package.to_string(),
        }
    }

    fn run(&self, args: &[&str]) -> Option<String> {
        let output = match Command::new("uci").args(args).output() {
            Ok(output) => output,
            Err(err) => {
                error!("failed to run uci {}: {err}", args.join(" "));
                return None;
            }
        };
        if !output.status.success() {
            return None;
        }
        Some(String::from_utf8_lossy(&output.stdout).trim_end().to_string())
    }

    fn key(&self, section: &str, option: &str) -> String {
        format!("{}.{}.{}", self.package, section, option)
    }
}

impl ConfigStore for UciCli {
    fn get(&self, section: &str, option: &str) -> Option<String> {
        self.run(&["-q", "get", &self.key(section, option)])
            .filter(|v| !v.is_empty())
    }

    fn get_list(&self, section: &str, option: &str) -> Vec<String> {
        // `uci get` joins list entries with spaces, which is ambiguous for
        // entries that contain spaces themselves (pppd options routinely do).
        // `uci show` quotes each entry, so parse that instead.
        let Some(shown) = self.run(&["-q", "show", &self.key(section, option)]) else {
            return Vec::new();
        };
        match shown.split_once('=') {
            Some((_, values)) => parse_quoted_values(values),
            None => Vec::new(),
        }
    }

    fn set(&mut self, section: &str, option: &str, value: &str) {
        let assignment = format!("{}={value}", self.key(section, option));
        debug!("uci set {assignment}");
        if self.run(&["set", &assignment]).is_none() {
            error!("failed to set {}", self.key(section, option));
        }
    }

    fn append(&mut self, section: &str, option: &str, value: &str) {
        let assignment = format!("{}={value}", self.key(section, option));
        if self.run(&["add_list", &assignment]).is_none() {
            error!("failed to append to {}", self.key(section, option));
        }
    }

    fn delete(&mut self, section: &str, option: &str) {
        self.run(&["-q", "delete", &self.key(section, option)]);
    }

    fn add_section(&mut self, section: &str, kind: &str) {
        if self.run(&["-q", "get", &format!("{}.{section}", self.package)]).is_none() {
            self.run(&["set", &format!("{}.{section}={kind}", self.package)]);
        }
    }

    fn sections_of_type(&self, kind: &str) -> Vec<String> {
        let Some(shown) = self.run(&["-q", "show", &self.package]) else {
            return Vec::new();
        };
        let prefix = format!("{}.", self.package);
        shown
            .lines()
            .filter_map(|line| {
                let (key, value) = line.split_once('=')?;
                let name = key.strip_prefix(&prefix)?;
                // Section headers have no option part.
                if name.contains('.') {
                    return None;
                }
                (value.trim_matches('\'') == kind).then(|| name.to_string())
            })
            .collect()
    }

    fn commit(&mut self) {
        if self.run(&["commit", &self.package]).is_none() {
            error!("failed to commit package {}", self.package);
        }
    }
}

/// Parse the `'a' 'b c' 'd'` value syntax printed by `uci show` for lists.
fn parse_quoted_values(input: &str) -> Vec<String> {
    let mut values = Vec::new();
    let mut current = None;
    for chunk in input.split('\'') {
        match current.take() {
            // Outside quotes; the chunk is separating whitespace.
            None => current = Some(String::new()),
            Some(mut value) => {
                value.push_str(chunk);
                values.push(value);
            }
        }
    }
    values.retain(|v| !v.is_empty());
    values
}

#[cfg(test)]
mod tests {
    use super::parse_quoted_values;

    #[test]
    fn parses_quoted_list_values() {
        assert_eq!(
            parse_quoted_values("'noccp' 'lcp-echo-interval 10'"),
            vec!["noccp".to_string(), "lcp-echo-interval 10".to_string()]
        );
        assert_eq!(parse_quoted_values("'single'"), vec!["single".to_string()]);
        assert_eq!(parse_quoted_values(""), Vec::<String>::new());
    }
}
