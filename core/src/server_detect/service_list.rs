//! The curated well-known port table used by ServerDetector rule 2
//! (spec.md §4.C), loadable from a plain-text file (spec.md §6).

use std::collections::HashMap;
use std::path::Path;

use lazy_static::lazy_static;

use crate::error::{CapMasterError, Result};

lazy_static! {
    /// Built-in defaults, used whenever no service-list file is configured.
    /// Covers spec.md §4.C's named examples (22, 53, 80, 443, 3306) plus the
    /// common extras a real deployment needs (documented in SPEC_FULL.md
    /// §2 as a supplemented feature).
    static ref DEFAULT_SERVICES: HashMap<u16, &'static str> = maplit::hashmap! {
        22 => "ssh",
        25 => "smtp",
        53 => "dns",
        80 => "http",
        110 => "pop3",
        143 => "imap",
        389 => "ldap",
        443 => "https",
        445 => "microsoft-ds",
        465 => "smtps",
        587 => "submission",
        636 => "ldaps",
        993 => "imaps",
        995 => "pop3s",
        1433 => "ms-sql",
        3306 => "mysql",
        3389 => "rdp",
        5432 => "postgresql",
        6379 => "redis",
        8080 => "http-alt",
        8443 => "https-alt",
        27017 => "mongodb",
    };
}

/// A port -> service-name table, in the format spec.md §6 describes:
/// `<port> <service-name>` per line, `#` starts a comment.
#[derive(Debug, Clone)]
pub struct ServiceList {
    ports: HashMap<u16, String>,
}

impl ServiceList {
    /// The built-in curated table.
    pub fn default_table() -> Self {
        ServiceList {
            ports: DEFAULT_SERVICES
                .iter()
                .map(|(&port, &name)| (port, name.to_string()))
                .collect(),
        }
    }

    /// Parses a service-list file, extending (and overriding on conflict)
    /// the built-in defaults.
    pub fn load(path: &Path) -> Result<Self> {
        let contents =
            std::fs::read_to_string(path).map_err(|e| CapMasterError::io(path, e))?;
        Ok(Self::parse(&contents))
    }

    pub fn parse(contents: &str) -> Self {
        let mut list = Self::default_table();
        for line in contents.lines() {
            let line = line.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }
            let mut parts = line.splitn(2, char::is_whitespace);
            let Some(port_str) = parts.next() else {
                continue;
            };
            let Ok(port) = port_str.parse::<u16>() else {
                log::debug!("service list: skipping unparseable line: {line}");
                continue;
            };
            let name = parts.next().unwrap_or("").trim().to_string();
            list.ports.insert(port, name);
        }
        list
    }

    pub fn is_well_known(&self, port: u16) -> bool {
        self.ports.contains_key(&port)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_table_has_named_examples() {
        let list = ServiceList::default_table();
        for port in [22, 53, 80, 443, 3306] {
            assert!(list.is_well_known(port), "port {port} should be well-known");
        }
        assert!(!list.is_well_known(54321));
    }

    #[test]
    fn parse_ignores_comments_and_blank_lines() {
        let list = ServiceList::parse("# comment\n\n9999 custom-svc\n");
        assert!(list.is_well_known(9999));
        assert!(list.is_well_known(80));
    }
}
