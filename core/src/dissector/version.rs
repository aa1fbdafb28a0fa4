//! Locating the dissector executable and checking its version floor
//! (spec.md §4.A, §6, §9).

use std::path::PathBuf;
use std::process::Command;

use crate::error::DissectorError;

/// Environment variable documented in spec.md §6 for overriding the
/// dissector path.
pub const TSHARK_PATH_ENV: &str = "TSHARK_PATH";

/// Resolves the dissector executable path: explicit override argument >
/// `TSHARK_PATH` env var > PATH lookup (SPEC_FULL.md §2).
pub fn resolve_path(override_path: Option<&PathBuf>) -> Result<PathBuf, DissectorError> {
    if let Some(path) = override_path {
        if path.is_file() {
            return Ok(path.clone());
        }
        return Err(DissectorError::NotFound(path.display().to_string()));
    }
    if let Ok(env_path) = std::env::var(TSHARK_PATH_ENV) {
        let path = PathBuf::from(&env_path);
        if path.is_file() {
            return Ok(path);
        }
        return Err(DissectorError::NotFound(env_path));
    }
    which::which("tshark")
        .map_err(|_| DissectorError::NotFound("tshark".to_string()))
}

/// Runs `<path> -v` and extracts the version string, e.g. `3.6.2`.
pub fn detect_version(path: &std::path::Path) -> Result<semver::Version, DissectorError> {
    let output = Command::new(path)
        .arg("-v")
        .output()
        .map_err(DissectorError::Spawn)?;
    let stdout = String::from_utf8_lossy(&output.stdout);
    parse_version(&stdout)
        .ok_or_else(|| DissectorError::VersionMismatch {
            found: "unparseable".to_string(),
            floor: "unknown".to_string(),
        })
}

/// Extracts a semver-compatible version from tshark's `-v` banner, e.g.
/// `TShark (Wireshark) 3.6.2 (Git commit ...)`.
fn parse_version(banner: &str) -> Option<semver::Version> {
    let first_line = banner.lines().next()?;
    let token = first_line
        .split_whitespace()
        .find(|tok| tok.chars().next().map(|c| c.is_ascii_digit()).unwrap_or(false))?;
    // Keep only the leading `MAJOR.MINOR.PATCH` portion; tshark sometimes
    // appends extra qualifiers like `3.6.2git`.
    let numeric: String = token
        .chars()
        .take_while(|c| c.is_ascii_digit() || *c == '.')
        .collect();
    semver::Version::parse(&pad_to_semver(&numeric)).ok()
}

/// `semver::Version::parse` requires exactly three dot-separated numbers;
/// tshark may print only `MAJOR.MINOR`.
fn pad_to_semver(numeric: &str) -> String {
    let parts: Vec<&str> = numeric.split('.').filter(|s| !s.is_empty()).collect();
    match parts.len() {
        0 => "0.0.0".to_string(),
        1 => format!("{}.0.0", parts[0]),
        2 => format!("{}.{}.0", parts[0], parts[1]),
        _ => parts[..3].join("."),
    }
}

/// Verifies `found >= floor`, surfacing a `VersionMismatch` otherwise
/// (spec.md §4.A).
pub fn check_floor(found: &semver::Version, floor: &str) -> Result<(), DissectorError> {
    let floor_version =
        semver::Version::parse(floor).map_err(|_| DissectorError::VersionMismatch {
            found: found.to_string(),
            floor: floor.to_string(),
        })?;
    if *found < floor_version {
        return Err(DissectorError::VersionMismatch {
            found: found.to_string(),
            floor: floor.to_string(),
        });
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_standard_banner() {
        let banner = "TShark (Wireshark) 3.6.2 (Git v3.6.2 packaged as 3.6.2-1)\n";
        let v = parse_version(banner).unwrap();
        assert_eq!(v, semver::Version::new(3, 6, 2));
    }

    #[test]
    fn parses_two_component_version() {
        let banner = "TShark (Wireshark) 4.0\n";
        let v = parse_version(banner).unwrap();
        assert_eq!(v, semver::Version::new(4, 0, 0));
    }

    #[test]
    fn floor_check_rejects_old_version() {
        let found = semver::Version::new(2, 6, 0);
        assert!(check_floor(&found, "3.0.0").is_err());
        let found = semver::Version::new(3, 6, 2);
        assert!(check_floor(&found, "3.0.0").is_ok());
    }
}
