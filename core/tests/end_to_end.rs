//! Exercises the full Runtime pipeline (dissector invocation through
//! matching) against a scripted stand-in `tshark`, so the pipeline can be
//! tested without a real capture or tshark installation.
//!
//! Grounded on `jonasbb-padding-aint-enough/taskmanager/src/utils.rs`'s
//! pattern of spawning a scripted external executable and pointing code at
//! it via `PermissionsExt::set_mode`, adapted here to a shell script that
//! stands in for `tshark`'s fields-export output.

use std::fs;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};

use pretty_assertions::assert_eq;

use capmaster_core::config::Config;
use capmaster_core::Runtime;

/// Writes a scripted `tshark` replacement to `dir` that answers `-v` with a
/// fixed version banner and otherwise prints `rows` verbatim, ignoring
/// every other argument (including the `-r <input>` file, which need not
/// even be a real capture).
fn write_fake_tshark(dir: &Path, rows: &str) -> PathBuf {
    let script_path = dir.join("tshark");
    let script = format!(
        "#!/bin/sh\nif [ \"$1\" = \"-v\" ]; then\n  echo 'TShark (Wireshark) 4.0.0'\n  exit 0\nfi\ncat <<'ROWS'\n{rows}\nROWS\n"
    );
    fs::write(&script_path, script).expect("write fake tshark script");
    let mut perms = fs::metadata(&script_path).unwrap().permissions();
    perms.set_mode(0o755);
    fs::set_permissions(&script_path, perms).unwrap();
    script_path
}

/// One connection: SYN, SYN-ACK, one client-to-server data segment.
/// Columns follow `capmaster_core::dissector::FIELDS`'s order.
const ONE_CONNECTION_ROWS: &str = "\
1,1690000000.000000,10.0.0.1,10.0.0.2,0x0001,64,7,40000,443,1000,0,0x002,,,,0,,,,,
2,1690000000.001000,10.0.0.2,10.0.0.1,0x0050,64,7,443,40000,5000,1001,0x012,,,,0,,,,,
3,1690000000.002000,10.0.0.1,10.0.0.2,0x0002,64,7,40000,443,1001,5001,0x018,,,,4,deadbeef,,,,";

#[test]
fn self_match_is_a_force_accepted_pair_above_threshold() {
    let dir = tempfile::tempdir().unwrap();
    let script = write_fake_tshark(dir.path(), ONE_CONNECTION_ROWS);

    let capture = dir.path().join("capture.pcap");
    fs::write(&capture, b"not a real pcap, the fake dissector ignores it").unwrap();

    let mut config = Config::default();
    config.dissector_path = Some(script);

    let runtime = Runtime::new(config, None).expect("fake dissector should resolve and pass the version floor");
    let summary = runtime.run(&[capture.clone()], &[capture], false);

    assert!(summary.side_a_failures.is_empty(), "{:?}", summary.side_a_failures);
    assert!(summary.side_b_failures.is_empty(), "{:?}", summary.side_b_failures);
    assert_eq!(summary.side_a_connections.len(), 1);
    assert_eq!(summary.side_b_connections.len(), 1);
    assert_eq!(summary.matches.len(), 1, "a file matched against itself must produce exactly one match");

    let m = &summary.matches[0];
    assert!(m.score.ipid_match);
    assert!(m.score.force_accept, "identical IP-ID sets must trigger the strong-overlap override");
    assert_eq!(summary.exit_code(), 0);
}

#[test]
fn empty_capture_yields_empty_result_with_success_status() {
    let dir = tempfile::tempdir().unwrap();
    let script = write_fake_tshark(dir.path(), "");

    let capture = dir.path().join("empty.pcap");
    fs::write(&capture, b"").unwrap();

    let mut config = Config::default();
    config.dissector_path = Some(script);

    let runtime = Runtime::new(config, None).unwrap();
    let summary = runtime.run(&[capture.clone()], &[capture], false);

    assert!(summary.side_a_failures.is_empty());
    assert!(summary.matches.is_empty());
    assert_eq!(summary.exit_code(), 0, "no matches from an empty capture is success, not failure");
}

#[test]
fn missing_dissector_aborts_before_any_run() {
    let mut config = Config::default();
    config.dissector_path = Some(PathBuf::from("/nonexistent/path/to/tshark"));

    let result = Runtime::new(config, None);
    assert!(result.is_err(), "a missing dissector must be surfaced immediately, not discovered mid-run");
}

#[test]
fn version_below_floor_is_rejected() {
    let dir = tempfile::tempdir().unwrap();
    let script_path = dir.path().join("tshark");
    fs::write(&script_path, "#!/bin/sh\necho 'TShark (Wireshark) 1.0.0'\n").unwrap();
    let mut perms = fs::metadata(&script_path).unwrap().permissions();
    perms.set_mode(0o755);
    fs::set_permissions(&script_path, perms).unwrap();

    let mut config = Config::default();
    config.dissector_path = Some(script_path);
    config.dissector_version_floor = "3.0.0".to_string();

    let result = Runtime::new(config, None);
    assert!(result.is_err(), "a dissector below the configured version floor must be rejected up front");
}

#[test]
fn one_file_failing_does_not_mask_the_others() {
    // File 2's dissection fails (exit 1); file 1 and file 3 must still
    // produce connections, and the run must report file 2 as failed rather
    // than silently returning fewer outputs (spec.md §7, §9: "the original
    // implementation was bitten multiple times by 'completed but silently
    // produced zero output'").
    let dir = tempfile::tempdir().unwrap();
    let script_path = dir.path().join("tshark");
    let script = format!(
        "#!/bin/sh\nif [ \"$1\" = \"-v\" ]; then\n  echo 'TShark (Wireshark) 4.0.0'\n  exit 0\nfi\ncase \"$2\" in\n  *bad*) echo 'malformed input' 1>&2; exit 1 ;;\n  *) cat <<'ROWS'\n{ONE_CONNECTION_ROWS}\nROWS\n  ;;\nesac\n"
    );
    fs::write(&script_path, script).unwrap();
    let mut perms = fs::metadata(&script_path).unwrap().permissions();
    perms.set_mode(0o755);
    fs::set_permissions(&script_path, perms).unwrap();

    let good1 = dir.path().join("good1.pcap");
    let bad = dir.path().join("bad.pcap");
    let good2 = dir.path().join("good2.pcap");
    for f in [&good1, &bad, &good2] {
        fs::write(f, b"placeholder").unwrap();
    }

    let mut config = Config::default();
    config.dissector_path = Some(script_path);

    let runtime = Runtime::new(config, None).unwrap();
    let summary = runtime.run(&[good1, bad, good2], &[], false);

    assert_eq!(summary.side_a_failures.len(), 1);
    assert_eq!(summary.side_a_connections.len(), 2, "the two good files must still produce connections");
    assert_eq!(summary.exit_code(), 1, "any file failure must make the overall run non-zero");
}
