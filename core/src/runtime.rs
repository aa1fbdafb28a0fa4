//! Top-level orchestration (spec.md §5): wires DissectorRunner,
//! ConnectionExtractor, ServerDetector, Matcher, and Differ together behind
//! the worker pool, and produces a run summary with per-file error
//! tracking (spec.md §7: "distinguish 0 outputs because no matches from 0
//! outputs because all files failed").
//!
//! Generalizes `thegwan-retina::Runtime`, the teacher's top-level driver
//! that owns the worker pool and merges per-worker results after joining.

use std::path::{Path, PathBuf};
use std::time::Duration;

use log::{error, info, warn};

use crate::config::Config;
use crate::dissector::{self, Dissector};
use crate::error::{CapMasterError, Result};
use crate::extractor::{parse_row, ConnectionExtractor};
use crate::matcher::Matcher;
use crate::model::connection::FileId;
use crate::model::score::Match;
use crate::model::{Connection, StreamDiffReport};
use crate::server_detect::service_list::ServiceList;
use crate::server_detect::ServerDetector;
use crate::streamdiff::Differ;
use crate::worker::{CancellationToken, WorkerPool};

/// Offset added to side-B file ids so the two sides' `FileId`s never
/// collide within one run.
const SIDE_B_FILE_ID_BASE: FileId = 1_000_000;

/// Per-file outcome of the extraction phase: either a connection set or the
/// error that aborted that file (spec.md §7: "fail owning task; other
/// workers continue").
struct FileOutcome {
    file_id: FileId,
    path: PathBuf,
    result: std::result::Result<Vec<Connection>, CapMasterError>,
}

/// One streamdiff outcome, keyed by the match's position so results can be
/// re-collated into a stable order after parallel processing (spec.md §5).
struct DiffOutcome {
    match_index: usize,
    result: std::result::Result<StreamDiffReport, CapMasterError>,
}

/// Final status of a run: which files failed, how many matches and diffs
/// were produced, and an overall exit code (spec.md §7).
pub struct RunSummary {
    pub side_a_connections: Vec<Connection>,
    pub side_b_connections: Vec<Connection>,
    pub side_a_failures: Vec<(PathBuf, String)>,
    pub side_b_failures: Vec<(PathBuf, String)>,
    pub matches: Vec<Match>,
    pub diffs: Vec<(Match, StreamDiffReport)>,
    pub cancelled: bool,
}

impl RunSummary {
    /// 0 on full success, 1 if any file failed or the run was cancelled,
    /// mirroring the distinguished exit codes spec.md §7 calls for.
    pub fn exit_code(&self) -> i32 {
        if self.cancelled || !self.side_a_failures.is_empty() || !self.side_b_failures.is_empty() {
            1
        } else {
            0
        }
    }
}

/// Drives one full comparison run: extract both capture sets in parallel,
/// run ServerDetector and Matcher serially, then diff every match in
/// parallel (spec.md §5).
pub struct Runtime {
    config: Config,
    dissector: Dissector,
    cancellation: CancellationToken,
    timeout: Option<Duration>,
}

impl Runtime {
    pub fn new(config: Config, timeout: Option<Duration>) -> Result<Self> {
        let dissector = Dissector::locate(
            config.dissector_path.as_ref(),
            &config.dissector_version_floor,
        )?;
        Ok(Runtime {
            config,
            dissector,
            cancellation: CancellationToken::new(),
            timeout,
        })
    }

    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancellation.clone()
    }

    /// Runs the full pipeline over two sets of capture files, one per
    /// observation point.
    pub fn run(&self, side_a_files: &[PathBuf], side_b_files: &[PathBuf], behavioural: bool) -> RunSummary {
        let services = match &self.config.service_list_path {
            Some(path) => ServiceList::load(path).unwrap_or_else(|e| {
                warn!("failed to load service list at {}: {e}, using defaults", path.display());
                ServiceList::default_table()
            }),
            None => ServiceList::default_table(),
        };

        let (mut side_a_conns, side_a_failures) = self.extract_side(side_a_files, 0);
        let (mut side_b_conns, side_b_failures) = self.extract_side(side_b_files, SIDE_B_FILE_ID_BASE);

        if self.cancellation.is_cancelled() {
            return RunSummary {
                side_a_connections: side_a_conns,
                side_b_connections: side_b_conns,
                side_a_failures,
                side_b_failures,
                matches: Vec::new(),
                diffs: Vec::new(),
                cancelled: true,
            };
        }

        let detector = ServerDetector::new(services);
        detector.detect(&mut side_a_conns);
        detector.detect(&mut side_b_conns);

        let matcher = Matcher::new(&self.config);
        let matches = matcher.run(&side_a_conns, &side_b_conns, behavioural);
        info!("matcher produced {} match(es)", matches.len());

        let diffs = self.diff_matches(&matches, &side_a_conns, &side_b_conns, side_a_files, side_b_files);

        RunSummary {
            side_a_connections: side_a_conns,
            side_b_connections: side_b_conns,
            side_a_failures,
            side_b_failures,
            matches,
            diffs,
            cancelled: self.cancellation.is_cancelled(),
        }
    }

    /// Extracts every file on one side in parallel (spec.md §5 "per-file
    /// parallelism"). `file_id_base` keeps the two sides' file ids from
    /// colliding; each worker owns its own DissectorRunner invocation and
    /// ConnectionExtractor instance, with no shared mutable state.
    fn extract_side(&self, files: &[PathBuf], file_id_base: FileId) -> (Vec<Connection>, Vec<(PathBuf, String)>) {
        let pool: WorkerPool<FileOutcome> = WorkerPool::new(self.config.workers());
        for (i, path) in files.iter().enumerate() {
            let file_id = file_id_base + i as FileId;
            let path = path.clone();
            let dissector = self.dissector.clone();
            let cancellation = self.cancellation.clone();
            let timeout = self.timeout;
            let payload_hash_bytes = self.config.payload_hash_bytes;
            pool.submit(move || {
                if cancellation.is_cancelled() {
                    return FileOutcome {
                        file_id,
                        path,
                        result: Err(CapMasterError::Cancelled),
                    };
                }
                let result = extract_one_file(&dissector, &path, file_id, payload_hash_bytes, timeout);
                FileOutcome { file_id, path, result }
            });
        }

        let outcomes = pool.join();
        let mut connections = Vec::new();
        let mut failures = Vec::new();
        for outcome in outcomes {
            match outcome.result {
                Ok(mut conns) => connections.append(&mut conns),
                Err(e) => {
                    error!("file {} (id {}) failed: {e}", outcome.path.display(), outcome.file_id);
                    failures.push((outcome.path, e.to_string()));
                }
            }
        }
        (connections, failures)
    }

    /// Diffs every match in parallel (spec.md §5 "per-match parallelism"),
    /// then re-collates by match index so the result is in the order the
    /// matcher produced, regardless of completion order.
    fn diff_matches(
        &self,
        matches: &[Match],
        side_a_conns: &[Connection],
        side_b_conns: &[Connection],
        side_a_files: &[PathBuf],
        side_b_files: &[PathBuf],
    ) -> Vec<(Match, StreamDiffReport)> {
        if matches.is_empty() {
            return Vec::new();
        }
        let pool: WorkerPool<DiffOutcome> = WorkerPool::new(self.config.workers());

        for (index, m) in matches.iter().enumerate() {
            let Some(conn_a) = side_a_conns.iter().find(|c| c.id == m.conn_a) else {
                continue;
            };
            let Some(conn_b) = side_b_conns.iter().find(|c| c.id == m.conn_b) else {
                continue;
            };
            let Some(file_a) = side_a_files.get(conn_a.id.file_id as usize).cloned() else {
                continue;
            };
            let Some(file_b) = side_b_files
                .get((conn_b.id.file_id - SIDE_B_FILE_ID_BASE) as usize)
                .cloned()
            else {
                continue;
            };

            let five_tuple = conn_a.five_tuple;
            let dissector = self.dissector.clone();
            let cancellation = self.cancellation.clone();
            let timeout = self.timeout;
            pool.submit(move || {
                if cancellation.is_cancelled() {
                    return DiffOutcome {
                        match_index: index,
                        result: Err(CapMasterError::Cancelled),
                    };
                }
                let differ = Differ::new(&dissector, timeout);
                let result = differ.diff(&file_a, &file_b, &five_tuple);
                DiffOutcome { match_index: index, result }
            });
        }

        let mut outcomes = pool.join();
        outcomes.sort_by_key(|o| o.match_index);

        let mut out = Vec::with_capacity(outcomes.len());
        for outcome in outcomes {
            match outcome.result {
                Ok(report) => out.push((matches[outcome.match_index].clone(), report)),
                Err(e) => {
                    error!("streamdiff for match {} failed: {e}", outcome.match_index);
                }
            }
        }
        out
    }
}

fn extract_one_file(
    dissector: &Dissector,
    path: &Path,
    file_id: FileId,
    payload_hash_bytes: usize,
    timeout: Option<Duration>,
) -> std::result::Result<Vec<Connection>, CapMasterError> {
    let mut args = dissector::field_args();
    args.insert(0, "tcp".to_string());
    args.insert(0, "-Y".to_string());

    let rows = dissector.run_fields(&args, path, timeout)?;
    let mut extractor = ConnectionExtractor::new(file_id, payload_hash_bytes);
    for row in rows {
        let row = row?;
        if let Some(packet) = parse_row(&row) {
            extractor.observe(packet);
        }
    }
    Ok(extractor.finish())
}
