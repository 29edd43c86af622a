//! Structural fingerprints and drift scoring.
//!
//! A [`Fingerprint`] is the layout signature of a source page: which tables
//! exist (by CSS classes), their header rows, the element ids parsers rely on
//! and rough element counts. Comparing a fresh capture against a saved
//! baseline catches silent layout changes before broken parses reach the cache.
//!
//! | Component | Weight | Score |
//! |-----------|--------|-------|
//! | structure hash | 0.25 | 1 if equal, else 0 |
//! | table classes | 0.20 | share of baseline class sets still present |
//! | key ids | 0.15 | share of baseline ids still present |
//! | table headers | 0.30 | best Jaccard match between any two header rows |
//! | element counts | 0.10 | `1 - 0.2` per key deviating more than 50%, floored at 0 |

use std::collections::{BTreeMap, BTreeSet, HashSet};
use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use thiserror::Error;
use time::OffsetDateTime;
use tracing::debug;

// Component weights in percent; they sum to 100.
const WEIGHT_HASH: f64 = 25.0;
const WEIGHT_CLASSES: f64 = 20.0;
const WEIGHT_IDS: f64 = 15.0;
const WEIGHT_HEADERS: f64 = 30.0;
const WEIGHT_COUNTS: f64 = 10.0;
const WEIGHT_TOTAL: f64 = 100.0;

const HIGH_THRESHOLD: f64 = 0.85;
const MEDIUM_THRESHOLD: f64 = 0.70;
const LOW_THRESHOLD: f64 = 0.50;

const COUNT_DEVIATION_LIMIT: f64 = 0.5;
const COUNT_PENALTY: f64 = 0.2;

/// Hex characters kept from the SHA-256 digest.
const HASH_PREFIX_LEN: usize = 16;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Fingerprint {
    pub source: String,
    pub url: String,
    #[serde(with = "time::serde::rfc3339")]
    pub collected_at: OffsetDateTime,
    pub structure_hash: String,
    #[serde(default)]
    pub table_classes: Vec<Vec<String>>,
    #[serde(default)]
    pub key_ids: Vec<String>,
    #[serde(default)]
    pub table_headers: Vec<Vec<String>>,
    #[serde(default)]
    pub element_counts: BTreeMap<String, u64>,
}

/// Raw structure extracted from a page by a capture collaborator.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PageStructure {
    pub tables: Vec<TableStructure>,
    pub key_ids: Vec<String>,
    pub element_counts: BTreeMap<String, u64>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TableStructure {
    pub classes: Vec<String>,
    pub headers: Vec<String>,
}

impl Fingerprint {
    /// Build a fingerprint from a captured page structure, hashing it on the way.
    pub fn capture(
        source: impl Into<String>,
        url: impl Into<String>,
        collected_at: OffsetDateTime,
        page: PageStructure,
    ) -> Self {
        let (table_classes, table_headers) = page
            .tables
            .into_iter()
            .map(|table| (table.classes, table.headers))
            .unzip();

        let mut fingerprint = Self {
            source: source.into(),
            url: url.into(),
            collected_at,
            structure_hash: String::new(),
            table_classes,
            key_ids: page.key_ids,
            table_headers,
            element_counts: page.element_counts,
        };
        fingerprint.structure_hash = fingerprint.compute_structure_hash();
        fingerprint
    }

    /// SHA-256 over the sorted structural elements, as a hex prefix.
    ///
    /// Element counts contribute their tag names only, so row counts that
    /// grow with new data do not change the hash.
    pub fn compute_structure_hash(&self) -> String {
        let mut elements: BTreeSet<String> = BTreeSet::new();
        elements.extend(self.table_classes.iter().map(|classes| format!("class:{}", class_key(classes))));
        elements.extend(self.table_headers.iter().map(|row| format!("header:{}", normalized_row(row).join("|"))));
        elements.extend(self.key_ids.iter().map(|id| format!("id:{id}")));
        elements.extend(self.element_counts.keys().map(|tag| format!("tag:{tag}")));

        let mut hasher = Sha256::new();
        for element in &elements {
            hasher.update(element.as_bytes());
            hasher.update(b"\n");
        }
        let mut digest = hex::encode(hasher.finalize());
        digest.truncate(HASH_PREFIX_LEN);
        digest
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DriftLevel {
    High,
    Medium,
    Low,
    Critical,
    /// No baseline to compare against.
    Unknown,
}

impl DriftLevel {
    pub fn classify(similarity: f64) -> Self {
        if similarity >= HIGH_THRESHOLD {
            Self::High
        } else if similarity >= MEDIUM_THRESHOLD {
            Self::Medium
        } else if similarity >= LOW_THRESHOLD {
            Self::Low
        } else {
            Self::Critical
        }
    }

    pub const fn passed(self) -> bool {
        matches!(self, Self::High | Self::Medium | Self::Unknown)
    }

    pub const fn as_str(self) -> &'static str {
        match self {
            Self::High => "high",
            Self::Medium => "medium",
            Self::Low => "low",
            Self::Critical => "critical",
            Self::Unknown => "unknown",
        }
    }
}

impl std::fmt::Display for DriftLevel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ComponentScores {
    pub structure_hash: f64,
    pub table_classes: f64,
    pub key_ids: f64,
    pub table_headers: f64,
    pub element_counts: f64,
}

impl ComponentScores {
    /// Weighted sum in percent, divided once so perfect and threshold scores are exact.
    pub fn similarity(&self) -> f64 {
        let percent = self.structure_hash * WEIGHT_HASH
            + self.table_classes * WEIGHT_CLASSES
            + self.key_ids * WEIGHT_IDS
            + self.table_headers * WEIGHT_HEADERS
            + self.element_counts * WEIGHT_COUNTS;
        percent / WEIGHT_TOTAL
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DriftReport {
    pub source: String,
    pub level: DriftLevel,
    /// Absent when there was no baseline.
    pub similarity: Option<f64>,
    pub components: Option<ComponentScores>,
    pub passed: bool,
}

impl DriftReport {
    pub fn unknown(source: impl Into<String>) -> Self {
        Self {
            source: source.into(),
            level: DriftLevel::Unknown,
            similarity: None,
            components: None,
            passed: true,
        }
    }
}

pub fn component_scores(current: &Fingerprint, baseline: &Fingerprint) -> ComponentScores {
    let baseline_classes: HashSet<String> = baseline.table_classes.iter().map(|c| class_key(c)).collect();
    let current_classes: HashSet<String> = current.table_classes.iter().map(|c| class_key(c)).collect();
    let baseline_ids: HashSet<&str> = baseline.key_ids.iter().map(String::as_str).collect();
    let current_ids: HashSet<&str> = current.key_ids.iter().map(String::as_str).collect();

    ComponentScores {
        structure_hash: if current.structure_hash == baseline.structure_hash {
            1.0
        } else {
            0.0
        },
        table_classes: retained_ratio(&baseline_classes, &current_classes),
        key_ids: retained_ratio(&baseline_ids, &current_ids),
        table_headers: header_similarity(&baseline.table_headers, &current.table_headers),
        element_counts: count_stability(&baseline.element_counts, &current.element_counts),
    }
}

/// Weighted similarity in `[0, 1]`.
pub fn compare(current: &Fingerprint, baseline: &Fingerprint) -> f64 {
    component_scores(current, baseline).similarity()
}

pub fn drift_report(current: &Fingerprint, baseline: &Fingerprint) -> DriftReport {
    let components = component_scores(current, baseline);
    let similarity = components.similarity();
    let level = DriftLevel::classify(similarity);
    DriftReport {
        source: current.source.clone(),
        level,
        similarity: Some(similarity),
        components: Some(components),
        passed: level.passed(),
    }
}

/// Compare against the stored baseline; a missing baseline is never drift.
pub fn validate_against_baseline(
    current: &Fingerprint,
    baselines: &BaselineStore,
) -> Result<DriftReport, BaselineError> {
    match baselines.load(&current.source)? {
        Some(baseline) => Ok(drift_report(current, &baseline)),
        None => {
            debug!(source = %current.source, "no baseline, skipping drift check");
            Ok(DriftReport::unknown(&current.source))
        }
    }
}

fn retained_ratio<T: Eq + std::hash::Hash>(baseline: &HashSet<T>, current: &HashSet<T>) -> f64 {
    if baseline.is_empty() {
        return 1.0;
    }
    baseline.intersection(current).count() as f64 / baseline.len() as f64
}

fn header_similarity(baseline: &[Vec<String>], current: &[Vec<String>]) -> f64 {
    if baseline.is_empty() {
        return 1.0;
    }
    let current_rows: Vec<HashSet<String>> = current.iter().map(|row| normalized_row(row).into_iter().collect()).collect();

    baseline
        .iter()
        .map(|row| normalized_row(row).into_iter().collect::<HashSet<_>>())
        .flat_map(|base| {
            current_rows
                .iter()
                .map(|cur| jaccard(&base, cur))
                .collect::<Vec<_>>()
        })
        .fold(0.0, f64::max)
}

fn jaccard(left: &HashSet<String>, right: &HashSet<String>) -> f64 {
    let union = left.union(right).count();
    if union == 0 {
        return 1.0;
    }
    left.intersection(right).count() as f64 / union as f64
}

fn count_stability(baseline: &BTreeMap<String, u64>, current: &BTreeMap<String, u64>) -> f64 {
    let deviating = baseline
        .iter()
        .filter(|(tag, expected)| {
            let expected = **expected;
            let actual = current.get(*tag).copied().unwrap_or(0);
            if expected == 0 {
                return actual > 0;
            }
            (actual as f64 - expected as f64).abs() / expected as f64 > COUNT_DEVIATION_LIMIT
        })
        .count();
    (1.0 - COUNT_PENALTY * deviating as f64).max(0.0)
}

fn class_key(classes: &[String]) -> String {
    let mut sorted: Vec<&str> = classes.iter().map(|c| c.trim()).filter(|c| !c.is_empty()).collect();
    sorted.sort_unstable();
    sorted.join(" ")
}

fn normalized_row(row: &[String]) -> Vec<String> {
    row.iter()
        .map(|cell| cell.split_whitespace().collect::<Vec<_>>().join(" ").to_lowercase())
        .filter(|cell| !cell.is_empty())
        .collect()
}

#[derive(Debug, Error)]
pub enum BaselineError {
    #[error("failed to access baseline file {path}")]
    Io {
        path: PathBuf,
        #[source]
        error: io::Error,
    },
    #[error("malformed baseline file {path}")]
    Malformed {
        path: PathBuf,
        #[source]
        error: serde_json::Error,
    },
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum BaselineFile {
    Shared { sources: BTreeMap<String, Fingerprint> },
    Single(Fingerprint),
}

/// Baseline fingerprints on disk, one JSON file per source plus an optional shared file.
#[derive(Debug, Clone)]
pub struct BaselineStore {
    dir: PathBuf,
}

impl BaselineStore {
    pub const SHARED_FILE: &'static str = "baseline.json";

    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn path_for(&self, source: &str) -> PathBuf {
        self.dir.join(format!("{source}_baseline.json"))
    }

    /// Tries `<source>_baseline.json`, then the shared `baseline.json`.
    pub fn load(&self, source: &str) -> Result<Option<Fingerprint>, BaselineError> {
        for path in [self.path_for(source), self.dir.join(Self::SHARED_FILE)] {
            let Some(file) = read_baseline(&path)? else {
                continue;
            };
            let found = match file {
                BaselineFile::Shared { mut sources } => sources.remove(source),
                BaselineFile::Single(fingerprint) if fingerprint.source == source => Some(fingerprint),
                BaselineFile::Single(_) => None,
            };
            if found.is_some() {
                debug!(source, path = %path.display(), "loaded baseline");
                return Ok(found);
            }
        }
        Ok(None)
    }

    /// Write `fingerprint` as the source's own baseline file.
    pub fn save(&self, fingerprint: &Fingerprint) -> Result<PathBuf, BaselineError> {
        let path = self.path_for(&fingerprint.source);
        fs::create_dir_all(&self.dir).map_err(|error| BaselineError::Io {
            path: self.dir.clone(),
            error,
        })?;
        let json = serde_json::to_vec_pretty(fingerprint).map_err(|error| BaselineError::Malformed {
            path: path.clone(),
            error,
        })?;
        fs::write(&path, json).map_err(|error| BaselineError::Io {
            path: path.clone(),
            error,
        })?;
        Ok(path)
    }
}

fn read_baseline(path: &Path) -> Result<Option<BaselineFile>, BaselineError> {
    let bytes = match fs::read(path) {
        Ok(bytes) => bytes,
        Err(error) if error.kind() == io::ErrorKind::NotFound => return Ok(None),
        Err(error) => {
            return Err(BaselineError::Io {
                path: path.to_path_buf(),
                error,
            })
        }
    };
    serde_json::from_slice(&bytes)
        .map(Some)
        .map_err(|error| BaselineError::Malformed {
            path: path.to_path_buf(),
            error,
        })
}
