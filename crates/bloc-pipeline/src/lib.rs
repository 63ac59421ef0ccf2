//! Bundle ingestion and dependency-ordered load orchestration.
//!
//! One JSON document per sector per kind (boulder problems, circuits) is
//! read from disk, normalized into entity-shaped records and handed to the
//! store batch by batch. A failed batch rolls back alone; earlier batches
//! stay committed, so a re-run only has to redo the unmet ones.

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use bloc_core::{
    circuit_problem_records, circuit_records, problem_records, sector_record, CircuitBundle,
    CircuitProblemRecord, CircuitRecord, ProblemBundle, ProblemRecord, SectorRecord,
};
use bloc_store::Store;
use serde::de::DeserializeOwned;
use serde::Serialize;
use tracing::{info, warn};

pub const CRATE_NAME: &str = "bloc-pipeline";

#[derive(Debug, Clone)]
pub struct PipelineConfig {
    pub database_url: String,
    pub boulders_dir: PathBuf,
    pub circuits_dir: PathBuf,
}

impl PipelineConfig {
    pub fn from_env() -> Self {
        let data_root = std::env::var("BLOC_DATA_DIR")
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from("./data/raw"));
        Self {
            database_url: std::env::var("DATABASE_URL")
                .unwrap_or_else(|_| "sqlite://bloc.db".to_string()),
            boulders_dir: data_root.join("boulders"),
            circuits_dir: data_root.join("circuits"),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct LoadSummary {
    pub sectors: usize,
    pub problems: usize,
    pub circuits: usize,
    pub repaired_problems: usize,
    pub circuit_problems: usize,
    pub skipped_bundles: usize,
}

/// Normalized batches for one pipeline invocation.
#[derive(Debug, Default)]
struct NormalizedBatches {
    sectors: Vec<SectorRecord>,
    problems: Vec<ProblemRecord>,
    circuits: Vec<CircuitRecord>,
    circuit_problem_pairs: Vec<CircuitProblemRecord>,
    skipped_bundles: usize,
}

pub async fn run_once(store: &Store, config: &PipelineConfig) -> Result<LoadSummary> {
    let batches = normalize_from_disk(config)?;

    let slug_to_id = store
        .load_sectors(&batches.sectors)
        .await
        .context("loading sector batch")?;
    let problems = store
        .load_problems(&batches.problems, &slug_to_id)
        .await
        .context("loading problem batch")?;
    let circuits = store
        .load_circuits(&batches.circuits, &slug_to_id)
        .await
        .context("loading circuit batch")?;
    let repaired = store
        .repair_missing_problems(&batches.circuit_problem_pairs, &slug_to_id)
        .await
        .context("repairing dangling circuit references")?;
    let circuit_problems = store
        .load_circuit_problems(&batches.circuit_problem_pairs)
        .await
        .context("loading circuit-problem batch")?;

    let summary = LoadSummary {
        sectors: batches.sectors.len(),
        problems,
        circuits,
        repaired_problems: repaired,
        circuit_problems,
        skipped_bundles: batches.skipped_bundles,
    };
    info!(?summary, "pipeline run complete");
    Ok(summary)
}

fn normalize_from_disk(config: &PipelineConfig) -> Result<NormalizedBatches> {
    let (problem_bundles, skipped_boulders) =
        read_bundles::<ProblemBundle>(&config.boulders_dir, |b| b.sector.as_str())?;
    let (circuit_bundles, skipped_circuits) =
        read_bundles::<CircuitBundle>(&config.circuits_dir, |b| b.sector.as_str())?;

    let mut batches = NormalizedBatches {
        skipped_bundles: skipped_boulders + skipped_circuits,
        ..Default::default()
    };
    for (slug, bundle) in &problem_bundles {
        batches.sectors.push(sector_record(bundle, slug));
        batches.problems.extend(problem_records(bundle, slug));
    }
    for (slug, bundle) in &circuit_bundles {
        batches.circuits.extend(circuit_records(bundle, slug));
        batches
            .circuit_problem_pairs
            .extend(circuit_problem_records(bundle, slug));
    }
    Ok(batches)
}

/// Read every `*.json` bundle in a directory; the file stem is the sector
/// slug. Unreadable or unparsable files and bundles without a sector name
/// are skipped with a warning, never fatal to the run.
fn read_bundles<T: DeserializeOwned>(
    dir: &Path,
    sector_name: impl Fn(&T) -> &str,
) -> Result<(Vec<(String, T)>, usize)> {
    let mut bundles = Vec::new();
    let mut skipped = 0usize;
    if !dir.exists() {
        warn!(dir = %dir.display(), "bundle directory missing; nothing to ingest");
        return Ok((bundles, skipped));
    }

    let mut paths: Vec<PathBuf> = fs::read_dir(dir)
        .with_context(|| format!("reading {}", dir.display()))?
        .filter_map(|entry| entry.ok())
        .map(|entry| entry.path())
        .filter(|path| path.extension().map(|ext| ext == "json").unwrap_or(false))
        .collect();
    paths.sort();

    for path in paths {
        let slug = path
            .file_stem()
            .map(|stem| stem.to_string_lossy().to_string())
            .unwrap_or_default();
        let text = match fs::read_to_string(&path) {
            Ok(text) => text,
            Err(err) => {
                warn!(file = %path.display(), %err, "unreadable bundle skipped");
                skipped += 1;
                continue;
            }
        };
        let bundle: T = match serde_json::from_str(&text) {
            Ok(bundle) => bundle,
            Err(err) => {
                warn!(file = %path.display(), %err, "unparsable bundle skipped");
                skipped += 1;
                continue;
            }
        };
        if sector_name(&bundle).is_empty() {
            warn!(file = %path.display(), "sector name missing; bundle skipped");
            skipped += 1;
            continue;
        }
        bundles.push((slug, bundle));
    }
    Ok((bundles, skipped))
}

#[cfg(test)]
mod tests {
    use super::*;
    use bloc_store::ProblemFilter;
    use std::fs;

    fn write_fixtures(root: &Path) -> PipelineConfig {
        let boulders = root.join("boulders");
        let circuits = root.join("circuits");
        fs::create_dir_all(&boulders).expect("boulders dir");
        fs::create_dir_all(&circuits).expect("circuits dir");

        fs::write(
            boulders.join("apremont.json"),
            r#"{"sector":"Apremont","problems":[
                {"name":"La Joker","url":"https://bleau.info/apremont/100.html","grade":"7a",
                 "styles":["mur"],"rating":4.8},
                {"name":"L'Angle","url":"https://bleau.info/apremont/101.html","grade":"5+",
                 "styles":["dalle","arête"]}
            ]}"#,
        )
        .expect("apremont boulders");
        // Sector name missing: skipped with a warning, not fatal.
        fs::write(boulders.join("anon.json"), r#"{"sector":"","problems":[]}"#)
            .expect("anon boulders");
        // Unparsable bundle: skipped as an upstream failure.
        fs::write(boulders.join("broken.json"), "{not json").expect("broken boulders");

        fs::write(
            circuits.join("apremont.json"),
            r#"{"sector":"Apremont","circuits":[
                {"name":"Circuit AD 3","url":"https://bleau.info/apremont/c2.html","problems":[
                    {"id":"1","url":"https://bleau.info/apremont/100.html"},
                    {"id":"2","url":"https://bleau.info/apremont/999.html"}
                ]}
            ]}"#,
        )
        .expect("apremont circuits");

        PipelineConfig {
            database_url: "sqlite::memory:".to_string(),
            boulders_dir: boulders,
            circuits_dir: circuits,
        }
    }

    #[tokio::test]
    async fn run_loads_and_repairs_in_dependency_order() {
        let dir = tempfile::tempdir().expect("tempdir");
        let config = write_fixtures(dir.path());
        let store = Store::in_memory().await.expect("store");
        store.migrate().await.expect("migrate");

        let summary = run_once(&store, &config).await.expect("run");
        assert_eq!(summary.sectors, 1);
        assert_eq!(summary.problems, 2);
        assert_eq!(summary.circuits, 1);
        assert_eq!(summary.repaired_problems, 1);
        assert_eq!(summary.circuit_problems, 2);
        assert_eq!(summary.skipped_bundles, 2);

        // The dangling circuit reference now exists as a placeholder.
        let in_circuit = store
            .circuit_problems("apremont-c2")
            .await
            .expect("circuit problems");
        assert_eq!(in_circuit.len(), 2);
        assert!(in_circuit
            .iter()
            .any(|p| p.id == "apremont-999" && p.name == "Unknown Problem"));
    }

    #[tokio::test]
    async fn rerun_converges_instead_of_failing() {
        let dir = tempfile::tempdir().expect("tempdir");
        let config = write_fixtures(dir.path());
        let store = Store::in_memory().await.expect("store");
        store.migrate().await.expect("migrate");

        run_once(&store, &config).await.expect("first run");
        let second = run_once(&store, &config).await.expect("second run");
        assert_eq!(second.repaired_problems, 0);

        let all = store
            .problems(&ProblemFilter::default())
            .await
            .expect("problems");
        assert_eq!(all.len(), 2);
    }

    #[tokio::test]
    async fn missing_directories_yield_an_empty_run() {
        let dir = tempfile::tempdir().expect("tempdir");
        let config = PipelineConfig {
            database_url: "sqlite::memory:".to_string(),
            boulders_dir: dir.path().join("nope-boulders"),
            circuits_dir: dir.path().join("nope-circuits"),
        };
        let store = Store::in_memory().await.expect("store");
        store.migrate().await.expect("migrate");
        let summary = run_once(&store, &config).await.expect("run");
        assert_eq!(summary.sectors, 0);
        assert_eq!(summary.circuit_problems, 0);
    }
}
