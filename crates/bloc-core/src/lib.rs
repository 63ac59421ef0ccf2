//! Core domain model: raw bundle shapes, fixed vocabularies, deterministic
//! identity synthesis and the pure normalization pass.

use serde::{Deserialize, Serialize};

pub const CRATE_NAME: &str = "bloc-core";

/// Ordered circuit difficulty-band vocabulary. ABO circuits are excluded
/// upstream because they mix bands.
pub const CIRCUIT_LEVELS: [&str; 17] = [
    "EN", "F", "PD-", "PD", "PD+", "AD-", "AD", "AD+", "D-", "D", "D+", "TD-", "TD", "TD+", "ED-",
    "ED", "ED+",
];

/// Ordinal for a textual boulder grade. Unrecognized grades get the
/// sentinel 0 and therefore sort before every real grade.
pub fn grade_order(grade: &str) -> i64 {
    match grade {
        "1" => 1,
        "1+" => 2,
        "2-" => 3,
        "2" => 4,
        "2+" => 5,
        "3-" => 6,
        "3" => 7,
        "3+" => 8,
        "4-" => 9,
        "4" => 10,
        "4+" => 11,
        "5-" => 12,
        "5" => 13,
        "5+" => 14,
        "6a" => 15,
        "6a+" => 16,
        "6b" => 17,
        "6b+" => 18,
        "6c" => 19,
        "6c+" => 20,
        "7a" => 21,
        "7a+" => 22,
        "7b" => 23,
        "7b+" => 24,
        "7c" => 25,
        "7c+" => 26,
        "8a" => 27,
        "8a+" => 28,
        "8b" => 29,
        "8b+" => 30,
        "8c" => 31,
        "8c+" => 32,
        "9a" => 33,
        _ => 0,
    }
}

/// Ordinal for a circuit difficulty band, parallel to [`CIRCUIT_LEVELS`].
/// Unrecognized tokens get the sentinel 0.
pub fn circuit_order(level: &str) -> i64 {
    CIRCUIT_LEVELS
        .iter()
        .position(|l| *l == level)
        .map(|idx| idx as i64 + 1)
        .unwrap_or(0)
}

/// A level plus its "-"/"+" neighbors, filtered to the fixed vocabulary.
/// Used by the loose circuit matching mode: "AD" expands to AD-, AD, AD+.
pub fn loose_level_variants(level: &str) -> Vec<String> {
    [format!("{level}-"), level.to_string(), format!("{level}+")]
        .into_iter()
        .filter(|v| CIRCUIT_LEVELS.contains(&v.as_str()))
        .collect()
}

/// Last path segment of a source URL with its file extension stripped.
pub fn url_stem(url: &str) -> &str {
    let last = url.rsplit('/').next().unwrap_or(url);
    last.split('.').next().unwrap_or(last)
}

/// Deterministic composite id: `"{sector_slug}-{url_stem}"`. Identical
/// (sector, source URL) inputs yield the same id on every run, which is
/// what lets circuit-problem rows reference problems without a lookup pass.
pub fn composite_id(sector_slug: &str, url: &str) -> String {
    format!("{}-{}", sector_slug, url_stem(url))
}

/// Sector slug recovered from a composite id: the prefix up to the first
/// separator. Slugs that themselves contain a separator do not round-trip;
/// the loader treats a failed slug lookup as a NULL sector link.
pub fn sector_slug_of(id: &str) -> &str {
    id.split('-').next().unwrap_or(id)
}

/// Canonical source URL reconstructed from a composite id, used for
/// placeholder problems synthesized by the integrity repairer.
pub fn canonical_problem_url(id: &str) -> String {
    let mut parts = id.splitn(2, '-');
    let slug = parts.next().unwrap_or("");
    let stem = parts.next().unwrap_or("");
    format!("https://bleau.info/{slug}/{stem}.html")
}

// ---------------------------------------------------------------------------
// Raw bundle shapes (one JSON document per sector per kind)
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Deserialize)]
pub struct ProblemBundle {
    #[serde(default)]
    pub sector: String,
    #[serde(default)]
    pub problems: Vec<RawProblem>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RawProblem {
    #[serde(default = "default_problem_name")]
    pub name: String,
    #[serde(default)]
    pub url: String,
    #[serde(default)]
    pub grade: String,
    #[serde(default)]
    pub alt_grade: String,
    #[serde(default)]
    pub first_ascensionist: String,
    #[serde(default)]
    pub styles: Vec<String>,
    #[serde(default)]
    pub rating: Option<f64>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct CircuitBundle {
    #[serde(default)]
    pub sector: String,
    #[serde(default)]
    pub circuits: Vec<RawCircuit>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RawCircuit {
    #[serde(default = "default_circuit_name")]
    pub name: String,
    #[serde(default)]
    pub url: String,
    #[serde(default)]
    pub problems: Vec<RawCircuitProblem>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RawCircuitProblem {
    #[serde(default)]
    pub id: String,
    #[serde(default)]
    pub url: String,
}

fn default_problem_name() -> String {
    "Unnamed Problem".to_string()
}

fn default_circuit_name() -> String {
    "Unnamed Circuit".to_string()
}

// ---------------------------------------------------------------------------
// Entity-shaped records (normalizer output, bulk-loader input)
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SectorRecord {
    pub name: String,
    pub slug: String,
    pub grade_range: String,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ProblemRecord {
    pub id: String,
    pub name: String,
    pub url: String,
    pub grade: String,
    pub grade_order: i64,
    pub alt_grade: String,
    pub first_ascent: String,
    pub styles: String,
    pub rating: Option<f64>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CircuitRecord {
    pub id: String,
    pub name: String,
    pub url: String,
    pub circuit_level: String,
    pub circuit_order: i64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CircuitProblemRecord {
    pub circuit_id: String,
    pub problem_id: String,
    pub number: String,
}

/// Grade summary for a sector: `"{last} - {first}"` over the non-empty
/// grades in source list order, or empty when nothing is graded.
pub fn sector_record(bundle: &ProblemBundle, sector_slug: &str) -> SectorRecord {
    let grades: Vec<&str> = bundle
        .problems
        .iter()
        .map(|p| p.grade.as_str())
        .filter(|g| !g.is_empty())
        .collect();
    let grade_range = match (grades.last(), grades.first()) {
        (Some(last), Some(first)) => format!("{last} - {first}"),
        _ => String::new(),
    };
    SectorRecord {
        name: bundle.sector.clone(),
        slug: sector_slug.to_string(),
        grade_range,
    }
}

pub fn problem_records(bundle: &ProblemBundle, sector_slug: &str) -> Vec<ProblemRecord> {
    bundle
        .problems
        .iter()
        .map(|p| ProblemRecord {
            id: composite_id(sector_slug, &p.url),
            name: p.name.clone(),
            url: p.url.clone(),
            grade: p.grade.clone(),
            grade_order: grade_order(&p.grade),
            alt_grade: p.alt_grade.clone(),
            first_ascent: p.first_ascensionist.clone(),
            styles: p.styles.join(","),
            rating: p.rating,
        })
        .collect()
}

/// First whitespace token of the circuit name that appears in the band
/// vocabulary; scan is order-stable over the name, not over the vocabulary.
pub fn circuit_level_of(name: &str) -> Option<&str> {
    name.split_whitespace()
        .find(|word| CIRCUIT_LEVELS.contains(word))
}

pub fn circuit_records(bundle: &CircuitBundle, sector_slug: &str) -> Vec<CircuitRecord> {
    bundle
        .circuits
        .iter()
        .map(|c| {
            let level = circuit_level_of(&c.name).unwrap_or("");
            CircuitRecord {
                id: composite_id(sector_slug, &c.url),
                name: c.name.clone(),
                url: c.url.clone(),
                circuit_level: level.to_string(),
                circuit_order: circuit_order(level),
            }
        })
        .collect()
}

pub fn circuit_problem_records(bundle: &CircuitBundle, sector_slug: &str) -> Vec<CircuitProblemRecord> {
    bundle
        .circuits
        .iter()
        .flat_map(|c| {
            let circuit_id = composite_id(sector_slug, &c.url);
            c.problems.iter().map(move |p| CircuitProblemRecord {
                circuit_id: circuit_id.clone(),
                problem_id: composite_id(sector_slug, &p.url),
                number: p.id.clone(),
            })
        })
        .collect()
}

// ---------------------------------------------------------------------------
// Style-tag translation (French scraper vocabulary -> English)
// ---------------------------------------------------------------------------

const TAG_TRANSLATIONS: [(&str, &str); 31] = [
    // Wall angles / types
    ("mur", "wall"),
    ("dalle", "slab"),
    ("dévers", "overhang"),
    ("surplomb", "steep overhang"),
    ("toit", "roof"),
    ("arête", "arete"),
    ("dièdre", "corner"),
    ("proue", "prow"),
    ("pilier", "pillar"),
    ("bombé", "rounded"),
    ("cheminée", "chimney"),
    // Traverses
    ("traversée g-d", "traverse L-R"),
    ("traversée d-g", "traverse R-L"),
    ("traversée", "traverse"),
    // Hold types
    ("aplats", "slopers"),
    ("réglettes", "crimps"),
    ("réta", "mantle"),
    ("trous", "pockets"),
    ("bidoigts", "two-finger pockets"),
    ("monodoigts", "monos"),
    ("inversées", "underclings"),
    ("pincettes", "pinches"),
    // Techniques & features
    ("jeté", "dyno"),
    ("fissure", "crack"),
    ("boucle", "loop"),
    ("saut", "jump"),
    // Height & exposure
    ("haut", "highball"),
    ("expo", "exposed"),
    // Start / special
    ("départ assis", "sit start"),
    ("descente", "descent"),
    ("avec corde", "with rope"),
];

/// English rendering of a French style tag; the original string is returned
/// when no translation exists.
pub fn translate_tag(tag: &str) -> String {
    let normalized = tag.trim().to_lowercase();
    TAG_TRANSLATIONS
        .iter()
        .find(|(fr, _)| *fr == normalized)
        .map(|(_, en)| (*en).to_string())
        .unwrap_or_else(|| tag.to_string())
}
