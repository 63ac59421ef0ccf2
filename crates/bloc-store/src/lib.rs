//! SQLite persistence: schema bootstrap, dependency-ordered bulk loading,
//! referential-integrity repair and the user-profile merge engine.

use std::collections::{HashMap, HashSet};
use std::str::FromStr;

use bloc_core::{
    canonical_problem_url, grade_order, loose_level_variants, sector_slug_of, CircuitProblemRecord,
    CircuitRecord, ProblemRecord, SectorRecord,
};
use chrono::Utc;
use rand::Rng;
use serde::{Deserialize, Serialize};
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};
use sqlx::{QueryBuilder, SqlitePool};
use thiserror::Error;
use tracing::{info, warn};

pub const CRATE_NAME: &str = "bloc-store";

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("not found: {0}")]
    NotFound(String),
    #[error("conflict: {0}")]
    Conflict(String),
    #[error("validation: {0}")]
    Validation(String),
    #[error(transparent)]
    Database(#[from] sqlx::Error),
}

pub type Result<T> = std::result::Result<T, StoreError>;

const SCHEMA: &[&str] = &[
    "CREATE TABLE IF NOT EXISTS sectors (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        name TEXT NOT NULL,
        slug TEXT NOT NULL UNIQUE,
        grade_range TEXT NOT NULL DEFAULT ''
    )",
    "CREATE TABLE IF NOT EXISTS problems (
        id TEXT PRIMARY KEY,
        name TEXT NOT NULL,
        url TEXT NOT NULL UNIQUE,
        grade TEXT NOT NULL DEFAULT '',
        grade_order INTEGER NOT NULL DEFAULT 0,
        alt_grade TEXT NOT NULL DEFAULT '',
        first_ascent TEXT NOT NULL DEFAULT '',
        styles TEXT NOT NULL DEFAULT '',
        rating REAL,
        sector_id INTEGER REFERENCES sectors(id)
    )",
    "CREATE INDEX IF NOT EXISTS idx_problems_grade_order ON problems(grade_order)",
    "CREATE TABLE IF NOT EXISTS circuits (
        id TEXT PRIMARY KEY,
        name TEXT NOT NULL,
        url TEXT NOT NULL UNIQUE,
        circuit_level TEXT NOT NULL DEFAULT '',
        circuit_order INTEGER NOT NULL DEFAULT 0,
        sector_id INTEGER REFERENCES sectors(id)
    )",
    "CREATE TABLE IF NOT EXISTS circuit_problems (
        circuit_id TEXT NOT NULL REFERENCES circuits(id),
        problem_id TEXT NOT NULL REFERENCES problems(id),
        number TEXT NOT NULL DEFAULT '',
        PRIMARY KEY (circuit_id, problem_id)
    )",
    "CREATE TABLE IF NOT EXISTS user_profiles (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        browser_id TEXT UNIQUE,
        email TEXT UNIQUE,
        update_code TEXT NOT NULL UNIQUE,
        gender TEXT,
        height INTEGER,
        arm_span INTEGER,
        created_at TEXT NOT NULL
    )",
    "CREATE TABLE IF NOT EXISTS climbed_problems (
        user_id INTEGER NOT NULL REFERENCES user_profiles(id),
        problem_id TEXT NOT NULL,
        climbed_on TEXT,
        PRIMARY KEY (user_id, problem_id)
    )",
    "CREATE TABLE IF NOT EXISTS preferred_tags (
        user_id INTEGER NOT NULL REFERENCES user_profiles(id),
        tag TEXT NOT NULL,
        PRIMARY KEY (user_id, tag)
    )",
];

// ---------------------------------------------------------------------------
// Persisted rows
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, sqlx::FromRow)]
pub struct Sector {
    pub id: i64,
    pub name: String,
    pub slug: String,
    pub grade_range: String,
}

#[derive(Debug, Clone, Serialize, sqlx::FromRow)]
pub struct Problem {
    pub id: String,
    pub name: String,
    pub url: String,
    pub grade: String,
    pub grade_order: i64,
    pub alt_grade: String,
    pub first_ascent: String,
    pub styles: String,
    pub rating: Option<f64>,
    pub sector_id: Option<i64>,
}

#[derive(Debug, Clone, Serialize, sqlx::FromRow)]
pub struct Circuit {
    pub id: String,
    pub name: String,
    pub url: String,
    pub circuit_level: String,
    pub circuit_order: i64,
    pub sector_id: Option<i64>,
}

#[derive(Debug, Clone, sqlx::FromRow)]
pub struct UserProfile {
    pub id: i64,
    pub browser_id: Option<String>,
    pub email: Option<String>,
    pub update_code: String,
    pub gender: Option<String>,
    pub height: Option<i64>,
    pub arm_span: Option<i64>,
    pub created_at: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct TagCount {
    pub tag: String,
    pub count: i64,
}

// ---------------------------------------------------------------------------
// Query filters
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TagsMode {
    #[default]
    Any,
    All,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Strictness {
    Strict,
    #[default]
    Loose,
}

#[derive(Debug, Clone, Default)]
pub struct ProblemFilter {
    pub min_grade: Option<String>,
    pub max_grade: Option<String>,
    pub sector_slug: Option<String>,
    pub tags: Vec<String>,
    pub tags_mode: TagsMode,
}

#[derive(Debug, Clone, Default)]
pub struct CircuitFilter {
    pub sector_slug: Option<String>,
    pub levels: Vec<String>,
    pub matching: Strictness,
}

// ---------------------------------------------------------------------------
// Profile merge contracts
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct QuestionnaireSubmission {
    pub browser_id: Option<String>,
    pub email: Option<String>,
    pub update_code: Option<String>,
    pub gender: Option<String>,
    pub height: Option<i64>,
    pub arm_span: Option<i64>,
    pub climbed_problem_ids: Vec<String>,
    pub preferred_tags: Vec<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum MatchedVia {
    BrowserId,
    Email,
    UpdateCode,
}

#[derive(Debug, Clone, Serialize)]
pub struct MergeOutcome {
    pub created: bool,
    pub update_code: String,
    pub new_problems: usize,
    pub new_tags: usize,
    pub total_problems: usize,
    pub matched_via: Option<MatchedVia>,
}

// Human-shareable code alphabet: no 0/O/1/I/L lookalikes.
const CODE_ALPHABET: &[u8] = b"ABCDEFGHJKMNPQRSTUVWXYZ23456789";
const CODE_LEN: usize = 8;

fn generate_update_code() -> String {
    let mut rng = rand::thread_rng();
    (0..CODE_LEN)
        .map(|_| CODE_ALPHABET[rng.gen_range(0..CODE_ALPHABET.len())] as char)
        .collect()
}

fn non_empty(value: &Option<String>) -> Option<&str> {
    value.as_deref().map(str::trim).filter(|v| !v.is_empty())
}

fn is_unique_violation(err: &sqlx::Error) -> bool {
    matches!(err, sqlx::Error::Database(db) if db.is_unique_violation())
}

/// Submitted set with order preserved and duplicates dropped.
fn dedup_preserving_order<I: IntoIterator<Item = String>>(items: I) -> Vec<String> {
    let mut seen = HashSet::new();
    items
        .into_iter()
        .filter(|item| !item.is_empty() && seen.insert(item.clone()))
        .collect()
}

fn normalized_tags(tags: &[String]) -> Vec<String> {
    dedup_preserving_order(tags.iter().map(|t| t.trim().to_lowercase()))
}

// ---------------------------------------------------------------------------
// Store
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct Store {
    pool: SqlitePool,
}

impl Store {
    pub async fn connect(database_url: &str) -> Result<Self> {
        let options = SqliteConnectOptions::from_str(database_url)
            .map_err(StoreError::Database)?
            .create_if_missing(true);
        let pool = SqlitePoolOptions::new().connect_with(options).await?;
        Ok(Self { pool })
    }

    /// In-memory database on a single pooled connection (every connection
    /// would otherwise see its own empty database).
    pub async fn in_memory() -> Result<Self> {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect("sqlite::memory:")
            .await?;
        Ok(Self { pool })
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    pub async fn migrate(&self) -> Result<()> {
        for ddl in SCHEMA {
            sqlx::query(ddl).execute(&self.pool).await?;
        }
        Ok(())
    }

    // -- Bulk loading (one transaction per batch; a failed batch rolls back
    // -- alone and propagates, leaving prior batches committed).

    /// Upsert sectors keyed by slug and return the slug -> surrogate-id map
    /// the dependent batches resolve their foreign keys through.
    pub async fn load_sectors(&self, records: &[SectorRecord]) -> Result<HashMap<String, i64>> {
        let mut tx = self.pool.begin().await?;
        let mut slug_to_id = HashMap::with_capacity(records.len());
        for record in records {
            let id: i64 = sqlx::query_scalar(
                "INSERT INTO sectors (name, slug, grade_range) VALUES (?, ?, ?)
                 ON CONFLICT(slug) DO UPDATE SET
                     name = excluded.name,
                     grade_range = excluded.grade_range
                 RETURNING id",
            )
            .bind(&record.name)
            .bind(&record.slug)
            .bind(&record.grade_range)
            .fetch_one(&mut *tx)
            .await?;
            slug_to_id.insert(record.slug.clone(), id);
        }
        tx.commit().await?;
        info!(count = records.len(), "loaded sectors");
        Ok(slug_to_id)
    }

    /// Upsert problems by deterministic id. The sector link is re-derived
    /// from the id's slug prefix; a miss leaves it NULL.
    pub async fn load_problems(
        &self,
        records: &[ProblemRecord],
        slug_to_id: &HashMap<String, i64>,
    ) -> Result<usize> {
        let mut tx = self.pool.begin().await?;
        for record in records {
            let sector_id = slug_to_id.get(sector_slug_of(&record.id)).copied();
            sqlx::query(
                "INSERT INTO problems
                     (id, name, url, grade, grade_order, alt_grade, first_ascent, styles, rating, sector_id)
                 VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
                 ON CONFLICT(id) DO UPDATE SET
                     name = excluded.name,
                     url = excluded.url,
                     grade = excluded.grade,
                     grade_order = excluded.grade_order,
                     alt_grade = excluded.alt_grade,
                     first_ascent = excluded.first_ascent,
                     styles = excluded.styles,
                     rating = excluded.rating,
                     sector_id = excluded.sector_id",
            )
            .bind(&record.id)
            .bind(&record.name)
            .bind(&record.url)
            .bind(&record.grade)
            .bind(record.grade_order)
            .bind(&record.alt_grade)
            .bind(&record.first_ascent)
            .bind(&record.styles)
            .bind(record.rating)
            .bind(sector_id)
            .execute(&mut *tx)
            .await?;
        }
        tx.commit().await?;
        info!(count = records.len(), "loaded problems");
        Ok(records.len())
    }

    pub async fn load_circuits(
        &self,
        records: &[CircuitRecord],
        slug_to_id: &HashMap<String, i64>,
    ) -> Result<usize> {
        let mut tx = self.pool.begin().await?;
        for record in records {
            let sector_id = slug_to_id.get(sector_slug_of(&record.id)).copied();
            sqlx::query(
                "INSERT INTO circuits (id, name, url, circuit_level, circuit_order, sector_id)
                 VALUES (?, ?, ?, ?, ?, ?)
                 ON CONFLICT(id) DO UPDATE SET
                     name = excluded.name,
                     url = excluded.url,
                     circuit_level = excluded.circuit_level,
                     circuit_order = excluded.circuit_order,
                     sector_id = excluded.sector_id",
            )
            .bind(&record.id)
            .bind(&record.name)
            .bind(&record.url)
            .bind(&record.circuit_level)
            .bind(record.circuit_order)
            .bind(sector_id)
            .execute(&mut *tx)
            .await?;
        }
        tx.commit().await?;
        info!(count = records.len(), "loaded circuits");
        Ok(records.len())
    }

    /// Synthesize a placeholder problem for every circuit-referenced id the
    /// problem listing never captured, so circuit_problems loading cannot
    /// dangle. Placeholders keep the sentinel name "Unknown Problem" and an
    /// URL reconstructed from the id, which makes them auditable later.
    pub async fn repair_missing_problems(
        &self,
        references: &[CircuitProblemRecord],
        slug_to_id: &HashMap<String, i64>,
    ) -> Result<usize> {
        let known: HashSet<String> = sqlx::query_scalar("SELECT id FROM problems")
            .fetch_all(&self.pool)
            .await?
            .into_iter()
            .collect();

        let mut seen = HashSet::new();
        let missing: Vec<&str> = references
            .iter()
            .map(|r| r.problem_id.as_str())
            .filter(|id| !known.contains(*id) && seen.insert(*id))
            .collect();
        if missing.is_empty() {
            return Ok(0);
        }

        let mut tx = self.pool.begin().await?;
        for id in &missing {
            let sector_id = slug_to_id.get(sector_slug_of(id)).copied();
            sqlx::query(
                "INSERT INTO problems
                     (id, name, url, grade, grade_order, alt_grade, first_ascent, styles, rating, sector_id)
                 VALUES (?, 'Unknown Problem', ?, '', 0, '', '', '', NULL, ?)
                 ON CONFLICT(id) DO NOTHING",
            )
            .bind(id)
            .bind(canonical_problem_url(id))
            .bind(sector_id)
            .execute(&mut *tx)
            .await?;
        }
        tx.commit().await?;
        warn!(
            count = missing.len(),
            "synthesized placeholder problems for dangling circuit references"
        );
        Ok(missing.len())
    }

    /// Load circuit-problem pairs, collapsing duplicate (circuit_id,
    /// problem_id) keys to a single row with the last-seen position label.
    pub async fn load_circuit_problems(&self, records: &[CircuitProblemRecord]) -> Result<usize> {
        let mut deduped: HashMap<(&str, &str), &CircuitProblemRecord> = HashMap::new();
        for record in records {
            deduped.insert((record.circuit_id.as_str(), record.problem_id.as_str()), record);
        }

        let mut tx = self.pool.begin().await?;
        for record in deduped.values() {
            sqlx::query(
                "INSERT INTO circuit_problems (circuit_id, problem_id, number)
                 VALUES (?, ?, ?)
                 ON CONFLICT(circuit_id, problem_id) DO UPDATE SET number = excluded.number",
            )
            .bind(&record.circuit_id)
            .bind(&record.problem_id)
            .bind(&record.number)
            .execute(&mut *tx)
            .await?;
        }
        tx.commit().await?;
        info!(count = deduped.len(), "loaded circuit problems");
        Ok(deduped.len())
    }

    // -- Read queries

    pub async fn list_sectors(&self) -> Result<Vec<Sector>> {
        Ok(
            sqlx::query_as("SELECT id, name, slug, grade_range FROM sectors ORDER BY slug")
                .fetch_all(&self.pool)
                .await?,
        )
    }

    pub async fn sector_problems(&self, slug: &str) -> Result<Vec<Problem>> {
        let sector_id: Option<i64> = sqlx::query_scalar("SELECT id FROM sectors WHERE slug = ?")
            .bind(slug)
            .fetch_optional(&self.pool)
            .await?;
        let Some(sector_id) = sector_id else {
            return Err(StoreError::NotFound(format!("sector {slug}")));
        };
        Ok(sqlx::query_as(
            "SELECT id, name, url, grade, grade_order, alt_grade, first_ascent, styles, rating, sector_id
             FROM problems WHERE sector_id = ? ORDER BY grade_order, id",
        )
        .bind(sector_id)
        .fetch_all(&self.pool)
        .await?)
    }

    /// Problems inside an inclusive [min_grade, max_grade] window, optionally
    /// narrowed by sector and style-tag substrings (any/all). Ordered by
    /// rating (NULLs last) then grade, capped at 100 rows.
    pub async fn problems(&self, filter: &ProblemFilter) -> Result<Vec<Problem>> {
        let min_order = grade_order(filter.min_grade.as_deref().unwrap_or("1"));
        let max_order = grade_order(filter.max_grade.as_deref().unwrap_or("9a"));

        let mut qb = QueryBuilder::new(
            "SELECT id, name, url, grade, grade_order, alt_grade, first_ascent, styles, rating, sector_id
             FROM problems WHERE grade_order >= ",
        );
        qb.push_bind(min_order);
        qb.push(" AND grade_order <= ");
        qb.push_bind(max_order);

        if let Some(slug) = filter.sector_slug.as_deref() {
            qb.push(" AND sector_id IN (SELECT id FROM sectors WHERE slug = ");
            qb.push_bind(slug);
            qb.push(")");
        }

        if !filter.tags.is_empty() {
            let joiner = match filter.tags_mode {
                TagsMode::Any => " OR ",
                TagsMode::All => " AND ",
            };
            qb.push(" AND (");
            for (i, tag) in filter.tags.iter().enumerate() {
                if i > 0 {
                    qb.push(joiner);
                }
                qb.push("styles LIKE ");
                qb.push_bind(format!("%{tag}%"));
            }
            qb.push(")");
        }

        qb.push(" ORDER BY rating IS NULL, rating DESC, grade_order LIMIT 100");
        Ok(qb.build_query_as().fetch_all(&self.pool).await?)
    }

    pub async fn circuits(&self, filter: &CircuitFilter) -> Result<Vec<Circuit>> {
        let expanded: Vec<String> = match filter.matching {
            Strictness::Strict => filter.levels.clone(),
            Strictness::Loose => filter
                .levels
                .iter()
                .flat_map(|level| loose_level_variants(level))
                .collect(),
        };
        if !filter.levels.is_empty() && expanded.is_empty() {
            return Ok(Vec::new());
        }

        let mut qb = QueryBuilder::new(
            "SELECT id, name, url, circuit_level, circuit_order, sector_id FROM circuits WHERE 1 = 1",
        );
        if let Some(slug) = filter.sector_slug.as_deref() {
            qb.push(" AND sector_id IN (SELECT id FROM sectors WHERE slug = ");
            qb.push_bind(slug);
            qb.push(")");
        }
        if !filter.levels.is_empty() {
            qb.push(" AND circuit_level IN (");
            let mut separated = qb.separated(", ");
            for level in &expanded {
                separated.push_bind(level);
            }
            qb.push(")");
        }
        qb.push(" ORDER BY circuit_order, id");
        Ok(qb.build_query_as().fetch_all(&self.pool).await?)
    }

    pub async fn circuit_problems(&self, circuit_id: &str) -> Result<Vec<Problem>> {
        let exists: Option<String> = sqlx::query_scalar("SELECT id FROM circuits WHERE id = ?")
            .bind(circuit_id)
            .fetch_optional(&self.pool)
            .await?;
        if exists.is_none() {
            return Err(StoreError::NotFound(format!("circuit {circuit_id}")));
        }
        Ok(sqlx::query_as(
            "SELECT p.id, p.name, p.url, p.grade, p.grade_order, p.alt_grade, p.first_ascent,
                    p.styles, p.rating, p.sector_id
             FROM circuit_problems cp
             JOIN problems p ON p.id = cp.problem_id
             WHERE cp.circuit_id = ?
             ORDER BY cp.number",
        )
        .bind(circuit_id)
        .fetch_all(&self.pool)
        .await?)
    }

    /// Distinct style tags across all problems with occurrence counts,
    /// most common first.
    pub async fn available_tags(&self) -> Result<Vec<TagCount>> {
        let styles: Vec<String> = sqlx::query_scalar("SELECT styles FROM problems WHERE styles != ''")
            .fetch_all(&self.pool)
            .await?;
        let mut counts: HashMap<String, i64> = HashMap::new();
        for joined in &styles {
            for tag in joined.split(',').map(str::trim).filter(|t| !t.is_empty()) {
                *counts.entry(tag.to_string()).or_default() += 1;
            }
        }
        let mut tags: Vec<TagCount> = counts
            .into_iter()
            .map(|(tag, count)| TagCount { tag, count })
            .collect();
        tags.sort_by(|a, b| b.count.cmp(&a.count).then_with(|| a.tag.cmp(&b.tag)));
        Ok(tags)
    }

    pub async fn search_problems(&self, query: &str, limit: i64) -> Result<Vec<Problem>> {
        if query.trim().is_empty() {
            return Err(StoreError::Validation("empty search query".into()));
        }
        Ok(sqlx::query_as(
            "SELECT id, name, url, grade, grade_order, alt_grade, first_ascent, styles, rating, sector_id
             FROM problems WHERE name LIKE ? ORDER BY name LIMIT ?",
        )
        .bind(format!("%{}%", query.trim()))
        .bind(limit.max(1))
        .fetch_all(&self.pool)
        .await?)
    }

    // -- Profile merge engine

    /// Two-state merge per submission: NEW (create a profile with a fresh
    /// update code) or MATCHED (extend the existing profile, insert-or-skip
    /// on the pair sets). Resolution order is browser_id, then email, then
    /// update_code; the first hit wins.
    pub async fn submit_questionnaire(
        &self,
        submission: &QuestionnaireSubmission,
    ) -> Result<MergeOutcome> {
        // Two concurrent first-time submissions can race on the browser_id/
        // email uniqueness constraints; the loser re-resolves and lands on
        // the MATCHED path.
        for _ in 0..2 {
            match self.resolve_identity(submission).await? {
                Some((profile, via)) => return self.merge_into_profile(profile, via, submission).await,
                None => match self.create_profile(submission).await {
                    Ok(outcome) => return Ok(outcome),
                    Err(StoreError::Database(err)) if is_unique_violation(&err) => continue,
                    Err(err) => return Err(err),
                },
            }
        }
        Err(StoreError::Conflict(
            "profile identity could not be resolved after retry".into(),
        ))
    }

    async fn resolve_identity(
        &self,
        submission: &QuestionnaireSubmission,
    ) -> Result<Option<(UserProfile, MatchedVia)>> {
        const COLS: &str =
            "id, browser_id, email, update_code, gender, height, arm_span, created_at";
        if let Some(browser_id) = non_empty(&submission.browser_id) {
            let found = sqlx::query_as::<_, UserProfile>(&format!(
                "SELECT {COLS} FROM user_profiles WHERE browser_id = ?"
            ))
            .bind(browser_id)
            .fetch_optional(&self.pool)
            .await?;
            if let Some(profile) = found {
                return Ok(Some((profile, MatchedVia::BrowserId)));
            }
        }
        if let Some(email) = non_empty(&submission.email) {
            let found = sqlx::query_as::<_, UserProfile>(&format!(
                "SELECT {COLS} FROM user_profiles WHERE email = ?"
            ))
            .bind(email)
            .fetch_optional(&self.pool)
            .await?;
            if let Some(profile) = found {
                return Ok(Some((profile, MatchedVia::Email)));
            }
        }
        if let Some(code) = non_empty(&submission.update_code) {
            let found = sqlx::query_as::<_, UserProfile>(&format!(
                "SELECT {COLS} FROM user_profiles WHERE update_code = ?"
            ))
            .bind(code)
            .fetch_optional(&self.pool)
            .await?;
            if let Some(profile) = found {
                return Ok(Some((profile, MatchedVia::UpdateCode)));
            }
        }
        Ok(None)
    }

    async fn create_profile(&self, submission: &QuestionnaireSubmission) -> Result<MergeOutcome> {
        let update_code = generate_update_code();
        let climbed = dedup_preserving_order(submission.climbed_problem_ids.iter().cloned());
        let tags = normalized_tags(&submission.preferred_tags);

        let mut tx = self.pool.begin().await?;
        let user_id: i64 = sqlx::query_scalar(
            "INSERT INTO user_profiles
                 (browser_id, email, update_code, gender, height, arm_span, created_at)
             VALUES (?, ?, ?, ?, ?, ?, ?)
             RETURNING id",
        )
        .bind(non_empty(&submission.browser_id))
        .bind(non_empty(&submission.email))
        .bind(&update_code)
        .bind(non_empty(&submission.gender))
        .bind(submission.height)
        .bind(submission.arm_span)
        .bind(Utc::now().to_rfc3339())
        .fetch_one(&mut *tx)
        .await?;

        for problem_id in &climbed {
            sqlx::query("INSERT INTO climbed_problems (user_id, problem_id) VALUES (?, ?)")
                .bind(user_id)
                .bind(problem_id)
                .execute(&mut *tx)
                .await?;
        }
        for tag in &tags {
            sqlx::query("INSERT INTO preferred_tags (user_id, tag) VALUES (?, ?)")
                .bind(user_id)
                .bind(tag)
                .execute(&mut *tx)
                .await?;
        }
        tx.commit().await?;

        info!(user_id, "created user profile");
        Ok(MergeOutcome {
            created: true,
            update_code,
            new_problems: climbed.len(),
            new_tags: tags.len(),
            total_problems: climbed.len(),
            matched_via: None,
        })
    }

    async fn merge_into_profile(
        &self,
        profile: UserProfile,
        via: MatchedVia,
        submission: &QuestionnaireSubmission,
    ) -> Result<MergeOutcome> {
        let mut tx = self.pool.begin().await?;

        // Demographics are overwritten only by non-empty submitted values;
        // the browser id is backfilled only when the profile has none.
        let gender = non_empty(&submission.gender)
            .map(str::to_string)
            .or(profile.gender);
        let height = submission.height.or(profile.height);
        let arm_span = submission.arm_span.or(profile.arm_span);
        let browser_id = profile.browser_id.or_else(|| {
            non_empty(&submission.browser_id).map(str::to_string)
        });
        sqlx::query(
            "UPDATE user_profiles SET gender = ?, height = ?, arm_span = ?, browser_id = ?
             WHERE id = ?",
        )
        .bind(&gender)
        .bind(height)
        .bind(arm_span)
        .bind(&browser_id)
        .bind(profile.id)
        .execute(&mut *tx)
        .await?;

        let existing_problems: HashSet<String> =
            sqlx::query_scalar("SELECT problem_id FROM climbed_problems WHERE user_id = ?")
                .bind(profile.id)
                .fetch_all(&mut *tx)
                .await?
                .into_iter()
                .collect();
        let submitted = dedup_preserving_order(submission.climbed_problem_ids.iter().cloned());
        let mut new_problems = 0usize;
        for problem_id in &submitted {
            if existing_problems.contains(problem_id) {
                continue;
            }
            sqlx::query("INSERT INTO climbed_problems (user_id, problem_id) VALUES (?, ?)")
                .bind(profile.id)
                .bind(problem_id)
                .execute(&mut *tx)
                .await?;
            new_problems += 1;
        }

        let existing_tags: HashSet<String> =
            sqlx::query_scalar("SELECT tag FROM preferred_tags WHERE user_id = ?")
                .bind(profile.id)
                .fetch_all(&mut *tx)
                .await?
                .into_iter()
                .collect();
        let mut new_tags = 0usize;
        for tag in normalized_tags(&submission.preferred_tags) {
            if existing_tags.contains(&tag) {
                continue;
            }
            sqlx::query("INSERT INTO preferred_tags (user_id, tag) VALUES (?, ?)")
                .bind(profile.id)
                .bind(&tag)
                .execute(&mut *tx)
                .await?;
            new_tags += 1;
        }

        tx.commit().await?;

        info!(user_id = profile.id, new_problems, new_tags, "merged questionnaire submission");
        Ok(MergeOutcome {
            created: false,
            update_code: profile.update_code,
            new_problems,
            new_tags,
            total_problems: existing_problems.len() + new_problems,
            matched_via: Some(via),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bloc_core::{CircuitProblemRecord, CircuitRecord, ProblemRecord, SectorRecord};

    fn sector(slug: &str, name: &str) -> SectorRecord {
        SectorRecord {
            name: name.to_string(),
            slug: slug.to_string(),
            grade_range: "3 - 7a".to_string(),
        }
    }

    fn problem(id: &str, grade: &str, styles: &str, rating: Option<f64>) -> ProblemRecord {
        ProblemRecord {
            id: id.to_string(),
            name: format!("Problem {id}"),
            url: format!("https://bleau.info/{}.html", id),
            grade: grade.to_string(),
            grade_order: grade_order(grade),
            alt_grade: String::new(),
            first_ascent: String::new(),
            styles: styles.to_string(),
            rating,
        }
    }

    fn circuit(id: &str, name: &str, level: &str) -> CircuitRecord {
        CircuitRecord {
            id: id.to_string(),
            name: name.to_string(),
            url: format!("https://bleau.info/{}.html", id),
            circuit_level: level.to_string(),
            circuit_order: bloc_core::circuit_order(level),
        }
    }

    fn pair(circuit_id: &str, problem_id: &str, number: &str) -> CircuitProblemRecord {
        CircuitProblemRecord {
            circuit_id: circuit_id.to_string(),
            problem_id: problem_id.to_string(),
            number: number.to_string(),
        }
    }

    async fn store() -> Store {
        let store = Store::in_memory().await.expect("in-memory store");
        store.migrate().await.expect("migrate");
        store
    }

    async fn seeded_store() -> Store {
        let store = store().await;
        let slug_to_id = store
            .load_sectors(&[sector("apremont", "Apremont"), sector("cuvier", "Cuvier")])
            .await
            .expect("sectors");
        store
            .load_problems(
                &[
                    problem("apremont-1", "6a", "mur,réglettes", Some(4.0)),
                    problem("apremont-2", "7a", "dalle", None),
                    problem("cuvier-1", "3", "dalle,mur", Some(5.0)),
                ],
                &slug_to_id,
            )
            .await
            .expect("problems");
        store
            .load_circuits(
                &[
                    circuit("apremont-c1", "Circuit AD 3", "AD"),
                    circuit("cuvier-c1", "Circuit TD- 1", "TD-"),
                ],
                &slug_to_id,
            )
            .await
            .expect("circuits");
        store
    }

    #[tokio::test]
    async fn sectors_upsert_converges_on_reload() {
        let store = store().await;
        let first = store
            .load_sectors(&[sector("apremont", "Apremont")])
            .await
            .expect("first load");
        let second = store
            .load_sectors(&[sector("apremont", "Apremont")])
            .await
            .expect("second load");
        assert_eq!(first["apremont"], second["apremont"]);
        assert_eq!(store.list_sectors().await.expect("list").len(), 1);
    }

    #[tokio::test]
    async fn problems_link_sectors_through_slug_prefix() {
        let store = seeded_store().await;
        let problems = store.sector_problems("apremont").await.expect("problems");
        assert_eq!(problems.len(), 2);
        assert!(problems.iter().all(|p| p.sector_id.is_some()));
    }

    #[tokio::test]
    async fn unknown_sector_lookup_is_not_found() {
        let store = seeded_store().await;
        let err = store.sector_problems("nowhere").await.unwrap_err();
        assert!(matches!(err, StoreError::NotFound(_)));
    }

    #[tokio::test]
    async fn repairer_fills_every_dangling_reference_exactly_once() {
        let store = seeded_store().await;
        let slug_to_id = store
            .load_sectors(&[sector("apremont", "Apremont"), sector("cuvier", "Cuvier")])
            .await
            .expect("sectors");
        let pairs = vec![
            pair("apremont-c1", "apremont-1", "1"),
            pair("apremont-c1", "apremont-99", "2"),
            pair("apremont-c1", "apremont-99", "2b"),
            pair("cuvier-c1", "cuvier-77", "1"),
        ];
        let repaired = store
            .repair_missing_problems(&pairs, &slug_to_id)
            .await
            .expect("repair");
        assert_eq!(repaired, 2);
        let loaded = store.load_circuit_problems(&pairs).await.expect("pairs");
        assert_eq!(loaded, 3);

        let stub = store
            .search_problems("Unknown Problem", 20)
            .await
            .expect("stubs");
        assert_eq!(stub.len(), 2);
        assert!(stub.iter().any(|p| p.id == "apremont-99"
            && p.url == "https://bleau.info/apremont/99.html"
            && p.sector_id.is_some()));

        // Running the repairer again finds nothing left to fill.
        let again = store
            .repair_missing_problems(&pairs, &slug_to_id)
            .await
            .expect("repair again");
        assert_eq!(again, 0);
    }

    #[tokio::test]
    async fn duplicate_pairs_collapse_with_last_seen_number() {
        let store = seeded_store().await;
        let slug_to_id = HashMap::new();
        store
            .repair_missing_problems(&[pair("apremont-c1", "apremont-50", "x")], &slug_to_id)
            .await
            .expect("repair");
        store
            .load_circuit_problems(&[
                pair("apremont-c1", "apremont-50", "first"),
                pair("apremont-c1", "apremont-50", "last"),
            ])
            .await
            .expect("load pairs");
        let rows: Vec<(String, String)> = sqlx::query_as(
            "SELECT problem_id, number FROM circuit_problems WHERE circuit_id = 'apremont-c1'",
        )
        .fetch_all(store.pool())
        .await
        .expect("rows");
        assert_eq!(rows, vec![("apremont-50".to_string(), "last".to_string())]);
    }

    #[tokio::test]
    async fn full_reload_is_idempotent() {
        let store = seeded_store().await;
        let slug_to_id = store
            .load_sectors(&[sector("apremont", "Apremont"), sector("cuvier", "Cuvier")])
            .await
            .expect("sectors");
        store
            .load_problems(
                &[problem("apremont-1", "6a", "mur,réglettes", Some(4.0))],
                &slug_to_id,
            )
            .await
            .expect("problem reload");
        let all = store.problems(&ProblemFilter::default()).await.expect("all");
        assert_eq!(all.len(), 3);
    }

    #[tokio::test]
    async fn grade_window_is_inclusive() {
        let store = seeded_store().await;
        let filter = ProblemFilter {
            min_grade: Some("6a".to_string()),
            max_grade: Some("7a".to_string()),
            ..Default::default()
        };
        let found = store.problems(&filter).await.expect("problems");
        let ids: Vec<&str> = found.iter().map(|p| p.id.as_str()).collect();
        assert_eq!(ids, vec!["apremont-1", "apremont-2"]);
    }

    #[tokio::test]
    async fn tag_filters_respect_any_and_all_modes() {
        let store = seeded_store().await;
        let any = store
            .problems(&ProblemFilter {
                tags: vec!["dalle".to_string(), "réglettes".to_string()],
                tags_mode: TagsMode::Any,
                ..Default::default()
            })
            .await
            .expect("any");
        assert_eq!(any.len(), 3);

        let all = store
            .problems(&ProblemFilter {
                tags: vec!["dalle".to_string(), "mur".to_string()],
                tags_mode: TagsMode::All,
                ..Default::default()
            })
            .await
            .expect("all");
        assert_eq!(all.len(), 1);
        assert_eq!(all[0].id, "cuvier-1");
    }

    #[tokio::test]
    async fn rating_orders_first_with_nulls_last() {
        let store = seeded_store().await;
        let found = store.problems(&ProblemFilter::default()).await.expect("all");
        let ids: Vec<&str> = found.iter().map(|p| p.id.as_str()).collect();
        assert_eq!(ids, vec!["cuvier-1", "apremont-1", "apremont-2"]);
    }

    #[tokio::test]
    async fn circuit_matching_strict_and_loose() {
        let store = seeded_store().await;
        let strict = store
            .circuits(&CircuitFilter {
                levels: vec!["AD".to_string()],
                matching: Strictness::Strict,
                ..Default::default()
            })
            .await
            .expect("strict");
        assert_eq!(strict.len(), 1);
        assert_eq!(strict[0].id, "apremont-c1");

        let loose = store
            .circuits(&CircuitFilter {
                levels: vec!["TD".to_string()],
                matching: Strictness::Loose,
                ..Default::default()
            })
            .await
            .expect("loose");
        assert_eq!(loose.len(), 1);
        assert_eq!(loose[0].circuit_level, "TD-");
    }

    #[tokio::test]
    async fn unknown_circuit_is_not_found() {
        let store = seeded_store().await;
        let err = store.circuit_problems("nowhere-c9").await.unwrap_err();
        assert!(matches!(err, StoreError::NotFound(_)));
    }

    #[tokio::test]
    async fn available_tags_count_most_common_first() {
        let store = seeded_store().await;
        let tags = store.available_tags().await.expect("tags");
        assert_eq!(tags[0].tag, "dalle");
        assert_eq!(tags[0].count, 2);
        assert_eq!(tags[1].tag, "mur");
        assert_eq!(tags[1].count, 2);
    }

    fn submission(
        browser_id: Option<&str>,
        email: Option<&str>,
        climbed: &[&str],
        tags: &[&str],
    ) -> QuestionnaireSubmission {
        QuestionnaireSubmission {
            browser_id: browser_id.map(str::to_string),
            email: email.map(str::to_string),
            climbed_problem_ids: climbed.iter().map(|s| s.to_string()).collect(),
            preferred_tags: tags.iter().map(|s| s.to_string()).collect(),
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn first_submission_creates_profile_with_update_code() {
        let store = store().await;
        let outcome = store
            .submit_questionnaire(&submission(Some("b-1"), None, &["a", "b"], &["mur"]))
            .await
            .expect("submit");
        assert!(outcome.created);
        assert_eq!(outcome.update_code.len(), 8);
        assert_eq!(outcome.total_problems, 2);
        assert_eq!(outcome.matched_via, None);
    }

    #[tokio::test]
    async fn resubmission_is_idempotent() {
        let store = store().await;
        let first = store
            .submit_questionnaire(&submission(Some("b-1"), None, &["a", "b"], &["mur"]))
            .await
            .expect("first");
        let second = store
            .submit_questionnaire(&submission(Some("b-1"), None, &["a", "b"], &["mur"]))
            .await
            .expect("second");
        assert!(!second.created);
        assert_eq!(second.new_problems, 0);
        assert_eq!(second.new_tags, 0);
        assert_eq!(second.total_problems, first.total_problems);
        assert_eq!(second.update_code, first.update_code);
        assert_eq!(second.matched_via, Some(MatchedVia::BrowserId));
    }

    #[tokio::test]
    async fn overlapping_sets_merge_without_duplicates() {
        let store = store().await;
        store
            .submit_questionnaire(&submission(Some("b-1"), None, &["a", "b"], &[]))
            .await
            .expect("first");
        let merged = store
            .submit_questionnaire(&submission(Some("b-1"), None, &["b", "c"], &[]))
            .await
            .expect("second");
        assert_eq!(merged.new_problems, 1);
        assert_eq!(merged.total_problems, 3);
    }

    #[tokio::test]
    async fn email_match_joins_existing_profile() {
        let store = store().await;
        let first = store
            .submit_questionnaire(&submission(Some("b-1"), Some("x@y.z"), &["a"], &[]))
            .await
            .expect("first");
        let second = store
            .submit_questionnaire(&submission(Some("b-2"), Some("x@y.z"), &["b"], &[]))
            .await
            .expect("second");
        assert!(!second.created);
        assert_eq!(second.matched_via, Some(MatchedVia::Email));
        assert_eq!(second.total_problems, 2);
        assert_eq!(second.update_code, first.update_code);
    }

    #[tokio::test]
    async fn update_code_match_backfills_browser_id() {
        let store = store().await;
        let first = store
            .submit_questionnaire(&submission(None, Some("x@y.z"), &["a"], &[]))
            .await
            .expect("first");
        let mut follow_up = submission(Some("b-9"), None, &["b"], &[]);
        follow_up.update_code = Some(first.update_code.clone());
        let second = store.submit_questionnaire(&follow_up).await.expect("second");
        assert_eq!(second.matched_via, Some(MatchedVia::UpdateCode));

        // The backfilled browser id now resolves directly.
        let third = store
            .submit_questionnaire(&submission(Some("b-9"), None, &["c"], &[]))
            .await
            .expect("third");
        assert_eq!(third.matched_via, Some(MatchedVia::BrowserId));
        assert_eq!(third.total_problems, 3);
    }

    #[tokio::test]
    async fn demographics_never_nulled_out_by_empty_values() {
        let store = store().await;
        let mut first = submission(Some("b-1"), None, &[], &[]);
        first.gender = Some("f".to_string());
        first.height = Some(165);
        store.submit_questionnaire(&first).await.expect("first");

        let mut second = submission(Some("b-1"), None, &[], &[]);
        second.gender = Some(String::new());
        second.arm_span = Some(170);
        store.submit_questionnaire(&second).await.expect("second");

        let profile: UserProfile = sqlx::query_as(
            "SELECT id, browser_id, email, update_code, gender, height, arm_span, created_at
             FROM user_profiles WHERE browser_id = 'b-1'",
        )
        .fetch_one(store.pool())
        .await
        .expect("profile");
        assert_eq!(profile.gender.as_deref(), Some("f"));
        assert_eq!(profile.height, Some(165));
        assert_eq!(profile.arm_span, Some(170));
    }

    #[tokio::test]
    async fn preferred_tags_are_case_insensitively_unique() {
        let store = store().await;
        store
            .submit_questionnaire(&submission(Some("b-1"), None, &[], &["Mur", "dalle"]))
            .await
            .expect("first");
        let second = store
            .submit_questionnaire(&submission(Some("b-1"), None, &[], &["MUR", " Dalle ", "toit"]))
            .await
            .expect("second");
        assert_eq!(second.new_tags, 1);
    }

    #[test]
    fn update_codes_use_the_unambiguous_alphabet() {
        let code = generate_update_code();
        assert_eq!(code.len(), CODE_LEN);
        assert!(code.bytes().all(|b| CODE_ALPHABET.contains(&b)));
    }
}
