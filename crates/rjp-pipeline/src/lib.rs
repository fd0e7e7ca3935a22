//! Batch orchestration: merge, gate, enrich, dedupe, derive, aggregate.

use std::collections::{BTreeMap, HashSet};
use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::{DateTime, Local, NaiveDate, Utc};
use once_cell::sync::Lazy;
use regex::Regex;
use rjp_core::{classify_category, extract_industry, job_id, JobCategory, JobRecord};
use rjp_enrich::{
    EnrichOutcome, EnrichmentSession, GeminiClient, JobTranslation, DEFAULT_MODELS,
};
use rjp_sources::{normalize_experience, ExperienceRule, SalaryStyle, SourceProfile};
use rjp_store::{AppendOutcome, JobTable};
use serde::Serialize;
use tracing::{info, info_span, warn};
use uuid::Uuid;

pub const CRATE_NAME: &str = "rjp-pipeline";

pub const DEFAULT_DAILY_LIMIT: usize = 1000;
const DELAY_BETWEEN_JOBS: Duration = Duration::from_secs(2);

#[derive(Debug, Clone)]
pub struct PipelineConfig {
    pub data_dir: PathBuf,
    pub api_key: String,
    /// Override for the enrichment API endpoint; `None` uses the provider
    /// default.
    pub api_base_url: Option<String>,
    pub models: Vec<String>,
    pub daily_limit: usize,
    pub delay_between_jobs: Duration,
}

impl PipelineConfig {
    pub fn from_env() -> Self {
        Self {
            data_dir: std::env::var("RJP_DATA_DIR")
                .map(PathBuf::from)
                .unwrap_or_else(|_| PathBuf::from("./data")),
            api_key: std::env::var("GEMINI_API_KEY").unwrap_or_default(),
            api_base_url: std::env::var("RJP_API_BASE_URL").ok(),
            models: std::env::var("RJP_MODELS")
                .map(|v| {
                    v.split(',')
                        .map(|m| m.trim().to_string())
                        .filter(|m| !m.is_empty())
                        .collect()
                })
                .unwrap_or_else(|_| DEFAULT_MODELS.iter().map(|m| m.to_string()).collect()),
            daily_limit: std::env::var("RJP_DAILY_LIMIT")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(DEFAULT_DAILY_LIMIT),
            delay_between_jobs: std::env::var("RJP_DELAY_SECS")
                .ok()
                .and_then(|v| v.parse().ok())
                .map(Duration::from_secs)
                .unwrap_or(DELAY_BETWEEN_JOBS),
        }
    }

    pub fn intake_path(&self, source_id: &str) -> PathBuf {
        self.data_dir.join(source_id).join("jobs_intake.csv")
    }

    pub fn tracking_path(&self, source_id: &str) -> PathBuf {
        self.data_dir.join(source_id).join("jobs_tracking.csv")
    }

    pub fn final_path(&self, source_id: &str) -> PathBuf {
        self.data_dir.join(source_id).join("jobs_final.csv")
    }

    pub fn category_dir(&self) -> PathBuf {
        self.data_dir.join("by-category")
    }
}

/// Merge intake rows into the tracking rows and re-sort the queue
/// newest-first. Existing rows always win: their enrichment state is the
/// durable progress record.
pub fn merge_new_records(
    mut tracked: Vec<JobRecord>,
    intake: Vec<JobRecord>,
    profile: &SourceProfile,
) -> (Vec<JobRecord>, usize) {
    let mut seen: HashSet<String> = tracked.iter().map(|row| row.id.clone()).collect();
    let mut added = 0usize;

    for mut record in intake {
        if record.id.trim().is_empty() {
            match job_id(&record.source_url) {
                Ok(id) => record.id = id,
                Err(_) => continue,
            }
        }
        if seen.contains(&record.id) {
            continue;
        }

        if profile.strict_admission {
            if record.description.trim().is_empty() {
                continue;
            }
            if let Some(marker) = profile.closed_marker {
                if record.description.contains(marker) {
                    continue;
                }
            }
            if !profile.experience_is_valid(&record.experience) {
                continue;
            }
        }
        if profile.experience_rule == ExperienceRule::Normalize {
            record.experience = normalize_experience(&record.experience);
        }

        seen.insert(record.id.clone());
        tracked.push(record);
        added += 1;
    }

    // Stable sort: ties keep their current order, unparseable dates sink to
    // the end of the newest-first queue.
    tracked.sort_by(|a, b| b.sort_date().cmp(&a.sort_date()));
    (tracked, added)
}

/// Per-record verdict of the enrichment gate.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GateDecision {
    Process,
    SkipNotRemote,
    SkipEnriched,
    SkipInvalidDescription,
    /// The queue is sorted newest-first, so one stale record means every
    /// record after it is stale too: the whole batch halts.
    HaltStale,
}

pub fn gate_record(record: &JobRecord, profile: &SourceProfile, today: NaiveDate) -> GateDecision {
    if let Some(max_days) = profile.staleness_days {
        let date = record.sort_date();
        if date != NaiveDate::MIN && (today - date).num_days() > max_days {
            return GateDecision::HaltStale;
        }
    }
    if record.is_remote.trim() == "0" {
        return GateDecision::SkipNotRemote;
    }
    if record.is_enriched() {
        return GateDecision::SkipEnriched;
    }
    if !profile.description_is_valid(&record.description) {
        return GateDecision::SkipInvalidDescription;
    }
    GateDecision::Process
}

/// Call budget for one batch invocation. Progress is recomputed from the
/// persisted table, so a crashed run resumes with an accurate count.
#[derive(Debug, Clone, Copy)]
pub struct QuotaTracker {
    limit: usize,
    completed: usize,
}

impl QuotaTracker {
    pub fn from_records(limit: usize, rows: &[JobRecord]) -> Self {
        let completed = rows.iter().filter(|row| row.is_terminal()).count();
        Self { limit, completed }
    }

    pub fn remaining(&self) -> usize {
        self.limit.saturating_sub(self.completed)
    }

    pub fn exhausted(&self) -> bool {
        self.completed >= self.limit
    }

    pub fn record_completion(&mut self) {
        self.completed += 1;
    }
}

/// Write the bilingual payload into a record and flag it remote. Tags are
/// persisted comma-joined in the summary columns.
pub fn apply_translation(record: &mut JobRecord, translation: &JobTranslation) {
    record.title_chinese = translation.title_chinese.clone();
    record.title_english = translation.title_english.clone();
    record.summary_chinese = translation.tags_chinese.join(",");
    record.summary_english = translation.tags_english.join(",");
    record.description_chinese = translation.description_chinese.clone();
    record.description_english = translation.description_english.clone();
    record.is_remote = "1".to_string();
}

#[derive(Debug, Clone, Serialize)]
pub struct RunSummary {
    pub run_id: Uuid,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub source_id: String,
    pub merged_total: usize,
    pub newly_added: usize,
    pub processed: usize,
    pub skipped: usize,
    pub failed: usize,
    pub halted_stale: bool,
    pub quota_remaining: usize,
}

#[derive(Debug, Clone, Copy, Serialize)]
pub struct DedupSummary {
    pub kept: usize,
    pub duplicates_removed: usize,
    pub invalid_removed: usize,
}

#[derive(Debug, Clone, Copy, Serialize)]
pub struct DeriveSummary {
    pub written: usize,
    pub skipped_not_remote: usize,
    pub skipped_untranslated: usize,
    pub updated: usize,
}

/// Which table a dedup pass rewrites.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DedupTarget {
    Intake,
    Tracking,
}

pub struct EnrichPipeline {
    config: PipelineConfig,
    profile: &'static SourceProfile,
}

impl EnrichPipeline {
    pub fn new(config: PipelineConfig, profile: &'static SourceProfile) -> Self {
        Self { config, profile }
    }

    /// Merge intake into the tracking table, then walk the queue through the
    /// enrichment gate and the model session, persisting after every record.
    pub async fn merge_and_enrich(&self) -> Result<RunSummary> {
        let run_id = Uuid::new_v4();
        let started_at = Utc::now();
        let span = info_span!("merge_and_enrich", %run_id, source_id = self.profile.source_id);
        let _guard = span.enter();

        let tracking = JobTable::new(self.config.tracking_path(self.profile.source_id));
        let intake = JobTable::new(self.config.intake_path(self.profile.source_id));

        let tracked = tracking
            .load()
            .with_context(|| format!("loading {}", tracking.path().display()))?;
        let intake_rows = intake
            .load()
            .with_context(|| format!("loading {}", intake.path().display()))?;

        let (mut rows, newly_added) = merge_new_records(tracked, intake_rows, self.profile);
        tracking
            .write_all(&rows)
            .with_context(|| format!("writing {}", tracking.path().display()))?;
        info!(
            total = rows.len(),
            newly_added, "merged intake into tracking table"
        );

        let mut quota = QuotaTracker::from_records(self.config.daily_limit, &rows);
        let mut summary = RunSummary {
            run_id,
            started_at,
            finished_at: started_at,
            source_id: self.profile.source_id.to_string(),
            merged_total: rows.len(),
            newly_added,
            processed: 0,
            skipped: 0,
            failed: 0,
            halted_stale: false,
            quota_remaining: quota.remaining(),
        };

        if quota.exhausted() {
            info!(limit = self.config.daily_limit, "call budget already spent");
            summary.finished_at = Utc::now();
            return Ok(summary);
        }

        let client = match &self.config.api_base_url {
            Some(base) => GeminiClient::with_base_url(self.config.api_key.clone(), base.clone())?,
            None => GeminiClient::new(self.config.api_key.clone())?,
        };
        let mut session = EnrichmentSession::new(client, self.config.models.clone());
        let today = Local::now().date_naive();
        let total = rows.len();

        for idx in 0..total {
            if quota.exhausted() {
                info!(limit = self.config.daily_limit, "call budget reached, stopping");
                break;
            }

            match gate_record(&rows[idx], self.profile, today) {
                GateDecision::HaltStale => {
                    info!(
                        created_at = %rows[idx].created_at,
                        "reached stale region of the queue, halting batch"
                    );
                    summary.halted_stale = true;
                    break;
                }
                GateDecision::Process => {}
                _ => {
                    summary.skipped += 1;
                    continue;
                }
            }

            let record = &mut rows[idx];
            info!(job = %record.title, position = idx + 1, total, "enriching posting");
            let outcome = session
                .enrich_job(
                    &record.title,
                    &record.description,
                    self.profile.remote_check_in_prompt,
                )
                .await;

            match outcome {
                Ok(EnrichOutcome::NotRemote) => {
                    record.mark_not_remote();
                    tracking.upsert(record)?;
                    quota.record_completion();
                    summary.processed += 1;
                }
                Ok(EnrichOutcome::Translated(translation)) => {
                    apply_translation(record, &translation);
                    tracking.upsert(record)?;
                    quota.record_completion();
                    summary.processed += 1;
                }
                Err(err) if err.is_fatal() => {
                    return Err(err).context("enrichment backend rejected the whole batch");
                }
                Err(err) => {
                    // Left untouched: still queued for the next run.
                    warn!(job = %record.title, error = %err, "enrichment failed for record");
                    summary.failed += 1;
                }
            }

            if !quota.exhausted() && idx + 1 < total {
                tokio::time::sleep(self.config.delay_between_jobs).await;
            }
        }

        summary.quota_remaining = quota.remaining();
        summary.finished_at = Utc::now();
        info!(
            processed = summary.processed,
            skipped = summary.skipped,
            failed = summary.failed,
            halted_stale = summary.halted_stale,
            "batch finished"
        );
        Ok(summary)
    }

    /// Rewrite one table with duplicates and invalid rows removed.
    pub fn remove_duplicates(&self, target: DedupTarget) -> Result<DedupSummary> {
        let path = match target {
            DedupTarget::Intake => self.config.intake_path(self.profile.source_id),
            DedupTarget::Tracking => self.config.tracking_path(self.profile.source_id),
        };
        let table = JobTable::new(&path);
        let rows = table
            .load()
            .with_context(|| format!("loading {}", path.display()))?;

        let (cleaned, summary) = remove_duplicate_records(rows, self.profile);
        table
            .write_all(&cleaned)
            .with_context(|| format!("writing {}", path.display()))?;
        info!(
            kept = summary.kept,
            duplicates_removed = summary.duplicates_removed,
            invalid_removed = summary.invalid_removed,
            "dedup pass finished"
        );
        Ok(summary)
    }

    /// Project the tracking table into the final dataset with derived
    /// fields filled in.
    pub fn derive_additional_fields(&self) -> Result<DeriveSummary> {
        let tracking = JobTable::new(self.config.tracking_path(self.profile.source_id));
        let rows = tracking
            .load()
            .with_context(|| format!("loading {}", tracking.path().display()))?;

        let (finals, summary) = derive_final_records(rows, self.profile);

        let final_table = JobTable::new(self.config.final_path(self.profile.source_id));
        final_table
            .write_all(&finals)
            .with_context(|| format!("writing {}", final_table.path().display()))?;
        info!(
            written = summary.written,
            updated = summary.updated,
            "derived final dataset"
        );
        Ok(summary)
    }

    /// Fan every source's final table out into per-category tables,
    /// id-deduplicated and newest-first.
    pub fn aggregate_by_category(
        &self,
        source_paths: &[PathBuf],
    ) -> Result<BTreeMap<&'static str, AppendOutcome>> {
        let mut by_category: BTreeMap<&'static str, Vec<JobRecord>> = BTreeMap::new();
        let mut seen_ids: HashSet<String> = HashSet::new();

        for path in source_paths {
            let table = JobTable::new(path);
            for mut row in table
                .load()
                .with_context(|| format!("loading {}", path.display()))?
            {
                if row.id.trim().is_empty() || seen_ids.contains(&row.id) {
                    continue;
                }
                let category = JobCategory::from_cell(&row.category);
                row.category = category.as_str().to_string();
                seen_ids.insert(row.id.clone());
                by_category.entry(category.as_str()).or_default().push(row);
            }
        }

        let dir = self.config.category_dir();
        let outputs: [(JobCategory, &str); 3] = [
            (JobCategory::Domestic, "domestic_remote_jobs.csv"),
            (JobCategory::Overseas, "abroad_remote_jobs.csv"),
            (JobCategory::Web3, "web3_remote_jobs.csv"),
        ];

        let mut outcomes = BTreeMap::new();
        for (category, file_name) in outputs {
            let mut rows = by_category.remove(category.as_str()).unwrap_or_default();
            rows.sort_by(|a, b| b.sort_date().cmp(&a.sort_date()));
            let table = JobTable::new(dir.join(file_name));
            let outcome = table
                .append_unique(rows, category)
                .with_context(|| format!("appending to {}", table.path().display()))?;
            outcomes.insert(category.as_str(), outcome);
        }
        Ok(outcomes)
    }
}

/// First-seen-wins duplicate removal by (title, team) and by exact
/// description, with the profile's experience policing applied first.
pub fn remove_duplicate_records(
    rows: Vec<JobRecord>,
    profile: &SourceProfile,
) -> (Vec<JobRecord>, DedupSummary) {
    let mut seen_title_team: HashSet<(String, String)> = HashSet::new();
    let mut seen_descriptions: HashSet<String> = HashSet::new();
    let mut cleaned = Vec::new();
    let mut duplicates_removed = 0usize;
    let mut invalid_removed = 0usize;

    for mut row in rows {
        match profile.experience_rule {
            ExperienceRule::Strict => {
                if !profile.experience_is_valid(&row.experience) {
                    invalid_removed += 1;
                    continue;
                }
            }
            ExperienceRule::Normalize => {
                row.experience = normalize_experience(&row.experience);
            }
            ExperienceRule::Relaxed => {}
        }

        let title = row.title.trim().to_string();
        let team = row.team.trim().to_string();
        let description = row.description.trim().to_string();

        let duplicate = (!title.is_empty()
            && !team.is_empty()
            && seen_title_team.contains(&(title.clone(), team.clone())))
            || (!description.is_empty() && seen_descriptions.contains(&description));

        if duplicate {
            duplicates_removed += 1;
            continue;
        }

        if !title.is_empty() && !team.is_empty() {
            seen_title_team.insert((title, team));
        }
        if !description.is_empty() {
            seen_descriptions.insert(description);
        }
        cleaned.push(row);
    }

    let summary = DedupSummary {
        kept: cleaned.len(),
        duplicates_removed,
        invalid_removed,
    };
    (cleaned, summary)
}

/// Build the final dataset rows: enriched remote postings only, with salary
/// notation, market category, industry summary, and source names derived.
pub fn derive_final_records(
    rows: Vec<JobRecord>,
    profile: &SourceProfile,
) -> (Vec<JobRecord>, DeriveSummary) {
    let mut finals = Vec::new();
    let mut summary = DeriveSummary {
        written: 0,
        skipped_not_remote: 0,
        skipped_untranslated: 0,
        updated: 0,
    };

    for mut row in rows {
        if row.is_remote.trim() == "0" {
            summary.skipped_not_remote += 1;
            continue;
        }
        if row.title_english.trim().is_empty() || row.description_english.trim().is_empty() {
            summary.skipped_untranslated += 1;
            continue;
        }

        let mut updated = false;

        // Repair postings whose salary was left inline in the description.
        if row.salary.trim().is_empty() {
            let (extracted, cleaned) = extract_salary(&row.description);
            if !extracted.is_empty() {
                row.salary = extracted;
                row.description = cleaned;
                updated = true;
            }
        }

        if !row.salary.trim().is_empty() {
            let converted = convert_salary_for_profile(&row.salary, profile);
            if row.salary_english.trim() != converted {
                row.salary_english = converted;
                updated = true;
            }
        }

        let category_text = if row.description.trim().is_empty() {
            row.description_chinese.clone()
        } else {
            row.description.clone()
        };
        let category = if category_text.trim().is_empty() {
            profile.default_category
        } else {
            classify_category(&category_text, profile.default_category)
        };
        if row.category.trim() != category.as_str() {
            row.category = category.as_str().to_string();
            updated = true;
        }

        if row.summary.trim().is_empty() {
            if let Some(industry) = extract_industry(&category_text) {
                row.summary = industry.to_string();
                updated = true;
            }
        }

        let localized = rjp_sources::localize_source_name(&row.source_name).to_string();
        if row.source_name_english.trim() != localized {
            row.source_name_english = localized.clone();
            updated = true;
        }
        if row.source_name.trim().eq_ignore_ascii_case("wellfound") && row.source_name != localized
        {
            row.source_name = localized;
            updated = true;
        }

        if updated {
            summary.updated += 1;
        }
        summary.written += 1;
        finals.push(row);
    }

    (finals, summary)
}

static ANNUAL_K_RANGE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^\$?\s*(\d+(?:\.\d+)?)k\s*[–-]\s*\$?\s*(\d+(?:\.\d+)?)k$").unwrap());

fn convert_salary_for_profile(salary: &str, profile: &SourceProfile) -> String {
    if profile.salary_style == SalaryStyle::UsRange {
        let trimmed = salary.trim().to_lowercase();
        if let Some(caps) = ANNUAL_K_RANGE.captures(&trimmed) {
            let lower: f64 = caps[1].parse().unwrap_or(0.0);
            let upper: f64 = caps[2].parse().unwrap_or(0.0);
            // Plausibility bound: a "monthly" 30k USD range would be absurd,
            // so ranges this large are annual figures.
            if lower >= 30.0 {
                let monthly = convert_yearly_to_monthly(salary);
                if !monthly.is_empty() {
                    return monthly;
                }
            }
        }
    }
    profile.convert_salary(salary)
}

static SALARY_NUMBER: Lazy<Regex> = Lazy::new(|| Regex::new(r"\d+(?:\.\d+)?").unwrap());

/// `$70k - $95k` per year becomes `$5800-8000` per month: divide by twelve,
/// floor the lower bound and ceil the upper to the nearest hundred.
pub fn convert_yearly_to_monthly(salary: &str) -> String {
    let cleaned = salary.replace('💰', "");
    let numbers: Vec<f64> = SALARY_NUMBER
        .find_iter(&cleaned)
        .filter_map(|m| m.as_str().parse().ok())
        .collect();
    if numbers.len() < 2 {
        return String::new();
    }

    let mut lower = numbers[0];
    let mut upper = numbers[1];
    if lower < 1000.0 {
        lower *= 1000.0;
    }
    if upper < 1000.0 {
        upper *= 1000.0;
    }

    let lower_monthly = ((lower / 12.0) / 100.0).floor() * 100.0;
    let upper_monthly = ((upper / 12.0) / 100.0).ceil() * 100.0;
    format!("${}-{}", lower_monthly as i64, upper_monthly as i64)
}

static DOLLAR_RANGE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"\$\s*(\d+)\s*-\s*\$?\s*(\d+)").unwrap());
static ESTIMATED_MONTHLY: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"预估月薪\s*(\d+\s*-?\s*\d*\s*[kK])").unwrap());
static K_RANGE: Lazy<Regex> = Lazy::new(|| Regex::new(r"\d+\s*-\s*\d+\s*[kK]").unwrap());
static DAILY_WAGE: Lazy<Regex> = Lazy::new(|| Regex::new(r"日薪\s*(\d+\s*-?\s*\d*)\s*元?").unwrap());
static HOURLY_WAGE: Lazy<Regex> = Lazy::new(|| Regex::new(r"时薪\s*(\d+\s*-?\s*\d*)\s*元?").unwrap());
static WEEKLY_WAGE: Lazy<Regex> = Lazy::new(|| Regex::new(r"周薪\s*(\d+\s*-\s*\d+)\s*元?").unwrap());
static BARE_RANGE: Lazy<Regex> = Lazy::new(|| Regex::new(r"\d{4,}\s*-\s*\d{4,}").unwrap());

fn group_thousands(value: u64) -> String {
    let digits = value.to_string();
    let mut grouped = String::new();
    for (idx, c) in digits.chars().enumerate() {
        if idx > 0 && (digits.len() - idx) % 3 == 0 {
            grouped.push(',');
        }
        grouped.push(c);
    }
    grouped
}

fn is_salary_boundary(c: Option<char>) -> bool {
    match c {
        None => true,
        Some(c) => !c.is_ascii_alphanumeric() && !('\u{4e00}'..='\u{9fff}').contains(&c),
    }
}

/// Pull an inline salary statement out of a description.
/// Returns the salary text plus the description with the statement removed;
/// an empty salary means nothing recognizable was found.
pub fn extract_salary(description: &str) -> (String, String) {
    if description.trim().is_empty() {
        return (String::new(), description.to_string());
    }

    if let Some(caps) = DOLLAR_RANGE.captures(description) {
        let lower: u64 = caps[1].parse().unwrap_or(0);
        let upper: u64 = caps[2].parse().unwrap_or(0);
        let salary = format!("${}-{}", group_thousands(lower), group_thousands(upper));
        let cleaned = DOLLAR_RANGE.replace(description, "").trim().to_string();
        return (salary, cleaned);
    }

    if let Some(caps) = ESTIMATED_MONTHLY.captures(description) {
        let raw: String = caps[1].chars().filter(|c| !c.is_whitespace()).collect();
        let cleaned = ESTIMATED_MONTHLY.replace(description, "").trim().to_string();
        return (format!("约{raw}"), cleaned);
    }

    if let Some(m) = K_RANGE.find(description) {
        let salary = m.as_str().to_string();
        let cleaned = format!("{} {}", &description[..m.start()], &description[m.end()..])
            .trim()
            .to_string();
        return (salary, cleaned);
    }

    for (pattern, label) in [(&DAILY_WAGE, "日薪"), (&HOURLY_WAGE, "时薪")] {
        if let Some(caps) = pattern.captures(description) {
            let value: String = caps[1].chars().filter(|c| !c.is_whitespace()).collect();
            let cleaned = pattern.replace(description, "").trim().to_string();
            return (format!("{label} {value} 元"), cleaned);
        }
    }

    if let Some(caps) = WEEKLY_WAGE.captures(description) {
        let salary = format!("周薪 {} 元", &caps[1]);
        let cleaned = WEEKLY_WAGE.replace(description, "").trim().to_string();
        return (salary, cleaned);
    }

    // Bare 4+-digit ranges count only when not embedded in a longer token.
    for m in BARE_RANGE.find_iter(description) {
        let before = description[..m.start()].chars().next_back();
        let after = description[m.end()..].chars().next();
        if is_salary_boundary(before) && is_salary_boundary(after) {
            let salary: String = m.as_str().chars().filter(|c| !c.is_whitespace()).collect();
            let cleaned = format!("{}{}", &description[..m.start()], &description[m.end()..])
                .trim()
                .to_string();
            return (salary, cleaned);
        }
    }

    if description.contains("待遇不明") {
        return (String::new(), description.replace("待遇不明", "").trim().to_string());
    }

    (String::new(), description.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use rjp_sources::profile_for_source;

    fn mk_record(url: &str, title: &str, created_at: &str) -> JobRecord {
        let mut record = JobRecord::default();
        record.source_url = url.to_string();
        record.id = job_id(url).unwrap_or_default();
        record.title = title.to_string();
        record.created_at = created_at.to_string();
        record.team = "团队".to_string();
        record.description =
            "负责后端服务的设计与开发，参与系统架构演进，保障线上服务稳定性与高可用。".to_string();
        record.experience = "3-5年".to_string();
        record
    }

    fn boss() -> &'static SourceProfile {
        profile_for_source("boss").unwrap()
    }

    #[test]
    fn merge_is_idempotent_and_preserves_enrichment() {
        let intake = vec![
            mk_record("https://example.com/jobs/1", "a", "2026-08-20"),
            mk_record("https://example.com/jobs/2", "b", "2026-08-21"),
        ];

        let (merged, added) = merge_new_records(Vec::new(), intake.clone(), boss());
        assert_eq!(added, 2);

        // Simulate enrichment progress, then merge the same intake again.
        let mut tracked = merged;
        tracked[0].title_chinese = "后端工程师".to_string();
        tracked[0].description_chinese = "职责".to_string();
        tracked[0].is_remote = "1".to_string();

        let (remerged, readded) = merge_new_records(tracked, intake, boss());
        assert_eq!(readded, 0);
        assert_eq!(remerged.len(), 2);
        assert_eq!(remerged[0].title_chinese, "后端工程师");
    }

    #[test]
    fn merge_sorts_newest_first_with_unparseable_last() {
        let intake = vec![
            mk_record("https://example.com/jobs/1", "old", "2026-08-01"),
            mk_record("https://example.com/jobs/2", "undated", "someday"),
            mk_record("https://example.com/jobs/3", "new", "2026-08-21"),
        ];
        let (merged, _) = merge_new_records(Vec::new(), intake, boss());
        let titles: Vec<_> = merged.iter().map(|r| r.title.as_str()).collect();
        assert_eq!(titles, vec!["new", "old", "undated"]);
    }

    #[test]
    fn merge_admission_rejects_closed_empty_and_invalid_rows() {
        let mut closed = mk_record("https://example.com/jobs/1", "closed", "2026-08-20");
        closed.description = "该职位已关闭，请查看其他机会".to_string();
        let mut empty = mk_record("https://example.com/jobs/2", "empty", "2026-08-20");
        empty.description = String::new();
        let mut bad_exp = mk_record("https://example.com/jobs/3", "exp", "2026-08-20");
        bad_exp.experience = "本科".to_string();
        let ok = mk_record("https://example.com/jobs/4", "ok", "2026-08-20");

        let (merged, added) = merge_new_records(Vec::new(), vec![closed, empty, bad_exp, ok], boss());
        assert_eq!(added, 1);
        assert_eq!(merged[0].title, "ok");
    }

    #[test]
    fn gate_skips_terminal_rows_and_halts_on_stale() {
        let today = NaiveDate::from_ymd_opt(2026, 8, 25).unwrap();

        let fresh = mk_record("https://example.com/jobs/1", "fresh", "2026-08-20");
        assert_eq!(gate_record(&fresh, boss(), today), GateDecision::Process);

        let mut not_remote = fresh.clone();
        not_remote.is_remote = "0".to_string();
        assert_eq!(
            gate_record(&not_remote, boss(), today),
            GateDecision::SkipNotRemote
        );

        let mut enriched = fresh.clone();
        enriched.title_chinese = "标题".to_string();
        enriched.description_chinese = "描述".to_string();
        assert_eq!(
            gate_record(&enriched, boss(), today),
            GateDecision::SkipEnriched
        );

        let mut thin = fresh.clone();
        thin.description = "太短".to_string();
        assert_eq!(
            gate_record(&thin, boss(), today),
            GateDecision::SkipInvalidDescription
        );

        let stale = mk_record("https://example.com/jobs/2", "stale", "2026-08-01");
        assert_eq!(gate_record(&stale, boss(), today), GateDecision::HaltStale);

        // Wellfound has no staleness cutoff.
        let wellfound = profile_for_source("wellfound").unwrap();
        let mut old_en = mk_record("https://example.com/jobs/3", "old", "2026-01-01");
        old_en.description = "We are looking for a senior backend engineer to join our fully \
                              distributed team and own the design and operation of our core \
                              services across multiple regions."
            .to_string();
        assert_eq!(gate_record(&old_en, wellfound, today), GateDecision::Process);
    }

    #[test]
    fn quota_counts_terminal_rows_and_caps_the_batch() {
        let mut translated = mk_record("https://example.com/jobs/1", "a", "2026-08-20");
        translated.title_chinese = "标题".to_string();
        let mut ruled_out = mk_record("https://example.com/jobs/2", "b", "2026-08-20");
        ruled_out.is_remote = "0".to_string();
        let pending = mk_record("https://example.com/jobs/3", "c", "2026-08-20");

        let rows = vec![translated, ruled_out, pending];
        let quota = QuotaTracker::from_records(3, &rows);
        assert_eq!(quota.remaining(), 1);
        assert!(!quota.exhausted());

        // At the ceiling no enrichment call is ever issued: the batch runner
        // returns before a client is even constructed.
        let spent = QuotaTracker::from_records(2, &rows);
        assert!(spent.exhausted());
        assert_eq!(spent.remaining(), 0);
    }

    #[test]
    fn duplicate_removal_is_first_seen_wins() {
        let mut a = mk_record("https://example.com/jobs/1", "工程师", "2026-08-20");
        a.description = "描述甲，负责后端服务的设计与开发，参与系统架构演进。".to_string();
        let mut b = mk_record("https://example.com/jobs/2", "工程师", "2026-08-21");
        b.description = "描述乙，负责客户端开发与性能优化，维护工程质量。".to_string();
        let mut c = mk_record("https://example.com/jobs/3", "另一个岗位", "2026-08-21");
        c.team = "别的团队".to_string();
        c.description = a.description.clone();
        let d = mk_record("https://example.com/jobs/4", "独立岗位", "2026-08-22");

        // b duplicates a by (title, team); c duplicates a by description.
        let (cleaned, summary) = remove_duplicate_records(vec![a, b, c, d], boss());
        assert_eq!(summary.duplicates_removed, 2);
        assert_eq!(cleaned.len(), 2);
        assert_eq!(cleaned[0].title, "工程师");
        assert_eq!(cleaned[1].title, "独立岗位");
    }

    #[test]
    fn duplicate_removal_drops_invalid_experience_on_strict_boards() {
        let mut bad = mk_record("https://example.com/jobs/1", "a", "2026-08-20");
        bad.experience = "经验丰富".to_string();
        let ok = mk_record("https://example.com/jobs/2", "b", "2026-08-20");

        let (cleaned, summary) = remove_duplicate_records(vec![bad, ok], boss());
        assert_eq!(summary.invalid_removed, 1);
        assert_eq!(cleaned.len(), 1);

        // The normalizing board rewrites instead of dropping.
        let zhilian = profile_for_source("zhilian").unwrap();
        let mut odd = mk_record("https://example.com/jobs/3", "c", "2026-08-20");
        odd.experience = "经验丰富".to_string();
        let (cleaned, summary) = remove_duplicate_records(vec![odd], zhilian);
        assert_eq!(summary.invalid_removed, 0);
        assert_eq!(cleaned[0].experience, "经验不限");
    }

    fn translated_record(url: &str) -> JobRecord {
        let mut record = mk_record(url, "工程师", "2026-08-20");
        record.title_english = "Engineer".to_string();
        record.description_english = "Own the backend services.".to_string();
        record.title_chinese = "工程师".to_string();
        record.description_chinese = "负责后端".to_string();
        record.is_remote = "1".to_string();
        record.source_name = "BOSS直聘".to_string();
        record
    }

    #[test]
    fn derivation_fills_salary_category_and_source_names() {
        let mut row = translated_record("https://example.com/jobs/1");
        row.salary = "6000-7500元/月".to_string();
        row.description = "负责交易所合约系统的后端开发，参与智能合约集成。".to_string();

        let (finals, summary) = derive_final_records(vec![row], boss());
        assert_eq!(summary.written, 1);
        assert_eq!(summary.updated, 1);
        assert_eq!(finals[0].salary_english, "6-7.5K");
        assert_eq!(finals[0].category, "web3");
        assert_eq!(finals[0].source_name_english, "BOSS Zhipin");
    }

    #[test]
    fn derivation_skips_non_remote_and_untranslated_rows() {
        let mut ruled_out = translated_record("https://example.com/jobs/1");
        ruled_out.is_remote = "0".to_string();
        let mut untranslated = mk_record("https://example.com/jobs/2", "b", "2026-08-20");
        untranslated.is_remote = "1".to_string();

        let (finals, summary) = derive_final_records(vec![ruled_out, untranslated], boss());
        assert!(finals.is_empty());
        assert_eq!(summary.skipped_not_remote, 1);
        assert_eq!(summary.skipped_untranslated, 1);
    }

    #[test]
    fn derivation_repairs_inline_salary_and_extracts_industry() {
        let mut row = translated_record("https://example.com/jobs/1");
        row.salary = String::new();
        row.description = "预估月薪 10-15k 负责电商行业的后台服务开发与日常运维工作。".to_string();

        let (finals, _) = derive_final_records(vec![row], boss());
        assert_eq!(finals[0].salary, "约10-15k");
        assert!(!finals[0].description.contains("预估月薪"));
        assert_eq!(finals[0].summary, "电商行业");
    }

    #[test]
    fn annual_dollar_ranges_become_monthly_for_english_boards() {
        let wellfound = profile_for_source("wellfound").unwrap();
        assert_eq!(
            convert_salary_for_profile("$70k - $95k", wellfound),
            "$5800-8000"
        );
        // Small k-ranges are already monthly notation.
        assert_eq!(
            convert_salary_for_profile("6000-7500元/月", wellfound),
            "6-7.5K"
        );
        assert_eq!(convert_yearly_to_monthly("$70k - $95k"), "$5800-8000");
        assert_eq!(convert_yearly_to_monthly("nothing here"), "");
    }

    #[test]
    fn inline_salaries_extract_and_clean_the_description() {
        let (salary, cleaned) = extract_salary("Great role $2500-$3000 fully async");
        assert_eq!(salary, "$2,500-3,000");
        assert_eq!(cleaned, "Great role  fully async".trim());

        let (salary, _) = extract_salary("日薪 300-500 元，国内可做");
        assert_eq!(salary, "日薪 300-500 元");

        let (salary, cleaned) = extract_salary("资深前端 15-25k 远程");
        assert_eq!(salary, "15-25k");
        assert!(!cleaned.contains("15-25k"));

        let (salary, _) = extract_salary("范围 7000-9000 左右");
        assert_eq!(salary, "7000-9000");

        let (salary, cleaned) = extract_salary("待遇不明，长期合作");
        assert_eq!(salary, "");
        assert!(!cleaned.contains("待遇不明"));

        let (salary, cleaned) = extract_salary("没有数字的描述");
        assert_eq!(salary, "");
        assert_eq!(cleaned, "没有数字的描述");
    }

    #[tokio::test]
    async fn pipeline_round_trips_tables_through_merge_and_dedup() {
        let dir = tempfile::tempdir().expect("tempdir");
        let config = PipelineConfig {
            data_dir: dir.path().to_path_buf(),
            api_key: String::new(),
            api_base_url: None,
            models: vec!["test-model".to_string()],
            daily_limit: 0,
            delay_between_jobs: Duration::from_secs(0),
        };
        let pipeline = EnrichPipeline::new(config.clone(), boss());

        let intake = JobTable::new(config.intake_path("boss"));
        intake
            .write_all(&[
                mk_record("https://example.com/jobs/1", "a", "2026-08-20"),
                mk_record("https://example.com/jobs/1?ref=x", "a again", "2026-08-20"),
            ])
            .expect("seed intake");

        // daily_limit of zero: the merge still happens, but no enrichment
        // call can be budgeted.
        let summary = pipeline.merge_and_enrich().await.expect("run");
        assert_eq!(summary.merged_total, 1);
        assert_eq!(summary.newly_added, 1);
        assert_eq!(summary.processed, 0);
        assert_eq!(summary.quota_remaining, 0);

        let dedup = pipeline
            .remove_duplicates(DedupTarget::Tracking)
            .expect("dedup");
        assert_eq!(dedup.kept, 1);
    }

    #[tokio::test]
    async fn backend_failure_leaves_the_record_retryable() {
        use std::sync::atomic::{AtomicUsize, Ordering};
        use std::sync::Arc;
        use tokio::io::{AsyncReadExt, AsyncWriteExt};

        // One 404 answer: the record fails immediately, with no retry.
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
            .await
            .expect("bind");
        let base_url = format!("http://{}", listener.local_addr().expect("addr"));
        let hits = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&hits);
        tokio::spawn(async move {
            let Ok((mut stream, _)) = listener.accept().await else {
                return;
            };
            counter.fetch_add(1, Ordering::SeqCst);
            // Drain the request before answering.
            let mut buf = Vec::new();
            let mut chunk = [0u8; 1024];
            loop {
                let n = match stream.read(&mut chunk).await {
                    Ok(0) | Err(_) => break,
                    Ok(n) => n,
                };
                buf.extend_from_slice(&chunk[..n]);
                if let Some(end) = buf.windows(4).position(|w| w == b"\r\n\r\n") {
                    let headers = String::from_utf8_lossy(&buf[..end]).to_lowercase();
                    let body_len = headers
                        .lines()
                        .find_map(|line| line.strip_prefix("content-length:"))
                        .and_then(|v| v.trim().parse::<usize>().ok())
                        .unwrap_or(0);
                    if buf.len() >= end + 4 + body_len {
                        break;
                    }
                }
            }
            let body = "model missing";
            let response = format!(
                "HTTP/1.1 404 Not Found\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{body}",
                body.len()
            );
            let _ = stream.write_all(response.as_bytes()).await;
            let _ = stream.shutdown().await;
        });

        let dir = tempfile::tempdir().expect("tempdir");
        let config = PipelineConfig {
            data_dir: dir.path().to_path_buf(),
            api_key: "test-key".to_string(),
            api_base_url: Some(base_url),
            models: vec!["test-model".to_string()],
            daily_limit: DEFAULT_DAILY_LIMIT,
            delay_between_jobs: Duration::from_secs(0),
        };
        let pipeline = EnrichPipeline::new(config.clone(), boss());

        let today = Local::now().date_naive().format("%Y-%m-%d").to_string();
        JobTable::new(config.intake_path("boss"))
            .write_all(&[mk_record("https://example.com/jobs/1", "a", &today)])
            .expect("seed intake");

        let summary = pipeline.merge_and_enrich().await.expect("run");
        assert_eq!(hits.load(Ordering::SeqCst), 1);
        assert_eq!(summary.failed, 1);
        assert_eq!(summary.processed, 0);

        let rows = JobTable::new(config.tracking_path("boss"))
            .load()
            .expect("load tracking");
        assert_eq!(rows.len(), 1);
        assert!(!rows[0].is_terminal());
        assert!(rows[0].is_remote.is_empty());
        assert!(rows[0].title_chinese.is_empty());
    }

    #[test]
    fn aggregation_splits_finals_by_category() {
        let dir = tempfile::tempdir().expect("tempdir");
        let config = PipelineConfig {
            data_dir: dir.path().to_path_buf(),
            api_key: String::new(),
            api_base_url: None,
            models: Vec::new(),
            daily_limit: DEFAULT_DAILY_LIMIT,
            delay_between_jobs: Duration::from_secs(0),
        };
        let pipeline = EnrichPipeline::new(config.clone(), boss());

        let mut domestic = translated_record("https://example.com/jobs/1");
        domestic.category = "国内".to_string();
        let mut web3 = translated_record("https://example.com/jobs/2");
        web3.category = "web3".to_string();
        let mut abroad = translated_record("https://example.com/jobs/3");
        abroad.category = "abroad".to_string();

        let final_path = config.final_path("boss");
        JobTable::new(&final_path)
            .write_all(&[domestic, web3, abroad])
            .expect("seed finals");

        let outcomes = pipeline
            .aggregate_by_category(&[final_path])
            .expect("aggregate");
        assert_eq!(outcomes["国内"].written, 1);
        assert_eq!(outcomes["web3"].written, 1);
        assert_eq!(outcomes["国外"].written, 1);

        let web3_rows = JobTable::new(config.category_dir().join("web3_remote_jobs.csv"))
            .load()
            .expect("load web3");
        assert_eq!(web3_rows.len(), 1);
        assert_eq!(web3_rows[0].category, "web3");
    }
}
