//! Per-source board profiles: one generic pipeline, parameterized here.

use once_cell::sync::Lazy;
use regex::Regex;
use rjp_core::JobCategory;

pub const CRATE_NAME: &str = "rjp-sources";

/// How the experience cell is policed for a given board.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExperienceRule {
    /// Only the board's fixed vocabulary passes; everything else is invalid.
    Strict,
    /// English boards use free text; accept anything that looks like an
    /// experience statement.
    Relaxed,
    /// Never reject: unknown values are rewritten to 经验不限.
    Normalize,
}

/// Minimum-content rule for a posting body.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DescriptionRule {
    /// CJK-dominant boards: at least 20 CJK chars or 30 alphanumerics after
    /// punctuation removal.
    CjkCount,
    /// English boards: at least 100 chars and 20 words.
    EnglishLength,
}

/// How the raw salary cell is rendered into English notation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SalaryStyle {
    /// 元/月 amounts collapse to K-notation, 元/天 and friends get unit
    /// suffixes.
    CnMonthly,
    /// Like `CnMonthly` plus en-dash range normalization for $-ranges.
    UsRange,
    /// Handles 万 and bare 元 ranges on top of the monthly logic.
    CnWan,
}

/// Everything the pipeline needs to know about one job board.
#[derive(Debug, Clone)]
pub struct SourceProfile {
    pub source_id: &'static str,
    pub display_name: &'static str,
    pub display_name_english: &'static str,
    /// Postings older than this many days halt the whole enrichment batch
    /// (the queue is newest-first, so everything after them is older still).
    pub staleness_days: Option<i64>,
    pub default_category: JobCategory,
    pub experience_rule: ExperienceRule,
    pub description_rule: DescriptionRule,
    pub salary_style: SalaryStyle,
    /// Marker text meaning the posting was withdrawn at the source.
    pub closed_marker: Option<&'static str>,
    /// Whether the enrichment prompt opens with the remote-work check.
    /// English boards are remote-only feeds, so they skip it.
    pub remote_check_in_prompt: bool,
    /// Whether merge admission filters on description and experience.
    pub strict_admission: bool,
}

static BOSS: SourceProfile = SourceProfile {
    source_id: "boss",
    display_name: "BOSS直聘",
    display_name_english: "BOSS Zhipin",
    staleness_days: Some(10),
    default_category: JobCategory::Domestic,
    experience_rule: ExperienceRule::Strict,
    description_rule: DescriptionRule::CjkCount,
    salary_style: SalaryStyle::CnMonthly,
    closed_marker: Some("职位已关闭"),
    remote_check_in_prompt: true,
    strict_admission: true,
};

static WELLFOUND: SourceProfile = SourceProfile {
    source_id: "wellfound",
    display_name: "Wellfound",
    display_name_english: "Wellfound",
    staleness_days: None,
    default_category: JobCategory::Overseas,
    experience_rule: ExperienceRule::Relaxed,
    description_rule: DescriptionRule::EnglishLength,
    salary_style: SalaryStyle::UsRange,
    closed_marker: None,
    remote_check_in_prompt: false,
    strict_admission: false,
};

static ZHILIAN: SourceProfile = SourceProfile {
    source_id: "zhilian",
    display_name: "智联招聘",
    display_name_english: "Zhilian Zhaopin",
    staleness_days: Some(10),
    default_category: JobCategory::Domestic,
    experience_rule: ExperienceRule::Normalize,
    description_rule: DescriptionRule::CjkCount,
    salary_style: SalaryStyle::CnWan,
    closed_marker: Some("职位已关闭"),
    remote_check_in_prompt: true,
    strict_admission: true,
};

pub fn profile_for_source(source_id: &str) -> Option<&'static SourceProfile> {
    match source_id {
        "boss" => Some(&BOSS),
        "wellfound" => Some(&WELLFOUND),
        "zhilian" => Some(&ZHILIAN),
        _ => None,
    }
}

pub fn all_profiles() -> [&'static SourceProfile; 3] {
    [&BOSS, &WELLFOUND, &ZHILIAN]
}

/// Map a persisted source name to its English rendering. Unknown names pass
/// through unchanged.
pub fn localize_source_name(source_name: &str) -> &str {
    match source_name.trim() {
        "BOSS直聘" => "BOSS Zhipin",
        "wellfound" | "Wellfound" => "Wellfound",
        "智联招聘" => "Zhilian Zhaopin",
        other => other,
    }
}

static STRICT_RANGE: Lazy<Regex> = Lazy::new(|| Regex::new(r"^\d+-\d+年$").unwrap());
static STRICT_ABOVE: Lazy<Regex> = Lazy::new(|| Regex::new(r"^\d+年以上$").unwrap());
static LOOSE_RANGE: Lazy<Regex> = Lazy::new(|| Regex::new(r"\d+-\d+年").unwrap());
static LOOSE_ABOVE: Lazy<Regex> = Lazy::new(|| Regex::new(r"\d+年以上").unwrap());
static LOOSE_BELOW: Lazy<Regex> = Lazy::new(|| Regex::new(r"\d+年以[下内]").unwrap());
static ANY_DIGITS: Lazy<Regex> = Lazy::new(|| Regex::new(r"\d+\+?").unwrap());

/// Strict vocabulary: 经验不限, 1年以内, N-M年, N年以上.
fn experience_valid_strict(experience: &str) -> bool {
    let trimmed = experience.trim();
    if trimmed.is_empty() {
        return false;
    }
    trimmed == "经验不限"
        || trimmed == "1年以内"
        || STRICT_RANGE.is_match(trimmed)
        || STRICT_ABOVE.is_match(trimmed)
}

/// Relaxed check for English boards: any plausible experience phrasing.
fn experience_valid_relaxed(experience: &str) -> bool {
    let trimmed = experience.trim().to_lowercase();
    if trimmed.is_empty() {
        return false;
    }
    trimmed.contains("year")
        || trimmed.contains("yr")
        || trimmed.contains("no experience")
        || trimmed.contains("any")
        || trimmed.contains("intern")
        || ANY_DIGITS.is_match(&trimmed)
        || trimmed.contains('年')
        || trimmed.contains("经验不限")
}

/// Normalizing check: recognizable year patterns keep their text, everything
/// else collapses to 经验不限.
pub fn normalize_experience(experience: &str) -> String {
    let trimmed = experience.trim();
    if LOOSE_RANGE.is_match(trimmed) || LOOSE_ABOVE.is_match(trimmed) || LOOSE_BELOW.is_match(trimmed)
    {
        trimmed.to_string()
    } else {
        "经验不限".to_string()
    }
}

impl SourceProfile {
    pub fn experience_is_valid(&self, experience: &str) -> bool {
        match self.experience_rule {
            ExperienceRule::Strict => experience_valid_strict(experience),
            ExperienceRule::Relaxed => experience_valid_relaxed(experience),
            ExperienceRule::Normalize => true,
        }
    }

    pub fn description_is_valid(&self, description: &str) -> bool {
        match self.description_rule {
            DescriptionRule::CjkCount => description_valid_cjk(description),
            DescriptionRule::EnglishLength => description_valid_english(description),
        }
    }

    pub fn convert_salary(&self, salary: &str) -> String {
        match self.salary_style {
            SalaryStyle::CnMonthly => convert_salary_cn_monthly(salary),
            SalaryStyle::UsRange => convert_salary_us_range(salary),
            SalaryStyle::CnWan => convert_salary_cn_wan(salary),
        }
    }
}

const CJK_PUNCT: &str = "，。！？；：“”‘’（）【】《》…—、·「」『』〈〉";
const ASCII_PUNCT: &str = "!\"#$%&'()*+,-./:;<=>?@[\\]^_`{|}~";

fn description_valid_cjk(description: &str) -> bool {
    if description.trim().is_empty() {
        return false;
    }
    let mut cjk = 0usize;
    let mut alnum = 0usize;
    for c in description.chars() {
        if CJK_PUNCT.contains(c) || ASCII_PUNCT.contains(c) {
            continue;
        }
        if ('\u{4e00}'..='\u{9fff}').contains(&c) {
            cjk += 1;
        } else if c.is_ascii_alphanumeric() {
            alnum += 1;
        }
    }
    cjk >= 20 || alnum >= 30
}

fn description_valid_english(description: &str) -> bool {
    let trimmed = description.trim();
    trimmed.chars().count() >= 100 && trimmed.split_whitespace().count() >= 20
}

static NUMBER: Lazy<Regex> = Lazy::new(|| Regex::new(r"\d+(\.\d+)?").unwrap());
static ANNUAL_PAYS: Lazy<Regex> = Lazy::new(|| Regex::new(r"(\d+)薪").unwrap());

fn format_trim_zeros(value: f64) -> String {
    let formatted = format!("{value}");
    match formatted.strip_suffix(".0") {
        Some(stripped) => stripped.to_string(),
        None => formatted,
    }
}

fn scale_numbers(salary: &str, threshold: f64, factor: f64) -> String {
    NUMBER
        .replace_all(salary, |caps: &regex::Captures<'_>| {
            let raw = &caps[0];
            match raw.parse::<f64>() {
                Ok(num) if num >= threshold => format_trim_zeros(num * factor),
                _ => raw.to_string(),
            }
        })
        .into_owned()
}

fn convert_unit_suffixes(salary: &str) -> String {
    let out = salary.replace("元/天", "/day");
    let out = out.replace("元/月", "/mo");
    let out = out.replace("元/周", "/wk");
    let out = out.replace("元/时", "/hr");
    ANNUAL_PAYS.replace_all(&out, "$1 pays/yr").into_owned()
}

/// `6000-7500元/月` becomes `6-7.5K`; other units keep their amounts and get
/// English suffixes. Already-converted values pass through unchanged.
pub fn convert_salary_cn_monthly(salary: &str) -> String {
    let trimmed = salary.trim();
    if trimmed.is_empty() {
        return String::new();
    }
    if trimmed.contains("元/月") {
        let scaled = scale_numbers(trimmed, 100.0, 1.0 / 1000.0);
        let keyed = scaled.replace("元/月", "K");
        ANNUAL_PAYS.replace_all(&keyed, "$1 pays/yr").into_owned()
    } else {
        convert_unit_suffixes(trimmed)
    }
    .trim()
    .to_string()
}

/// Wellfound salaries are usually `$120k – $160k`; normalize the range dash
/// and fall back to the monthly logic for CJK residue.
pub fn convert_salary_us_range(salary: &str) -> String {
    let trimmed = salary.trim();
    if trimmed.is_empty() {
        return String::new();
    }
    if trimmed.contains("元/月") {
        convert_salary_cn_monthly(trimmed)
    } else {
        convert_unit_suffixes(&trimmed.replace(" – ", "-"))
            .trim()
            .to_string()
    }
}

/// Zhilian writes 万-denominated and bare 元 ranges: `2.1-4万` becomes
/// `21-40k`, `4000-8000元` becomes `4-8k`.
pub fn convert_salary_cn_wan(salary: &str) -> String {
    let trimmed = salary.trim();
    if trimmed.is_empty() {
        return String::new();
    }
    // Hourly/daily/weekly rates keep their amounts.
    if trimmed.contains('时') || trimmed.contains('天') || trimmed.contains('周') {
        return convert_unit_suffixes(trimmed).trim().to_string();
    }

    let scaled = if trimmed.contains('万') {
        scale_numbers(trimmed, 0.0, 10.0).replace('万', "k")
    } else if trimmed.contains('元') {
        scale_numbers(trimmed, 500.0, 1.0 / 1000.0).replace('元', "k")
    } else {
        trimmed.to_string()
    };

    let lowered = scaled.to_lowercase().replace("k/月", "k");
    ANNUAL_PAYS
        .replace_all(&lowered, "$1 pays/yr")
        .trim()
        .to_string()
}
