//! Core domain model for RJP: job records, stable identity, and category rules.

use chrono::NaiveDate;
use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use thiserror::Error;

pub const CRATE_NAME: &str = "rjp-core";

/// Column contract for every tracking table. Order is load-bearing: a file
/// whose header differs from this list is treated as a foreign schema.
pub const FIELD_NAMES: [&str; 21] = [
    "_id",
    "title",
    "title_chinese",
    "title_english",
    "team",
    "summary",
    "summary_chinese",
    "summary_english",
    "salary",
    "salary_english",
    "createdAt",
    "source_name",
    "source_name_english",
    "source_url",
    "type",
    "description",
    "description_chinese",
    "description_english",
    "city",
    "experience",
    "is_remote",
];

/// One row of the tracking table. Every field is kept as the raw cell text;
/// empty string means "not set".
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct JobRecord {
    #[serde(rename = "_id")]
    pub id: String,
    pub title: String,
    pub title_chinese: String,
    pub title_english: String,
    pub team: String,
    pub summary: String,
    pub summary_chinese: String,
    pub summary_english: String,
    pub salary: String,
    pub salary_english: String,
    #[serde(rename = "createdAt")]
    pub created_at: String,
    pub source_name: String,
    pub source_name_english: String,
    pub source_url: String,
    #[serde(rename = "type")]
    pub category: String,
    pub description: String,
    pub description_chinese: String,
    pub description_english: String,
    pub city: String,
    pub experience: String,
    pub is_remote: String,
}

impl JobRecord {
    /// A record is enriched once both Chinese translation anchors are present.
    pub fn is_enriched(&self) -> bool {
        !self.title_chinese.trim().is_empty() && !self.description_chinese.trim().is_empty()
    }

    /// Terminal rows never go back to the enrichment queue: either the
    /// translation landed or the row was ruled out as not remote.
    pub fn is_terminal(&self) -> bool {
        !self.title_chinese.trim().is_empty() || self.is_remote.trim() == "0"
    }

    pub fn mark_not_remote(&mut self) {
        self.is_remote = "0".to_string();
    }

    /// Parsed posting date, used as the queue sort key. Unparseable or
    /// missing dates sort to the very end of a newest-first ordering.
    pub fn sort_date(&self) -> NaiveDate {
        NaiveDate::parse_from_str(self.created_at.trim(), "%Y-%m-%d").unwrap_or(NaiveDate::MIN)
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum IdentityError {
    #[error("record has no source locator")]
    MissingLocator,
}

/// Reduce a posting URL to the portion that survives re-scrapes: no scheme,
/// no query string, no fragment, no trailing slash, host lowercased.
pub fn canonicalize_locator(url: &str) -> String {
    let trimmed = url.trim();
    let without_fragment = trimmed.split('#').next().unwrap_or_default();
    let without_query = without_fragment.split('?').next().unwrap_or_default();
    let without_scheme = match without_query.find("://") {
        Some(idx) => &without_query[idx + 3..],
        None => without_query,
    };
    let without_slash = without_scheme.trim_end_matches('/');

    match without_slash.find('/') {
        Some(idx) => {
            let (host, path) = without_slash.split_at(idx);
            format!("{}{}", host.to_ascii_lowercase(), path)
        }
        None => without_slash.to_ascii_lowercase(),
    }
}

/// Stable job identity: 128-bit truncated SHA-256 of the canonical locator,
/// rendered as 32 lowercase hex characters.
pub fn job_id(source_url: &str) -> Result<String, IdentityError> {
    let canonical = canonicalize_locator(source_url);
    if canonical.is_empty() {
        return Err(IdentityError::MissingLocator);
    }
    let mut hasher = Sha256::new();
    hasher.update(canonical.as_bytes());
    let digest = hasher.finalize();
    Ok(hex::encode(&digest[..16]))
}

/// Job market segment, persisted in the `type` column.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum JobCategory {
    Domestic,
    Overseas,
    Web3,
}

impl JobCategory {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobCategory::Domestic => "国内",
            JobCategory::Overseas => "国外",
            JobCategory::Web3 => "web3",
        }
    }

    /// Lenient parse for cells written by older scrapers.
    pub fn from_cell(cell: &str) -> JobCategory {
        let lower = cell.trim().to_lowercase();
        if lower.contains("web3") {
            JobCategory::Web3
        } else if cell.contains('外') || lower.contains("abroad") || lower.contains("oversea") {
            JobCategory::Overseas
        } else {
            JobCategory::Domestic
        }
    }
}

static WEB3_KEYWORDS: &[&str] = &[
    // English
    "web3",
    "web 3",
    "web-3",
    "blockchain",
    "crypto",
    "cryptocurrency",
    "defi",
    "decentralized finance",
    "nft",
    "non-fungible token",
    "dapp",
    "decentralized app",
    "solidity",
    "ethereum",
    "bitcoin",
    "layer2",
    "layer 2",
    "smart contract",
    "erc20",
    "erc721",
    "proof of stake",
    "proof of work",
    "lightning network",
    "crypto exchange",
    "decentralized exchange",
    "stablecoin",
    "yield farming",
    "liquidity pool",
    "digital assets",
    "digital currency",
    // Chinese
    "区块链",
    "加密货币",
    "智能合约",
    "代币",
    "币圈",
    "链圈",
    "链上",
    "以太坊",
    "比特币",
    "合约审计",
    "交易所",
    "去中心化交易",
    "合约交易",
    "量化交易",
    "数字资产",
    "虚拟货币",
    "挖矿",
    "矿池",
    "跨链",
];

/// Classify a posting into a market segment from its description text.
/// Any web3 keyword hit wins; everything else keeps the source default.
pub fn classify_category(text: &str, default: JobCategory) -> JobCategory {
    let lower = text.to_lowercase();
    if WEB3_KEYWORDS.iter().any(|kw| lower.contains(kw)) {
        JobCategory::Web3
    } else {
        default
    }
}

const CONTEXT_WORDS: &str = "行业|领域|公司|业务|industry|sector|company|business";

/// Industry keyword tables. A keyword only counts when a context word sits
/// next to it, so "SaaS" mentioned in passing never produces a tag.
static INDUSTRY_PATTERNS: Lazy<Vec<(Regex, &'static str)>> = Lazy::new(|| {
    let specs: &[(&str, &str)] = &[
        (r"跨境电商|cross-border e-commerce|cross border", "跨境电商行业"),
        (r"在线教育|online education|edtech|教育科技", "在线教育行业"),
        (r"人工智能|artificial intelligence|机器学习|machine learning", "人工智能行业"),
        (r"云计算|cloud computing", "云计算行业"),
        (r"大数据|big data", "大数据行业"),
        (r"区块链|blockchain|web3|web 3", "区块链行业"),
        (r"金融科技|fintech", "金融科技行业"),
        (r"saas|软件即服务", "SaaS行业"),
        (r"游戏|gaming|game", "游戏行业"),
        (r"电商|e-commerce|ecommerce", "电商行业"),
        (r"互联网|internet", "互联网行业"),
        (r"软件|software", "软件行业"),
        (r"金融|financial|finance", "金融行业"),
        (r"医疗|healthcare|健康", "医疗健康行业"),
        (r"教育|education|培训|training", "教育培训行业"),
        (r"物流|logistics", "物流行业"),
        (r"视频|video|直播|live streaming|streaming", "视频行业"),
        (r"营销|marketing|广告|advertising", "营销行业"),
        (r"保险|insurance", "保险行业"),
        (r"银行|banking|bank", "银行行业"),
        (r"证券|securities", "证券行业"),
        (r"投资|investment", "投资行业"),
        (r"传媒|media", "传媒行业"),
        (r"社交|social media|social", "社交行业"),
        (r"芯片|chip|semiconductor", "芯片行业"),
        (r"医药|pharmaceutical|pharma", "医药行业"),
        (r"生物科技|biotech", "生物科技行业"),
        (r"交通|transportation|出行|mobility", "交通运输行业"),
        (r"房产|real estate|property", "房产行业"),
        (r"制造|manufacturing", "制造行业"),
        (r"咨询|consulting", "咨询行业"),
        (r"能源|energy", "能源行业"),
        (r"物联网|iot", "物联网行业"),
        (r"硬件|hardware", "硬件行业"),
        (r"法律|legal|law", "法律行业"),
        (r"人力资源|recruitment|talent", "人力资源行业"),
        (r"设计|design", "设计行业"),
        (r"零售|retail", "零售行业"),
        (r"汽车|automotive", "汽车行业"),
        (r"电信|telecom|telecommunications", "电信行业"),
        (r"网络安全|cybersecurity|security|安全", "安全行业"),
    ];
    specs
        .iter()
        .map(|(keywords, tag)| {
            let pattern = format!(r"({keywords})\s*({CONTEXT_WORDS})");
            (
                Regex::new(&pattern).unwrap_or_else(|_| Regex::new("$^").unwrap()),
                *tag,
            )
        })
        .collect()
});

/// Literal fallbacks: only keywords that already carry the 行业 suffix, so
/// they cannot fire on incidental mentions.
static FALLBACK_INDUSTRY_LITERALS: &[(&str, &str)] = &[
    ("软件行业", "软件行业"),
    ("互联网行业", "互联网行业"),
    ("电商行业", "电商行业"),
    ("游戏行业", "游戏行业"),
    ("金融行业", "金融行业"),
    ("医疗行业", "医疗健康行业"),
    ("教育行业", "教育培训行业"),
];

/// Extract an industry tag from a (possibly bilingual) description.
/// Returns `None` when no keyword appears in an industry context.
pub fn extract_industry(description: &str) -> Option<&'static str> {
    if description.trim().is_empty() {
        return None;
    }
    let lower = description.to_lowercase();

    for (pattern, tag) in INDUSTRY_PATTERNS.iter() {
        if pattern.is_match(&lower) {
            return Some(tag);
        }
    }

    for (literal, tag) in FALLBACK_INDUSTRY_LITERALS {
        if lower.contains(&literal.to_lowercase()) {
            return Some(tag);
        }
    }

    None
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn locator_canonicalization_strips_noise() {
        assert_eq!(
            canonicalize_locator("https://Example.com/jobs/123?spm=abc#anchor"),
            "example.com/jobs/123"
        );
        assert_eq!(
            canonicalize_locator("http://example.com/jobs/123/"),
            "example.com/jobs/123"
        );
        assert_eq!(canonicalize_locator("example.com/jobs/123"), "example.com/jobs/123");
    }

    #[test]
    fn job_id_is_deterministic_across_url_variants() {
        let a = job_id("https://example.com/jobs/123?from=feed").expect("id");
        let b = job_id("http://EXAMPLE.com/jobs/123/").expect("id");
        assert_eq!(a, b);
        assert_eq!(a.len(), 32);
        assert!(a.chars().all(|c| c.is_ascii_hexdigit()));
    }

    #[test]
    fn empty_locator_is_rejected() {
        assert_eq!(job_id(""), Err(IdentityError::MissingLocator));
        assert_eq!(job_id("   "), Err(IdentityError::MissingLocator));
    }

    #[test]
    fn web3_keywords_override_default_category() {
        assert_eq!(
            classify_category("负责交易所后端开发", JobCategory::Domestic),
            JobCategory::Web3
        );
        assert_eq!(
            classify_category("Backend engineer for a Solidity team", JobCategory::Overseas),
            JobCategory::Web3
        );
        assert_eq!(
            classify_category("负责电商后台开发", JobCategory::Domestic),
            JobCategory::Domestic
        );
    }

    #[test]
    fn industry_requires_context_word() {
        assert_eq!(extract_industry("我们是区块链 行业 公司"), Some("区块链行业"));
        assert_eq!(extract_industry("game industry veteran wanted"), Some("游戏行业"));
        assert_eq!(extract_industry("我喜欢打游戏"), None);
        assert_eq!(extract_industry(""), None);
    }

    #[test]
    fn fallback_literal_matches_suffixed_mention() {
        assert_eq!(extract_industry("一家互联网行业的团队"), Some("互联网行业"));
    }

    #[test]
    fn sort_date_falls_back_to_minimum() {
        let mut record = JobRecord::default();
        record.created_at = "2026-08-20".to_string();
        assert_eq!(
            record.sort_date(),
            NaiveDate::from_ymd_opt(2026, 8, 20).unwrap()
        );
        record.created_at = "soon".to_string();
        assert_eq!(record.sort_date(), NaiveDate::MIN);
        record.created_at = String::new();
        assert_eq!(record.sort_date(), NaiveDate::MIN);
    }

    #[test]
    fn terminal_states_cover_translation_and_non_remote() {
        let mut record = JobRecord::default();
        assert!(!record.is_terminal());
        record.is_remote = "0".to_string();
        assert!(record.is_terminal());

        let mut translated = JobRecord::default();
        translated.title_chinese = "软件工程师".to_string();
        assert!(translated.is_terminal());
        assert!(!translated.is_enriched());
        translated.description_chinese = "负责后端开发".to_string();
        assert!(translated.is_enriched());
    }
}
