use async_trait::async_trait;
use serde_json::{Value, json};

use super::executor::{Analyzer, RepoBundle};
use super::models::JobPayload;
use crate::errors::JobError;

const MAX_SHORT_DESCRIPTION: usize = 120;

/// Deterministic, offline analyzer. Derives each operation's output purely
/// from the fetched bundle.
#[derive(Debug, Default, Clone)]
pub struct SummaryAnalyzer;

#[async_trait]
impl Analyzer for SummaryAnalyzer {
    async fn compute(&self, payload: &JobPayload, bundle: &RepoBundle) -> Result<Value, JobError> {
        match payload {
            JobPayload::Analyze { .. } => Ok(analyze(bundle)),
            JobPayload::ShortDescription { .. } => short_description(bundle),
            JobPayload::Readme { .. } => readme(bundle),
            JobPayload::Screenshot { url, .. } => screenshot(url.as_deref(), bundle),
            JobPayload::Sync { .. } => Ok(sync(bundle)),
        }
    }
}

fn activity(bundle: &RepoBundle) -> &'static str {
    if bundle.archived {
        "archived"
    } else if bundle.pushed_at.is_some() {
        "maintained"
    } else {
        "unknown"
    }
}

fn analyze(bundle: &RepoBundle) -> Value {
    let language = bundle.language.as_deref().unwrap_or("unknown language");
    let summary = match bundle.description.as_deref().map(str::trim) {
        Some(desc) if !desc.is_empty() => format!("{} ({}): {}", bundle.key, language, desc),
        _ => format!("{} ({})", bundle.key, language),
    };
    json!({
        "summary": summary,
        "language": bundle.language,
        "stars": bundle.stars,
        "topics": bundle.topics,
        "fork": bundle.fork,
        "activity": activity(bundle),
        "hasReadme": bundle.readme.is_some(),
    })
}

/// First sentence of `text`, cut at a word boundary to fit `max` chars.
fn first_sentence(text: &str, max: usize) -> String {
    let text = text.trim();
    let sentence = match text.find(". ") {
        Some(end) => &text[..=end],
        None => text,
    };
    if sentence.chars().count() <= max {
        return sentence.to_string();
    }
    let mut out = String::new();
    for word in sentence.split_whitespace() {
        if out.chars().count() + word.chars().count() + 1 > max.saturating_sub(3) {
            break;
        }
        if !out.is_empty() {
            out.push(' ');
        }
        out.push_str(word);
    }
    out.push_str("...");
    out
}

/// First prose line of a markdown document.
fn readme_lead(readme: &str) -> Option<&str> {
    readme
        .lines()
        .map(str::trim)
        .find(|line| {
            !line.is_empty()
                && !line.starts_with('#')
                && !line.starts_with('!')
                && !line.starts_with('[')
                && !line.starts_with("<")
        })
}

fn short_description(bundle: &RepoBundle) -> Result<Value, JobError> {
    let source = bundle
        .description
        .as_deref()
        .filter(|d| !d.trim().is_empty())
        .or_else(|| bundle.readme.as_deref().and_then(readme_lead))
        .ok_or_else(|| {
            JobError::Generic(format!("{} has no description or readme to summarize", bundle.key))
        })?;
    Ok(json!({ "shortDescription": first_sentence(source, MAX_SHORT_DESCRIPTION) }))
}

fn readme(bundle: &RepoBundle) -> Result<Value, JobError> {
    let text = bundle
        .readme
        .as_deref()
        .filter(|r| !r.trim().is_empty())
        .ok_or_else(|| JobError::Generic(format!("{} has no readme", bundle.key)))?;
    let headings: Vec<&str> = text
        .lines()
        .filter_map(|line| line.trim().strip_prefix('#'))
        .map(|h| h.trim_start_matches('#').trim())
        .filter(|h| !h.is_empty())
        .collect();
    Ok(json!({
        "headings": headings,
        "wordCount": text.split_whitespace().count(),
        "lead": readme_lead(text),
    }))
}

fn screenshot(url: Option<&str>, bundle: &RepoBundle) -> Result<Value, JobError> {
    let target = url
        .or(bundle.homepage.as_deref())
        .filter(|u| u.starts_with("http://") || u.starts_with("https://"))
        .ok_or_else(|| JobError::Generic(format!("{} has no page to capture", bundle.key)))?;
    Ok(json!({ "url": target, "capture": "requested" }))
}

fn sync(bundle: &RepoBundle) -> Value {
    json!({
        "description": bundle.description,
        "defaultBranch": bundle.default_branch,
        "language": bundle.language,
        "stars": bundle.stars,
        "topics": bundle.topics,
        "archived": bundle.archived,
        "pushedAt": bundle.pushed_at,
    })
}
