//! Content provider interface and its data types.
//!
//! A provider resolves a title to its own catalogue entry and hands out
//! stream candidates per episode. Provider ids live in their own id space
//! and are never mixed with metadata API ids.

mod command;

pub use command::CommandProvider;

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use futures::stream::BoxStream;
use fuzzy_matcher::skim::SkimMatcherV2;
use fuzzy_matcher::FuzzyMatcher;
use serde::{Deserialize, Serialize};
use shared::MediaTitle;
use std::collections::HashMap;

/// Audio/subtitle variant of an episode
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TranslationType {
    #[default]
    Sub,
    Dub,
}

impl std::fmt::Display for TranslationType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TranslationType::Sub => write!(f, "sub"),
            TranslationType::Dub => write!(f, "dub"),
        }
    }
}

impl std::str::FromStr for TranslationType {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "sub" => Ok(TranslationType::Sub),
            "dub" => Ok(TranslationType::Dub),
            _ => Err(anyhow!("Invalid translation type: {}", s)),
        }
    }
}

/// Episode listing keyed by translation type
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AnimeEpisodes {
    #[serde(default)]
    pub sub: Vec<String>,
    #[serde(default)]
    pub dub: Vec<String>,
}

impl AnimeEpisodes {
    pub fn for_translation(&self, translation: TranslationType) -> &[String] {
        match translation {
            TranslationType::Sub => &self.sub,
            TranslationType::Dub => &self.dub,
        }
    }

    pub fn contains(&self, translation: TranslationType, episode: &str) -> bool {
        self.for_translation(translation).iter().any(|e| e == episode)
    }
}

#[derive(Debug, Clone)]
pub struct SearchParams {
    pub query: String,
    pub translation_type: TranslationType,
}

/// One provider-side search hit
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProviderSearchResult {
    /// Provider-local id
    pub id: String,
    pub title: String,
    #[serde(default)]
    pub episodes: AnimeEpisodes,
    #[serde(default)]
    pub other_titles: Vec<String>,
    #[serde(default)]
    pub year: Option<String>,
}

/// Full provider-side entry with its episode listing
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProviderAnime {
    pub id: String,
    pub title: String,
    #[serde(default)]
    pub episodes: AnimeEpisodes,
    #[serde(default)]
    pub poster: Option<String>,
    #[serde(default)]
    pub year: Option<String>,
}

#[derive(Debug, Clone)]
pub struct EpisodeStreamsParams {
    /// Provider-local id
    pub anime_id: String,
    pub query: String,
    pub episode: String,
    pub translation_type: TranslationType,
    pub server: Option<String>,
    pub quality: String,
}

fn default_quality() -> String {
    "720".to_string()
}

/// A playable link offered by a server
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EpisodeStream {
    pub link: String,
    #[serde(default)]
    pub title: Option<String>,
    #[serde(default = "default_quality")]
    pub quality: String,
    #[serde(default)]
    pub format: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Subtitle {
    pub url: String,
    #[serde(default)]
    pub language: Option<String>,
}

/// A stream candidate for one episode
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Server {
    pub name: String,
    #[serde(default)]
    pub links: Vec<EpisodeStream>,
    #[serde(default)]
    pub episode_title: Option<String>,
    /// Headers the stream host requires
    #[serde(default)]
    pub headers: HashMap<String, String>,
    #[serde(default)]
    pub subtitles: Vec<Subtitle>,
}

impl Server {
    /// Link with the requested quality, else the first link
    pub fn best_link(&self, quality: &str) -> Option<&EpisodeStream> {
        self.links
            .iter()
            .find(|l| l.quality == quality)
            .or_else(|| self.links.first())
    }
}

/// Scraper-side catalogue
#[async_trait]
pub trait ContentProvider: Send + Sync {
    /// Name recorded on downloaded episodes
    fn name(&self) -> &str;

    async fn search(&self, params: &SearchParams) -> Result<Vec<ProviderSearchResult>>;

    /// Fetch an entry by its provider-local id
    async fn get(&self, provider_id: &str) -> Result<ProviderAnime>;

    /// Lazily produce server candidates; consumers may stop early.
    async fn episode_streams(&self, params: &EpisodeStreamsParams) -> Result<BoxStream<'static, Server>>;
}

fn normalize_title(title: &str) -> String {
    title
        .chars()
        .filter(|c| c.is_alphanumeric() || c.is_whitespace())
        .collect::<String>()
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
        .to_lowercase()
}

/// Pick the provider result whose title best matches `title`.
///
/// Each candidate is scored against the romaji and english titles; ties go
/// to the earlier candidate.
pub fn best_match<'a>(
    results: &'a [ProviderSearchResult],
    title: &MediaTitle,
) -> Option<&'a ProviderSearchResult> {
    let matcher = SkimMatcherV2::default().ignore_case();
    let targets: Vec<String> = [&title.romaji, &title.english]
        .into_iter()
        .flatten()
        .map(|t| normalize_title(t))
        .filter(|t| !t.is_empty())
        .collect();

    let score = |candidate: &ProviderSearchResult| -> i64 {
        let name = normalize_title(&candidate.title);
        targets
            .iter()
            .map(|target| {
                if *target == name {
                    return i64::MAX;
                }
                let forward = matcher.fuzzy_match(&name, target);
                let backward = matcher.fuzzy_match(target, &name);
                forward.max(backward).unwrap_or(i64::MIN)
            })
            .max()
            .unwrap_or(i64::MIN)
    };

    let mut best: Option<(&ProviderSearchResult, i64)> = None;
    for candidate in results {
        let candidate_score = score(candidate);
        match best {
            Some((_, best_score)) if candidate_score <= best_score => {}
            _ => best = Some((candidate, candidate_score)),
        }
    }

    best.map(|(candidate, _)| candidate)
}
