//! Declarative filter, sort and pagination over metadata snapshots.
//!
//! Filtering always precedes sorting, which always precedes pagination.

use crate::models::{MediaFormat, MediaItem, MediaStatus, MediaType};
use anyhow::anyhow;
use chrono::{Datelike, NaiveDate};
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::collections::HashSet;

/// Default page size
pub const DEFAULT_PER_PAGE: usize = 15;

/// Airing season
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum MediaSeason {
    Winter,
    Spring,
    Summer,
    Fall,
}

impl MediaSeason {
    /// Inclusive `MMDD` bounds of the season
    fn month_day_range(self) -> (u32, u32) {
        match self {
            MediaSeason::Winter => (101, 331),
            MediaSeason::Spring => (401, 630),
            MediaSeason::Summer => (701, 930),
            MediaSeason::Fall => (1001, 1231),
        }
    }
}

impl std::str::FromStr for MediaSeason {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_uppercase().as_str() {
            "WINTER" => Ok(MediaSeason::Winter),
            "SPRING" => Ok(MediaSeason::Spring),
            "SUMMER" => Ok(MediaSeason::Summer),
            "FALL" | "AUTUMN" => Ok(MediaSeason::Fall),
            _ => Err(anyhow!("Invalid season: {}", s)),
        }
    }
}

/// Field a result set can be ordered by
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SortField {
    Id,
    Popularity,
    Score,
    Favourites,
    TitleRomaji,
    TitleEnglish,
    StartDate,
}

/// One sort key with its direction
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MediaSort {
    pub field: SortField,
    pub descending: bool,
}

impl MediaSort {
    pub fn asc(field: SortField) -> Self {
        Self {
            field,
            descending: false,
        }
    }

    pub fn desc(field: SortField) -> Self {
        Self {
            field,
            descending: true,
        }
    }
}

impl std::str::FromStr for MediaSort {
    type Err = anyhow::Error;

    /// Parses names like `SCORE`, `SCORE_DESC`, `title_romaji`
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let upper = s.trim().to_uppercase();
        let (name, descending) = match upper.strip_suffix("_DESC") {
            Some(name) => (name, true),
            None => (upper.as_str(), false),
        };

        let field = match name {
            "ID" => SortField::Id,
            "POPULARITY" => SortField::Popularity,
            "SCORE" => SortField::Score,
            "FAVOURITES" | "FAVORITES" => SortField::Favourites,
            "TITLE_ROMAJI" => SortField::TitleRomaji,
            "TITLE_ENGLISH" => SortField::TitleEnglish,
            "START_DATE" => SortField::StartDate,
            _ => return Err(anyhow!("Unknown sort parameter: {}", s)),
        };

        Ok(Self { field, descending })
    }
}

/// Filter, sort and page criteria. Every filter is optional; set filters
/// are combined conjunctively.
#[derive(Debug, Clone)]
pub struct MediaSearchParams {
    /// Case-insensitive substring over titles, synonyms and description
    pub query: Option<String>,
    pub id_in: Vec<i64>,

    pub genre_in: Vec<String>,
    pub genre_not_in: Vec<String>,
    pub tag_in: Vec<String>,
    pub tag_not_in: Vec<String>,

    pub status: Option<MediaStatus>,
    pub status_in: Vec<MediaStatus>,
    pub status_not_in: Vec<MediaStatus>,
    pub format_in: Vec<MediaFormat>,
    pub media_type: Option<MediaType>,

    pub popularity_greater: Option<u64>,
    pub popularity_lesser: Option<u64>,
    pub average_score_greater: Option<f64>,
    pub average_score_lesser: Option<f64>,

    /// Inclusive `YYYYMMDD` lower bound on the start date
    pub start_date_greater: Option<u32>,
    /// Inclusive `YYYYMMDD` upper bound on the start date
    pub start_date_lesser: Option<u32>,
    pub season: Option<MediaSeason>,
    pub season_year: Option<i32>,

    /// First key is primary
    pub sort: Vec<MediaSort>,

    /// 1-based page number
    pub page: usize,
    pub per_page: usize,
}

impl Default for MediaSearchParams {
    fn default() -> Self {
        Self {
            query: None,
            id_in: Vec::new(),
            genre_in: Vec::new(),
            genre_not_in: Vec::new(),
            tag_in: Vec::new(),
            tag_not_in: Vec::new(),
            status: None,
            status_in: Vec::new(),
            status_not_in: Vec::new(),
            format_in: Vec::new(),
            media_type: None,
            popularity_greater: None,
            popularity_lesser: None,
            average_score_greater: None,
            average_score_lesser: None,
            start_date_greater: None,
            start_date_lesser: None,
            season: None,
            season_year: None,
            sort: Vec::new(),
            page: 1,
            per_page: DEFAULT_PER_PAGE,
        }
    }
}

/// Pagination summary
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PageInfo {
    /// Matches before pagination
    pub total: usize,
    pub current_page: usize,
    pub per_page: usize,
    pub has_next_page: bool,
}

/// One page of search results
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MediaSearchResult {
    pub page_info: PageInfo,
    pub media: Vec<MediaItem>,
}

pub struct MediaFilter;

impl MediaFilter {
    /// Filter, sort and return the requested page
    pub fn apply(items: Vec<MediaItem>, params: &MediaSearchParams) -> Vec<MediaItem> {
        Self::search(items, params).media
    }

    /// Like [`MediaFilter::apply`] but also reports the page info
    pub fn search(items: Vec<MediaItem>, params: &MediaSearchParams) -> MediaSearchResult {
        let mut matched: Vec<MediaItem> = items
            .into_iter()
            .filter(|item| Self::matches(item, params))
            .collect();

        if !params.sort.is_empty() {
            matched.sort_by(|a, b| compare_by_keys(a, b, &params.sort));
        }

        let total = matched.len();
        let page = params.page.max(1);
        let per_page = params.per_page.max(1);
        let start = (page - 1).saturating_mul(per_page);

        let media: Vec<MediaItem> = matched.into_iter().skip(start).take(per_page).collect();

        MediaSearchResult {
            page_info: PageInfo {
                total,
                current_page: page,
                per_page,
                has_next_page: start.saturating_add(per_page) < total,
            },
            media,
        }
    }

    fn matches(item: &MediaItem, params: &MediaSearchParams) -> bool {
        if let Some(query) = params.query.as_deref().filter(|q| !q.is_empty()) {
            if !matches_query(item, &query.to_lowercase()) {
                return false;
            }
        }

        if !params.id_in.is_empty() && !params.id_in.contains(&item.id) {
            return false;
        }

        if !params.genre_in.is_empty() && !any_in(item.genres.iter(), &params.genre_in) {
            return false;
        }
        if !params.genre_not_in.is_empty() && any_in(item.genres.iter(), &params.genre_not_in) {
            return false;
        }

        let tag_names = || item.tags.iter().map(|t| &t.name);
        if !params.tag_in.is_empty() && !any_in(tag_names(), &params.tag_in) {
            return false;
        }
        if !params.tag_not_in.is_empty() && any_in(tag_names(), &params.tag_not_in) {
            return false;
        }

        let mut wanted_status: Vec<MediaStatus> = params.status_in.clone();
        wanted_status.extend(params.status);
        if !wanted_status.is_empty() {
            match item.status {
                Some(status) if wanted_status.contains(&status) => {}
                _ => return false,
            }
        }
        if !params.status_not_in.is_empty() {
            match item.status {
                Some(status) if !params.status_not_in.contains(&status) => {}
                _ => return false,
            }
        }

        if !params.format_in.is_empty() {
            match item.format {
                Some(format) if params.format_in.contains(&format) => {}
                _ => return false,
            }
        }
        if let Some(media_type) = params.media_type {
            if item.media_type != media_type {
                return false;
            }
        }

        if !strictly_between(item.popularity, params.popularity_greater, params.popularity_lesser) {
            return false;
        }
        if !strictly_between(
            item.average_score,
            params.average_score_greater,
            params.average_score_lesser,
        ) {
            return false;
        }

        let (date_from, date_to) = effective_date_bounds(params);
        if date_from.is_some() || date_to.is_some() {
            let Some(start) = item.start_date.map(date_key) else {
                return false;
            };
            if date_from.is_some_and(|from| start < from) || date_to.is_some_and(|to| start > to) {
                return false;
            }
        }

        true
    }
}

fn matches_query(item: &MediaItem, query_lower: &str) -> bool {
    let contains = |s: &str| s.to_lowercase().contains(query_lower);

    [&item.title.romaji, &item.title.english, &item.title.native]
        .into_iter()
        .flatten()
        .any(|t| contains(t))
        || item.description.as_deref().is_some_and(contains)
        || item.synonyms.iter().any(|s| contains(s))
}

/// Whether any of `values` appears in `wanted`, case-insensitively
fn any_in<'a>(mut values: impl Iterator<Item = &'a String>, wanted: &[String]) -> bool {
    let wanted: HashSet<String> = wanted.iter().map(|w| w.to_lowercase()).collect();
    values.any(|v| wanted.contains(&v.to_lowercase()))
}

/// Strict range check; a missing value fails any set bound
fn strictly_between<T: PartialOrd + Copy>(value: Option<T>, greater: Option<T>, lesser: Option<T>) -> bool {
    if greater.is_none() && lesser.is_none() {
        return true;
    }
    let Some(value) = value else {
        return false;
    };
    greater.map_or(true, |g| value > g) && lesser.map_or(true, |l| value < l)
}

/// Start-date bounds after folding in season + year, keeping the stricter bound
fn effective_date_bounds(params: &MediaSearchParams) -> (Option<u32>, Option<u32>) {
    let mut from = params.start_date_greater;
    let mut to = params.start_date_lesser;

    if let (Some(season), Some(year)) = (params.season, params.season_year) {
        if year >= 0 {
            let (start_md, end_md) = season.month_day_range();
            let season_start = year as u32 * 10_000 + start_md;
            let season_end = year as u32 * 10_000 + end_md;
            from = Some(from.map_or(season_start, |f| f.max(season_start)));
            to = Some(to.map_or(season_end, |t| t.min(season_end)));
        }
    }

    (from, to)
}

/// `YYYYMMDD` integer for a date
fn date_key(date: NaiveDate) -> u32 {
    date.year().max(0) as u32 * 10_000 + date.month() * 100 + date.day()
}

fn compare_by_keys(a: &MediaItem, b: &MediaItem, keys: &[MediaSort]) -> Ordering {
    keys.iter()
        .map(|key| compare_by(a, b, *key))
        .find(|ord| *ord != Ordering::Equal)
        .unwrap_or(Ordering::Equal)
}

fn compare_by(a: &MediaItem, b: &MediaItem, key: MediaSort) -> Ordering {
    let lower = |s: &Option<String>| s.as_ref().map(|v| v.to_lowercase());

    match key.field {
        SortField::Id => missing_first(Some(a.id), Some(b.id), key.descending, Ord::cmp),
        SortField::Popularity => missing_first(a.popularity, b.popularity, key.descending, Ord::cmp),
        SortField::Score => {
            missing_first(a.average_score, b.average_score, key.descending, |x, y| x.total_cmp(y))
        }
        SortField::Favourites => missing_first(a.favourites, b.favourites, key.descending, Ord::cmp),
        SortField::TitleRomaji => missing_first(
            lower(&a.title.romaji),
            lower(&b.title.romaji),
            key.descending,
            Ord::cmp,
        ),
        SortField::TitleEnglish => missing_first(
            lower(&a.title.english),
            lower(&b.title.english),
            key.descending,
            Ord::cmp,
        ),
        SortField::StartDate => missing_first(a.start_date, b.start_date, key.descending, Ord::cmp),
    }
}

/// Missing values sort first in either direction
fn missing_first<T>(
    a: Option<T>,
    b: Option<T>,
    descending: bool,
    cmp: impl Fn(&T, &T) -> Ordering,
) -> Ordering {
    match (a, b) {
        (None, None) => Ordering::Equal,
        (None, Some(_)) => Ordering::Less,
        (Some(_), None) => Ordering::Greater,
        (Some(x), Some(y)) => {
            let ord = cmp(&x, &y);
            if descending {
                ord.reverse()
            } else {
                ord
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::MediaTag;

    fn item(id: i64, title: &str) -> MediaItem {
        MediaItem::new(id, title)
    }

    fn sample() -> Vec<MediaItem> {
        let mut a = item(1, "Frieren");
        a.genres = vec!["Adventure".into(), "Fantasy".into()];
        a.average_score = Some(91.0);
        a.popularity = Some(500);
        a.status = Some(MediaStatus::Finished);
        a.format = Some(MediaFormat::Tv);
        a.start_date = NaiveDate::from_ymd_opt(2023, 9, 29);

        let mut b = item(2, "Dungeon Meshi");
        b.genres = vec!["Comedy".into(), "Fantasy".into()];
        b.average_score = Some(85.0);
        b.popularity = Some(300);
        b.status = Some(MediaStatus::Releasing);
        b.format = Some(MediaFormat::Tv);
        b.start_date = NaiveDate::from_ymd_opt(2024, 1, 4);
        b.tags = vec![MediaTag {
            name: "Cooking".into(),
            rank: Some(90),
        }];

        let mut c = item(3, "Blue Lock");
        c.genres = vec!["Sports".into()];
        c.popularity = Some(800);
        c.format = Some(MediaFormat::Movie);
        c.synonyms = vec!["Buru Rokku".into()];

        vec![a, b, c]
    }

    fn ids(items: &[MediaItem]) -> Vec<i64> {
        items.iter().map(|i| i.id).collect()
    }

    #[test]
    fn test_query_matches_titles_and_synonyms() {
        let params = MediaSearchParams {
            query: Some("rokku".into()),
            ..Default::default()
        };
        assert_eq!(ids(&MediaFilter::apply(sample(), &params)), vec![3]);

        let params = MediaSearchParams {
            query: Some("FRIEREN".into()),
            ..Default::default()
        };
        assert_eq!(ids(&MediaFilter::apply(sample(), &params)), vec![1]);
    }

    #[test]
    fn test_genre_and_tag_filters_are_case_insensitive() {
        let params = MediaSearchParams {
            genre_in: vec!["fantasy".into()],
            genre_not_in: vec!["COMEDY".into()],
            ..Default::default()
        };
        assert_eq!(ids(&MediaFilter::apply(sample(), &params)), vec![1]);

        let params = MediaSearchParams {
            tag_in: vec!["cooking".into()],
            ..Default::default()
        };
        assert_eq!(ids(&MediaFilter::apply(sample(), &params)), vec![2]);
    }

    #[test]
    fn test_numeric_bounds_are_strict_and_drop_missing() {
        let params = MediaSearchParams {
            average_score_greater: Some(85.0),
            ..Default::default()
        };
        assert_eq!(ids(&MediaFilter::apply(sample(), &params)), vec![1]);

        let params = MediaSearchParams {
            popularity_lesser: Some(800),
            status_in: vec![MediaStatus::Finished, MediaStatus::Releasing],
            ..Default::default()
        };
        assert_eq!(ids(&MediaFilter::apply(sample(), &params)), vec![1, 2]);
    }

    #[test]
    fn test_season_narrows_date_range() {
        let params = MediaSearchParams {
            season: Some(MediaSeason::Winter),
            season_year: Some(2024),
            ..Default::default()
        };
        assert_eq!(ids(&MediaFilter::apply(sample(), &params)), vec![2]);

        let params = MediaSearchParams {
            start_date_greater: Some(20230929),
            start_date_lesser: Some(20231231),
            ..Default::default()
        };
        assert_eq!(ids(&MediaFilter::apply(sample(), &params)), vec![1]);
    }

    #[test]
    fn test_sort_missing_values_first_in_both_directions() {
        let params = MediaSearchParams {
            sort: vec![MediaSort::desc(SortField::Score)],
            ..Default::default()
        };
        assert_eq!(ids(&MediaFilter::apply(sample(), &params)), vec![3, 1, 2]);

        let params = MediaSearchParams {
            sort: vec!["SCORE".parse().unwrap()],
            ..Default::default()
        };
        assert_eq!(ids(&MediaFilter::apply(sample(), &params)), vec![3, 2, 1]);
    }

    #[test]
    fn test_secondary_sort_key_breaks_ties() {
        let mut items = sample();
        for i in &mut items {
            i.format = Some(MediaFormat::Tv);
            i.popularity = Some(100);
        }
        let params = MediaSearchParams {
            sort: vec![
                MediaSort::desc(SortField::Popularity),
                MediaSort::asc(SortField::TitleEnglish),
            ],
            ..Default::default()
        };
        assert_eq!(ids(&MediaFilter::apply(items, &params)), vec![3, 2, 1]);
    }

    #[test]
    fn test_pagination_reports_total() {
        let params = MediaSearchParams {
            sort: vec![MediaSort::asc(SortField::Id)],
            page: 2,
            per_page: 2,
            ..Default::default()
        };
        let result = MediaFilter::search(sample(), &params);
        assert_eq!(ids(&result.media), vec![3]);
        assert_eq!(result.page_info.total, 3);
        assert!(!result.page_info.has_next_page);

        let first = MediaFilter::search(
            sample(),
            &MediaSearchParams {
                per_page: 2,
                ..Default::default()
            },
        );
        assert!(first.page_info.has_next_page);
        assert_eq!(MediaSearchParams::default().per_page, 15);
    }

    #[test]
    fn test_sort_parsing() {
        assert_eq!(
            "title_romaji_desc".parse::<MediaSort>().unwrap(),
            MediaSort::desc(SortField::TitleRomaji)
        );
        assert!("RANDOM".parse::<MediaSort>().is_err());
        assert_eq!("autumn".parse::<MediaSeason>().unwrap(), MediaSeason::Fall);
    }
}
