//! Jikan v4 response types and their mapping onto [`MediaItem`].

use chrono::{DateTime, NaiveDate};
use serde::Deserialize;
use shared::{MediaFormat, MediaItem, MediaStatus, MediaTag, MediaTitle, MediaType};

/// Wrapper of single-object endpoints
#[derive(Debug, Clone, Deserialize)]
pub struct DataResponse<T> {
    pub data: T,
}

/// Wrapper of list endpoints
#[derive(Debug, Clone, Deserialize)]
pub struct PaginatedResponse<T> {
    pub data: Vec<T>,
    #[serde(default)]
    pub pagination: Option<Pagination>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Pagination {
    pub last_visible_page: u32,
    pub has_next_page: bool,
}

#[derive(Debug, Clone, Deserialize)]
pub struct AnimeEntry {
    pub mal_id: i64,
    #[serde(default)]
    pub images: Option<AnimeImages>,

    pub title: String,
    #[serde(default)]
    pub title_english: Option<String>,
    #[serde(default)]
    pub title_japanese: Option<String>,
    #[serde(default)]
    pub title_synonyms: Vec<String>,

    #[serde(rename = "type", default)]
    pub anime_type: Option<String>,
    #[serde(default)]
    pub episodes: Option<u32>,
    #[serde(default)]
    pub status: Option<String>,
    #[serde(default)]
    pub aired: Option<Aired>,
    /// e.g. "24 min per ep", "1 hr 45 min"
    #[serde(default)]
    pub duration: Option<String>,

    #[serde(default)]
    pub score: Option<f64>,
    #[serde(default)]
    pub members: Option<u64>,
    #[serde(default)]
    pub favorites: Option<u64>,
    #[serde(default)]
    pub synopsis: Option<String>,

    #[serde(default)]
    pub studios: Vec<MalEntity>,
    #[serde(default)]
    pub genres: Vec<MalEntity>,
    #[serde(default)]
    pub themes: Vec<MalEntity>,
    #[serde(default)]
    pub demographics: Vec<MalEntity>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct AnimeImages {
    pub jpg: ImageSet,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ImageSet {
    #[serde(default)]
    pub image_url: Option<String>,
    #[serde(default)]
    pub large_image_url: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Aired {
    /// RFC 3339 timestamps
    #[serde(default)]
    pub from: Option<String>,
    #[serde(default)]
    pub to: Option<String>,
}

/// Genre, theme, studio...
#[derive(Debug, Clone, Deserialize)]
pub struct MalEntity {
    pub mal_id: i64,
    pub name: String,
}

fn parse_status(status: &str) -> Option<MediaStatus> {
    match status {
        "Finished Airing" => Some(MediaStatus::Finished),
        "Currently Airing" => Some(MediaStatus::Releasing),
        "Not yet aired" => Some(MediaStatus::NotYetReleased),
        _ => None,
    }
}

fn parse_format(anime_type: &str) -> Option<MediaFormat> {
    match anime_type {
        "TV" => Some(MediaFormat::Tv),
        "Movie" => Some(MediaFormat::Movie),
        "OVA" => Some(MediaFormat::Ova),
        "ONA" => Some(MediaFormat::Ona),
        "Special" | "TV Special" => Some(MediaFormat::Special),
        "Music" => Some(MediaFormat::Music),
        _ => None,
    }
}

fn parse_date(value: &str) -> Option<NaiveDate> {
    DateTime::parse_from_rfc3339(value)
        .ok()
        .map(|dt| dt.date_naive())
}

/// Minutes from strings like "24 min per ep" or "1 hr 45 min"
fn parse_duration_minutes(duration: &str) -> Option<u32> {
    let mut minutes = 0;
    let mut found = false;
    let mut tokens = duration.split_whitespace().peekable();

    while let Some(token) = tokens.next() {
        let Ok(value) = token.parse::<u32>() else {
            continue;
        };
        match tokens.peek().copied() {
            Some("hr") | Some("hr.") => minutes += value * 60,
            Some("min") | Some("min.") => minutes += value,
            _ => continue,
        }
        found = true;
    }

    found.then_some(minutes)
}

impl From<AnimeEntry> for MediaItem {
    fn from(entry: AnimeEntry) -> Self {
        let cover_image = entry
            .images
            .and_then(|images| images.jpg.large_image_url.or(images.jpg.image_url));
        let (start_date, end_date) = match &entry.aired {
            Some(aired) => (
                aired.from.as_deref().and_then(parse_date),
                aired.to.as_deref().and_then(parse_date),
            ),
            None => (None, None),
        };

        let tags = entry
            .themes
            .iter()
            .chain(entry.demographics.iter())
            .map(|e| MediaTag {
                name: e.name.clone(),
                rank: None,
            })
            .collect();

        MediaItem {
            id: entry.mal_id,
            id_mal: Some(entry.mal_id),
            title: MediaTitle {
                romaji: Some(entry.title),
                english: entry.title_english,
                native: entry.title_japanese,
            },
            media_type: MediaType::Anime,
            status: entry.status.as_deref().and_then(parse_status),
            format: entry.anime_type.as_deref().and_then(parse_format),
            description: entry.synopsis,
            cover_image,
            episodes: entry.episodes,
            duration: entry.duration.as_deref().and_then(parse_duration_minutes),
            genres: entry.genres.into_iter().map(|g| g.name).collect(),
            tags,
            studios: entry.studios.into_iter().map(|s| s.name).collect(),
            synonyms: entry.title_synonyms,
            // Jikan scores are out of 10
            average_score: entry.score.map(|s| (s * 10.0).round()),
            popularity: entry.members,
            favourites: entry.favorites,
            start_date,
            end_date,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const FRIEREN: &str = r#"{
        "data": {
            "mal_id": 52991,
            "url": "https://myanimelist.net/anime/52991",
            "images": {"jpg": {"image_url": "https://cdn/s.jpg", "large_image_url": "https://cdn/l.jpg"}},
            "title": "Sousou no Frieren",
            "title_english": "Frieren: Beyond Journey's End",
            "title_japanese": "葬送のフリーレン",
            "title_synonyms": ["Frieren at the Funeral"],
            "type": "TV",
            "episodes": 28,
            "status": "Finished Airing",
            "airing": false,
            "aired": {"from": "2023-09-29T00:00:00+00:00", "to": "2024-03-22T00:00:00+00:00"},
            "duration": "24 min per ep",
            "score": 9.31,
            "members": 1000000,
            "favorites": 60000,
            "synopsis": "An elf mage...",
            "studios": [{"mal_id": 11, "type": "anime", "name": "Madhouse", "url": "x"}],
            "genres": [{"mal_id": 2, "type": "anime", "name": "Adventure", "url": "x"}],
            "themes": [],
            "demographics": [{"mal_id": 27, "type": "anime", "name": "Shounen", "url": "x"}]
        }
    }"#;

    #[test]
    fn test_anime_entry_to_media_item() {
        let response: DataResponse<AnimeEntry> = serde_json::from_str(FRIEREN).unwrap();
        let item = MediaItem::from(response.data);

        assert_eq!(item.id, 52991);
        assert_eq!(item.title.romaji.as_deref(), Some("Sousou no Frieren"));
        assert_eq!(item.format, Some(MediaFormat::Tv));
        assert_eq!(item.status, Some(MediaStatus::Finished));
        assert_eq!(item.episodes, Some(28));
        assert_eq!(item.duration, Some(24));
        assert_eq!(item.average_score, Some(93.0));
        assert_eq!(item.start_date, NaiveDate::from_ymd_opt(2023, 9, 29));
        assert_eq!(item.cover_image.as_deref(), Some("https://cdn/l.jpg"));
        assert_eq!(item.genres, vec!["Adventure"]);
        assert_eq!(item.studios, vec!["Madhouse"]);
        assert_eq!(item.tags[0].name, "Shounen");
    }

    #[test]
    fn test_sparse_entry() {
        let entry: AnimeEntry =
            serde_json::from_str(r#"{"mal_id": 1, "title": "Untitled", "type": null}"#).unwrap();
        let item = MediaItem::from(entry);

        assert_eq!(item.display_title(), "Untitled");
        assert!(item.format.is_none());
        assert!(item.start_date.is_none());
    }

    #[test]
    fn test_parse_duration() {
        assert_eq!(parse_duration_minutes("24 min per ep"), Some(24));
        assert_eq!(parse_duration_minutes("1 hr 45 min"), Some(105));
        assert_eq!(parse_duration_minutes("Unknown"), None);
    }
}
