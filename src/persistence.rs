//! JSON output for scraped listings and harvested proxies

use crate::error::PersistError;
use crate::proxy::models::ValidatedProxy;
use crate::session::collaborators::ListingRecord;
use crate::session::machine::SessionResult;
use chrono::Local;
use serde::Serialize;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::info;

const MAX_SAFE_QUERY_LEN: usize = 30;

#[derive(Serialize)]
struct ListingFile<'a> {
    search_query: String,
    timestamp: String,
    count: usize,
    businesses: &'a [ListingRecord],
}

#[derive(Serialize)]
struct ProxyFile<'a> {
    working_proxies: &'a [ValidatedProxy],
    blacklisted_proxies: &'a [ValidatedProxy],
    timestamp: String,
    country_filter: &'a str,
}

/// Query text reduced to a file-name-safe stem
pub fn safe_query(query: &str) -> String {
    query
        .chars()
        .map(|c| if c.is_alphanumeric() { c } else { '_' })
        .take(MAX_SAFE_QUERY_LEN)
        .collect()
}

fn timestamp() -> String {
    Local::now().format("%Y%m%d_%H%M%S").to_string()
}

fn write_json<T: Serialize>(path: &Path, value: &T) -> Result<(), PersistError> {
    let json = serde_json::to_string_pretty(value)?;
    fs::write(path, json).map_err(|source| PersistError::Io {
        path: path.to_path_buf(),
        source,
    })
}

fn ensure_dir(dir: &Path) -> Result<(), PersistError> {
    fs::create_dir_all(dir).map_err(|source| PersistError::Io {
        path: dir.to_path_buf(),
        source,
    })
}

/// Write a session's listings as `listings_<query>_<timestamp>.json`
///
/// Sessions without listings are not written.
pub fn save(result: &SessionResult, output_dir: &Path) -> Result<PathBuf, PersistError> {
    let search_query = result.query.full_text();
    if result.results.is_empty() {
        return Err(PersistError::Empty(search_query));
    }
    ensure_dir(output_dir)?;

    let stamp = timestamp();
    let path = output_dir.join(format!("listings_{}_{}.json", safe_query(&result.query.query), stamp));
    let file = ListingFile {
        search_query,
        timestamp: stamp,
        count: result.results.len(),
        businesses: &result.results,
    };
    write_json(&path, &file)?;

    info!(path = %path.display(), count = file.count, "saved listings");
    Ok(path)
}

/// Write harvested proxies as `working_proxies_<country>_<timestamp>.json`
pub fn save_proxies(
    working: &[ValidatedProxy],
    blacklisted: &[ValidatedProxy],
    country_filter: &str,
    output_dir: &Path,
) -> Result<PathBuf, PersistError> {
    if working.is_empty() {
        return Err(PersistError::Empty("working proxies".to_string()));
    }
    ensure_dir(output_dir)?;

    let stamp = timestamp();
    let path = output_dir.join(format!(
        "working_proxies_{}_{}.json",
        safe_query(country_filter).to_lowercase(),
        stamp
    ));
    let file = ProxyFile {
        working_proxies: working,
        blacklisted_proxies: blacklisted,
        timestamp: stamp,
        country_filter,
    };
    write_json(&path, &file)?;

    info!(path = %path.display(), count = working.len(), "saved working proxies");
    Ok(path)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::proxy::models::{AnonymityLevel, ProxyCandidate, ProxyType};
    use crate::proxy::parser::ProxyParser;
    use crate::session::machine::{SearchQuery, SessionStatus};
    use chrono::Local;
    use uuid::Uuid;

    fn session_result(records: Vec<ListingRecord>) -> SessionResult {
        SessionResult {
            session_id: Uuid::new_v4(),
            query: SearchQuery::new("coffee shops", Some("Portland".to_string())),
            status: SessionStatus::Done,
            results: records,
            reason: None,
            attempt_count: 1,
            proxies_used: 1,
            parse_failures: Vec::new(),
            history: Vec::new(),
            started_at: Local::now(),
            finished_at: Local::now(),
        }
    }

    #[test]
    fn test_safe_query() {
        assert_eq!(safe_query("coffee & tea"), "coffee___tea");
        assert_eq!(safe_query(&"x".repeat(50)).len(), 30);
    }

    #[test]
    fn test_save_writes_documented_structure() {
        let dir = tempfile::tempdir().unwrap();
        let mut first = ListingRecord::named("Blue Bottle");
        first.phone = "+1 503 555 0100".to_string();
        let result = session_result(vec![first, ListingRecord::named("Stumptown")]);

        let path = save(&result, dir.path()).unwrap();
        let file_name = path.file_name().unwrap().to_string_lossy().to_string();
        assert!(file_name.starts_with("listings_coffee_shops_"));

        let json: serde_json::Value = serde_json::from_str(&fs::read_to_string(&path).unwrap()).unwrap();
        assert_eq!(json["search_query"], "coffee shops Portland");
        assert_eq!(json["count"], 2);
        assert_eq!(json["businesses"][0]["name"], "Blue Bottle");
        assert_eq!(json["businesses"][0]["phone"], "+1 503 555 0100");
        assert_eq!(json["businesses"][1]["name"], "Stumptown");
        assert!(json["businesses"][1]["timestamp"].is_string());
    }

    #[test]
    fn test_save_skips_empty_results() {
        let dir = tempfile::tempdir().unwrap();
        assert!(matches!(
            save(&session_result(Vec::new()), dir.path()),
            Err(PersistError::Empty(_))
        ));
    }

    #[test]
    fn test_saved_proxies_load_back() {
        let dir = tempfile::tempdir().unwrap();
        let working = vec![ValidatedProxy::new(
            ProxyCandidate::new("1.2.3.4", 8080, ProxyType::Http).with_country("US"),
            42,
            AnonymityLevel::Elite,
        )];

        let path = save_proxies(&working, &[], "US", dir.path()).unwrap();
        assert!(path.to_string_lossy().contains("working_proxies_us_"));

        let loaded = ProxyParser::parse_file(&path, ProxyType::Http).unwrap();
        assert_eq!(loaded, vec![working[0].candidate.clone()]);
        assert_eq!(loaded[0].country.as_deref(), Some("US"));
    }

    #[test]
    fn test_country_label_cannot_escape_output_dir() {
        let dir = tempfile::tempdir().unwrap();
        let working = vec![ValidatedProxy::new(
            ProxyCandidate::new("1.2.3.4", 8080, ProxyType::Http),
            42,
            AnonymityLevel::Elite,
        )];

        let path = save_proxies(&working, &[], "../../etc/x", dir.path()).unwrap();
        assert_eq!(path.parent(), Some(dir.path()));
        let file_name = path.file_name().unwrap().to_string_lossy().to_string();
        assert!(file_name.starts_with("working_proxies_______etc_x_"));
        assert!(path.exists());
    }
}
