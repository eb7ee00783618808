use chrono::{Datelike, NaiveDate};
use scraper::{Html, Selector};
use thiserror::Error;

/// Listing pages interleave section-divider rows with real episode links.
const SEPARATOR_PREFIX: &str = "======";

/// Anchors carrying episode titles inside the listing region.
const EPISODE_ANCHOR_SELECTOR: &str =
    r#"div.items.sizing a[rel="nofollow noopener noreferrer"]"#;

#[derive(Debug, Error)]
#[error("no episode titles found on listing page")]
pub struct ListParseError;

/// Weekday inclusion set parsed from a `"0|2|4"` style pattern
/// (0 = Monday .. 6 = Sunday). An empty or junk-only pattern keeps
/// every weekday.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WeekdayPattern {
    days: [bool; 7],
}

impl WeekdayPattern {
    pub fn all() -> Self {
        WeekdayPattern { days: [true; 7] }
    }

    pub fn parse(pattern: &str) -> Self {
        let mut days = [false; 7];
        let mut any = false;
        for token in pattern.split('|') {
            if let Ok(day) = token.trim().parse::<usize>() {
                if day < 7 {
                    days[day] = true;
                    any = true;
                }
            }
        }
        if any {
            WeekdayPattern { days }
        } else {
            WeekdayPattern::all()
        }
    }

    pub fn contains(&self, weekday_from_monday: u32) -> bool {
        self.days
            .get(weekday_from_monday as usize)
            .copied()
            .unwrap_or(false)
    }
}

/// Pulls the anchor texts out of the listing region of a page.
pub fn anchor_texts(html: &str) -> Vec<String> {
    let doc = Html::parse_document(html);
    let selector = Selector::parse(EPISODE_ANCHOR_SELECTOR).expect("anchor selector");
    doc.select(&selector)
        .map(|el| el.text().collect::<String>().trim().to_string())
        .collect()
}

/// Filters anchor texts down to episode titles whose trailing `YYYYMMDD`
/// token parses and whose weekday is included in `pattern`. Order is
/// preserved; separator rows and undateable texts are silently dropped.
pub fn parse_titles(
    texts: &[String],
    pattern: &WeekdayPattern,
) -> Result<Vec<String>, ListParseError> {
    let mut titles = Vec::new();
    for text in texts {
        if text.starts_with(SEPARATOR_PREFIX) {
            continue;
        }
        let Some(token) = date_token(text) else {
            continue;
        };
        let Ok(date) = NaiveDate::parse_from_str(token, "%Y%m%d") else {
            continue;
        };
        if !pattern.contains(date.weekday().num_days_from_monday()) {
            continue;
        }
        titles.push(text.clone());
    }
    if titles.is_empty() {
        return Err(ListParseError);
    }
    Ok(titles)
}

/// The trailing whitespace-delimited token of a title, expected to be the
/// episode date.
pub fn date_token(title: &str) -> Option<&str> {
    title.split_whitespace().last()
}

/// The title with its trailing date token stripped; used as the
/// subscription's display name and output folder.
pub fn display_name(title: &str) -> &str {
    match title.rfind(' ') {
        Some(pos) => &title[..pos],
        None => title,
    }
}
