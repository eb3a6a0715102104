//! Field normalization shared by upstream mappers.

use std::collections::HashMap;

use once_cell::sync::Lazy;
use time::OffsetDateTime;
use time::macros::format_description;

static CODES: Lazy<HashMap<&'static str, &'static str>> = Lazy::new(|| {
    HashMap::from([
        ("English", "eng"),
        ("French", "fra"),
        ("Spanish", "spa"),
        ("German", "deu"),
        ("Italian", "ita"),
        ("Danish", "dan"),
        ("Dutch", "nld"),
        ("Japanese", "jpn"),
        ("Icelandic", "isl"),
        ("Chinese", "zho"),
        ("Russian", "rus"),
        ("Polish", "pol"),
        ("Vietnamese", "vie"),
        ("Swedish", "swe"),
        ("Norwegian", "nor"),
        ("Norwegian Bokmal", "nob"),
        ("Finnish", "fin"),
        ("Turkish", "tur"),
        ("Portuguese", "por"),
        ("Greek", "ell"),
        ("Korean", "kor"),
        ("Hungarian", "hun"),
        ("Hebrew", "heb"),
        ("Czech", "ces"),
        ("Hindi", "hin"),
        ("Thai", "tha"),
        ("Bulgarian", "bul"),
        ("Romanian", "ron"),
        ("Arabic", "ara"),
        ("Ukrainian", "ukr"),
    ])
});

/// Map an upstream language name to its ISO 639-3 code. Unknown names pass
/// through unchanged.
pub fn iso639_3(name: &str) -> &str {
    CODES.get(name).copied().unwrap_or(name)
}

/// Format an upstream millisecond timestamp the way the client expects.
/// Timestamps outside years 1..=9999 map to the empty string.
pub fn release_date(millis: i64) -> String {
    let Ok(ts) = OffsetDateTime::from_unix_timestamp_nanos(i128::from(millis) * 1_000_000) else {
        return String::new();
    };

    let year = ts.year();
    if !(1..=9999).contains(&year) {
        return String::new();
    }

    let format = format_description!("[year]-[month]-[day] [hour]:[minute]:[second]");
    ts.format(&format).unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn known_languages_map_to_codes() {
        assert_eq!(iso639_3("English"), "eng");
        assert_eq!(iso639_3("French"), "fra");
    }

    #[test]
    fn unknown_languages_pass_through() {
        assert_eq!(iso639_3("Klingon"), "Klingon");
        assert_eq!(iso639_3(""), "");
    }

    #[test]
    fn release_date_formats_millis() {
        assert_eq!(release_date(715_935_600_000), "1992-09-08 07:00:00");
        assert_eq!(release_date(0), "1970-01-01 00:00:00");
    }

    #[test]
    fn out_of_range_timestamps_map_to_empty() {
        // Before year 1.
        assert_eq!(release_date(-77_000_000_000_000), "");
        // After year 9999.
        assert_eq!(release_date(300_000_000_000_000), "");
    }
}
