//! Version and build time information

use chrono::{DateTime, Datelike, Utc};

use crate::built_info;

pub fn build_version() -> String {
    built_info::PKG_VERSION.to_string()
}

pub fn version_components() -> (i32, i32, i32) {
    (
        built_info::PKG_VERSION_MAJOR.parse().unwrap_or(0),
        built_info::PKG_VERSION_MINOR.parse().unwrap_or(0),
        built_info::PKG_VERSION_PATCH.parse().unwrap_or(0),
    )
}

/// Default INQUIRY revision, derived from the build year/month ("YYMM")
pub fn default_revision() -> String {
    let built = DateTime::parse_from_rfc2822(built_info::BUILT_TIME_UTC)
        .map(|dt| dt.with_timezone(&Utc))
        .unwrap_or_else(|_| Utc::now());

    format!("{:02}{:02}", built.year() % 100, built.month())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn revision_is_four_digits() {
        let rev = default_revision();
        assert_eq!(rev.len(), 4);
        assert!(rev.chars().all(|c| c.is_ascii_digit()));
    }
}
