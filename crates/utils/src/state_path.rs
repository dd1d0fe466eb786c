//! Helpers for dotted form state paths such as `sections.0.items.1.image`.

/// Segment that stands in for the item index of a repeatable group's
/// "add new item" template. Never corresponds to stored data.
pub const TEMPLATE_MARKER: &str = "__TEMPLATE__";

pub const SEPARATOR: &str = ".";

/// Join a parent path and a field key, omitting the separator at the root.
pub fn compose_path(parent: Option<&str>, key: &str) -> String {
    match parent {
        Some(parent) if !parent.is_empty() => format!("{parent}{SEPARATOR}{key}"),
        _ => key.to_string(),
    }
}

/// Every segment but the last, or `None` for a single-segment path.
pub fn parent_path(path: &str) -> Option<&str> {
    path.rsplit_once(SEPARATOR).map(|(parent, _)| parent)
}

/// The last segment of the path.
pub fn field_name(path: &str) -> &str {
    path.rsplit_once(SEPARATOR)
        .map(|(_, name)| name)
        .unwrap_or(path)
}

pub fn segments(path: &str) -> impl Iterator<Item = &str> {
    path.split(SEPARATOR).filter(|segment| !segment.is_empty())
}

/// True iff any segment equals [`TEMPLATE_MARKER`].
pub fn is_template_state_path(path: &str) -> bool {
    path.split(SEPARATOR).any(|segment| segment == TEMPLATE_MARKER)
}

/// Drop the template marker segments and rejoin what remains.
pub fn clean_state_path(path: &str) -> String {
    path.split(SEPARATOR)
        .filter(|segment| *segment != TEMPLATE_MARKER)
        .collect::<Vec<_>>()
        .join(SEPARATOR)
}

/// Replace the last segment with [`TEMPLATE_MARKER`]. Used for the item
/// prefix of a repeatable group's template row (`sections.3` -> `sections.__TEMPLATE__`).
pub fn with_template_marker(path: &str) -> String {
    match parent_path(path) {
        Some(parent) => compose_path(Some(parent), TEMPLATE_MARKER),
        None => TEMPLATE_MARKER.to_string(),
    }
}

/// Whether a segment addresses an item of a repeated group.
pub fn is_index_segment(segment: &str) -> bool {
    !segment.is_empty() && segment.bytes().all(|b| b.is_ascii_digit())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn compose_omits_separator_at_root() {
        assert_eq!(compose_path(None, "avatar"), "avatar");
        assert_eq!(compose_path(Some(""), "avatar"), "avatar");
        assert_eq!(compose_path(Some("sections.0"), "image"), "sections.0.image");
    }

    #[test]
    fn parent_and_field_name_split_the_path() {
        let path = "sections.0.items.1.image";
        assert_eq!(parent_path(path), Some("sections.0.items.1"));
        assert_eq!(field_name(path), "image");
        assert_eq!(
            format!("{}.{}", parent_path(path).unwrap(), field_name(path)),
            path
        );

        assert_eq!(parent_path("avatar"), None);
        assert_eq!(field_name("avatar"), "avatar");
    }

    #[test]
    fn template_detection_matches_whole_segments_only() {
        assert!(is_template_state_path("sections.__TEMPLATE__.image"));
        assert!(is_template_state_path("__TEMPLATE__"));
        assert!(!is_template_state_path("sections.0.image"));
        assert!(!is_template_state_path("sections.x__TEMPLATE__.image"));
    }

    #[test]
    fn clean_removes_marker_segments() {
        assert_eq!(clean_state_path("sections.__TEMPLATE__.image"), "sections.image");
        assert_eq!(clean_state_path("sections.0.image"), "sections.0.image");
        assert_eq!(clean_state_path("__TEMPLATE__.title"), "title");
    }

    #[test]
    fn template_marker_replaces_last_segment() {
        assert_eq!(with_template_marker("sections.3"), "sections.__TEMPLATE__");
        assert_eq!(with_template_marker("seo"), "__TEMPLATE__");
    }

    #[test]
    fn index_segments() {
        assert!(is_index_segment("0"));
        assert!(is_index_segment("12"));
        assert!(!is_index_segment(""));
        assert!(!is_index_segment("1a"));
        assert!(!is_index_segment("*"));
    }
}
