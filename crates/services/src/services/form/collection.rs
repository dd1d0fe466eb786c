use utils::state_path;

pub const DEFAULT_COLLECTION: &str = "default";

/// The base collection: the field's override, or [`DEFAULT_COLLECTION`].
pub fn collection_base(override_name: Option<&str>) -> &str {
    override_name
        .filter(|name| !name.is_empty())
        .unwrap_or(DEFAULT_COLLECTION)
}

/// Media collection for a field instance. Root fields use the base name;
/// nested ones append their container path, so each repeated item stores its
/// media separately: `default.sections.0`.
pub fn collection_name(override_name: Option<&str>, path: &str) -> String {
    let base = collection_base(override_name);
    match state_path::parent_path(path) {
        Some(parent) => format!("{base}.{parent}"),
        None => base.to_string(),
    }
}
