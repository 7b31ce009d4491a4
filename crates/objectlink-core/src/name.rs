//! Dotted identifier helpers.
//!
//! Linkable objects are addressed as `module.Interface`; their properties,
//! methods and signals as `module.Interface/member`. The protocol treats
//! both as opaque beyond this structural rule.

/// Returns the object part of an identifier (everything before the first
/// `/`, or the whole identifier when there is none).
pub fn resource_of(id: &str) -> &str {
    match id.split_once('/') {
        Some((resource, _)) => resource,
        None => id,
    }
}

/// Returns the member part of an identifier (everything after the first
/// `/`, or empty when there is none).
pub fn member_of(id: &str) -> &str {
    match id.split_once('/') {
        Some((_, member)) => member,
        None => "",
    }
}
