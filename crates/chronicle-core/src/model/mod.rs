//! Core data model: entities, events, relationships, and value helpers.

pub mod entity;
pub mod event;
pub mod relationship;
pub mod value;

pub use entity::{Entity, EntityId, CORE_FIELDS};
pub use event::{EventOp, EventRecord};
pub use relationship::{EdgeDirection, Relationship, RelationshipKey};

/// Normalize a namespace name for lookup: camelCase, as used by the facade's
/// name-indexed accessors (`blog-posts` and `blog_posts` both resolve to
/// `blogPosts`).
#[must_use]
pub fn normalize_namespace(name: &str) -> String {
    let mut out = String::with_capacity(name.len());
    let mut upper_next = false;
    for ch in name.chars() {
        if ch == '-' || ch == '_' || ch == ' ' {
            upper_next = !out.is_empty();
        } else if upper_next {
            out.extend(ch.to_uppercase());
            upper_next = false;
        } else {
            out.push(ch);
        }
    }
    // Leading character is lowercased so `BlogPosts` and `blogPosts` agree.
    let mut chars = out.chars();
    match chars.next() {
        Some(first) => first.to_lowercase().collect::<String>() + chars.as_str(),
        None => out,
    }
}

/// Lowercased namespace form used for path generation.
#[must_use]
pub fn namespace_path_segment(name: &str) -> String {
    normalize_namespace(name).to_lowercase()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_normalize_namespace() {
        assert_eq!(normalize_namespace("blog-posts"), "blogPosts");
        assert_eq!(normalize_namespace("blog_posts"), "blogPosts");
        assert_eq!(normalize_namespace("BlogPosts"), "blogPosts");
        assert_eq!(normalize_namespace("posts"), "posts");
    }

    #[test]
    fn test_path_segment_lowercases() {
        assert_eq!(namespace_path_segment("BlogPosts"), "blogposts");
        assert_eq!(namespace_path_segment("posts"), "posts");
    }
}
