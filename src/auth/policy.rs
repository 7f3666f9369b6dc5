//! Repository access policy shared by the SSH and HTTP transports.
//!
//! Only ownership is checked. Collaborator grants are not consulted; adding
//! them changes the security model and is tracked separately.
//!
//! `requester` is `None` for anonymous callers. An empty id is treated the
//! same way so that a blank owner id can never match an anonymous caller.

fn requester_is(owner_id: &str, requester: Option<&str>) -> bool {
    match requester {
        Some(id) if !id.is_empty() => id == owner_id,
        _ => false,
    }
}

#[must_use]
pub fn can_view(owner_id: &str, is_public: bool, requester: Option<&str>) -> bool {
    is_public || requester_is(owner_id, requester)
}

/// Clone and fetch follow the view rule.
#[must_use]
pub fn can_clone(owner_id: &str, is_public: bool, requester: Option<&str>) -> bool {
    can_view(owner_id, is_public, requester)
}

/// Pushing is never anonymous and never allowed to non-owners.
#[must_use]
pub fn can_push(owner_id: &str, requester: Option<&str>) -> bool {
    requester_is(owner_id, requester)
}
