//! Error types for the router layer.

/// Errors that can occur while changing group membership.
#[derive(Debug, thiserror::Error)]
pub enum RouterError {
    /// The key is already a member of the group.
    #[error("{key} is already in group {group}")]
    AlreadyPresent { group: String, key: String },

    /// The key is not a member of the group.
    #[error("{key} is not in group {group}")]
    NotPresent { group: String, key: String },
}
