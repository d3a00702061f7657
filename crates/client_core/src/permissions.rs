//! Role rules for moderation actions. Client-side gating only; the store enforces its own.

use shared::domain::{Role, UserId};

/// Admins delete anything, moderators delete plain-user messages, everyone deletes their own.
pub fn can_delete(actor_id: &UserId, actor_role: Role, author_id: &UserId, author_role: Role) -> bool {
    if actor_id == author_id {
        return true;
    }
    match actor_role {
        Role::Admin => true,
        Role::Moderator => author_role == Role::User,
        Role::User => false,
    }
}

pub fn can_edit(actor_id: &UserId, author_id: &UserId) -> bool {
    actor_id == author_id
}

pub fn can_pin(actor_role: Role) -> bool {
    actor_role.is_elevated()
}

pub fn can_post_announcement(actor_role: Role) -> bool {
    actor_role == Role::Admin
}
