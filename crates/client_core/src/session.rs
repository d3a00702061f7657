use shared::domain::{Role, UserId, UserProfile};

/// Authenticated user context handed to every component at construction.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Session {
    profile: UserProfile,
}

impl Session {
    pub fn new(profile: UserProfile) -> Self {
        Self { profile }
    }

    pub fn user_id(&self) -> &UserId {
        &self.profile.user_id
    }

    pub fn username(&self) -> &str {
        &self.profile.username
    }

    pub fn role(&self) -> Role {
        self.profile.role
    }

    pub fn profile(&self) -> &UserProfile {
        &self.profile
    }
}
