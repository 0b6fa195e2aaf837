use rand::Rng;
use rand::distr::Alphanumeric;
use rand::seq::IndexedRandom;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Author colours. A user keeps the colour first assigned to them.
pub const USER_COLORS: [&str; 12] = [
    "#3B82F6", "#10B981", "#8B5CF6", "#F59E0B", "#EC4899", "#EF4444",
    "#06B6D4", "#84CC16", "#F97316", "#8B5A2B", "#6366F1", "#14B8A6",
];

/// Colour used when a user document carries none.
pub fn default_color() -> &'static str {
    USER_COLORS[0]
}

pub fn random_color() -> &'static str {
    USER_COLORS
        .choose(&mut rand::rng())
        .copied()
        .unwrap_or(USER_COLORS[0])
}

/// The signed-in account as handed over by the authentication layer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Identity {
    pub user_id: Uuid,
    pub username: String,
}

impl Identity {
    pub fn new(user_id: Uuid, username: impl Into<String>) -> Self {
        Self {
            user_id,
            username: username.into(),
        }
    }

    /// Anonymous identity with a `Guest_xxxxxx` name.
    pub fn guest() -> Self {
        let suffix: String = rand::rng()
            .sample_iter(&Alphanumeric)
            .take(6)
            .map(|b| char::from(b).to_ascii_lowercase())
            .collect();
        Self::new(Uuid::new_v4(), format!("Guest_{}", suffix))
    }
}
