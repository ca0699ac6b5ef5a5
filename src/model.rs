use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// One registered delivery endpoint. At most one row exists per user;
/// registering again replaces the previous row outright.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct Subscription {
    pub user_id: String,
    pub endpoint: String,
    pub p256dh: String,
    pub auth: String,
    pub created_at: DateTime<Utc>,
}

/// Per-user notification flags. Created lazily with both flags on; a missing
/// row reads as the default.
#[derive(Serialize, Deserialize, Debug, Clone)]
#[serde(rename_all = "camelCase")]
pub struct Preferences {
    #[serde(skip_serializing)]
    pub user_id: String,
    pub daily_reminder: bool,
    pub friend_posts: bool,
    #[serde(skip_serializing)]
    pub updated_at: DateTime<Utc>,
}

impl Preferences {
    pub fn default_for(user_id: &str, now: DateTime<Utc>) -> Self {
        Preferences {
            user_id: user_id.to_string(),
            daily_reminder: true,
            friend_posts: true,
            updated_at: now,
        }
    }
}

/// The singleton schedule row. `generated_at`'s calendar date doubles as the
/// "already handled today" marker for the dispatcher.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct DailySchedule {
    pub scheduled_time: DateTime<Utc>,
    pub generated_at: DateTime<Utc>,
}
