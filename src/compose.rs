use rand::Rng;
use serde::Serialize;

/// Flat payload handed to the push layer and, eventually, to the service
/// worker on the client. `tag` lets the client collapse notifications of the
/// same class instead of stacking them.
#[derive(Serialize, Debug, Clone, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct NotificationPayload {
    pub title: String,
    pub body: String,
    pub tag: String,
    pub data: PayloadData,
}

#[derive(Serialize, Debug, Clone, PartialEq)]
pub struct PayloadData {
    pub url: String,
}

pub const DAILY_REMINDER_TAG: &str = "daily-reminder";

const DAILY_TITLES: &[&str] = &[
    "Time to share your day",
    "Your daily moment",
    "Nudge nudge",
    "What's happening?",
];

const DAILY_BODIES: &[&str] = &[
    "Post something before the day slips away.",
    "Your friends are waiting to hear from you.",
    "A minute is all it takes. Share something.",
    "Today only happens once. Capture it.",
];

const FRIEND_TITLES: &[&str] = &["New post", "Fresh from your feed"];

const FRIEND_BODIES: &[&str] = &[
    "{name} just shared something.",
    "{name} posted. Go take a look.",
    "Something new from {name}.",
];

const MARKERS: &[&str] = &["✨", "🌿", "☀️", "🎈", "🎶"];

fn pick<'a>(pool: &[&'a str]) -> &'a str {
    pool[rand::thread_rng().gen_range(0..pool.len())]
}

/// Compose the daily reminder. Wording varies day to day; the tag is constant
/// so a missed reminder is replaced by the next rather than piling up.
pub fn daily_reminder() -> NotificationPayload {
    NotificationPayload {
        title: format!("{} {}", pick(DAILY_TITLES), pick(MARKERS)),
        body: pick(DAILY_BODIES).to_string(),
        tag: DAILY_REMINDER_TAG.to_string(),
        data: PayloadData {
            url: "/feed".to_string(),
        },
    }
}

/// Compose the friend-posted notification. The tag carries the poster id so
/// two different friends posting stay visible as two notifications.
pub fn friend_posted(poster_id: &str, poster_display_name: &str) -> NotificationPayload {
    NotificationPayload {
        title: format!("{} {}", pick(FRIEND_TITLES), pick(MARKERS)),
        body: pick(FRIEND_BODIES).replace("{name}", poster_display_name),
        tag: friend_post_tag(poster_id),
        data: PayloadData {
            url: "/feed".to_string(),
        },
    }
}

pub fn friend_post_tag(poster_id: &str) -> String {
    format!("friend-post:{}", poster_id)
}
