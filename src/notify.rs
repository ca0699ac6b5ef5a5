use std::sync::Arc;

use anyhow::Result;
use futures::stream::{self, StreamExt};

use crate::compose::{self, NotificationPayload};
use crate::model::Subscription;
use crate::push::{PushSender, SendOutcome};
use crate::store::Store;

const MAX_IN_FLIGHT: usize = 8;

/// Fans one composed payload out to every eligible endpoint. Individual
/// failures never abort the batch; `Gone` endpoints are pruned on the spot.
#[derive(Clone)]
pub struct Notifier {
    store: Store,
    sender: Option<Arc<dyn PushSender>>,
}

impl Notifier {
    pub fn new(store: Store, sender: Option<Arc<dyn PushSender>>) -> Self {
        Notifier { store, sender }
    }

    /// Deliver the daily reminder to every subscriber with the flag on.
    /// Returns the number of successful deliveries.
    pub async fn dispatch_daily_reminder(&self) -> Result<usize> {
        let recipients = self.store.daily_reminder_recipients()?;

        self.fan_out(recipients, compose::daily_reminder()).await
    }

    /// Tell everyone except the poster that a friend posted. Fire-and-forget
    /// from the caller's perspective; the count is only used for logging.
    pub async fn notify_friend_posted(
        &self,
        poster_id: &str,
        poster_display_name: &str,
    ) -> Result<usize> {
        let recipients = self.store.friend_post_recipients(poster_id)?;
        let payload = compose::friend_posted(poster_id, poster_display_name);

        self.fan_out(recipients, payload).await
    }

    async fn fan_out(
        &self,
        recipients: Vec<Subscription>,
        payload: NotificationPayload,
    ) -> Result<usize> {
        let sender = match &self.sender {
            Some(sender) => sender.clone(),
            None => {
                tracing::info!("Push delivery not configured; skipping fan-out.");
                return Ok(0);
            }
        };

        let results: Vec<(Subscription, SendOutcome)> = stream::iter(recipients)
            .map(|subscription| {
                let sender = sender.clone();
                let payload = payload.clone();

                async move {
                    let outcome = sender.send(&subscription, &payload).await;
                    (subscription, outcome)
                }
            })
            .buffer_unordered(MAX_IN_FLIGHT)
            .collect()
            .await;

        let mut delivered = 0;
        for (subscription, outcome) in results {
            match outcome {
                SendOutcome::Delivered => delivered += 1,
                SendOutcome::Gone => {
                    tracing::info!(user_id = %subscription.user_id, "Endpoint gone; pruning subscription.");

                    if let Err(error) = self.store.delete_subscription(&subscription.user_id) {
                        tracing::error!(?error, user_id = %subscription.user_id, "Failed to prune subscription.");
                    }
                }
                SendOutcome::TransientFailure(cause) => {
                    tracing::warn!(%cause, user_id = %subscription.user_id, "Push delivery failed; will retry on the next cycle.");
                }
            }
        }

        Ok(delivered)
    }
}
