use std::sync::Arc;

use crate::notify::Notifier;
use crate::push::{PushSender, VapidConfig, WebPushSender};
use crate::store::Store;

/// Shared handler state. When VAPID keys are not configured the notifier is
/// built without a sender and the whole delivery path degrades to a no-op.
#[derive(Clone)]
pub struct ServerState {
    pub store: Store,
    pub notifier: Notifier,
    pub vapid_public_key: Option<String>,
}

impl ServerState {
    pub fn new(store: Store, vapid: Option<VapidConfig>) -> Self {
        let sender = vapid
            .as_ref()
            .map(|config| Arc::new(WebPushSender::new(config)) as Arc<dyn PushSender>);
        let notifier = Notifier::new(store.clone(), sender);

        ServerState {
            store,
            notifier,
            vapid_public_key: vapid.map(|config| config.public_key),
        }
    }
}
