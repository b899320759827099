//! Copy a work item's public identity onto the worker that services it.

use std::sync::Arc;

use tracing::{debug, error, info, warn};

use fleet_core::{CampaignId, WorkItemId, WorkerId};
use fleet_infra::cipher::SessionCipher;
use fleet_infra::store::SessionFactory;
use fleet_infra::transport::{ChatClient, ChatTransport};

#[async_trait::async_trait]
pub trait ProfileSync: Send + Sync {
    /// Mirror `item`'s profile onto `worker`; when `campaign` has an initial
    /// message, post it under the item's latest post. Never errors: every
    /// failure is logged and reported as `false`.
    async fn sync(&self, worker: WorkerId, item: WorkItemId, campaign: Option<CampaignId>) -> bool;
}

/// Does nothing and reports success.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopProfileSync;

#[async_trait::async_trait]
impl ProfileSync for NoopProfileSync {
    async fn sync(&self, _worker: WorkerId, _item: WorkItemId, _campaign: Option<CampaignId>) -> bool {
        true
    }
}

/// Opens a short-lived client per sync through the chat transport.
pub struct TransportProfileSync {
    sessions: Arc<dyn SessionFactory>,
    transport: Arc<dyn ChatTransport>,
    cipher: Arc<dyn SessionCipher>,
}

impl TransportProfileSync {
    pub fn new(
        sessions: Arc<dyn SessionFactory>,
        transport: Arc<dyn ChatTransport>,
        cipher: Arc<dyn SessionCipher>,
    ) -> Self {
        Self {
            sessions,
            transport,
            cipher,
        }
    }

    async fn send_initial(client: &dyn ChatClient, peer: &str, message: &str) -> bool {
        let posts = match client.fetch_recent(peer, 1).await {
            Ok(posts) => posts,
            Err(e) => {
                warn!(peer, error = %e, "cannot read posts for initial message");
                return false;
            }
        };
        let Some(latest) = posts.first() else {
            warn!(peer, "no posts found for initial message");
            return false;
        };
        match client.send_message(peer, message, Some(latest.id)).await {
            Ok(message_id) => {
                info!(peer, post_id = latest.id, message_id, "initial message sent");
                true
            }
            Err(e) => {
                warn!(peer, post_id = latest.id, error = %e, "initial message failed");
                false
            }
        }
    }
}

#[async_trait::async_trait]
impl ProfileSync for TransportProfileSync {
    async fn sync(&self, worker_id: WorkerId, item_id: WorkItemId, campaign_id: Option<CampaignId>) -> bool {
        let store = match self.sessions.open().await {
            Ok(store) => store,
            Err(e) => {
                error!(worker_id = %worker_id, error = %e, "profile sync could not open store");
                return false;
            }
        };

        let (worker, item) = match (
            store.workers.get(worker_id).await,
            store.items.get(item_id).await,
        ) {
            (Ok(Some(w)), Ok(Some(i))) => (w, i),
            _ => {
                warn!(worker_id = %worker_id, item_id = %item_id, "profile sync target missing");
                return false;
            }
        };
        let Some(sealed) = worker.session.as_deref() else {
            warn!(worker_id = %worker_id, "cannot copy profile without session");
            return false;
        };

        let initial_message = match campaign_id {
            Some(id) => match store.campaigns.get(id).await {
                Ok(campaign) => campaign.and_then(|c| c.initial_message),
                Err(e) => {
                    warn!(campaign_id = %id, error = %e, "campaign lookup failed");
                    None
                }
            },
            None => None,
        };

        let session = match self.cipher.decrypt(sealed) {
            Ok(session) => session,
            Err(e) => {
                error!(worker_id = %worker_id, error = %e, "session decrypt failed");
                return false;
            }
        };
        let client = match self.transport.connect(&worker, &session).await {
            Ok(client) => client,
            Err(e) => {
                error!(worker_id = %worker_id, error = %e, "profile sync connect failed");
                return false;
            }
        };

        let copied = match client.fetch_profile(&item.handle).await {
            Ok(profile) => {
                match client.update_profile(&profile).await {
                    Ok(()) => {
                        info!(
                            worker_id = %worker_id,
                            item_id = %item_id,
                            title = %profile.title,
                            "profile copied"
                        );
                        true
                    }
                    Err(e) => {
                        warn!(worker_id = %worker_id, item_id = %item_id, error = %e, "profile update failed");
                        false
                    }
                }
            }
            Err(e) => {
                warn!(worker_id = %worker_id, item_id = %item_id, error = %e, "profile fetch failed");
                false
            }
        };

        if copied {
            if let Some(message) = initial_message.as_deref() {
                Self::send_initial(client.as_ref(), &item.handle, message).await;
            } else {
                debug!(worker_id = %worker_id, "no initial message configured");
            }
        }
        client.disconnect().await;
        copied
    }
}
