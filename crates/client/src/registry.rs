use std::collections::HashMap;

use tracing::warn;

use crate::peer::PeerLink;

/// Peer links keyed by participant id. One link per participant; the router
/// reuses an existing link on renegotiation instead of stacking duplicates.
#[derive(Debug, Default)]
pub(crate) struct PeerRegistry {
    links: HashMap<String, PeerLink>,
}

impl PeerRegistry {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    pub(crate) fn contains(&self, participant_id: &str) -> bool {
        self.links.contains_key(participant_id)
    }

    pub(crate) fn get_mut(&mut self, participant_id: &str) -> Option<&mut PeerLink> {
        self.links.get_mut(participant_id)
    }

    pub(crate) fn insert(&mut self, link: PeerLink) {
        let participant_id = link.participant_id().to_string();
        if self.links.insert(participant_id.clone(), link).is_some() {
            warn!(%participant_id, "Replaced an existing peer link");
        }
    }

    /// Idempotent: removing an unknown participant is a no-op.
    pub(crate) fn remove(&mut self, participant_id: &str) -> Option<PeerLink> {
        self.links.remove(participant_id)
    }

    pub(crate) fn drain(&mut self) -> Vec<PeerLink> {
        self.links.drain().map(|(_, link)| link).collect()
    }

    pub(crate) fn len(&self) -> usize {
        self.links.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::sync::mpsc;
    use wavecast_protocol::IceConfig;

    async fn link(participant_id: &str, initiator: bool) -> PeerLink {
        let (tx, _rx) = mpsc::channel(8);
        let ice = IceConfig {
            stun_urls: Vec::new(),
            ..Default::default()
        };
        PeerLink::new(participant_id, initiator, &ice, tx, 1)
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn one_link_per_participant() {
        let mut registry = PeerRegistry::new();
        registry.insert(link("p1", true).await);
        registry.insert(link("p2", false).await);
        assert_eq!(registry.len(), 2);
        assert!(registry.contains("p1"));

        // Same participant again replaces, never duplicates.
        registry.insert(link("p1", true).await);
        assert_eq!(registry.len(), 2);
    }

    #[tokio::test]
    async fn remove_is_idempotent_and_drain_empties() {
        let mut registry = PeerRegistry::new();
        registry.insert(link("p1", true).await);
        assert!(registry.remove("p1").is_some());
        assert!(registry.remove("p1").is_none());

        registry.insert(link("a", true).await);
        registry.insert(link("b", true).await);
        let drained = registry.drain();
        assert_eq!(drained.len(), 2);
        assert_eq!(registry.len(), 0);
        for l in drained {
            l.close().await;
        }
    }
}
