//! Table of the other peers of the same type as the owner.

use crate::{
    directory::Directory,
    error::{Error, Result},
    log,
    message::{Address, PeerId},
    server::to_value,
    stub::Stub,
};
use color_print::cformat;
use serde_json::json;
use std::{collections::BTreeMap, fmt::Write};
use tokio::sync::Mutex;

pub struct PeerList {
    owner: PeerId,
    kind: String,
    address: Address,
    peers: Mutex<BTreeMap<PeerId, Stub>>,
}

impl PeerList {
    pub fn new(owner: PeerId, kind: impl Into<String>, address: Address) -> Self {
        Self {
            owner,
            kind: kind.into(),
            address,
            peers: Mutex::new(BTreeMap::new()),
        }
    }

    pub fn owner(&self) -> PeerId {
        self.owner
    }

    /// Fetches the current members from the directory and introduces the owner to each of them.
    ///
    /// The owner must already be registered with the directory so the others can reach it.
    pub async fn initialize(&self, directory: &Directory) -> Result<()> {
        let members = directory.get_peers(&self.kind).await?;

        for (pid, address) in members {
            if pid == self.owner {
                continue;
            }
            self.register_peer(pid, address.clone()).await;
            Stub::new(address)
                .call(
                    "register_peer",
                    vec![json!(self.owner), to_value(&self.address)?],
                )
                .await?;
        }
        Ok(())
    }

    /// Asks every known peer to forget the owner. One unreachable peer does not stop the rest.
    pub async fn destroy(&self) {
        for (pid, stub) in self.peers().await {
            if let Err(e) = stub.call("unregister_peer", vec![json!(self.owner)]).await {
                log::warn(&cformat!(
                    "Could not tell peer <bold>{pid}</bold> that we are leaving: {e}"
                ));
            }
        }
    }

    pub async fn register_peer(&self, pid: PeerId, address: Address) {
        if pid == self.owner {
            log::debug("Ignoring a registration of ourselves.");
            return;
        }
        self.peers.lock().await.insert(pid, Stub::new(address));
        log::info(&cformat!("Peer <bold>{pid}</bold> has joined the system."));
    }

    pub async fn unregister_peer(&self, pid: PeerId) -> Result<()> {
        match self.peers.lock().await.remove(&pid) {
            Some(_) => {
                log::info(&cformat!("Peer <bold>{pid}</bold> has left the system."));
                Ok(())
            }
            None => Err(Error::UnknownPeer(pid)),
        }
    }

    pub async fn peer(&self, pid: PeerId) -> Result<Stub> {
        self.peers
            .lock()
            .await
            .get(&pid)
            .cloned()
            .ok_or(Error::UnknownPeer(pid))
    }

    /// Snapshot of the table in ascending id order; iterate it without holding the table.
    pub async fn peers(&self) -> BTreeMap<PeerId, Stub> {
        self.peers.lock().await.clone()
    }

    pub async fn ids(&self) -> Vec<PeerId> {
        self.peers.lock().await.keys().copied().collect()
    }

    pub async fn describe(&self) -> String {
        let peers = self.peers().await;
        let mut out = format!("List of peers of type '{}':", self.kind);
        for (pid, stub) in peers {
            let _ = write!(out, "\n    id: {pid:>2}, address: {}", stub.address());
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn list() -> PeerList {
        PeerList::new(1, "lock", Address::new("127.0.0.1", 40001))
    }

    #[tokio::test]
    async fn registration_is_idempotent_by_id() {
        let peers = list();
        peers.register_peer(3, Address::new("h", 3)).await;
        peers.register_peer(0, Address::new("h", 0)).await;
        peers.register_peer(3, Address::new("h", 33)).await;

        assert_eq!(peers.ids().await, vec![0, 3]);
        assert_eq!(peers.peer(3).await.unwrap().address(), &Address::new("h", 33));
    }

    #[tokio::test]
    async fn owner_never_enters_its_own_table() {
        let peers = list();
        peers.register_peer(1, Address::new("h", 1)).await;
        assert!(peers.ids().await.is_empty());
    }

    #[tokio::test]
    async fn unregistering_an_unknown_peer_is_reported() {
        let peers = list();
        peers.register_peer(2, Address::new("h", 2)).await;

        peers.unregister_peer(2).await.unwrap();
        assert!(matches!(peers.unregister_peer(2).await, Err(Error::UnknownPeer(2))));
        assert!(matches!(peers.peer(2).await, Err(Error::UnknownPeer(2))));
    }

    #[tokio::test]
    async fn snapshot_is_detached_from_the_table() {
        let peers = list();
        peers.register_peer(2, Address::new("h", 2)).await;
        let snapshot = peers.peers().await;
        peers.register_peer(4, Address::new("h", 4)).await;

        assert_eq!(snapshot.keys().copied().collect::<Vec<_>>(), vec![2]);
        assert!(peers.describe().await.contains("id:  4, address: h:4"));
    }

    #[tokio::test]
    async fn concurrent_joins_are_not_lost() {
        let peers = std::sync::Arc::new(list());
        let joins: Vec<_> = (10..30)
            .map(|pid| {
                let peers = peers.clone();
                tokio::spawn(async move { peers.register_peer(pid, Address::new("h", 1)).await })
            })
            .collect();
        for join in joins {
            join.await.unwrap();
        }
        assert_eq!(peers.ids().await, (10..30).collect::<Vec<_>>());
    }

    #[tokio::test]
    async fn destroy_keeps_going_past_unreachable_peers() {
        let peers = list();
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        peers.register_peer(0, Address::from(listener.local_addr().unwrap())).await;
        drop(listener);
        peers.register_peer(2, Address::new("127.0.0.1", 1)).await;

        // returns instead of failing on the first refused connection
        peers.destroy().await;
    }
}
