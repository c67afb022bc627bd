use crate::{
    directory::Directory,
    error::{Error, Result},
    lock::{DistributedLock, LockState, LockStatus},
    log,
    message::{Address, PeerId},
    peer_list::PeerList,
    server::{Dispatch, Skeleton, no_args, parse_args, to_value},
};
use color_print::cformat;
use futures::{FutureExt, future::BoxFuture};
use serde_json::Value;
use std::sync::Arc;
use tokio::task::JoinHandle;

#[derive(Debug, Clone)]
pub struct PeerConfig {
    /// Address to listen on and advertise; port 0 picks a free one.
    pub address: Address,
    pub name_server: Address,
    pub kind: String,
}

/// The part of a peer that answers remote calls.
struct Member {
    id: PeerId,
    kind: String,
    peers: Arc<PeerList>,
    lock: Arc<DistributedLock>,
}

impl Dispatch for Member {
    fn dispatch<'a>(&'a self, method: &'a str, args: Vec<Value>) -> BoxFuture<'a, Result<Value>> {
        async move {
            match method {
                "check" => {
                    no_args(method, &args)?;
                    log::debug(&cformat!("Answering a liveness <bold>check</bold>."));
                    to_value((self.id, &self.kind))
                }
                "register_peer" => {
                    let (pid, address): (PeerId, Address) = parse_args(method, args)?;
                    self.peers.register_peer(pid, address).await;
                    self.lock.register_peer(pid).await;
                    Ok(Value::Null)
                }
                "unregister_peer" => {
                    let (pid,): (PeerId,) = parse_args(method, args)?;
                    self.peers.unregister_peer(pid).await?;
                    self.lock.unregister_peer(pid).await;
                    Ok(Value::Null)
                }
                "request_token" => {
                    let (time, pid): (u64, PeerId) = parse_args(method, args)?;
                    self.lock.request_token(time, pid).await?;
                    Ok(Value::Null)
                }
                "obtain_token" => {
                    let (token,): (Vec<(PeerId, u64)>,) = parse_args(method, args)?;
                    self.lock.obtain_token(token).await?;
                    Ok(Value::Null)
                }
                _ => Err(Error::NoSuchMethod(method.to_string())),
            }
        }
        .boxed()
    }
}

/// A running member of the mesh: listening socket, directory registration, peer list and lock.
pub struct Peer {
    member: Arc<Member>,
    address: Address,
    directory: Directory,
    handle: Address,
    server: JoinHandle<()>,
}

impl Peer {
    /// Binds, registers with the name server, joins the other peers and sets up the lock.
    pub async fn start(config: PeerConfig) -> Result<Self> {
        let skeleton = Skeleton::bind(&config.address).await?;
        let address = skeleton.address().clone();

        let directory = Directory::new(config.name_server.clone());
        let (id, handle) = directory.register(&config.kind, &address).await?;
        log::info(&cformat!(
            "This peer: id <bold>{id}</bold>, type <bold>{}</bold>, address <bold>{address}</bold>.",
            config.kind
        ));

        let peers = Arc::new(PeerList::new(id, config.kind.clone(), address.clone()));
        let lock = Arc::new(DistributedLock::new(Arc::clone(&peers)));
        let member = Arc::new(Member {
            id,
            kind: config.kind,
            peers,
            lock,
        });
        // serving before anyone is told about us
        let server = skeleton.spawn(Arc::clone(&member));

        let peer = Self {
            member,
            address,
            directory,
            handle,
            server,
        };

        if let Err(e) = peer.member.peers.initialize(&peer.directory).await {
            log::error(&format!("Could not join the other peers: {e}"));
            if let Err(e) = peer.unregister().await {
                log::warn(&format!("Could not unregister after a failed start: {e}"));
            }
            return Err(e);
        }
        if let Err(e) = peer.member.lock.initialize().await {
            log::error(&format!("Could not pass the token on: {e}"));
            peer.member.peers.destroy().await;
            if let Err(e) = peer.unregister().await {
                log::warn(&format!("Could not unregister after a failed start: {e}"));
            }
            return Err(e);
        }

        Ok(peer)
    }

    pub fn id(&self) -> PeerId {
        self.member.id
    }

    pub fn kind(&self) -> &str {
        &self.member.kind
    }

    pub fn address(&self) -> &Address {
        &self.address
    }

    pub fn peer_list(&self) -> &Arc<PeerList> {
        &self.member.peers
    }

    pub fn lock(&self) -> &Arc<DistributedLock> {
        &self.member.lock
    }

    pub async fn acquire(&self) -> Result<()> {
        self.member.lock.acquire().await
    }

    pub async fn release(&self) -> Result<()> {
        self.member.lock.release().await
    }

    pub async fn state(&self) -> LockState {
        self.member.lock.state().await
    }

    pub async fn status(&self) -> LockStatus {
        self.member.lock.status().await
    }

    /// Hands the token on, says goodbye to every peer, leaves the directory and stops listening.
    pub async fn destroy(self) -> Result<()> {
        let released = self.member.lock.destroy().await;
        if let Err(e) = &released {
            log::error(&format!("Could not hand the token over: {e}"));
        }
        self.member.peers.destroy().await;
        let unregistered = self.unregister().await;
        self.server.abort();

        log::info(&cformat!("Peer <bold>{}</bold> has left.", self.member.id));
        released.and(unregistered)
    }

    async fn unregister(&self) -> Result<()> {
        self.directory
            .unregister(self.member.id, &self.member.kind, &self.handle)
            .await
    }
}

impl Drop for Peer {
    fn drop(&mut self) {
        self.server.abort();
    }
}
