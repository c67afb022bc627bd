//! Token-based distributed mutual exclusion.
//!
//! One token circulates among the peers of a type; whoever holds it may enter the
//! critical section. Each peer keeps a logical clock, the highest request time it
//! has seen from every peer (`request`) and, while the token is here, the time at
//! which every peer last held it (`token`). A peer is waiting for the token
//! exactly when `request[pid] > token[pid]`.

use crate::{
    error::{Error, Result},
    log,
    message::PeerId,
    peer_list::PeerList,
    server::to_value,
    stub::Stub,
};
use color_print::cformat;
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::{collections::BTreeMap, fmt, sync::Arc};
use tokio::sync::{Mutex, Notify, Semaphore};

/// Logical timestamps keyed by peer id.
pub type Clock = BTreeMap<PeerId, u64>;

/// Enum that tells where the token is with respect to this peer.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum LockState {
    #[default]
    NoToken,
    /// The token is here but nobody local is using it.
    TokenPresent,
    /// The token is here and a local task is in the critical section.
    TokenHeld,
}

/// Read-only copy of the lock's bookkeeping.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct LockStatus {
    pub state: LockState,
    pub time: u64,
    pub token: Clock,
    pub request: Clock,
}

#[derive(Default)]
struct Inner {
    state: LockState,
    time: u64,
    token: Clock,
    request: Clock,
    destroyed: bool,
}

/// The token on its way to another peer, sent once the state mutex is released.
struct Handoff {
    pid: PeerId,
    stub: Stub,
    token: Vec<(PeerId, u64)>,
}

pub struct DistributedLock {
    owner: PeerId,
    peers: Arc<PeerList>,
    inner: Mutex<Inner>,
    state_changed: Notify,
    // one local task between acquire and release at a time
    entry: Semaphore,
}

impl DistributedLock {
    pub fn new(peers: Arc<PeerList>) -> Self {
        Self {
            owner: peers.owner(),
            peers,
            inner: Mutex::new(Inner::default()),
            state_changed: Notify::new(),
            entry: Semaphore::new(1),
        }
    }

    /// Picks the initial holder: the smallest id among the owner and the known peers.
    ///
    /// Call once the peer list has joined the mesh. Requests that reached the holder
    /// before this point are served straight away.
    pub async fn initialize(&self) -> Result<()> {
        let handoff = {
            let mut inner = self.inner.lock().await;
            let known = self.peers.ids().await;

            for pid in known.iter().copied().chain([self.owner]) {
                inner.request.entry(pid).or_insert(0);
            }

            let first = known.iter().copied().fold(self.owner, PeerId::min);
            if first == self.owner {
                let mut token: Clock = inner.request.keys().map(|pid| (*pid, 0)).collect();
                token.insert(self.owner, inner.time);
                inner.token = token;
                self.set_state(&mut inner, LockState::TokenPresent);
                log::info(&cformat!("Starting with the <yellow, bold>token</yellow, bold>."));

                match self.first_waiting(&inner).await {
                    Some(pid) => Some(self.give_away(&mut inner, pid, false).await?),
                    None => None,
                }
            } else {
                inner.token.clear();
                self.set_state(&mut inner, LockState::NoToken);
                log::debug(&cformat!("Peer <bold>{first}</bold> starts with the token."));
                None
            }
        };

        match handoff {
            Some(handoff) => self.send(handoff).await,
            None => Ok(()),
        }
    }

    /// Blocks until this peer may enter the critical section.
    ///
    /// Dropping the future before it resolves gives up the local turn. A token that
    /// still arrives for it is kept, and the next `acquire` enters with it.
    pub async fn acquire(&self) -> Result<()> {
        let permit = self.entry.acquire().await.map_err(|_| Error::Destroyed)?;
        // returned to the semaphore by `release`
        self.enter().await?;
        permit.forget();

        log::info(&cformat!("Entered the <bold>critical section</bold>."));
        Ok(())
    }

    async fn enter(&self) -> Result<()> {
        let (time, peers) = {
            let mut inner = self.inner.lock().await;
            if inner.destroyed {
                return Err(Error::Destroyed);
            }
            inner.time += 1;

            let state = inner.state;
            match state {
                LockState::TokenPresent => {
                    let token = std::mem::take(&mut inner.token);
                    self.obtain(&mut inner, token);
                    return Ok(());
                }
                // a token that arrived for an earlier, failed attempt
                LockState::TokenHeld => {
                    let time = inner.time;
                    inner.token.insert(self.owner, time);
                    return Ok(());
                }
                LockState::NoToken => (inner.time, self.peers.peers().await),
            }
        };

        log::debug(&cformat!(
            "Requesting the <yellow, bold>token</yellow, bold> at time <bold>{time}</bold>."
        ));
        for (_, stub) in peers {
            stub.call("request_token", vec![json!(time), json!(self.owner)])
                .await?;
        }

        self.wait_until_held().await
    }

    async fn wait_until_held(&self) -> Result<()> {
        loop {
            let notified = self.state_changed.notified();
            tokio::pin!(notified);
            // registered before the check so a transition in between is not missed
            notified.as_mut().enable();

            {
                let inner = self.inner.lock().await;
                if inner.state == LockState::TokenHeld {
                    return Ok(());
                }
                if inner.destroyed {
                    return Err(Error::Destroyed);
                }
            }

            notified.await;
        }
    }

    /// Leaves the critical section and passes the token to the first waiting peer by id, if any.
    pub async fn release(&self) -> Result<()> {
        let handoff = {
            let mut inner = self.inner.lock().await;
            if inner.state != LockState::TokenHeld {
                return Err(Error::NotHeld);
            }
            self.set_state(&mut inner, LockState::TokenPresent);
            log::info(&cformat!("Left the <bold>critical section</bold>."));

            match self.first_waiting(&inner).await {
                Some(pid) => Some(self.give_away(&mut inner, pid, true).await),
                None => None,
            }
        };
        // the critical section is left even if the hand-over below fails
        self.entry.add_permits(1);

        match handoff {
            Some(handoff) => self.send(handoff?).await,
            None => Ok(()),
        }
    }

    /// Inbound: peer `pid` wants the token and stamped its request with `time`.
    pub async fn request_token(&self, time: u64, pid: PeerId) -> Result<()> {
        self.peers.peer(pid).await?;
        let handoff = {
            let mut inner = self.inner.lock().await;
            let seen = inner.request.entry(pid).or_insert(0);
            *seen = (*seen).max(time);
            let seen = *seen;

            let behind = seen > inner.token.get(&pid).copied().unwrap_or(0);
            if inner.state == LockState::TokenPresent && behind {
                Some(self.give_away(&mut inner, pid, false).await?)
            } else {
                None
            }
        };

        match handoff {
            Some(handoff) => self.send(handoff).await,
            None => Ok(()),
        }
    }

    /// Inbound: the token arrives, as `[pid, time]` pairs.
    pub async fn obtain_token(&self, token: Vec<(PeerId, u64)>) -> Result<()> {
        let handoff = {
            let mut inner = self.inner.lock().await;
            self.obtain(&mut inner, token.into_iter().collect());

            if inner.destroyed {
                // arrived after we left; pass it on rather than lose it
                self.departure(&mut inner).await?
            } else if inner.state == LockState::TokenPresent {
                // requests recorded while the token was elsewhere
                match self.first_waiting(&inner).await {
                    Some(pid) => Some(self.give_away(&mut inner, pid, false).await?),
                    None => None,
                }
            } else {
                None
            }
        };

        match handoff {
            Some(handoff) => self.send(handoff).await,
            None => Ok(()),
        }
    }

    pub async fn register_peer(&self, pid: PeerId) {
        let mut inner = self.inner.lock().await;
        inner.request.entry(pid).or_insert(0);
        if inner.state != LockState::NoToken {
            inner.token.entry(pid).or_insert(0);
        }
    }

    pub async fn unregister_peer(&self, pid: PeerId) {
        let mut inner = self.inner.lock().await;
        inner.request.remove(&pid);
        inner.token.remove(&pid);
    }

    /// Hands the token on before the peer exits, so the mesh keeps a holder.
    ///
    /// A waiting peer gets it first; otherwise the lowest remaining id does. Local tasks
    /// blocked in [`DistributedLock::acquire`] fail with [`Error::Destroyed`].
    pub async fn destroy(&self) -> Result<()> {
        self.entry.close();

        let handoff = {
            let mut inner = self.inner.lock().await;
            inner.destroyed = true;
            self.state_changed.notify_waiters();
            self.departure(&mut inner).await?
        };

        match handoff {
            Some(handoff) => self.send(handoff).await,
            None => Ok(()),
        }
    }

    pub async fn state(&self) -> LockState {
        self.inner.lock().await.state
    }

    pub async fn status(&self) -> LockStatus {
        let inner = self.inner.lock().await;
        LockStatus {
            state: inner.state,
            time: inner.time,
            token: inner.token.clone(),
            request: inner.request.clone(),
        }
    }

    fn set_state(&self, inner: &mut Inner, state: LockState) {
        inner.state = state;
        self.state_changed.notify_waiters();
    }

    /// Installs a received token and decides whether this peer was waiting for it.
    fn obtain(&self, inner: &mut Inner, token: Clock) {
        inner.token = token;
        for pid in inner.request.keys() {
            inner.token.entry(*pid).or_insert(0);
        }

        let credited = *inner.token.entry(self.owner).or_insert(0);
        if inner.time > credited {
            let time = inner.time;
            inner.token.insert(self.owner, time);
            self.set_state(inner, LockState::TokenHeld);
        } else {
            self.set_state(inner, LockState::TokenPresent);
        }
    }

    /// Lowest listed id whose latest request is newer than its last turn with the token.
    async fn first_waiting(&self, inner: &Inner) -> Option<PeerId> {
        let known = self.peers.ids().await;
        inner
            .request
            .iter()
            .filter(|(pid, _)| known.contains(*pid))
            .find(|(pid, requested)| **requested > inner.token.get(*pid).copied().unwrap_or(0))
            .map(|(pid, _)| *pid)
    }

    async fn departure(&self, inner: &mut Inner) -> Result<Option<Handoff>> {
        if inner.state == LockState::NoToken {
            return Ok(None);
        }
        let successor = match self.first_waiting(inner).await {
            Some(pid) => Some(pid),
            // the peer list never contains the owner
            None => self.peers.ids().await.first().copied(),
        };

        match successor {
            Some(pid) => Ok(Some(self.give_away(inner, pid, true).await?)),
            None => Ok(None),
        }
    }

    async fn give_away(&self, inner: &mut Inner, pid: PeerId, stamp: bool) -> Result<Handoff> {
        let stub = self.peers.peer(pid).await?;
        if stamp {
            let time = inner.time;
            inner.token.insert(self.owner, time);
        }
        let token = std::mem::take(&mut inner.token).into_iter().collect();
        self.set_state(inner, LockState::NoToken);

        Ok(Handoff { pid, stub, token })
    }

    async fn send(&self, handoff: Handoff) -> Result<()> {
        let Handoff { pid, stub, token } = handoff;
        log::info(&cformat!(
            "Sending the <yellow, bold>token</yellow, bold> to peer <bold>{pid}</bold>."
        ));
        stub.call("obtain_token", vec![to_value(token)?]).await?;
        Ok(())
    }
}

impl fmt::Display for LockStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "State   :: no token      : {}", self.state == LockState::NoToken)?;
        writeln!(f, "           token present : {}", self.state == LockState::TokenPresent)?;
        writeln!(f, "           token held    : {}", self.state == LockState::TokenHeld)?;
        writeln!(f, "Request :: {:?}", self.request)?;
        writeln!(f, "Token   :: {:?}", self.token)?;
        write!(f, "Time    :: {}", self.time)
    }
}
