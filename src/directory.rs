//! Name service: hands out peer ids, groups peers by type and drops the ones that stop answering.

use crate::{
    error::{Error, Result},
    log,
    message::{Address, PeerId},
    server::{Dispatch, parse_args, to_value},
    stub::Stub,
};
use color_print::cformat;
use futures::{
    FutureExt,
    future::{BoxFuture, join_all},
};
use serde_json::{Value, json};
use std::{
    collections::{BTreeSet, HashMap},
    sync::Arc,
    time::Duration,
};
use tokio::{sync::RwLock, task::JoinHandle, time::timeout};

/// Typed client for a remote [`NameServer`].
#[derive(Debug, Clone)]
pub struct Directory {
    stub: Stub,
}

impl Directory {
    pub fn new(address: Address) -> Self {
        Self {
            stub: Stub::new(address),
        }
    }

    /// Returns the new id and the opaque handle needed to unregister later.
    pub async fn register(&self, kind: &str, address: &Address) -> Result<(PeerId, Address)> {
        self.stub
            .invoke("register", vec![json!(kind), to_value(address)?])
            .await
    }

    pub async fn unregister(&self, id: PeerId, kind: &str, handle: &Address) -> Result<()> {
        self.stub
            .call("unregister", vec![json!(id), json!(kind), to_value(handle)?])
            .await?;
        Ok(())
    }

    pub async fn get_peers(&self, kind: &str) -> Result<Vec<(PeerId, Address)>> {
        self.stub.invoke("get_peers", vec![json!(kind)]).await
    }
}

#[derive(Default)]
struct Registry {
    groups: HashMap<String, BTreeSet<(PeerId, Address)>>,
    next_id: PeerId,
}

#[derive(Clone)]
pub struct NameServer {
    registry: Arc<RwLock<Registry>>,
    check_timeout: Duration,
}

impl NameServer {
    pub fn new(check_timeout: Duration) -> Self {
        Self {
            registry: Arc::new(RwLock::new(Registry::default())),
            check_timeout,
        }
    }

    pub async fn register(&self, kind: &str, address: Address) -> (PeerId, Address) {
        let mut registry = self.registry.write().await;
        let id = registry.next_id;
        registry.next_id += 1;
        registry
            .groups
            .entry(kind.to_string())
            .or_default()
            .insert((id, address.clone()));

        log::info(&cformat!(
            "Registered peer <bold>{id}</bold> of type <bold>{kind}</bold> at <bold>{address}</bold>."
        ));
        (id, address)
    }

    /// Returns whether the entry existed.
    pub async fn unregister(&self, id: PeerId, kind: &str, handle: &Address) -> bool {
        let mut registry = self.registry.write().await;
        let removed = registry
            .groups
            .get_mut(kind)
            .is_some_and(|group| group.remove(&(id, handle.clone())));

        if removed {
            log::info(&cformat!(
                "Unregistered peer <bold>{id}</bold> of type <bold>{kind}</bold>."
            ));
        } else {
            log::warn(&cformat!(
                "Peer <bold>{id}</bold> at <bold>{handle}</bold> was not registered as <bold>{kind}</bold>."
            ));
        }
        removed
    }

    pub async fn get_peers(&self, kind: &str) -> Vec<(PeerId, Address)> {
        let registry = self.registry.read().await;
        registry
            .groups
            .get(kind)
            .map(|group| group.iter().cloned().collect())
            .unwrap_or_default()
    }

    /// Probes every member of `kind` concurrently and removes the ones that fail the check.
    pub async fn check_group(&self, kind: &str) {
        log::info(&cformat!(
            "Confirming that all peers of type <bold>{kind}</bold> are alive."
        ));

        let members = self.get_peers(kind).await;
        let verdicts = join_all(
            members
                .iter()
                .map(|(id, address)| self.is_alive(kind, *id, address)),
        )
        .await;

        let dead: Vec<_> = members
            .into_iter()
            .zip(verdicts)
            .filter_map(|(member, alive)| (!alive).then_some(member))
            .collect();
        if dead.is_empty() {
            return;
        }

        let mut registry = self.registry.write().await;
        if let Some(group) = registry.groups.get_mut(kind) {
            for member in dead {
                log::info(&cformat!("Removing unresponsive peer <bold>{}</bold>.", member.0));
                group.remove(&member);
            }
        }
    }

    pub async fn check_all(&self) {
        let kinds: Vec<String> = self.registry.read().await.groups.keys().cloned().collect();
        for kind in kinds {
            self.check_group(&kind).await;
        }
    }

    /// Runs [`NameServer::check_all`] every `period`.
    pub fn spawn_sweeper(&self, period: Duration) -> JoinHandle<()> {
        let this = self.clone();
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(period);
            // the first tick fires immediately
            interval.tick().await;
            loop {
                interval.tick().await;
                this.check_all().await;
            }
        })
    }

    async fn is_alive(&self, kind: &str, id: PeerId, address: &Address) -> bool {
        let stub = Stub::new(address.clone());
        let answer = timeout(
            self.check_timeout,
            stub.invoke::<(PeerId, String)>("check", vec![]),
        )
        .await;

        match answer {
            Ok(Ok((pid, ptype))) if pid == id && ptype == kind => true,
            Ok(Ok(other)) => {
                log::info(&cformat!(
                    "Peer <bold>{id}</bold> answered {other:?}, expected ({id}, {kind:?})."
                ));
                false
            }
            Ok(Err(e)) => {
                log::info(&cformat!("Peer <bold>{id}</bold> failed its check: {e}"));
                false
            }
            Err(_) => {
                log::info(&cformat!("Check of peer <bold>{id}</bold> timed out."));
                false
            }
        }
    }
}

impl Dispatch for NameServer {
    fn dispatch<'a>(&'a self, method: &'a str, args: Vec<Value>) -> BoxFuture<'a, Result<Value>> {
        async move {
            match method {
                "register" => {
                    let (kind, address): (String, Address) = parse_args(method, args)?;
                    to_value(self.register(&kind, address).await)
                }
                "unregister" => {
                    let (id, kind, handle): (PeerId, String, Address) = parse_args(method, args)?;
                    if self.unregister(id, &kind, &handle).await {
                        // the leaving peer is not kept waiting for the sweep
                        let this = self.clone();
                        tokio::spawn(async move { this.check_group(&kind).await });
                    }
                    Ok(Value::Null)
                }
                "get_peers" => {
                    let (kind,): (String,) = parse_args(method, args)?;
                    to_value(self.get_peers(&kind).await)
                }
                _ => Err(Error::NoSuchMethod(method.to_string())),
            }
        }
        .boxed()
    }
}
