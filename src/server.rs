//! Server half of the RPC pair: accepts connections and forwards calls to an owner object.

use crate::{
    error::{Error, Result},
    log,
    message::{Address, Request, Response},
};
use color_print::cformat;
use futures::{SinkExt, StreamExt, future::BoxFuture};
use serde::{Serialize, de::DeserializeOwned};
use serde_json::Value;
use std::{error, sync::Arc};
use tokio::{
    net::{TcpListener, TcpStream},
    task::JoinHandle,
};
use tokio_util::codec::{Framed, LinesCodec};

/// An object whose methods can be invoked by name over the network.
///
/// Implementors match on `method` and decode `args` positionally, usually with
/// [`parse_args`]. Whatever error they return is sent back to the caller.
pub trait Dispatch: Send + Sync + 'static {
    fn dispatch<'a>(&'a self, method: &'a str, args: Vec<Value>) -> BoxFuture<'a, Result<Value>>;
}

/// Decodes a positional argument list into a tuple, checking arity and types.
pub fn parse_args<T: DeserializeOwned>(method: &str, args: Vec<Value>) -> Result<T> {
    serde_json::from_value(Value::Array(args)).map_err(|e| Error::bad_arguments(method, e))
}

pub fn no_args(method: &str, args: &[Value]) -> Result<()> {
    match args.len() {
        0 => Ok(()),
        n => Err(Error::bad_arguments(method, format!("expected no arguments, got {n}"))),
    }
}

pub fn to_value<T: Serialize>(value: T) -> Result<Value> {
    serde_json::to_value(value).map_err(|e| Error::Protocol(e.to_string()))
}

pub struct Skeleton {
    listener: TcpListener,
    address: Address,
}

impl Skeleton {
    /// Binds the listening socket. Port 0 picks a free port, reported by [`Skeleton::address`].
    pub async fn bind(address: &Address) -> Result<Self> {
        let listener = TcpListener::bind((address.host(), address.port()))
            .await
            .map_err(|source| Error::Transport {
                address: address.clone(),
                source,
            })?;
        let port = listener
            .local_addr()
            .map_err(|source| Error::Transport {
                address: address.clone(),
                source,
            })?
            .port();

        Ok(Self {
            listener,
            address: Address::new(address.host(), port),
        })
    }

    pub fn address(&self) -> &Address {
        &self.address
    }

    /// Accept loop. Each connection gets its own task; a failing connection never stops the loop.
    pub async fn run<D: Dispatch>(self, owner: Arc<D>) {
        log::debug(&cformat!("Skeleton running at <bold>{}</bold>.", self.address));

        loop {
            let (stream, from) = match self.listener.accept().await {
                Ok(accepted) => accepted,
                Err(e) => {
                    log::warn(&cformat!("Failed to accept a <bold>connection</bold>: {e}"));
                    continue;
                }
            };

            log::debug(&cformat!("Serving a request from <bold>{from}</bold>."));
            let owner = Arc::clone(&owner);

            tokio::spawn(async move {
                if let Err(e) = Self::handle(stream, owner).await {
                    log::error(&format!("Request from {from} failed: {e}"));
                }
            });
        }
    }

    pub fn spawn<D: Dispatch>(self, owner: Arc<D>) -> JoinHandle<()> {
        tokio::spawn(self.run(owner))
    }

    async fn handle<D: Dispatch>(
        stream: TcpStream,
        owner: Arc<D>,
    ) -> std::result::Result<(), Box<dyn error::Error + Send + Sync>> {
        let mut lines = Framed::new(stream, LinesCodec::new());

        let line = match lines.next().await {
            Some(line) => line?,
            None => String::new(),
        };

        let response = process_request(owner.as_ref(), &line).await;
        lines.send(response.to_json_string()?).await?;
        Ok(())
    }
}

/// Decodes one request line, runs it on `owner` and builds the response.
pub async fn process_request<D: Dispatch + ?Sized>(owner: &D, line: &str) -> Response {
    let result = match Request::from_json_string(line) {
        Ok(Request { method, args }) => {
            log::debug(&cformat!("Dispatching <bold>{method}</bold>{args:?}."));
            owner.dispatch(&method, args).await
        }
        Err(e) => Err(e),
    };

    if let Err(e) = &result {
        log::warn(&cformat!("Answering with <red>{}</red>: {e}", e.name()));
    }
    Response::from(result)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stub::Stub;
    use futures::FutureExt;
    use serde_json::json;
    use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};

    struct Calculator;

    impl Dispatch for Calculator {
        fn dispatch<'a>(
            &'a self,
            method: &'a str,
            args: Vec<Value>,
        ) -> BoxFuture<'a, Result<Value>> {
            async move {
                match method {
                    "add" => {
                        let (a, b): (i64, i64) = parse_args(method, args)?;
                        to_value(a + b)
                    }
                    "echo" => Ok(Value::Array(args)),
                    "nothing" => {
                        no_args(method, &args)?;
                        Ok(Value::Null)
                    }
                    "fail" => Err(Error::NotHeld),
                    _ => Err(Error::NoSuchMethod(method.to_string())),
                }
            }
            .boxed()
        }
    }

    async fn serve() -> Stub {
        let skeleton = Skeleton::bind(&Address::new("127.0.0.1", 0)).await.unwrap();
        let stub = Stub::new(skeleton.address().clone());
        skeleton.spawn(Arc::new(Calculator));
        stub
    }

    async fn raw_exchange(address: &Address, line: &str) -> String {
        let stream = TcpStream::connect((address.host(), address.port()))
            .await
            .unwrap();
        let mut stream = BufReader::new(stream);
        stream.get_mut().write_all(line.as_bytes()).await.unwrap();
        let mut answer = String::new();
        stream.read_line(&mut answer).await.unwrap();
        answer
    }

    #[tokio::test]
    async fn calls_reach_the_owner() {
        let stub = serve().await;
        let sum: i64 = stub.invoke("add", vec![json!(2), json!(40)]).await.unwrap();
        assert_eq!(sum, 42);

        let echoed = stub
            .call("echo", vec![json!("a"), json!([1, 2]), json!(null)])
            .await
            .unwrap();
        assert_eq!(echoed, json!(["a", [1, 2], null]));

        assert_eq!(stub.call("nothing", vec![]).await.unwrap(), Value::Null);
    }

    #[tokio::test]
    async fn owner_errors_come_back_as_external_errors() {
        let stub = serve().await;

        match stub.call("fail", vec![]).await {
            Err(Error::External { name, .. }) => assert_eq!(name, "NotHeld"),
            other => panic!("unexpected {other:?}"),
        }
        match stub.call("no_such_thing", vec![]).await {
            Err(Error::External { name, .. }) => assert_eq!(name, "NoSuchMethod"),
            other => panic!("unexpected {other:?}"),
        }
        match stub.call("add", vec![json!(1)]).await {
            Err(Error::External { name, .. }) => assert_eq!(name, "BadArguments"),
            other => panic!("unexpected {other:?}"),
        }
        match stub.call("nothing", vec![json!(1)]).await {
            Err(Error::External { name, .. }) => assert_eq!(name, "BadArguments"),
            other => panic!("unexpected {other:?}"),
        }
    }

    #[tokio::test]
    async fn malformed_requests_get_an_error_and_the_listener_keeps_serving() {
        let stub = serve().await;

        let answer = raw_exchange(stub.address(), "{broken\n").await;
        let response = Response::from_json_string(&answer).unwrap();
        assert!(matches!(response, Response::Error(ref e) if e.name == "ProtocolError"));

        let answer = raw_exchange(stub.address(), "\n").await;
        let response = Response::from_json_string(&answer).unwrap();
        assert!(matches!(response, Response::Error(ref e) if e.name == "ProtocolError"));

        let answer = raw_exchange(stub.address(), "{\"method\": \"add\"}\n").await;
        let response = Response::from_json_string(&answer).unwrap();
        assert!(matches!(response, Response::Error(ref e) if e.name == "ProtocolError"));

        let sum: i64 = stub.invoke("add", vec![json!(1), json!(1)]).await.unwrap();
        assert_eq!(sum, 2);
    }
}
