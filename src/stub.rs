//! Client half of the RPC pair: the local image of a remote object.

use crate::{
    error::{Error, Result},
    log,
    message::{Address, Request, Response},
};
use color_print::cformat;
use futures::{SinkExt, StreamExt};
use serde::de::DeserializeOwned;
use serde_json::Value;
use tokio::net::TcpStream;
use tokio_util::codec::{Framed, LinesCodec, LinesCodecError};

/// Handle to a remote peer. Holds no connection; every call opens its own.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Stub {
    address: Address,
}

impl Stub {
    pub fn new(address: Address) -> Self {
        Self { address }
    }

    pub fn address(&self) -> &Address {
        &self.address
    }

    /// Invokes `method` on the remote object and returns its raw result.
    pub async fn call(&self, method: &str, args: Vec<Value>) -> Result<Value> {
        log::debug(&cformat!(
            "Calling <bold>{method}</bold> on <bold>{}</bold> with {args:?}.",
            self.address
        ));

        let stream = TcpStream::connect((self.address.host(), self.address.port()))
            .await
            .map_err(|source| self.transport(source))?;
        let mut lines = Framed::new(stream, LinesCodec::new());

        let request = Request::new(method, args).to_json_string()?;
        lines
            .send(request)
            .await
            .map_err(|e| self.codec_error(e))?;

        // a peer hanging up without answering counts as an empty reply
        let answer = match lines.next().await {
            Some(Ok(line)) => line,
            Some(Err(e)) => return Err(self.codec_error(e)),
            None => String::new(),
        };
        log::debug(&cformat!(
            "Answer from <bold>{}</bold>: {answer}",
            self.address
        ));

        Response::from_json_string(&answer)?.into_result()
    }

    /// Like [`Stub::call`], decoding the result into `T`.
    pub async fn invoke<T: DeserializeOwned>(&self, method: &str, args: Vec<Value>) -> Result<T> {
        let value = self.call(method, args).await?;
        serde_json::from_value(value)
            .map_err(|e| Error::Protocol(format!("unexpected result from {method}: {e}")))
    }

    fn transport(&self, source: std::io::Error) -> Error {
        Error::Transport {
            address: self.address.clone(),
            source,
        }
    }

    fn codec_error(&self, e: LinesCodecError) -> Error {
        match e {
            LinesCodecError::Io(source) => self.transport(source),
            LinesCodecError::MaxLineLengthExceeded => {
                Error::Protocol("message exceeds the maximum line length".into())
            }
        }
    }
}
