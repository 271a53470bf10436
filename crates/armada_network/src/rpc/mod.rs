//! # Remote procedure calls
//!
//! A call is addressed by interface name, method name and argument count.
//! Arguments travel as a nested buffer written in call order; results come
//! back as a status byte followed by the encoded return value. Calls are
//! either fire-and-forget (plain frame, no response expected) or
//! fire-and-wait (query frame correlated by the query layer, default 10
//! second deadline).
//!
//! An unbound target and an expired deadline are distinct errors:
//! [`RpcError::UnknownMethod`] is answered by the remote dispatch table,
//! [`RpcError::Timeout`] is produced locally when no answer arrives.

mod handler;

pub use handler::{MethodKey, RpcHandlerRegistry, RpcHandlerRegistryBuilder, RpcInvoker, RpcPacketListener};

use crate::channel::NetworkChannel;
use crate::error::NetworkError;
use armada_protocol::{channel_ids, BufObject, DataBuf, Frame, ProtocolError};
use std::time::Duration;
use thiserror::Error;

pub const DEFAULT_RPC_TIMEOUT: Duration = Duration::from_secs(10);

const STATUS_OK: u8 = 0;
const STATUS_UNKNOWN_METHOD: u8 = 1;
const STATUS_HANDLER_ERROR: u8 = 2;

#[derive(Debug, Error)]
pub enum RpcError {
    /// The remote dispatch table has no binding for this target.
    #[error("no rpc binding for {interface}::{method}/{arity}")]
    UnknownMethod {
        interface: String,
        method: String,
        arity: usize,
    },
    /// No response arrived before the deadline.
    #[error("rpc {interface}::{method} timed out after {timeout:?}")]
    Timeout {
        interface: String,
        method: String,
        timeout: Duration,
    },
    /// The bound invoker ran and failed.
    #[error("rpc invoker failed: {0}")]
    Handler(String),
    #[error(transparent)]
    Protocol(#[from] ProtocolError),
    #[error(transparent)]
    Network(#[from] NetworkError),
}

/// Factory for calls against one remote interface.
#[derive(Debug, Clone)]
pub struct RpcSender {
    interface: String,
    timeout: Duration,
}

impl RpcSender {
    pub fn new(interface: impl Into<String>) -> Self {
        Self {
            interface: interface.into(),
            timeout: DEFAULT_RPC_TIMEOUT,
        }
    }

    /// Overrides the fire-and-wait deadline for calls built from this sender.
    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn call(&self, method: impl Into<String>) -> RpcCall {
        RpcCall {
            interface: self.interface.clone(),
            method: method.into(),
            timeout: self.timeout,
            args: DataBuf::new(),
            arity: 0,
        }
    }
}

/// One call under construction. Arguments are appended in order; the final
/// argument count is part of the dispatch key on the remote side.
pub struct RpcCall {
    interface: String,
    method: String,
    timeout: Duration,
    args: DataBuf,
    arity: usize,
}

impl RpcCall {
    pub fn arg<T: BufObject>(mut self, value: &T) -> Result<Self, ProtocolError> {
        value.write_into(&mut self.args)?;
        self.arity += 1;
        Ok(self)
    }

    /// Sends the call without expecting a response.
    pub fn fire(self, channel: &NetworkChannel) -> Result<(), RpcError> {
        let body = self.encode_request(false)?;
        channel.send(Frame::bare(channel_ids::RPC, body))?;
        Ok(())
    }

    /// Sends the call and waits for the decoded result.
    pub async fn fire_and_wait<R: BufObject>(self, channel: &NetworkChannel) -> Result<R, RpcError> {
        let body = self.encode_request(true)?;
        let response = channel
            .query(channel_ids::RPC, body, self.timeout)
            .await
            .map_err(|e| match e {
                NetworkError::QueryTimeout(_) => RpcError::Timeout {
                    interface: self.interface.clone(),
                    method: self.method.clone(),
                    timeout: self.timeout,
                },
                other => RpcError::Network(other),
            })?;
        decode_response(response, &self.interface, &self.method, self.arity)
    }

    /// Like [`fire_and_wait`](Self::fire_and_wait), but an expired deadline
    /// yields the type's default value instead of an error.
    pub async fn fire_or_default<R: BufObject + Default>(
        self,
        channel: &NetworkChannel,
    ) -> Result<R, RpcError> {
        match self.fire_and_wait(channel).await {
            Err(RpcError::Timeout { .. }) => Ok(R::default()),
            other => other,
        }
    }

    fn encode_request(&self, expects_result: bool) -> Result<DataBuf, ProtocolError> {
        let mut body = DataBuf::new();
        body.write_string(&self.interface)?;
        body.write_string(&self.method)?;
        body.write_var_u64(self.arity as u64)?;
        body.write_bool(expects_result)?;
        body.write_buf(&self.args)?;
        Ok(body)
    }
}

fn decode_response<R: BufObject>(
    mut response: DataBuf,
    interface: &str,
    method: &str,
    arity: usize,
) -> Result<R, RpcError> {
    match response.read_u8()? {
        STATUS_OK => {
            let mut result = response.read_buf()?;
            Ok(R::read_from(&mut result)?)
        }
        STATUS_UNKNOWN_METHOD => Err(RpcError::UnknownMethod {
            interface: interface.to_string(),
            method: method.to_string(),
            arity,
        }),
        STATUS_HANDLER_ERROR => Err(RpcError::Handler(response.read_string()?)),
        tag => Err(ProtocolError::UnknownTag {
            tag,
            context: "rpc response status",
        }
        .into()),
    }
}

fn encode_ok(result: &DataBuf) -> Result<DataBuf, ProtocolError> {
    let mut body = DataBuf::new();
    body.write_u8(STATUS_OK)?;
    body.write_buf(result)?;
    Ok(body)
}

fn encode_unknown_method() -> Result<DataBuf, ProtocolError> {
    let mut body = DataBuf::new();
    body.write_u8(STATUS_UNKNOWN_METHOD)?;
    Ok(body)
}

fn encode_handler_error(message: &str) -> Result<DataBuf, ProtocolError> {
    let mut body = DataBuf::new();
    body.write_u8(STATUS_HANDLER_ERROR)?;
    body.write_string(message)?;
    Ok(body)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channel::{spawn_channel, AcceptAllHandler, NetworkContext};
    use std::net::SocketAddr;
    use std::sync::Arc;
    use tokio::sync::mpsc;
    use tokio::time::timeout;

    fn test_addr() -> SocketAddr {
        "127.0.0.1:0".parse().unwrap()
    }

    async fn rpc_pair(
        registry: Arc<RpcHandlerRegistry>,
    ) -> (crate::channel::NetworkChannel, Arc<NetworkContext>) {
        let caller_ctx = NetworkContext::new(Arc::new(AcceptAllHandler));
        let callee_ctx = NetworkContext::new(Arc::new(AcceptAllHandler));
        callee_ctx
            .listeners
            .register(channel_ids::RPC, Arc::new(RpcPacketListener::new(registry)));

        let (a, b) = tokio::io::duplex(256 * 1024);
        let caller = spawn_channel(a, test_addr(), true, &caller_ctx).await.unwrap();
        let _callee = spawn_channel(b, test_addr(), false, &callee_ctx).await.unwrap();
        (caller, caller_ctx)
    }

    fn greeter_registry() -> Arc<RpcHandlerRegistry> {
        RpcHandlerRegistry::builder()
            .bind("Greeter", "greet", 1, |mut args: DataBuf| {
                Box::pin(async move {
                    let name = args.read_string().map_err(|e| e.to_string())?;
                    let mut out = DataBuf::new();
                    out.write_string(&format!("hello {name}"))
                        .map_err(|e| e.to_string())?;
                    Ok(out)
                })
            })
            .bind("Greeter", "fail", 0, |_args: DataBuf| {
                Box::pin(async move { Err("intentional".to_string()) })
            })
            .bind("Greeter", "slow", 0, |_args: DataBuf| {
                Box::pin(async move {
                    tokio::time::sleep(Duration::from_secs(5)).await;
                    Ok(DataBuf::new())
                })
            })
            .build()
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn bound_method_returns_result() {
        let (caller, _ctx) = rpc_pair(greeter_registry()).await;
        let greeting: String = RpcSender::new("Greeter")
            .call("greet")
            .arg(&"armada".to_string())
            .unwrap()
            .fire_and_wait(&caller)
            .await
            .unwrap();
        assert_eq!(greeting, "hello armada");
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn unbound_method_is_a_typed_error() {
        let (caller, _ctx) = rpc_pair(greeter_registry()).await;
        let result: Result<String, _> = RpcSender::new("Greeter")
            .call("missing")
            .fire_and_wait(&caller)
            .await;
        match result {
            Err(RpcError::UnknownMethod {
                interface,
                method,
                arity,
            }) => {
                assert_eq!(interface, "Greeter");
                assert_eq!(method, "missing");
                assert_eq!(arity, 0);
            }
            other => panic!("expected UnknownMethod, got {other:?}"),
        }
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn arity_is_part_of_the_dispatch_key() {
        let (caller, _ctx) = rpc_pair(greeter_registry()).await;
        // greet is bound with one argument; calling with two misses the table.
        let result: Result<String, _> = RpcSender::new("Greeter")
            .call("greet")
            .arg(&"a".to_string())
            .unwrap()
            .arg(&"b".to_string())
            .unwrap()
            .fire_and_wait(&caller)
            .await;
        assert!(matches!(result, Err(RpcError::UnknownMethod { arity: 2, .. })));
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn slow_invoker_times_out_distinctly() {
        let (caller, _ctx) = rpc_pair(greeter_registry()).await;
        let result: Result<(), _> = RpcSender::new("Greeter")
            .timeout(Duration::from_millis(100))
            .call("slow")
            .fire_and_wait(&caller)
            .await;
        assert!(matches!(result, Err(RpcError::Timeout { .. })));
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn timeout_can_fall_back_to_default() {
        let (caller, _ctx) = rpc_pair(greeter_registry()).await;
        let fallback: String = RpcSender::new("Greeter")
            .timeout(Duration::from_millis(100))
            .call("slow")
            .fire_or_default(&caller)
            .await
            .unwrap();
        assert_eq!(fallback, String::default());
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn handler_failure_carries_the_message() {
        let (caller, _ctx) = rpc_pair(greeter_registry()).await;
        let result: Result<String, _> = RpcSender::new("Greeter")
            .call("fail")
            .fire_and_wait(&caller)
            .await;
        match result {
            Err(RpcError::Handler(message)) => assert_eq!(message, "intentional"),
            other => panic!("expected Handler error, got {other:?}"),
        }
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn fire_and_forget_runs_without_reply() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let registry = RpcHandlerRegistry::builder()
            .bind("Audit", "record", 1, move |mut args: DataBuf| {
                let tx = tx.clone();
                Box::pin(async move {
                    let entry = args.read_string().map_err(|e| e.to_string())?;
                    let _ = tx.send(entry);
                    Ok(DataBuf::new())
                })
            })
            .build();
        let (caller, caller_ctx) = rpc_pair(registry).await;

        RpcSender::new("Audit")
            .call("record")
            .arg(&"deploy".to_string())
            .unwrap()
            .fire(&caller)
            .unwrap();

        let entry = timeout(Duration::from_secs(2), rx.recv())
            .await
            .expect("invoker never ran")
            .unwrap();
        assert_eq!(entry, "deploy");
        assert_eq!(caller_ctx.query_manager.pending_count(), 0);
    }
}
