//! Receiving side of the RPC layer.
//!
//! Invokers are bound into a dispatch table keyed by (interface, method,
//! arity) when the node assembles, then the table is frozen behind an `Arc`.
//! There is no runtime reflection: a request either hits a bound invoker or
//! is answered with an unknown-method status.

use crate::channel::{NetworkChannel, PacketListener};
use crate::error::NetworkError;
use armada_protocol::DataBuf;
use async_trait::async_trait;
use futures::future::BoxFuture;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use tracing::{debug, warn};

use super::{encode_handler_error, encode_ok, encode_unknown_method};

/// Lookup key for one bound invoker.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct MethodKey {
    pub interface: String,
    pub method: String,
    pub arity: usize,
}

impl MethodKey {
    pub fn new(interface: impl Into<String>, method: impl Into<String>, arity: usize) -> Self {
        Self {
            interface: interface.into(),
            method: method.into(),
            arity,
        }
    }
}

impl fmt::Display for MethodKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}::{}/{}", self.interface, self.method, self.arity)
    }
}

/// One bound method implementation. Receives the argument buffer positioned
/// at the first argument and produces the encoded result.
pub type RpcInvoker =
    Arc<dyn Fn(DataBuf) -> BoxFuture<'static, Result<DataBuf, String>> + Send + Sync>;

/// Immutable dispatch table.
pub struct RpcHandlerRegistry {
    invokers: HashMap<MethodKey, RpcInvoker>,
}

impl RpcHandlerRegistry {
    pub fn builder() -> RpcHandlerRegistryBuilder {
        RpcHandlerRegistryBuilder {
            invokers: HashMap::new(),
        }
    }

    pub fn get(&self, key: &MethodKey) -> Option<RpcInvoker> {
        self.invokers.get(key).cloned()
    }

    pub fn contains(&self, key: &MethodKey) -> bool {
        self.invokers.contains_key(key)
    }

    pub fn len(&self) -> usize {
        self.invokers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.invokers.is_empty()
    }
}

/// Collects invoker bindings at assembly time.
pub struct RpcHandlerRegistryBuilder {
    invokers: HashMap<MethodKey, RpcInvoker>,
}

impl RpcHandlerRegistryBuilder {
    /// Binds an invoker. A later binding for the same key replaces the
    /// earlier one.
    pub fn bind<F>(mut self, interface: &str, method: &str, arity: usize, invoker: F) -> Self
    where
        F: Fn(DataBuf) -> BoxFuture<'static, Result<DataBuf, String>> + Send + Sync + 'static,
    {
        let key = MethodKey::new(interface, method, arity);
        if self.invokers.insert(key.clone(), Arc::new(invoker)).is_some() {
            debug!(target = %key, "rpc binding replaced");
        }
        self
    }

    pub fn build(self) -> Arc<RpcHandlerRegistry> {
        Arc::new(RpcHandlerRegistry {
            invokers: self.invokers,
        })
    }
}

/// Packet listener that feeds inbound RPC frames through the dispatch table.
pub struct RpcPacketListener {
    registry: Arc<RpcHandlerRegistry>,
}

impl RpcPacketListener {
    pub fn new(registry: Arc<RpcHandlerRegistry>) -> Self {
        Self { registry }
    }
}

#[async_trait]
impl PacketListener for RpcPacketListener {
    async fn handle(
        &self,
        channel: &NetworkChannel,
        mut body: DataBuf,
    ) -> Result<Option<DataBuf>, NetworkError> {
        let interface = body.read_string()?;
        let method = body.read_string()?;
        let arity = body.read_var_u64()? as usize;
        let expects_result = body.read_bool()?;
        let args = body.read_buf()?;
        let key = MethodKey {
            interface,
            method,
            arity,
        };

        let Some(invoker) = self.registry.get(&key) else {
            debug!(channel = %channel.key(), target = %key, "rpc target not bound");
            if expects_result {
                return Ok(Some(encode_unknown_method()?));
            }
            return Ok(None);
        };

        match invoker(args).await {
            Ok(result) => {
                if expects_result {
                    Ok(Some(encode_ok(&result)?))
                } else {
                    Ok(None)
                }
            }
            Err(message) => {
                warn!(channel = %channel.key(), target = %key, error = %message, "rpc invoker failed");
                if expects_result {
                    Ok(Some(encode_handler_error(&message)?))
                } else {
                    Ok(None)
                }
            }
        }
    }
}
