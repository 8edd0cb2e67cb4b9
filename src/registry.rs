// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

//! Service registry and reflective-in-spirit method dispatch (§4.3).
//!
//! Rust has no runtime reflection over arbitrary handler types, so instead
//! of scanning a live object's methods, a [`ServiceBuilder`] is handed a
//! fixed list of `(name, async closure)` pairs at registration time. The
//! compiler enforces each one's `(Args) -> Result<Reply, String>` shape
//! (Design Notes §9, option (b): compile-time generated dispatch stubs); the
//! runtime-visible surface — `find("Service.Method")`, `num_calls`,
//! duplicate-registration rejection — matches the original's `newService`/
//! `service.call` contract exactly (see `examples/original_source/
//! service_test.go`).

use std::{
    any::type_name,
    future::Future,
    panic::AssertUnwindSafe,
    sync::{
        Arc,
        atomic::{AtomicU64, Ordering},
    },
};

use dashmap::DashMap;
use futures_util::FutureExt;
use serde::{Serialize, de::DeserializeOwned};
use tracing::{debug, warn};

use crate::{
    codec::{DecodeInto, EncodeFrom},
    error::{Result, RpcError},
};

/// One exposed method of a registered service.
pub struct MethodDesc {
    pub name: String,
    num_calls: AtomicU64,
    handler: Box<dyn MethodHandler>,
}

impl MethodDesc {
    /// Completed-invocation counter, visible to instrumentation (the
    /// `/debug/mrpc` page reads this).
    pub fn num_calls(&self) -> u64 {
        self.num_calls.load(Ordering::Relaxed)
    }

    /// Fresh, codec-writable argument sink for this method.
    pub fn new_argv(&self) -> Box<dyn DecodeInto> {
        self.handler.new_argv()
    }

    /// Fresh, codec-writable reply slot for this method.
    pub fn new_reply(&self) -> Box<dyn ReplySlot> {
        self.handler.new_reply()
    }

    /// Invokes the method. Increments `num_calls` regardless of outcome,
    /// catches handler panics and turns them into [`RpcError::HandlerPanic`]
    /// rather than tearing down the session (§4.3).
    pub async fn call(&self, argv: &dyn DecodeInto, reply: &mut dyn ReplySlot) -> Result<()> {
        self.num_calls.fetch_add(1, Ordering::Relaxed);
        let result = AssertUnwindSafe(self.handler.invoke(argv, reply))
            .catch_unwind()
            .await;
        match result {
            Ok(inner) => inner,
            Err(panic) => {
                let msg = panic_message(&panic);
                warn!(method = %self.name, %msg, "handler panicked");
                Err(RpcError::HandlerPanic(msg))
            },
        }
    }
}

fn panic_message(panic: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic payload".to_string()
    }
}

/// A codec-writable reply value: lets the dispatcher hand handlers a
/// concrete `&mut U` while the session only ever sees `&mut dyn ReplySlot`.
pub trait ReplySlot: DecodeInto + EncodeFrom {}
impl<T> ReplySlot for T where T: DecodeInto + EncodeFrom {}

/// Type-erased per-method dispatcher, generated by [`ServiceBuilder::
/// method`] for each registered `(Args, &mut Reply) -> Result<(), String>`
/// closure.
trait MethodHandler: Send + Sync {
    fn new_argv(&self) -> Box<dyn DecodeInto>;
    fn new_reply(&self) -> Box<dyn ReplySlot>;
    fn invoke<'a>(
        &'a self,
        argv: &'a dyn DecodeInto,
        reply: &'a mut dyn ReplySlot,
    ) -> std::pin::Pin<Box<dyn Future<Output = Result<()>> + Send + 'a>>;
}

struct TypedMethod<Args, Reply, F> {
    f: F,
    _marker: std::marker::PhantomData<fn(Args, Reply)>,
}

impl<Args, Reply, F, Fut> MethodHandler for TypedMethod<Args, Reply, F>
where
    Args: DeserializeOwned + Default + Send + Sync + 'static,
    Reply: Serialize + Default + Send + Sync + 'static,
    F: Fn(Args, &mut Reply) -> Fut + Send + Sync,
    Fut: Future<Output = std::result::Result<(), String>> + Send,
{
    fn new_argv(&self) -> Box<dyn DecodeInto> {
        Box::new(Args::default())
    }

    fn new_reply(&self) -> Box<dyn ReplySlot> {
        Box::new(Reply::default())
    }

    fn invoke<'a>(
        &'a self,
        argv: &'a dyn DecodeInto,
        reply: &'a mut dyn ReplySlot,
    ) -> std::pin::Pin<Box<dyn Future<Output = Result<()>> + Send + 'a>> {
        Box::pin(async move {
            let argv = argv.as_any().downcast_ref::<Args>().unwrap_or_else(|| {
                panic!(
                    "registry/dispatch mismatch: expected argv of type {}",
                    type_name::<Args>()
                )
            });
            let reply = reply.as_any_mut().downcast_mut::<Reply>().unwrap_or_else(|| {
                panic!(
                    "registry/dispatch mismatch: expected reply of type {}",
                    type_name::<Reply>()
                )
            });
            (self.f)(argv.clone(), reply)
                .await
                .map_err(RpcError::Handler)
        })
    }
}

/// Builds a [`ServiceDesc`] one method at a time, the Rust-idiomatic
/// stand-in for reflective method enumeration.
pub struct ServiceBuilder {
    name: String,
    methods: Vec<(String, Box<dyn MethodHandler>)>,
}

impl ServiceBuilder {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            methods: Vec::new(),
        }
    }

    /// Registers a method eligible per §4.3's filter: exactly one argument
    /// beyond the implicit receiver, a mutable reply slot, and an error
    /// return — encoded here as `Fn(Args, &mut Reply) -> Future<Output =
    /// Result<(), String>>`.
    pub fn method<Args, Reply, F, Fut>(mut self, name: impl Into<String>, f: F) -> Self
    where
        Args: DeserializeOwned + Clone + Default + Send + Sync + 'static,
        Reply: Serialize + Default + Send + Sync + 'static,
        F: Fn(Args, &mut Reply) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = std::result::Result<(), String>> + Send + 'static,
    {
        self.methods.push((
            name.into(),
            Box::new(TypedMethod {
                f,
                _marker: std::marker::PhantomData,
            }),
        ));
        self
    }

    pub fn build(self) -> Arc<ServiceDesc> {
        let methods = DashMap::new();
        for (name, handler) in self.methods {
            methods.insert(
                name.clone(),
                Arc::new(MethodDesc {
                    name,
                    num_calls: AtomicU64::new(0),
                    handler,
                }),
            );
        }
        Arc::new(ServiceDesc {
            name: self.name,
            methods,
        })
    }
}

/// A registered handler: its name and the methods introspection selected
/// from it.
pub struct ServiceDesc {
    pub name: String,
    methods: DashMap<String, Arc<MethodDesc>>,
}

impl ServiceDesc {
    pub fn method(&self, name: &str) -> Option<Arc<MethodDesc>> {
        self.methods.get(name).map(|m| Arc::clone(m.value()))
    }

    pub fn methods(&self) -> Vec<Arc<MethodDesc>> {
        self.methods.iter().map(|e| Arc::clone(e.value())).collect()
    }
}

/// `services`: name → [`ServiceDesc`], concurrency-safe for read-mostly
/// access (§3).
#[derive(Default)]
pub struct ServiceRegistry {
    services: DashMap<String, Arc<ServiceDesc>>,
}

impl ServiceRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a service; fails if the name is already present (§4.3).
    pub fn register(&self, service: Arc<ServiceDesc>) -> Result<()> {
        match self.services.entry(service.name.clone()) {
            dashmap::mapref::entry::Entry::Occupied(_) => {
                Err(RpcError::DuplicateService(service.name.clone()))
            },
            dashmap::mapref::entry::Entry::Vacant(slot) => {
                debug!(service = %service.name, "registered service");
                slot.insert(service);
                Ok(())
            },
        }
    }

    /// Splits on the *last* `.`: `"Foo.Bar.Sum"` resolves service `"Foo.Bar"`
    /// method `"Sum"` (§4.3).
    pub fn find(&self, service_method: &str) -> Result<(Arc<ServiceDesc>, Arc<MethodDesc>)> {
        let dot = service_method
            .rfind('.')
            .ok_or_else(|| RpcError::IllFormedServiceMethod(service_method.to_string()))?;
        let (service_name, method_name) = (
            &service_method[..dot],
            &service_method[dot + 1..],
        );
        let service = self
            .services
            .get(service_name)
            .ok_or_else(|| RpcError::ServiceNotFound(service_name.to_string()))?;
        let method = service
            .method(method_name)
            .ok_or_else(|| RpcError::MethodNotFound(service_method.to_string()))?;
        Ok((Arc::clone(service.value()), method))
    }

    pub fn services(&self) -> Vec<Arc<ServiceDesc>> {
        self.services.iter().map(|e| Arc::clone(e.value())).collect()
    }
}

#[cfg(test)]
mod tests {
    use serde::Deserialize;

    use super::*;

    #[derive(Debug, Clone, Default, Serialize, Deserialize)]
    struct Args {
        num1: i64,
        num2: i64,
    }

    fn foo_service() -> Arc<ServiceDesc> {
        ServiceBuilder::new("Foo")
            .method("Sum", |args: Args, reply: &mut i64| async move {
                *reply = args.num1 + args.num2;
                Ok(())
            })
            .build()
    }

    #[tokio::test]
    async fn registers_and_calls_sum() {
        let svc = foo_service();
        let method = svc.method("Sum").unwrap();
        let mut argv: Args = Default::default();
        argv.num1 = 3;
        argv.num2 = 4;
        let mut reply: i64 = 0;
        method.call(&argv, &mut reply).await.unwrap();
        assert_eq!(reply, 7);
        assert_eq!(method.num_calls(), 1);
    }

    #[test]
    fn duplicate_registration_is_rejected() {
        let registry = ServiceRegistry::new();
        registry.register(foo_service()).unwrap();
        let err = registry.register(foo_service()).unwrap_err();
        assert!(matches!(err, RpcError::DuplicateService(_)));
    }

    #[test]
    fn find_splits_on_last_dot() {
        let registry = ServiceRegistry::new();
        registry.register(foo_service()).unwrap();
        let (svc, method) = registry.find("Foo.Sum").unwrap();
        assert_eq!(svc.name, "Foo");
        assert_eq!(method.name, "Sum");

        assert!(matches!(
            registry.find("Nonexistent"),
            Err(RpcError::IllFormedServiceMethod(_))
        ));
        assert!(matches!(
            registry.find("Bar.Sum"),
            Err(RpcError::ServiceNotFound(_))
        ));
        assert!(matches!(
            registry.find("Foo.Missing"),
            Err(RpcError::MethodNotFound(_))
        ));
    }
}
