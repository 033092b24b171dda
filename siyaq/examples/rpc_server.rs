//! Request-scoped services behind the RPC dispatcher.
//!
//! Each request gets its own context; a dispose listener commits or rolls
//! back the request's "transaction" before the response is printed.
//!
//! Run with `RUST_LOG=siyaq=debug cargo run --example rpc_server`.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::{Value, json};
use siyaq::prelude::*;
use tracing::info;

// === Singletons ===

/// Stand-in for a connection pool.
struct Ledger {
    next_id: AtomicU64,
    committed: Mutex<Vec<String>>,
}

impl Construct<Container> for Ledger {
    fn construct(_: &Container) -> Result<Self, BoxError> {
        Ok(Ledger {
            next_id: AtomicU64::new(1),
            committed: Mutex::new(Vec::new()),
        })
    }
}

// === Request-scoped services ===

/// Writes staged during one request.
struct Transaction {
    ledger: Arc<Ledger>,
    staged: Mutex<Vec<String>>,
}

impl Construct<ServiceContext> for Transaction {
    fn construct(context: &ServiceContext) -> Result<Self, BoxError> {
        Ok(Transaction {
            ledger: context.get_singleton(&Key::<Container, Ledger>::constructor())?,
            staged: Mutex::new(Vec::new()),
        })
    }
}

struct Orders {
    tx: Arc<Transaction>,
}

impl Construct<ServiceContext> for Orders {
    fn construct(context: &ServiceContext) -> Result<Self, BoxError> {
        Ok(Orders {
            tx: context.get_service(&Key::<ServiceContext, Transaction>::constructor())?,
        })
    }
}

#[async_trait]
impl RpcService for Orders {
    fn methods(&self) -> &'static [&'static str] {
        &["create", "list"]
    }

    async fn call(&self, method: &str, params: Value) -> Result<RpcOutput, BoxError> {
        match method {
            "create" => {
                let item = params["item"]
                    .as_str()
                    .ok_or_else(|| RpcError::new(422, "\"item\" must be a string"))?;
                let id = self.tx.ledger.next_id.fetch_add(1, Ordering::Relaxed);
                self.tx.staged.lock().push(format!("order {id}: {item}"));
                Ok(json!({ "id": id }).into())
            }
            _ => {
                let committed = self.tx.ledger.committed.lock().clone();
                Ok(json!(committed).into())
            }
        }
    }
}

// === Transport ===

struct Stdout;

#[async_trait]
impl ResponseSink for Stdout {
    async fn write(&mut self, status: u16, content_type: &str, body: Vec<u8>) -> Result<(), BoxError> {
        println!("<- {status} {content_type} {}", String::from_utf8_lossy(&body));
        Ok(())
    }
}

#[tokio::main]
async fn main() -> Result<(), BoxError> {
    init_tracing("siyaq=info,rpc_server=info");

    let container = Container::new();
    container.load(&Key::<Container, Ledger>::constructor())?;

    let tx_key = Key::<ServiceContext, Transaction>::constructor();
    container.on_dispose(move |context, error| {
        // Only requests that touched the transaction have anything to settle.
        let tx = context
            .has_service(&tx_key)
            .then(|| context.get_service(&tx_key));
        async move {
            let Some(tx) = tx else {
                return Ok::<(), BoxError>(());
            };
            let tx = tx?;
            let staged = std::mem::take(&mut *tx.staged.lock());
            match error {
                None => {
                    info!(writes = staged.len(), "commit");
                    tx.ledger.committed.lock().extend(staged);
                }
                Some(error) => info!(writes = staged.len(), %error, "rollback"),
            }
            Ok(())
        }
    });

    let dispatcher = Dispatcher::new();
    dispatcher.register("orders", Key::<ServiceContext, Orders>::constructor())?;

    let requests = [
        RpcRequest::new("orders.create", json!({ "item": "tea" })),
        RpcRequest::new("orders.create", json!({ "item": 7 })),
        RpcRequest::new("orders.list", json!({})),
        RpcRequest::new("orders.cancel", json!({})),
        RpcRequest::default(),
    ];

    for request in requests {
        println!("-> {}", serde_json::to_string(&request)?);
        let outcome = dispatcher
            .handle(container.create_context(), request, &mut Stdout)
            .await?;
        info!(?outcome, "request finished");
    }

    Ok(())
}
