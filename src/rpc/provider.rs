//! JSON-RPC providers over HTTP and WebSocket.
//!
//! Constructing a provider performs no I/O. HTTP providers follow new blocks
//! by polling `eth_blockNumber`; WebSocket providers use an
//! `eth_subscribe("newHeads")` subscription on a single connection task that
//! also routes request/response pairs by id.

use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use reqwest::Client;
use serde_json::{json, Value};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio_tungstenite::{connect_async, tungstenite::Message};
use tracing::{debug, info, instrument, warn};

use super::types::*;

const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

/// A connection to one RPC endpoint.
#[async_trait]
pub trait Provider: Send + Sync {
    fn endpoint(&self) -> &str;

    /// Raw JSON-RPC call.
    async fn request(&self, method: &str, params: Value) -> Result<Value>;

    /// Forward new block numbers and transport errors into `events`.
    ///
    /// Replaces any earlier subscription on this provider.
    async fn subscribe_blocks(&self, events: mpsc::UnboundedSender<BlockEvent>) -> Result<()>;

    /// Stop the subscription and release the connection.
    async fn close(&self);

    async fn block_number(&self) -> Result<u64> {
        parse_u64(&self.request("eth_blockNumber", json!([])).await?)
    }

    /// Transaction count including pending transactions.
    async fn transaction_count(&self, address: &str) -> Result<u64> {
        parse_u64(
            &self
                .request("eth_getTransactionCount", json!([address, "pending"]))
                .await?,
        )
    }

    /// Gas price in wei.
    async fn gas_price(&self) -> Result<u128> {
        parse_quantity(&self.request("eth_gasPrice", json!([])).await?)
    }
}

/// Creates providers for endpoints.
pub trait ProviderFactory: Send + Sync {
    fn connect(&self, endpoint: &str) -> Result<Arc<dyn Provider>>;
}

fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

// ==================== HTTP ====================

#[derive(Clone)]
struct HttpRpc {
    http: Client,
    endpoint: String,
    next_id: Arc<AtomicU64>,
}

impl HttpRpc {
    async fn call(&self, method: &str, params: Value) -> Result<Value> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let response = self
            .http
            .post(&self.endpoint)
            .json(&JsonRpcRequest::new(id, method, params))
            .send()
            .await
            .with_context(|| format!("Failed to call {}", method))?;

        let message: JsonRpcMessage = response
            .json()
            .await
            .with_context(|| format!("Failed to parse {} response", method))?;
        message.into_result()
    }
}

/// JSON-RPC over HTTP with polled block subscriptions.
pub struct HttpProvider {
    rpc: HttpRpc,
    poll_interval: Duration,
    poller: Mutex<Option<JoinHandle<()>>>,
}

impl HttpProvider {
    pub fn new(endpoint: &str, poll_interval: Duration) -> Result<Self> {
        let http = Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .build()
            .context("Failed to create HTTP client")?;

        Ok(Self {
            rpc: HttpRpc {
                http,
                endpoint: endpoint.to_string(),
                next_id: Arc::new(AtomicU64::new(1)),
            },
            poll_interval,
            poller: Mutex::new(None),
        })
    }
}

#[async_trait]
impl Provider for HttpProvider {
    fn endpoint(&self) -> &str {
        &self.rpc.endpoint
    }

    #[instrument(skip(self, params), fields(endpoint = %self.rpc.endpoint))]
    async fn request(&self, method: &str, params: Value) -> Result<Value> {
        self.rpc.call(method, params).await
    }

    async fn subscribe_blocks(&self, events: mpsc::UnboundedSender<BlockEvent>) -> Result<()> {
        let rpc = self.rpc.clone();
        let poll_interval = self.poll_interval;

        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(poll_interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            let mut last_block: Option<u64> = None;

            loop {
                ticker.tick().await;
                let polled = rpc
                    .call("eth_blockNumber", json!([]))
                    .await
                    .and_then(|value| parse_u64(&value));
                let event = match polled {
                    Ok(block) if last_block.map_or(true, |last| block > last) => {
                        last_block = Some(block);
                        BlockEvent::NewBlock(block)
                    }
                    Ok(_) => continue,
                    Err(e) => BlockEvent::Error(e.to_string()),
                };
                if events.send(event).is_err() {
                    debug!(endpoint = %rpc.endpoint, "Block receiver dropped, stopping poller");
                    return;
                }
            }
        });

        if let Some(previous) = lock(&self.poller).replace(handle) {
            previous.abort();
        }
        info!(endpoint = %self.rpc.endpoint, "Polling for new blocks");
        Ok(())
    }

    async fn close(&self) {
        if let Some(poller) = lock(&self.poller).take() {
            poller.abort();
        }
    }
}

impl Drop for HttpProvider {
    fn drop(&mut self) {
        if let Some(poller) = lock(&self.poller).take() {
            poller.abort();
        }
    }
}

// ==================== WebSocket ====================

enum WsCommand {
    Request {
        method: String,
        params: Value,
        reply: oneshot::Sender<Result<Value>>,
    },
    Subscribe {
        events: mpsc::UnboundedSender<BlockEvent>,
        reply: oneshot::Sender<Result<()>>,
    },
}

enum PendingReply {
    Request(oneshot::Sender<Result<Value>>),
    Subscribe {
        events: mpsc::UnboundedSender<BlockEvent>,
        reply: oneshot::Sender<Result<()>>,
    },
}

struct BlockSubscription {
    id: String,
    events: mpsc::UnboundedSender<BlockEvent>,
}

struct WsConnection {
    commands: mpsc::UnboundedSender<WsCommand>,
    task: JoinHandle<()>,
}

/// JSON-RPC over a WebSocket with a `newHeads` subscription.
pub struct WsProvider {
    endpoint: String,
    connection: tokio::sync::Mutex<Option<WsConnection>>,
}

impl WsProvider {
    pub fn new(endpoint: &str) -> Self {
        Self {
            endpoint: endpoint.to_string(),
            connection: tokio::sync::Mutex::new(None),
        }
    }

    /// Command channel of the live connection, connecting first if needed.
    async fn commands(&self) -> Result<mpsc::UnboundedSender<WsCommand>> {
        let mut connection = self.connection.lock().await;
        if let Some(live) = connection.as_ref().filter(|c| !c.task.is_finished()) {
            return Ok(live.commands.clone());
        }

        let (stream, _) = connect_async(self.endpoint.as_str())
            .await
            .with_context(|| format!("Failed to connect to {}", self.endpoint))?;
        info!(endpoint = %self.endpoint, "WebSocket connected");

        let (commands, rx) = mpsc::unbounded_channel();
        let task = tokio::spawn(run_connection(self.endpoint.clone(), stream, rx));
        *connection = Some(WsConnection {
            commands: commands.clone(),
            task,
        });
        Ok(commands)
    }
}

#[async_trait]
impl Provider for WsProvider {
    fn endpoint(&self) -> &str {
        &self.endpoint
    }

    #[instrument(skip(self, params), fields(endpoint = %self.endpoint))]
    async fn request(&self, method: &str, params: Value) -> Result<Value> {
        let (reply, rx) = oneshot::channel();
        self.commands()
            .await?
            .send(WsCommand::Request {
                method: method.to_string(),
                params,
                reply,
            })
            .map_err(|_| anyhow!("connection to {} closed", self.endpoint))?;

        tokio::time::timeout(REQUEST_TIMEOUT, rx)
            .await
            .with_context(|| format!("{} timed out", method))?
            .with_context(|| format!("connection dropped during {}", method))?
    }

    async fn subscribe_blocks(&self, events: mpsc::UnboundedSender<BlockEvent>) -> Result<()> {
        let (reply, rx) = oneshot::channel();
        self.commands()
            .await?
            .send(WsCommand::Subscribe { events, reply })
            .map_err(|_| anyhow!("connection to {} closed", self.endpoint))?;

        tokio::time::timeout(REQUEST_TIMEOUT, rx)
            .await
            .context("eth_subscribe timed out")?
            .context("connection dropped during eth_subscribe")?
    }

    async fn close(&self) {
        if let Some(connection) = self.connection.lock().await.take() {
            connection.task.abort();
            info!(endpoint = %self.endpoint, "WebSocket closed");
        }
    }
}

impl Drop for WsProvider {
    fn drop(&mut self) {
        if let Some(connection) = self.connection.get_mut().take() {
            connection.task.abort();
        }
    }
}

async fn run_connection<S>(endpoint: String, stream: S, mut commands: mpsc::UnboundedReceiver<WsCommand>)
where
    S: futures_util::Stream<Item = Result<Message, tokio_tungstenite::tungstenite::Error>>
        + futures_util::Sink<Message, Error = tokio_tungstenite::tungstenite::Error>
        + Unpin,
{
    let (mut write, mut read) = stream.split();
    let mut pending: HashMap<u64, PendingReply> = HashMap::new();
    let mut subscription: Option<BlockSubscription> = None;
    let mut next_id: u64 = 1;

    let close_reason = loop {
        tokio::select! {
            command = commands.recv() => {
                let Some(command) = command else {
                    break "provider dropped".to_string();
                };
                let id = next_id;
                next_id += 1;
                let (request, reply) = match command {
                    WsCommand::Request { method, params, reply } => {
                        (JsonRpcRequest::new(id, &method, params).to_json(), PendingReply::Request(reply))
                    }
                    WsCommand::Subscribe { events, reply } => (
                        JsonRpcRequest::new(id, "eth_subscribe", json!(["newHeads"])).to_json(),
                        PendingReply::Subscribe { events, reply },
                    ),
                };
                if let Err(e) = write.send(Message::Text(request.into())).await {
                    break format!("send failed: {}", e);
                }
                pending.insert(id, reply);
            }
            message = read.next() => match message {
                Some(Ok(Message::Text(text))) => {
                    dispatch(&text.to_string(), &mut pending, &mut subscription);
                }
                Some(Ok(Message::Ping(data))) => {
                    if let Err(e) = write.send(Message::Pong(data)).await {
                        break format!("pong failed: {}", e);
                    }
                }
                Some(Ok(Message::Close(_))) | None => break "closed by server".to_string(),
                Some(Err(e)) => break format!("read failed: {}", e),
                Some(Ok(_)) => {}
            }
        }
    };

    warn!(%endpoint, reason = %close_reason, "WebSocket connection ended");
    if let Some(subscription) = subscription {
        let _ = subscription.events.send(BlockEvent::Error(close_reason));
    }
}

/// Route one inbound frame to its pending request or the subscription.
fn dispatch(
    text: &str,
    pending: &mut HashMap<u64, PendingReply>,
    subscription: &mut Option<BlockSubscription>,
) {
    let message: JsonRpcMessage = match serde_json::from_str(text) {
        Ok(message) => message,
        Err(e) => {
            warn!(error = %e, "Unparseable RPC frame");
            return;
        }
    };

    if let Some(params) = message.params {
        let Some(active) = subscription.as_ref().filter(|s| s.id == params.subscription) else {
            debug!(subscription = %params.subscription, "Notification for unknown subscription");
            return;
        };
        let event = match head_number(&params.result) {
            Ok(block) => BlockEvent::NewBlock(block),
            Err(e) => BlockEvent::Error(e.to_string()),
        };
        let _ = active.events.send(event);
        return;
    }

    let Some(id) = message.id else {
        return;
    };
    match pending.remove(&id) {
        Some(PendingReply::Request(reply)) => {
            let _ = reply.send(message.into_result());
        }
        Some(PendingReply::Subscribe { events, reply }) => {
            let subscribed = message.into_result().and_then(|value| {
                value
                    .as_str()
                    .map(str::to_string)
                    .context("subscription id is not a string")
            });
            match subscribed {
                Ok(id) => {
                    debug!(subscription = %id, "Subscribed to new heads");
                    *subscription = Some(BlockSubscription { id, events });
                    let _ = reply.send(Ok(()));
                }
                Err(e) => {
                    let _ = reply.send(Err(e));
                }
            }
        }
        None => debug!(id, "Response for unknown request"),
    }
}

// ==================== Factory ====================

/// Picks a WebSocket provider for `ws(s)://` endpoints and HTTP otherwise.
#[derive(Debug, Clone)]
pub struct DefaultProviderFactory {
    http_poll_interval: Duration,
}

impl DefaultProviderFactory {
    pub fn new(http_poll_interval: Duration) -> Self {
        Self { http_poll_interval }
    }
}

impl ProviderFactory for DefaultProviderFactory {
    fn connect(&self, endpoint: &str) -> Result<Arc<dyn Provider>> {
        if endpoint.starts_with("ws://") || endpoint.starts_with("wss://") {
            Ok(Arc::new(WsProvider::new(endpoint)))
        } else {
            Ok(Arc::new(HttpProvider::new(endpoint, self.http_poll_interval)?))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::{body_partial_json, method};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    async fn rpc_server(rpc_method: &str, result: Value) -> MockServer {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(body_partial_json(json!({ "method": rpc_method })))
            .respond_with(
                ResponseTemplate::new(200).set_body_json(json!({"jsonrpc": "2.0", "id": 1, "result": result})),
            )
            .mount(&server)
            .await;
        server
    }

    #[tokio::test]
    async fn test_http_reads() {
        let server = rpc_server("eth_getTransactionCount", json!("0x2a")).await;
        Mock::given(method("POST"))
            .and(body_partial_json(json!({ "method": "eth_gasPrice" })))
            .respond_with(
                ResponseTemplate::new(200).set_body_json(json!({"jsonrpc": "2.0", "id": 2, "result": "0x3b9aca00"})),
            )
            .mount(&server)
            .await;

        let provider = HttpProvider::new(&server.uri(), Duration::from_millis(10)).unwrap();

        assert_eq!(provider.transaction_count("0xmaker").await.unwrap(), 42);
        assert_eq!(provider.gas_price().await.unwrap(), 1_000_000_000);
    }

    #[tokio::test]
    async fn test_http_subscription_emits_each_block_once() {
        let server = rpc_server("eth_blockNumber", json!("0x64")).await;
        let provider = HttpProvider::new(&server.uri(), Duration::from_millis(10)).unwrap();
        let (tx, mut rx) = mpsc::unbounded_channel();

        provider.subscribe_blocks(tx).await.unwrap();
        let first = tokio::time::timeout(Duration::from_secs(5), rx.recv()).await.unwrap();
        assert_eq!(first, Some(BlockEvent::NewBlock(100)));

        // Same head on later polls: nothing new.
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(rx.try_recv().is_err());

        provider.close().await;
        let ended = tokio::time::timeout(Duration::from_secs(5), rx.recv()).await.unwrap();
        assert_eq!(ended, None);
    }

    #[test]
    fn test_dispatch_routes_responses_and_notifications() {
        let mut pending = HashMap::new();
        let mut subscription = None;
        let (reply, mut reply_rx) = oneshot::channel();
        let (sub_reply, mut sub_rx) = oneshot::channel();
        let (events, mut events_rx) = mpsc::unbounded_channel();
        pending.insert(1, PendingReply::Request(reply));
        pending.insert(2, PendingReply::Subscribe { events, reply: sub_reply });

        dispatch(r#"{"jsonrpc":"2.0","id":1,"result":"0x5"}"#, &mut pending, &mut subscription);
        dispatch(r#"{"jsonrpc":"2.0","id":2,"result":"0xsub"}"#, &mut pending, &mut subscription);
        dispatch(
            r#"{"jsonrpc":"2.0","method":"eth_subscription","params":{"subscription":"0xsub","result":{"number":"0x7"}}}"#,
            &mut pending,
            &mut subscription,
        );
        dispatch(
            r#"{"jsonrpc":"2.0","method":"eth_subscription","params":{"subscription":"0xother","result":{"number":"0x8"}}}"#,
            &mut pending,
            &mut subscription,
        );

        assert_eq!(reply_rx.try_recv().unwrap().unwrap(), json!("0x5"));
        assert!(sub_rx.try_recv().unwrap().is_ok());
        assert_eq!(events_rx.try_recv().unwrap(), BlockEvent::NewBlock(7));
        assert!(events_rx.try_recv().is_err());
        assert!(pending.is_empty());
    }

    #[tokio::test]
    async fn test_factory_connects_lazily() {
        let factory = DefaultProviderFactory::new(Duration::from_secs(2));

        let ws = factory.connect("wss://unreachable.invalid").unwrap();
        let http = factory.connect("https://unreachable.invalid").unwrap();

        assert_eq!(ws.endpoint(), "wss://unreachable.invalid");
        assert_eq!(http.endpoint(), "https://unreachable.invalid");
    }
}
