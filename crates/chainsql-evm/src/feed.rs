//! The reorg-safe event feed.
//!
//! Two concurrent tasks: a head listener pushing new-head notifications into
//! a single-slot channel, and the main loop that windows a safe block range
//! behind the head, fetches logs, decodes them through the registry, and
//! emits per-block event groups in strictly increasing block order.
//!
//! Heights within `reorg_safety_depth` of the head are treated as
//! not-yet-final and are never queried; deeper reorganizations are
//! explicitly not handled.

use std::sync::Arc;

use async_trait::async_trait;
use futures::StreamExt;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use chainsql_core::config::FeedConfig;
use chainsql_core::error::FeedError;
use chainsql_core::event::EventKind;
use chainsql_core::feed::EventFeed;
use chainsql_core::types::{BlockEvents, BlockHeader};

use crate::client::{ChainClient, HeaderStream, LogFilter};
use crate::decode::EventDecoder;

/// `EventFeed` implementation over an EVM chain client.
pub struct EvmEventFeed<C> {
    client: Arc<C>,
    config: FeedConfig,
}

impl<C: ChainClient> EvmEventFeed<C> {
    pub fn new(client: Arc<C>, config: FeedConfig) -> Self {
        Self { client, config }
    }

    async fn run(
        &self,
        shutdown: &CancellationToken,
        mut from: u64,
        output: &mpsc::Sender<BlockEvents>,
        decoder: &EventDecoder,
        heads: &mut mpsc::Receiver<BlockHeader>,
    ) -> Result<(), FeedError> {
        loop {
            let header = tokio::select! {
                _ = shutdown.cancelled() => return Ok(()),
                received = heads.recv() => match received {
                    Some(header) => header,
                    None => return Err(FeedError::Subscribe("new-head subscription ended".into())),
                },
            };

            if header.number < self.config.reorg_safety_depth {
                // No height is eligible yet; height 0 is still unconfirmed.
                continue;
            }
            let safe_head = header.number - self.config.reorg_safety_depth;
            if safe_head < from {
                // The whole window is still within the safety margin.
                continue;
            }
            let to = safe_head.min(from.saturating_add(self.config.max_batch_size.max(1) - 1));

            let filter = LogFilter {
                address: self.config.contract_address.clone(),
                topic0: decoder.topic0_filter(),
                from_block: from,
                to_block: to,
            };
            let logs = match self.client.filter_logs(&filter).await {
                Ok(logs) => logs,
                Err(e) => {
                    warn!(from, to, error = %e, "log query failed; retrying on next head");
                    continue;
                }
            };
            debug!(from, to, logs = logs.len(), "fetched log window");

            // Logs arrive block-ordered from the node; group consecutive
            // same-block logs and emit each group at its block boundary.
            let mut last_emitted: Option<u64> = None;
            let mut group: Option<BlockEvents> = None;
            for log in &logs {
                let event = decoder.decode(log)?;
                match group.as_mut() {
                    Some(current) if current.block_number == log.block_number => {
                        current.events.push(event);
                    }
                    _ => {
                        if let Some(done) = group.take() {
                            last_emitted = Some(done.block_number);
                            if !send_block(shutdown, output, done).await {
                                return Ok(());
                            }
                        }
                        group = Some(BlockEvents {
                            block_number: log.block_number,
                            events: vec![event],
                        });
                    }
                }
            }
            if let Some(done) = group.take() {
                last_emitted = Some(done.block_number);
                if !send_block(shutdown, output, done).await {
                    return Ok(());
                }
            }

            // A round that emitted nothing does not advance the window, so
            // a transiently empty result cannot skip blocks.
            if let Some(last) = last_emitted {
                from = last + 1;
            }
        }
    }
}

#[async_trait]
impl<C: ChainClient + 'static> EventFeed for EvmEventFeed<C> {
    async fn start(
        &self,
        shutdown: CancellationToken,
        from_height: u64,
        output: mpsc::Sender<BlockEvents>,
        kinds: &[EventKind],
    ) -> Result<(), FeedError> {
        let decoder = if kinds.is_empty() {
            EventDecoder::all()
        } else {
            EventDecoder::new(kinds)
        };

        let heads = self
            .client
            .subscribe_new_heads()
            .await
            .map_err(|e| FeedError::Subscribe(e.to_string()))?;

        let (head_tx, mut head_rx) = mpsc::channel(1);
        let listener_shutdown = shutdown.child_token();
        let listener = tokio::spawn(listen_heads(heads, head_tx, listener_shutdown.clone()));

        let result = self
            .run(&shutdown, from_height, &output, &decoder, &mut head_rx)
            .await;

        // Always join the listener before returning, fatal error included.
        listener_shutdown.cancel();
        let _ = listener.await;
        result
    }
}

/// Head-subscription listener: forwards headers into the single-slot
/// channel until cancelled or the subscription ends. Item-level errors are
/// transient and only logged; the stream ending closes the channel, which
/// the main loop treats as fatal.
async fn listen_heads(
    mut heads: HeaderStream,
    tx: mpsc::Sender<BlockHeader>,
    shutdown: CancellationToken,
) {
    loop {
        let next = tokio::select! {
            _ = shutdown.cancelled() => return,
            next = heads.next() => next,
        };
        match next {
            Some(Ok(header)) => {
                tokio::select! {
                    _ = shutdown.cancelled() => return,
                    sent = tx.send(header) => {
                        if sent.is_err() {
                            return;
                        }
                    }
                }
            }
            Some(Err(e)) => warn!(error = %e, "head subscription error"),
            None => return,
        }
    }
}

/// Send one block group, racing cancellation. Returns `false` when the run
/// should stop (cancelled, or the consumer went away).
async fn send_block(
    shutdown: &CancellationToken,
    output: &mpsc::Sender<BlockEvents>,
    block: BlockEvents,
) -> bool {
    tokio::select! {
        _ = shutdown.cancelled() => false,
        sent = output.send(block) => sent.is_ok(),
    }
}

// ─── Tests ────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::ClientError;
    use alloy_dyn_abi::DynSolValue;
    use alloy_primitives::{Address, U256};
    use chainsql_core::event::TableEvent;
    use chainsql_core::types::LogEntry;
    use futures::stream;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Mutex as StdMutex;
    use std::time::Duration;

    /// Scripted chain client. Filters logs by block range only (like a node
    /// would, minus topic filtering, so decode-error paths stay reachable).
    struct MockClient {
        heads: Vec<BlockHeader>,
        logs: Vec<LogEntry>,
        queries: StdMutex<Vec<(u64, u64)>>,
        fail_first_query: AtomicBool,
        /// When set, the head stream ends after the scripted heads instead
        /// of staying pending.
        finite_heads: bool,
    }

    impl MockClient {
        fn new(heads: Vec<u64>, logs: Vec<LogEntry>) -> Self {
            Self {
                heads: heads
                    .into_iter()
                    .map(|number| BlockHeader {
                        number,
                        hash: format!("0x{number:064x}"),
                    })
                    .collect(),
                logs,
                queries: StdMutex::new(Vec::new()),
                fail_first_query: AtomicBool::new(false),
                finite_heads: false,
            }
        }

        fn queries(&self) -> Vec<(u64, u64)> {
            self.queries.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl ChainClient for MockClient {
        async fn subscribe_new_heads(&self) -> Result<HeaderStream, ClientError> {
            let items: Vec<Result<BlockHeader, ClientError>> =
                self.heads.clone().into_iter().map(Ok).collect();
            if self.finite_heads {
                Ok(Box::pin(stream::iter(items)))
            } else {
                Ok(Box::pin(stream::iter(items).chain(stream::pending())))
            }
        }

        async fn filter_logs(&self, filter: &LogFilter) -> Result<Vec<LogEntry>, ClientError> {
            self.queries
                .lock()
                .unwrap()
                .push((filter.from_block, filter.to_block));
            if self.fail_first_query.swap(false, Ordering::SeqCst) {
                return Err(ClientError::Rpc("connection reset".into()));
            }
            Ok(self
                .logs
                .iter()
                .filter(|l| l.block_number >= filter.from_block && l.block_number <= filter.to_block)
                .cloned()
                .collect())
        }
    }

    fn run_sql_log(block_number: u64, log_index: u32, statement: &str) -> LogEntry {
        let data = DynSolValue::Tuple(vec![
            DynSolValue::Address(Address::repeat_byte(0xaa)),
            DynSolValue::Uint(U256::from(1u64), 256),
            DynSolValue::String(statement.to_string()),
        ])
        .abi_encode_params();
        LogEntry {
            address: "0x00000000000000000000000000000000000000ff".into(),
            topics: vec![EventKind::RunSql.topic0()],
            data,
            block_number,
            tx_hash: format!("0x{block_number:x}{log_index:x}"),
            tx_index: 0,
            log_index,
        }
    }

    fn feed(client: Arc<MockClient>, depth: u64, batch: u64) -> Arc<EvmEventFeed<MockClient>> {
        Arc::new(EvmEventFeed::new(
            client,
            FeedConfig {
                chain_id: 1,
                contract_address: "0x00000000000000000000000000000000000000ff".into(),
                reorg_safety_depth: depth,
                max_batch_size: batch,
            },
        ))
    }

    async fn recv_block(rx: &mut mpsc::Receiver<BlockEvents>) -> BlockEvents {
        tokio::time::timeout(Duration::from_secs(5), rx.recv())
            .await
            .expect("timed out waiting for a block group")
            .expect("feed output closed unexpectedly")
    }

    #[tokio::test]
    async fn groups_per_block_in_increasing_order() {
        let client = Arc::new(MockClient::new(
            vec![102],
            vec![
                run_sql_log(100, 0, "insert into t values (1)"),
                run_sql_log(100, 1, "insert into t values (2)"),
                run_sql_log(101, 0, "insert into t values (3)"),
            ],
        ));
        let feed = feed(Arc::clone(&client), 1, 500);
        let shutdown = CancellationToken::new();
        let (tx, mut rx) = mpsc::channel(8);

        let token = shutdown.clone();
        let handle = tokio::spawn(async move { feed.start(token, 100, tx, &[]).await });

        let first = recv_block(&mut rx).await;
        assert_eq!(first.block_number, 100);
        assert_eq!(first.events.len(), 2);
        assert!(matches!(first.events[0], TableEvent::RunSql { .. }));

        let second = recv_block(&mut rx).await;
        assert_eq!(second.block_number, 101);
        assert_eq!(second.events.len(), 1);

        shutdown.cancel();
        handle.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn never_queries_inside_the_safety_margin() {
        let client = Arc::new(MockClient::new(
            vec![105],
            vec![
                run_sql_log(100, 0, "insert into t values (1)"),
                run_sql_log(101, 0, "insert into t values (2)"),
            ],
        ));
        let feed = feed(Arc::clone(&client), 5, 500);
        let shutdown = CancellationToken::new();
        let (tx, mut rx) = mpsc::channel(8);

        let token = shutdown.clone();
        let handle = tokio::spawn(async move { feed.start(token, 100, tx, &[]).await });

        let only = recv_block(&mut rx).await;
        assert_eq!(only.block_number, 100);

        shutdown.cancel();
        handle.await.unwrap().unwrap();
        assert_eq!(client.queries(), vec![(100, 100)]);
    }

    #[tokio::test]
    async fn head_below_depth_emits_nothing() {
        // A young chain whose head has not cleared the safety depth has no
        // eligible heights at all, block 0 included.
        let client = Arc::new(MockClient::new(
            vec![3],
            vec![run_sql_log(0, 0, "insert into t values (1)")],
        ));
        let feed = feed(Arc::clone(&client), 5, 500);
        let shutdown = CancellationToken::new();
        let (tx, mut rx) = mpsc::channel(8);

        let token = shutdown.clone();
        let handle = tokio::spawn(async move { feed.start(token, 0, tx, &[]).await });

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(rx.try_recv().is_err());

        shutdown.cancel();
        handle.await.unwrap().unwrap();
        assert!(client.queries().is_empty());
    }

    #[tokio::test]
    async fn empty_round_does_not_advance_window() {
        let client = Arc::new(MockClient::new(
            vec![102, 103],
            vec![run_sql_log(102, 0, "insert into t values (1)")],
        ));
        let feed = feed(Arc::clone(&client), 1, 500);
        let shutdown = CancellationToken::new();
        let (tx, mut rx) = mpsc::channel(8);

        let token = shutdown.clone();
        let handle = tokio::spawn(async move { feed.start(token, 100, tx, &[]).await });

        let only = recv_block(&mut rx).await;
        assert_eq!(only.block_number, 102);

        shutdown.cancel();
        handle.await.unwrap().unwrap();
        // Second round re-queries from 100: the empty first round did not
        // move the window.
        assert_eq!(client.queries(), vec![(100, 101), (100, 102)]);
    }

    #[tokio::test]
    async fn batch_size_caps_the_window() {
        let client = Arc::new(MockClient::new(vec![1000], vec![]));
        let feed = feed(Arc::clone(&client), 0, 10);
        let shutdown = CancellationToken::new();
        let (tx, _rx) = mpsc::channel(8);

        let token = shutdown.clone();
        let handle = tokio::spawn(async move { feed.start(token, 0, tx, &[]).await });

        tokio::time::sleep(Duration::from_millis(50)).await;
        shutdown.cancel();
        handle.await.unwrap().unwrap();
        assert_eq!(client.queries(), vec![(0, 9)]);
    }

    #[tokio::test]
    async fn unknown_signature_is_fatal() {
        let mut bogus = run_sql_log(100, 0, "insert into t values (1)");
        bogus.topics = vec![format!("0x{}", "de".repeat(32))];
        let client = Arc::new(MockClient::new(vec![101], vec![bogus]));
        let feed = feed(client, 1, 500);
        let (tx, _rx) = mpsc::channel(8);

        let result = feed.start(CancellationToken::new(), 100, tx, &[]).await;
        assert!(matches!(result, Err(FeedError::Decode(_))));
    }

    #[tokio::test]
    async fn transient_query_failure_retries_same_window() {
        let client = Arc::new(MockClient::new(
            vec![101, 101],
            vec![run_sql_log(100, 0, "insert into t values (1)")],
        ));
        client.fail_first_query.store(true, Ordering::SeqCst);
        let feed = feed(Arc::clone(&client), 1, 500);
        let shutdown = CancellationToken::new();
        let (tx, mut rx) = mpsc::channel(8);

        let token = shutdown.clone();
        let handle = tokio::spawn(async move { feed.start(token, 100, tx, &[]).await });

        let only = recv_block(&mut rx).await;
        assert_eq!(only.block_number, 100);

        shutdown.cancel();
        handle.await.unwrap().unwrap();
        // Same window on both attempts: no data loss across the failure.
        assert_eq!(client.queries(), vec![(100, 100), (100, 100)]);
    }

    #[tokio::test]
    async fn subscription_end_is_fatal() {
        let mut client = MockClient::new(vec![], vec![]);
        client.finite_heads = true;
        let feed = feed(Arc::new(client), 1, 500);
        let (tx, _rx) = mpsc::channel(8);

        let result = feed.start(CancellationToken::new(), 100, tx, &[]).await;
        assert!(matches!(result, Err(FeedError::Subscribe(_))));
    }

    #[tokio::test]
    async fn cancellation_returns_cleanly() {
        let client = Arc::new(MockClient::new(vec![], vec![]));
        let feed = feed(client, 1, 500);
        let shutdown = CancellationToken::new();
        let (tx, _rx) = mpsc::channel(8);

        let token = shutdown.clone();
        let handle = tokio::spawn(async move { feed.start(token, 100, tx, &[]).await });
        shutdown.cancel();
        handle.await.unwrap().unwrap();
    }
}
