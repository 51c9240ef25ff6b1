//! Chain client: betting contract reads, settlement transactions, event and block subscriptions

use std::future::Future;
use std::str::FromStr;
use std::time::Duration;

use alloy::{
    network::{EthereumWallet, ReceiptResponse},
    primitives::{Address, B256, U256},
    providers::{DynProvider, Provider, ProviderBuilder, WsConnect},
    rpc::types::{Filter, Log as RpcLog},
    signers::local::PrivateKeySigner,
    sol,
    sol_types::SolEvent,
};
use async_trait::async_trait;
use futures::stream::{BoxStream, StreamExt};
use sha3::{Digest, Sha3_256};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

#[cfg(test)]
use mockall::automock;

use crate::config::Config;
use crate::error::{BettingError, Result};
use crate::types::{
    Amount, BetAcceptedData, BetProposedData, BetSettledData, BetView, ContractEvent, EventData, NewBlock,
};

sol! {
    /// @title BettingContract
    /// @notice Peer-to-peer bets with a closing deadline, settled by an off-chain bot
    #[sol(rpc)]
    contract IBettingContract {
        // Events
        event BetProposed(uint256 indexed betId, address proposer, uint256 betAmount);
        event BetAccepted(uint256 indexed betId, address acceptor, uint256 betAmount);
        event BetSettled(uint256 indexed betId, address winner, uint256 winnings);

        // Functions needed for this service
        function totalBets() external view returns (uint256);

        function bets(uint256 betId) external view returns (
            address proposer,
            address acceptor,
            uint256 betAmount,
            uint256 closingTime,
            bool isActive
        );

        function settleBet(uint256 betId) external;
    }
}

pub type EventStream = BoxStream<'static, Result<ContractEvent>>;
pub type BlockStream = BoxStream<'static, NewBlock>;

/// Read and settle bets on the remote contract
#[cfg_attr(test, automock)]
#[async_trait]
pub trait BettingContract: Send + Sync {
    /// Count of bets ever created
    async fn total_bets(&self) -> Result<u64>;

    async fn bet(&self, bet_id: u64) -> Result<BetView>;

    /// Submit `settleBet(bet_id)` and wait until the transaction is mined
    async fn settle_bet(&self, bet_id: u64) -> Result<B256>;
}

/// Stream of decoded `BetProposed`, `BetAccepted` and `BetSettled` occurrences
#[async_trait]
pub trait EventSource: Send + Sync {
    async fn subscribe_bet_events(&self) -> Result<EventStream>;
}

/// Stream of new block signals
#[async_trait]
pub trait BlockSource: Send + Sync {
    async fn subscribe_blocks(&self) -> Result<BlockStream>;
}

/// How long to wait for a subscription to open, and how long to back off before reopening one
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SubscribePolicy {
    pub timeout: Duration,
    pub retry_delay: Duration,
}

/// Run a remote call with a time limit, abandoning it when `cancel` fires
pub async fn bounded<T, F>(operation: &str, limit: Duration, cancel: &CancellationToken, fut: F) -> Result<T>
where
    F: Future<Output = Result<T>>,
{
    tokio::select! {
        biased;
        _ = cancel.cancelled() => Err(BettingError::Cancelled(operation.to_string())),
        result = tokio::time::timeout(limit, fut) => match result {
            Ok(inner) => inner,
            Err(_) => Err(BettingError::Timeout {
                operation: operation.to_string(),
                secs: limit.as_secs(),
            }),
        },
    }
}

/// Reopen a subscription after a pause, retrying until it opens. `None` once `cancel` fires.
pub async fn resubscribe<T, F, Fut>(what: &str, policy: SubscribePolicy, cancel: &CancellationToken, mut open: F) -> Option<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    loop {
        tokio::select! {
            _ = cancel.cancelled() => return None,
            _ = tokio::time::sleep(policy.retry_delay) => {}
        }

        match bounded(what, policy.timeout, cancel, open()).await {
            Ok(subscription) => {
                info!("Resubscribed: {}", what);
                return Some(subscription);
            }
            Err(BettingError::Cancelled(_)) => return None,
            Err(e) => warn!("Failed to {}, retrying in {:?}: {}", what, policy.retry_delay, e),
        }
    }
}

/// Unique identifier of a log entry: SHA3-256 over the transaction hash and the position of the
/// log within that transaction. Both survive a reorg that re-includes the transaction elsewhere.
pub fn entry_hash(transaction_hash: B256, position: u64) -> String {
    let mut hasher = Sha3_256::new();
    hasher.update(transaction_hash.as_slice());
    hasher.update(position.to_be_bytes());
    format!("0x{}", hex::encode(hasher.finalize()))
}

/// Position of `log` among the logs of its transaction, given the logs of the transaction receipt.
///
/// `log_index` counts logs across the whole block, so it is rebased on the first log of the receipt.
/// A receipt from another block than the log (the log was reorged out meanwhile) is rejected.
pub fn position_in_transaction(log: &RpcLog, receipt_logs: &[RpcLog]) -> Result<u64> {
    let log_index = log
        .log_index
        .ok_or_else(|| BettingError::Decoding("Missing log index in a log".to_string()))?;

    if let (Some(log_block), Some(receipt_block)) = (log.block_hash, receipt_logs.first().and_then(|l| l.block_hash)) {
        if log_block != receipt_block {
            return Err(BettingError::Decoding(format!(
                "Log from block {} no longer canonical, receipt is in block {}",
                log_block, receipt_block
            )));
        }
    }

    let first = receipt_logs
        .iter()
        .filter_map(|l| l.log_index)
        .min()
        .ok_or_else(|| BettingError::Decoding("Transaction receipt without logs".to_string()))?;

    log_index
        .checked_sub(first)
        .ok_or_else(|| BettingError::Decoding(format!("Log index {} precedes its transaction", log_index)))
}

fn bet_id_from(value: U256) -> Result<u64> {
    u64::try_from(value).map_err(|_| BettingError::Decoding(format!("betId out of range: {}", value)))
}

fn decode_failed(event: &str, e: alloy::sol_types::Error) -> BettingError {
    BettingError::Decoding(format!("Failed to decode {} log: {}", event, e))
}

/// Decode a contract log into a bet event. `position` is the index of the log within its transaction.
pub fn decode_bet_event(log: &RpcLog, position: u64) -> Result<ContractEvent> {
    let transaction_hash = log
        .transaction_hash
        .ok_or_else(|| BettingError::Decoding("Missing transaction hash in a log".to_string()))?;
    let hash = entry_hash(transaction_hash, position);
    let topic0 = *log
        .topic0()
        .ok_or_else(|| BettingError::Decoding("Anonymous log without event signature".to_string()))?;

    let data = if topic0 == IBettingContract::BetProposed::SIGNATURE_HASH {
        let event = log
            .log_decode::<IBettingContract::BetProposed>()
            .map_err(|e| decode_failed("BetProposed", e))?
            .inner
            .data;
        EventData::Proposed(BetProposedData {
            bet_id: bet_id_from(event.betId)?,
            proposer: event.proposer.to_string(),
            bet_amount: Amount(event.betAmount),
        })
    } else if topic0 == IBettingContract::BetAccepted::SIGNATURE_HASH {
        let event = log
            .log_decode::<IBettingContract::BetAccepted>()
            .map_err(|e| decode_failed("BetAccepted", e))?
            .inner
            .data;
        EventData::Accepted(BetAcceptedData {
            bet_id: bet_id_from(event.betId)?,
            acceptor: event.acceptor.to_string(),
            bet_amount: Amount(event.betAmount),
        })
    } else if topic0 == IBettingContract::BetSettled::SIGNATURE_HASH {
        let event = log
            .log_decode::<IBettingContract::BetSettled>()
            .map_err(|e| decode_failed("BetSettled", e))?
            .inner
            .data;
        EventData::Settled(BetSettledData {
            bet_id: bet_id_from(event.betId)?,
            winner: event.winner.to_string(),
            winnings: Amount(event.winnings),
        })
    } else {
        return Err(BettingError::Decoding(format!("Unexpected event signature 0x{}", hex::encode(topic0))));
    };

    Ok(ContractEvent {
        hash,
        address: log.address(),
        block_number: log.block_number,
        transaction_hash: log.transaction_hash,
        data,
    })
}

/// Alloy backed chain client.
///
/// Calls and transactions go over HTTP. Subscriptions use the WebSocket provider when one is
/// configured, HTTP polling otherwise.
pub struct AlloyBettingClient {
    contract_address: Address,
    contract: IBettingContract::IBettingContractInstance<DynProvider>,
    http_rpc_provider: DynProvider,
    ws_rpc_provider: Option<DynProvider>,
    polling_interval: Duration,
    confirmation_timeout: Duration,
    required_confirmations: u64,
}

impl AlloyBettingClient {
    /// Connect to the node. Pass a signer for processes that submit transactions.
    pub async fn connect(config: &Config, signer: Option<PrivateKeySigner>) -> Result<Self> {
        let contract_address = config.contract_address()?;

        let http_rpc = reqwest::Url::from_str(&config.chain.rpc_url)
            .map_err(|e| BettingError::Configuration(format!("Invalid RPC URL: {}", e)))?;

        let http_rpc_provider = match signer {
            Some(signer) => {
                info!("Signing transactions as {}", signer.address());
                let wallet = EthereumWallet::from(signer);
                ProviderBuilder::new().wallet(wallet).connect_http(http_rpc).erased()
            }
            None => ProviderBuilder::new().connect_http(http_rpc).erased(),
        };

        let ws_rpc_provider = if config.subscription_protocol() == "ws" {
            let ws_rpc_url = config.chain.ws_rpc_url.clone().unwrap_or_default();
            let provider = ProviderBuilder::new()
                .connect_ws(WsConnect::new(ws_rpc_url.as_str()))
                .await
                .map_err(|e| BettingError::Provider(format!("Failed to connect to {}: {}", ws_rpc_url, e)))?;
            info!("Connected to WebSocket RPC endpoint");
            Some(provider.erased())
        } else {
            None
        };

        let chain_id = http_rpc_provider
            .get_chain_id()
            .await
            .map_err(|e| BettingError::Provider(format!("Failed to get chain id: {}", e)))?;
        if let Some(expected) = config.chain.chain_id {
            if expected != chain_id {
                return Err(BettingError::Configuration(format!(
                    "Chain ID mismatch: expected {}, got {}",
                    expected, chain_id
                )));
            }
        }
        info!("Chain ID: {}", chain_id);

        let contract = IBettingContract::new(contract_address, http_rpc_provider.clone());

        Ok(Self {
            contract_address,
            contract,
            http_rpc_provider,
            ws_rpc_provider,
            polling_interval: config.http_polling_interval(),
            confirmation_timeout: config.settlement.confirmation_timeout(),
            required_confirmations: config.settlement.required_confirmations,
        })
    }

    pub fn contract_address(&self) -> Address {
        self.contract_address
    }

    fn bet_events_filter(&self) -> Filter {
        Filter::new().address(self.contract_address).event_signature(vec![
            IBettingContract::BetProposed::SIGNATURE_HASH,
            IBettingContract::BetAccepted::SIGNATURE_HASH,
            IBettingContract::BetSettled::SIGNATURE_HASH,
        ])
    }
}

#[async_trait]
impl BettingContract for AlloyBettingClient {
    async fn total_bets(&self) -> Result<u64> {
        let total = self
            .contract
            .totalBets()
            .call()
            .await
            .map_err(|e| BettingError::ContractCall(format!("totalBets() failed: {}", e)))?;

        u64::try_from(total).map_err(|_| BettingError::ContractCall(format!("totalBets() out of range: {}", total)))
    }

    async fn bet(&self, bet_id: u64) -> Result<BetView> {
        let bet = self
            .contract
            .bets(U256::from(bet_id))
            .call()
            .await
            .map_err(|e| BettingError::ContractCall(format!("bets({}) failed: {}", bet_id, e)))?;

        Ok(BetView {
            bet_id,
            // a closing time past u64 is never reached
            closing_time: bet.closingTime.saturating_to::<u64>(),
            is_active: bet.isActive,
        })
    }

    async fn settle_bet(&self, bet_id: u64) -> Result<B256> {
        let pending_tx = self
            .contract
            .settleBet(U256::from(bet_id))
            .send()
            .await
            .map_err(|e| BettingError::Transaction(format!("settleBet({}) failed: {}", bet_id, e)))?;
        let tx_hash = *pending_tx.tx_hash();
        debug!(bet_id, %tx_hash, "settleBet submitted, waiting for receipt");

        let receipt = pending_tx
            .with_required_confirmations(self.required_confirmations)
            .with_timeout(Some(self.confirmation_timeout))
            .get_receipt()
            .await
            .map_err(|e| BettingError::Transaction(format!("Failed to get receipt for {}: {}", tx_hash, e)))?;

        if !receipt.status() {
            return Err(BettingError::Transaction(format!("settleBet({}) reverted in {}", bet_id, tx_hash)));
        }

        Ok(receipt.transaction_hash())
    }
}

/// Rebase the log on its transaction receipt, then decode it
async fn identify_and_decode(provider: &DynProvider, log: &RpcLog) -> Result<ContractEvent> {
    let tx_hash = log
        .transaction_hash
        .ok_or_else(|| BettingError::Decoding("Missing transaction hash in a log".to_string()))?;
    let receipt = provider
        .get_transaction_receipt(tx_hash)
        .await
        .map_err(|e| BettingError::Provider(format!("Failed to get receipt for {}: {}", tx_hash, e)))?
        .ok_or_else(|| BettingError::Decoding(format!("No receipt for {}, transaction reorged out", tx_hash)))?;

    let position = position_in_transaction(log, receipt.inner.logs())?;
    decode_bet_event(log, position)
}

#[async_trait]
impl EventSource for AlloyBettingClient {
    async fn subscribe_bet_events(&self) -> Result<EventStream> {
        let filter = self.bet_events_filter();

        let logs: BoxStream<'static, RpcLog> = match &self.ws_rpc_provider {
            Some(ws) => {
                let sub = ws
                    .subscribe_logs(&filter)
                    .await
                    .map_err(|e| BettingError::Provider(format!("Failed to subscribe to logs: {}", e)))?;
                info!("Subscribed to bet events of {} via WebSocket", self.contract_address);
                sub.into_stream().boxed()
            }
            None => {
                let poller = self
                    .http_rpc_provider
                    .watch_logs(&filter)
                    .await
                    .map_err(|e| BettingError::Provider(format!("Failed to install log filter: {}", e)))?;
                info!(
                    "Watching bet events of {} via HTTP polling (interval: {:?})",
                    self.contract_address, self.polling_interval
                );
                poller
                    .with_poll_interval(self.polling_interval)
                    .into_stream()
                    .flat_map(futures::stream::iter)
                    .boxed()
            }
        };

        let provider = self.http_rpc_provider.clone();
        let events = logs.filter_map(move |log| {
            let provider = provider.clone();
            async move {
                if log.removed {
                    warn!(tx_hash = ?log.transaction_hash, "Skipping log removed by a reorg");
                    return None;
                }
                Some(identify_and_decode(&provider, &log).await)
            }
        });

        Ok(events.boxed())
    }
}

#[async_trait]
impl BlockSource for AlloyBettingClient {
    async fn subscribe_blocks(&self) -> Result<BlockStream> {
        match &self.ws_rpc_provider {
            Some(ws) => {
                let sub = ws
                    .subscribe_blocks()
                    .await
                    .map_err(|e| BettingError::Provider(format!("Failed to subscribe to blocks: {}", e)))?;
                info!("Subscribed to new blocks via WebSocket");
                Ok(sub
                    .into_stream()
                    .map(|header| NewBlock {
                        number: Some(header.number),
                        hash: Some(header.hash),
                    })
                    .boxed())
            }
            None => {
                let poller = self
                    .http_rpc_provider
                    .watch_blocks()
                    .await
                    .map_err(|e| BettingError::Provider(format!("Failed to install block filter: {}", e)))?;
                info!("Watching new blocks via HTTP polling (interval: {:?})", self.polling_interval);
                Ok(poller
                    .with_poll_interval(self.polling_interval)
                    .into_stream()
                    .flat_map(futures::stream::iter)
                    .map(|hash| NewBlock {
                        number: None,
                        hash: Some(hash),
                    })
                    .boxed())
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use alloy::primitives::{address, b256, Log as PrimitiveLog};

    const CONTRACT: Address = address!("0x5FbDB2315678afecb367f032d93F642f64180aa3");
    const PROPOSER: Address = address!("0x70997970C51812dc3A010C7d01b50e0d17dc79C8");
    const TX: B256 = b256!("0x1111111111111111111111111111111111111111111111111111111111111111");

    fn rpc_log<E: SolEvent>(event: &E, tx: Option<B256>, index: Option<u64>) -> RpcLog {
        RpcLog {
            inner: PrimitiveLog {
                address: CONTRACT,
                data: event.encode_log_data(),
            },
            block_hash: None,
            block_number: Some(42),
            block_timestamp: None,
            transaction_hash: tx,
            transaction_index: Some(0),
            log_index: index,
            removed: false,
        }
    }

    #[test]
    fn test_entry_hash_is_stable_and_distinct() {
        let first = entry_hash(TX, 0);
        assert_eq!(first, entry_hash(TX, 0));
        assert_ne!(first, entry_hash(TX, 1));
        assert!(first.starts_with("0x"));
        assert_eq!(first.len(), 66);
    }

    #[test]
    fn test_decode_bet_proposed() {
        let event = IBettingContract::BetProposed {
            betId: U256::from(7),
            proposer: PROPOSER,
            betAmount: U256::from(100),
        };
        let decoded = decode_bet_event(&rpc_log(&event, Some(TX), Some(3)), 1).unwrap();

        assert_eq!(decoded.hash, entry_hash(TX, 1));
        assert_eq!(decoded.address, CONTRACT);
        assert_eq!(decoded.block_number, Some(42));
        assert_eq!(
            decoded.data,
            EventData::Proposed(BetProposedData {
                bet_id: 7,
                proposer: PROPOSER.to_string(),
                bet_amount: Amount::from(100u64),
            })
        );
    }

    fn in_block(mut log: RpcLog, block_hash: B256, block_number: u64, log_index: u64) -> RpcLog {
        log.block_hash = Some(block_hash);
        log.block_number = Some(block_number);
        log.log_index = Some(log_index);
        log
    }

    #[test]
    fn test_identity_survives_reinclusion_at_another_position() {
        let tx = b256!("0x2222222222222222222222222222222222222222222222222222222222222222");
        let first_block = b256!("0xaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaa");
        let second_block = b256!("0xbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbb");
        let event = IBettingContract::BetProposed {
            betId: U256::from(9),
            proposer: PROPOSER,
            betAmount: U256::from(100),
        };
        let base = rpc_log(&event, Some(tx), None);

        // second log of the transaction, block-wide index 5 in block 100
        let orphaned_receipt = vec![in_block(base.clone(), first_block, 100, 4), in_block(base.clone(), first_block, 100, 5)];
        let orphaned = orphaned_receipt[1].clone();
        // re-included in block 101, block-wide index 2
        let canonical_receipt = vec![in_block(base.clone(), second_block, 101, 1), in_block(base.clone(), second_block, 101, 2)];
        let canonical = canonical_receipt[1].clone();

        let before = position_in_transaction(&orphaned, &orphaned_receipt).unwrap();
        let after = position_in_transaction(&canonical, &canonical_receipt).unwrap();
        assert_eq!(before, 1);
        assert_eq!(after, 1);
        assert_eq!(
            decode_bet_event(&orphaned, before).unwrap().hash,
            decode_bet_event(&canonical, after).unwrap().hash
        );
    }

    #[test]
    fn test_log_from_replaced_block_rejected() {
        let event = IBettingContract::BetAccepted {
            betId: U256::from(1),
            acceptor: PROPOSER,
            betAmount: U256::from(10),
        };
        let base = rpc_log(&event, Some(TX), None);
        let stale = in_block(base.clone(), B256::with_last_byte(1), 100, 5);
        let receipt = vec![in_block(base, B256::with_last_byte(2), 101, 2)];

        let err = position_in_transaction(&stale, &receipt).unwrap_err();
        assert!(err.to_string().contains("no longer canonical"));
    }

    #[test]
    fn test_decode_bet_settled() {
        let event = IBettingContract::BetSettled {
            betId: U256::from(2),
            winner: PROPOSER,
            winnings: U256::from(500),
        };
        let decoded = decode_bet_event(&rpc_log(&event, Some(TX), Some(0)), 0).unwrap();
        assert_eq!(decoded.data.bet_id(), 2);
        assert_eq!(decoded.data.name().as_str(), "BetSettled");
    }

    #[test]
    fn test_log_without_identity_rejected() {
        let event = IBettingContract::BetAccepted {
            betId: U256::from(1),
            acceptor: PROPOSER,
            betAmount: U256::from(10),
        };
        assert!(matches!(
            decode_bet_event(&rpc_log(&event, None, Some(0)), 0),
            Err(BettingError::Decoding(_))
        ));
        let log = rpc_log(&event, Some(TX), None);
        assert!(matches!(
            position_in_transaction(&log, &[log.clone()]),
            Err(BettingError::Decoding(_))
        ));
    }

    #[test]
    fn test_oversized_bet_id_rejected() {
        let event = IBettingContract::BetProposed {
            betId: U256::MAX,
            proposer: PROPOSER,
            betAmount: U256::from(1),
        };
        let err = decode_bet_event(&rpc_log(&event, Some(TX), Some(0)), 0).unwrap_err();
        assert!(err.to_string().contains("betId out of range"));
    }

    #[tokio::test]
    async fn test_bounded_times_out() {
        let cancel = CancellationToken::new();
        let result: Result<()> = bounded("stuck call", Duration::from_millis(20), &cancel, async {
            tokio::time::sleep(Duration::from_secs(5)).await;
            Ok(())
        })
        .await;

        match result {
            Err(BettingError::Timeout { operation, .. }) => assert_eq!(operation, "stuck call"),
            other => panic!("expected timeout, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_bounded_observes_cancellation() {
        let cancel = CancellationToken::new();
        cancel.cancel();
        let result: Result<u64> = bounded("totalBets()", Duration::from_secs(5), &cancel, async { Ok(1) }).await;
        assert!(matches!(result, Err(BettingError::Cancelled(_))));
    }

    #[tokio::test]
    async fn test_bounded_passes_result_through() {
        let cancel = CancellationToken::new();
        let result = bounded("bets(0)", Duration::from_secs(1), &cancel, async { Ok::<_, BettingError>(5u64) }).await;
        assert_eq!(result.unwrap(), 5);
    }
}
