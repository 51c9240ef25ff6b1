use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex};

use alloy::primitives::{Address, B256};
use async_trait::async_trait;
use futures::channel::mpsc::{unbounded, UnboundedSender};
use futures::StreamExt;
use tokio_util::sync::CancellationToken;

use betting_backend::chain::entry_hash;
use betting_backend::config::{RecorderCfg, SettlementCfg};
use betting_backend::types::{
    Amount, BetProposedData, BetSettledData, BetView, ContractEvent, EventData, EventName, EventRecord, NewBlock,
};
use betting_backend::{BettingContract, Clock, EventRecorder, EventStore, Result, SettlementScanner};

const NOW: u64 = 1_700_000_000;

struct FixedClock;

impl Clock for FixedClock {
    fn now(&self) -> u64 {
        NOW
    }
}

#[derive(Default)]
struct MemoryStore {
    records: Mutex<HashMap<String, EventRecord>>,
}

#[async_trait]
impl EventStore for MemoryStore {
    async fn create_event_record(&self, record: &EventRecord) -> Result<()> {
        let mut records = self.records.lock().unwrap();
        if records.contains_key(&record.hash) {
            return Err(betting_backend::BettingError::DuplicateEvent { hash: record.hash.clone() });
        }
        records.insert(record.hash.clone(), record.clone());
        Ok(())
    }
}

/// In-memory contract emitting `BetSettled` on settlement
struct LocalChain {
    bets: Mutex<BTreeMap<u64, BetView>>,
    events: Mutex<Option<UnboundedSender<Result<ContractEvent>>>>,
    tx_count: Mutex<u8>,
}

impl LocalChain {
    fn emit(&self, tx_hash: B256, data: EventData) {
        let event = ContractEvent {
            hash: entry_hash(tx_hash, 0),
            address: Address::ZERO,
            block_number: None,
            transaction_hash: Some(tx_hash),
            data,
        };
        if let Some(sender) = self.events.lock().unwrap().as_ref() {
            sender.unbounded_send(Ok(event)).unwrap();
        }
    }

    fn next_tx(&self) -> B256 {
        let mut count = self.tx_count.lock().unwrap();
        *count += 1;
        B256::with_last_byte(*count)
    }

    fn propose(&self, bet_id: u64, closing_time: u64) {
        self.bets
            .lock()
            .unwrap()
            .insert(bet_id, BetView { bet_id, closing_time, is_active: true });
        let tx_hash = self.next_tx();
        self.emit(
            tx_hash,
            EventData::Proposed(BetProposedData {
                bet_id,
                proposer: "0xAA".to_string(),
                bet_amount: Amount::from(100u64),
            }),
        );
    }

    fn close(&self) {
        self.events.lock().unwrap().take();
    }
}

#[async_trait]
impl BettingContract for LocalChain {
    async fn total_bets(&self) -> Result<u64> {
        Ok(self.bets.lock().unwrap().len() as u64)
    }

    async fn bet(&self, bet_id: u64) -> Result<BetView> {
        Ok(self.bets.lock().unwrap()[&bet_id])
    }

    async fn settle_bet(&self, bet_id: u64) -> Result<B256> {
        let tx_hash = self.next_tx();
        if let Some(bet) = self.bets.lock().unwrap().get_mut(&bet_id) {
            bet.is_active = false;
        }
        self.emit(
            tx_hash,
            EventData::Settled(BetSettledData {
                bet_id,
                winner: "0xAA".to_string(),
                winnings: Amount::from(200u64),
            }),
        );
        Ok(tx_hash)
    }
}

#[tokio::test]
async fn test_settlement_is_recorded() {
    let (sender, receiver) = unbounded();
    let chain = Arc::new(LocalChain {
        bets: Mutex::new(BTreeMap::new()),
        events: Mutex::new(Some(sender)),
        tx_count: Mutex::new(0),
    });
    chain.propose(0, NOW - 60);
    chain.propose(1, NOW + 3600);

    let store = Arc::new(MemoryStore::default());
    let recorder = EventRecorder::new(store.clone(), &RecorderCfg::default());
    let recording = tokio::spawn(recorder.run(receiver.boxed(), CancellationToken::new()));

    let scanner = Arc::new(
        SettlementScanner::new(chain.clone(), &SettlementCfg::default()).with_clock(Arc::new(FixedClock)),
    );
    let blocks = futures::stream::iter(vec![NewBlock { number: Some(1), hash: None }]).boxed();
    scanner.clone().run(blocks, CancellationToken::new()).await;

    // a later scan finds nothing left to settle
    let report = scanner.check_bets(&CancellationToken::new()).await.unwrap();
    assert_eq!(report.total_bets, 2);
    assert_eq!(report.due, 0);

    chain.close();
    let summary = recording.await.unwrap();
    assert_eq!(summary.received, 3);
    assert_eq!(summary.recorded, 3);

    let records = store.records.lock().unwrap();
    let settled: Vec<&EventRecord> = records.values().filter(|r| r.name == EventName::BetSettled).collect();
    assert_eq!(settled.len(), 1);
    assert_eq!(settled[0].data.bet_id(), 0);
    assert_eq!(
        serde_json::to_value(&settled[0].data).unwrap(),
        serde_json::json!({ "betId": 0, "winner": "0xAA", "winnings": 200 })
    );
}
