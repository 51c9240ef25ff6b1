use std::fmt;
use std::str::FromStr;

use alloy::primitives::{Address, B256, U256};
use serde::{Deserialize, Deserializer, Serialize, Serializer};

use crate::error::BettingError;

/// Names of the contract events mirrored into the store
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum EventName {
    BetProposed,
    BetAccepted,
    BetSettled,
}

impl EventName {
    pub const ALL: [EventName; 3] = [EventName::BetProposed, EventName::BetAccepted, EventName::BetSettled];

    pub fn as_str(&self) -> &'static str {
        match self {
            EventName::BetProposed => "BetProposed",
            EventName::BetAccepted => "BetAccepted",
            EventName::BetSettled => "BetSettled",
        }
    }
}

impl fmt::Display for EventName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for EventName {
    type Err = BettingError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "BetProposed" => Ok(EventName::BetProposed),
            "BetAccepted" => Ok(EventName::BetAccepted),
            "BetSettled" => Ok(EventName::BetSettled),
            other => Err(BettingError::Decoding(format!("Unknown event name: {}", other))),
        }
    }
}

/// Token amount in wei.
///
/// Serialized as a JSON number while it fits into `u64`, as a decimal string above that,
/// so `jsonb` payloads stay readable for ordinary amounts without losing precision.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Default, Hash)]
pub struct Amount(pub U256);

impl From<u64> for Amount {
    fn from(value: u64) -> Self {
        Amount(U256::from(value))
    }
}

impl From<U256> for Amount {
    fn from(value: U256) -> Self {
        Amount(value)
    }
}

impl fmt::Display for Amount {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl Serialize for Amount {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        match u64::try_from(self.0) {
            Ok(small) => serializer.serialize_u64(small),
            Err(_) => serializer.serialize_str(&self.0.to_string()),
        }
    }
}

impl<'de> Deserialize<'de> for Amount {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        #[derive(Deserialize)]
        #[serde(untagged)]
        enum Raw {
            Number(u64),
            Text(String),
        }

        match Raw::deserialize(deserializer)? {
            Raw::Number(n) => Ok(Amount::from(n)),
            Raw::Text(s) => U256::from_str(&s)
                .map(Amount)
                .map_err(|e| serde::de::Error::custom(format!("Invalid amount {}: {}", s, e))),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BetProposedData {
    pub bet_id: u64,
    pub proposer: String,
    pub bet_amount: Amount,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BetAcceptedData {
    pub bet_id: u64,
    pub acceptor: String,
    pub bet_amount: Amount,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BetSettledData {
    pub bet_id: u64,
    pub winner: String,
    pub winnings: Amount,
}

/// Event specific payload, stored as the `data` column
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum EventData {
    Proposed(BetProposedData),
    Accepted(BetAcceptedData),
    Settled(BetSettledData),
}

impl EventData {
    pub fn name(&self) -> EventName {
        match self {
            EventData::Proposed(_) => EventName::BetProposed,
            EventData::Accepted(_) => EventName::BetAccepted,
            EventData::Settled(_) => EventName::BetSettled,
        }
    }

    pub fn bet_id(&self) -> u64 {
        match self {
            EventData::Proposed(d) => d.bet_id,
            EventData::Accepted(d) => d.bet_id,
            EventData::Settled(d) => d.bet_id,
        }
    }
}

/// Bet event decoded from a contract log, with the identity of the log entry
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContractEvent {
    /// Unique per log entry, see [`crate::chain::entry_hash`]
    pub hash: String,
    pub address: Address,
    pub block_number: Option<u64>,
    pub transaction_hash: Option<B256>,
    pub data: EventData,
}

/// The unit of durable state
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EventRecord {
    pub hash: String,
    pub name: EventName,
    pub address: String,
    pub data: EventData,
}

impl From<&ContractEvent> for EventRecord {
    fn from(event: &ContractEvent) -> Self {
        Self {
            hash: event.hash.clone(),
            name: event.data.name(),
            address: event.address.to_string(),
            data: event.data.clone(),
        }
    }
}

/// Read-only view of a bet, fetched fresh on every scan
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BetView {
    pub bet_id: u64,
    /// Unix seconds
    pub closing_time: u64,
    pub is_active: bool,
}

impl BetView {
    /// Past its closing time and not settled yet
    pub fn is_due(&self, now: u64) -> bool {
        self.is_active && self.closing_time <= now
    }
}

/// New block signal. Polling over HTTP only yields hashes, WS subscriptions yield headers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct NewBlock {
    pub number: Option<u64>,
    pub hash: Option<B256>,
}

impl fmt::Display for NewBlock {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match (self.number, self.hash) {
            (Some(number), _) => write!(f, "#{}", number),
            (None, Some(hash)) => write!(f, "{}", hash),
            (None, None) => f.write_str("<unknown>"),
        }
    }
}
