//! Off-chain companion services of the betting contract: an event recorder mirroring
//! `BetProposed`, `BetAccepted` and `BetSettled` into PostgreSQL, and a settlement bot
//! settling bets past their closing time on every new block.

pub mod chain;
pub mod config;
pub mod error;
pub mod recorder;
pub mod scanner;
pub mod store;
pub mod types;

pub use chain::{AlloyBettingClient, BettingContract, BlockSource, EventSource, SubscribePolicy};
pub use config::{Config, Role};
pub use error::{BettingError, Result};
pub use recorder::{EventRecorder, RecorderSummary};
pub use scanner::{Clock, ScanReport, SettlementScanner, SystemClock};
pub use store::{EventStore, PgEventStore};
