//! Collaborator boundaries: everything the engine needs from the rest of
//! the node, as traits with inert defaults for tests.

use std::sync::atomic::{AtomicI64, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};

use emberd_consensus::Hash256;
use emberd_primitives::transaction::Transaction;

use crate::validation::ValidationError;

/// Time source; tests drive it manually, the node uses the system clock with
/// the network-adjusted offset.
pub trait Clock: Send + Sync {
    fn now_seconds(&self) -> i64;
    fn now_micros(&self) -> i64;
    /// Network-adjusted wall clock used for header timestamp bounds.
    fn adjusted_time(&self) -> i64;
}

pub struct SystemClock;

impl Clock for SystemClock {
    fn now_seconds(&self) -> i64 {
        match SystemTime::now().duration_since(UNIX_EPOCH) {
            Ok(elapsed) => elapsed.as_secs() as i64,
            Err(_) => 0,
        }
    }

    fn now_micros(&self) -> i64 {
        match SystemTime::now().duration_since(UNIX_EPOCH) {
            Ok(elapsed) => elapsed.as_micros() as i64,
            Err(_) => 0,
        }
    }

    fn adjusted_time(&self) -> i64 {
        self.now_seconds()
    }
}

/// Deterministic clock for tests.
pub struct ManualClock {
    seconds: AtomicI64,
}

impl ManualClock {
    pub fn new(seconds: i64) -> Self {
        Self {
            seconds: AtomicI64::new(seconds),
        }
    }

    pub fn set(&self, seconds: i64) {
        self.seconds.store(seconds, Ordering::SeqCst);
    }

    pub fn advance(&self, seconds: i64) {
        self.seconds.fetch_add(seconds, Ordering::SeqCst);
    }
}

impl Clock for ManualClock {
    fn now_seconds(&self) -> i64 {
        self.seconds.load(Ordering::SeqCst)
    }

    fn now_micros(&self) -> i64 {
        self.now_seconds() * 1_000_000
    }

    fn adjusted_time(&self) -> i64 {
        self.now_seconds()
    }
}

impl<C: Clock + ?Sized> Clock for std::sync::Arc<C> {
    fn now_seconds(&self) -> i64 {
        self.as_ref().now_seconds()
    }

    fn now_micros(&self) -> i64 {
        self.as_ref().now_micros()
    }

    fn adjusted_time(&self) -> i64 {
        self.as_ref().adjusted_time()
    }
}

/// The mempool operations the engine drives around tip changes.
pub trait Mempool: Send {
    /// Resurrect a disconnected transaction without policy checks.
    fn add_unchecked(&mut self, tx: &Transaction);
    /// Drop transactions confirmed or conflicted by a connected block.
    fn remove_for_block(&mut self, transactions: &[Transaction], height: i32);
    /// Re-evaluate everything after a reorg to the given new height.
    fn remove_for_reorg(&mut self, new_height: i32);
    fn remove_recursive(&mut self, tx: &Transaction);
    fn trim_to_size(&mut self, max_bytes: usize);
    /// Internal consistency audit hook.
    fn check(&self);
    fn clear(&mut self);
    fn query_hashes(&self) -> Vec<Hash256>;
    /// A deployment whose rules the mempool cannot re-validate against has
    /// activated; the mempool wipes itself.
    fn on_deployment_activated(&mut self, name: &str);
}

/// Mempool that ignores everything; header-only tooling and tests.
#[derive(Default)]
pub struct NullMempool;

impl Mempool for NullMempool {
    fn add_unchecked(&mut self, _tx: &Transaction) {}
    fn remove_for_block(&mut self, _transactions: &[Transaction], _height: i32) {}
    fn remove_for_reorg(&mut self, _new_height: i32) {}
    fn remove_recursive(&mut self, _tx: &Transaction) {}
    fn trim_to_size(&mut self, _max_bytes: usize) {}
    fn check(&self) {}
    fn clear(&mut self) {}
    fn query_hashes(&self) -> Vec<Hash256> {
        Vec::new()
    }
    fn on_deployment_activated(&mut self, _name: &str) {}
}

/// User-facing surface for progress and fatal errors.
pub trait UiInterface: Send {
    fn show_progress(&self, title: &str, percent: u32);
    fn notify_block_tip(&self, initial_download: bool, hash: &Hash256, height: i32);
    /// Blocking message box used on the abort path.
    fn thread_safe_message_box(&self, message: &str);
}

#[derive(Default)]
pub struct NullUi;

impl UiInterface for NullUi {
    fn show_progress(&self, _title: &str, _percent: u32) {}
    fn notify_block_tip(&self, _initial_download: bool, _hash: &Hash256, _height: i32) {}
    fn thread_safe_message_box(&self, _message: &str) {}
}

/// Downstream notifications emitted by the engine. All arrive after the
/// corresponding state is flushed to the coin cache.
pub trait ChainNotifier: Send {
    fn tip_updated(&mut self, old_tip: Option<Hash256>, new_tip: Option<Hash256>);
    fn block_checked(&mut self, hash: &Hash256, result: &Result<(), ValidationError>);
    fn block_found(&mut self, hash: &Hash256);
    fn inventory(&mut self, hash: &Hash256);
    fn updated_transaction(&mut self, coinbase_txid: &Hash256);
    fn alert_notify(&mut self, message: &str);
    fn best_chain_persisted(&mut self, locator: &[Hash256]);
}

#[derive(Default)]
pub struct NullNotifier;

impl ChainNotifier for NullNotifier {
    fn tip_updated(&mut self, _old_tip: Option<Hash256>, _new_tip: Option<Hash256>) {}
    fn block_checked(&mut self, _hash: &Hash256, _result: &Result<(), ValidationError>) {}
    fn block_found(&mut self, _hash: &Hash256) {}
    fn inventory(&mut self, _hash: &Hash256) {}
    fn updated_transaction(&mut self, _coinbase_txid: &Hash256) {}
    fn alert_notify(&mut self, _message: &str) {}
    fn best_chain_persisted(&mut self, _locator: &[Hash256]) {}
}
