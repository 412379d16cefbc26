use std::sync::{Arc, Mutex, MutexGuard};

use crate::{
    allocation::Allocation,
    chain::{ChainFacade, Confirmation, Transaction},
    crypto::verify_ed25519,
    error::{Error, ErrorKind, Result},
};

struct ChainState {
    allocation: Allocation,
    transactions: Vec<Transaction>,
    submissions: usize,
    fail_submissions: usize,
    reject: Option<String>,
}

/// Chain that confirms every well-signed transaction it has seen.
#[derive(Clone)]
pub struct MockChain {
    state: Arc<Mutex<ChainState>>,
    sharders: usize,
}

impl MockChain {
    pub fn new(allocation: Allocation) -> Self {
        Self {
            state: Arc::new(Mutex::new(ChainState {
                allocation,
                transactions: vec![],
                submissions: 0,
                fail_submissions: 0,
                reject: None,
            })),
            sharders: 3,
        }
    }

    fn lock(&self) -> Result<MutexGuard<'_, ChainState>> {
        self.state
            .lock()
            .map_err(|_| Error::internal("chain state poisoned"))
    }

    pub fn transactions(&self) -> Vec<Transaction> {
        self.lock().map(|s| s.transactions.clone()).unwrap_or_default()
    }

    pub fn submissions(&self) -> usize {
        self.lock().map(|s| s.submissions).unwrap_or(0)
    }

    /// Fails the next `n` submissions with a send error.
    pub fn fail_submissions(&self, n: usize) {
        if let Ok(mut state) = self.lock() {
            state.fail_submissions = n;
        }
    }

    /// Every sharder reports transactions as rejected while set.
    pub fn reject_with(&self, reason: Option<&str>) {
        if let Ok(mut state) = self.lock() {
            state.reject = reason.map(str::to_string);
        }
    }

    pub fn update_allocation(&self, f: impl FnOnce(&mut Allocation)) {
        if let Ok(mut state) = self.lock() {
            f(&mut state.allocation);
        }
    }
}

impl ChainFacade for MockChain {
    async fn submit(&self, txn: &Transaction) -> Result<()> {
        let mut state = self.lock()?;
        state.submissions += 1;
        if state.fail_submissions > 0 {
            state.fail_submissions -= 1;
            return Err(Error::new(
                ErrorKind::TransactionSendError,
                "miners unreachable",
            ));
        }
        let signed = txn.hash == txn.compute_hash()
            && verify_ed25519(&txn.public_key, &txn.hash, &txn.signature).unwrap_or(false);
        if !signed {
            return Err(Error::new(
                ErrorKind::TransactionSendError,
                "transaction signature does not verify",
            ));
        }
        if !state.transactions.iter().any(|t| t.hash == txn.hash) {
            state.transactions.push(txn.clone());
        }
        Ok(())
    }

    fn sharder_count(&self) -> usize {
        self.sharders
    }

    async fn query_confirmation(&self, _sharder: usize, txn_hash: &str) -> Result<Confirmation> {
        let state = self.lock()?;
        if let Some(reason) = &state.reject {
            return Ok(Confirmation::Rejected {
                reason: reason.clone(),
            });
        }
        if state.transactions.iter().any(|t| t.hash == txn_hash) {
            Ok(Confirmation::Confirmed)
        } else {
            Ok(Confirmation::Pending)
        }
    }

    async fn allocation(&self, allocation_id: &str) -> Result<Allocation> {
        let state = self.lock()?;
        if state.allocation.id != allocation_id {
            return Err(Error::file_not_found(format!("allocation {}", allocation_id)));
        }
        Ok(state.allocation.clone())
    }
}
