use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use chrono::Utc;
use dashmap::DashMap;
use tracing::info;
use uuid::Uuid;

use skillswap_db::Database;
use skillswap_db::queries::{insert_transaction, update_transaction_status};
use skillswap_types::models::{CreditTransaction, SYSTEM_ACCOUNT, TransactionStatus};

use crate::error::{BookingError, Result};

/// Append-only credit ledger with balances derived from completed transfers.
///
/// Every balance-affecting operation takes the per-user locks of both parties
/// (in id order) before reading a balance, so two bookings can never both
/// pass the balance check against the same stale value. Pending reservations
/// do not count against a balance; `commit` re-checks it instead.
pub struct CreditLedger {
    db: Arc<Database>,
    locks: DashMap<Uuid, Arc<Mutex<()>>>,
}

impl CreditLedger {
    pub fn new(db: Arc<Database>) -> Self {
        Self {
            db,
            locks: DashMap::new(),
        }
    }

    /// Completed credits received minus completed credits sent.
    pub fn balance(&self, user_id: Uuid) -> Result<i64> {
        Ok(self.db.completed_balance(user_id)?)
    }

    pub fn get(&self, id: Uuid) -> Result<CreditTransaction> {
        self.db
            .get_transaction(id)?
            .ok_or_else(|| BookingError::NotFound(format!("transaction {}", id)))
    }

    pub fn transactions_for(&self, user_id: Uuid) -> Result<Vec<CreditTransaction>> {
        Ok(self.db.transactions_for_user(user_id)?)
    }

    /// Mint `amount` credits from the system account, completed immediately.
    pub fn grant(&self, to_user_id: Uuid, amount: i64) -> Result<CreditTransaction> {
        validate_amount(amount)?;
        self.locked(&[to_user_id], || {
            let now = Utc::now();
            let tx = CreditTransaction {
                id: Uuid::new_v4(),
                from_user_id: SYSTEM_ACCOUNT,
                to_user_id,
                amount,
                session_id: None,
                status: TransactionStatus::Completed,
                created_at: now,
                settled_at: Some(now),
            };
            self.db.with_conn(|conn| insert_transaction(conn, &tx))?;

            info!("Granted {} credits to {}", amount, to_user_id);
            Ok(tx)
        })
    }

    /// Create a pending transfer for a session. Fails if the payer's completed
    /// balance cannot cover `amount`.
    ///
    /// A session has at most one live transfer. A pending transfer for the
    /// same parties and amount is returned as is, so a retried reserve never
    /// creates a second one. A pending transfer with a different amount is
    /// replaced. Anything else live for the session is an error.
    pub fn reserve(
        &self,
        from_user_id: Uuid,
        to_user_id: Uuid,
        amount: i64,
        session_id: Uuid,
    ) -> Result<Uuid> {
        validate_amount(amount)?;
        if from_user_id == to_user_id {
            return Err(BookingError::Validation(
                "cannot transfer credits to yourself".into(),
            ));
        }

        self.locked(&[from_user_id, to_user_id], || {
            self.ensure_covered(from_user_id, amount)?;

            if let Some(existing) = self.db.live_transaction_for_session(session_id)? {
                let same_parties = existing.from_user_id == from_user_id
                    && existing.to_user_id == to_user_id;
                match existing.status {
                    TransactionStatus::Pending if same_parties && existing.amount == amount => {
                        info!(
                            "Reusing reservation {} for session {}",
                            existing.id, session_id
                        );
                        return Ok(existing.id);
                    }
                    TransactionStatus::Pending if same_parties => {
                        let replaced = self.settle(existing, TransactionStatus::Cancelled)?;
                        info!(
                            "Replaced reservation {} of {} credits for session {}",
                            replaced.id, replaced.amount, session_id
                        );
                    }
                    _ => {
                        return Err(BookingError::Validation(format!(
                            "session {} already has {} transaction {}",
                            session_id, existing.status, existing.id
                        )));
                    }
                }
            }

            let tx = CreditTransaction {
                id: Uuid::new_v4(),
                from_user_id,
                to_user_id,
                amount,
                session_id: Some(session_id),
                status: TransactionStatus::Pending,
                created_at: Utc::now(),
                settled_at: None,
            };
            self.db.with_conn(|conn| insert_transaction(conn, &tx))?;

            info!(
                "Reserved {} credits {} -> {} for session {} ({})",
                amount, from_user_id, to_user_id, session_id, tx.id
            );
            Ok(tx.id)
        })
    }

    /// The pending or completed transfer attached to a session, if any.
    pub fn live_for_session(&self, session_id: Uuid) -> Result<Option<CreditTransaction>> {
        Ok(self.db.live_transaction_for_session(session_id)?)
    }

    /// pending -> completed. The only point at which balances change.
    pub fn commit(&self, id: Uuid) -> Result<CreditTransaction> {
        let parties = self.parties(id)?;
        self.locked(&parties, || {
            // Re-read: the transaction may have moved before the locks were taken
            let tx = self.get(id)?;

            if tx.status != TransactionStatus::Pending {
                return Err(transition(tx.status, "commit"));
            }
            self.ensure_covered(tx.from_user_id, tx.amount)?;

            let settled = self.settle(tx, TransactionStatus::Completed)?;
            info!(
                "Committed {} credits {} -> {} ({})",
                settled.amount, settled.from_user_id, settled.to_user_id, settled.id
            );
            Ok(settled)
        })
    }

    /// pending -> cancelled, no effect on balances. Cancelling an already
    /// cancelled transaction returns it unchanged.
    pub fn cancel(&self, id: Uuid) -> Result<CreditTransaction> {
        let parties = self.parties(id)?;
        self.locked(&parties, || {
            let tx = self.get(id)?;

            match tx.status {
                TransactionStatus::Cancelled => Ok(tx),
                TransactionStatus::Completed => Err(transition(tx.status, "cancel")),
                TransactionStatus::Pending => {
                    let settled = self.settle(tx, TransactionStatus::Cancelled)?;
                    info!("Cancelled reservation {}", settled.id);
                    Ok(settled)
                }
            }
        })
    }

    fn ensure_covered(&self, user_id: Uuid, amount: i64) -> Result<()> {
        if user_id == SYSTEM_ACCOUNT {
            return Ok(());
        }
        let balance = self.db.completed_balance(user_id)?;
        if balance < amount {
            return Err(BookingError::InsufficientBalance {
                user_id,
                balance,
                required: amount,
            });
        }
        Ok(())
    }

    fn settle(&self, tx: CreditTransaction, to: TransactionStatus) -> Result<CreditTransaction> {
        let now = Utc::now();
        let changed = self.db.with_conn(|conn| {
            update_transaction_status(conn, tx.id, TransactionStatus::Pending, to, now)
        })?;
        if changed == 0 {
            return Err(BookingError::Internal(format!(
                "transaction {} changed outside the ledger",
                tx.id
            )));
        }
        self.get(tx.id)
    }

    fn parties(&self, id: Uuid) -> Result<[Uuid; 2]> {
        let tx = self.get(id)?;
        Ok([tx.from_user_id, tx.to_user_id])
    }

    /// Run `f` holding the locks of `users`, taken in id order. Lock entries
    /// nobody else holds or waits on are removed afterwards, so the map only
    /// grows with the number of users in flight.
    fn locked<T>(&self, users: &[Uuid], f: impl FnOnce() -> Result<T>) -> Result<T> {
        let mut ids = users.to_vec();
        ids.sort();
        ids.dedup();
        let locks: Vec<Arc<Mutex<()>>> = ids
            .iter()
            .map(|id| self.locks.entry(*id).or_default().value().clone())
            .collect();

        let result = {
            let _guards = acquire(&locks);
            f()
        };

        drop(locks);
        for id in ids {
            self.locks.remove_if(&id, |_, lock| Arc::strong_count(lock) == 1);
        }
        result
    }
}

/// Lock in the given (sorted) order. The locks guard no data, so a poisoned
/// lock is still safe to take.
fn acquire(locks: &[Arc<Mutex<()>>]) -> Vec<MutexGuard<'_, ()>> {
    locks
        .iter()
        .map(|lock| lock.lock().unwrap_or_else(PoisonError::into_inner))
        .collect()
}

fn validate_amount(amount: i64) -> Result<()> {
    if amount <= 0 {
        return Err(BookingError::Validation(format!(
            "amount must be a positive number of credits, got {}",
            amount
        )));
    }
    Ok(())
}

fn transition(from: TransactionStatus, action: &'static str) -> BookingError {
    BookingError::InvalidStateTransition {
        entity: "transaction",
        from: from.as_str(),
        action,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    fn ledger() -> Arc<CreditLedger> {
        Arc::new(CreditLedger::new(Arc::new(Database::open_in_memory().unwrap())))
    }

    #[test]
    fn reservation_moves_nothing_until_commit() {
        let ledger = ledger();
        let (alice, bob) = (Uuid::new_v4(), Uuid::new_v4());
        ledger.grant(alice, 20).unwrap();

        let reservation = ledger.reserve(alice, bob, 20, Uuid::new_v4()).unwrap();
        assert_eq!(ledger.balance(alice).unwrap(), 20);
        assert_eq!(ledger.balance(bob).unwrap(), 0);

        let committed = ledger.commit(reservation).unwrap();
        assert_eq!(committed.status, TransactionStatus::Completed);
        assert!(committed.settled_at.is_some());
        assert_eq!(ledger.balance(alice).unwrap(), 0);
        assert_eq!(ledger.balance(bob).unwrap(), 20);
    }

    #[test]
    fn reserve_beyond_balance_creates_nothing() {
        let ledger = ledger();
        let (alice, bob) = (Uuid::new_v4(), Uuid::new_v4());
        ledger.grant(alice, 5).unwrap();

        let err = ledger.reserve(alice, bob, 20, Uuid::new_v4()).unwrap_err();
        assert!(matches!(
            err,
            BookingError::InsufficientBalance { balance: 5, required: 20, .. }
        ));
        assert_eq!(ledger.transactions_for(alice).unwrap().len(), 1);
        assert!(ledger.transactions_for(bob).unwrap().is_empty());
    }

    #[test]
    fn commit_rechecks_balance() {
        let ledger = ledger();
        let (alice, bob, carol) = (Uuid::new_v4(), Uuid::new_v4(), Uuid::new_v4());
        ledger.grant(alice, 20).unwrap();

        // Both pass reserve because pending transfers do not count
        let first = ledger.reserve(alice, bob, 15, Uuid::new_v4()).unwrap();
        let second = ledger.reserve(alice, carol, 15, Uuid::new_v4()).unwrap();

        ledger.commit(first).unwrap();
        let err = ledger.commit(second).unwrap_err();
        assert!(matches!(err, BookingError::InsufficientBalance { balance: 5, .. }));

        assert_eq!(ledger.balance(alice).unwrap(), 5);
        assert_eq!(ledger.get(second).unwrap().status, TransactionStatus::Pending);
        ledger.cancel(second).unwrap();
        assert_eq!(ledger.balance(carol).unwrap(), 0);
    }

    #[test]
    fn cancel_is_idempotent() {
        let ledger = ledger();
        let (alice, bob) = (Uuid::new_v4(), Uuid::new_v4());
        ledger.grant(alice, 10).unwrap();
        let reservation = ledger.reserve(alice, bob, 10, Uuid::new_v4()).unwrap();

        let once = ledger.cancel(reservation).unwrap();
        let twice = ledger.cancel(reservation).unwrap();
        assert_eq!(once, twice);
        assert_eq!(twice.status, TransactionStatus::Cancelled);
        assert_eq!(ledger.balance(alice).unwrap(), 10);
        assert_eq!(ledger.balance(bob).unwrap(), 0);
    }

    #[test]
    fn settled_transactions_do_not_move_again() {
        let ledger = ledger();
        let (alice, bob) = (Uuid::new_v4(), Uuid::new_v4());
        ledger.grant(alice, 10).unwrap();

        let committed = ledger.reserve(alice, bob, 4, Uuid::new_v4()).unwrap();
        ledger.commit(committed).unwrap();
        assert!(matches!(
            ledger.cancel(committed),
            Err(BookingError::InvalidStateTransition { from: "completed", .. })
        ));
        assert!(matches!(
            ledger.commit(committed),
            Err(BookingError::InvalidStateTransition { from: "completed", .. })
        ));

        let cancelled = ledger.reserve(alice, bob, 4, Uuid::new_v4()).unwrap();
        ledger.cancel(cancelled).unwrap();
        assert!(matches!(
            ledger.commit(cancelled),
            Err(BookingError::InvalidStateTransition { from: "cancelled", .. })
        ));
        assert_eq!(ledger.balance(alice).unwrap(), 6);
    }

    #[test]
    fn one_live_reservation_per_session() {
        let ledger = ledger();
        let (alice, bob) = (Uuid::new_v4(), Uuid::new_v4());
        let session = Uuid::new_v4();
        ledger.grant(alice, 10).unwrap();

        // Reserving again for the same terms hands back the same transfer
        let first = ledger.reserve(alice, bob, 5, session).unwrap();
        assert_eq!(ledger.reserve(alice, bob, 5, session).unwrap(), first);
        let pending = ledger
            .transactions_for(alice)
            .unwrap()
            .into_iter()
            .filter(|tx| tx.status == TransactionStatus::Pending)
            .count();
        assert_eq!(pending, 1);

        // New terms replace the pending transfer
        let second = ledger.reserve(alice, bob, 3, session).unwrap();
        assert_ne!(second, first);
        assert_eq!(ledger.get(first).unwrap().status, TransactionStatus::Cancelled);
        assert_eq!(ledger.live_for_session(session).unwrap().unwrap().id, second);

        // A completed transfer is never replaced
        ledger.commit(second).unwrap();
        assert!(matches!(
            ledger.reserve(alice, bob, 3, session),
            Err(BookingError::Validation(_))
        ));
        assert_eq!(ledger.balance(alice).unwrap(), 7);
    }

    #[test]
    fn cancelled_reservation_frees_the_session() {
        let ledger = ledger();
        let (alice, bob) = (Uuid::new_v4(), Uuid::new_v4());
        let session = Uuid::new_v4();
        ledger.grant(alice, 10).unwrap();

        let first = ledger.reserve(alice, bob, 5, session).unwrap();
        ledger.cancel(first).unwrap();
        assert!(ledger.live_for_session(session).unwrap().is_none());
        assert_ne!(ledger.reserve(alice, bob, 5, session).unwrap(), first);
    }

    #[test]
    fn rejects_bad_amounts_and_self_transfers() {
        let ledger = ledger();
        let alice = Uuid::new_v4();
        ledger.grant(alice, 10).unwrap();

        assert!(matches!(ledger.grant(alice, 0), Err(BookingError::Validation(_))));
        assert!(matches!(
            ledger.reserve(alice, Uuid::new_v4(), -3, Uuid::new_v4()),
            Err(BookingError::Validation(_))
        ));
        assert!(matches!(
            ledger.reserve(alice, alice, 1, Uuid::new_v4()),
            Err(BookingError::Validation(_))
        ));
        assert!(matches!(ledger.commit(Uuid::new_v4()), Err(BookingError::NotFound(_))));
    }

    #[test]
    fn concurrent_bookings_never_overdraw() {
        let ledger = ledger();
        let alice = Uuid::new_v4();
        ledger.grant(alice, 20).unwrap();

        let handles: Vec<_> = (0..8)
            .map(|_| {
                let ledger = ledger.clone();
                thread::spawn(move || {
                    let id = ledger.reserve(alice, Uuid::new_v4(), 5, Uuid::new_v4())?;
                    ledger.commit(id)
                })
            })
            .collect();

        let committed = handles
            .into_iter()
            .map(|h| h.join().unwrap())
            .filter(|result| result.is_ok())
            .count();

        assert_eq!(committed, 4);
        assert_eq!(ledger.balance(alice).unwrap(), 0);
        assert!(ledger.locks.is_empty());
    }

    #[test]
    fn lock_table_does_not_grow_with_users() {
        let ledger = ledger();
        for _ in 0..50 {
            let (alice, bob) = (Uuid::new_v4(), Uuid::new_v4());
            ledger.grant(alice, 3).unwrap();
            let id = ledger.reserve(alice, bob, 2, Uuid::new_v4()).unwrap();
            ledger.commit(id).unwrap();
            let _ = ledger.reserve(alice, bob, 5, Uuid::new_v4());
        }
        assert!(ledger.locks.is_empty());
    }

    #[test]
    fn balance_never_negative_over_mixed_sequences() {
        let ledger = ledger();
        let (alice, bob) = (Uuid::new_v4(), Uuid::new_v4());
        ledger.grant(alice, 12).unwrap();

        // Deterministic mix of reserve/commit/cancel with varying amounts
        let mut pending = Vec::new();
        for step in 0..40u32 {
            let amount = i64::from(step % 7) + 1;
            match step % 3 {
                0 | 1 => {
                    if let Ok(id) = ledger.reserve(alice, bob, amount, Uuid::new_v4()) {
                        pending.push(id);
                    }
                }
                _ => {
                    if let Some(id) = pending.pop() {
                        if step % 2 == 0 {
                            let _ = ledger.commit(id);
                        } else {
                            ledger.cancel(id).unwrap();
                        }
                    }
                }
            }
            assert!(ledger.balance(alice).unwrap() >= 0);
        }
        for id in pending {
            let _ = ledger.commit(id);
            assert!(ledger.balance(alice).unwrap() >= 0);
        }
        assert_eq!(ledger.balance(alice).unwrap() + ledger.balance(bob).unwrap(), 12);
    }
}
