//! In-memory `LedgerStore` test double used by the concurrency/invariant
//! tests in `handlers.rs` and `pool.rs` (spec.md §8, "pure unit tests" and
//! "in-memory store for concurrency tests"). Grounded on
//! `original_source/internal/bonuses/storage/managers/ram/ram.go`, the Go
//! original's own RAM-backed manager used for the same purpose, here
//! unified behind the same `LedgerStore` trait the Postgres store
//! implements rather than kept as a second bespoke interface.

use std::sync::Mutex;

use async_trait::async_trait;
use chrono::Utc;
use rust_decimal::Decimal;

use crate::domain::{AddOrderOutcome, Balance, Order, OrderFilter, OrderStatus, OrderUpdate, Role, User, Withdrawal};
use crate::error::StoreError;
use crate::store::LedgerStore;

#[derive(Default)]
struct State {
    next_id: i64,
    users: Vec<User>,
    orders: Vec<Order>,
    bonuses: Vec<(i64, i64, Decimal)>, // (id, user_id, amount)
    withdrawals: Vec<Withdrawal>,
}

impl State {
    fn alloc_id(&mut self) -> i64 {
        self.next_id += 1;
        self.next_id
    }
}

pub struct MemoryStore {
    state: Mutex<State>,
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self { state: Mutex::new(State::default()) }
    }
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl LedgerStore for MemoryStore {
    async fn add_user(&self, login: &str, password_hash: &str, role: Role) -> Result<i64, StoreError> {
        let mut state = self.state.lock().unwrap();
        if state.users.iter().any(|u| u.login == login) {
            return Err(StoreError::AlreadyExists);
        }
        let id = state.alloc_id();
        state.users.push(User { id, login: login.to_string(), password_hash: password_hash.to_string(), role });
        Ok(id)
    }

    async fn get_user_by_login(&self, login: &str) -> Result<Option<User>, StoreError> {
        let state = self.state.lock().unwrap();
        Ok(state.users.iter().find(|u| u.login == login).cloned())
    }

    async fn get_user_by_id(&self, id: i64) -> Result<Option<User>, StoreError> {
        let state = self.state.lock().unwrap();
        Ok(state.users.iter().find(|u| u.id == id).cloned())
    }

    async fn add_order(&self, number: &str, user_id: i64) -> Result<AddOrderOutcome, StoreError> {
        let mut state = self.state.lock().unwrap();

        if let Some(existing) = state.orders.iter().find(|o| o.number == number) {
            return Ok(if existing.user_id == user_id {
                AddOrderOutcome::AlreadyByThisUser(existing.id)
            } else {
                AddOrderOutcome::AlreadyByOtherUser(existing.id)
            });
        }

        let bonus_id = state.alloc_id();
        state.bonuses.push((bonus_id, user_id, Decimal::ZERO));

        let order_id = state.alloc_id();
        state.orders.push(Order {
            id: order_id,
            number: number.to_string(),
            user_id,
            status: OrderStatus::New,
            bonus_entry_id: bonus_id,
            accrual: None,
            uploaded_at: Utc::now(),
        });

        Ok(AddOrderOutcome::Created(order_id))
    }

    async fn update_order(&self, update: OrderUpdate) -> Result<(), StoreError> {
        let mut state = self.state.lock().unwrap();

        let bonus_id = match state.orders.iter().find(|o| o.id == update.id) {
            Some(order) => {
                if update.status.as_id() <= order.status.as_id() {
                    return Ok(());
                }
                order.bonus_entry_id
            }
            None => return Ok(()),
        };

        if let Some(amount) = update.accrual {
            if amount > Decimal::ZERO {
                if let Some(entry) = state.bonuses.iter_mut().find(|b| b.0 == bonus_id && b.2 == Decimal::ZERO) {
                    entry.2 = amount;
                }
            }
        }

        if let Some(order) = state.orders.iter_mut().find(|o| o.id == update.id) {
            order.status = update.status;
            let credited = state.bonuses.iter().find(|b| b.0 == bonus_id).map(|b| b.2).unwrap_or(Decimal::ZERO);
            order.accrual = if credited > Decimal::ZERO { Some(credited) } else { None };
        }

        Ok(())
    }

    async fn get_orders(&self, filter: OrderFilter) -> Result<Vec<Order>, StoreError> {
        let state = self.state.lock().unwrap();
        let matches = |order: &&Order| match &filter {
            OrderFilter::ByUser(user_id) => order.user_id == *user_id,
            OrderFilter::ByNumber(number) => &order.number == number,
            OrderFilter::NonTerminal => order.status.as_id() <= OrderStatus::Invalid.as_id(),
        };
        Ok(state.orders.iter().filter(matches).cloned().collect())
    }

    async fn get_balance(&self, user_id: i64) -> Result<Balance, StoreError> {
        let state = self.state.lock().unwrap();
        let current: Decimal = state.bonuses.iter().filter(|b| b.1 == user_id).map(|b| b.2).sum();
        let withdrawn: Decimal =
            state.bonuses.iter().filter(|b| b.1 == user_id && b.2 < Decimal::ZERO).map(|b| -b.2).sum();
        Ok(Balance { current, withdrawn })
    }

    async fn withdraw_bonuses(&self, user_id: i64, order_number: &str, sum: Decimal) -> Result<i64, StoreError> {
        let mut state = self.state.lock().unwrap();

        let current: Decimal = state.bonuses.iter().filter(|b| b.1 == user_id).map(|b| b.2).sum();
        if current < sum {
            return Err(StoreError::InsufficientFunds);
        }

        let bonus_id = state.alloc_id();
        state.bonuses.push((bonus_id, user_id, -sum));

        let withdrawal_id = state.alloc_id();
        state.withdrawals.push(Withdrawal {
            id: withdrawal_id,
            user_id,
            order_number: order_number.to_string(),
            bonus_entry_id: bonus_id,
            sum,
            processed_at: Utc::now(),
        });

        Ok(withdrawal_id)
    }

    async fn get_withdrawals(&self, user_id: i64) -> Result<Vec<Withdrawal>, StoreError> {
        let state = self.state.lock().unwrap();
        Ok(state.withdrawals.iter().filter(|w| w.user_id == user_id).cloned().collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn resubmitting_the_same_order_by_the_same_user_is_reported_distinctly() {
        let store = MemoryStore::new();
        let first = store.add_order("79927398713", 1).await.unwrap();
        let second = store.add_order("79927398713", 1).await.unwrap();
        assert!(matches!(first, AddOrderOutcome::Created(_)));
        assert!(matches!(second, AddOrderOutcome::AlreadyByThisUser(_)));
    }

    #[tokio::test]
    async fn resubmitting_by_a_different_user_is_a_conflict() {
        let store = MemoryStore::new();
        store.add_order("79927398713", 1).await.unwrap();
        let second = store.add_order("79927398713", 2).await.unwrap();
        assert!(matches!(second, AddOrderOutcome::AlreadyByOtherUser(_)));
    }

    #[tokio::test]
    async fn withdraw_fails_when_balance_is_insufficient() {
        let store = MemoryStore::new();
        store.add_user("alice", "hash", Role::User).await.unwrap();
        let err = store.withdraw_bonuses(1, "79927398713", Decimal::new(1000, 2)).await.unwrap_err();
        assert!(matches!(err, StoreError::InsufficientFunds));
    }

    #[tokio::test]
    async fn balance_never_goes_negative_across_concurrent_withdrawals() {
        use std::sync::Arc;

        let store = Arc::new(MemoryStore::new());
        let AddOrderOutcome::Created(order_id) = store.add_order("79927398713", 1).await.unwrap() else {
            panic!("expected a freshly created order");
        };
        store
            .update_order(OrderUpdate { id: order_id, status: OrderStatus::Processed, accrual: Some(Decimal::new(10000, 2)) })
            .await
            .unwrap();

        let mut handles = Vec::new();
        for _ in 0..20 {
            let store = store.clone();
            handles.push(tokio::spawn(async move { store.withdraw_bonuses(1, "79927398713", Decimal::new(1000, 2)).await }));
        }

        let mut successes = 0;
        for handle in handles {
            if handle.await.unwrap().is_ok() {
                successes += 1;
            }
        }

        assert_eq!(successes, 10);
        let balance = store.get_balance(1).await.unwrap();
        assert_eq!(balance.current, Decimal::ZERO);
    }

    #[tokio::test]
    async fn terminal_order_status_never_regresses() {
        let store = MemoryStore::new();
        let AddOrderOutcome::Created(order_id) = store.add_order("79927398713", 1).await.unwrap() else {
            panic!("expected a freshly created order");
        };
        store.update_order(OrderUpdate { id: order_id, status: OrderStatus::Invalid, accrual: None }).await.unwrap();
        store.update_order(OrderUpdate { id: order_id, status: OrderStatus::Processing, accrual: None }).await.unwrap();

        let orders = store.get_orders(OrderFilter::ByUser(1)).await.unwrap();
        assert_eq!(orders[0].status, OrderStatus::Invalid);
    }
}
