//! The ledger store contract (spec.md §4.B): transactional persistence of
//! users, orders, bonus entries and withdrawals, with the invariants in
//! spec.md §3 (L1 non-negative balance, L2 append-only/placeholder update).
//!
//! A `#[async_trait] trait` so the Postgres-backed implementation
//! (`store_postgres`) and an in-memory test double (`store_memory`) are
//! interchangeable, matching the design note on "users manager"/"bonuses
//! manager" abstractions mapping to polymorphic capability sets — itself
//! grounded on `original_source/internal/bonuses/storage/managers/ram/ram.go`
//! existing alongside the Postgres manager in the original.

use async_trait::async_trait;
use rust_decimal::Decimal;

use crate::domain::{AddOrderOutcome, Balance, Order, OrderFilter, OrderUpdate, Role, User, Withdrawal};
use crate::error::StoreError;

#[async_trait]
pub trait LedgerStore: Send + Sync {
    async fn add_user(&self, login: &str, password_hash: &str, role: Role) -> Result<i64, StoreError>;
    async fn get_user_by_login(&self, login: &str) -> Result<Option<User>, StoreError>;
    async fn get_user_by_id(&self, id: i64) -> Result<Option<User>, StoreError>;

    async fn add_order(&self, number: &str, user_id: i64) -> Result<AddOrderOutcome, StoreError>;
    async fn update_order(&self, update: OrderUpdate) -> Result<(), StoreError>;
    async fn get_orders(&self, filter: OrderFilter) -> Result<Vec<Order>, StoreError>;

    async fn get_balance(&self, user_id: i64) -> Result<Balance, StoreError>;
    async fn withdraw_bonuses(&self, user_id: i64, order_number: &str, sum: Decimal) -> Result<i64, StoreError>;
    async fn get_withdrawals(&self, user_id: i64) -> Result<Vec<Withdrawal>, StoreError>;
}
