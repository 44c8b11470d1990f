//! Core entities shared by the ledger store, the accrual controller and the
//! HTTP handlers: users, orders, bonus ledger entries, withdrawals.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    User,
    Admin,
}

impl Role {
    pub fn as_id(self) -> i32 {
        match self {
            Role::User => 1,
            Role::Admin => 2,
        }
    }

    pub fn from_id(id: i32) -> Option<Self> {
        match id {
            1 => Some(Role::User),
            2 => Some(Role::Admin),
            _ => None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct User {
    pub id: i64,
    pub login: String,
    pub password_hash: String,
    pub role: Role,
}

/// Order status. The discriminants match the `statuses` table seeded by
/// the migrations (1=NEW .. 4=PROCESSED) so `status_id <= INVALID` style
/// filters translate directly into integer comparisons.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
#[repr(i32)]
pub enum OrderStatus {
    New = 1,
    Processing = 2,
    Invalid = 3,
    Processed = 4,
}

impl OrderStatus {
    pub fn as_id(self) -> i32 {
        self as i32
    }

    pub fn from_id(id: i32) -> Option<Self> {
        match id {
            1 => Some(OrderStatus::New),
            2 => Some(OrderStatus::Processing),
            3 => Some(OrderStatus::Invalid),
            4 => Some(OrderStatus::Processed),
            _ => None,
        }
    }

    pub fn from_accrual_str(s: &str) -> Option<Self> {
        match s {
            "REGISTERED" | "PROCESSING" => Some(OrderStatus::Processing),
            "INVALID" => Some(OrderStatus::Invalid),
            "PROCESSED" => Some(OrderStatus::Processed),
            _ => None,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            OrderStatus::New => "NEW",
            OrderStatus::Processing => "PROCESSING",
            OrderStatus::Invalid => "INVALID",
            OrderStatus::Processed => "PROCESSED",
        }
    }

    /// Terminal statuses never transition further (spec.md §3, §4.D).
    pub fn is_terminal(self) -> bool {
        matches!(self, OrderStatus::Invalid | OrderStatus::Processed)
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct Order {
    pub id: i64,
    pub number: String,
    pub user_id: i64,
    pub status: OrderStatus,
    pub bonus_entry_id: i64,
    /// Amount credited to the reserved bonus entry, if any (0 until PROCESSED).
    pub accrual: Option<Decimal>,
    pub uploaded_at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct BonusEntry {
    pub id: i64,
    pub user_id: i64,
    pub amount: Decimal,
}

#[derive(Debug, Clone)]
pub struct Withdrawal {
    pub id: i64,
    pub user_id: i64,
    pub order_number: String,
    pub bonus_entry_id: i64,
    pub sum: Decimal,
    pub processed_at: DateTime<Utc>,
}

/// Derived view over a user's bonus ledger (spec.md §3 "Derived views").
#[derive(Debug, Clone, Copy, PartialEq, Deserialize, Serialize)]
pub struct Balance {
    pub current: Decimal,
    pub withdrawn: Decimal,
}

/// Outcome of attempting to insert a new order (spec.md §4.B `AddOrder`).
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AddOrderOutcome {
    Created(i64),
    AlreadyByThisUser(i64),
    AlreadyByOtherUser(i64),
}

/// Filter used by `GetOrders` (spec.md §4.B). `NonTerminal` is the shape the
/// accrual poller uses ("status_id <= INVALID", i.e. NEW, PROCESSING or
/// INVALID — see spec.md §4.D and the open-question note in SPEC_FULL.md §9.3).
#[derive(Debug, Clone)]
pub enum OrderFilter {
    ByUser(i64),
    ByNumber(String),
    NonTerminal,
}

/// What the accrual controller writes back through `UpdateOrder`.
#[derive(Debug, Clone)]
pub struct OrderUpdate {
    pub id: i64,
    pub status: OrderStatus,
    pub accrual: Option<Decimal>,
}
