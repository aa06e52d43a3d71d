//! Domain model: identifiers, money, and ledger entities.

pub mod entity;
pub mod id;
pub mod money;

pub use entity::{Account, AccountMode, Expense, Payment, Person};
pub use id::{AccountId, DeviceId, EntityId};
pub use money::{Money, SplitMode};
