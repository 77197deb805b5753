pub mod money;
pub mod transaction;

pub use money::{Money, MoneyError};
pub use transaction::CanonicalTransaction;
