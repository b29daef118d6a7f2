mod database;
mod epoch_store;
mod state_machine;
mod txn_log;

pub use database::*;
pub use epoch_store::*;
pub use state_machine::*;
pub use txn_log::*;
