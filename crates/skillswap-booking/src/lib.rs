//! Credit ledger and session booking workflow.

pub mod config;
pub mod error;
pub mod ledger;
pub mod retry;
pub mod service;
pub mod session;
pub mod sweeper;

pub use config::BookingConfig;
pub use error::BookingError;
pub use ledger::CreditLedger;
pub use service::BookingService;
pub use session::{Actor, NewSession, SessionAction};
