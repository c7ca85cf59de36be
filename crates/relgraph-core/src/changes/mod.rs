//! Change records, the pending-change ledger and change notifications

pub mod change;
pub mod ledger;
pub mod notify;

pub use change::{sequence_splice, Change, ChangeKind, ChangeTarget, SequenceSplice};
pub use ledger::{ChangeLedger, LedgerSnapshot};
pub use notify::{NotificationHub, Topic};
