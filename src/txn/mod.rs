pub mod readers;
pub mod transaction;
pub mod xid;

pub use readers::{MAX_READER_SLOTS, ReaderSlot, ReaderSlots};
pub use transaction::{OLD_VERSION_THRESHOLD, Transaction};
pub use xid::{CommitOutcome, TxnState, XidContext, XidTable};
