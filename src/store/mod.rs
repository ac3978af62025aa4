pub mod oid;
pub mod version;

pub use oid::{Oid, OidTable, SnapshotView, OID_EXTENT};
pub use version::Version;
