//! CRDT primitives: the merge trait and the last-writer-wins register.

pub mod lww;
pub mod merge;

pub use lww::LwwRegister;
pub use merge::Merge;
