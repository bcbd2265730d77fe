use std::fmt;

/// Global identifier of a vertex or edge. Allocated monotonically and never
/// recycled.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Gid(u64);

impl Gid {
    pub const fn from_u64(value: u64) -> Self {
        Self(value)
    }

    pub const fn as_u64(self) -> u64 {
        self.0
    }
}

impl fmt::Display for Gid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct LabelId(pub u32);

#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct PropertyId(pub u32);

#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct EdgeTypeId(pub u32);

/// Which state of an object a read observes.
///
/// `Old` is the state at the start of the current command, `New` also
/// includes the effects of the current command.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum View {
    Old,
    New,
}

/// First commit timestamp handed out by a fresh storage instance.
pub const INITIAL_TIMESTAMP: u64 = 0;

/// First transaction id. The timestamp space is split in half: loaded values
/// below this constant are commit timestamps, values at or above it are ids
/// of transactions that have not committed yet.
pub const TRANSACTION_INITIAL_ID: u64 = 1 << 63;

/// Returns `true` when a loaded timestamp denotes a committed transaction.
pub const fn is_commit_timestamp(ts: u64) -> bool {
    ts < TRANSACTION_INITIAL_ID
}
