use std::fmt;

/// Transaction identifier.
///
/// `NONE` is the id of globally visible data written outside any
/// transaction, `MAX` means "no stop" inside a [`TimeWindow`], and `ABORTED`
/// marks update records whose transaction rolled back.
#[derive(Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash, Debug, Default)]
pub struct TxnId(pub u64);

impl TxnId {
    /// Id carried by data that predates every running transaction.
    pub const NONE: TxnId = TxnId(0);
    /// Upper bound used for open-ended stop points.
    pub const MAX: TxnId = TxnId(u64::MAX - 1);
    /// Marker written into updates of rolled-back transactions.
    pub const ABORTED: TxnId = TxnId(u64::MAX);

    /// Returns true when the id marks an aborted update.
    pub const fn is_aborted(self) -> bool {
        self.0 == u64::MAX
    }
}

impl fmt::Display for TxnId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match *self {
            TxnId::ABORTED => f.write_str("aborted"),
            TxnId::MAX => f.write_str("max"),
            TxnId(raw) => write!(f, "{raw}"),
        }
    }
}

/// Commit/read timestamp supplied by the application.
#[derive(Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash, Debug, Default)]
pub struct Timestamp(pub u64);

impl Timestamp {
    /// Absent timestamp; compares as visible to every reader.
    pub const NONE: Timestamp = Timestamp(0);
    /// Open-ended upper bound.
    pub const MAX: Timestamp = Timestamp(u64::MAX);

    /// Returns true if no timestamp was assigned.
    pub const fn is_none(self) -> bool {
        self.0 == 0
    }
}

impl fmt::Display for Timestamp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match *self {
            Timestamp::MAX => f.write_str("max"),
            Timestamp(raw) => write!(f, "{raw}"),
        }
    }
}

/// One boundary of a validity interval.
#[derive(Copy, Clone, Eq, PartialEq, Hash, Debug)]
pub struct TimePoint {
    /// Transaction that produced the boundary.
    pub txn: TxnId,
    /// Commit timestamp of that transaction.
    pub ts: Timestamp,
    /// Durable timestamp (differs from `ts` for prepared transactions).
    pub durable_ts: Timestamp,
}

impl TimePoint {
    /// The start point of globally visible data.
    pub const ORIGIN: TimePoint = TimePoint {
        txn: TxnId::NONE,
        ts: Timestamp::NONE,
        durable_ts: Timestamp::NONE,
    };

    /// The stop point of data that has not been superseded.
    pub const OPEN: TimePoint = TimePoint {
        txn: TxnId::MAX,
        ts: Timestamp::MAX,
        durable_ts: Timestamp::NONE,
    };

    /// Builds a point whose durable timestamp equals its commit timestamp.
    pub const fn new(txn: TxnId, ts: Timestamp) -> Self {
        Self {
            txn,
            ts,
            durable_ts: ts,
        }
    }
}

/// Validity interval of a value: `[start, stop)` in (txn, timestamp) space.
#[derive(Copy, Clone, Eq, PartialEq, Hash, Debug)]
pub struct TimeWindow {
    /// Point at which the value became visible.
    pub start: TimePoint,
    /// Point at which the value stopped being visible.
    pub stop: TimePoint,
    /// Set when the start or stop belongs to a prepared, unresolved transaction.
    pub prepare: bool,
}

impl Default for TimeWindow {
    fn default() -> Self {
        Self {
            start: TimePoint::ORIGIN,
            stop: TimePoint::OPEN,
            prepare: false,
        }
    }
}

impl TimeWindow {
    /// Window of a value visible to everyone and never superseded.
    pub fn globally_visible() -> Self {
        Self::default()
    }

    /// Window starting at `start` with no stop.
    pub fn starting_at(start: TimePoint) -> Self {
        Self {
            start,
            ..Self::default()
        }
    }

    /// Returns true when a stop point was recorded.
    pub fn has_stop(&self) -> bool {
        self.stop.txn != TxnId::MAX || self.stop.ts != Timestamp::MAX
    }

    /// Returns true when the window carries nothing beyond the defaults.
    pub fn is_default(&self) -> bool {
        *self == Self::default()
    }
}

/// Aggregate of the time windows stored in a page or subtree.
///
/// Parents keep one per child address so that readers and the obsolete
/// sweep can reason about a subtree without reading it.
#[derive(Copy, Clone, Eq, PartialEq, Hash, Debug)]
pub struct TimeAggregate {
    /// Largest durable start timestamp.
    pub newest_start_durable_ts: Timestamp,
    /// Largest durable stop timestamp.
    pub newest_stop_durable_ts: Timestamp,
    /// Smallest start timestamp.
    pub oldest_start_ts: Timestamp,
    /// Largest start transaction id.
    pub newest_txn: TxnId,
    /// Largest stop timestamp (`MAX` when any value is still live).
    pub newest_stop_ts: Timestamp,
    /// Largest stop transaction id (`MAX` when any value is still live).
    pub newest_stop_txn: TxnId,
    /// Set when any contained window belongs to a prepared transaction.
    pub prepare: bool,
}

impl Default for TimeAggregate {
    fn default() -> Self {
        Self {
            newest_start_durable_ts: Timestamp::NONE,
            newest_stop_durable_ts: Timestamp::NONE,
            oldest_start_ts: Timestamp::MAX,
            newest_txn: TxnId::NONE,
            newest_stop_ts: Timestamp::NONE,
            newest_stop_txn: TxnId::NONE,
            prepare: false,
        }
    }
}

impl TimeAggregate {
    /// Folds a single window into the aggregate.
    pub fn update(&mut self, tw: &TimeWindow) {
        self.newest_start_durable_ts = self.newest_start_durable_ts.max(tw.start.durable_ts);
        self.newest_stop_durable_ts = self.newest_stop_durable_ts.max(tw.stop.durable_ts);
        self.oldest_start_ts = self.oldest_start_ts.min(tw.start.ts);
        self.newest_txn = self.newest_txn.max(tw.start.txn);
        self.newest_stop_ts = self.newest_stop_ts.max(tw.stop.ts);
        self.newest_stop_txn = self.newest_stop_txn.max(tw.stop.txn);
        self.prepare |= tw.prepare;
    }

    /// Folds another aggregate into this one.
    pub fn merge(&mut self, other: &TimeAggregate) {
        self.newest_start_durable_ts = self
            .newest_start_durable_ts
            .max(other.newest_start_durable_ts);
        self.newest_stop_durable_ts = self.newest_stop_durable_ts.max(other.newest_stop_durable_ts);
        self.oldest_start_ts = self.oldest_start_ts.min(other.oldest_start_ts);
        self.newest_txn = self.newest_txn.max(other.newest_txn);
        self.newest_stop_ts = self.newest_stop_ts.max(other.newest_stop_ts);
        self.newest_stop_txn = self.newest_stop_txn.max(other.newest_stop_txn);
        self.prepare |= other.prepare;
    }

    /// Returns true when every contained value carries a stop point.
    ///
    /// An empty aggregate also qualifies: it describes a page with no live rows.
    pub fn all_stopped(&self) -> bool {
        self.newest_stop_txn != TxnId::MAX && self.newest_stop_ts != Timestamp::MAX
    }
}
