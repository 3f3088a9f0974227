//! Results of a fork-join, handed to the join step through the packet.

use crate::error::FiberError;
use crate::packet::Packet;

/// How one forked child finished.
#[derive(Debug)]
pub struct ChildOutcome {
    /// Position of the child in the fork request.
    pub index: usize,
    /// The child's packet as it stood when the child finished.
    pub packet: Packet,
    /// `Err` when the child failed or was cancelled.
    pub result: Result<(), FiberError>,
}

/// Every child outcome of the most recent fork-join, ordered by fork index.
///
/// The engine stores this in the parent packet under [`JoinResults::KEY`]
/// before running the join chain. Nothing is propagated automatically: the
/// join step decides what a child failure means for the parent.
///
/// ```
/// use makeright_core::{ChildOutcome, FiberError, JoinResults, Packet};
///
/// let results = JoinResults::new(vec![
///     ChildOutcome {
///         index: 1,
///         packet: Packet::new(),
///         result: Err(FiberError::step("b", "boom")),
///     },
///     ChildOutcome { index: 0, packet: Packet::new(), result: Ok(()) },
/// ]);
///
/// assert_eq!(results.outcomes()[0].index, 0);
/// assert_eq!(results.failures().count(), 1);
/// assert!(results.into_result().is_err());
/// ```
#[derive(Debug, Default)]
pub struct JoinResults {
    outcomes: Vec<ChildOutcome>,
}

impl JoinResults {
    /// Packet key the engine stores the results under.
    pub const KEY: &'static str = "makeright.join_results";

    /// Collects outcomes, sorting them by fork index.
    pub fn new(mut outcomes: Vec<ChildOutcome>) -> Self {
        outcomes.sort_by_key(|o| o.index);
        Self { outcomes }
    }

    /// Reads the results of the last fork-join from `packet`.
    pub fn from_packet(packet: &Packet) -> Option<&JoinResults> {
        packet.get::<JoinResults>(Self::KEY)
    }

    /// All outcomes in fork order.
    pub fn outcomes(&self) -> &[ChildOutcome] {
        &self.outcomes
    }

    /// Number of children.
    pub fn len(&self) -> usize {
        self.outcomes.len()
    }

    /// Returns `true` when the fork had no children.
    pub fn is_empty(&self) -> bool {
        self.outcomes.is_empty()
    }

    /// Children that finished with an error, in fork order.
    pub fn failures(&self) -> impl Iterator<Item = (usize, &FiberError)> {
        self.outcomes
            .iter()
            .filter_map(|o| o.result.as_ref().err().map(|e| (o.index, e)))
    }

    /// Children that finished normally, in fork order.
    pub fn successes(&self) -> impl Iterator<Item = &ChildOutcome> {
        self.outcomes.iter().filter(|o| o.result.is_ok())
    }

    /// The failure of the lowest-indexed failed child.
    pub fn first_failure(&self) -> Option<&FiberError> {
        self.failures().next().map(|(_, e)| e)
    }

    /// Returns `true` when no child failed.
    pub fn all_succeeded(&self) -> bool {
        self.first_failure().is_none()
    }

    /// `Err` carrying the first failure, for join steps that propagate.
    pub fn into_result(&self) -> Result<(), FiberError> {
        match self.first_failure() {
            Some(error) => Err(error.clone()),
            None => Ok(()),
        }
    }
}
