use std::fmt;

use serde::{Deserialize, Serialize};

/// An inclusive range of sequence numbers, `[start, end]`.
///
/// Sequence numbers start at 1, so a range never includes 0.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SequenceRange {
	start: u64,
	end: u64,
}

impl SequenceRange {
	pub fn new(start: u64, end: u64) -> Option<Self> {
		(start >= 1 && start <= end).then_some(Self { start, end })
	}

	/// Range of sequences missing between `expected` and an observed `head`.
	///
	/// Returns `None` when nothing is missing, i.e. `head <= expected`.
	pub fn missing_before(expected: u64, head: u64) -> Option<Self> {
		if head <= expected {
			return None;
		}

		Self::new(expected, head - 1)
	}

	pub const fn start(&self) -> u64 {
		self.start
	}

	pub const fn end(&self) -> u64 {
		self.end
	}

	/// Number of sequences covered, never zero.
	pub const fn len(&self) -> u64 {
		self.end - self.start + 1
	}

	pub const fn contains(&self, sequence: u64) -> bool {
		self.start <= sequence && sequence <= self.end
	}

	pub const fn overlaps(&self, other: &Self) -> bool {
		self.start <= other.end && other.start <= self.end
	}
}

impl fmt::Display for SequenceRange {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		write!(f, "[{}, {}]", self.start, self.end)
	}
}
