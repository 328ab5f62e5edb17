use std::{
	ops::Add,
	sync::OnceLock,
	time::{Duration, Instant},
};

static EPOCH: OnceLock<Instant> = OnceLock::new();

/// A point on the daemon's monotonic millisecond clock.
///
/// The counter wraps around after roughly 49 days, so timestamps must only be compared
/// through [`Timestamp::before`] and [`Timestamp::after`]. Both are defined by signed
/// subtraction and stay correct as long as the two stamps are less than half the counter
/// range (about 24 days) apart.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Timestamp(u32);

impl Timestamp {
	pub fn now() -> Self {
		let elapsed = EPOCH.get_or_init(Instant::now).elapsed();
		// Truncation is the wrapping behaviour we want here
		#[allow(clippy::cast_possible_truncation)]
		Self(elapsed.as_millis() as u32)
	}

	pub const fn from_millis(millis: u32) -> Self {
		Self(millis)
	}

	pub const fn as_millis(self) -> u32 {
		self.0
	}

	#[allow(clippy::cast_possible_wrap)]
	const fn distance(self, other: Self) -> i32 {
		self.0.wrapping_sub(other.0) as i32
	}

	/// `self` happened strictly before `other`
	pub const fn before(self, other: Self) -> bool {
		self.distance(other) < 0
	}

	/// `self` happens strictly after `other`
	pub const fn after(self, other: Self) -> bool {
		self.distance(other) > 0
	}

	pub const fn before_or_at(self, other: Self) -> bool {
		!self.after(other)
	}

	/// Time left from `self` until `later`, zero if `later` is already due
	pub fn until(self, later: Self) -> Duration {
		if later.after(self) {
			Duration::from_millis(u64::from(later.0.wrapping_sub(self.0)))
		} else {
			Duration::ZERO
		}
	}

	/// The earlier of two timestamps
	#[must_use]
	pub const fn min(self, other: Self) -> Self {
		if other.before(self) {
			other
		} else {
			self
		}
	}
}

impl Add<Duration> for Timestamp {
	type Output = Self;

	fn add(self, rhs: Duration) -> Self::Output {
		// Delays larger than the comparison window would break ordering anyway
		let millis = rhs.as_millis().min(u128::from(i32::MAX as u32));
		#[allow(clippy::cast_possible_truncation)]
		Self(self.0.wrapping_add(millis as u32))
	}
}
