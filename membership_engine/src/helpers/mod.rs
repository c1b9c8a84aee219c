mod membership_period;

pub use membership_period::extend_membership;
