//! Wrappers for feeding system resources into a [`StateMachine`](super::StateMachine)
//! deterministically, as input rather than as something the machine reaches out for.

pub mod system;
