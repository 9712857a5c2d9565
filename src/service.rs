//! The `service` module implements a trait for background services that own
//! one or more threads and are torn down by joining them.

use std::thread::Result;

pub trait Service {
    type JoinReturnType;

    fn join(self) -> Result<Self::JoinReturnType>;
}
