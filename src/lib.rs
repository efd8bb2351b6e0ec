#![forbid(unsafe_code)]
#![warn(clippy::all, clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::missing_errors_doc)]

pub mod error;
pub mod leadership;
pub mod lease;
pub mod time;

pub mod test_utils;

pub use error::{Error, Result};
pub use leadership::{Manager, ManagerConfig, Token, Tuning};
pub use lease::{Client, ClientError, LeaseInfo, Leases};
pub use time::{Clock, SystemClock, Timestamp};
