#![cfg_attr(feature = "fail-on-warnings", deny(warnings))]
#![warn(clippy::all, clippy::pedantic, clippy::nursery, clippy::cargo)]
#![allow(clippy::multiple_crate_versions)]

#[cfg(feature = "std")]
pub mod clock;
#[cfg(feature = "std")]
pub mod standard;

#[allow(unused)]
macro_rules! impl_time {
    ($module:ident $(,)?) => {
        pub use $module::{instant_now, now, unix_secs};
    };
}

#[cfg(feature = "std")]
impl_time!(standard);
