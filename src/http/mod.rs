mod client;

pub use client::{default_parse_flags, FlagsFetcher, FlagsRequest, HttpFlagsFetcher};
