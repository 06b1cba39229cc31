//! Environment variable lookup with typed parsing.
//!
//! Variables are read through a lookup function so configuration can be loaded from a
//! map in tests instead of mutating the process environment.

use std::fmt::Display;
use std::str::FromStr;
use std::time::Duration;

use crate::{Error, Result};

pub const ENV_PREFIX: &str = "RAMPART_";

pub(crate) struct EnvSource<F> {
    lookup: F,
}

impl<F> EnvSource<F>
where
    F: Fn(&str) -> Option<String>,
{
    pub(crate) fn new(lookup: F) -> Self {
        Self { lookup }
    }

    fn env_key(key: &str) -> String {
        format!("{}{}", ENV_PREFIX, key)
    }

    pub(crate) fn string(&self, key: &str) -> Option<String> {
        (self.lookup)(&Self::env_key(key))
            .map(|v| v.trim().to_string())
            .filter(|v| !v.is_empty())
    }

    pub(crate) fn parse<T>(&self, key: &str) -> Result<Option<T>>
    where
        T: FromStr,
        T::Err: Display,
    {
        self.string(key)
            .map(|raw| {
                raw.parse::<T>().map_err(|e| {
                    Error::Config(format!(
                        "Invalid value for {}: {} ({})",
                        Self::env_key(key),
                        raw,
                        e
                    ))
                })
            })
            .transpose()
    }

    pub(crate) fn bool(&self, key: &str) -> Result<Option<bool>> {
        self.string(key)
            .map(|raw| match raw.to_ascii_lowercase().as_str() {
                "1" | "true" | "yes" | "on" => Ok(true),
                "0" | "false" | "no" | "off" => Ok(false),
                _ => Err(Error::Config(format!(
                    "Invalid value for {}: {} (expected a boolean)",
                    Self::env_key(key),
                    raw
                ))),
            })
            .transpose()
    }

    pub(crate) fn millis(&self, key: &str) -> Result<Option<Duration>> {
        Ok(self.parse::<u64>(key)?.map(Duration::from_millis))
    }

    pub(crate) fn secs(&self, key: &str) -> Result<Option<Duration>> {
        Ok(self.parse::<u64>(key)?.map(Duration::from_secs))
    }
}
