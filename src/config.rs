// Copyright 2019-2020 Benjamin Fry <benjaminfry@me.com>
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};

use nix::unistd::{geteuid, User};
use serde::{Deserialize, Serialize};

use crate::Error;

pub const DEFAULT_CAPACITY: usize = 32767;
pub const DEFAULT_BUCKETS: usize = 32;
pub const DEFAULT_APP_DIR: &str = "app-data";

/// Supervisor configuration, read from a JSON file. Every field has a default.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct Config {
    /// maximum number of live runners
    pub capacity: usize,
    /// run ids cycle through `1..=max_run_id`
    pub max_run_id: u32,
    /// buckets of each runner index, a power of two
    pub buckets: usize,
    /// directory of application homes, relative to the user's home directory
    pub app_dir: PathBuf,
    /// absolute application home, replaces `app_dir` when set
    pub home: Option<PathBuf>,
    /// argv templates by content type
    pub launch: HashMap<String, Vec<String>>,
}

impl Default for Config {
    fn default() -> Self {
        let mut launch = HashMap::new();
        launch.insert(
            "application/x-executable".to_string(),
            vec!["{path}/{content}".to_string()],
        );
        launch.insert(
            "text/x-shellscript".to_string(),
            vec!["/bin/sh".to_string(), "{path}/{content}".to_string()],
        );

        Self {
            capacity: DEFAULT_CAPACITY,
            max_run_id: DEFAULT_CAPACITY as u32,
            buckets: DEFAULT_BUCKETS,
            app_dir: PathBuf::from(DEFAULT_APP_DIR),
            home: None,
            launch,
        }
    }
}

impl Config {
    pub fn from_json(json: &str) -> Result<Self, Error> {
        let config: Self = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_file(path: &Path) -> Result<Self, Error> {
        let json = fs::read_to_string(path)?;
        Self::from_json(&json)
    }

    pub fn validate(&self) -> Result<(), Error> {
        if self.capacity == 0 || self.capacity >= u32::MAX as usize {
            return Err(Error::invalid(format!("bad capacity: {}", self.capacity)));
        }
        if (self.max_run_id as usize) < self.capacity {
            return Err(Error::invalid("max_run_id must be at least the capacity"));
        }
        if !self.buckets.is_power_of_two() {
            return Err(Error::invalid("buckets must be a power of two"));
        }
        if let Some(home) = &self.home {
            if !home.is_absolute() {
                return Err(Error::invalid(format!(
                    "home must be absolute: {}",
                    home.display()
                )));
            }
        }
        if let Some((content_type, _)) = self.launch.iter().find(|(_, argv)| argv.is_empty()) {
            return Err(Error::invalid(format!(
                "empty launch template for {}",
                content_type
            )));
        }

        Ok(())
    }

    /// The application home, `app_dir` under the effective user's home unless `home` is set
    pub fn app_home(&self) -> Result<PathBuf, Error> {
        if let Some(home) = &self.home {
            return Ok(home.clone());
        }

        let uid = geteuid();
        let user = User::from_uid(uid)?
            .ok_or_else(|| Error::from(format!("no password entry for uid={}", uid)))?;
        Ok(user.dir.join(&self.app_dir))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;

    #[test]
    fn test_defaults() {
        let config = Config::from_json("{}").unwrap();
        assert_eq!(config, Config::default());
        assert_eq!(config.capacity, 32767);
        assert_eq!(config.buckets, 32);
        assert_eq!(
            config.launch["text/x-shellscript"],
            vec!["/bin/sh".to_string(), "{path}/{content}".to_string()]
        );
    }

    #[test]
    fn test_partial() {
        let config =
            Config::from_json(r#"{"capacity": 4, "max_run_id": 9, "home": "/var/apps"}"#).unwrap();
        assert_eq!(config.capacity, 4);
        assert_eq!(config.max_run_id, 9);
        assert_eq!(config.app_home().unwrap(), PathBuf::from("/var/apps"));
    }

    #[test]
    fn test_invalid() {
        for json in &[
            r#"{"buckets": 12}"#,
            r#"{"capacity": 0}"#,
            r#"{"capacity": 10, "max_run_id": 5}"#,
            r#"{"home": "relative"}"#,
            r#"{"launch": {"text/html": []}}"#,
        ] {
            let err = Config::from_json(json).unwrap_err();
            assert!(
                matches!(err.kind(), ErrorKind::InvalidArgument(_)),
                "{}: {:?}",
                json,
                err
            );
        }

        assert!(matches!(
            Config::from_json(r#"{"capacty": 3}"#).unwrap_err().kind(),
            ErrorKind::JsonError(_)
        ));
    }
}
