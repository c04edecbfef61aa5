use std::collections::HashMap;
use std::fs::read_to_string;
use std::path::Path;
use std::process::Command;

use serde::Deserialize;
use which::which_in;

use crate::Error;

/// Environment needed to run the vendor tools, loaded from a TOML file.
/// `env` is applied to every spawned command; `PATH` inside it is also
/// used to resolve command names.
#[derive(Debug, Clone, Deserialize)]
pub struct Toolchain {
    pub env: HashMap<String, String>,
}

impl Toolchain {
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self, Error> {
        let s = read_to_string(path)?;
        Ok(toml::from_str(&s)?)
    }

    pub fn command(&self, cmd: &str) -> Result<Command, Error> {
        let mut res = if let Some(path) = self.env.get("PATH") {
            Command::new(which_in(cmd, Some(path), "/")?)
        } else {
            Command::new(cmd)
        };
        res.envs(&self.env);
        Ok(res)
    }
}
