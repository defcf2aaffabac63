//! Reproduction tokens.
//!
//! A token is a JSON document naming a configuration kind and its parameters,
//! nesting the owning keyspace for tables. It is URL-escaped so it survives
//! being pasted into a shell as an environment variable.

use super::{ConfigKind, Configuration, Params};
use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};

/// Environment variable that forces a configuration to run first
pub const REPLAY_ENV_VAR: &str = "CQL_CQLSH_TEST";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReproductionToken {
    pub classname: ConfigKind,
    pub config_params: Params,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub keyspace_configuration: Option<Box<ReproductionToken>>,
}

/// Capture everything needed to rebuild `config`
pub fn serialize(config: &Configuration) -> ReproductionToken {
    ReproductionToken {
        classname: config.kind(),
        config_params: config.params().clone(),
        name: config.display_name().map(str::to_string),
        keyspace_configuration: config.keyspace_config().map(|ks| Box::new(serialize(ks))),
    }
}

/// Rebuild a configuration. The result has an empty statement log.
pub fn deserialize(token: &ReproductionToken) -> Result<Configuration> {
    let config = match (token.classname, &token.keyspace_configuration) {
        (ConfigKind::Keyspace, None) => Configuration::keyspace(token.config_params.clone())?,
        (ConfigKind::Keyspace, Some(_)) => {
            return Err(Error::Token("a keyspace cannot have an owner".into()));
        }
        (kind, Some(owner)) => {
            let keyspace = deserialize(owner)?;
            Configuration::table(kind, keyspace, token.config_params.clone())?
        }
        (kind, None) => {
            return Err(Error::Token(format!("{kind} is missing its keyspace configuration")));
        }
    };
    Ok(match &token.name {
        Some(name) => config.with_name(name.clone()),
        None => config,
    })
}

pub fn to_json(config: &Configuration) -> Result<String> {
    serde_json::to_string(&serialize(config)).map_err(|e| Error::Token(e.to_string()))
}

pub fn from_json(json: &str) -> Result<Configuration> {
    let token: ReproductionToken =
        serde_json::from_str(json).map_err(|e| Error::Token(e.to_string()))?;
    deserialize(&token)
}

/// URL-escaped JSON suitable for an environment variable
pub fn encode(config: &Configuration) -> Result<String> {
    Ok(urlencoding::encode(&to_json(config)?).into_owned())
}

pub fn decode(escaped: &str) -> Result<Configuration> {
    let json = urlencoding::decode(escaped.trim()).map_err(|e| Error::Token(e.to_string()))?;
    from_json(&json)
}

/// The shell command a user runs to force this configuration first
pub fn replay_instruction(config: &Configuration) -> Result<String> {
    Ok(format!(
        "to recreate this configuration, run this before re-running the sweep: export {REPLAY_ENV_VAR}=\"{}\"",
        encode(config)?
    ))
}
