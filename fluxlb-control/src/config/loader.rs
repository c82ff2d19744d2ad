use std::fs;
use std::path::Path;

use super::root::FluxConfig;
use super::validator;
use crate::error::{ControlError, Result};

pub fn load_from_path<P: AsRef<Path>>(p: P) -> Result<FluxConfig> {
    let path = p.as_ref();
    let txt = fs::read_to_string(path).map_err(|e| {
        ControlError::InvalidConfig(format!("failed to read '{}': {e}", path.display()))
    })?;
    let cfg: FluxConfig = toml::from_str(&txt)
        .map_err(|e| ControlError::InvalidConfig(format!("failed to parse config: {e}")))?;

    validator::validate(&cfg)?;

    Ok(cfg)
}
