use anyhow::Result;
use prometheus::{Encoder as _, Registry, TextEncoder};

/// Renders every metric in `registry` in the Prometheus text exposition format.
pub fn encode_registry(registry: &Registry) -> Result<String> {
    let mut buffer = vec![];
    TextEncoder::new().encode(&registry.gather(), &mut buffer)?;
    Ok(String::from_utf8(buffer)?)
}
