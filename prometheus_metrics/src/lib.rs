pub use crate::{helpers::encode_registry, metrics::Metrics};

mod helpers;
mod metrics;
