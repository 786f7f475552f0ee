pub mod duplex;
pub mod routing;
pub mod translator;

pub use duplex::{ConflictResolution, DuplexConfig, WriteMode};
pub use routing::{FeatureOverride, RoutingConfig};
pub use translator::TranslatorConfig;
