mod settings;

pub use settings::{DriverKind, Settings, TransportKind};
