mod intent;
mod lease;
mod policy;
mod record;

pub use intent::*;
pub use lease::*;
pub use policy::*;
pub use record::*;
