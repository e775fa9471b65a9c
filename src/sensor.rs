mod device_identity;
mod payload;
mod reading;

pub use device_identity::*;
pub use payload::*;
pub use reading::*;
