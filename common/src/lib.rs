mod constants;
mod player;
mod protocol;
mod score;
mod snapshot;
mod variant;

pub use constants::*;
pub use player::*;
pub use protocol::*;
pub use score::*;
pub use snapshot::*;
pub use variant::*;
