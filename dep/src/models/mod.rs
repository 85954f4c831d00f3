pub mod instrument;
pub mod koaid;
pub mod observation;
pub mod program;
pub mod semester;
pub mod status;

pub use instrument::*;
pub use koaid::*;
pub use observation::*;
pub use program::*;
pub use semester::*;
pub use status::*;
