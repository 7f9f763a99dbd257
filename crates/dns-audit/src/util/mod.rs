pub mod names;
pub mod net;
