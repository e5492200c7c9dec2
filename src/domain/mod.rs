pub mod account;
pub mod order;
pub mod state;

pub use account::*;
pub use order::*;
pub use state::*;
