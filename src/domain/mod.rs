pub mod order;
pub mod policy;
pub mod position;

pub use order::*;
pub use policy::*;
pub use position::*;
