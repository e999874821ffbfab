pub mod errors;
pub mod store;
pub mod trial;
pub mod value;

pub use errors::*;
pub use store::*;
pub use trial::*;
pub use value::*;
