pub mod allocator;

pub use allocator::{Activation, ExpireOutcome, TokenService};
