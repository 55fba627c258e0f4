pub mod post;
pub mod scenarios;

pub use scenarios::Env;
