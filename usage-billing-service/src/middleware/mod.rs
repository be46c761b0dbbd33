pub mod tenant;

pub use tenant::bearer_token;
